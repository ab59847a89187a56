//! # libvolume: CSI volume claim coordination for RK8s
//!
//! `libvolume` decides which workload instances may claim a
//! [Container Storage Interface][csi] volume, enforces access-mode and
//! topology constraints, drives the attach/detach sequence against storage
//! plugins and reclaims abandoned claims.  Plugin RPCs travel over QUIC (via
//! [`quinn`]) instead of gRPC.  It follows the RK8s conventions (Tokio async
//! runtime, `tracing` for observability, `thiserror` for structured errors).
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: `Volume`, `Claim`, `Plugin`, capabilities, requests. |
//! | [`error`] | [`VolumeError`] and the plugin-side [`CsiError`]. |
//! | [`config`] | [`Config`] with defaults and `RKVOL_*` overrides. |
//! | [`store`] | [`StateStore`] trait, JSON file and in-memory stores. |
//! | [`registry`] | [`Registry`]: volume catalog with per-volume critical sections. |
//! | [`directory`] | [`PluginDirectory`]: plugin instances, health and topology. |
//! | [`topology`] | Feasibility rule and [`TopologyMatcher`]. |
//! | [`controller`] | [`CsiController`] trait: controller publish / unpublish. |
//! | [`node`] | [`CsiNode`] trait: stage, publish, unpublish, unstage. |
//! | [`message`] | [`CsiMessage`] protocol envelope for QUIC transport. |
//! | [`transport`] | QUIC client and [`PluginConnector`]s built on `quinn`. |
//! | [`driver`] | [`AttachmentDriver`]: the persisted attach/detach state machine. |
//! | [`coordinator`] | [`ClaimCoordinator`]: claim grant, release, rollback, resume. |
//! | [`gc`] | [`GcSweeper`]: periodic orphan reclamation. |
//! | [`service`] | [`VolumeService`]: register, deregister, list and info. |
//! | [`cluster`] | [`ClusterState`] trait consumed by GC and placement. |
//! | [`fake`] | In-process plugin, connector and cluster fakes. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod cluster;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod directory;
pub mod driver;
pub mod error;
pub mod fake;
pub mod gc;
pub mod message;
pub mod node;
pub mod registry;
pub mod service;
pub mod store;
pub mod topology;
pub mod transport;
pub mod types;

// Re-export the most commonly used items at crate root for convenience.
pub use cluster::ClusterState;
pub use config::{Config, RetryPolicy};
pub use controller::CsiController;
pub use coordinator::{ClaimCoordinator, ReclaimOutcome, ResumeReport};
pub use directory::PluginDirectory;
pub use driver::AttachmentDriver;
pub use error::{CsiError, VolumeError};
pub use gc::{GcSweeper, SweepReport};
pub use message::CsiMessage;
pub use node::CsiNode;
pub use registry::Registry;
pub use service::{PluginHealth, PluginStub, VolumeInfo, VolumeService, VolumeStub};
pub use store::{FileStore, MemoryStore, StateStore};
pub use topology::TopologyMatcher;
pub use transport::PluginConnector;
pub use types::*;
