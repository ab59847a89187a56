//! Error types.
//!
//! Two enums cover the crate:
//!
//! * [`CsiError`] is what a storage plugin answers to an RPC.  It derives
//!   [`Serialize`]/[`Deserialize`] so it can travel across the QUIC transport,
//!   and knows whether the failed call is worth retrying.
//! * [`VolumeError`] is what callers of the registry, the claim coordinator
//!   and the volume service see.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{AttachState, InstanceId, VolumeKey};

/// Error returned by a CSI plugin RPC.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum CsiError {
    /// The plugin does not know the volume.
    #[error("volume {0} not found")]
    VolumeNotFound(String),

    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The volume is not in a state that allows the operation.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// The plugin is temporarily unable to serve the request.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete within its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A mount operation failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        /// Filesystem path where the mount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An unmount operation failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        /// Filesystem path where the unmount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// A QUIC / transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// Create a [`CsiError::TransportError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::TransportError(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Whether the same call may succeed if issued again.
    ///
    /// Plugin RPCs are idempotent, so timeouts and transport hiccups are safe
    /// to retry.  Everything else reflects a decision by the plugin.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Timeout(_) | Self::TransportError(_)
        )
    }
}

/// Error returned by volume registry, claim and service operations.
#[derive(Debug, Error)]
pub enum VolumeError {
    /// No volume is registered under the key.
    #[error("volume {0} not found")]
    VolumeNotFound(VolumeKey),

    /// No plugin instance has ever reported the plugin ID.
    #[error("plugin {0} not found")]
    PluginNotFound(String),

    /// The plugin cannot serve a claim right now.
    #[error("plugin {plugin_id} is unhealthy: {reason}")]
    PluginUnhealthy { plugin_id: String, reason: String },

    /// The claim would break the volume's access mode.
    #[error("access mode violation on volume {volume}: {reason}")]
    AccessModeViolation { volume: VolumeKey, reason: String },

    /// The claim collides with another operation on the same instance.
    #[error("claim conflict on volume {volume} for instance {instance}: {reason}")]
    ClaimConflict {
        volume: VolumeKey,
        instance: InstanceId,
        reason: String,
    },

    /// A plugin step kept timing out until the retry budget ran out.
    #[error("{step} timed out on volume {volume} after {attempts} attempt(s)")]
    AttachTimeout {
        volume: VolumeKey,
        step: AttachState,
        attempts: u32,
    },

    /// A plugin step failed permanently or exhausted its retry budget.
    #[error("{step} failed on volume {volume} after {attempts} attempt(s): {source}")]
    AttachRpcFailure {
        volume: VolumeKey,
        step: AttachState,
        attempts: u32,
        #[source]
        source: CsiError,
    },

    /// Deregistration hit live claims and was not forced.
    #[error("volume {0} has active claims, deregister with force to release them")]
    ForcedDeregisterRequired(VolumeKey),

    /// A forced deregistration could not release every claim.
    #[error(
        "forced deregister of volume {volume} left {} claim(s) unreleased",
        .failures.len()
    )]
    ForcedDeregisterIncomplete {
        volume: VolumeKey,
        failures: Vec<(InstanceId, String)>,
    },

    /// The requested change is not allowed while the volume is claimed.
    #[error("volume {volume} is in use: {reason}")]
    VolumeInUse { volume: VolumeKey, reason: String },

    /// The caller supplied an invalid value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An in-flight attach was aborted before it completed.
    #[error("claim for instance {instance} on volume {volume} was cancelled")]
    Cancelled {
        volume: VolumeKey,
        instance: InstanceId,
    },

    /// The state store could not read or write a record.
    #[error("state store error: {0}")]
    Storage(String),

    /// Cluster state could not be queried.
    #[error("cluster state unavailable: {0}")]
    ClusterUnavailable(String),

    /// The registry no longer accepts changes.
    #[error("volume registry is shutting down")]
    ShuttingDown,
}

impl VolumeError {
    /// Create a [`VolumeError::Storage`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn storage<E: std::fmt::Display>(e: E) -> Self {
        Self::Storage(e.to_string())
    }
}
