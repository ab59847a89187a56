//! Read-only view of cluster state consumed by the GC sweeper and the
//! topology matcher.

use async_trait::async_trait;

use crate::error::VolumeError;
use crate::types::{InstanceId, NodeId};

/// Answers questions about workload instances and nodes.
///
/// Implementations typically query the orchestrator's state store.
#[async_trait]
pub trait ClusterState: Send + Sync {
    /// Whether the workload instance still exists.  Instance IDs are never
    /// reused, so `false` is final.
    async fn instance_exists(&self, instance_id: &InstanceId) -> Result<bool, VolumeError>;

    /// Whether the node is up and eligible for placement.
    async fn node_ready(&self, node_id: &NodeId) -> Result<bool, VolumeError>;
}
