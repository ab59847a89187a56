//! Node-side CSI calls.
//!
//! A node plugin makes a volume usable by one workload instance in two
//! steps.  Staging mounts the volume once per node under the plugin's
//! staging directory; publishing exposes the staged mount at the instance's
//! target path.  Teardown runs the same steps in reverse: unpublish first,
//! then unstage.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{NodePublishVolumeRequest, NodeStageVolumeRequest, VolumeId};

/// Mount and unmount operations served by a node plugin instance.
///
/// The driver reissues any of these after a timeout or a restart, so an
/// implementation must treat a repeated call on an already-done step as
/// success.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Mount the volume at `req.staging_target_path`.
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Unmount the staging path.  Missing mounts are not an error.
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError>;

    /// Expose the staged volume at `req.target_path`, read-only when
    /// `req.read_only` is set.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Remove the instance's target mount.
    async fn unpublish_volume(&self, volume_id: &VolumeId, target_path: &str)
    -> Result<(), CsiError>;
}
