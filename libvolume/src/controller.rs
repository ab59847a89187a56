//! Controller-side CSI calls.
//!
//! The Controller service makes a volume reachable from a node before the
//! node plugin mounts it, and revokes that access on teardown.  The claim
//! coordinator calls it through the [`AttachmentDriver`].
//!
//! [`AttachmentDriver`]: crate::driver::AttachmentDriver

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{ControllerPublishVolumeRequest, ControllerUnpublishVolumeRequest, PublishContext};

/// Attach and detach calls served by a controller plugin instance.
///
/// Both calls are retried after timeouts and after a restart, so a repeat
/// of a finished call has to succeed.
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Make the volume available on `req.node_id`.
    ///
    /// The returned context is forwarded to the node stage and publish calls.
    async fn controller_publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<PublishContext, CsiError>;

    /// Revoke the node's access to the volume.
    async fn controller_unpublish_volume(
        &self,
        req: ControllerUnpublishVolumeRequest,
    ) -> Result<(), CsiError>;
}
