//! Wire envelope for coordinator-to-plugin RPCs.

use serde::{Deserialize, Serialize};

use crate::error::CsiError;
use crate::types::*;

/// Request or reply carried on one QUIC stream, JSON encoded.
///
/// Controller publish answers with [`CsiMessage::Published`], every other
/// request with [`CsiMessage::Ok`]; failures come back as
/// [`CsiMessage::Error`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CsiMessage {
    /// Controller: make a volume reachable from a node.
    ControllerPublishVolume(ControllerPublishVolumeRequest),
    /// Controller: revoke a node's access.
    ControllerUnpublishVolume(ControllerUnpublishVolumeRequest),
    /// Node: mount at the staging path.
    StageVolume(NodeStageVolumeRequest),
    /// Node: unmount the staging path.
    UnstageVolume {
        volume_id: VolumeId,
        staging_target_path: String,
    },
    /// Node: expose the staged mount at an instance target path.
    PublishVolume(NodePublishVolumeRequest),
    /// Node: remove an instance target mount.
    UnpublishVolume {
        volume_id: VolumeId,
        target_path: String,
    },

    /// Reply to a controller publish.
    Published(PublishContext),
    Ok,
    Error(CsiError),
}

impl std::fmt::Display for CsiMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ControllerPublishVolume(req) => write!(
                f,
                "ControllerPublishVolume({}, node={})",
                req.volume_id, req.node_id
            ),
            Self::ControllerUnpublishVolume(req) => write!(
                f,
                "ControllerUnpublishVolume({}, node={})",
                req.volume_id, req.node_id
            ),
            Self::StageVolume(req) => write!(f, "StageVolume({})", req.volume_id),
            Self::UnstageVolume { volume_id, .. } => write!(f, "UnstageVolume({})", volume_id),
            Self::PublishVolume(req) => write!(f, "PublishVolume({})", req.volume_id),
            Self::UnpublishVolume { volume_id, .. } => {
                write!(f, "UnpublishVolume({})", volume_id)
            }
            Self::Published(ctx) => write!(f, "Published(keys={})", ctx.len()),
            Self::Ok => f.write_str("Ok"),
            Self::Error(e) => write!(f, "Error({})", e),
        }
    }
}
