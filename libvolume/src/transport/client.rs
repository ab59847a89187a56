//! QUIC client used by the claim coordinator to issue CSI requests.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use quinn::crypto::rustls::QuicClientConfig;
use tracing::{debug, instrument};

use crate::controller::CsiController;
use crate::error::CsiError;
use crate::message::CsiMessage;
use crate::node::CsiNode;
use crate::types::*;

/// Upper bound of a single response body.
const MAX_RESPONSE_BYTES: usize = 16 * 1024 * 1024;

/// One QUIC connection to a plugin instance.
///
/// Every RPC is a single bi-directional stream: the JSON request, a finished
/// send half, then the JSON response read to the end of the stream.
pub struct CsiClient {
    connection: quinn::Connection,
}

impl CsiClient {
    /// Dial the plugin instance at `addr`.  `server_name` is checked against
    /// the plugin certificate.
    pub async fn connect(
        addr: SocketAddr,
        server_name: &str,
        tls_config: rustls::ClientConfig,
    ) -> Result<Self, CsiError> {
        let crypto = QuicClientConfig::try_from(tls_config)
            .map_err(|e| CsiError::TransportError(format!("invalid TLS config: {e}")))?;
        let mut endpoint = quinn::Endpoint::client(SocketAddr::from(([0, 0, 0, 0], 0)))
            .map_err(CsiError::transport)?;
        endpoint.set_default_client_config(quinn::ClientConfig::new(Arc::new(crypto)));

        let connecting = endpoint
            .connect(addr, server_name)
            .map_err(CsiError::transport)?;
        let connection = connecting.await.map_err(CsiError::transport)?;
        debug!(%addr, %server_name, "connected to plugin");
        Ok(Self { connection })
    }

    /// Issue one RPC and return the plugin's reply.
    #[instrument(skip_all, fields(rpc = %msg))]
    pub async fn request(&self, msg: &CsiMessage) -> Result<CsiMessage, CsiError> {
        let payload = serde_json::to_vec(msg).map_err(CsiError::internal)?;
        let (mut send, mut recv) = self.connection.open_bi().await.map_err(CsiError::transport)?;
        send.write_all(&payload).await.map_err(CsiError::transport)?;
        send.finish().map_err(CsiError::transport)?;

        let reply = recv
            .read_to_end(MAX_RESPONSE_BYTES)
            .await
            .map_err(CsiError::transport)?;
        let reply: CsiMessage = serde_json::from_slice(&reply).map_err(CsiError::transport)?;
        debug!(%reply, "plugin replied");
        Ok(reply)
    }

    /// Whether the connection has been closed by either side.
    pub fn is_closed(&self) -> bool {
        self.connection.close_reason().is_some()
    }

    pub fn close(&self) {
        self.connection.close(quinn::VarInt::from_u32(0), b"coordinator closing");
    }

    async fn expect_ok(&self, msg: CsiMessage) -> Result<(), CsiError> {
        match self.request(&msg).await? {
            CsiMessage::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: CsiMessage) -> CsiError {
    match response {
        CsiMessage::Error(e) => e,
        other => CsiError::Internal(format!("unexpected response: {other}")),
    }
}

#[async_trait]
impl CsiController for CsiClient {
    async fn controller_publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<PublishContext, CsiError> {
        match self
            .request(&CsiMessage::ControllerPublishVolume(req))
            .await?
        {
            CsiMessage::Published(ctx) => Ok(ctx),
            other => Err(unexpected(other)),
        }
    }

    async fn controller_unpublish_volume(
        &self,
        req: ControllerUnpublishVolumeRequest,
    ) -> Result<(), CsiError> {
        self.expect_ok(CsiMessage::ControllerUnpublishVolume(req))
            .await
    }
}

#[async_trait]
impl CsiNode for CsiClient {
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        self.expect_ok(CsiMessage::StageVolume(req)).await
    }

    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        self.expect_ok(CsiMessage::UnstageVolume {
            volume_id: volume_id.clone(),
            staging_target_path: staging_target_path.to_owned(),
        })
        .await
    }

    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        self.expect_ok(CsiMessage::PublishVolume(req)).await
    }

    async fn unpublish_volume(&self, volume_id: &VolumeId, target_path: &str) -> Result<(), CsiError> {
        self.expect_ok(CsiMessage::UnpublishVolume {
            volume_id: volume_id.clone(),
            target_path: target_path.to_owned(),
        })
        .await
    }
}
