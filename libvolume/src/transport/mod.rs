//! QUIC transport layer for CSI messages.
//!
//! [`CsiClient`](client::CsiClient) sends [`CsiMessage`](crate::message::CsiMessage)
//! values over QUIC bi-directional streams using `quinn`.  A
//! [`PluginConnector`] hands the attachment driver a controller or node
//! service for a plugin instance; [`QuicConnector`](connector::QuicConnector)
//! is the production one.

use std::sync::Arc;

use async_trait::async_trait;

use crate::controller::CsiController;
use crate::error::CsiError;
use crate::node::CsiNode;
use crate::types::NodeId;

pub mod client;
pub mod connector;

/// Resolves plugin instances to RPC clients.
#[async_trait]
pub trait PluginConnector: Send + Sync {
    /// Controller service of `plugin_id` hosted on `node_id`.
    async fn controller(
        &self,
        plugin_id: &str,
        node_id: &NodeId,
    ) -> Result<Arc<dyn CsiController>, CsiError>;

    /// Node service of `plugin_id` running on `node_id`.
    async fn node(&self, plugin_id: &str, node_id: &NodeId) -> Result<Arc<dyn CsiNode>, CsiError>;
}
