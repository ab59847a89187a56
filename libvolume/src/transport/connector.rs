//! Endpoint resolution and connection caching for plugin instances.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use super::PluginConnector;
use super::client::CsiClient;
use crate::controller::CsiController;
use crate::directory::PluginDirectory;
use crate::error::CsiError;
use crate::node::CsiNode;
use crate::types::{NodeId, PluginRole};

/// Connects to plugin instances at the endpoints they reported to the
/// [`PluginDirectory`], keeping one QUIC connection per endpoint.
pub struct QuicConnector {
    directory: Arc<PluginDirectory>,
    tls_config: rustls::ClientConfig,
    server_name: String,
    clients: DashMap<SocketAddr, Arc<CsiClient>>,
}

impl QuicConnector {
    pub fn new(
        directory: Arc<PluginDirectory>,
        tls_config: rustls::ClientConfig,
        server_name: impl Into<String>,
    ) -> Self {
        Self {
            directory,
            tls_config,
            server_name: server_name.into(),
            clients: DashMap::new(),
        }
    }

    async fn client(
        &self,
        plugin_id: &str,
        node_id: &NodeId,
        role: PluginRole,
    ) -> Result<Arc<CsiClient>, CsiError> {
        let addr = self
            .directory
            .endpoint(plugin_id, node_id, role)
            .ok_or_else(|| {
                CsiError::Unavailable(format!(
                    "plugin {plugin_id} reported no {role:?} endpoint on {node_id}"
                ))
            })?;

        if let Some(client) = self.clients.get(&addr).map(|c| Arc::clone(c.value())) {
            if !client.is_closed() {
                return Ok(client);
            }
            warn!(%addr, plugin = %plugin_id, "cached CSI connection closed, reconnecting");
        }

        let client = Arc::new(
            CsiClient::connect(addr, &self.server_name, self.tls_config.clone()).await?,
        );
        self.clients.insert(addr, Arc::clone(&client));
        debug!(%addr, plugin = %plugin_id, node = %node_id, "CSI client cached");
        Ok(client)
    }

    /// Close every cached connection.
    pub fn close_all(&self) {
        for entry in self.clients.iter() {
            entry.value().close();
        }
        self.clients.clear();
    }
}

#[async_trait]
impl PluginConnector for QuicConnector {
    async fn controller(
        &self,
        plugin_id: &str,
        node_id: &NodeId,
    ) -> Result<Arc<dyn CsiController>, CsiError> {
        let client = self
            .client(plugin_id, node_id, PluginRole::Controller)
            .await?;
        Ok(client)
    }

    async fn node(&self, plugin_id: &str, node_id: &NodeId) -> Result<Arc<dyn CsiNode>, CsiError> {
        let client = self.client(plugin_id, node_id, PluginRole::Node).await?;
        Ok(client)
    }
}
