//! Plugin directory: which plugin instances run where, and whether they are
//! healthy.
//!
//! The directory is fed by fingerprinting (outside this crate) through
//! [`PluginDirectory::upsert`] and [`PluginDirectory::remove_instance`].  The
//! claim coordinator reads it to pick a controller/node pair and the
//! topology matcher reads node topology from it.

use std::net::SocketAddr;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::error::VolumeError;
use crate::types::{NodeId, Plugin, PluginFingerprint, PluginRole, Topology};

/// Controller and node instance chosen to serve one claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginPair {
    pub controller_node: NodeId,
    pub node: NodeId,
}

/// Live view of every CSI plugin instance in the cluster.
#[derive(Default)]
pub struct PluginDirectory {
    plugins: DashMap<String, Plugin>,
}

impl PluginDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fingerprint.  A monolith instance is listed as both a
    /// controller and a node.
    pub fn upsert(&self, fingerprint: PluginFingerprint) {
        let PluginFingerprint {
            plugin_id,
            provider,
            version,
            instance,
        } = fingerprint;

        let mut plugin = self
            .plugins
            .entry(plugin_id.clone())
            .or_insert_with(|| Plugin::new(plugin_id.clone()));
        if !provider.is_empty() {
            plugin.provider = provider;
        }
        if !version.is_empty() {
            plugin.version = version;
        }

        let node_id = instance.node_id.clone();
        let healthy = instance.healthy;
        if instance.role.serves_controller() {
            plugin.controllers.insert(node_id.clone(), instance.clone());
        }
        if instance.role.serves_node() {
            plugin.nodes.insert(node_id.clone(), instance);
        }
        debug!(plugin = %plugin_id, node = %node_id, healthy, "plugin instance reported");
    }

    /// Forget an instance.  The plugin disappears with its last instance.
    pub fn remove_instance(&self, plugin_id: &str, node_id: &NodeId, role: PluginRole) {
        let now_empty = match self.plugins.get_mut(plugin_id) {
            Some(mut plugin) => {
                if role.serves_controller() {
                    plugin.controllers.remove(node_id);
                }
                if role.serves_node() {
                    plugin.nodes.remove(node_id);
                }
                plugin.is_empty()
            }
            None => return,
        };
        if now_empty {
            self.plugins.remove_if(plugin_id, |_, p| p.is_empty());
            info!(plugin = %plugin_id, "last plugin instance removed");
        }
    }

    pub fn get(&self, plugin_id: &str) -> Option<Plugin> {
        self.plugins.get(plugin_id).map(|p| p.clone())
    }

    /// Every plugin, ordered by ID.
    pub fn list(&self) -> Vec<Plugin> {
        let mut plugins: Vec<Plugin> = self.plugins.iter().map(|p| p.value().clone()).collect();
        plugins.sort_by(|a, b| a.id.cmp(&b.id));
        plugins
    }

    /// Topology reported by the node plugin running on `node_id`.
    pub fn node_topology(&self, plugin_id: &str, node_id: &NodeId) -> Option<Topology> {
        self.plugins
            .get(plugin_id)
            .and_then(|p| p.nodes.get(node_id).and_then(|i| i.topology.clone()))
    }

    /// Whether `node_id` runs a healthy node instance of the plugin.
    pub fn has_healthy_node(&self, plugin_id: &str, node_id: &NodeId) -> bool {
        self.plugins
            .get(plugin_id)
            .is_some_and(|p| p.healthy_node(node_id).is_some())
    }

    /// Choose the healthy controller and node instances for a claim on
    /// `node_id`, or explain why there are none.
    pub fn select_pair(&self, plugin_id: &str, node_id: &NodeId) -> Result<PluginPair, VolumeError> {
        let unhealthy = |reason: String| VolumeError::PluginUnhealthy {
            plugin_id: plugin_id.to_owned(),
            reason,
        };
        let plugin = self
            .plugins
            .get(plugin_id)
            .ok_or_else(|| unhealthy("no instance has reported".into()))?;

        if plugin.healthy_node(node_id).is_none() {
            let reason = match plugin.nodes.get(node_id) {
                Some(i) if !i.health_description.is_empty() => {
                    format!("node plugin on {node_id} is unhealthy: {}", i.health_description)
                }
                Some(_) => format!("node plugin on {node_id} is unhealthy"),
                None => format!("no node plugin on {node_id}"),
            };
            return Err(unhealthy(reason));
        }
        let controller = plugin
            .healthy_controller(node_id)
            .ok_or_else(|| unhealthy("no healthy controller".into()))?;

        Ok(PluginPair {
            controller_node: controller.node_id.clone(),
            node: node_id.clone(),
        })
    }

    /// Reported endpoint of the instance serving `role` on `node_id`.
    pub fn endpoint(&self, plugin_id: &str, node_id: &NodeId, role: PluginRole) -> Option<SocketAddr> {
        let plugin = self.plugins.get(plugin_id)?;
        let instances = if role.serves_controller() {
            &plugin.controllers
        } else {
            &plugin.nodes
        };
        instances.get(node_id).and_then(|i| i.endpoint)
    }
}
