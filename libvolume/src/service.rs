//! Volume service: the CRUD boundary in front of the registry, the plugin
//! directory and the claim coordinator.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::coordinator::ClaimCoordinator;
use crate::directory::PluginDirectory;
use crate::error::VolumeError;
use crate::registry::Registry;
use crate::types::*;

/// Health of the plugin serving a volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginHealth {
    pub provider: String,
    /// At least one healthy controller and one healthy node.
    pub schedulable: bool,
    pub controllers_healthy: usize,
    pub controllers_expected: usize,
    pub nodes_healthy: usize,
    pub nodes_expected: usize,
}

impl PluginHealth {
    /// Summary of `plugin`; an unknown plugin is unschedulable.
    pub fn of(plugin: Option<&Plugin>) -> Self {
        match plugin {
            Some(p) => Self {
                provider: p.provider.clone(),
                schedulable: p.is_schedulable(),
                controllers_healthy: p.controllers_healthy(),
                controllers_expected: p.controllers.len(),
                nodes_healthy: p.nodes_healthy(),
                nodes_expected: p.nodes.len(),
            },
            None => Self::default(),
        }
    }
}

/// List projection of a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeStub {
    pub id: VolumeId,
    pub namespace: String,
    pub name: String,
    pub plugin_id: String,
    pub access_mode: AccessMode,
    pub attachment_mode: AttachmentMode,
    pub readers: usize,
    pub writers: usize,
    #[serde(flatten)]
    pub health: PluginHealth,
}

impl VolumeStub {
    pub fn new(volume: &Volume, plugin: Option<&Plugin>) -> Self {
        Self {
            id: volume.id.clone(),
            namespace: volume.namespace.clone(),
            name: volume.name.clone(),
            plugin_id: volume.plugin_id.clone(),
            access_mode: volume.access_mode,
            attachment_mode: volume.attachment_mode,
            readers: volume.readers(),
            writers: volume.writers(),
            health: PluginHealth::of(plugin),
        }
    }
}

/// A volume with its claims and plugin health.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeInfo {
    pub volume: Volume,
    pub health: PluginHealth,
}

/// List projection of a plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginStub {
    pub id: String,
    pub version: String,
    #[serde(flatten)]
    pub health: PluginHealth,
}

/// Entry point for registering volumes and inspecting volumes and plugins.
pub struct VolumeService {
    registry: Arc<Registry>,
    directory: Arc<PluginDirectory>,
    coordinator: Arc<ClaimCoordinator>,
}

impl VolumeService {
    pub fn new(coordinator: Arc<ClaimCoordinator>) -> Self {
        Self {
            registry: Arc::clone(coordinator.registry()),
            directory: Arc::clone(coordinator.directory()),
            coordinator,
        }
    }

    pub fn coordinator(&self) -> &Arc<ClaimCoordinator> {
        &self.coordinator
    }

    /// Create or update a volume.  Existing claims are kept.
    pub async fn register(&self, volume: Volume) -> Result<Volume, VolumeError> {
        self.registry.register(volume).await
    }

    /// Delete a volume.
    ///
    /// A volume with claims is only deleted with `force`, which releases
    /// every claim first.  If any release fails nothing is deleted and the
    /// failures are reported.
    #[instrument(skip(self, key), fields(volume = %key))]
    pub async fn deregister(&self, key: &VolumeKey, force: bool) -> Result<Volume, VolumeError> {
        self.registry.ensure_open()?;
        let instances: Vec<InstanceId> = {
            let lock = self.registry.lock(key).await?;
            if lock.volume().claims.is_empty() {
                return self.registry.remove(lock).await;
            }
            if !force {
                return Err(VolumeError::ForcedDeregisterRequired(key.clone()));
            }
            let mut instances: Vec<_> = lock.volume().claims.keys().cloned().collect();
            instances.sort();
            instances
        };
        info!(claims = instances.len(), "force-releasing claims");

        let results = futures::future::join_all(
            instances
                .iter()
                .map(|instance| self.coordinator.release_claim(key, instance)),
        )
        .await;
        let failures: Vec<(InstanceId, String)> = instances
            .into_iter()
            .zip(results)
            .filter_map(|(instance, result)| result.err().map(|e| (instance, e.to_string())))
            .collect();
        if !failures.is_empty() {
            warn!(failed = failures.len(), "forced deregister incomplete");
            return Err(VolumeError::ForcedDeregisterIncomplete {
                volume: key.clone(),
                failures,
            });
        }

        let lock = self.registry.lock(key).await?;
        self.registry.remove(lock).await
    }

    /// Stubs of every volume, optionally in one namespace, ordered by key.
    pub async fn list_volumes(&self, namespace: Option<&str>) -> Vec<VolumeStub> {
        self.registry
            .list(namespace)
            .await
            .iter()
            .map(|v| VolumeStub::new(v, self.directory.get(&v.plugin_id).as_ref()))
            .collect()
    }

    pub async fn volume_info(&self, key: &VolumeKey) -> Result<VolumeInfo, VolumeError> {
        let volume = self
            .registry
            .get(key)
            .await
            .ok_or_else(|| VolumeError::VolumeNotFound(key.clone()))?;
        let health = PluginHealth::of(self.directory.get(&volume.plugin_id).as_ref());
        Ok(VolumeInfo { volume, health })
    }

    pub fn list_plugins(&self) -> Vec<PluginStub> {
        self.directory
            .list()
            .iter()
            .map(|p| PluginStub {
                id: p.id.clone(),
                version: p.version.clone(),
                health: PluginHealth::of(Some(p)),
            })
            .collect()
    }

    /// Full plugin record, instances and owning jobs included.
    pub fn plugin_info(&self, plugin_id: &str) -> Result<Plugin, VolumeError> {
        self.directory
            .get(plugin_id)
            .ok_or_else(|| VolumeError::PluginNotFound(plugin_id.to_owned()))
    }

    /// Jobs running instances of `plugin_id`, grouped by namespace.
    pub fn plugin_jobs(&self, plugin_id: &str) -> Result<BTreeMap<String, BTreeSet<String>>, VolumeError> {
        self.plugin_info(plugin_id).map(|p| p.jobs())
    }

    /// Record a fingerprint report.
    pub fn report_plugin(&self, fingerprint: PluginFingerprint) {
        self.directory.upsert(fingerprint);
    }

    pub fn remove_plugin_instance(&self, plugin_id: &str, node_id: &NodeId, role: PluginRole) {
        self.directory.remove_instance(plugin_id, node_id, role);
    }

    /// Reject further changes and wait for in-progress transitions to persist.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}
