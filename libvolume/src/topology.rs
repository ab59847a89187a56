//! Topology matching.
//!
//! [`feasible`] is the pure rule: a node qualifies when it satisfies at least
//! one of the volume's requirement sets, and it satisfies a set only when it
//! reports every segment of that set with the same value.
//!
//! [`TopologyMatcher`] applies the rule for placement, reading the volume
//! from the [`Registry`] and node topology from the [`PluginDirectory`].

use std::sync::Arc;

use tracing::trace;

use crate::cluster::ClusterState;
use crate::directory::PluginDirectory;
use crate::error::VolumeError;
use crate::registry::Registry;
use crate::types::{NodeId, Topology, VolumeKey};

/// Whether `node` satisfies every segment of `requirement`.
pub fn satisfies(requirement: &Topology, node: &Topology) -> bool {
    requirement
        .segments
        .iter()
        .all(|(key, value)| node.segments.get(key) == Some(value))
}

/// Whether a node reporting `node` topology may mount a volume with the
/// given requirement sets.
///
/// No requirements means any node.  A node that reports no topology cannot
/// satisfy a non-empty requirement list.
pub fn feasible(requirements: &[Topology], node: Option<&Topology>) -> bool {
    if requirements.is_empty() {
        return true;
    }
    match node {
        Some(node) => requirements.iter().any(|req| satisfies(req, node)),
        None => false,
    }
}

/// Placement helper filtering candidate nodes for a volume.
pub struct TopologyMatcher {
    registry: Arc<Registry>,
    directory: Arc<PluginDirectory>,
    cluster: Option<Arc<dyn ClusterState>>,
}

impl TopologyMatcher {
    pub fn new(registry: Arc<Registry>, directory: Arc<PluginDirectory>) -> Self {
        Self {
            registry,
            directory,
            cluster: None,
        }
    }

    /// Also drop nodes that the cluster reports as not ready.
    pub fn with_cluster(mut self, cluster: Arc<dyn ClusterState>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Candidates that run a healthy node plugin for the volume and satisfy
    /// its topology, in the order given.
    pub async fn feasible_nodes(
        &self,
        key: &VolumeKey,
        candidates: &[NodeId],
    ) -> Result<Vec<NodeId>, VolumeError> {
        let (plugin_id, requirements) = {
            let lock = self.registry.lock(key).await?;
            let volume = lock.volume();
            (volume.plugin_id.clone(), volume.topologies.clone())
        };

        let mut nodes = Vec::new();
        for node_id in candidates {
            if !self.directory.has_healthy_node(&plugin_id, node_id) {
                trace!(volume = %key, node = %node_id, "no healthy node plugin");
                continue;
            }
            let topology = self.directory.node_topology(&plugin_id, node_id);
            if !feasible(&requirements, topology.as_ref()) {
                trace!(volume = %key, node = %node_id, "topology mismatch");
                continue;
            }
            if let Some(cluster) = &self.cluster {
                if !cluster.node_ready(node_id).await? {
                    trace!(volume = %key, node = %node_id, "node not ready");
                    continue;
                }
            }
            nodes.push(node_id.clone());
        }
        Ok(nodes)
    }
}
