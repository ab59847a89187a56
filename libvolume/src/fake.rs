//! In-process fakes of the coordinator's collaborators.
//!
//! [`FakePlugin`] answers all six plugin RPCs and logs every call, with
//! scripted failures and delays per RPC.  [`FakeConnector`] hands it out for
//! every plugin instance and [`FakeCluster`] stands in for cluster state.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::cluster::ClusterState;
use crate::controller::CsiController;
use crate::error::{CsiError, VolumeError};
use crate::node::CsiNode;
use crate::transport::PluginConnector;
use crate::types::*;

/// The plugin RPCs the coordinator issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeRpc {
    ControllerPublish,
    ControllerUnpublish,
    NodeStage,
    NodeUnstage,
    NodePublish,
    NodeUnpublish,
}

/// One logged RPC attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeCall {
    pub rpc: FakeRpc,
    pub volume_id: VolumeId,
    /// Target node of controller calls.
    pub node_id: Option<NodeId>,
    /// Staging or target path of node calls.
    pub path: Option<String>,
}

struct ScriptedFailure {
    /// `None` fails forever.
    remaining: Option<u32>,
    error: CsiError,
}

#[derive(Default)]
struct FakePluginInner {
    log: Vec<FakeCall>,
    failures: HashMap<FakeRpc, ScriptedFailure>,
    delays: HashMap<FakeRpc, Duration>,
    publish_context: PublishContext,
}

/// Scriptable CSI plugin serving both the controller and node services.
#[derive(Default)]
pub struct FakePlugin(Mutex<FakePluginInner>);

impl FakePlugin {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, FakePluginInner> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `times` calls of `rpc` with `error`.
    pub fn fail_times(&self, rpc: FakeRpc, times: u32, error: CsiError) {
        self.inner().failures.insert(
            rpc,
            ScriptedFailure {
                remaining: Some(times),
                error,
            },
        );
    }

    /// Fail every call of `rpc` with `error`.
    pub fn fail_always(&self, rpc: FakeRpc, error: CsiError) {
        self.inner().failures.insert(
            rpc,
            ScriptedFailure {
                remaining: None,
                error,
            },
        );
    }

    pub fn clear_failures(&self) {
        self.inner().failures.clear();
    }

    /// Hold every call of `rpc` for `delay` before answering.
    pub fn delay(&self, rpc: FakeRpc, delay: Duration) {
        self.inner().delays.insert(rpc, delay);
    }

    /// Context returned by controller publish.
    pub fn set_publish_context(&self, ctx: PublishContext) {
        self.inner().publish_context = ctx;
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.inner().log.clone()
    }

    /// Number of logged attempts of `rpc`.
    pub fn count(&self, rpc: FakeRpc) -> usize {
        self.inner().log.iter().filter(|c| c.rpc == rpc).count()
    }

    pub fn reset_log(&self) {
        self.inner().log.clear();
    }

    async fn handle(&self, call: FakeCall) -> Result<PublishContext, CsiError> {
        let rpc = call.rpc;
        let (delay, outcome) = {
            let mut inner = self.inner();
            info!(rpc = ?rpc, volume = %call.volume_id, "fake plugin: call");
            inner.log.push(call);
            let delay = inner.delays.get(&rpc).copied();
            let failure = match inner.failures.get_mut(&rpc) {
                Some(f) => match f.remaining.as_mut() {
                    None => Some(f.error.clone()),
                    Some(0) => None,
                    Some(n) => {
                        *n -= 1;
                        Some(f.error.clone())
                    }
                },
                None => None,
            };
            let outcome = match failure {
                Some(e) => Err(e),
                None => Ok(inner.publish_context.clone()),
            };
            (delay, outcome)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        outcome
    }
}

#[async_trait]
impl CsiController for FakePlugin {
    async fn controller_publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<PublishContext, CsiError> {
        self.handle(FakeCall {
            rpc: FakeRpc::ControllerPublish,
            volume_id: req.volume_id,
            node_id: Some(req.node_id),
            path: None,
        })
        .await
    }

    async fn controller_unpublish_volume(
        &self,
        req: ControllerUnpublishVolumeRequest,
    ) -> Result<(), CsiError> {
        self.handle(FakeCall {
            rpc: FakeRpc::ControllerUnpublish,
            volume_id: req.volume_id,
            node_id: Some(req.node_id),
            path: None,
        })
        .await
        .map(drop)
    }
}

#[async_trait]
impl CsiNode for FakePlugin {
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        self.handle(FakeCall {
            rpc: FakeRpc::NodeStage,
            volume_id: req.volume_id,
            node_id: None,
            path: Some(req.staging_target_path),
        })
        .await
        .map(drop)
    }

    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        self.handle(FakeCall {
            rpc: FakeRpc::NodeUnstage,
            volume_id: volume_id.clone(),
            node_id: None,
            path: Some(staging_target_path.to_owned()),
        })
        .await
        .map(drop)
    }

    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        self.handle(FakeCall {
            rpc: FakeRpc::NodePublish,
            volume_id: req.volume_id,
            node_id: None,
            path: Some(req.target_path),
        })
        .await
        .map(drop)
    }

    async fn unpublish_volume(&self, volume_id: &VolumeId, target_path: &str) -> Result<(), CsiError> {
        self.handle(FakeCall {
            rpc: FakeRpc::NodeUnpublish,
            volume_id: volume_id.clone(),
            node_id: None,
            path: Some(target_path.to_owned()),
        })
        .await
        .map(drop)
    }
}

/// Connector resolving every plugin instance to the same [`FakePlugin`].
pub struct FakeConnector {
    plugin: Arc<FakePlugin>,
}

impl FakeConnector {
    pub fn new(plugin: Arc<FakePlugin>) -> Self {
        Self { plugin }
    }
}

#[async_trait]
impl PluginConnector for FakeConnector {
    async fn controller(
        &self,
        _plugin_id: &str,
        _node_id: &NodeId,
    ) -> Result<Arc<dyn CsiController>, CsiError> {
        Ok(self.plugin.clone())
    }

    async fn node(&self, _plugin_id: &str, _node_id: &NodeId) -> Result<Arc<dyn CsiNode>, CsiError> {
        Ok(self.plugin.clone())
    }
}

#[derive(Default)]
struct FakeClusterInner {
    instances: HashSet<InstanceId>,
    not_ready: HashSet<NodeId>,
    unavailable: bool,
}

/// Cluster state where instances exist only once added and every node is
/// ready unless marked otherwise.
#[derive(Default)]
pub struct FakeCluster(Mutex<FakeClusterInner>);

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, FakeClusterInner> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_instance(&self, instance_id: &InstanceId) {
        self.inner().instances.insert(instance_id.clone());
    }

    pub fn remove_instance(&self, instance_id: &InstanceId) {
        self.inner().instances.remove(instance_id);
    }

    pub fn set_node_ready(&self, node_id: &NodeId, ready: bool) {
        let mut inner = self.inner();
        if ready {
            inner.not_ready.remove(node_id);
        } else {
            inner.not_ready.insert(node_id.clone());
        }
    }

    /// Make every lookup fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner().unavailable = unavailable;
    }
}

#[async_trait]
impl ClusterState for FakeCluster {
    async fn instance_exists(&self, instance_id: &InstanceId) -> Result<bool, VolumeError> {
        let inner = self.inner();
        if inner.unavailable {
            return Err(VolumeError::ClusterUnavailable("fake cluster offline".into()));
        }
        Ok(inner.instances.contains(instance_id))
    }

    async fn node_ready(&self, node_id: &NodeId) -> Result<bool, VolumeError> {
        let inner = self.inner();
        if inner.unavailable {
            return Err(VolumeError::ClusterUnavailable("fake cluster offline".into()));
        }
        Ok(!inner.not_ready.contains(node_id))
    }
}
