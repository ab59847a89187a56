//! Attachment driver: the staged attach and detach sequence of one claim.
//!
//! ```text
//! attach:   pending -> controller-publishing -> node-staging -> node-publishing -> published
//! teardown: node-unpublishing -> node-unstaging -> controller-unpublishing -> detached
//! ```
//!
//! A state names the step that runs next.  The driver hands every state to
//! a [`ProgressSink`] before issuing the step's RPC, so a restarted process
//! resumes from the recorded state.  Every RPC runs under the configured
//! timeout and retryable failures are retried with exponential backoff.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{Config, RetryPolicy};
use crate::error::{CsiError, VolumeError};
use crate::transport::PluginConnector;
use crate::types::*;

/// Everything the driver needs to know about one claim.
#[derive(Debug, Clone)]
pub struct AttachRequest {
    pub volume: VolumeKey,
    pub plugin_id: String,
    pub capability: VolumeCapability,
    pub volume_context: HashMap<String, String>,
    pub instance_id: InstanceId,
    pub node_id: NodeId,
    /// Node hosting the controller instance that publishes the volume.
    pub controller_node: NodeId,
    pub read_only: bool,
    /// No other claim keeps the volume staged on `node_id`.  When unset,
    /// teardown only unpublishes the instance target and leaves the staging
    /// mount and the controller publish to the remaining claims.
    pub last_on_node: bool,
}

impl AttachRequest {
    pub fn new(volume: &Volume, claim: &Claim) -> Self {
        Self {
            volume: volume.key(),
            plugin_id: volume.plugin_id.clone(),
            capability: volume.capability(),
            volume_context: volume.context.clone(),
            instance_id: claim.instance_id.clone(),
            node_id: claim.node_id.clone(),
            controller_node: claim
                .controller_node
                .clone()
                .unwrap_or_else(|| claim.node_id.clone()),
            read_only: !claim.mode.is_write(),
            last_on_node: volume.is_last_on_node(claim),
        }
    }
}

/// Durable record of attach progress.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Persist `state`, and the publish context once the controller returned
    /// one.  An error aborts the sequence.
    async fn record(
        &self,
        state: AttachState,
        publish_context: Option<&PublishContext>,
    ) -> Result<(), VolumeError>;
}

/// Issues the plugin RPCs of attach and detach sequences.
pub struct AttachmentDriver {
    connector: Arc<dyn PluginConnector>,
    rpc_timeout: Duration,
    retry: RetryPolicy,
    mount_root: PathBuf,
}

impl AttachmentDriver {
    pub fn new(connector: Arc<dyn PluginConnector>, config: &Config) -> Self {
        Self {
            connector,
            rpc_timeout: config.rpc_timeout,
            retry: config.retry.clone(),
            mount_root: config.mount_root.clone(),
        }
    }

    fn mode_dir(req: &AttachRequest) -> String {
        format!(
            "{}-{}",
            req.capability.access_mode, req.capability.attachment_mode
        )
    }

    /// Node-global staging path shared by every claim of the volume.
    pub fn staging_path(&self, req: &AttachRequest) -> String {
        self.mount_root
            .join(&req.plugin_id)
            .join("staging")
            .join(&req.volume.namespace)
            .join(req.volume.id.as_str())
            .join(Self::mode_dir(req))
            .display()
            .to_string()
    }

    /// Per-instance target path.
    pub fn target_path(&self, req: &AttachRequest) -> String {
        self.mount_root
            .join(&req.plugin_id)
            .join("per-alloc")
            .join(req.instance_id.as_str())
            .join(req.volume.id.as_str())
            .join(Self::mode_dir(req))
            .display()
            .to_string()
    }

    /// Run the attach sequence from `from` until `published`.
    ///
    /// `publish_context` is the context recorded by an earlier run; it is
    /// replaced once controller publish answers.  Returns the context the
    /// node steps used.
    #[instrument(skip_all, fields(volume = %req.volume, instance = %req.instance_id, node = %req.node_id))]
    pub async fn attach(
        &self,
        req: &AttachRequest,
        from: AttachState,
        mut publish_context: PublishContext,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<PublishContext, VolumeError> {
        if !from.is_forward() {
            return Err(VolumeError::InvalidArgument(format!(
                "cannot attach from teardown state {from}"
            )));
        }
        let connector = &self.connector;
        let staging_path = self.staging_path(req);
        let target_path = self.target_path(req);

        let mut state = from;
        loop {
            if cancel.is_cancelled() {
                return Err(cancelled(req));
            }
            match state {
                AttachState::Pending => {
                    state = AttachState::ControllerPublishing;
                    sink.record(state, None).await?;
                }
                AttachState::ControllerPublishing => {
                    let request = &ControllerPublishVolumeRequest {
                        volume_id: req.volume.id.clone(),
                        node_id: req.node_id.clone(),
                        volume_capability: req.capability.clone(),
                        read_only: req.read_only,
                        volume_context: req.volume_context.clone(),
                    };
                    publish_context = self
                        .run_step(req, state, Some(cancel), move || async move {
                            connector
                                .controller(&req.plugin_id, &req.controller_node)
                                .await?
                                .controller_publish_volume(request.clone())
                                .await
                        })
                        .await?;
                    state = AttachState::NodeStaging;
                    sink.record(state, Some(&publish_context)).await?;
                }
                AttachState::NodeStaging => {
                    let request = &NodeStageVolumeRequest {
                        volume_id: req.volume.id.clone(),
                        staging_target_path: staging_path.clone(),
                        volume_capability: req.capability.clone(),
                        publish_context: publish_context.clone(),
                        volume_context: req.volume_context.clone(),
                    };
                    self.run_step(req, state, Some(cancel), move || async move {
                        connector
                            .node(&req.plugin_id, &req.node_id)
                            .await?
                            .stage_volume(request.clone())
                            .await
                    })
                    .await?;
                    state = AttachState::NodePublishing;
                    sink.record(state, None).await?;
                }
                AttachState::NodePublishing => {
                    let request = &NodePublishVolumeRequest {
                        volume_id: req.volume.id.clone(),
                        staging_target_path: staging_path.clone(),
                        target_path: target_path.clone(),
                        volume_capability: req.capability.clone(),
                        read_only: req.read_only,
                        publish_context: publish_context.clone(),
                        volume_context: req.volume_context.clone(),
                    };
                    self.run_step(req, state, Some(cancel), move || async move {
                        connector
                            .node(&req.plugin_id, &req.node_id)
                            .await?
                            .publish_volume(request.clone())
                            .await
                    })
                    .await?;
                    state = AttachState::Published;
                    sink.record(state, None).await?;
                }
                AttachState::Published => {
                    info!(target_path = %target_path, "volume published");
                    return Ok(publish_context);
                }
                teardown => {
                    return Err(VolumeError::InvalidArgument(format!(
                        "cannot attach from teardown state {teardown}"
                    )));
                }
            }
        }
    }

    /// Undo whatever the attach sequence may have done, starting from the
    /// recorded state `from`.
    ///
    /// The node side (unpublish, then unstage) and the controller side are
    /// attempted independently; unstage only runs after a successful
    /// unpublish.  Unstage and controller unpublish are skipped unless
    /// `req.last_on_node` is set.  On failure the earliest incomplete step stays recorded and
    /// the first error is returned.  Teardown is never cancelled.
    #[instrument(skip_all, fields(volume = %req.volume, instance = %req.instance_id, node = %req.node_id))]
    pub async fn detach(
        &self,
        req: &AttachRequest,
        from: AttachState,
        sink: &dyn ProgressSink,
    ) -> Result<(), VolumeError> {
        let connector = &self.connector;
        let staging_path = &self.staging_path(req);
        let target_path = &self.target_path(req);
        let volume_id = &req.volume.id;

        let entry = from.teardown_entry();
        let mut state = entry;
        let mut node_error = None;

        if state == AttachState::NodeUnpublishing {
            sink.record(state, None).await?;
            let result = self
                .run_step(req, state, None, move || async move {
                    connector
                        .node(&req.plugin_id, &req.node_id)
                        .await?
                        .unpublish_volume(volume_id, target_path)
                        .await
                })
                .await;
            match result {
                Ok(()) => state = AttachState::NodeUnstaging,
                Err(e) => node_error = Some(e),
            }
        }

        if !req.last_on_node {
            return match node_error {
                None => {
                    sink.record(AttachState::Detached, None).await?;
                    info!("volume unpublished, staging kept for other claims on the node");
                    Ok(())
                }
                Some(e) => {
                    warn!(error = %e, step = %state, "node teardown incomplete");
                    Err(e)
                }
            };
        }

        if node_error.is_none() && state == AttachState::NodeUnstaging {
            sink.record(state, None).await?;
            let result = self
                .run_step(req, state, None, move || async move {
                    connector
                        .node(&req.plugin_id, &req.node_id)
                        .await?
                        .unstage_volume(volume_id, staging_path)
                        .await
                })
                .await;
            match result {
                Ok(()) => state = AttachState::ControllerUnpublishing,
                Err(e) => node_error = Some(e),
            }
        }

        let mut controller_error = None;
        if entry != AttachState::Detached {
            if node_error.is_none() {
                sink.record(AttachState::ControllerUnpublishing, None)
                    .await?;
            }
            let request = &ControllerUnpublishVolumeRequest {
                volume_id: volume_id.clone(),
                node_id: req.node_id.clone(),
            };
            let result = self
                .run_step(
                    req,
                    AttachState::ControllerUnpublishing,
                    None,
                    move || async move {
                        connector
                            .controller(&req.plugin_id, &req.controller_node)
                            .await?
                            .controller_unpublish_volume(request.clone())
                            .await
                    },
                )
                .await;
            if let Err(e) = result {
                controller_error = Some(e);
            }
        }

        match (node_error, controller_error) {
            (None, None) => {
                sink.record(AttachState::Detached, None).await?;
                info!("volume detached");
                Ok(())
            }
            (Some(node), controller) => {
                if let Some(controller) = &controller {
                    warn!(error = %controller, "controller unpublish failed as well");
                }
                warn!(error = %node, step = %state, "node teardown incomplete");
                Err(node)
            }
            (None, Some(controller)) => {
                warn!(error = %controller, "controller unpublish incomplete");
                Err(controller)
            }
        }
    }

    /// Issue one step's RPC until it succeeds, fails permanently or runs out
    /// of attempts.
    async fn run_step<T, F, Fut>(
        &self,
        req: &AttachRequest,
        step: AttachState,
        cancel: Option<&CancellationToken>,
        mut call: F,
    ) -> Result<T, VolumeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CsiError>>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = wait_cancelled(cancel) => return Err(cancelled(req)),
                r = tokio::time::timeout(self.rpc_timeout, call()) => r.unwrap_or_else(|_| {
                    Err(CsiError::Timeout(format!(
                        "no answer within {:?}",
                        self.rpc_timeout
                    )))
                }),
            };

            let error = match result {
                Ok(value) => {
                    debug!(step = %step, attempt, "plugin step succeeded");
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !error.is_retryable() || attempt >= max_attempts {
                warn!(step = %step, attempt, error = %error, "plugin step failed");
                return Err(match error {
                    CsiError::Timeout(_) => VolumeError::AttachTimeout {
                        volume: req.volume.clone(),
                        step,
                        attempts: attempt,
                    },
                    source => VolumeError::AttachRpcFailure {
                        volume: req.volume.clone(),
                        step,
                        attempts: attempt,
                        source,
                    },
                });
            }

            let backoff = self.retry.backoff(attempt);
            warn!(step = %step, attempt, error = %error, ?backoff, "plugin step failed, retrying");
            tokio::select! {
                biased;
                _ = wait_cancelled(cancel) => return Err(cancelled(req)),
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }
}

async fn wait_cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

fn cancelled(req: &AttachRequest) -> VolumeError {
    VolumeError::Cancelled {
        volume: req.volume.clone(),
        instance: req.instance_id.clone(),
    }
}
