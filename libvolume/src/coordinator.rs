//! Claim coordinator: grants and releases volume claims.
//!
//! Every claim decision happens inside the volume's critical section (see
//! [`Registry::lock`]).  The attach and detach sequences run outside it, so
//! a slow plugin never blocks other volumes or conflict checks on the same
//! volume.  Provisional claims (`pending`, `unpublishing`) are part of the
//! claim set while their sequence runs and count against the access mode.
//!
//! In-flight sequences are tracked per claim with a cancel token and a
//! completion token, which lets a release or a preemption abort an attach
//! and wait for its rollback.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cluster::ClusterState;
use crate::directory::PluginDirectory;
use crate::driver::{AttachRequest, AttachmentDriver, ProgressSink};
use crate::error::VolumeError;
use crate::registry::Registry;
use crate::types::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActivityKind {
    Attaching,
    Detaching,
}

struct Activity {
    kind: ActivityKind,
    cancel: CancellationToken,
    /// Cancelled once the sequence has settled the claim.
    done: CancellationToken,
}

type ActivityKey = (VolumeKey, InstanceId);

/// Result of a garbage-collection attempt on one claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReclaimOutcome {
    /// The instance was gone and the claim has been released.
    Released(Claim),
    /// The instance still exists.
    Retained,
    /// The claim no longer exists.
    Absent,
    /// An attach or detach sequence is running; left to it.
    InProgress,
}

/// Work done by [`ClaimCoordinator::resume_interrupted`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeReport {
    pub attaches: usize,
    pub detaches: usize,
    /// Resumed sequences that ended in an error.
    pub failed: usize,
}

enum ReleasePlan {
    Absent,
    Retained,
    InProgress,
    /// An attach is being cancelled; wait for its rollback.
    WaitForAttach(Claim, CancellationToken),
    Detach {
        req: AttachRequest,
        from: AttachState,
        snapshot: Claim,
        done: CancellationToken,
    },
}

/// Persists attach progress into the claim record.
struct ClaimProgress<'a> {
    registry: &'a Registry,
    key: &'a VolumeKey,
    instance: &'a InstanceId,
}

#[async_trait]
impl ProgressSink for ClaimProgress<'_> {
    async fn record(
        &self,
        state: AttachState,
        publish_context: Option<&PublishContext>,
    ) -> Result<(), VolumeError> {
        let mut lock = self.registry.lock(self.key).await?;
        if !lock.volume().claims.contains_key(self.instance) {
            return Err(VolumeError::ClaimConflict {
                volume: self.key.clone(),
                instance: self.instance.clone(),
                reason: "claim disappeared during its attach sequence".into(),
            });
        }
        lock.update(|volume| {
            if let Some(claim) = volume.claims.get_mut(self.instance) {
                claim.attach = state;
                if let Some(ctx) = publish_context {
                    claim.publish_context = ctx.clone();
                }
            }
        })
        .await?;
        debug!(volume = %self.key, instance = %self.instance, step = %state, "attach progress recorded");
        Ok(())
    }
}

/// Grants, releases and reclaims claims on registered volumes.
pub struct ClaimCoordinator {
    registry: Arc<Registry>,
    directory: Arc<PluginDirectory>,
    driver: AttachmentDriver,
    active: DashMap<ActivityKey, Activity>,
}

impl ClaimCoordinator {
    pub fn new(
        registry: Arc<Registry>,
        directory: Arc<PluginDirectory>,
        driver: AttachmentDriver,
    ) -> Self {
        Self {
            registry,
            directory,
            driver,
            active: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn directory(&self) -> &Arc<PluginDirectory> {
        &self.directory
    }

    fn progress<'a>(&'a self, req: &'a AttachRequest) -> ClaimProgress<'a> {
        ClaimProgress {
            registry: &self.registry,
            key: &req.volume,
            instance: &req.instance_id,
        }
    }

    fn track(&self, key: &VolumeKey, instance_id: &InstanceId, kind: ActivityKind) -> Activity {
        let activity = Activity {
            kind,
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
        };
        self.active.insert(
            (key.clone(), instance_id.clone()),
            Activity {
                kind,
                cancel: activity.cancel.clone(),
                done: activity.done.clone(),
            },
        );
        activity
    }

    fn settle(&self, req: &AttachRequest, done: &CancellationToken) {
        self.active
            .remove(&(req.volume.clone(), req.instance_id.clone()));
        done.cancel();
    }

    /// Claim `key` for a workload instance on `node_id`.
    ///
    /// Returns once the volume is published on the node, or after the
    /// failed attempt has been rolled back.  Asking again for a claim that
    /// is already granted with the same node and mode returns it unchanged.
    #[instrument(skip_all, fields(volume = %key, instance = %instance_id, node = %node_id, mode = %mode))]
    pub async fn request_claim(
        &self,
        key: &VolumeKey,
        instance_id: InstanceId,
        node_id: NodeId,
        mode: ClaimMode,
    ) -> Result<Claim, VolumeError> {
        self.registry.ensure_open()?;

        let (req, activity) = {
            let mut lock = self.registry.lock(key).await?;
            let volume = lock.volume();

            if let Some(existing) = volume.claims.get(&instance_id) {
                if existing.state == ClaimState::Claimed
                    && existing.node_id == node_id
                    && existing.mode == mode
                {
                    debug!("claim already granted");
                    return Ok(existing.clone());
                }
                return Err(VolumeError::ClaimConflict {
                    volume: key.clone(),
                    instance: instance_id,
                    reason: format!(
                        "instance already holds a {} {} claim on node {}",
                        existing.state, existing.mode, existing.node_id
                    ),
                });
            }

            check_access(volume, &node_id, mode)?;
            if volume.is_detaching_from(&node_id) {
                return Err(VolumeError::ClaimConflict {
                    volume: key.clone(),
                    instance: instance_id,
                    reason: format!("volume is being detached from node {node_id}"),
                });
            }
            let pair = self.directory.select_pair(&volume.plugin_id, &node_id)?;

            let mut claim = Claim::new(instance_id.clone(), node_id, mode);
            claim.controller_node = Some(pair.controller_node);
            let req = AttachRequest::new(volume, &claim);

            lock.update(|volume| volume.claims.insert(instance_id.clone(), claim))
                .await?;
            let activity = self.track(key, &instance_id, ActivityKind::Attaching);
            (req, activity)
        };
        info!("claim reserved, attaching");

        let result = self
            .driver
            .attach(
                &req,
                AttachState::Pending,
                PublishContext::new(),
                &self.progress(&req),
                &activity.cancel,
            )
            .await;
        let outcome = self.finish_attach(&req, result, &activity.cancel).await;
        self.settle(&req, &activity.done);
        outcome
    }

    /// Promote the claim after a successful attach, or roll it back.
    async fn finish_attach(
        &self,
        req: &AttachRequest,
        result: Result<PublishContext, VolumeError>,
        cancel: &CancellationToken,
    ) -> Result<Claim, VolumeError> {
        let error = match result {
            Ok(publish_context) => {
                let mut lock = self.registry.lock(&req.volume).await?;
                // Cancellation is decided under the lock so a concurrent
                // release either sees the claim granted or the attach aborted.
                if cancel.is_cancelled() {
                    drop(lock);
                    VolumeError::Cancelled {
                        volume: req.volume.clone(),
                        instance: req.instance_id.clone(),
                    }
                } else {
                    let granted = lock
                        .update(|volume| {
                            volume.claims.get_mut(&req.instance_id).map(|claim| {
                                claim.state = ClaimState::Claimed;
                                claim.attach = AttachState::Published;
                                claim.publish_context = publish_context;
                                claim.clone()
                            })
                        })
                        .await;
                    match granted {
                        Ok(Some(claim)) => {
                            self.active
                                .remove(&(req.volume.clone(), req.instance_id.clone()));
                            info!(volume = %req.volume, instance = %req.instance_id, "claim granted");
                            return Ok(claim);
                        }
                        Ok(None) => return Err(claim_gone(req)),
                        Err(e) => {
                            drop(lock);
                            warn!(volume = %req.volume, instance = %req.instance_id, error = %e, "failed to record granted claim");
                            e
                        }
                    }
                }
            }
            Err(e) => e,
        };
        self.roll_back(req).await?;
        Err(error)
    }

    /// Undo a failed or cancelled attach and drop the claim.
    ///
    /// The claim stays `pending` with a teardown step recorded, so a restart
    /// in the middle resumes the rollback.  Teardown is best-effort: the
    /// claim is removed even when a plugin step could not be undone.
    async fn roll_back(&self, req: &AttachRequest) -> Result<(), VolumeError> {
        let (req, entry) = {
            let mut lock = self.registry.lock(&req.volume).await?;
            let claim = lock
                .volume()
                .claims
                .get(&req.instance_id)
                .ok_or_else(|| claim_gone(req))?;
            let entry = claim.attach.teardown_entry();
            let mut claim = claim.clone();
            claim.attach = entry;
            let req = AttachRequest::new(lock.volume(), &claim);
            lock.update(|volume| volume.claims.insert(claim.instance_id.clone(), claim))
                .await?;
            (req, entry)
        };
        warn!(volume = %req.volume, instance = %req.instance_id, step = %entry, "attach failed, rolling back");

        if let Err(e) = self.driver.detach(&req, entry, &self.progress(&req)).await {
            warn!(volume = %req.volume, instance = %req.instance_id, error = %e, "rollback teardown incomplete");
        }

        let mut lock = self.registry.lock(&req.volume).await?;
        lock.update(|volume| volume.claims.remove(&req.instance_id))
            .await?;
        self.active
            .remove(&(req.volume.clone(), req.instance_id.clone()));
        Ok(())
    }

    /// Release the claim an instance holds on `key`.
    ///
    /// Returns the removed claim with state `released`, or `None` when the
    /// instance holds no claim.  A pending claim has its attach cancelled
    /// and rolled back.  A failed teardown leaves the claim `attach-failed`
    /// at the step that failed, and a later release resumes from there.
    #[instrument(skip_all, fields(volume = %key, instance = %instance_id))]
    pub async fn release_claim(
        &self,
        key: &VolumeKey,
        instance_id: &InstanceId,
    ) -> Result<Option<Claim>, VolumeError> {
        match self.release(key, instance_id, None).await? {
            ReclaimOutcome::Released(claim) => Ok(Some(claim)),
            ReclaimOutcome::Absent => Ok(None),
            ReclaimOutcome::Retained | ReclaimOutcome::InProgress => {
                Err(VolumeError::ClaimConflict {
                    volume: key.clone(),
                    instance: instance_id.clone(),
                    reason: "claim is already being released".into(),
                })
            }
        }
    }

    /// Release the claim if its instance no longer exists.
    ///
    /// Everything is re-checked inside the critical section, so a claim
    /// released or re-established since the caller looked is left alone.
    #[instrument(skip_all, fields(volume = %key, instance = %instance_id))]
    pub async fn reclaim_if_orphaned(
        &self,
        key: &VolumeKey,
        instance_id: &InstanceId,
        cluster: &dyn ClusterState,
    ) -> Result<ReclaimOutcome, VolumeError> {
        self.release(key, instance_id, Some(cluster)).await
    }

    async fn release(
        &self,
        key: &VolumeKey,
        instance_id: &InstanceId,
        cluster: Option<&dyn ClusterState>,
    ) -> Result<ReclaimOutcome, VolumeError> {
        let mut waited_for = None;
        loop {
            match self.begin_release(key, instance_id, cluster).await? {
                ReleasePlan::Absent => {
                    return Ok(match waited_for {
                        Some(claim) => ReclaimOutcome::Released(claim),
                        None => ReclaimOutcome::Absent,
                    });
                }
                ReleasePlan::Retained => return Ok(ReclaimOutcome::Retained),
                ReleasePlan::InProgress => return Ok(ReclaimOutcome::InProgress),
                ReleasePlan::WaitForAttach(mut claim, done) => {
                    done.cancelled().await;
                    claim.state = ClaimState::Released;
                    waited_for = Some(claim);
                }
                ReleasePlan::Detach {
                    req,
                    from,
                    snapshot,
                    done,
                } => {
                    let outcome = self.finish_release(&req, from, snapshot).await;
                    self.settle(&req, &done);
                    return outcome.map(ReclaimOutcome::Released);
                }
            }
        }
    }

    async fn begin_release(
        &self,
        key: &VolumeKey,
        instance_id: &InstanceId,
        cluster: Option<&dyn ClusterState>,
    ) -> Result<ReleasePlan, VolumeError> {
        let mut lock = match self.registry.lock(key).await {
            Ok(lock) => lock,
            Err(VolumeError::VolumeNotFound(_)) => return Ok(ReleasePlan::Absent),
            Err(e) => return Err(e),
        };
        let Some(claim) = lock.volume().claims.get(instance_id).cloned() else {
            return Ok(ReleasePlan::Absent);
        };

        let activity_key = (key.clone(), instance_id.clone());
        if let Some(activity) = self.active.get(&activity_key) {
            return Ok(match (activity.kind, cluster) {
                (ActivityKind::Attaching, None) => {
                    info!("cancelling in-flight attach");
                    activity.cancel.cancel();
                    ReleasePlan::WaitForAttach(claim, activity.done.clone())
                }
                _ => ReleasePlan::InProgress,
            });
        }

        if let Some(cluster) = cluster
            && cluster.instance_exists(instance_id).await?
        {
            return Ok(ReleasePlan::Retained);
        }

        let req = AttachRequest::new(lock.volume(), &claim);
        let from = claim.attach;
        lock.update(|volume| {
            if let Some(entry) = volume.claims.get_mut(instance_id) {
                entry.state = ClaimState::Unpublishing;
            }
        })
        .await?;
        let activity = self.track(key, instance_id, ActivityKind::Detaching);
        debug!(step = %from, "claim unpublishing");

        Ok(ReleasePlan::Detach {
            req,
            from,
            snapshot: claim,
            done: activity.done,
        })
    }

    async fn finish_release(
        &self,
        req: &AttachRequest,
        from: AttachState,
        snapshot: Claim,
    ) -> Result<Claim, VolumeError> {
        let result = self.driver.detach(req, from, &self.progress(req)).await;

        let mut lock = self.registry.lock(&req.volume).await?;
        let outcome = match result {
            Ok(()) => {
                let mut claim = lock
                    .update(|volume| volume.claims.remove(&req.instance_id))
                    .await?
                    .unwrap_or(snapshot);
                claim.state = ClaimState::Released;
                claim.attach = AttachState::Detached;
                info!(volume = %req.volume, instance = %req.instance_id, "claim released");
                Ok(claim)
            }
            Err(e) => {
                lock.update(|volume| {
                    if let Some(claim) = volume.claims.get_mut(&req.instance_id) {
                        claim.state = ClaimState::AttachFailed;
                    }
                })
                .await?;
                warn!(volume = %req.volume, instance = %req.instance_id, error = %e, "release failed, claim left attach-failed");
                Err(e)
            }
        };
        self.active
            .remove(&(req.volume.clone(), req.instance_id.clone()));
        outcome
    }

    /// Abort the in-flight attach of a claim.  The attach rolls back on its
    /// own; returns whether there was one to abort.
    #[instrument(skip_all, fields(volume = %key, instance = %instance_id))]
    pub async fn cancel_claim(&self, key: &VolumeKey, instance_id: &InstanceId) -> bool {
        // Serialize with the attach's own transitions.
        let _lock = self.registry.lock(key).await;
        match self.active.get(&(key.clone(), instance_id.clone())) {
            Some(activity) if activity.kind == ActivityKind::Attaching => {
                info!("attach cancelled");
                activity.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Pick up claims a previous process left mid-sequence.
    ///
    /// Pending claims continue their attach from the recorded step and roll
    /// back on failure; unpublishing claims continue their teardown.
    #[instrument(skip(self))]
    pub async fn resume_interrupted(&self) -> Result<ResumeReport, VolumeError> {
        let mut work = Vec::new();
        for key in self.registry.keys() {
            let lock = match self.registry.lock(&key).await {
                Ok(lock) => lock,
                Err(VolumeError::VolumeNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let volume = lock.volume();
            for claim in volume.claims.values() {
                if !claim.state.is_in_flight()
                    || self
                        .active
                        .contains_key(&(key.clone(), claim.instance_id.clone()))
                {
                    continue;
                }
                let kind = if claim.state == ClaimState::Pending {
                    ActivityKind::Attaching
                } else {
                    ActivityKind::Detaching
                };
                let activity = self.track(&key, &claim.instance_id, kind);
                work.push((AttachRequest::new(volume, claim), claim.clone(), activity));
            }
        }

        let results = futures::future::join_all(
            work.into_iter()
                .map(|(req, claim, activity)| self.resume_one(req, claim, activity)),
        )
        .await;

        let mut report = ResumeReport::default();
        for (kind, ok) in results {
            match kind {
                ActivityKind::Attaching => report.attaches += 1,
                ActivityKind::Detaching => report.detaches += 1,
            }
            if !ok {
                report.failed += 1;
            }
        }
        info!(
            attaches = report.attaches,
            detaches = report.detaches,
            failed = report.failed,
            "interrupted claims resumed"
        );
        Ok(report)
    }

    async fn resume_one(
        &self,
        req: AttachRequest,
        claim: Claim,
        activity: Activity,
    ) -> (ActivityKind, bool) {
        let outcome = match activity.kind {
            ActivityKind::Attaching => {
                info!(volume = %req.volume, instance = %req.instance_id, step = %claim.attach, "resuming attach");
                let result = if claim.attach.is_forward() {
                    self.driver
                        .attach(
                            &req,
                            claim.attach,
                            claim.publish_context.clone(),
                            &self.progress(&req),
                            &activity.cancel,
                        )
                        .await
                } else {
                    Err(VolumeError::ClaimConflict {
                        volume: req.volume.clone(),
                        instance: req.instance_id.clone(),
                        reason: format!("rollback interrupted at {}", claim.attach),
                    })
                };
                self.finish_attach(&req, result, &activity.cancel)
                    .await
                    .map(drop)
            }
            ActivityKind::Detaching => {
                info!(volume = %req.volume, instance = %req.instance_id, step = %claim.attach, "resuming detach");
                self.finish_release(&req, claim.attach, claim)
                    .await
                    .map(drop)
            }
        };
        self.settle(&req, &activity.done);
        if let Err(e) = &outcome {
            warn!(volume = %req.volume, instance = %req.instance_id, error = %e, "resumed claim failed");
        }
        (activity.kind, outcome.is_ok())
    }
}

fn claim_gone(req: &AttachRequest) -> VolumeError {
    VolumeError::ClaimConflict {
        volume: req.volume.clone(),
        instance: req.instance_id.clone(),
        reason: "claim disappeared during its attach sequence".into(),
    }
}

/// Whether a new claim of `mode` on `node_id` fits the volume's access mode,
/// counting every claim in the set, provisional ones included.
fn check_access(volume: &Volume, node_id: &NodeId, mode: ClaimMode) -> Result<(), VolumeError> {
    let access = volume.access_mode;
    let reason = if mode.is_write() && access.is_read_only() {
        Some(format!("{access} volumes cannot be claimed read-write"))
    } else if mode.is_write() && access.is_single_writer() && volume.writers() > 0 {
        Some(format!("{access} volume already has a writer"))
    } else if access.is_node_exclusive() {
        volume
            .claims
            .values()
            .find(|c| c.node_id != *node_id)
            .map(|c| format!("{access} volume is claimed on node {}", c.node_id))
    } else {
        None
    };
    match reason {
        Some(reason) => Err(VolumeError::AccessModeViolation {
            volume: volume.key(),
            reason,
        }),
        None => Ok(()),
    }
}
