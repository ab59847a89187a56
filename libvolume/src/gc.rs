//! Periodic reclamation of claims whose workload instance is gone.
//!
//! Normal teardown releases claims when an instance stops.  The sweeper
//! catches the ones it missed: crashed clients, lost release calls, nodes
//! that never came back.

use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cluster::ClusterState;
use crate::config::Config;
use crate::coordinator::{ClaimCoordinator, ReclaimOutcome};
use crate::types::VolumeKey;

/// Counts of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Claims examined.
    pub scanned: usize,
    pub released: usize,
    /// Claims whose instance still exists.
    pub retained: usize,
    /// Claims that could not be checked or released.
    pub failed: usize,
}

impl AddAssign for SweepReport {
    fn add_assign(&mut self, other: Self) {
        self.scanned += other.scanned;
        self.released += other.released;
        self.retained += other.retained;
        self.failed += other.failed;
    }
}

pub struct GcSweeper {
    coordinator: Arc<ClaimCoordinator>,
    cluster: Arc<dyn ClusterState>,
    interval: Duration,
    parallelism: usize,
}

impl GcSweeper {
    pub fn new(
        coordinator: Arc<ClaimCoordinator>,
        cluster: Arc<dyn ClusterState>,
        config: &Config,
    ) -> Self {
        Self {
            coordinator,
            cluster,
            interval: config.gc_interval,
            parallelism: config.gc_parallelism.max(1),
        }
    }

    /// Sweep every interval until `cancel` fires.  The first sweep runs
    /// immediately.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval = ?self.interval, "claim GC started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("claim GC stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let report = self.sweep_once().await;
                    if report.released > 0 || report.failed > 0 {
                        info!(?report, "claim GC sweep finished");
                    } else {
                        debug!(?report, "claim GC sweep finished");
                    }
                }
            }
        }
    }

    /// Examine every claim of every volume once.
    #[instrument(skip(self))]
    pub async fn sweep_once(&self) -> SweepReport {
        let keys = self.coordinator.registry().keys();
        futures::stream::iter(keys)
            .map(|key| self.sweep_volume(key))
            .buffer_unordered(self.parallelism)
            .fold(SweepReport::default(), |mut total, report| async move {
                total += report;
                total
            })
            .await
    }

    async fn sweep_volume(&self, key: VolumeKey) -> SweepReport {
        let mut report = SweepReport::default();
        let Some(volume) = self.coordinator.registry().get(&key).await else {
            return report;
        };

        for instance_id in volume.claims.keys() {
            report.scanned += 1;
            match self
                .coordinator
                .reclaim_if_orphaned(&key, instance_id, self.cluster.as_ref())
                .await
            {
                Ok(ReclaimOutcome::Released(_)) => {
                    info!(volume = %key, instance = %instance_id, "orphaned claim reclaimed");
                    report.released += 1;
                }
                Ok(ReclaimOutcome::Retained) => report.retained += 1,
                Ok(ReclaimOutcome::Absent | ReclaimOutcome::InProgress) => {}
                Err(e) => {
                    warn!(volume = %key, instance = %instance_id, error = %e, "failed to reclaim claim");
                    report.failed += 1;
                }
            }
        }
        report
    }
}
