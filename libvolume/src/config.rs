//! Claim coordinator configuration.
//!
//! Every field has a default.  [`Config::from_env`] applies overrides from
//! the environment:
//!
//! - `RKVOL_STATE_DIR`: directory of persisted volume records.
//!   Defaults to `/var/lib/rkvol/state`.
//! - `RKVOL_MOUNT_ROOT`: root of staging and per-instance target paths
//!   handed to node plugins.  Defaults to `/var/lib/rkvol/csi`.
//! - `RKVOL_RPC_TIMEOUT_MS`: deadline of a single plugin RPC.  Defaults to `30000`.
//! - `RKVOL_RETRY_MAX_ATTEMPTS`: attempts per attach/detach step, first one
//!   included.  Defaults to `5`.
//! - `RKVOL_RETRY_INITIAL_BACKOFF_MS` / `RKVOL_RETRY_MAX_BACKOFF_MS`:
//!   exponential backoff bounds.  Default to `500` and `10000`.
//! - `RKVOL_GC_INTERVAL_SECS`: claim GC cadence.  Defaults to `300`.
//! - `RKVOL_GC_PARALLELISM`: volumes swept concurrently.  Defaults to `8`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::VolumeError;

static DEFAULT_STATE_DIR: &str = "/var/lib/rkvol/state";
static DEFAULT_MOUNT_ROOT: &str = "/var/lib/rkvol/csi";

/// Retry budget of one attach/detach step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.  Zero behaves like one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `failed_attempts + 1`.
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(failed_attempts.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// Configuration shared by the registry, driver and GC sweeper.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub state_dir: PathBuf,
    pub mount_root: PathBuf,
    pub rpc_timeout: Duration,
    pub retry: RetryPolicy,
    pub gc_interval: Duration,
    pub gc_parallelism: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            mount_root: PathBuf::from(DEFAULT_MOUNT_ROOT),
            rpc_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            gc_interval: Duration::from_secs(300),
            gc_parallelism: 8,
        }
    }
}

impl Config {
    /// Defaults overridden by `RKVOL_*` environment variables.
    pub fn from_env() -> Result<Self, VolumeError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, VolumeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(dir) = lookup("RKVOL_STATE_DIR") {
            config.state_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("RKVOL_MOUNT_ROOT") {
            config.mount_root = PathBuf::from(dir);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "RKVOL_RPC_TIMEOUT_MS")? {
            config.rpc_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var::<u32>(&lookup, "RKVOL_RETRY_MAX_ATTEMPTS")? {
            config.retry.max_attempts = n;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "RKVOL_RETRY_INITIAL_BACKOFF_MS")? {
            config.retry.initial_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "RKVOL_RETRY_MAX_BACKOFF_MS")? {
            config.retry.max_backoff = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "RKVOL_GC_INTERVAL_SECS")? {
            config.gc_interval = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var::<usize>(&lookup, "RKVOL_GC_PARALLELISM")? {
            config.gc_parallelism = n;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), VolumeError> {
        if self.rpc_timeout.is_zero() {
            return Err(VolumeError::InvalidArgument(
                "rpc timeout must be positive".into(),
            ));
        }
        if self.gc_interval.is_zero() {
            return Err(VolumeError::InvalidArgument(
                "gc interval must be positive".into(),
            ));
        }
        if self.gc_parallelism == 0 {
            return Err(VolumeError::InvalidArgument(
                "gc parallelism must be positive".into(),
            ));
        }
        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(VolumeError::InvalidArgument(
                "initial backoff exceeds max backoff".into(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>, VolumeError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| VolumeError::InvalidArgument(format!("{name}={raw:?}: {e}"))),
    }
}
