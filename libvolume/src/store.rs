//! Durable storage of volume records.
//!
//! The registry writes a volume's full record, claims included, after every
//! transition.  Attach progress is therefore durable once `put` returns.
//!
//! # On-disk layout of [`FileStore`]
//!
//! ```text
//! <root>/
//!   <namespace>/
//!     <volume-id>.json        # current record
//!     <volume-id>.json.tmp    # in-progress write, renamed over the record
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::error::VolumeError;
use crate::types::{Volume, VolumeKey};

/// Persistence backend of the [`Registry`](crate::registry::Registry).
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Every stored record, used to rebuild the registry on startup.
    async fn load_all(&self) -> Result<Vec<Volume>, VolumeError>;

    /// Insert or replace the record of `volume`.
    async fn put(&self, volume: &Volume) -> Result<(), VolumeError>;

    /// Remove a record.  Removing a missing record succeeds.
    async fn delete(&self, key: &VolumeKey) -> Result<(), VolumeError>;
}

/// Non-durable store for tests and embedders that persist elsewhere.
#[derive(Default)]
pub struct MemoryStore {
    volumes: DashMap<VolumeKey, Volume>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last record written for `key`.
    pub fn get(&self, key: &VolumeKey) -> Option<Volume> {
        self.volumes.get(key).map(|r| r.clone())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load_all(&self) -> Result<Vec<Volume>, VolumeError> {
        Ok(self.volumes.iter().map(|e| e.value().clone()).collect())
    }

    async fn put(&self, volume: &Volume) -> Result<(), VolumeError> {
        self.volumes.insert(volume.key(), volume.clone());
        Ok(())
    }

    async fn delete(&self, key: &VolumeKey) -> Result<(), VolumeError> {
        self.volumes.remove(key);
        Ok(())
    }
}

/// JSON file per volume under a root directory.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, key: &VolumeKey) -> PathBuf {
        self.root
            .join(&key.namespace)
            .join(format!("{}.json", key.id))
    }

    async fn load_namespace(&self, dir: &Path, out: &mut Vec<Volume>) -> Result<(), VolumeError> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| VolumeError::Storage(format!("read_dir {}: {e}", dir.display())))?;

        while let Some(entry) = entries.next_entry().await.map_err(VolumeError::storage)? {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !file_name.ends_with(".json") {
                continue;
            }

            let json = match tokio::fs::read_to_string(&path).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read volume record, skipping");
                    continue;
                }
            };
            let volume: Volume = match serde_json::from_str(&json) {
                Ok(v) => v,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to parse volume record, skipping");
                    continue;
                }
            };
            if self.record_path(&volume.key()) != path {
                warn!(path = %path.display(), volume = %volume.key(), "volume record stored under the wrong path, skipping");
                continue;
            }
            out.push(volume);
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn load_all(&self) -> Result<Vec<Volume>, VolumeError> {
        let mut namespaces = match tokio::fs::read_dir(&self.root).await {
            Ok(d) => d,
            // Nothing to recover if the root does not exist yet.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(VolumeError::Storage(format!(
                    "read_dir {}: {e}",
                    self.root.display()
                )));
            }
        };

        let mut volumes = Vec::new();
        while let Some(entry) = namespaces.next_entry().await.map_err(VolumeError::storage)? {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if is_dir {
                self.load_namespace(&entry.path(), &mut volumes).await?;
            }
        }

        info!(root = %self.root.display(), count = volumes.len(), "volume records loaded");
        Ok(volumes)
    }

    async fn put(&self, volume: &Volume) -> Result<(), VolumeError> {
        let path = self.record_path(&volume.key());
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| VolumeError::Storage(format!("create dir {}: {e}", dir.display())))?;
        }

        let json = serde_json::to_vec_pretty(volume).map_err(VolumeError::storage)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| VolumeError::Storage(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| VolumeError::Storage(format!("rename {}: {e}", path.display())))?;

        debug!(volume = %volume.key(), "volume record written");
        Ok(())
    }

    async fn delete(&self, key: &VolumeKey) -> Result<(), VolumeError> {
        let path = self.record_path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VolumeError::Storage(format!(
                "remove {}: {e}",
                path.display()
            ))),
        }
    }
}
