//! Volume registry: the durable catalog of volume records.
//!
//! Each volume lives in its own slot behind a [`tokio::sync::Mutex`].  The
//! mutex is the volume's critical section: claim checks and claim updates
//! happen while holding it, plugin RPCs never do.  Different volumes never
//! contend.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument};

use crate::error::VolumeError;
use crate::store::StateStore;
use crate::types::{Volume, VolumeKey};

struct VolumeRecord {
    volume: Volume,
    /// Set when the record was deleted while someone waited on the slot.
    removed: bool,
}

type Slot = Arc<Mutex<VolumeRecord>>;

/// Exclusive access to one volume record.
///
/// Changes made through [`VolumeLock::volume_mut`] stay in memory until
/// [`VolumeLock::persist`] writes them to the store.  [`VolumeLock::update`]
/// does both and leaves memory untouched when the write fails.
pub struct VolumeLock {
    guard: OwnedMutexGuard<VolumeRecord>,
    store: Arc<dyn StateStore>,
}

impl VolumeLock {
    pub fn volume(&self) -> &Volume {
        &self.guard.volume
    }

    pub fn volume_mut(&mut self) -> &mut Volume {
        &mut self.guard.volume
    }

    pub async fn persist(&self) -> Result<(), VolumeError> {
        self.store.put(&self.guard.volume).await
    }

    /// Apply `change` to a copy of the record and store it.  The in-memory
    /// record only changes once the store accepted the copy.
    pub async fn update<T>(
        &mut self,
        change: impl FnOnce(&mut Volume) -> T,
    ) -> Result<T, VolumeError> {
        let mut next = self.guard.volume.clone();
        let out = change(&mut next);
        self.store.put(&next).await?;
        self.guard.volume = next;
        Ok(out)
    }
}

/// Catalog of volumes keyed by namespace and ID.
pub struct Registry {
    store: Arc<dyn StateStore>,
    slots: DashMap<VolumeKey, Slot>,
    closed: AtomicBool,
}

impl Registry {
    /// Build a registry from everything `store` holds.
    pub async fn open(store: Arc<dyn StateStore>) -> Result<Self, VolumeError> {
        let slots = DashMap::new();
        for volume in store.load_all().await? {
            slots.insert(
                volume.key(),
                Arc::new(Mutex::new(VolumeRecord {
                    volume,
                    removed: false,
                })),
            );
        }
        info!(count = slots.len(), "volume registry opened");
        Ok(Self {
            store,
            slots,
            closed: AtomicBool::new(false),
        })
    }

    /// Fail once [`Registry::shutdown`] has been called.
    pub fn ensure_open(&self) -> Result<(), VolumeError> {
        if self.closed.load(Ordering::Acquire) {
            Err(VolumeError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Stop accepting registrations and claims, then wait for transitions
    /// already inside a critical section to finish persisting.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        for slot in self.slot_handles() {
            drop(slot.lock().await);
        }
        info!("volume registry shut down");
    }

    fn slot_handles(&self) -> Vec<Slot> {
        self.slots.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Enter the critical section of a volume.
    pub async fn lock(&self, key: &VolumeKey) -> Result<VolumeLock, VolumeError> {
        let slot = self
            .slots
            .get(key)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| VolumeError::VolumeNotFound(key.clone()))?;
        let guard = slot.lock_owned().await;
        if guard.removed {
            return Err(VolumeError::VolumeNotFound(key.clone()));
        }
        Ok(VolumeLock {
            guard,
            store: Arc::clone(&self.store),
        })
    }

    /// Insert a volume or update an existing one.
    ///
    /// Claims are owned by the registry: the incoming claim set is ignored
    /// and the existing one is kept.  While claims exist, the plugin and the
    /// modes cannot change.
    #[instrument(skip_all, fields(volume = %volume.key()))]
    pub async fn register(&self, mut volume: Volume) -> Result<Volume, VolumeError> {
        self.ensure_open()?;
        volume.validate()?;
        if volume.name.is_empty() {
            volume.name = volume.id.0.clone();
        }
        let key = volume.key();

        loop {
            let existing = self.slots.get(&key).map(|e| Arc::clone(e.value()));
            match existing {
                Some(slot) => {
                    let mut guard = slot.lock_owned().await;
                    if guard.removed {
                        // Deregistered while we waited; start over with a fresh slot.
                        continue;
                    }
                    let current = &guard.volume;
                    if !current.claims.is_empty() {
                        check_update_in_use(current, &volume)?;
                    }
                    let mut updated = volume;
                    updated.claims = current.claims.clone();
                    self.store.put(&updated).await?;
                    guard.volume = updated.clone();
                    debug!("volume updated");
                    return Ok(updated);
                }
                None => {
                    volume.claims.clear();
                    let slot: Slot = Arc::new(Mutex::new(VolumeRecord {
                        volume: volume.clone(),
                        removed: false,
                    }));
                    // Hold the new slot before publishing it so nobody sees an
                    // unpersisted record.
                    let mut guard = Arc::clone(&slot).lock_owned().await;
                    match self.slots.entry(key.clone()) {
                        Entry::Occupied(_) => continue,
                        Entry::Vacant(e) => {
                            e.insert(slot);
                        }
                    }
                    if let Err(e) = self.store.put(&volume).await {
                        guard.removed = true;
                        self.slots.remove(&key);
                        return Err(e);
                    }
                    info!("volume registered");
                    return Ok(volume);
                }
            }
        }
    }

    /// Delete a volume that has no claims.
    pub async fn remove_unclaimed(&self, key: &VolumeKey) -> Result<Volume, VolumeError> {
        let lock = self.lock(key).await?;
        self.remove(lock).await
    }

    /// Delete the locked volume.  Fails if it still has claims.
    pub async fn remove(&self, mut lock: VolumeLock) -> Result<Volume, VolumeError> {
        let key = lock.volume().key();
        if !lock.volume().claims.is_empty() {
            return Err(VolumeError::ForcedDeregisterRequired(key));
        }
        self.store.delete(&key).await?;
        lock.guard.removed = true;
        self.slots.remove(&key);
        info!(volume = %key, "volume deregistered");
        Ok(lock.volume().clone())
    }

    /// Snapshot of one volume.
    pub async fn get(&self, key: &VolumeKey) -> Option<Volume> {
        self.lock(key).await.ok().map(|lock| lock.volume().clone())
    }

    /// Snapshots of every volume, optionally limited to one namespace,
    /// ordered by key.
    pub async fn list(&self, namespace: Option<&str>) -> Vec<Volume> {
        let mut keys = self.keys();
        if let Some(ns) = namespace {
            keys.retain(|k| k.namespace == ns);
        }
        let mut volumes = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(volume) = self.get(&key).await {
                volumes.push(volume);
            }
        }
        volumes
    }

    /// Keys of every registered volume, ordered.
    pub fn keys(&self) -> Vec<VolumeKey> {
        let mut keys: Vec<VolumeKey> = self.slots.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

fn check_update_in_use(current: &Volume, update: &Volume) -> Result<(), VolumeError> {
    let reason = if current.plugin_id != update.plugin_id {
        Some("plugin id cannot change while claimed")
    } else if current.access_mode != update.access_mode {
        Some("access mode cannot change while claimed")
    } else if current.attachment_mode != update.attachment_mode {
        Some("attachment mode cannot change while claimed")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(VolumeError::VolumeInUse {
            volume: current.key(),
            reason: reason.to_owned(),
        }),
        None => Ok(()),
    }
}
