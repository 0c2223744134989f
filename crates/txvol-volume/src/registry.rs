//! Registry of attached volumes
//!
//! Volumes are bucketed by the hash of their name under one registry-wide
//! reader/writer lock. Structural changes (insert, remove, rename) take the
//! lock exclusively; lookups take it shared only while walking a bucket.
//! The registry never blocks on a volume's suspend lock while holding its
//! own lock: a lookup that cannot get the suspend lock immediately lets go
//! of everything, waits, and re-validates the match.

use crate::lockorder::{self, LockLevel};
use crate::suspend::{SuspendReadGuard, SuspendWriteGuard};
use crate::volume::{StateGuard, Volume};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use txvol_common::{Error, Result, name_hash};

/// Which suspend lock mode a lookup should also take
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuspendMode {
    None,
    Reader,
    Writer,
}

/// Suspend lock held by a lookup
#[derive(Debug)]
pub enum SuspendGuard {
    Read(SuspendReadGuard),
    Write(SuspendWriteGuard),
}

impl SuspendGuard {
    /// Stop tracking the guard for lock ordering
    pub fn detach(&mut self) {
        match self {
            Self::Read(g) => g.detach(),
            Self::Write(g) => g.detach(),
        }
    }
}

/// A volume returned by a lookup with its locks held.
///
/// Fields drop in declaration order, so the state lock is released before
/// the suspend lock.
pub struct LockedVolume {
    pub state: StateGuard,
    pub suspend: Option<SuspendGuard>,
    pub volume: Arc<Volume>,
}

type Buckets = HashMap<u64, Vec<Arc<Volume>>>;

/// Process-wide collection of attached volumes
#[derive(Default)]
pub struct VolumeRegistry {
    buckets: RwLock<Buckets>,
}

impl VolumeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RegistryRead<'_> {
        lockorder::before_blocking(LockLevel::Registry);
        let guard = self.buckets.read();
        lockorder::acquired(LockLevel::Registry);
        RegistryRead { guard }
    }

    /// Take the registry lock exclusively
    pub(crate) fn write(&self) -> RegistryWrite<'_> {
        lockorder::before_blocking(LockLevel::Registry);
        let guard = self.buckets.write();
        lockorder::acquired(LockLevel::Registry);
        RegistryWrite { guard }
    }

    /// Add a volume under its current name
    ///
    /// # Errors
    /// `Exists` if a volume of that name is already registered.
    pub fn insert(&self, volume: Arc<Volume>) -> Result<()> {
        let mut reg = self.write();
        let (name, hash) = {
            let state = volume.lock_state();
            (state.name.clone(), state.hash)
        };
        if reg.find(hash, &name).is_some() {
            return Err(Error::Exists(name));
        }
        reg.guard.entry(hash).or_default().push(volume);
        debug!(volume = %name, "registered volume");
        Ok(())
    }

    /// Remove a volume; returns false if it was not registered
    pub fn remove(&self, volume: &Arc<Volume>) -> bool {
        let mut reg = self.write();
        let mut state = volume.lock_state();
        reg.unlink(volume, &mut state)
    }

    /// Find a volume by name and return it with its state lock held, and
    /// with its suspend lock held in `mode` as well.
    #[must_use]
    pub fn find_by_name(&self, name: &str, mode: SuspendMode) -> Option<LockedVolume> {
        let hash = name_hash(name);
        loop {
            let reg = self.read();
            let (volume, state) = reg.find_locked(hash, name)?;

            let suspend = match mode {
                SuspendMode::None => None,
                SuspendMode::Reader => volume.suspend_lock().try_read().map(SuspendGuard::Read),
                SuspendMode::Writer => volume.suspend_lock().try_write().map(SuspendGuard::Write),
            };
            if mode == SuspendMode::None || suspend.is_some() {
                drop(reg);
                return Some(LockedVolume {
                    state,
                    suspend,
                    volume,
                });
            }

            // Contended: let go of everything before blocking
            drop(state);
            drop(reg);
            let suspend = match mode {
                SuspendMode::Reader => SuspendGuard::Read(volume.suspend_lock().read()),
                SuspendMode::Writer | SuspendMode::None => {
                    SuspendGuard::Write(volume.suspend_lock().write())
                }
            };
            let state = volume.lock_state();
            if !state.removed && state.hash == hash && state.name == name {
                return Some(LockedVolume {
                    state,
                    suspend: Some(suspend),
                    volume,
                });
            }
            // Renamed or removed while we waited
            drop(state);
            drop(suspend);
        }
    }

    /// Find a volume by name without keeping any lock
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Volume>> {
        let reg = self.read();
        reg.find_locked(name_hash(name), name).map(|(v, _)| v)
    }

    /// Every registered volume
    #[must_use]
    pub fn volumes(&self) -> Vec<Arc<Volume>> {
        let reg = self.read();
        reg.guard.values().flatten().cloned().collect()
    }

    /// Names of every registered volume, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.volumes().iter().map(|v| v.name()).collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().guard.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct RegistryRead<'a> {
    guard: RwLockReadGuard<'a, Buckets>,
}

impl RegistryRead<'_> {
    fn find_locked(&self, hash: u64, name: &str) -> Option<(Arc<Volume>, StateGuard)> {
        for volume in self.guard.get(&hash)? {
            let state = volume.lock_state();
            if state.hash == hash && state.name == name {
                return Some((Arc::clone(volume), state));
            }
        }
        None
    }
}

impl Drop for RegistryRead<'_> {
    fn drop(&mut self) {
        lockorder::released(LockLevel::Registry);
    }
}

/// Exclusive hold on the registry
pub(crate) struct RegistryWrite<'a> {
    guard: RwLockWriteGuard<'a, Buckets>,
}

impl RegistryWrite<'_> {
    fn find(&self, hash: u64, name: &str) -> Option<Arc<Volume>> {
        self.guard.get(&hash)?.iter().find_map(|volume| {
            let state = volume.lock_state();
            (state.name == name).then(|| Arc::clone(volume))
        })
    }

    /// Snapshot of every volume, for iteration while mutating
    pub(crate) fn volumes(&self) -> Vec<Arc<Volume>> {
        self.guard.values().flatten().cloned().collect()
    }

    /// Remove `volume`, whose state lock the caller holds
    pub(crate) fn unlink(&mut self, volume: &Arc<Volume>, state: &mut StateGuard) -> bool {
        let Some(bucket) = self.guard.get_mut(&state.hash) else {
            return false;
        };
        let before = bucket.len();
        bucket.retain(|v| !Arc::ptr_eq(v, volume));
        let removed = bucket.len() != before;
        if bucket.is_empty() {
            self.guard.remove(&state.hash);
        }
        if removed {
            state.removed = true;
        }
        removed
    }

    /// Rename `volume`, whose state lock the caller holds, and re-index it
    pub(crate) fn rename(&mut self, volume: &Arc<Volume>, state: &mut StateGuard, new_name: String) {
        if let Some(bucket) = self.guard.get_mut(&state.hash) {
            bucket.retain(|v| !Arc::ptr_eq(v, volume));
            if bucket.is_empty() {
                self.guard.remove(&state.hash);
            }
        }
        state.set_name(new_name);
        self.guard
            .entry(state.hash)
            .or_default()
            .push(Arc::clone(volume));
    }
}

impl Drop for RegistryWrite<'_> {
    fn drop(&mut self) {
        lockorder::released(LockLevel::Registry);
    }
}
