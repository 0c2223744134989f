//! Attached volume
//!
//! A volume owns two locks. The suspend lock is held shared by every
//! in-flight request and exclusively by an administrative suspend. The
//! state lock protects everything in [`VolumeState`] and is always taken
//! after the suspend lock, never before it.

use crate::backend::{DnodeHandle, IntentLog, Objset};
use crate::io::IoContext;
use crate::lockorder::{self, LockLevel};
use crate::minor::Presentation;
use crate::rangelock::RangeLock;
use crate::stats::IoStats;
use crate::suspend::SuspendLock;
use crate::zil::VolumeLogData;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use txvol_common::{VolMode, name_hash};

/// The open backing dataset of a volume
pub(crate) struct Backing {
    pub(crate) objset: Arc<dyn Objset>,
    pub(crate) dnode: DnodeHandle,
}

/// Mutable state of a volume, guarded by its state lock
pub struct VolumeState {
    pub(crate) name: String,
    pub(crate) hash: u64,
    pub(crate) volsize: u64,
    pub(crate) volblocksize: u64,
    pub(crate) open_count: u32,
    /// Character-device opens with the synchronous flag
    pub(crate) sync_opens: u32,
    pub(crate) read_only: bool,
    pub(crate) exclusive: bool,
    /// Set once the volume has left the registry
    pub(crate) removed: bool,
    pub(crate) volmode: VolMode,
    /// Present while open_count > 0, except inside a suspend
    pub(crate) backing: Option<Backing>,
    /// Ownership mode to restore when a suspended volume resumes
    pub(crate) owned_read_only: bool,
    /// Admitted asynchronous requests
    pub(crate) active: usize,
    /// Requests waiting for admission, oldest first
    pub(crate) deferred: VecDeque<Box<IoContext>>,
    pub(crate) presentation: Option<Arc<dyn Presentation>>,
}

impl VolumeState {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn volsize(&self) -> u64 {
        self.volsize
    }

    #[must_use]
    pub const fn volblocksize(&self) -> u64 {
        self.volblocksize
    }

    #[must_use]
    pub const fn open_count(&self) -> u32 {
        self.open_count
    }

    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        self.read_only
    }

    #[must_use]
    pub const fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Whether the backing dataset is currently owned
    #[must_use]
    pub const fn has_backing(&self) -> bool {
        self.backing.is_some()
    }

    #[must_use]
    pub const fn volmode(&self) -> VolMode {
        self.volmode
    }

    #[must_use]
    pub const fn active(&self) -> usize {
        self.active
    }

    #[must_use]
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.hash = name_hash(&name);
        self.name = name;
    }
}

/// Held state lock of a volume
pub struct StateGuard {
    guard: ArcMutexGuard<RawMutex, VolumeState>,
}

impl Deref for StateGuard {
    type Target = VolumeState;

    fn deref(&self) -> &VolumeState {
        &self.guard
    }
}

impl DerefMut for StateGuard {
    fn deref_mut(&mut self) -> &mut VolumeState {
        &mut self.guard
    }
}

impl Drop for StateGuard {
    fn drop(&mut self) {
        lockorder::released(LockLevel::State);
    }
}

/// Parameters of a newly attached volume
pub(crate) struct VolumeParams {
    pub(crate) name: String,
    pub(crate) volsize: u64,
    pub(crate) volblocksize: u64,
    pub(crate) read_only: bool,
    pub(crate) volmode: VolMode,
    pub(crate) presentation: Option<Arc<dyn Presentation>>,
}

/// An attached volume
pub struct Volume {
    state: Arc<Mutex<VolumeState>>,
    suspend: Arc<SuspendLock>,
    suspend_ref: AtomicU32,
    rangelock: RangeLock,
    log: Mutex<Option<Arc<dyn IntentLog>>>,
    stats: IoStats,
}

impl Volume {
    pub(crate) fn new(params: VolumeParams) -> Arc<Self> {
        let hash = name_hash(&params.name);
        Arc::new(Self {
            state: Arc::new(Mutex::new(VolumeState {
                name: params.name,
                hash,
                volsize: params.volsize,
                volblocksize: params.volblocksize,
                open_count: 0,
                sync_opens: 0,
                read_only: params.read_only,
                exclusive: false,
                removed: false,
                volmode: params.volmode,
                backing: None,
                owned_read_only: false,
                active: 0,
                deferred: VecDeque::new(),
                presentation: params.presentation,
            })),
            suspend: SuspendLock::new(),
            suspend_ref: AtomicU32::new(0),
            rangelock: RangeLock::new(),
            log: Mutex::new(None),
            stats: IoStats::new(),
        })
    }

    /// Take the state lock, blocking
    pub fn lock_state(&self) -> StateGuard {
        lockorder::before_blocking(LockLevel::State);
        let guard = self.state.lock_arc();
        lockorder::acquired(LockLevel::State);
        StateGuard { guard }
    }

    /// Take the state lock if it is free
    #[must_use]
    pub fn try_lock_state(&self) -> Option<StateGuard> {
        let guard = self.state.try_lock_arc()?;
        lockorder::acquired(LockLevel::State);
        Some(StateGuard { guard })
    }

    /// Current name
    #[must_use]
    pub fn name(&self) -> String {
        self.lock_state().name.clone()
    }

    /// The suspend lock
    #[must_use]
    pub const fn suspend_lock(&self) -> &Arc<SuspendLock> {
        &self.suspend
    }

    /// Outstanding suspends
    #[must_use]
    pub fn suspend_ref(&self) -> u32 {
        self.suspend_ref.load(Ordering::Acquire)
    }

    pub(crate) fn suspend_ref_inc(&self) {
        self.suspend_ref.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn suspend_ref_dec(&self) {
        self.suspend_ref.fetch_sub(1, Ordering::AcqRel);
    }

    /// Whether a destructive administrative operation must leave it alone
    #[must_use]
    pub fn is_in_use(&self, state: &VolumeState) -> bool {
        state.open_count > 0 || self.suspend_ref() > 0
    }

    /// Byte-range lock of the volume's data
    #[must_use]
    pub const fn range_lock(&self) -> &RangeLock {
        &self.rangelock
    }

    /// I/O counters
    #[must_use]
    pub const fn stats(&self) -> &IoStats {
        &self.stats
    }

    /// The intent log, if a write has opened it since the last open
    #[must_use]
    pub fn log(&self) -> Option<Arc<dyn IntentLog>> {
        self.log.lock().clone()
    }

    /// Open the intent log on first use.
    ///
    /// Callers hold the suspend lock shared, so the backing dataset cannot
    /// change underneath.
    pub(crate) fn ensure_log(
        self: &Arc<Self>,
        objset: &Arc<dyn Objset>,
        dnode: &DnodeHandle,
    ) -> Arc<dyn IntentLog> {
        let mut slot = self.log.lock();
        if let Some(log) = slot.as_ref() {
            return Arc::clone(log);
        }
        let provider = Arc::new(VolumeLogData::new(
            Arc::downgrade(self),
            Arc::clone(objset),
            dnode.clone(),
        ));
        let log = objset.open_log(provider);
        *slot = Some(Arc::clone(&log));
        log
    }

    /// Detach the intent log; returns it if it was open
    pub(crate) fn take_log(&self) -> Option<Arc<dyn IntentLog>> {
        self.log.lock().take()
    }
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("suspend_ref", &self.suspend_ref())
            .finish_non_exhaustive()
    }
}
