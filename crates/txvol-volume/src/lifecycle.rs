//! Open, close, suspend and resume
//!
//! The backing dataset of a volume is owned from the first open to the
//! last close. Both transitions happen with the suspend lock held shared
//! and the state lock held, so they never race a suspend. A suspend takes
//! the suspend lock exclusively, which waits for every in-flight request,
//! then releases the backing dataset while keeping the open count. The
//! matching resume re-owns it.

use crate::backend::{Objset, PROPS_OBJECT, SIZE_KEY, VOLUME_OBJECT};
use crate::manager::VolumeManager;
use crate::registry::{LockedVolume, SuspendGuard, SuspendMode};
use crate::suspend::{SuspendReadGuard, SuspendWriteGuard};
use crate::volume::{Backing, StateGuard, Volume, VolumeState};
use std::sync::Arc;
use tracing::{debug, info, warn};
use txvol_common::{DatasetProp, Error, Result, is_snapshot};

/// How a volume is being opened or closed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenFlags {
    pub write: bool,
    /// Exclusive access; only valid for a single open
    pub exclusive: bool,
    /// Character-device open with the synchronous flag
    pub sync: bool,
    /// Number of opens this call stands for
    pub count: u32,
}

impl OpenFlags {
    #[must_use]
    pub const fn read_only() -> Self {
        Self {
            write: false,
            exclusive: false,
            sync: false,
            count: 1,
        }
    }

    #[must_use]
    pub const fn read_write() -> Self {
        Self {
            write: true,
            ..Self::read_only()
        }
    }

    #[must_use]
    pub const fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    #[must_use]
    pub const fn sync(mut self) -> Self {
        self.sync = true;
        self
    }

    #[must_use]
    pub const fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }
}

/// Proof of a suspend; hand it back to [`VolumeManager::resume`].
///
/// Holds the volume's suspend lock exclusively until then.
#[must_use = "a suspended volume stays suspended until the token is resumed"]
pub struct SuspendToken {
    volume: Arc<Volume>,
    guard: SuspendWriteGuard,
}

impl SuspendToken {
    #[must_use]
    pub const fn volume(&self) -> &Arc<Volume> {
        &self.volume
    }
}

impl std::fmt::Debug for SuspendToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuspendToken")
            .field("volume", &self.volume)
            .finish_non_exhaustive()
    }
}

/// Take the suspend lock shared ahead of an open-count transition.
///
/// The state lock is already held, so only a try is allowed; when it fails
/// everything is dropped, the suspend lock is taken blocking, and the state
/// re-read. The guard is kept only if `transition` still applies.
fn lock_for_transition(
    volume: &Arc<Volume>,
    state: StateGuard,
    transition: impl Fn(&VolumeState) -> bool,
) -> Result<(Option<SuspendReadGuard>, StateGuard)> {
    if !transition(&state) {
        return Ok((None, state));
    }
    if let Some(guard) = volume.suspend_lock().try_read() {
        return Ok((Some(guard), state));
    }
    let name = state.name.clone();
    drop(state);
    let guard = volume.suspend_lock().read();
    let state = volume.lock_state();
    if state.removed || state.name != name {
        return Err(Error::not_found(name));
    }
    let guard = transition(&state).then_some(guard);
    Ok((guard, state))
}

impl VolumeManager {
    /// Open an attached volume
    ///
    /// # Errors
    /// - `NotFound` if it is not attached or its dataset is gone
    /// - `ReadOnly` for a write open of a read-only volume
    /// - `Busy` on an exclusive-access conflict
    /// - `InvalidArgument` for an exclusive open with a count other than 1
    pub fn open(&self, name: &str, flags: OpenFlags) -> Result<()> {
        if flags.exclusive && flags.count != 1 {
            return Err(Error::invalid_argument("exclusive open must have count 1"));
        }
        let LockedVolume { state, volume, .. } = self
            .registry
            .find_by_name(name, SuspendMode::None)
            .ok_or_else(|| Error::not_found(name))?;
        let (_suspend, mut state) = lock_for_transition(&volume, state, |s| s.open_count == 0)?;

        let first = state.open_count == 0;
        if first {
            self.first_open(&mut state, !flags.write)?;
        }
        if let Err(e) = Self::check_open(&state, flags) {
            if state.open_count == 0 {
                self.last_close(&volume, &mut state);
            }
            return Err(e);
        }

        state.open_count += flags.count;
        if flags.exclusive {
            state.exclusive = true;
        }
        if flags.sync {
            state.sync_opens += 1;
            if state.sync_opens == 1 {
                if let Some(log) = volume.log() {
                    log.async_to_sync(VOLUME_OBJECT);
                }
            }
        }
        debug!(volume = %state.name, open_count = state.open_count, "opened");
        Ok(())
    }

    fn check_open(state: &VolumeState, flags: OpenFlags) -> Result<()> {
        if flags.write && state.read_only {
            return Err(Error::read_only(state.name.clone()));
        }
        if state.exclusive {
            return Err(Error::busy(format!("{} is open exclusively", state.name)));
        }
        if flags.exclusive && state.open_count != 0 {
            return Err(Error::busy(format!("{} is already open", state.name)));
        }
        Ok(())
    }

    /// Close one open of a volume
    ///
    /// # Errors
    /// `NotFound` if it is not attached, `InvalidArgument` if it is not open.
    pub fn close(&self, name: &str, flags: OpenFlags) -> Result<()> {
        let LockedVolume { state, volume, .. } = self
            .registry
            .find_by_name(name, SuspendMode::None)
            .ok_or_else(|| Error::not_found(name))?;
        let count = flags.count;
        let (_suspend, mut state) =
            lock_for_transition(&volume, state, |s| s.open_count == count)?;
        if state.open_count < count {
            return Err(Error::invalid_argument(format!("{name} is not open")));
        }

        state.exclusive = false;
        state.open_count -= count;
        if flags.sync {
            state.sync_opens = state.sync_opens.saturating_sub(1);
        }
        if state.open_count == 0 {
            self.last_close(&volume, &mut state);
        }
        debug!(volume = %state.name, open_count = state.open_count, "closed");
        Ok(())
    }

    fn first_open(&self, state: &mut VolumeState, read_only: bool) -> Result<()> {
        let ro = read_only || is_snapshot(&state.name);
        let objset = self.store.own(&state.name, ro)?;
        if let Err(e) = self.setup_backing(state, &objset) {
            self.store.disown(objset);
            return Err(e);
        }
        state.owned_read_only = ro;
        Ok(())
    }

    fn last_close(&self, volume: &Volume, state: &mut VolumeState) {
        state.exclusive = false;
        state.sync_opens = 0;
        if let Some(objset) = Self::shutdown_backing(volume, state) {
            self.store.disown(objset);
        }
    }

    /// Read size, block size and read-only state from an owned dataset
    fn setup_backing(&self, state: &mut VolumeState, objset: &Arc<dyn Objset>) -> Result<()> {
        let readonly_prop = self.store.get_prop(&state.name, DatasetProp::ReadOnly)? != 0;
        let volsize = objset.zap_lookup(PROPS_OBJECT, SIZE_KEY)?;
        let dnode = objset.hold_object(VOLUME_OBJECT)?;
        state.volsize = volsize;
        state.volblocksize = dnode.block_size;
        state.read_only = readonly_prop || objset.is_snapshot() || !objset.pool_writeable();
        state.backing = Some(Backing {
            objset: Arc::clone(objset),
            dnode,
        });
        Ok(())
    }

    /// Close the log and release the backing object, returning the dataset
    /// for the caller to disown.
    ///
    /// If anything was logged since the open, waits for the pool to sync so
    /// nothing committed only to the log is lost.
    fn shutdown_backing(volume: &Volume, state: &mut VolumeState) -> Option<Arc<dyn Objset>> {
        let Backing { objset, dnode } = state.backing.take()?;
        let log = volume.take_log();
        if let Some(log) = &log {
            log.close();
        }
        objset.release_object(dnode);
        if log.is_some() {
            objset.wait_synced(0);
        }
        objset.evict_cached();
        Some(objset)
    }

    /// Quiesce a volume and release its backing dataset.
    ///
    /// Waits for every in-flight request. New requests and opens block
    /// until the token is passed to [`resume`](Self::resume).
    ///
    /// # Errors
    /// `NotFound` if no volume of that name is attached.
    pub fn suspend(&self, name: &str) -> Result<SuspendToken> {
        let LockedVolume {
            mut state,
            suspend,
            volume,
        } = self
            .registry
            .find_by_name(name, SuspendMode::Writer)
            .ok_or_else(|| Error::not_found(name))?;
        let Some(SuspendGuard::Write(mut guard)) = suspend else {
            return Err(Error::internal("suspend lookup without writer lock"));
        };

        volume.suspend_ref_inc();
        if state.open_count > 0 {
            if let Some(objset) = Self::shutdown_backing(&volume, &mut state) {
                self.store.disown(objset);
            }
        }
        info!(volume = %state.name, open_count = state.open_count, "suspended");
        drop(state);
        // Released by resume, possibly on another thread
        guard.detach();
        Ok(SuspendToken { volume, guard })
    }

    /// Re-own the backing dataset of a suspended volume and let I/O flow.
    ///
    /// The suspend is released even when re-owning fails; the volume then
    /// stays open without a backing dataset and requests fail with
    /// `NoDevice` until it is closed.
    ///
    /// # Errors
    /// Failures re-owning or re-reading the dataset.
    pub fn resume(&self, token: SuspendToken) -> Result<()> {
        let SuspendToken { volume, guard } = token;
        let mut state = volume.lock_state();
        let mut result = Ok(());
        if state.open_count > 0 && state.backing.is_none() {
            result = self
                .store
                .own(&state.name, state.owned_read_only)
                .and_then(|objset| {
                    self.setup_backing(&mut state, &objset).inspect_err(|_| {
                        self.store.disown(Arc::clone(&objset));
                    })
                });
            if let Err(e) = &result {
                warn!(volume = %state.name, error = %e, "cannot re-open volume after suspend");
            }
        }
        info!(volume = %state.name, "resumed");
        drop(state);
        volume.suspend_ref_dec();
        drop(guard);
        result
    }
}
