//! Volume size and block size
//!
//! The size lives in the `"size"` entry of the properties object and is
//! changed transactionally. After the new size is synced, everything past
//! it is freed so a later grow reads zeros.

use crate::backend::{Objset, PROPS_OBJECT, SIZE_KEY, TO_END, TxWait, VOLUME_OBJECT};
use crate::manager::VolumeManager;
use crate::registry::SuspendMode;
use std::sync::Arc;
use tracing::info;
use txvol_common::{DatasetProp, Error, Result, VolumeConfig};

/// Smallest block size the store supports
pub const MIN_BLOCK_SIZE: u64 = 512;

/// Largest block size the store supports
pub const MAX_BLOCK_SIZE: u64 = 16 * 1024 * 1024;

/// Block sizes above this need the large-blocks pool feature
pub const OLD_MAX_BLOCK_SIZE: u64 = 128 * 1024;

/// Last addressable byte of a device on 32-bit hosts
const MAX_OFFSET_32: u64 = (1 << 40) - 1;

/// Check that `volsize` is usable with blocks of `blocksize` bytes
///
/// # Errors
/// `InvalidArgument` for a zero or unaligned size, `Overflow` when the
/// host cannot address it.
pub fn check_volsize(volsize: u64, blocksize: u64) -> Result<()> {
    if volsize == 0 {
        return Err(Error::invalid_argument("volume size must be non-zero"));
    }
    if blocksize == 0 || volsize % blocksize != 0 {
        return Err(Error::invalid_argument(format!(
            "volume size {volsize} is not a multiple of the block size {blocksize}"
        )));
    }
    if usize::BITS < 64 && volsize - 1 > MAX_OFFSET_32 {
        return Err(Error::Overflow(format!("volume size {volsize}")));
    }
    Ok(())
}

/// Check a block size against the store's limits and the pool's features
///
/// # Errors
/// - `InvalidArgument` outside `[512, 16M]` or not a power of two
/// - `NotSupported` above 128K without the large-blocks feature
/// - `Domain` above the maximum record size
pub fn check_volblocksize(config: &VolumeConfig, blocksize: u64) -> Result<()> {
    if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&blocksize) || !blocksize.is_power_of_two() {
        return Err(Error::invalid_argument(format!(
            "block size {blocksize} must be a power of two between {MIN_BLOCK_SIZE} and {MAX_BLOCK_SIZE}"
        )));
    }
    if blocksize > OLD_MAX_BLOCK_SIZE {
        if !config.large_blocks {
            return Err(Error::NotSupported(format!(
                "block size {blocksize} needs the large_blocks feature"
            )));
        }
        if blocksize > config.max_recordsize {
            return Err(Error::Domain {
                size: blocksize,
                max: config.max_recordsize,
            });
        }
    }
    Ok(())
}

/// Persist `volsize`, wait for it to sync, and free everything past it
fn update_volsize(objset: &dyn Objset, volsize: u64) -> Result<()> {
    let mut tx = objset.create_tx();
    tx.hold_zap(PROPS_OBJECT, SIZE_KEY);
    tx.hold_free(VOLUME_OBJECT, volsize, TO_END);
    if let Err(e) = tx.assign(TxWait::Wait) {
        tx.abort();
        return Err(e);
    }
    let txg = tx.txg();
    let result = objset.zap_update(PROPS_OBJECT, SIZE_KEY, volsize, tx.as_ref());
    tx.commit();
    result?;
    objset.wait_synced(txg);
    objset.free_range(VOLUME_OBJECT, volsize, TO_END)
}

impl VolumeManager {
    /// Change the size of a volume, attached or not
    ///
    /// # Errors
    /// - `ReadOnly` when the dataset's `readonly` property is set
    /// - `InvalidArgument` or `Overflow` from [`check_volsize`]
    /// - `NotFound` if there is no such dataset
    pub fn resize(&self, name: &str, volsize: u64) -> Result<()> {
        if self.store.get_prop(name, DatasetProp::ReadOnly)? != 0 {
            return Err(Error::read_only(name));
        }

        let mut locked = self.registry.find_by_name(name, SuspendMode::Reader);
        let open = locked
            .as_ref()
            .and_then(|l| l.state.backing.as_ref().map(|b| Arc::clone(&b.objset)));
        let (objset, owned) = match open {
            Some(objset) => (objset, false),
            None => (self.store.own(name, false)?, true),
        };

        let result = objset
            .object_block_size(VOLUME_OBJECT)
            .and_then(|blocksize| check_volsize(volsize, blocksize))
            .and_then(|()| update_volsize(objset.as_ref(), volsize));
        if owned {
            self.store.disown(objset);
        }
        result?;

        if let Some(locked) = locked.as_mut() {
            let old = locked.state.volsize;
            locked.state.volsize = volsize;
            if old != 0 {
                if let Some(presentation) = &locked.state.presentation {
                    presentation.resize(volsize);
                }
            }
        }
        info!(volume = name, volsize, "resized volume");
        Ok(())
    }

    /// Change the block size of an open volume that holds no data yet
    ///
    /// # Errors
    /// - `NoDevice` if it is not attached or not open
    /// - `ReadOnly` if it is read-only
    /// - `Busy` if the store refuses because data was already written
    /// - anything [`check_volblocksize`] rejects
    pub fn set_volblocksize(&self, name: &str, blocksize: u64) -> Result<()> {
        check_volblocksize(&self.config, blocksize)?;
        let mut locked = self
            .registry
            .find_by_name(name, SuspendMode::Reader)
            .ok_or_else(|| Error::NoDevice(name.to_string()))?;
        let state = &mut locked.state;
        if state.read_only {
            return Err(Error::read_only(name));
        }
        let Some(backing) = state.backing.as_mut() else {
            return Err(Error::NoDevice(name.to_string()));
        };

        let mut tx = backing.objset.create_tx();
        tx.hold_write(VOLUME_OBJECT, 0, 0);
        if let Err(e) = tx.assign(TxWait::Wait) {
            tx.abort();
            return Err(e);
        }
        let result = backing
            .objset
            .set_block_size(VOLUME_OBJECT, blocksize, tx.as_ref());
        tx.commit();
        match result {
            Err(Error::NotSupported(_)) => Err(Error::busy(name)),
            Err(e) => Err(e),
            Ok(()) => {
                backing.dnode.block_size = blocksize;
                state.volblocksize = blocksize;
                info!(volume = name, blocksize, "changed block size");
                Ok(())
            }
        }
    }
}
