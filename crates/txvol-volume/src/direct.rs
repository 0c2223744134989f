//! Synchronous request paths
//!
//! Flush, discard and the character-device transfers run to completion on
//! the calling thread under a shared suspend lock. Flush and discard are
//! reached through triage, which takes that hold for them. None of them are
//! ever run on the worker queue: they block on range locks and log commits
//! that workers may need to make progress.

use crate::backend::{DnodeHandle, Objset, TxWait, VOLUME_OBJECT};
use crate::io::{Engine, IoOutcome};
use crate::manager::VolumeManager;
use crate::rangelock::RangeMode;
use crate::volume::Volume;
use crate::zil;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;
use txvol_common::{Error, Result};

/// Backing dataset and size captured under the state lock
struct Target {
    objset: Arc<dyn Objset>,
    dnode: DnodeHandle,
    volsize: u64,
    block_size: u64,
}

fn target(volume: &Volume, write: bool) -> Result<Target> {
    let state = volume.lock_state();
    let backing = state
        .backing
        .as_ref()
        .ok_or_else(|| Error::NoDevice(state.name.clone()))?;
    if write && state.read_only {
        return Err(Error::read_only(state.name.clone()));
    }
    Ok(Target {
        objset: Arc::clone(&backing.objset),
        dnode: backing.dnode.clone(),
        volsize: state.volsize,
        block_size: state.volblocksize,
    })
}

fn elapsed_us(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX)
}

impl Engine {
    /// Commit everything the volume has logged so far. The caller holds
    /// the suspend lock shared.
    pub(crate) fn flush(&self, volume: &Arc<Volume>) -> IoOutcome {
        if let Err(e) = target(volume, false) {
            return IoOutcome::failed(e);
        }
        if let Some(log) = volume.log() {
            log.commit(VOLUME_OBJECT);
            volume.stats().record_log_commit();
        }
        volume.stats().record_flush();
        IoOutcome::ok(0)
    }

    /// Free `[offset, offset + length)`, logging a truncate record. The
    /// caller holds the suspend lock shared.
    pub(crate) fn discard(
        &self,
        volume: &Arc<Volume>,
        offset: u64,
        length: u64,
        sync: bool,
    ) -> IoOutcome {
        if !self.config.unmap_enabled {
            return IoOutcome::failed(Error::NotSupported("discard is disabled".to_string()));
        }
        match Self::free(volume, offset, length, sync) {
            Ok(freed) => {
                volume.stats().record_discard();
                IoOutcome::ok(freed)
            }
            Err(e) => {
                volume.stats().record_error();
                IoOutcome::failed(e.into_device_error())
            }
        }
    }

    fn free(volume: &Arc<Volume>, offset: u64, length: u64, sync: bool) -> Result<u64> {
        let target = target(volume, true)?;
        if offset > target.volsize {
            return Err(Error::io(format!("discard at {offset} beyond end")));
        }
        let length = length.min(target.volsize - offset);
        if length == 0 {
            return Ok(0);
        }
        let sync = Self::effective_sync(target.objset.as_ref(), sync);
        let log = volume.ensure_log(&target.objset, &target.dnode);

        let range = volume.range_lock().enter(offset, length, RangeMode::Writer);
        let mut tx = target.objset.create_tx();
        tx.hold_free(VOLUME_OBJECT, offset, length);
        let result = match tx.assign(TxWait::Wait) {
            Err(e) => {
                tx.abort();
                Err(e)
            }
            Ok(()) => {
                zil::log_truncate(log.as_ref(), tx.as_ref(), offset, length, sync);
                tx.commit();
                target.objset.free_range(VOLUME_OBJECT, offset, length)
            }
        };
        drop(range);
        result?;

        if sync {
            log.commit(VOLUME_OBJECT);
            volume.stats().record_log_commit();
        }
        debug!(offset, length, sync, "discarded range");
        Ok(length)
    }

    /// Read up to `length` bytes at `offset` in chunks of `max_transfer`
    pub(crate) fn read_direct(&self, volume: &Arc<Volume>, offset: u64, length: u64) -> IoOutcome {
        let start = Instant::now();
        let _suspend = volume.suspend_lock().read();
        let target = match target(volume, false) {
            Ok(t) => t,
            Err(e) => return IoOutcome::failed(e),
        };
        if offset > target.volsize {
            return IoOutcome::failed(Error::io(format!("read at {offset} beyond end")));
        }
        let length = length.min(target.volsize - offset);
        let Ok(len) = usize::try_from(length) else {
            return IoOutcome::failed(Error::Overflow(length.to_string()));
        };

        let range = volume.range_lock().enter(offset, length, RangeMode::Reader);
        let mut buf = vec![0u8; len];
        let mut done = 0usize;
        let mut error = None;
        let chunk = usize::try_from(self.config.max_transfer).unwrap_or(usize::MAX);
        while done < len {
            let n = chunk.min(len - done);
            match target
                .objset
                .read(&target.dnode, offset + done as u64, &mut buf[done..done + n])
            {
                Ok(()) => done += n,
                Err(e) => {
                    error = Some(e.into_device_error());
                    break;
                }
            }
        }
        drop(range);

        buf.truncate(done);
        if error.is_some() {
            volume.stats().record_error();
        } else {
            volume.stats().record_read(done as u64, elapsed_us(start));
        }
        IoOutcome {
            completed: done as u64,
            data: Some(Bytes::from(buf)),
            error,
        }
    }

    /// Write `data` at `offset`, one transaction per `max_transfer` chunk
    pub(crate) fn write_direct(
        &self,
        volume: &Arc<Volume>,
        offset: u64,
        data: &Bytes,
        sync: bool,
    ) -> IoOutcome {
        let start = Instant::now();
        let _suspend = volume.suspend_lock().read();
        let target = match target(volume, true) {
            Ok(t) => t,
            Err(e) => return IoOutcome::failed(e),
        };
        if offset > target.volsize {
            return IoOutcome::failed(Error::io(format!("write at {offset} beyond end")));
        }
        let length = (data.len() as u64).min(target.volsize - offset);
        if length == 0 {
            return IoOutcome::ok(0);
        }
        let sync = Self::effective_sync(target.objset.as_ref(), sync);
        let log = volume.ensure_log(&target.objset, &target.dnode);

        let range = volume.range_lock().enter(offset, length, RangeMode::Writer);
        let mut done = 0u64;
        let mut error = None;
        while done < length {
            let n = self.config.max_transfer.min(length - done);
            #[allow(clippy::cast_possible_truncation)]
            let chunk = data.slice(done as usize..(done + n) as usize);
            let pos = offset + done;

            let mut tx = target.objset.create_tx();
            tx.hold_write(VOLUME_OBJECT, pos, n);
            if let Err(e) = tx.assign(TxWait::Wait) {
                tx.abort();
                error = Some(e);
                break;
            }
            let result = target.objset.write(&target.dnode, pos, &chunk, tx.as_ref());
            if result.is_ok() {
                zil::log_write(
                    log.as_ref(),
                    target.objset.as_ref(),
                    tx.as_ref(),
                    pos,
                    &chunk,
                    target.block_size,
                    sync,
                    self.config.immediate_write_size,
                );
            }
            tx.commit();
            if let Err(e) = result {
                error = Some(e.into_device_error());
                break;
            }
            done += n;
        }
        drop(range);

        if sync && done > 0 {
            log.commit(VOLUME_OBJECT);
            volume.stats().record_log_commit();
        }
        if error.is_some() {
            volume.stats().record_error();
        } else {
            volume.stats().record_write(done, elapsed_us(start));
        }
        IoOutcome {
            completed: done,
            data: None,
            error,
        }
    }
}

impl VolumeManager {
    /// Character-device read; blocks the calling thread.
    ///
    /// On a device error the outcome carries the bytes read before it.
    #[must_use]
    pub fn read_direct(&self, volume: &Arc<Volume>, offset: u64, length: u64) -> IoOutcome {
        self.engine().read_direct(volume, offset, length)
    }

    /// Character-device write; blocks the calling thread.
    ///
    /// On a device error the outcome carries the bytes written before it.
    #[must_use]
    pub fn write_direct(&self, volume: &Arc<Volume>, offset: u64, data: &Bytes, sync: bool) -> IoOutcome {
        self.engine().write_direct(volume, offset, data, sync)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::IoRequest;
    use crate::lifecycle::OpenFlags;
    use crate::memstore::MemPool;
    use crate::minor::RecordingFactory;
    use txvol_common::{SyncPolicy, VolumeConfig};

    fn setup(config: VolumeConfig) -> (MemPool, Arc<VolumeManager>, Arc<Volume>) {
        let pool = MemPool::new("p", 1 << 30);
        pool.create_volume("p/v", 1 << 20, 4096).unwrap();
        let manager = VolumeManager::new(
            config,
            Arc::new(pool.clone()),
            Arc::new(RecordingFactory::new()),
        )
        .unwrap();
        manager.create_minor("p/v").unwrap();
        manager.open("p/v", OpenFlags::read_write()).unwrap();
        let volume = manager.volume("p/v").unwrap();
        (pool, manager, volume)
    }

    #[test]
    fn test_direct_transfer_in_chunks() {
        let config = VolumeConfig {
            max_transfer: 4096,
            ..VolumeConfig::default()
        };
        let (pool, manager, volume) = setup(config);
        let data = Bytes::from((0..20_000u32).map(|i| (i % 199) as u8).collect::<Vec<_>>());

        let outcome = manager.write_direct(&volume, 1000, &data, false);
        assert!(outcome.is_ok());
        assert_eq!(outcome.completed, 20_000);
        // One transaction and one copied record per chunk
        assert_eq!(pool.volatile_records("p/v").len(), 5);

        let outcome = manager.read_direct(&volume, 1000, 20_000);
        assert_eq!(outcome.data.unwrap(), data);
    }

    #[test]
    fn test_direct_bounds() {
        let (_pool, manager, volume) = setup(VolumeConfig::default());
        let end = 1 << 20;
        let eof = manager.read_direct(&volume, end, 100);
        assert!(eof.is_ok());
        assert_eq!(eof.completed, 0);

        let past = manager.read_direct(&volume, end + 1, 100);
        assert!(matches!(past.error, Some(Error::Io(_))));

        let short = manager.write_direct(&volume, end - 10, &Bytes::from(vec![1u8; 100]), false);
        assert_eq!(short.completed, 10);
    }

    #[test]
    fn test_direct_sync_commits_once() {
        let config = VolumeConfig {
            max_transfer: 4096,
            ..VolumeConfig::default()
        };
        let (pool, manager, volume) = setup(config);
        let outcome = manager.write_direct(&volume, 0, &Bytes::from(vec![2u8; 3 * 4096]), true);
        assert!(outcome.is_ok());
        assert_eq!(volume.stats().log_commits(), 1);
        assert_eq!(pool.durable_records("p/v").len(), 3);
    }

    #[test]
    fn test_direct_read_stops_at_bad_chunk() {
        let config = VolumeConfig {
            max_transfer: 4096,
            ..VolumeConfig::default()
        };
        let (pool, manager, volume) = setup(config);
        assert!(manager.write_direct(&volume, 0, &Bytes::from(vec![5u8; 3 * 4096]), false).is_ok());
        pool.corrupt_block("p/v", 8192).unwrap();

        let outcome = manager.read_direct(&volume, 0, 3 * 4096);
        assert!(matches!(outcome.error, Some(Error::Io(_))));
        assert_eq!(outcome.completed, 8192);
        assert_eq!(outcome.data.unwrap().len(), 8192);
    }

    #[test]
    fn test_discard_logs_truncate_and_frees() {
        let (pool, manager, volume) = setup(VolumeConfig::default());
        assert!(manager.write_direct(&volume, 0, &Bytes::from(vec![7u8; 8192]), false).is_ok());

        let outcome = manager.submit_wait(
            &volume,
            IoRequest::Discard {
                offset: 0,
                length: 4096,
                sync: true,
            },
        );
        assert!(outcome.is_ok());
        assert_eq!(outcome.completed, 4096);
        let durable = pool.durable_records("p/v");
        assert!(matches!(
            durable.last().map(|r| &r.payload),
            Some(crate::backend::LogPayload::Truncate { offset: 0, length: 4096 })
        ));
        let data = manager.read_direct(&volume, 0, 8192).data.unwrap();
        assert!(data[..4096].iter().all(|&b| b == 0));
        assert!(data[4096..].iter().all(|&b| b == 7));
    }

    #[test]
    fn test_discard_disabled() {
        let config = VolumeConfig {
            unmap_enabled: false,
            ..VolumeConfig::default()
        };
        let (_pool, manager, volume) = setup(config);
        let outcome = manager.submit_wait(
            &volume,
            IoRequest::Discard {
                offset: 0,
                length: 4096,
                sync: false,
            },
        );
        assert!(matches!(outcome.error, Some(Error::NotSupported(_))));
    }

    #[test]
    fn test_flush_makes_async_writes_durable() {
        let (pool, manager, volume) = setup(VolumeConfig::default());
        assert!(manager.write_direct(&volume, 0, &Bytes::from(vec![1u8; 512]), false).is_ok());
        assert_eq!(pool.durable_records("p/v").len(), 0);
        assert!(manager.submit_wait(&volume, IoRequest::Flush).is_ok());
        assert_eq!(pool.durable_records("p/v").len(), 1);
    }

    #[test]
    fn test_sync_disabled_skips_commit() {
        let (pool, manager, volume) = setup(VolumeConfig::default());
        pool.set_sync_policy("p/v", SyncPolicy::Disabled).unwrap();
        assert!(manager.write_direct(&volume, 0, &Bytes::from(vec![1u8; 512]), true).is_ok());
        assert_eq!(volume.stats().log_commits(), 0);
        assert_eq!(pool.durable_records("p/v").len(), 0);
    }
}
