//! Intent log glue
//!
//! Writes and discards append records to the dataset's intent log inside
//! the same transaction that applies them. After a crash the records that
//! were committed but not yet checkpointed are replayed at attach time.
//!
//! Replay is idempotent: every record describes absolute content (bytes at
//! an offset, or a freed range), so applying a record twice leaves the same
//! data as applying it once.

use crate::backend::{
    DnodeHandle, IntentLog, LogDataProvider, LogPayload, LogRecord, Objset, ReplayHandler,
    TxWait, VOLUME_OBJECT, WriteState,
};
use crate::rangelock::RangeMode;
use crate::volume::Volume;
use bytes::Bytes;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};
use txvol_common::{Error, LogBias, Result};

/// Choose how a write of `length` bytes reaches the log.
///
/// Large block-aligned writes on pools without a separate log device are
/// written in place and logged by reference; everything else is copied,
/// immediately when the write is synchronous, at commit time otherwise.
#[must_use]
pub fn write_state(
    objset: &dyn Objset,
    length: u64,
    block_size: u64,
    sync: bool,
    immediate_write_size: u64,
) -> WriteState {
    let indirect = objset.log_bias() == LogBias::Throughput
        || (!objset.has_log_device() && length >= block_size && block_size > immediate_write_size);
    if indirect {
        WriteState::Indirect
    } else if sync {
        WriteState::Copied
    } else {
        WriteState::NeedCopy
    }
}

/// Append write records for `data` written at `offset`.
///
/// Indirect records never straddle a block boundary; copied records too
/// large for the log fall back to being copied at commit time.
#[allow(clippy::too_many_arguments)]
pub fn log_write(
    log: &dyn IntentLog,
    objset: &dyn Objset,
    tx: &dyn crate::backend::Transaction,
    offset: u64,
    data: &Bytes,
    block_size: u64,
    sync: bool,
    immediate_write_size: u64,
) {
    if log.is_replaying() {
        return;
    }
    let size = data.len() as u64;
    let state = write_state(objset, size, block_size, sync, immediate_write_size);

    let mut done = 0u64;
    while done < size {
        let off = offset + done;
        let len = match state {
            WriteState::Indirect => (block_size - off % block_size).min(size - done),
            _ => size - done,
        };
        let mut record_state = state;
        if record_state == WriteState::Copied && len > log.max_copied_data() {
            record_state = WriteState::NeedCopy;
        }
        #[allow(clippy::cast_possible_truncation)]
        let payload_data = (record_state == WriteState::Copied)
            .then(|| data.slice(done as usize..(done + len) as usize));

        log.append(
            LogRecord {
                object: VOLUME_OBJECT,
                sync,
                payload: LogPayload::Write {
                    offset: off,
                    length: len,
                    state: record_state,
                    block_size,
                    data: payload_data,
                },
            },
            tx,
        );
        done += len;
    }
}

/// Append a record freeing `[offset, offset + length)`
pub fn log_truncate(
    log: &dyn IntentLog,
    tx: &dyn crate::backend::Transaction,
    offset: u64,
    length: u64,
    sync: bool,
) {
    if log.is_replaying() {
        return;
    }
    log.append(
        LogRecord {
            object: VOLUME_OBJECT,
            sync,
            payload: LogPayload::Truncate { offset, length },
        },
        tx,
    );
}

/// Serves the data of records logged by reference
pub(crate) struct VolumeLogData {
    volume: Weak<Volume>,
    objset: Arc<dyn Objset>,
    dnode: DnodeHandle,
}

impl VolumeLogData {
    pub(crate) fn new(volume: Weak<Volume>, objset: Arc<dyn Objset>, dnode: DnodeHandle) -> Self {
        Self {
            volume,
            objset,
            dnode,
        }
    }
}

impl LogDataProvider for VolumeLogData {
    fn get_data(&self, record: &LogRecord) -> Result<Bytes> {
        let LogPayload::Write {
            offset,
            length,
            state,
            block_size,
            data,
        } = &record.payload
        else {
            return Err(Error::internal("get_data on a non-write record"));
        };
        let volume = self
            .volume
            .upgrade()
            .ok_or_else(|| Error::NoDevice(self.objset.name()))?;

        let (start, len) = match state {
            WriteState::Copied => {
                return data
                    .clone()
                    .ok_or_else(|| Error::internal("copied record without data"));
            }
            WriteState::NeedCopy => (*offset, *length),
            WriteState::Indirect => (*offset - *offset % *block_size, *block_size),
        };

        let _range = volume.range_lock().enter(start, len, RangeMode::Reader);
        let mut buf = vec![0u8; usize::try_from(len).map_err(|_| Error::Overflow(len.to_string()))?];
        self.objset.read(&self.dnode, start, &mut buf)?;
        Ok(Bytes::from(buf))
    }
}

/// Replay dispatch for volume log records
pub(crate) struct ReplayVector<'a> {
    objset: &'a dyn Objset,
    dnode: &'a DnodeHandle,
    volsize: u64,
}

impl<'a> ReplayVector<'a> {
    pub(crate) const fn new(objset: &'a dyn Objset, dnode: &'a DnodeHandle, volsize: u64) -> Self {
        Self {
            objset,
            dnode,
            volsize,
        }
    }

    fn replay_write(
        &self,
        offset: u64,
        length: u64,
        state: WriteState,
        block_size: u64,
        data: Option<&Bytes>,
    ) -> Result<()> {
        let data = data.ok_or_else(|| Error::io("write record without data"))?;

        // A record pointing at an in-place block rewrites the whole block
        let (mut offset, mut data) = (offset, data.clone());
        if state == WriteState::Indirect && length < block_size && data.len() as u64 == block_size {
            offset -= offset % block_size;
        } else {
            #[allow(clippy::cast_possible_truncation)]
            let keep = (length as usize).min(data.len());
            data = data.slice(..keep);
        }

        if offset >= self.volsize {
            return Ok(());
        }
        #[allow(clippy::cast_possible_truncation)]
        let keep = ((self.volsize - offset) as usize).min(data.len());
        let data = data.slice(..keep);

        let mut tx = self.objset.create_tx();
        tx.hold_write(VOLUME_OBJECT, offset, data.len() as u64);
        if let Err(e) = tx.assign(TxWait::Wait) {
            tx.abort();
            return Err(e);
        }
        let result = self.objset.write(self.dnode, offset, &data, tx.as_ref());
        tx.commit();
        result
    }

    fn replay_truncate(&self, offset: u64, length: u64) -> Result<()> {
        self.objset.free_range(VOLUME_OBJECT, offset, length)
    }
}

impl ReplayHandler for ReplayVector<'_> {
    fn replay(&self, record: &LogRecord) -> Result<()> {
        match &record.payload {
            LogPayload::Write {
                offset,
                length,
                state,
                block_size,
                data,
            } => {
                debug!(offset, length, ?state, "replaying write");
                self.replay_write(*offset, *length, *state, *block_size, data.as_ref())
            }
            LogPayload::Truncate { offset, length } => {
                debug!(offset, length, "replaying truncate");
                self.replay_truncate(*offset, *length)
            }
            LogPayload::Other { txtype } => {
                warn!(txtype, "unsupported log record type");
                Err(Error::NotSupported(format!("log record type {txtype}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ObjectStore, PROPS_OBJECT, SIZE_KEY};
    use crate::memstore::MemPool;
    use txvol_common::SyncPolicy;

    fn pool_with_volume(block_size: u64) -> (MemPool, Arc<dyn Objset>) {
        let pool = MemPool::new("p", 1 << 30);
        pool.create_volume("p/v", 1 << 20, block_size).unwrap();
        let os = pool.own("p/v", false).unwrap();
        (pool, os)
    }

    #[test]
    fn test_write_state_policy() {
        let (pool, os) = pool_with_volume(64 * 1024);
        // Large aligned write without a log device: written in place
        assert_eq!(write_state(&*os, 64 * 1024, 64 * 1024, true, 32 * 1024), WriteState::Indirect);
        // Small writes are copied now or later depending on sync
        assert_eq!(write_state(&*os, 512, 64 * 1024, true, 32 * 1024), WriteState::Copied);
        assert_eq!(write_state(&*os, 512, 64 * 1024, false, 32 * 1024), WriteState::NeedCopy);

        pool.set_log_bias("p/v", LogBias::Throughput).unwrap();
        assert_eq!(write_state(&*os, 512, 64 * 1024, true, 32 * 1024), WriteState::Indirect);

        pool.set_log_bias("p/v", LogBias::Latency).unwrap();
        pool.set_log_device(true);
        assert_eq!(write_state(&*os, 64 * 1024, 64 * 1024, true, 32 * 1024), WriteState::Copied);
    }

    #[test]
    fn test_indirect_records_split_per_block() {
        let (pool, os) = pool_with_volume(64 * 1024);
        let log = os.open_log(Arc::new(NoData));
        let mut tx = os.create_tx();
        tx.assign(TxWait::Wait).unwrap();
        let data = Bytes::from(vec![7u8; 3 * 64 * 1024]);
        log_write(&*log, &*os, tx.as_ref(), 32 * 1024, &data, 64 * 1024, true, 32 * 1024);
        tx.commit();

        let records = pool.volatile_records("p/v");
        let lengths: Vec<u64> = records
            .iter()
            .map(|r| match r.payload {
                LogPayload::Write { length, .. } => length,
                _ => 0,
            })
            .collect();
        assert_eq!(lengths, vec![32 * 1024, 64 * 1024, 64 * 1024, 32 * 1024]);
    }

    #[test]
    fn test_oversized_copied_record_degrades() {
        let (pool, os) = pool_with_volume(4096);
        pool.set_log_device(true);
        let log = os.open_log(Arc::new(NoData));
        let mut tx = os.create_tx();
        tx.assign(TxWait::Wait).unwrap();
        let big = Bytes::from(vec![1u8; usize::try_from(log.max_copied_data()).unwrap() + 1]);
        log_write(&*log, &*os, tx.as_ref(), 0, &big, 4096, true, 32 * 1024);
        tx.commit();

        let records = pool.volatile_records("p/v");
        assert_eq!(records.len(), 1);
        assert!(matches!(
            records[0].payload,
            LogPayload::Write { state: WriteState::NeedCopy, data: None, .. }
        ));
    }

    #[test]
    fn test_replay_is_idempotent() {
        let (pool, os) = pool_with_volume(4096);
        let dnode = os.hold_object(VOLUME_OBJECT).unwrap();
        let volsize = os.zap_lookup(PROPS_OBJECT, SIZE_KEY).unwrap();
        let vector = ReplayVector::new(&*os, &dnode, volsize);

        let records = vec![
            LogRecord {
                object: VOLUME_OBJECT,
                sync: true,
                payload: LogPayload::Write {
                    offset: 0,
                    length: 4096,
                    state: WriteState::Copied,
                    block_size: 4096,
                    data: Some(Bytes::from(vec![0xAAu8; 4096])),
                },
            },
            LogRecord {
                object: VOLUME_OBJECT,
                sync: true,
                payload: LogPayload::Truncate {
                    offset: 0,
                    length: 4096,
                },
            },
            LogRecord {
                object: VOLUME_OBJECT,
                sync: true,
                payload: LogPayload::Write {
                    offset: 0,
                    length: 100,
                    state: WriteState::Copied,
                    block_size: 4096,
                    data: Some(Bytes::from(vec![0xBBu8; 100])),
                },
            },
        ];

        for _ in 0..2 {
            for record in &records {
                vector.replay(record).unwrap();
            }
            let mut buf = vec![0u8; 4096];
            os.read(&dnode, 0, &mut buf).unwrap();
            assert!(buf[..100].iter().all(|&b| b == 0xBB));
            assert!(buf[100..].iter().all(|&b| b == 0));
        }
        os.release_object(dnode);
        drop(pool);
    }

    #[test]
    fn test_replay_rejects_unknown_records() {
        let (_pool, os) = pool_with_volume(4096);
        let dnode = os.hold_object(VOLUME_OBJECT).unwrap();
        let vector = ReplayVector::new(&*os, &dnode, 1 << 20);
        let record = LogRecord {
            object: VOLUME_OBJECT,
            sync: false,
            payload: LogPayload::Other { txtype: 9 },
        };
        assert!(matches!(vector.replay(&record), Err(Error::NotSupported(_))));
        assert_eq!(os.sync_policy(), SyncPolicy::Standard);
    }

    #[test]
    fn test_replay_clips_to_volume_size() {
        let (_pool, os) = pool_with_volume(4096);
        let dnode = os.hold_object(VOLUME_OBJECT).unwrap();
        let vector = ReplayVector::new(&*os, &dnode, 8192);
        let record = LogRecord {
            object: VOLUME_OBJECT,
            sync: true,
            payload: LogPayload::Write {
                offset: 8000,
                length: 400,
                state: WriteState::Copied,
                block_size: 4096,
                data: Some(Bytes::from(vec![3u8; 400])),
            },
        };
        vector.replay(&record).unwrap();
        let mut buf = vec![0u8; 8192];
        os.read(&dnode, 0, &mut buf).unwrap();
        assert!(buf[8000..].iter().all(|&b| b == 3));
    }

    struct NoData;

    impl LogDataProvider for NoData {
        fn get_data(&self, _record: &LogRecord) -> Result<Bytes> {
            Err(Error::io("no data"))
        }
    }
}
