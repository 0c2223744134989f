//! Collaborator interfaces
//!
//! The volume layer sits between the block layer and a transactional
//! object store. These traits are everything it needs from the store:
//! dataset ownership and properties, objects inside a dataset, transactions
//! grouped into commit generations, and a per-dataset intent log.

use bytes::Bytes;
use std::sync::Arc;
use txvol_common::{DatasetProp, LogBias, Result, SyncPolicy};

/// Object number inside a dataset
pub type ObjectId = u64;

/// Object holding the volume's data
pub const VOLUME_OBJECT: ObjectId = 1;

/// Key/value object holding the volume's persisted properties
pub const PROPS_OBJECT: ObjectId = 2;

/// Property key of the logical volume size
pub const SIZE_KEY: &str = "size";

/// Length meaning "through the end of the object"
pub const TO_END: u64 = u64::MAX;

/// How `assign` behaves when the open commit generation is full
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxWait {
    /// Block until a commit generation accepts the transaction
    Wait,
    /// Fail instead of blocking
    NoWait,
}

/// One atomic batch of mutations inside a commit generation
pub trait Transaction: Send {
    /// Declare a write of `[offset, offset + length)` to `object`
    fn hold_write(&mut self, object: ObjectId, offset: u64, length: u64);

    /// Declare a free of `[offset, offset + length)` in `object`
    fn hold_free(&mut self, object: ObjectId, offset: u64, length: u64);

    /// Declare an update of `key` in the key/value object `object`
    fn hold_zap(&mut self, object: ObjectId, key: &str);

    /// Assign the transaction to a commit generation
    ///
    /// # Errors
    /// Fails when the pool cannot accept the transaction.
    fn assign(&mut self, wait: TxWait) -> Result<()>;

    /// Commit generation the transaction was assigned to (0 before assign)
    fn txg(&self) -> u64;

    /// Finish an assigned transaction
    fn commit(self: Box<Self>);

    /// Discard a transaction that was not assigned or failed to assign
    fn abort(self: Box<Self>);
}

/// Held reference to an object's metadata
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DnodeHandle {
    pub object: ObjectId,
    pub block_size: u64,
}

/// Dataset-level space accounting
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SpaceUsage {
    /// Bytes referenced by the dataset
    pub referenced: u64,
    /// Bytes still available to the dataset
    pub available: u64,
}

/// Pool-level space accounting
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolSpace {
    /// Usable pool capacity in bytes
    pub size: u64,
    /// Bytes allocated across the pool
    pub allocated: u64,
}

/// How the data of a logged write reaches the log
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteState {
    /// Data copied into the record when it is appended
    Copied,
    /// Data fetched from the volume when the log is committed
    NeedCopy,
    /// The whole block is written in place and the record points at it
    Indirect,
}

/// Body of a log record
#[derive(Clone, Debug)]
pub enum LogPayload {
    Write {
        offset: u64,
        length: u64,
        state: WriteState,
        block_size: u64,
        data: Option<Bytes>,
    },
    Truncate {
        offset: u64,
        length: u64,
    },
    /// Record types the volume layer does not produce
    Other { txtype: u8 },
}

/// One intent log record
#[derive(Clone, Debug)]
pub struct LogRecord {
    pub object: ObjectId,
    pub sync: bool,
    pub payload: LogPayload,
}

/// Outcome of an asynchronous log commit request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitStatus {
    /// The callback will run once the records are durable
    Pending,
    /// Already durable; the callback was dropped without running
    Immediate,
}

/// Callback run when an asynchronous commit completes
pub type CommitCallback = Box<dyn FnOnce() + Send + 'static>;

/// Supplies data for records logged by reference
pub trait LogDataProvider: Send + Sync {
    /// Data for a `NeedCopy` record (its exact range) or an `Indirect`
    /// record (the whole block containing it)
    ///
    /// # Errors
    /// Fails when the data can no longer be read; the log then falls back
    /// to waiting for the commit generation to sync.
    fn get_data(&self, record: &LogRecord) -> Result<Bytes>;
}

/// Applies log records during replay
pub trait ReplayHandler {
    /// Redo one record
    ///
    /// # Errors
    /// Any error stops the replay.
    fn replay(&self, record: &LogRecord) -> Result<()>;
}

/// Per-dataset intent log
pub trait IntentLog: Send + Sync {
    /// True while the log is being replayed at attach time
    fn is_replaying(&self) -> bool;

    /// Largest record payload copied inline
    fn max_copied_data(&self) -> u64;

    /// Append a record to the in-memory log, tagged with `tx`'s generation
    fn append(&self, record: LogRecord, tx: &dyn Transaction);

    /// Make every appended record for `object` durable
    fn commit(&self, object: ObjectId);

    /// Make records durable, calling `done` once they are
    fn commit_async(&self, object: ObjectId, done: CommitCallback) -> CommitStatus;

    /// Treat previously appended asynchronous records as synchronous
    fn async_to_sync(&self, object: ObjectId);

    /// Close the log; appended records are left for the sync to retire
    fn close(&self);
}

/// An owned dataset
pub trait Objset: Send + Sync {
    /// Full dataset name
    fn name(&self) -> String;

    /// Whether the dataset is a snapshot
    fn is_snapshot(&self) -> bool;

    /// Whether the pool accepts writes
    fn pool_writeable(&self) -> bool;

    /// Effective `sync` property
    fn sync_policy(&self) -> SyncPolicy;

    /// Effective `logbias` property
    fn log_bias(&self) -> LogBias;

    /// Whether the pool has a separate log device
    fn has_log_device(&self) -> bool;

    /// Data block size of `object`
    ///
    /// # Errors
    /// `NotFound` when the object does not exist.
    fn object_block_size(&self, object: ObjectId) -> Result<u64>;

    /// Change the data block size of an empty `object`
    ///
    /// # Errors
    /// `NotSupported` once the object holds data.
    fn set_block_size(&self, object: ObjectId, block_size: u64, tx: &dyn Transaction)
    -> Result<()>;

    /// Look up `key` in the key/value object `object`
    ///
    /// # Errors
    /// `NotFound` when the key is absent.
    fn zap_lookup(&self, object: ObjectId, key: &str) -> Result<u64>;

    /// Set `key` in the key/value object `object`
    ///
    /// # Errors
    /// Store-specific failures.
    fn zap_update(&self, object: ObjectId, key: &str, value: u64, tx: &dyn Transaction)
    -> Result<()>;

    /// Take a hold on `object`
    ///
    /// # Errors
    /// `NotFound` when the object does not exist.
    fn hold_object(&self, object: ObjectId) -> Result<DnodeHandle>;

    /// Drop a hold taken by [`Objset::hold_object`]
    fn release_object(&self, dnode: DnodeHandle);

    /// Start a transaction
    fn create_tx(&self) -> Box<dyn Transaction>;

    /// Read `buf.len()` bytes at `offset`
    ///
    /// # Errors
    /// `Checksum` when stored data fails verification.
    fn read(&self, dnode: &DnodeHandle, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `data` at `offset` inside an assigned transaction
    ///
    /// # Errors
    /// Store-specific failures.
    fn write(&self, dnode: &DnodeHandle, offset: u64, data: &[u8], tx: &dyn Transaction)
    -> Result<()>;

    /// Free a range, splitting it over as many transactions as needed
    ///
    /// # Errors
    /// Store-specific failures.
    fn free_range(&self, object: ObjectId, offset: u64, length: u64) -> Result<()>;

    /// Block until commit generation `txg` is on stable storage; 0 means
    /// the currently open generation
    fn wait_synced(&self, txg: u64);

    /// Warm caches for a range of `object`
    fn prefetch(&self, object: ObjectId, offset: u64, length: u64);

    /// Next data (or hole, when `hole`) offset at or after `offset`
    ///
    /// # Errors
    /// `NoDevice` when there is no such offset.
    fn offset_next(&self, object: ObjectId, hole: bool, offset: u64) -> Result<u64>;

    /// Dataset space accounting
    fn space(&self) -> SpaceUsage;

    /// Pool space accounting
    fn pool_space(&self) -> PoolSpace;

    /// Open the dataset's intent log
    fn open_log(&self, provider: Arc<dyn LogDataProvider>) -> Arc<dyn IntentLog>;

    /// Replay durable log records through `handler`, then retire them
    ///
    /// # Errors
    /// The first error returned by `handler`.
    fn replay_log(&self, handler: &dyn ReplayHandler) -> Result<()>;

    /// Discard the log without replaying it
    ///
    /// # Errors
    /// Store-specific failures.
    fn destroy_log(&self) -> Result<()>;

    /// Drop cached data of the dataset
    fn evict_cached(&self);
}

/// Dataset namespace of a pool
pub trait ObjectStore: Send + Sync {
    /// Take exclusive ownership of a dataset
    ///
    /// # Errors
    /// `NotFound` if the dataset does not exist, `Busy` if it is already
    /// owned, `Interrupted` if the namespace is busy and the caller should
    /// retry.
    fn own(&self, name: &str, read_only: bool) -> Result<Arc<dyn Objset>>;

    /// Release ownership taken by [`ObjectStore::own`]
    fn disown(&self, objset: Arc<dyn Objset>);

    /// Whether the dataset exists
    fn exists(&self, name: &str) -> bool;

    /// Whether the dataset is a volume (or a snapshot of one)
    fn is_volume(&self, name: &str) -> bool;

    /// Effective value of an integer property, inherited from ancestors
    ///
    /// # Errors
    /// `NotFound` if the dataset does not exist.
    fn get_prop(&self, name: &str, prop: DatasetProp) -> Result<u64>;

    /// Set an integer property locally on a dataset
    ///
    /// # Errors
    /// `NotFound` if the dataset does not exist.
    fn set_prop(&self, name: &str, prop: DatasetProp, value: u64) -> Result<()>;

    /// `name` and every descendant dataset, parents before children,
    /// snapshots excluded
    ///
    /// # Errors
    /// `NotFound` if `name` does not exist.
    fn list_descendants(&self, name: &str) -> Result<Vec<String>>;

    /// Snapshots of `name`
    ///
    /// # Errors
    /// `NotFound` if `name` does not exist.
    fn list_snapshots(&self, name: &str) -> Result<Vec<String>>;
}
