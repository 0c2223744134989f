//! In-memory object store
//!
//! A complete [`ObjectStore`] kept in process memory, used by the tests and
//! the bench. Datasets hold a sparse block map; every block is checksummed
//! when its commit generation syncs and verified on read. Writes land in a
//! per-dataset dirty overlay that only becomes durable when the open
//! generation syncs, so [`MemPool::crash`] can throw away exactly what a
//! power loss would.
//!
//! The intent log keeps two lists per dataset. Appended records are
//! volatile until a commit moves them to the durable list; both lists drop
//! records whose generation has synced.

use crate::backend::{
    CommitCallback, CommitStatus, DnodeHandle, IntentLog, LogDataProvider, LogPayload, LogRecord,
    ObjectId, ObjectStore, Objset, PROPS_OBJECT, PoolSpace, ReplayHandler, SIZE_KEY, SpaceUsage,
    Transaction, TxWait, VOLUME_OBJECT, WriteState,
};
use crate::taskq::Taskq;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, warn};
use txvol_common::{
    BlockChecksum, DatasetProp, Error, LogBias, Result, SyncPolicy, is_self_or_descendant,
    is_snapshot, renamed, split_snapshot,
};

/// Largest payload a log record carries inline
const MAX_COPIED_DATA: u64 = 63 * 1024;

/// Block size of the properties object
const PROPS_BLOCK_SIZE: u64 = 512;

/// Kind of a dataset
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatasetKind {
    Filesystem,
    Volume,
}

#[derive(Clone)]
struct StoredBlock {
    data: Box<[u8]>,
    checksum: BlockChecksum,
}

#[derive(Default)]
struct LogState {
    volatile: Vec<(u64, LogRecord)>,
    durable: Vec<(u64, LogRecord)>,
}

struct Dataset {
    name: String,
    kind: DatasetKind,
    snapshot: bool,
    props: HashMap<DatasetProp, u64>,
    sync: SyncPolicy,
    log_bias: LogBias,
    block_size: u64,
    zap: BTreeMap<String, u64>,
    dirty_zap: BTreeMap<String, u64>,
    blocks: BTreeMap<u64, StoredBlock>,
    /// Blocks changed in the open generation; `None` marks a freed block
    dirty: BTreeMap<u64, Option<Box<[u8]>>>,
    log: LogState,
    owned: bool,
    holds: u32,
    replaying: bool,
}

impl Dataset {
    fn new(name: String, kind: DatasetKind, block_size: u64) -> Self {
        Self {
            snapshot: is_snapshot(&name),
            name,
            kind,
            props: HashMap::new(),
            sync: SyncPolicy::default(),
            log_bias: LogBias::default(),
            block_size,
            zap: BTreeMap::new(),
            dirty_zap: BTreeMap::new(),
            blocks: BTreeMap::new(),
            dirty: BTreeMap::new(),
            log: LogState::default(),
            owned: false,
            holds: 0,
            replaying: false,
        }
    }

    /// Current content of block `idx`; `None` for a hole
    fn block(&self, idx: u64) -> Result<Option<&[u8]>> {
        if let Some(dirty) = self.dirty.get(&idx) {
            return Ok(dirty.as_deref());
        }
        match self.blocks.get(&idx) {
            Some(block) if block.checksum.verify(&block.data) => Ok(Some(&block.data)),
            Some(_) => Err(Error::Checksum {
                offset: idx * self.block_size,
            }),
            None => Ok(None),
        }
    }

    fn has_data(&self, idx: u64) -> bool {
        match self.dirty.get(&idx) {
            Some(dirty) => dirty.is_some(),
            None => self.blocks.contains_key(&idx),
        }
    }

    fn data_blocks(&self) -> BTreeSet<u64> {
        let mut set: BTreeSet<u64> = self.blocks.keys().copied().collect();
        for (idx, dirty) in &self.dirty {
            if dirty.is_some() {
                set.insert(*idx);
            } else {
                set.remove(idx);
            }
        }
        set
    }

    fn zap_get(&self, key: &str) -> Option<u64> {
        self.dirty_zap
            .get(key)
            .or_else(|| self.zap.get(key))
            .copied()
    }

    fn volsize(&self) -> u64 {
        self.zap_get(SIZE_KEY).unwrap_or(u64::MAX)
    }

    fn sync(&mut self, txg: u64) {
        for (idx, dirty) in std::mem::take(&mut self.dirty) {
            match dirty {
                Some(data) => {
                    let checksum = BlockChecksum::compute(&data);
                    self.blocks.insert(idx, StoredBlock { data, checksum });
                }
                None => {
                    self.blocks.remove(&idx);
                }
            }
        }
        self.zap.append(&mut self.dirty_zap);
        self.log.volatile.retain(|(t, _)| *t > txg);
        self.log.durable.retain(|(t, _)| *t > txg);
    }

    /// Overwrite part of block `idx` with `data` at `within`
    fn modify_block(&mut self, idx: u64, within: usize, data: &[u8]) -> Result<()> {
        #[allow(clippy::cast_possible_truncation)]
        let bs = self.block_size as usize;
        let mut block = if within == 0 && data.len() == bs {
            vec![0u8; bs]
        } else {
            self.block(idx)?
                .map_or_else(|| vec![0u8; bs], <[u8]>::to_vec)
        };
        block[within..within + data.len()].copy_from_slice(data);
        self.dirty.insert(idx, Some(block.into_boxed_slice()));
        Ok(())
    }
}

struct PoolState {
    names: BTreeMap<String, u64>,
    datasets: HashMap<u64, Dataset>,
    next_id: u64,
    open_txg: u64,
    synced_txg: u64,
    writeable: bool,
    log_device: bool,
    namespace_busy: bool,
}

impl PoolState {
    fn lookup(&self, name: &str) -> Option<&Dataset> {
        self.names.get(name).and_then(|id| self.datasets.get(id))
    }

    fn lookup_mut(&mut self, name: &str) -> Result<&mut Dataset> {
        let id = *self.names.get(name).ok_or_else(|| Error::not_found(name))?;
        self.datasets
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(name))
    }

    fn dataset(&self, id: u64) -> Result<&Dataset> {
        self.datasets
            .get(&id)
            .ok_or_else(|| Error::not_found(format!("dataset #{id}")))
    }

    fn dataset_mut(&mut self, id: u64) -> Result<&mut Dataset> {
        self.datasets
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("dataset #{id}")))
    }

    fn add(&mut self, dataset: Dataset) -> Result<()> {
        if self.names.contains_key(&dataset.name) {
            return Err(Error::Exists(dataset.name));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.names.insert(dataset.name.clone(), id);
        self.datasets.insert(id, dataset);
        Ok(())
    }

    fn sync_all(&mut self) {
        let txg = self.open_txg;
        for dataset in self.datasets.values_mut() {
            dataset.sync(txg);
        }
        self.synced_txg = txg;
        self.open_txg += 1;
    }

    fn effective_prop(&self, name: &str, prop: DatasetProp) -> Result<u64> {
        if !self.names.contains_key(name) {
            return Err(Error::not_found(name));
        }
        let mut candidate = Some(name);
        while let Some(current) = candidate {
            if let Some(value) = self.lookup(current).and_then(|d| d.props.get(&prop)) {
                return Ok(*value);
            }
            candidate = parent_of(current);
        }
        Ok(0)
    }

    fn allocated(&self) -> u64 {
        self.datasets
            .values()
            .map(|d| d.data_blocks().len() as u64 * d.block_size)
            .sum()
    }
}

/// Dataset a property is inherited from
fn parent_of(name: &str) -> Option<&str> {
    match split_snapshot(name) {
        (dataset, Some(_)) => Some(dataset),
        (dataset, None) => dataset.rsplit_once('/').map(|(parent, _)| parent),
    }
}

struct PoolInner {
    name: String,
    capacity: u64,
    state: Mutex<PoolState>,
    async_commit: AtomicBool,
    commit_queue: Mutex<Option<Arc<Taskq>>>,
    prefetches: AtomicU64,
}

impl PoolInner {
    /// Background queue for asynchronous log commits, started on first use
    fn commit_queue(&self) -> Option<Arc<Taskq>> {
        let mut slot = self.commit_queue.lock();
        if slot.is_none() {
            match Taskq::new(&format!("{}-zil", self.name), 1) {
                Ok(q) => *slot = Some(Arc::new(q)),
                Err(e) => warn!(pool = %self.name, error = %e, "cannot start log commit queue"),
            }
        }
        slot.clone()
    }
}

/// An in-memory pool
#[derive(Clone)]
pub struct MemPool {
    inner: Arc<PoolInner>,
}

impl MemPool {
    /// Create a pool with a root filesystem named `name`
    #[must_use]
    pub fn new(name: &str, capacity: u64) -> Self {
        let mut state = PoolState {
            names: BTreeMap::new(),
            datasets: HashMap::new(),
            next_id: 1,
            open_txg: 1,
            synced_txg: 0,
            writeable: true,
            log_device: false,
            namespace_busy: false,
        };
        let root = Dataset::new(name.to_string(), DatasetKind::Filesystem, PROPS_BLOCK_SIZE);
        let _ = state.add(root);
        Self {
            inner: Arc::new(PoolInner {
                name: name.to_string(),
                capacity,
                state: Mutex::new(state),
                async_commit: AtomicBool::new(true),
                commit_queue: Mutex::new(None),
                prefetches: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn check_parent(state: &PoolState, name: &str) -> Result<()> {
        let parent = parent_of(name).ok_or_else(|| Error::invalid_argument(name))?;
        match state.lookup(parent) {
            Some(p) if p.kind == DatasetKind::Filesystem && !p.snapshot => Ok(()),
            Some(_) => Err(Error::invalid_argument(format!("{parent} cannot have children"))),
            None => Err(Error::not_found(parent)),
        }
    }

    /// Create a filesystem dataset under an existing filesystem
    ///
    /// # Errors
    /// `NotFound` for a missing parent, `Exists` for a taken name.
    pub fn create_filesystem(&self, name: &str) -> Result<()> {
        let mut state = self.inner.state.lock();
        Self::check_parent(&state, name)?;
        state.add(Dataset::new(
            name.to_string(),
            DatasetKind::Filesystem,
            PROPS_BLOCK_SIZE,
        ))
    }

    /// Create a volume of `size` bytes; its size is durable immediately
    ///
    /// # Errors
    /// `NotFound` for a missing parent, `Exists` for a taken name.
    pub fn create_volume(&self, name: &str, size: u64, block_size: u64) -> Result<()> {
        let mut state = self.inner.state.lock();
        Self::check_parent(&state, name)?;
        let mut dataset = Dataset::new(name.to_string(), DatasetKind::Volume, block_size);
        dataset.zap.insert(SIZE_KEY.to_string(), size);
        state.add(dataset)
    }

    /// Remove a dataset and its snapshots
    ///
    /// # Errors
    /// `NotFound`, or `Busy` while owned or while it has children.
    pub fn destroy(&self, name: &str) -> Result<()> {
        let mut state = self.inner.state.lock();
        let dataset = state.lookup(name).ok_or_else(|| Error::not_found(name))?;
        if dataset.owned {
            return Err(Error::busy(name));
        }
        let prefix = format!("{name}/");
        if state.names.keys().any(|n| n.starts_with(&prefix)) {
            return Err(Error::busy(format!("{name} has children")));
        }
        let doomed: Vec<String> = state
            .names
            .keys()
            .filter(|n| is_self_or_descendant(n, name))
            .cloned()
            .collect();
        for n in doomed {
            if let Some(id) = state.names.remove(&n) {
                state.datasets.remove(&id);
            }
        }
        Ok(())
    }

    /// Sync everything and take a snapshot `dataset@snap`
    ///
    /// # Errors
    /// `NotFound` for a missing dataset, `Exists` for a taken name.
    pub fn snapshot(&self, dataset: &str, snap: &str) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.sync_all();
        let source = state.lookup(dataset).ok_or_else(|| Error::not_found(dataset))?;
        let mut copy = Dataset::new(format!("{dataset}@{snap}"), source.kind, source.block_size);
        copy.blocks = source.blocks.clone();
        copy.zap = source.zap.clone();
        copy.sync = source.sync;
        copy.log_bias = source.log_bias;
        state.add(copy)
    }

    /// Discard everything written to `dataset` since `dataset@snap`
    ///
    /// # Errors
    /// `NotFound` for a missing dataset or snapshot, `Busy` while owned.
    pub fn rollback(&self, dataset: &str, snap: &str) -> Result<()> {
        let mut state = self.inner.state.lock();
        let snapshot = format!("{dataset}@{snap}");
        let source = state
            .lookup(&snapshot)
            .ok_or_else(|| Error::not_found(&snapshot))?;
        let (blocks, zap) = (source.blocks.clone(), source.zap.clone());
        let target = state.lookup_mut(dataset)?;
        if target.owned {
            return Err(Error::busy(dataset));
        }
        target.blocks = blocks;
        target.zap = zap;
        target.dirty.clear();
        target.dirty_zap.clear();
        target.log = LogState::default();
        debug!(dataset, snap, "rolled back");
        Ok(())
    }

    /// Rename `old`, its descendants and its snapshots
    ///
    /// # Errors
    /// `NotFound` for a missing dataset, `Exists` for a taken target.
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        let mut state = self.inner.state.lock();
        if !state.names.contains_key(old) {
            return Err(Error::not_found(old));
        }
        if state.names.contains_key(new) {
            return Err(Error::Exists(new.to_string()));
        }
        let moves: Vec<(String, String)> = state
            .names
            .keys()
            .filter_map(|n| renamed(n, old, new).map(|to| (n.clone(), to)))
            .collect();
        for (from, to) in moves {
            if let Some(id) = state.names.remove(&from) {
                state.names.insert(to.clone(), id);
                if let Some(dataset) = state.datasets.get_mut(&id) {
                    dataset.name = to;
                }
            }
        }
        Ok(())
    }

    /// Sync the open commit generation
    pub fn sync(&self) {
        self.inner.state.lock().sync_all();
    }

    /// Forget everything that was not synced or committed to the log, as a
    /// power loss would, and drop every ownership and hold
    pub fn crash(&self) {
        let mut state = self.inner.state.lock();
        for dataset in state.datasets.values_mut() {
            dataset.dirty.clear();
            dataset.dirty_zap.clear();
            dataset.log.volatile.clear();
            dataset.owned = false;
            dataset.holds = 0;
            dataset.replaying = false;
        }
        debug!(pool = %self.inner.name, "simulated crash");
    }

    /// Damage the synced block holding `offset` so its checksum fails
    ///
    /// # Errors
    /// `NotFound` when there is no synced data at `offset`.
    pub fn corrupt_block(&self, name: &str, offset: u64) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.sync_all();
        let dataset = state.lookup_mut(name)?;
        let idx = offset / dataset.block_size;
        let block = dataset
            .blocks
            .get_mut(&idx)
            .ok_or_else(|| Error::not_found(format!("{name} block {idx}")))?;
        block.data[0] ^= 0xFF;
        Ok(())
    }

    /// While set, `own` fails with `Interrupted`
    pub fn set_namespace_busy(&self, busy: bool) {
        self.inner.state.lock().namespace_busy = busy;
    }

    pub fn set_pool_writeable(&self, writeable: bool) {
        self.inner.state.lock().writeable = writeable;
    }

    pub fn set_log_device(&self, present: bool) {
        self.inner.state.lock().log_device = present;
    }

    /// Complete asynchronous log commits on a background thread
    pub fn set_async_commit(&self, enabled: bool) {
        self.inner.async_commit.store(enabled, Ordering::Release);
    }

    /// # Errors
    /// `NotFound` for a missing dataset.
    pub fn set_log_bias(&self, name: &str, bias: LogBias) -> Result<()> {
        self.inner.state.lock().lookup_mut(name)?.log_bias = bias;
        Ok(())
    }

    /// # Errors
    /// `NotFound` for a missing dataset.
    pub fn set_sync_policy(&self, name: &str, policy: SyncPolicy) -> Result<()> {
        self.inner.state.lock().lookup_mut(name)?.sync = policy;
        Ok(())
    }

    /// Appended log records not yet committed
    #[must_use]
    pub fn volatile_records(&self, name: &str) -> Vec<LogRecord> {
        let state = self.inner.state.lock();
        state.lookup(name).map_or_else(Vec::new, |d| {
            d.log.volatile.iter().map(|(_, r)| r.clone()).collect()
        })
    }

    /// Committed log records not yet retired by a sync
    #[must_use]
    pub fn durable_records(&self, name: &str) -> Vec<LogRecord> {
        let state = self.inner.state.lock();
        state.lookup(name).map_or_else(Vec::new, |d| {
            d.log.durable.iter().map(|(_, r)| r.clone()).collect()
        })
    }

    #[must_use]
    pub fn is_owned(&self, name: &str) -> bool {
        self.inner.state.lock().lookup(name).is_some_and(|d| d.owned)
    }

    /// Object holds currently taken on `name`
    #[must_use]
    pub fn holds(&self, name: &str) -> u32 {
        self.inner.state.lock().lookup(name).map_or(0, |d| d.holds)
    }

    #[must_use]
    pub fn synced_txg(&self) -> u64 {
        self.inner.state.lock().synced_txg
    }

    /// Number of prefetch requests received
    #[must_use]
    pub fn prefetches(&self) -> u64 {
        self.inner.prefetches.load(Ordering::Relaxed)
    }
}

impl ObjectStore for MemPool {
    fn own(&self, name: &str, read_only: bool) -> Result<Arc<dyn Objset>> {
        let mut state = self.inner.state.lock();
        if state.namespace_busy {
            return Err(Error::Interrupted(name.to_string()));
        }
        let id = *state.names.get(name).ok_or_else(|| Error::not_found(name))?;
        let dataset = state.dataset_mut(id)?;
        if dataset.owned {
            return Err(Error::busy(name));
        }
        if dataset.snapshot && !read_only {
            return Err(Error::read_only(name));
        }
        dataset.owned = true;
        let snapshot = dataset.snapshot;
        Ok(Arc::new(MemObjset {
            pool: Arc::clone(&self.inner),
            id,
            snapshot,
        }))
    }

    fn disown(&self, objset: Arc<dyn Objset>) {
        // name() takes the state lock itself
        let name = objset.name();
        let mut state = self.inner.state.lock();
        if let Ok(dataset) = state.lookup_mut(&name) {
            dataset.owned = false;
        }
    }

    fn exists(&self, name: &str) -> bool {
        self.inner.state.lock().names.contains_key(name)
    }

    fn is_volume(&self, name: &str) -> bool {
        self.inner
            .state
            .lock()
            .lookup(name)
            .is_some_and(|d| d.kind == DatasetKind::Volume)
    }

    fn get_prop(&self, name: &str, prop: DatasetProp) -> Result<u64> {
        self.inner.state.lock().effective_prop(name, prop)
    }

    fn set_prop(&self, name: &str, prop: DatasetProp, value: u64) -> Result<()> {
        self.inner
            .state
            .lock()
            .lookup_mut(name)?
            .props
            .insert(prop, value);
        Ok(())
    }

    fn list_descendants(&self, name: &str) -> Result<Vec<String>> {
        let state = self.inner.state.lock();
        if !state.names.contains_key(name) {
            return Err(Error::not_found(name));
        }
        Ok(state
            .names
            .keys()
            .filter(|n| !is_snapshot(n) && is_self_or_descendant(n, name))
            .cloned()
            .collect())
    }

    fn list_snapshots(&self, name: &str) -> Result<Vec<String>> {
        let state = self.inner.state.lock();
        if !state.names.contains_key(name) {
            return Err(Error::not_found(name));
        }
        let prefix = format!("{name}@");
        Ok(state
            .names
            .keys()
            .filter(|n| n.starts_with(&prefix))
            .cloned()
            .collect())
    }
}

/// An owned dataset of a [`MemPool`].
///
/// Read-only ownership only keeps other owners out; whether writes are
/// accepted depends on the dataset being a snapshot and on the pool.
struct MemObjset {
    pool: Arc<PoolInner>,
    id: u64,
    snapshot: bool,
}

impl MemObjset {
    fn check_writable(&self, state: &PoolState) -> Result<()> {
        if self.snapshot || !state.writeable {
            let name = state.dataset(self.id).map(|d| d.name.clone()).unwrap_or_default();
            return Err(Error::read_only(name));
        }
        Ok(())
    }

    fn check_data_object(object: ObjectId) -> Result<()> {
        if object == VOLUME_OBJECT {
            Ok(())
        } else {
            Err(Error::not_found(format!("object {object}")))
        }
    }
}

impl Objset for MemObjset {
    fn name(&self) -> String {
        let state = self.pool.state.lock();
        state
            .dataset(self.id)
            .map(|d| d.name.clone())
            .unwrap_or_default()
    }

    fn is_snapshot(&self) -> bool {
        self.snapshot
    }

    fn pool_writeable(&self) -> bool {
        self.pool.state.lock().writeable
    }

    fn sync_policy(&self) -> SyncPolicy {
        let state = self.pool.state.lock();
        state.dataset(self.id).map(|d| d.sync).unwrap_or_default()
    }

    fn log_bias(&self) -> LogBias {
        let state = self.pool.state.lock();
        state.dataset(self.id).map(|d| d.log_bias).unwrap_or_default()
    }

    fn has_log_device(&self) -> bool {
        self.pool.state.lock().log_device
    }

    fn object_block_size(&self, object: ObjectId) -> Result<u64> {
        let state = self.pool.state.lock();
        let dataset = state.dataset(self.id)?;
        match object {
            VOLUME_OBJECT if dataset.kind == DatasetKind::Volume => Ok(dataset.block_size),
            PROPS_OBJECT if dataset.kind == DatasetKind::Volume => Ok(PROPS_BLOCK_SIZE),
            _ => Err(Error::not_found(format!("object {object}"))),
        }
    }

    fn set_block_size(&self, object: ObjectId, block_size: u64, tx: &dyn Transaction) -> Result<()> {
        Self::check_data_object(object)?;
        if tx.txg() == 0 {
            return Err(Error::internal("transaction not assigned"));
        }
        let mut state = self.pool.state.lock();
        self.check_writable(&state)?;
        let dataset = state.dataset_mut(self.id)?;
        if !dataset.data_blocks().is_empty() {
            return Err(Error::NotSupported(format!(
                "{} already holds data",
                dataset.name
            )));
        }
        dataset.block_size = block_size;
        Ok(())
    }

    fn zap_lookup(&self, object: ObjectId, key: &str) -> Result<u64> {
        if object != PROPS_OBJECT {
            return Err(Error::not_found(format!("object {object}")));
        }
        let state = self.pool.state.lock();
        state
            .dataset(self.id)?
            .zap_get(key)
            .ok_or_else(|| Error::not_found(key))
    }

    fn zap_update(&self, object: ObjectId, key: &str, value: u64, tx: &dyn Transaction) -> Result<()> {
        if object != PROPS_OBJECT {
            return Err(Error::not_found(format!("object {object}")));
        }
        if tx.txg() == 0 {
            return Err(Error::internal("transaction not assigned"));
        }
        let mut state = self.pool.state.lock();
        self.check_writable(&state)?;
        state
            .dataset_mut(self.id)?
            .dirty_zap
            .insert(key.to_string(), value);
        Ok(())
    }

    fn hold_object(&self, object: ObjectId) -> Result<DnodeHandle> {
        let mut state = self.pool.state.lock();
        let dataset = state.dataset_mut(self.id)?;
        let block_size = match object {
            VOLUME_OBJECT if dataset.kind == DatasetKind::Volume => dataset.block_size,
            PROPS_OBJECT if dataset.kind == DatasetKind::Volume => PROPS_BLOCK_SIZE,
            _ => return Err(Error::not_found(format!("object {object}"))),
        };
        dataset.holds += 1;
        Ok(DnodeHandle { object, block_size })
    }

    fn release_object(&self, _dnode: DnodeHandle) {
        let mut state = self.pool.state.lock();
        if let Ok(dataset) = state.dataset_mut(self.id) {
            dataset.holds = dataset.holds.saturating_sub(1);
        }
    }

    fn create_tx(&self) -> Box<dyn Transaction> {
        Box::new(MemTx {
            pool: Arc::clone(&self.pool),
            txg: 0,
        })
    }

    fn read(&self, dnode: &DnodeHandle, offset: u64, buf: &mut [u8]) -> Result<()> {
        Self::check_data_object(dnode.object)?;
        let state = self.pool.state.lock();
        let dataset = state.dataset(self.id)?;
        let bs = dataset.block_size;
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let idx = pos / bs;
            #[allow(clippy::cast_possible_truncation)]
            let within = (pos % bs) as usize;
            #[allow(clippy::cast_possible_truncation)]
            let n = (bs as usize - within).min(buf.len() - done);
            match dataset.block(idx)? {
                Some(data) => buf[done..done + n].copy_from_slice(&data[within..within + n]),
                None => buf[done..done + n].fill(0),
            }
            done += n;
        }
        Ok(())
    }

    fn write(&self, dnode: &DnodeHandle, offset: u64, data: &[u8], tx: &dyn Transaction) -> Result<()> {
        Self::check_data_object(dnode.object)?;
        if tx.txg() == 0 {
            return Err(Error::internal("transaction not assigned"));
        }
        let mut state = self.pool.state.lock();
        self.check_writable(&state)?;
        let dataset = state.dataset_mut(self.id)?;
        let bs = dataset.block_size;
        let mut done = 0usize;
        while done < data.len() {
            let pos = offset + done as u64;
            #[allow(clippy::cast_possible_truncation)]
            let within = (pos % bs) as usize;
            #[allow(clippy::cast_possible_truncation)]
            let n = (bs as usize - within).min(data.len() - done);
            dataset.modify_block(pos / bs, within, &data[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    fn free_range(&self, object: ObjectId, offset: u64, length: u64) -> Result<()> {
        Self::check_data_object(object)?;
        let mut state = self.pool.state.lock();
        self.check_writable(&state)?;
        let dataset = state.dataset_mut(self.id)?;
        let bs = dataset.block_size;
        let end = offset.saturating_add(length);
        let touched: Vec<u64> = dataset
            .data_blocks()
            .range(offset / bs..)
            .copied()
            .take_while(|idx| idx * bs < end)
            .collect();
        for idx in touched {
            let start = idx * bs;
            let block_end = start + bs;
            if offset <= start && block_end <= end {
                dataset.dirty.insert(idx, None);
            } else {
                let from = offset.max(start);
                let to = end.min(block_end);
                #[allow(clippy::cast_possible_truncation)]
                let zeros = vec![0u8; (to - from) as usize];
                #[allow(clippy::cast_possible_truncation)]
                dataset.modify_block(idx, (from - start) as usize, &zeros)?;
            }
        }
        Ok(())
    }

    fn wait_synced(&self, txg: u64) {
        let mut state = self.pool.state.lock();
        if txg == 0 || txg > state.synced_txg {
            state.sync_all();
        }
    }

    fn prefetch(&self, _object: ObjectId, _offset: u64, _length: u64) {
        self.pool.prefetches.fetch_add(1, Ordering::Relaxed);
    }

    fn offset_next(&self, object: ObjectId, hole: bool, offset: u64) -> Result<u64> {
        Self::check_data_object(object)?;
        let state = self.pool.state.lock();
        let dataset = state.dataset(self.id)?;
        let size = dataset.volsize();
        let no_such = || Error::NoDevice(format!("no {} at or after {offset}", if hole { "hole" } else { "data" }));
        if offset >= size {
            return Err(no_such());
        }
        let bs = dataset.block_size;
        let mut idx = offset / bs;
        if hole {
            while idx * bs < size {
                if !dataset.has_data(idx) {
                    return Ok(offset.max(idx * bs));
                }
                idx += 1;
            }
            return Ok(size);
        }
        match dataset.data_blocks().range(idx..).next() {
            Some(&found) if found * bs < size => Ok(offset.max(found * bs)),
            _ => Err(no_such()),
        }
    }

    fn space(&self) -> SpaceUsage {
        let state = self.pool.state.lock();
        let referenced = state
            .dataset(self.id)
            .map(|d| d.data_blocks().len() as u64 * d.block_size)
            .unwrap_or(0);
        SpaceUsage {
            referenced,
            available: self.pool.capacity.saturating_sub(state.allocated()),
        }
    }

    fn pool_space(&self) -> PoolSpace {
        let state = self.pool.state.lock();
        PoolSpace {
            size: self.pool.capacity,
            allocated: state.allocated(),
        }
    }

    fn open_log(&self, provider: Arc<dyn LogDataProvider>) -> Arc<dyn IntentLog> {
        Arc::new(MemLog {
            inner: Arc::new(LogInner {
                pool: Arc::clone(&self.pool),
                id: self.id,
                provider,
                commit_lock: Mutex::new(()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    fn replay_log(&self, handler: &dyn ReplayHandler) -> Result<()> {
        let records: Vec<LogRecord> = {
            let mut state = self.pool.state.lock();
            let dataset = state.dataset_mut(self.id)?;
            dataset.replaying = true;
            dataset.log.durable.iter().map(|(_, r)| r.clone()).collect()
        };
        let result = records.iter().try_for_each(|record| handler.replay(record));

        let mut state = self.pool.state.lock();
        let dataset = state.dataset_mut(self.id)?;
        dataset.replaying = false;
        if result.is_ok() {
            dataset.log.durable.clear();
            state.sync_all();
        }
        result
    }

    fn destroy_log(&self) -> Result<()> {
        let mut state = self.pool.state.lock();
        state.dataset_mut(self.id)?.log = LogState::default();
        Ok(())
    }

    fn evict_cached(&self) {}
}

struct MemTx {
    pool: Arc<PoolInner>,
    txg: u64,
}

impl Transaction for MemTx {
    fn hold_write(&mut self, _object: ObjectId, _offset: u64, _length: u64) {}

    fn hold_free(&mut self, _object: ObjectId, _offset: u64, _length: u64) {}

    fn hold_zap(&mut self, _object: ObjectId, _key: &str) {}

    fn assign(&mut self, _wait: TxWait) -> Result<()> {
        let state = self.pool.state.lock();
        if !state.writeable {
            return Err(Error::read_only(self.pool.name.clone()));
        }
        self.txg = state.open_txg;
        Ok(())
    }

    fn txg(&self) -> u64 {
        self.txg
    }

    fn commit(self: Box<Self>) {}

    fn abort(self: Box<Self>) {}
}

struct LogInner {
    pool: Arc<PoolInner>,
    id: u64,
    provider: Arc<dyn LogDataProvider>,
    /// Serializes commits so durable order matches append order
    commit_lock: Mutex<()>,
    closed: AtomicBool,
}

#[derive(Clone)]
struct MemLog {
    inner: Arc<LogInner>,
}

impl MemLog {
    fn has_volatile(&self) -> bool {
        let state = self.inner.pool.state.lock();
        state
            .dataset(self.inner.id)
            .is_ok_and(|d| !d.log.volatile.is_empty())
    }

    /// Fill in data for records logged by reference; `None` when the data
    /// is gone and the record can only be retired by a sync
    fn materialize(&self, mut record: LogRecord) -> Option<LogRecord> {
        let needs_data = matches!(
            record.payload,
            LogPayload::Write {
                state: WriteState::NeedCopy | WriteState::Indirect,
                ..
            }
        );
        if !needs_data {
            return Some(record);
        }
        match self.inner.provider.get_data(&record) {
            Ok(bytes) => {
                if let LogPayload::Write { data, .. } = &mut record.payload {
                    *data = Some(bytes);
                }
                Some(record)
            }
            Err(e) => {
                debug!(error = %e, "log data unavailable, falling back to sync");
                None
            }
        }
    }
}

impl IntentLog for MemLog {
    fn is_replaying(&self) -> bool {
        let state = self.inner.pool.state.lock();
        state.dataset(self.inner.id).is_ok_and(|d| d.replaying)
    }

    fn max_copied_data(&self) -> u64 {
        MAX_COPIED_DATA
    }

    fn append(&self, record: LogRecord, tx: &dyn Transaction) {
        let mut state = self.inner.pool.state.lock();
        if let Ok(dataset) = state.dataset_mut(self.inner.id) {
            dataset.log.volatile.push((tx.txg(), record));
        }
    }

    fn commit(&self, _object: ObjectId) {
        let _serial = self.inner.commit_lock.lock();
        let pending = {
            let mut state = self.inner.pool.state.lock();
            match state.dataset_mut(self.inner.id) {
                Ok(dataset) => std::mem::take(&mut dataset.log.volatile),
                Err(_) => return,
            }
        };
        if pending.is_empty() {
            return;
        }

        let mut durable = Vec::with_capacity(pending.len());
        let mut need_sync = false;
        for (txg, record) in pending {
            match self.materialize(record) {
                Some(record) => durable.push((txg, record)),
                None => need_sync = true,
            }
        }

        let mut state = self.inner.pool.state.lock();
        if need_sync {
            state.sync_all();
        }
        let synced = state.synced_txg;
        if let Ok(dataset) = state.dataset_mut(self.inner.id) {
            dataset
                .log
                .durable
                .extend(durable.into_iter().filter(|(txg, _)| *txg > synced));
        }
    }

    fn commit_async(&self, object: ObjectId, done: CommitCallback) -> CommitStatus {
        if !self.has_volatile() {
            return CommitStatus::Immediate;
        }
        if self.inner.pool.async_commit.load(Ordering::Acquire) {
            if let Some(queue) = self.inner.pool.commit_queue() {
                let log = self.clone();
                queue.dispatch(move || {
                    log.commit(object);
                    done();
                });
                return CommitStatus::Pending;
            }
        }
        self.commit(object);
        CommitStatus::Immediate
    }

    fn async_to_sync(&self, _object: ObjectId) {
        let mut state = self.inner.pool.state.lock();
        if let Ok(dataset) = state.dataset_mut(self.inner.id) {
            for (_, record) in &mut dataset.log.volatile {
                record.sync = true;
            }
        }
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::mpsc;
    use std::time::Duration;

    fn pool() -> MemPool {
        let pool = MemPool::new("p", 1 << 30);
        pool.create_volume("p/v", 1 << 20, 4096).unwrap();
        pool
    }

    fn write(os: &dyn Objset, offset: u64, data: &[u8]) {
        let dnode = os.hold_object(VOLUME_OBJECT).unwrap();
        let mut tx = os.create_tx();
        tx.hold_write(VOLUME_OBJECT, offset, data.len() as u64);
        tx.assign(TxWait::Wait).unwrap();
        os.write(&dnode, offset, data, tx.as_ref()).unwrap();
        tx.commit();
        os.release_object(dnode);
    }

    fn read(os: &dyn Objset, offset: u64, len: usize) -> Result<Vec<u8>> {
        let dnode = os.hold_object(VOLUME_OBJECT)?;
        let mut buf = vec![0u8; len];
        let result = os.read(&dnode, offset, &mut buf);
        os.release_object(dnode);
        result.map(|()| buf)
    }

    struct ReadBack(Arc<dyn Objset>);

    impl LogDataProvider for ReadBack {
        fn get_data(&self, record: &LogRecord) -> Result<Bytes> {
            match record.payload {
                LogPayload::Write { offset, length, .. } => {
                    let len = usize::try_from(length).map_err(|_| Error::internal("length"))?;
                    Ok(Bytes::from(read(&*self.0, offset, len)?))
                }
                _ => Err(Error::internal("not a write")),
            }
        }
    }

    fn write_record(offset: u64, length: u64, state: WriteState) -> LogRecord {
        LogRecord {
            object: VOLUME_OBJECT,
            sync: true,
            payload: LogPayload::Write {
                offset,
                length,
                state,
                block_size: 4096,
                data: None,
            },
        }
    }

    #[test]
    fn test_unaligned_write_read() {
        let pool = pool();
        let os = pool.own("p/v", false).unwrap();
        write(&*os, 4000, &[9u8; 200]);
        let buf = read(&*os, 3996, 208).unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 0]);
        assert!(buf[4..204].iter().all(|&b| b == 9));
        assert_eq!(&buf[204..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_crash_drops_unsynced_data() {
        let pool = pool();
        let os = pool.own("p/v", false).unwrap();
        write(&*os, 0, &[1u8; 4096]);
        pool.sync();
        write(&*os, 4096, &[2u8; 4096]);
        pool.crash();

        let os = pool.own("p/v", false).unwrap();
        assert!(read(&*os, 0, 4096).unwrap().iter().all(|&b| b == 1));
        assert!(read(&*os, 4096, 4096).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_corrupt_block_fails_checksum() {
        let pool = pool();
        let os = pool.own("p/v", false).unwrap();
        write(&*os, 8192, &[5u8; 4096]);
        pool.corrupt_block("p/v", 8192).unwrap();
        assert!(matches!(
            read(&*os, 8192, 512),
            Err(Error::Checksum { offset: 8192 })
        ));
        // Other blocks are still readable
        assert!(read(&*os, 0, 4096).is_ok());
    }

    #[test]
    fn test_own_rules() {
        let pool = pool();
        let os = pool.own("p/v", false).unwrap();
        assert!(matches!(pool.own("p/v", true), Err(Error::Busy(_))));
        pool.disown(os);
        assert!(!pool.is_owned("p/v"));

        pool.set_namespace_busy(true);
        assert!(matches!(pool.own("p/v", true), Err(Error::Interrupted(_))));
        pool.set_namespace_busy(false);

        pool.snapshot("p/v", "s").unwrap();
        assert!(matches!(pool.own("p/v@s", false), Err(Error::ReadOnly(_))));
        assert!(pool.own("p/v@s", true).unwrap().is_snapshot());
        assert!(matches!(pool.own("p/missing", true), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_disown_returns_and_frees_the_name() {
        let pool = pool();
        let os = pool.own("p/v", false).unwrap();
        let (tx, rx) = mpsc::channel();
        let helper = pool.clone();
        std::thread::spawn(move || {
            helper.disown(os);
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!pool.is_owned("p/v"));
        assert!(pool.own("p/v", false).is_ok());
    }

    #[test]
    fn test_props_inherit() {
        let pool = MemPool::new("p", 1 << 30);
        pool.create_filesystem("p/fs").unwrap();
        pool.create_volume("p/fs/v", 1 << 20, 4096).unwrap();
        pool.snapshot("p/fs/v", "s").unwrap();

        assert_eq!(pool.get_prop("p/fs/v@s", DatasetProp::SnapDev).unwrap(), 0);
        pool.set_prop("p/fs", DatasetProp::SnapDev, 1).unwrap();
        assert_eq!(pool.get_prop("p/fs/v@s", DatasetProp::SnapDev).unwrap(), 1);
        pool.set_prop("p/fs/v", DatasetProp::SnapDev, 0).unwrap();
        assert_eq!(pool.get_prop("p/fs/v@s", DatasetProp::SnapDev).unwrap(), 0);
        assert!(matches!(
            pool.get_prop("p/nope", DatasetProp::VolMode),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_listing() {
        let pool = MemPool::new("p", 1 << 30);
        pool.create_filesystem("p/a").unwrap();
        pool.create_volume("p/a/v", 1 << 20, 4096).unwrap();
        pool.create_volume("p/ab", 1 << 20, 4096).unwrap();
        pool.snapshot("p/a/v", "s1").unwrap();

        assert_eq!(
            pool.list_descendants("p/a").unwrap(),
            vec!["p/a".to_string(), "p/a/v".to_string()]
        );
        assert_eq!(pool.list_snapshots("p/a/v").unwrap(), vec!["p/a/v@s1".to_string()]);
        assert!(pool.is_volume("p/a/v@s1"));
        assert!(!pool.is_volume("p/a"));
    }

    #[test]
    fn test_rollback_and_rename() {
        let pool = pool();
        let os = pool.own("p/v", false).unwrap();
        write(&*os, 0, &[1u8; 4096]);
        pool.snapshot("p/v", "s").unwrap();
        write(&*os, 0, &[2u8; 4096]);
        assert!(matches!(pool.rollback("p/v", "s"), Err(Error::Busy(_))));
        pool.disown(os);
        pool.rollback("p/v", "s").unwrap();

        pool.rename("p/v", "p/w").unwrap();
        assert!(pool.exists("p/w@s"));
        let os = pool.own("p/w", true).unwrap();
        assert_eq!(os.name(), "p/w");
        assert!(read(&*os, 0, 4096).unwrap().iter().all(|&b| b == 1));
    }

    #[test]
    fn test_offset_next() {
        let pool = pool();
        let os = pool.own("p/v", false).unwrap();
        write(&*os, 8192, &[1u8; 100]);
        assert_eq!(os.offset_next(VOLUME_OBJECT, false, 0).unwrap(), 8192);
        assert_eq!(os.offset_next(VOLUME_OBJECT, true, 8192).unwrap(), 12288);
        assert_eq!(os.offset_next(VOLUME_OBJECT, true, 100).unwrap(), 100);
        assert!(matches!(
            os.offset_next(VOLUME_OBJECT, false, 12288),
            Err(Error::NoDevice(_))
        ));
        assert!(matches!(
            os.offset_next(VOLUME_OBJECT, true, 1 << 20),
            Err(Error::NoDevice(_))
        ));
    }

    #[test]
    fn test_free_range_partial_blocks() {
        let pool = pool();
        let os = pool.own("p/v", false).unwrap();
        write(&*os, 0, &[7u8; 3 * 4096]);
        os.free_range(VOLUME_OBJECT, 2048, 4096 + 4096).unwrap();
        let buf = read(&*os, 0, 3 * 4096).unwrap();
        assert!(buf[..2048].iter().all(|&b| b == 7));
        assert!(buf[2048..10240].iter().all(|&b| b == 0));
        assert!(buf[10240..].iter().all(|&b| b == 7));
        assert_eq!(os.space().referenced, 2 * 4096);
    }

    #[test]
    fn test_set_block_size_only_when_empty() {
        let pool = pool();
        let os = pool.own("p/v", false).unwrap();
        let mut tx = os.create_tx();
        tx.assign(TxWait::Wait).unwrap();
        os.set_block_size(VOLUME_OBJECT, 8192, tx.as_ref()).unwrap();
        tx.commit();
        assert_eq!(os.object_block_size(VOLUME_OBJECT).unwrap(), 8192);

        write(&*os, 0, &[1u8; 10]);
        let mut tx = os.create_tx();
        tx.assign(TxWait::Wait).unwrap();
        assert!(matches!(
            os.set_block_size(VOLUME_OBJECT, 16384, tx.as_ref()),
            Err(Error::NotSupported(_))
        ));
        tx.abort();
    }

    #[test]
    fn test_log_commit_survives_crash_and_sync_retires() {
        let pool = pool();
        pool.set_async_commit(false);
        let os = pool.own("p/v", false).unwrap();
        let log = os.open_log(Arc::new(ReadBack(Arc::clone(&os))));

        let mut tx = os.create_tx();
        tx.assign(TxWait::Wait).unwrap();
        log.append(write_record(0, 100, WriteState::NeedCopy), tx.as_ref());
        tx.commit();
        assert_eq!(pool.volatile_records("p/v").len(), 1);

        log.commit(VOLUME_OBJECT);
        assert!(pool.volatile_records("p/v").is_empty());
        let durable = pool.durable_records("p/v");
        assert_eq!(durable.len(), 1);
        assert!(matches!(&durable[0].payload, LogPayload::Write { data: Some(d), .. } if d.len() == 100));

        pool.crash();
        assert_eq!(pool.durable_records("p/v").len(), 1);
        pool.sync();
        assert!(pool.durable_records("p/v").is_empty());
    }

    #[test]
    fn test_async_commit_runs_callback() {
        let pool = pool();
        let os = pool.own("p/v", false).unwrap();
        let log = os.open_log(Arc::new(ReadBack(Arc::clone(&os))));
        assert_eq!(
            log.commit_async(VOLUME_OBJECT, Box::new(|| {})),
            CommitStatus::Immediate
        );

        let mut tx = os.create_tx();
        tx.assign(TxWait::Wait).unwrap();
        log.append(write_record(0, 10, WriteState::NeedCopy), tx.as_ref());
        tx.commit();

        let (sender, receiver) = mpsc::channel();
        let status = log.commit_async(
            VOLUME_OBJECT,
            Box::new(move || {
                let _ = sender.send(());
            }),
        );
        assert_eq!(status, CommitStatus::Pending);
        receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(pool.durable_records("p/v").len(), 1);
    }

    #[test]
    fn test_failed_get_data_falls_back_to_sync() {
        struct Gone;
        impl LogDataProvider for Gone {
            fn get_data(&self, _record: &LogRecord) -> Result<Bytes> {
                Err(Error::io("gone"))
            }
        }

        let pool = pool();
        let os = pool.own("p/v", false).unwrap();
        let log = os.open_log(Arc::new(Gone));
        write(&*os, 0, &[4u8; 512]);
        let mut tx = os.create_tx();
        tx.assign(TxWait::Wait).unwrap();
        log.append(write_record(0, 512, WriteState::NeedCopy), tx.as_ref());
        tx.commit();

        let before = pool.synced_txg();
        log.commit(VOLUME_OBJECT);
        assert!(pool.synced_txg() > before);
        assert!(pool.durable_records("p/v").is_empty());
        pool.crash();
        let os = pool.own("p/v", true).unwrap();
        assert!(read(&*os, 0, 512).unwrap().iter().all(|&b| b == 4));
    }

    #[test]
    fn test_writes_rejected_when_not_writeable() {
        let pool = pool();
        let os = pool.own("p/v", false).unwrap();
        pool.set_pool_writeable(false);
        let mut tx = os.create_tx();
        assert!(matches!(tx.assign(TxWait::Wait), Err(Error::ReadOnly(_))));
        tx.abort();
        assert!(!os.pool_writeable());
    }
}
