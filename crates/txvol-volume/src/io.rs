//! I/O admission engine
//!
//! Every read and write becomes an [`IoContext`] driven through a fixed
//! sequence of states:
//!
//! ```text
//! NotAdmitted ──► Deferred ──┐
//!      │                     ▼
//!      └───────────────► Admitted ──► RangeLocked ──► Transacting
//!                                                         │
//!                               Complete ◄── Logging ◄────┘
//! ```
//!
//! Admission runs on the submitting thread (or the triage queue for callers
//! that cannot block) and never blocks on another request. At most
//! `max_active_per_volume` contexts per volume are past admission; the rest
//! wait in the volume's deferral list and are admitted oldest first as
//! slots free up. Transaction assignment and transfers happen on the worker
//! queue; range-lock waits are continuations and never occupy a worker.
//! Log commits of synchronous writes run on a separate commit queue, since
//! a commit may wait on the range of a request still queued for a worker.
//!
//! The suspend lock is taken shared at submission and released at
//! completion, so a suspend waits for every request already accepted.
//! Triage never waits for a suspend: a request that finds its volume
//! suspended is parked on the suspend lock and re-queued by the resume.

use crate::backend::{CommitStatus, DnodeHandle, Objset, TxWait, VOLUME_OBJECT};
use crate::manager::VolumeManager;
use crate::rangelock::{RangeGuard, RangeMode, RangeWaiter, TryEnter};
use crate::suspend::{SuspendReadGuard, SuspendWaiter, TryRead};
use crate::taskq::Taskq;
use crate::volume::{Volume, VolumeState};
use crate::zil;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::debug;
use txvol_common::{Error, IoDirection, Result, SyncPolicy, VolumeConfig};

/// A block request
#[derive(Clone, Debug)]
pub enum IoRequest {
    Read { offset: u64, length: u64 },
    Write { offset: u64, data: Bytes, sync: bool },
    /// Make every completed write durable
    Flush,
    /// Free a range
    Discard { offset: u64, length: u64, sync: bool },
}

/// Final result of a request
#[derive(Debug, Default)]
pub struct IoOutcome {
    /// Bytes transferred, after truncation at the end of the volume
    pub completed: u64,
    /// Data read
    pub data: Option<Bytes>,
    pub error: Option<Error>,
}

impl IoOutcome {
    pub(crate) fn ok(completed: u64) -> Self {
        Self {
            completed,
            ..Self::default()
        }
    }

    pub(crate) fn failed(error: Error) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Bytes transferred and data read, or the error
    ///
    /// # Errors
    /// The request's error.
    pub fn into_result(self) -> Result<(u64, Option<Bytes>)> {
        match self.error {
            Some(e) => Err(e),
            None => Ok((self.completed, self.data)),
        }
    }
}

/// Completion continuation of a request
pub type IoCompletion = Box<dyn FnOnce(IoOutcome) + Send + 'static>;

/// Whether the submitting thread may block
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitContext {
    /// Triage runs on the caller
    Blocking,
    /// Triage is handed to the triage queue
    NonBlocking,
}

/// Position of a request in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdmissionState {
    NotAdmitted,
    Deferred,
    Admitted,
    RangeLocked,
    Transacting,
    Logging,
    Complete,
}

/// Thread pools and tunables shared by every request
pub(crate) struct Engine {
    pub(crate) config: VolumeConfig,
    triage: Taskq,
    workers: Taskq,
    commits: Taskq,
}

impl Engine {
    pub(crate) fn new(config: &VolumeConfig) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            config: config.clone(),
            triage: Taskq::new("txvol-triage", config.triage_threads)?,
            workers: Taskq::new("txvol-worker", config.worker_threads)?,
            commits: Taskq::new("txvol-commit", config.worker_threads)?,
        }))
    }

    pub(crate) const fn workers(&self) -> &Taskq {
        &self.workers
    }

    /// Effective synchronous flag under the dataset's sync policy
    pub(crate) fn effective_sync(objset: &dyn Objset, requested: bool) -> bool {
        match objset.sync_policy() {
            SyncPolicy::Always => true,
            SyncPolicy::Disabled => false,
            SyncPolicy::Standard => requested,
        }
    }

    pub(crate) fn submit(
        self: &Arc<Self>,
        volume: &Arc<Volume>,
        request: IoRequest,
        done: IoCompletion,
        context: SubmitContext,
    ) {
        match context {
            SubmitContext::Blocking => {
                let suspend = volume.suspend_lock().read();
                self.triage(Arc::clone(volume), request, done, suspend);
            }
            SubmitContext::NonBlocking => {
                let parked = ParkedSubmit {
                    engine: Arc::clone(self),
                    volume: Arc::clone(volume),
                    request,
                    done: Some(done),
                };
                self.triage.dispatch(move || parked.enter());
            }
        }
    }

    fn triage(
        self: &Arc<Self>,
        volume: Arc<Volume>,
        request: IoRequest,
        done: IoCompletion,
        suspend: SuspendReadGuard,
    ) {
        match request {
            IoRequest::Read { offset, length } => {
                let io = NewIo {
                    direction: IoDirection::Read,
                    offset,
                    length,
                    data: None,
                    sync: false,
                };
                self.start(volume, io, done, suspend);
            }
            IoRequest::Write { offset, data, sync } => {
                let io = NewIo {
                    direction: IoDirection::Write,
                    offset,
                    length: data.len() as u64,
                    data: Some(data),
                    sync,
                };
                self.start(volume, io, done, suspend);
            }
            IoRequest::Flush => {
                let outcome = self.flush(&volume);
                drop(suspend);
                done(outcome);
            }
            IoRequest::Discard {
                offset,
                length,
                sync,
            } => {
                let outcome = self.discard(&volume, offset, length, sync);
                drop(suspend);
                done(outcome);
            }
        }
    }

    fn start(
        self: &Arc<Self>,
        volume: Arc<Volume>,
        io: NewIo,
        done: IoCompletion,
        mut suspend: SuspendReadGuard,
    ) {
        // Released on whichever thread completes the request
        suspend.detach();
        let ctx = Box::new(IoContext {
            volume,
            engine: Arc::clone(self),
            direction: io.direction,
            offset: io.offset,
            length: io.length,
            data: io.data,
            sync: io.sync,
            block_size: 0,
            state: AdmissionState::NotAdmitted,
            suspend: Some(suspend),
            backing: None,
            range: None,
            completed: 0,
            error: None,
            done: Some(done),
            started: Instant::now(),
        });
        drive(ctx, false);
    }
}

/// Parameters of a read or write entering admission
struct NewIo {
    direction: IoDirection,
    offset: u64,
    length: u64,
    data: Option<Bytes>,
    sync: bool,
}

/// A non-blocking submission, parked on the suspend lock while its volume
/// is suspended
struct ParkedSubmit {
    engine: Arc<Engine>,
    volume: Arc<Volume>,
    request: IoRequest,
    done: Option<IoCompletion>,
}

impl ParkedSubmit {
    /// Runs on the triage queue
    fn enter(self) {
        let lock = Arc::clone(self.volume.suspend_lock());
        match lock.try_read_or_park(self) {
            TryRead::Entered(suspend, mut parked) => {
                if let Some(done) = parked.done.take() {
                    let volume = Arc::clone(&parked.volume);
                    let request = parked.request.clone();
                    parked.engine.triage(volume, request, done, suspend);
                }
            }
            TryRead::Parked => debug!("volume suspended, request parked"),
        }
    }
}

impl SuspendWaiter for ParkedSubmit {
    fn released(self: Box<Self>) {
        let parked = *self;
        let engine = Arc::clone(&parked.engine);
        engine.triage.dispatch(move || parked.enter());
    }
}

impl Drop for ParkedSubmit {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            done(IoOutcome::failed(Error::Interrupted(
                "volume went away while suspended".to_string(),
            )));
        }
    }
}

/// One in-flight read or write
pub(crate) struct IoContext {
    volume: Arc<Volume>,
    engine: Arc<Engine>,
    direction: IoDirection,
    offset: u64,
    length: u64,
    /// Payload of a write, result of a read
    data: Option<Bytes>,
    sync: bool,
    block_size: u64,
    state: AdmissionState,
    suspend: Option<SuspendReadGuard>,
    backing: Option<(Arc<dyn Objset>, DnodeHandle)>,
    range: Option<RangeGuard>,
    completed: u64,
    error: Option<Error>,
    done: Option<IoCompletion>,
    started: Instant,
}

impl IoContext {
    fn fail(&mut self, error: Error) {
        debug!(offset = self.offset, length = self.length, error = %error, "request failed");
        self.error = Some(error);
        self.state = AdmissionState::Complete;
    }

    /// Check the request against the volume as it is now and capture the
    /// backing dataset. Returns false when nothing is left to transfer.
    fn validate(&mut self, state: &VolumeState) -> Result<bool> {
        let backing = state
            .backing
            .as_ref()
            .ok_or_else(|| Error::NoDevice(state.name.clone()))?;
        if self.direction == IoDirection::Write && state.read_only {
            return Err(Error::read_only(state.name.clone()));
        }
        if self.offset >= state.volsize {
            // Starting exactly at the end transfers nothing
            if self.direction == IoDirection::Write
                && self.offset > state.volsize
                && self.length > 0
            {
                return Err(Error::invalid_argument(format!(
                    "write at {} beyond end of {}",
                    self.offset, state.name
                )));
            }
            self.length = 0;
            return Ok(false);
        }
        let length = self.length.min(state.volsize - self.offset);
        if length < self.length {
            self.length = length;
            if let Some(data) = self.data.as_mut() {
                #[allow(clippy::cast_possible_truncation)]
                data.truncate(length as usize);
            }
        }
        if self.length == 0 {
            return Ok(false);
        }
        self.backing = Some((Arc::clone(&backing.objset), backing.dnode.clone()));
        self.block_size = state.volblocksize;
        Ok(true)
    }

    /// Admit, defer or reject a new request. Returns `None` once the
    /// context has been parked on the deferral list.
    fn admit(mut self: Box<Self>) -> Option<Box<Self>> {
        let mut state = self.volume.lock_state();
        match self.validate(&state) {
            Err(e) => {
                drop(state);
                self.fail(e);
                return Some(self);
            }
            Ok(false) => {
                drop(state);
                self.state = AdmissionState::Complete;
                return Some(self);
            }
            Ok(true) => {}
        }

        let config = &self.engine.config;
        if state.active >= config.max_active_per_volume {
            if state.deferred.len() >= config.max_deferred_per_volume {
                let name = state.name.clone();
                drop(state);
                self.fail(Error::QueueFull(name));
                return Some(self);
            }
            debug!(
                volume = %state.name,
                offset = self.offset,
                active = state.active,
                deferred = state.deferred.len(),
                "deferring request"
            );
            self.volume.stats().record_deferred();
            self.state = AdmissionState::Deferred;
            state.deferred.push_back(self);
            return None;
        }
        state.active += 1;
        drop(state);
        self.admitted();
        Some(self)
    }

    fn admitted(&mut self) {
        self.state = AdmissionState::Admitted;
        if let Some((objset, _)) = &self.backing {
            if self.direction == IoDirection::Read {
                objset.prefetch(VOLUME_OBJECT, self.offset, self.length);
            } else {
                self.sync = Engine::effective_sync(objset.as_ref(), self.sync);
            }
        }
    }

    fn range_mode(&self) -> RangeMode {
        match self.direction {
            IoDirection::Read => RangeMode::Reader,
            IoDirection::Write => RangeMode::Writer,
        }
    }

    fn transfer(&mut self) {
        let Some((objset, dnode)) = self.backing.clone() else {
            self.error = Some(Error::internal("transfer without backing"));
            return;
        };
        let result = match self.direction {
            IoDirection::Read => self.read(objset.as_ref(), &dnode),
            IoDirection::Write => self.write(&objset, &dnode),
        };
        match result {
            Ok(()) => self.completed = self.length,
            Err(e) => self.error = Some(e.into_device_error()),
        }
    }

    fn read(&mut self, objset: &dyn Objset, dnode: &DnodeHandle) -> Result<()> {
        let length =
            usize::try_from(self.length).map_err(|_| Error::Overflow(self.length.to_string()))?;
        let mut buf = vec![0u8; length];
        objset.read(dnode, self.offset, &mut buf)?;
        self.data = Some(Bytes::from(buf));
        Ok(())
    }

    fn write(&self, objset: &Arc<dyn Objset>, dnode: &DnodeHandle) -> Result<()> {
        let data = self
            .data
            .as_ref()
            .ok_or_else(|| Error::internal("write without data"))?;
        let log = self.volume.ensure_log(objset, dnode);

        let mut tx = objset.create_tx();
        tx.hold_write(VOLUME_OBJECT, self.offset, self.length);
        if let Err(e) = tx.assign(TxWait::Wait) {
            tx.abort();
            return Err(e);
        }
        let result = objset.write(dnode, self.offset, data, tx.as_ref());
        if result.is_ok() {
            zil::log_write(
                log.as_ref(),
                objset.as_ref(),
                tx.as_ref(),
                self.offset,
                data,
                self.block_size,
                self.sync,
                self.engine.config.immediate_write_size,
            );
        }
        tx.commit();
        result
    }

    /// Request the log commit of a synchronous write. Returns `None` when
    /// the commit completes asynchronously and will resume the context.
    fn start_commit(mut self: Box<Self>) -> Option<Box<Self>> {
        let Some(log) = self.volume.log() else {
            self.state = AdmissionState::Complete;
            return Some(self);
        };
        self.volume.stats().record_log_commit();

        // Shared with the callback, which may run before commit_async returns
        let slot = Arc::new(Mutex::new(Some(self)));
        let waiter = Arc::clone(&slot);
        let status = log.commit_async(
            VOLUME_OBJECT,
            Box::new(move || {
                if let Some(mut ctx) = waiter.lock().take() {
                    ctx.state = AdmissionState::Complete;
                    let engine = Arc::clone(&ctx.engine);
                    engine.workers.dispatch(move || drive(ctx, true));
                }
            }),
        );
        match status {
            CommitStatus::Pending => None,
            CommitStatus::Immediate => {
                let mut ctx = slot.lock().take()?;
                ctx.state = AdmissionState::Complete;
                Some(ctx)
            }
        }
    }

    fn finish(mut self: Box<Self>) {
        let latency = u64::try_from(self.started.elapsed().as_micros()).unwrap_or(u64::MAX);
        let stats = self.volume.stats();
        match (&self.error, self.direction) {
            (Some(_), _) => stats.record_error(),
            (None, IoDirection::Read) => stats.record_read(self.completed, latency),
            (None, IoDirection::Write) => stats.record_write(self.completed, latency),
        }
        if self.direction == IoDirection::Read && self.error.is_none() && self.data.is_none() {
            self.data = Some(Bytes::new());
        }
        let outcome = IoOutcome {
            completed: self.completed,
            data: if self.direction == IoDirection::Read {
                self.data.take()
            } else {
                None
            },
            error: self.error.take(),
        };
        self.range = None;
        self.suspend = None;
        if let Some(done) = self.done.take() {
            done(outcome);
        }
    }
}

impl Drop for IoContext {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            done(IoOutcome::failed(Error::Interrupted(
                "request dropped before completion".to_string(),
            )));
        }
    }
}

/// Continuation queued on a busy range
struct LockWaiter {
    ctx: Box<IoContext>,
}

impl RangeWaiter for LockWaiter {
    fn granted(self: Box<Self>, guard: RangeGuard) {
        let mut ctx = self.ctx;
        ctx.range = Some(guard);
        ctx.state = AdmissionState::RangeLocked;
        ctx.volume.stats().record_range_wait();
        let engine = Arc::clone(&ctx.engine);
        engine.workers.dispatch(move || drive(ctx, true));
    }
}

/// Hand an admission slot to the oldest deferred request, or give it back
fn release_slot(volume: &Arc<Volume>, engine: &Engine) {
    let mut state = volume.lock_state();
    while let Some(mut next) = state.deferred.pop_front() {
        match next.validate(&state) {
            Ok(true) => {
                drop(state);
                next.admitted();
                engine.workers.dispatch(move || drive(next, true));
                return;
            }
            Ok(false) => next.state = AdmissionState::Complete,
            Err(e) => next.fail(e),
        }
        // Nothing to transfer: complete it and keep looking
        engine.workers.dispatch(move || drive(next, true));
    }
    state.active -= 1;
}

/// Run a context until it completes or parks on a continuation
pub(crate) fn drive(mut ctx: Box<IoContext>, on_worker: bool) {
    loop {
        match ctx.state {
            AdmissionState::NotAdmitted => match ctx.admit() {
                Some(admitted) => ctx = admitted,
                None => return,
            },
            AdmissionState::Deferred => {
                // Deferred contexts are re-admitted by release_slot
                ctx.admitted();
            }
            AdmissionState::Admitted => {
                let lock = ctx.volume.range_lock().clone();
                let (offset, length, mode) = (ctx.offset, ctx.length, ctx.range_mode());
                match lock.try_enter_async(offset, length, mode, LockWaiter { ctx }) {
                    TryEnter::Granted(guard, LockWaiter { ctx: granted }) => {
                        ctx = granted;
                        ctx.range = Some(guard);
                        ctx.state = AdmissionState::RangeLocked;
                    }
                    TryEnter::Pending => return,
                }
            }
            AdmissionState::RangeLocked => {
                if !on_worker {
                    let engine = Arc::clone(&ctx.engine);
                    engine.workers.dispatch(move || drive(ctx, true));
                    return;
                }
                ctx.state = AdmissionState::Transacting;
            }
            AdmissionState::Transacting => {
                ctx.transfer();
                ctx.range = None;
                let volume = Arc::clone(&ctx.volume);
                release_slot(&volume, &ctx.engine);
                let commit =
                    ctx.error.is_none() && ctx.direction == IoDirection::Write && ctx.sync;
                ctx.state = if commit {
                    AdmissionState::Logging
                } else {
                    AdmissionState::Complete
                };
            }
            AdmissionState::Logging => {
                // A commit may block on the range of a request queued for a
                // worker, so it never runs on one
                if !ctx.engine.commits.is_worker_thread() {
                    let engine = Arc::clone(&ctx.engine);
                    engine.commits.dispatch(move || drive(ctx, true));
                    return;
                }
                match ctx.start_commit() {
                    Some(committed) => ctx = committed,
                    None => return,
                }
            }
            AdmissionState::Complete => {
                ctx.finish();
                return;
            }
        }
    }
}

impl VolumeManager {
    /// Submit a request; `done` runs exactly once with its outcome.
    ///
    /// With [`SubmitContext::Blocking`] the caller may block briefly on the
    /// volume's suspend lock and runs flush and discard inline.
    pub fn submit(
        &self,
        volume: &Arc<Volume>,
        request: IoRequest,
        done: IoCompletion,
        context: SubmitContext,
    ) {
        self.engine().submit(volume, request, done, context);
    }

    /// Submit and block the calling thread until the request completes.
    ///
    /// Must not be called from inside an async runtime.
    #[must_use]
    pub fn submit_wait(&self, volume: &Arc<Volume>, request: IoRequest) -> IoOutcome {
        let (sender, receiver) = oneshot::channel();
        self.submit(
            volume,
            request,
            Box::new(move |outcome| {
                let _ = sender.send(outcome);
            }),
            SubmitContext::Blocking,
        );
        receiver
            .blocking_recv()
            .unwrap_or_else(|_| IoOutcome::failed(Error::internal("completion dropped")))
    }

    async fn submit_async(&self, volume: &Arc<Volume>, request: IoRequest) -> IoOutcome {
        let (sender, receiver) = oneshot::channel();
        self.submit(
            volume,
            request,
            Box::new(move |outcome| {
                let _ = sender.send(outcome);
            }),
            SubmitContext::NonBlocking,
        );
        receiver
            .await
            .unwrap_or_else(|_| IoOutcome::failed(Error::internal("completion dropped")))
    }

    /// Read up to `length` bytes at `offset`; short at the end of the volume
    ///
    /// # Errors
    /// `NoDevice` when the volume is not open, `Io` on device failures.
    pub async fn read_at(&self, volume: &Arc<Volume>, offset: u64, length: u64) -> Result<Bytes> {
        let outcome = self
            .submit_async(volume, IoRequest::Read { offset, length })
            .await;
        outcome
            .into_result()
            .map(|(_, data)| data.unwrap_or_default())
    }

    /// Write `data` at `offset`; returns the bytes written
    ///
    /// # Errors
    /// `ReadOnly`, `InvalidArgument` past the end, `QueueFull`, `Io`.
    pub async fn write_at(
        &self,
        volume: &Arc<Volume>,
        offset: u64,
        data: Bytes,
        sync: bool,
    ) -> Result<u64> {
        let outcome = self
            .submit_async(volume, IoRequest::Write { offset, data, sync })
            .await;
        outcome.into_result().map(|(completed, _)| completed)
    }

    /// Make every completed write durable
    ///
    /// # Errors
    /// `NoDevice` when the volume is not open.
    pub async fn flush(&self, volume: &Arc<Volume>) -> Result<()> {
        self.submit_async(volume, IoRequest::Flush)
            .await
            .into_result()
            .map(|_| ())
    }

    /// Free `length` bytes at `offset`
    ///
    /// # Errors
    /// `NotSupported` when discard is disabled, `ReadOnly`, `Io`.
    pub async fn discard(
        &self,
        volume: &Arc<Volume>,
        offset: u64,
        length: u64,
        sync: bool,
    ) -> Result<u64> {
        let outcome = self
            .submit_async(
                volume,
                IoRequest::Discard {
                    offset,
                    length,
                    sync,
                },
            )
            .await;
        outcome.into_result().map(|(completed, _)| completed)
    }
}
