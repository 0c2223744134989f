//! Byte-range lock
//!
//! Grants shared (reader) or exclusive (writer) access to byte ranges of
//! one volume. Requests are granted in arrival order: a request never
//! overtakes an earlier request it conflicts with, so writes to overlapping
//! ranges are applied in the order their locks were requested.
//!
//! Two ways to wait are offered. [`RangeLock::enter`] blocks the calling
//! thread. [`RangeLock::try_enter_async`] never blocks; when the range is
//! busy it queues a [`RangeWaiter`] that is handed the guard once granted.
//! Waiters run after the internal mutex is released, on the thread that
//! released the conflicting range.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;

/// Access mode of a range lock
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeMode {
    Reader,
    Writer,
}

/// Continuation run when a queued asynchronous request is granted
pub trait RangeWaiter: Send + 'static {
    /// Called exactly once with the granted guard
    fn granted(self: Box<Self>, guard: RangeGuard);
}

/// Result of a non-blocking acquisition attempt
pub enum TryEnter<W> {
    /// Granted immediately; the waiter is handed back unused
    Granted(RangeGuard, W),
    /// Queued; the waiter will be called once the range is free
    Pending,
}

#[derive(Clone, Copy, Debug)]
struct Span {
    start: u64,
    end: u64,
    mode: RangeMode,
}

impl Span {
    fn new(offset: u64, length: u64, mode: RangeMode) -> Self {
        Self {
            start: offset,
            end: offset.saturating_add(length),
            mode,
        }
    }

    fn is_empty(&self) -> bool {
        self.start == self.end
    }

    fn conflicts(&self, other: &Self) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        let overlap = self.start < other.end && other.start < self.end;
        overlap && (self.mode == RangeMode::Writer || other.mode == RangeMode::Writer)
    }
}

enum WaitKind {
    Blocking,
    Async(Box<dyn RangeWaiter>),
}

struct Waiter {
    id: u64,
    span: Span,
    kind: WaitKind,
}

#[derive(Default)]
struct LockState {
    next_id: u64,
    held: Vec<(u64, Span)>,
    waiting: VecDeque<Waiter>,
    contended: u64,
}

impl LockState {
    fn conflicts_held(&self, span: &Span) -> bool {
        self.held.iter().any(|(_, h)| h.conflicts(span))
    }

    fn conflicts_waiting(&self, span: &Span) -> bool {
        self.waiting.iter().any(|w| w.span.conflicts(span))
    }

    fn is_held(&self, id: u64) -> bool {
        self.held.iter().any(|(held, _)| *held == id)
    }
}

struct Inner {
    state: Mutex<LockState>,
    granted: Condvar,
}

/// Byte-range lock of one volume
#[derive(Clone)]
pub struct RangeLock {
    inner: Arc<Inner>,
}

impl Default for RangeLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RangeLock {
    /// Create a lock with no ranges held
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(LockState::default()),
                granted: Condvar::new(),
            }),
        }
    }

    /// Acquire `[offset, offset + length)`, blocking until it is available
    pub fn enter(&self, offset: u64, length: u64, mode: RangeMode) -> RangeGuard {
        let span = Span::new(offset, length, mode);
        let mut state = self.inner.state.lock();
        let id = state.next_id;
        state.next_id += 1;

        if !state.conflicts_held(&span) && !state.conflicts_waiting(&span) {
            state.held.push((id, span));
            return self.guard(id, span);
        }

        state.contended += 1;
        state.waiting.push_back(Waiter {
            id,
            span,
            kind: WaitKind::Blocking,
        });
        while !state.is_held(id) {
            self.inner.granted.wait(&mut state);
        }
        self.guard(id, span)
    }

    /// Acquire without blocking.
    ///
    /// When the range is busy `waiter` is queued and [`TryEnter::Pending`]
    /// is returned; the waiter later receives the guard.
    pub fn try_enter_async<W: RangeWaiter>(
        &self,
        offset: u64,
        length: u64,
        mode: RangeMode,
        waiter: W,
    ) -> TryEnter<W> {
        let span = Span::new(offset, length, mode);
        let mut state = self.inner.state.lock();
        let id = state.next_id;
        state.next_id += 1;

        if !state.conflicts_held(&span) && !state.conflicts_waiting(&span) {
            state.held.push((id, span));
            drop(state);
            return TryEnter::Granted(self.guard(id, span), waiter);
        }

        state.contended += 1;
        state.waiting.push_back(Waiter {
            id,
            span,
            kind: WaitKind::Async(Box::new(waiter)),
        });
        TryEnter::Pending
    }

    /// Release a held range. Equivalent to dropping the guard.
    pub fn exit(guard: RangeGuard) {
        drop(guard);
    }

    /// Number of ranges currently held
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.inner.state.lock().held.len()
    }

    /// Number of requests queued behind a conflicting range
    #[must_use]
    pub fn waiting_count(&self) -> usize {
        self.inner.state.lock().waiting.len()
    }

    /// Number of requests that ever had to wait
    #[must_use]
    pub fn contended(&self) -> u64 {
        self.inner.state.lock().contended
    }

    fn guard(&self, id: u64, span: Span) -> RangeGuard {
        RangeGuard {
            lock: Arc::clone(&self.inner),
            id,
            offset: span.start,
            length: span.end - span.start,
            mode: span.mode,
        }
    }

    fn release(inner: &Arc<Inner>, id: u64) {
        let mut ready = Vec::new();
        let mut wake_blocking = false;
        {
            let mut state = inner.state.lock();
            state.held.retain(|(held, _)| *held != id);

            let mut still_waiting: VecDeque<Waiter> = VecDeque::with_capacity(state.waiting.len());
            while let Some(waiter) = state.waiting.pop_front() {
                let blocked = state.conflicts_held(&waiter.span)
                    || still_waiting.iter().any(|w| w.span.conflicts(&waiter.span));
                if blocked {
                    still_waiting.push_back(waiter);
                    continue;
                }
                state.held.push((waiter.id, waiter.span));
                match waiter.kind {
                    WaitKind::Blocking => wake_blocking = true,
                    WaitKind::Async(cont) => ready.push((waiter.id, waiter.span, cont)),
                }
            }
            state.waiting = still_waiting;
        }

        if wake_blocking {
            inner.granted.notify_all();
        }
        for (id, span, cont) in ready {
            let guard = RangeGuard {
                lock: Arc::clone(inner),
                id,
                offset: span.start,
                length: span.end - span.start,
                mode: span.mode,
            };
            cont.granted(guard);
        }
    }
}

/// A held range; released exactly once, when dropped
pub struct RangeGuard {
    lock: Arc<Inner>,
    id: u64,
    offset: u64,
    length: u64,
    mode: RangeMode,
}

impl RangeGuard {
    /// Start of the held range
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Length of the held range
    #[must_use]
    pub const fn length(&self) -> u64 {
        self.length
    }

    /// Mode the range is held in
    #[must_use]
    pub const fn mode(&self) -> RangeMode {
        self.mode
    }
}

impl std::fmt::Debug for RangeGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeGuard")
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Drop for RangeGuard {
    fn drop(&mut self) {
        RangeLock::release(&self.lock, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    struct Notify(mpsc::Sender<RangeGuard>);

    impl RangeWaiter for Notify {
        fn granted(self: Box<Self>, guard: RangeGuard) {
            let _ = self.0.send(guard);
        }
    }

    #[test]
    fn test_readers_share_writers_exclude() {
        let lock = RangeLock::new();
        let r1 = lock.enter(0, 100, RangeMode::Reader);
        let r2 = lock.enter(50, 100, RangeMode::Reader);
        assert_eq!(lock.held_count(), 2);

        let (tx, rx) = mpsc::channel();
        assert!(matches!(
            lock.try_enter_async(40, 20, RangeMode::Writer, Notify(tx)),
            TryEnter::Pending
        ));
        drop(r1);
        assert!(rx.try_recv().is_err());
        drop(r2);
        let w = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(w.mode(), RangeMode::Writer);
        assert_eq!(w.offset(), 40);
    }

    #[test]
    fn test_disjoint_writers_run_in_parallel() {
        let lock = RangeLock::new();
        let (tx, _rx) = mpsc::channel();
        let a = lock.enter(0, 4096, RangeMode::Writer);
        match lock.try_enter_async(4096, 4096, RangeMode::Writer, Notify(tx)) {
            TryEnter::Granted(b, _) => assert_eq!(b.offset(), 4096),
            TryEnter::Pending => panic!("disjoint range must not wait"),
        }
        drop(a);
    }

    #[test]
    fn test_zero_length_never_conflicts() {
        let lock = RangeLock::new();
        let _w = lock.enter(0, 4096, RangeMode::Writer);
        let (tx, _rx) = mpsc::channel();
        assert!(matches!(
            lock.try_enter_async(100, 0, RangeMode::Writer, Notify(tx.clone())),
            TryEnter::Granted(..)
        ));
        // Nor does it wait behind a queued writer
        assert!(matches!(
            lock.try_enter_async(0, 4096, RangeMode::Writer, Notify(tx)),
            TryEnter::Pending
        ));
        let r = lock.enter(100, 0, RangeMode::Reader);
        assert_eq!(r.offset(), 100);
    }

    #[test]
    fn test_fifo_no_overtaking() {
        let lock = RangeLock::new();
        let reader = lock.enter(0, 100, RangeMode::Reader);

        let (wtx, wrx) = mpsc::channel();
        assert!(matches!(
            lock.try_enter_async(0, 100, RangeMode::Writer, Notify(wtx)),
            TryEnter::Pending
        ));

        // A second reader would be compatible with the held reader but must
        // not overtake the queued writer.
        let (rtx, rrx) = mpsc::channel();
        assert!(matches!(
            lock.try_enter_async(0, 100, RangeMode::Reader, Notify(rtx)),
            TryEnter::Pending
        ));

        drop(reader);
        let writer = wrx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(rrx.try_recv().is_err());
        drop(writer);
        let _reader = rrx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(lock.waiting_count(), 0);
    }

    #[test]
    fn test_blocking_enter_wakes() {
        let lock = RangeLock::new();
        let w = lock.enter(0, 512, RangeMode::Writer);
        let other = lock.clone();
        let handle = thread::spawn(move || {
            let g = other.enter(256, 512, RangeMode::Reader);
            g.offset()
        });
        while lock.waiting_count() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        RangeLock::exit(w);
        assert_eq!(handle.join().unwrap(), 256);
        assert_eq!(lock.held_count(), 0);
        assert_eq!(lock.contended(), 1);
    }
}
