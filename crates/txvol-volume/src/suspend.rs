//! Per-volume suspend lock
//!
//! A writer-preferring reader/writer lock whose guards are owned values.
//! Readers are in-flight requests and opens; the writer is an administrative
//! suspend that must be able to release the lock from whichever thread
//! later calls resume, so guards hold an `Arc` instead of a borrow.

use crate::lockorder::{self, LockLevel};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// Work queued by a reader that could not wait for the writer
pub trait SuspendWaiter: Send + 'static {
    /// Runs once no writer holds or waits for the lock, on the thread that
    /// let go of it. Must not block.
    fn released(self: Box<Self>);
}

/// Result of [`SuspendLock::try_read_or_park`]
pub enum TryRead<W> {
    /// The reader got in; the waiter is handed back unused
    Entered(SuspendReadGuard, W),
    /// The waiter was queued
    Parked,
}

#[derive(Default)]
struct Parked(Vec<Box<dyn SuspendWaiter>>);

impl std::fmt::Debug for Parked {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Parked({})", self.0.len())
    }
}

#[derive(Debug, Default)]
struct SuspendState {
    readers: usize,
    writer: bool,
    writers_waiting: usize,
    parked: Parked,
}

/// Writer-preferring reader/writer lock with owned guards
#[derive(Debug, Default)]
pub struct SuspendLock {
    state: Mutex<SuspendState>,
    cv: Condvar,
}

impl SuspendLock {
    /// Create an unlocked suspend lock
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquire as a reader, blocking while a writer holds or waits for it
    pub fn read(self: &Arc<Self>) -> SuspendReadGuard {
        lockorder::before_blocking(LockLevel::Suspend);
        let mut state = self.state.lock();
        while state.writer || state.writers_waiting > 0 {
            self.cv.wait(&mut state);
        }
        state.readers += 1;
        drop(state);
        SuspendReadGuard::new(Arc::clone(self))
    }

    /// Acquire as a reader without blocking
    #[must_use]
    pub fn try_read(self: &Arc<Self>) -> Option<SuspendReadGuard> {
        let mut state = self.state.lock();
        if state.writer || state.writers_waiting > 0 {
            return None;
        }
        state.readers += 1;
        drop(state);
        Some(SuspendReadGuard::new(Arc::clone(self)))
    }

    /// Acquire as a reader without blocking, or queue `waiter` to run when
    /// the writer lets go
    pub fn try_read_or_park<W: SuspendWaiter>(self: &Arc<Self>, waiter: W) -> TryRead<W> {
        let mut state = self.state.lock();
        if state.writer || state.writers_waiting > 0 {
            state.parked.0.push(Box::new(waiter));
            return TryRead::Parked;
        }
        state.readers += 1;
        drop(state);
        TryRead::Entered(SuspendReadGuard::new(Arc::clone(self)), waiter)
    }

    /// Readers queued behind the writer
    #[must_use]
    pub fn parked(&self) -> usize {
        self.state.lock().parked.0.len()
    }

    /// Acquire exclusively, waiting for every reader to leave
    pub fn write(self: &Arc<Self>) -> SuspendWriteGuard {
        lockorder::before_blocking(LockLevel::Suspend);
        let mut state = self.state.lock();
        state.writers_waiting += 1;
        while state.writer || state.readers > 0 {
            self.cv.wait(&mut state);
        }
        state.writers_waiting -= 1;
        state.writer = true;
        drop(state);
        SuspendWriteGuard::new(Arc::clone(self))
    }

    /// Acquire exclusively without blocking
    #[must_use]
    pub fn try_write(self: &Arc<Self>) -> Option<SuspendWriteGuard> {
        let mut state = self.state.lock();
        if state.writer || state.readers > 0 {
            return None;
        }
        state.writer = true;
        drop(state);
        Some(SuspendWriteGuard::new(Arc::clone(self)))
    }

    /// Whether a writer currently holds the lock
    #[must_use]
    pub fn is_write_locked(&self) -> bool {
        self.state.lock().writer
    }

    /// Number of readers currently inside
    #[must_use]
    pub fn readers(&self) -> usize {
        self.state.lock().readers
    }

    fn release_read(&self) {
        let mut state = self.state.lock();
        state.readers -= 1;
        if state.readers == 0 {
            self.cv.notify_all();
        }
    }

    fn release_write(&self) {
        let parked = {
            let mut state = self.state.lock();
            state.writer = false;
            self.cv.notify_all();
            // A queued writer releases them in turn
            if state.writers_waiting > 0 {
                Vec::new()
            } else {
                std::mem::take(&mut state.parked.0)
            }
        };
        for waiter in parked {
            waiter.released();
        }
    }
}

/// Shared hold on a suspend lock
#[derive(Debug)]
pub struct SuspendReadGuard {
    lock: Arc<SuspendLock>,
    tracked: bool,
}

impl SuspendReadGuard {
    fn new(lock: Arc<SuspendLock>) -> Self {
        lockorder::acquired(LockLevel::Suspend);
        Self {
            lock,
            tracked: true,
        }
    }

    /// Stop tracking this guard in the calling thread's lock order state.
    ///
    /// Called before the guard is handed to another thread.
    pub fn detach(&mut self) {
        if self.tracked {
            self.tracked = false;
            lockorder::released(LockLevel::Suspend);
        }
    }
}

impl Drop for SuspendReadGuard {
    fn drop(&mut self) {
        self.detach();
        self.lock.release_read();
    }
}

/// Exclusive hold on a suspend lock
#[derive(Debug)]
pub struct SuspendWriteGuard {
    lock: Arc<SuspendLock>,
    tracked: bool,
}

impl SuspendWriteGuard {
    fn new(lock: Arc<SuspendLock>) -> Self {
        lockorder::acquired(LockLevel::Suspend);
        Self {
            lock,
            tracked: true,
        }
    }

    /// Stop tracking this guard in the calling thread's lock order state.
    pub fn detach(&mut self) {
        if self.tracked {
            self.tracked = false;
            lockorder::released(LockLevel::Suspend);
        }
    }
}

impl Drop for SuspendWriteGuard {
    fn drop(&mut self) {
        self.detach();
        self.lock.release_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_readers_share() {
        let lock = SuspendLock::new();
        let a = lock.read();
        let b = lock.try_read();
        assert!(b.is_some());
        assert_eq!(lock.readers(), 2);
        assert!(lock.try_write().is_none());
        drop(a);
        drop(b);
        assert!(lock.try_write().is_some());
    }

    #[test]
    fn test_writer_excludes_readers() {
        let lock = SuspendLock::new();
        let w = lock.write();
        assert!(lock.is_write_locked());
        assert!(lock.try_read().is_none());
        drop(w);
        assert!(lock.try_read().is_some());
    }

    #[test]
    fn test_waiting_writer_blocks_new_readers() {
        let lock = SuspendLock::new();
        let mut reader = lock.read();
        reader.detach();

        let (tx, rx) = mpsc::channel();
        let writer_lock = Arc::clone(&lock);
        let writer = thread::spawn(move || {
            let mut guard = writer_lock.write();
            guard.detach();
            tx.send(()).unwrap();
            guard
        });

        // Give the writer time to register as waiting
        while lock.state.lock().writers_waiting == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(lock.try_read().is_none());
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        drop(reader);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let guard = writer.join().unwrap();
        assert!(lock.is_write_locked());
        drop(guard);
        assert!(!lock.is_write_locked());
    }

    struct Ping(mpsc::Sender<&'static str>);

    impl SuspendWaiter for Ping {
        fn released(self: Box<Self>) {
            let _ = self.0.send("released");
        }
    }

    #[test]
    fn test_parked_reader_runs_on_release() {
        let lock = SuspendLock::new();
        let (tx, rx) = mpsc::channel();
        match lock.try_read_or_park(Ping(tx.clone())) {
            TryRead::Entered(guard, _) => drop(guard),
            TryRead::Parked => panic!("free lock must admit the reader"),
        }

        let writer = lock.write();
        assert!(matches!(lock.try_read_or_park(Ping(tx)), TryRead::Parked));
        assert_eq!(lock.parked(), 1);
        assert!(rx.try_recv().is_err());

        drop(writer);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "released");
        assert_eq!(lock.parked(), 0);
    }

    #[test]
    fn test_write_guard_released_on_other_thread() {
        let lock = SuspendLock::new();
        let mut guard = lock.write();
        guard.detach();
        thread::spawn(move || drop(guard)).join().unwrap();
        assert!(lock.try_read().is_some());
    }
}
