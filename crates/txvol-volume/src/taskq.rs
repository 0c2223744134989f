//! Task queues
//!
//! A fixed pool of named threads draining a FIFO of jobs. With one thread a
//! queue executes its jobs strictly in dispatch order, which is what the
//! per-pool administrative queues rely on.

use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, error};
use txvol_common::Result;

/// Identifier of a dispatched job
pub type TaskId = u64;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct QueueState {
    jobs: VecDeque<(TaskId, Job)>,
    /// Dispatched and not yet finished
    pending: BTreeSet<TaskId>,
    next_id: TaskId,
    shutdown: bool,
}

struct Shared {
    name: String,
    state: Mutex<QueueState>,
    work: Condvar,
    done: Condvar,
}

/// Named worker pool
pub struct Taskq {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    thread_ids: Vec<ThreadId>,
}

impl Taskq {
    /// Start `nthreads` workers named `<name>-<n>`
    ///
    /// # Errors
    /// Returns an error when a worker thread cannot be spawned.
    pub fn new(name: &str, nthreads: usize) -> Result<Self> {
        let shared = Arc::new(Shared {
            name: name.to_string(),
            state: Mutex::new(QueueState {
                next_id: 1,
                ..QueueState::default()
            }),
            work: Condvar::new(),
            done: Condvar::new(),
        });

        let mut threads = Vec::with_capacity(nthreads);
        for n in 0..nthreads.max(1) {
            let worker = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("{name}-{n}"))
                .spawn(move || worker_main(&worker))?;
            threads.push(handle);
        }
        let thread_ids = threads.iter().map(|h| h.thread().id()).collect();
        debug!(queue = name, threads = nthreads.max(1), "task queue started");

        Ok(Self {
            shared,
            threads: Mutex::new(threads),
            thread_ids,
        })
    }

    /// Queue name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Queue a job; returns its id for [`Taskq::wait_id`]
    pub fn dispatch<F>(&self, job: F) -> TaskId
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.pending.insert(id);
        state.jobs.push_back((id, Box::new(job)));
        drop(state);
        self.shared.work.notify_one();
        id
    }

    /// Block until the job `id` has finished.
    ///
    /// Must not be called from one of this queue's own workers for a job
    /// queued behind the caller.
    pub fn wait_id(&self, id: TaskId) {
        let mut state = self.shared.state.lock();
        while state.pending.contains(&id) {
            self.shared.done.wait(&mut state);
        }
    }

    /// Block until every job dispatched before this call has finished
    pub fn wait_outstanding(&self) {
        let mut state = self.shared.state.lock();
        let last = state.next_id;
        while state.pending.range(..last).next().is_some() {
            self.shared.done.wait(&mut state);
        }
    }

    /// Jobs dispatched and not yet finished
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Whether the calling thread is one of this queue's workers
    #[must_use]
    pub fn is_worker_thread(&self) -> bool {
        self.thread_ids.contains(&thread::current().id())
    }
}

impl Drop for Taskq {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.work.notify_all();

        let current = thread::current().id();
        for handle in self.threads.lock().drain(..) {
            // The last reference may be dropped by one of our own jobs
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

fn worker_main(shared: &Shared) {
    loop {
        let (id, job) = {
            let mut state = shared.state.lock();
            loop {
                if let Some(next) = state.jobs.pop_front() {
                    break next;
                }
                if state.shutdown {
                    return;
                }
                shared.work.wait(&mut state);
            }
        };

        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!(queue = %shared.name, task = id, "task panicked");
        }

        let mut state = shared.state.lock();
        state.pending.remove(&id);
        drop(state);
        shared.done.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_single_thread_runs_in_order() {
        let tq = Taskq::new("test-serial", 1).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let order = Arc::clone(&order);
            tq.dispatch(move || order.lock().push(i));
        }
        tq.wait_outstanding();
        assert_eq!(*order.lock(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_wait_id() {
        let tq = Taskq::new("test-wait", 2).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&done);
        let id = tq.dispatch(move || {
            thread::sleep(Duration::from_millis(20));
            flag.store(1, Ordering::SeqCst);
        });
        tq.wait_id(id);
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(tq.pending(), 0);
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let tq = Taskq::new("test-panic", 1).unwrap();
        let id = tq.dispatch(|| panic!("boom"));
        tq.wait_id(id);

        let ran = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&ran);
        let id = tq.dispatch(move || {
            flag.fetch_add(1, Ordering::SeqCst);
        });
        tq.wait_id(id);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_drains_queue() {
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let tq = Taskq::new("test-drain", 1).unwrap();
            for _ in 0..8 {
                let ran = Arc::clone(&ran);
                tq.dispatch(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        assert_eq!(ran.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_worker_thread_detection() {
        let tq = Arc::new(Taskq::new("test-ident", 1).unwrap());
        assert!(!tq.is_worker_thread());
        let inner = Arc::clone(&tq);
        let (tx, rx) = std::sync::mpsc::channel();
        tq.dispatch(move || tx.send(inner.is_worker_thread()).unwrap());
        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap());
    }
}
