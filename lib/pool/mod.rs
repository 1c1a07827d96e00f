//! Worker pool for object-store jobs.
//!
//! A fixed set of OS threads drains a FIFO of [`StoreJob`]s. Dispatch is
//! driven by a counting semaphore: every enqueue releases one permit, every
//! worker blocks on an acquire. Each worker owns one reusable store handle
//! for its whole lifetime, resets it before every job, and tears it down
//! (releasing its share of the per-thread connection cache) when the pool
//! shuts down.
//!
//! `instruct` never blocks; the caller attaches a completion semaphore it
//! can later await. `await_instruct` is the synchronous form: the pool
//! attaches a local semaphore and blocks until the worker releases it.
//! Jobs still queued at shutdown are discarded without completion, so
//! callers that need a guarantee must use `await_instruct`.

pub mod job;
pub mod worker;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use blobstore::StoreError;
use tracing::{debug, error, info, warn};

use crate::sync::Semaphore;
use self::job::StoreJob;

/// Pool size when none is configured.
pub const DEFAULT_WORKER_COUNT: usize = 10;

/// One reusable store handle, owned by a single worker thread.
pub trait StoreWorker: Send + 'static {
    /// Clear all per-request state before the next job. Returning `false`
    /// stops the worker thread.
    fn reset(&mut self) -> bool;

    /// Run one job to completion.
    fn execute(&mut self, job: &StoreJob) -> Result<(), StoreError>;

    /// Per-thread teardown at worker exit.
    fn disconnect(&mut self) {}
}

struct Dispatch {
    job: StoreJob,
    done: Option<Arc<Semaphore>>,
}

struct Shared {
    queue: Mutex<VecDeque<Dispatch>>,
    dispatch_sem: Semaphore,
    exit: AtomicBool,
}

/// Fixed-size pool of worker threads executing [`StoreJob`]s.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `count` workers (`None` = the default of 10), each owning one
    /// handle built by `factory`.
    ///
    /// # Panics
    ///
    /// A zero count or a failure to spawn a thread is a programmer error
    /// and panics.
    pub fn new<W, F>(count: Option<usize>, factory: F) -> Self
    where
        W: StoreWorker,
        F: Fn() -> W + Send + Sync + 'static,
    {
        let count = count.unwrap_or(DEFAULT_WORKER_COUNT);
        assert!(count > 0, "worker count must be positive, got {count}");

        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            dispatch_sem: Semaphore::new(0),
            exit: AtomicBool::new(false),
        });
        let factory = Arc::new(factory);

        let workers = (0..count)
            .map(|idx| {
                let shared = Arc::clone(&shared);
                let factory = Arc::clone(&factory);
                thread::Builder::new()
                    .name(format!("blobfs-worker-{idx}"))
                    .spawn(move || worker_loop(&shared, factory.as_ref()))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        info!(count, "worker pool started");
        Self { shared, workers }
    }

    /// Enqueue a job and return immediately. The worker releases `done`
    /// when the job finishes. Returns `false` (nothing enqueued) once the
    /// pool has shut down.
    pub fn instruct(&self, job: StoreJob, done: Arc<Semaphore>) -> bool {
        if self.shared.exit.load(Ordering::Acquire) {
            warn!(kind = job.kind(), "job refused: pool is shut down");
            return false;
        }
        self.push(Dispatch {
            job,
            done: Some(done),
        });
        true
    }

    /// Enqueue a job and block until a worker has finished it. Returns
    /// `false` once the pool has shut down.
    pub fn await_instruct(&self, job: StoreJob) -> bool {
        if self.shared.exit.load(Ordering::Acquire) {
            warn!(kind = job.kind(), "job refused: pool is shut down");
            return false;
        }
        let done = Arc::new(Semaphore::new(0));
        self.push(Dispatch {
            job,
            done: Some(Arc::clone(&done)),
        });
        done.acquire();
        true
    }

    fn push(&self, dispatch: Dispatch) {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(dispatch);
        self.shared.dispatch_sem.release();
    }

    /// Stop all workers: set the exit flag, wake every worker, join them,
    /// drain leftover permits and discard any jobs still queued.
    pub fn destroy(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.shared.exit.store(true, Ordering::Release);
        for _ in 0..self.workers.len() {
            self.shared.dispatch_sem.release();
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("worker thread panicked");
            }
        }
        while self.shared.dispatch_sem.try_acquire() {}

        let discarded = {
            let mut queue = self
                .shared
                .queue
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let len = queue.len();
            queue.clear();
            len
        };
        if discarded > 0 {
            warn!(discarded, "jobs discarded at pool shutdown");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn worker_loop<W: StoreWorker, F: Fn() -> W>(shared: &Shared, factory: &F) {
    debug!("worker thread started");
    let mut handle = factory();

    loop {
        shared.dispatch_sem.acquire();
        if shared.exit.load(Ordering::Acquire) {
            break;
        }

        if !handle.reset() {
            error!("failed to reset store handle; stopping worker");
            break;
        }

        let dispatch = {
            let mut queue = shared
                .queue
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match queue.pop_front() {
                Some(dispatch) => dispatch,
                None => {
                    debug!("woke with an empty queue");
                    continue;
                }
            }
        };

        if let Err(e) = handle.execute(&dispatch.job) {
            warn!(error = %e, kind = dispatch.job.kind(), "store job failed");
            dispatch.job.mark_failed();
        }
        if let Some(done) = dispatch.done {
            done.release();
        }
    }

    handle.disconnect();
    debug!("worker thread stopped");
}
