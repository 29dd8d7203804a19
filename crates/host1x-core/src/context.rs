//! Context: the per-userspace-handle owner of jobs and scheduler entities.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Tracks how many jobs a context has outstanding, and lets a caller
/// block until the count drops to zero (`wait_context`).
pub struct Context {
    id: u64,
    active_jobs: AtomicU32,
    idle_waiters: Mutex<Vec<mpsc::Sender<()>>>,
}

impl Context {
    pub fn new() -> Arc<Self> {
        Arc::new(Context {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            active_jobs: AtomicU32::new(0),
            idle_waiters: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn active_jobs(&self) -> u32 {
        self.active_jobs.load(Ordering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        self.active_jobs() == 0
    }

    pub(crate) fn job_created(&self) {
        self.active_jobs.fetch_add(1, Ordering::AcqRel);
    }

    /// Called from a job's retirement (step 6 of the drop sequence):
    /// decrements the active-job counter and wakes any `wait_context`
    /// callers if it reached zero.
    pub(crate) fn job_retired(&self) {
        let prev = self.active_jobs.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            let mut waiters = self.idle_waiters.lock();
            for tx in waiters.drain(..) {
                let _ = tx.send(());
            }
        }
    }

    /// Block until this context has zero active jobs, or `timeout`
    /// elapses. Implemented with an `mpsc` channel rather than a condvar
    /// so each caller gets its own private wait-channel.
    pub fn wait_context(&self, timeout: Duration) -> bool {
        if self.is_idle() {
            return true;
        }
        let (tx, rx) = mpsc::channel();
        self.idle_waiters.lock().push(tx);
        if self.is_idle() {
            return true;
        }
        rx.recv_timeout(timeout).is_ok()
    }
}
