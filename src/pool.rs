//! Bounded leasing of workers built on demand.
//!
//! A [`WorkerPool`] hands out at most `max_workers` workers at a time. Each
//! lease holds one permit of a counting semaphore; a fresh worker is built by
//! the pool's factory for every lease and closed again on release, so no
//! worker state leaks from one lease to the next.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::WorkerError;
use crate::worker::Worker;

/// Process-unique pool identifier.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PoolId(u64);

impl PoolId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool-{}", self.0)
    }
}

type Factory<W> = Box<dyn Fn() -> Result<W, WorkerError> + Send + Sync>;
type Hook<W> = Arc<dyn Fn(&W) -> Result<(), WorkerError> + Send + Sync>;

/// Counting semaphore. The count is the number of free permits.
struct Permits {
    free: Mutex<usize>,
    returned: Condvar,
}

impl Permits {
    const fn new(count: usize) -> Self {
        Self {
            free: Mutex::new(count),
            returned: Condvar::new(),
        }
    }

    fn take(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.and_then(|limit| Instant::now().checked_add(limit));
        let mut free = self.free.lock();
        while *free == 0 {
            match deadline {
                None => self.returned.wait(&mut free),
                Some(at) => {
                    if self.returned.wait_until(&mut free, at).timed_out() && *free == 0 {
                        return false;
                    }
                }
            }
        }
        *free = free.saturating_sub(1);
        true
    }

    fn give_back(&self) {
        let mut free = self.free.lock();
        *free = free.saturating_add(1);
        drop(free);
        self.returned.notify_one();
    }

    fn free(&self) -> usize {
        *self.free.lock()
    }
}

struct PoolState<W> {
    leased: Vec<Arc<W>>,
    setup: Vec<Hook<W>>,
    cleanup: Vec<Hook<W>>,
}

/// A bounded pool of workers of one kind.
///
/// `workers_used() + workers_free() == max_workers()` holds at every
/// observable instant because both are derived from the permit count.
pub struct WorkerPool<W: Worker + 'static> {
    id: PoolId,
    max_workers: usize,
    factory: Factory<W>,
    permits: Permits,
    state: Mutex<PoolState<W>>,
}

impl<W: Worker + 'static> fmt::Debug for WorkerPool<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("id", &self.id)
            .field("max_workers", &self.max_workers)
            .field("workers_free", &self.workers_free())
            .finish_non_exhaustive()
    }
}

impl<W: Worker + 'static> WorkerPool<W> {
    /// Creates a pool that leases at most `max_workers` workers built by
    /// `factory`.
    #[must_use]
    pub fn new<F>(max_workers: usize, factory: F) -> Self
    where
        F: Fn() -> Result<W, WorkerError> + Send + Sync + 'static,
    {
        Self {
            id: PoolId::next(),
            max_workers,
            factory: Box::new(factory),
            permits: Permits::new(max_workers),
            state: Mutex::new(PoolState {
                leased: Vec::new(),
                setup: Vec::new(),
                cleanup: Vec::new(),
            }),
        }
    }

    /// Process-unique identifier.
    #[must_use]
    pub const fn id(&self) -> PoolId {
        self.id
    }

    /// Upper bound on concurrently leased workers.
    #[must_use]
    pub const fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Permits currently available.
    #[must_use]
    pub fn workers_free(&self) -> usize {
        self.permits.free()
    }

    /// Permits currently held by leases.
    #[must_use]
    pub fn workers_used(&self) -> usize {
        self.max_workers.saturating_sub(self.permits.free())
    }

    /// Registers a hook run against every freshly leased worker, in
    /// registration order.
    pub fn add_setup_step<F>(&self, step: F)
    where
        F: Fn(&W) -> Result<(), WorkerError> + Send + Sync + 'static,
    {
        self.state.lock().setup.push(Arc::new(step));
    }

    /// Registers a hook run against every released worker before it closes,
    /// in registration order.
    pub fn add_cleanup_step<F>(&self, step: F)
    where
        F: Fn(&W) -> Result<(), WorkerError> + Send + Sync + 'static,
    {
        self.state.lock().cleanup.push(Arc::new(step));
    }

    /// Leases a new worker, waiting up to `timeout` for a permit. `None`
    /// waits indefinitely.
    ///
    /// Returns `Ok(None)` when no permit became free in time.
    ///
    /// # Errors
    ///
    /// Returns the factory's error, or the first failing setup hook's error.
    /// The permit is returned in both cases and a worker that failed setup is
    /// closed.
    pub fn acquire(&self, timeout: Option<Duration>) -> Result<Option<Arc<W>>, WorkerError> {
        if !self.permits.take(timeout) {
            tracing::debug!(pool = %self.id, ?timeout, "no worker free before timeout");
            return Ok(None);
        }
        let worker = match (self.factory)() {
            Ok(created) => Arc::new(created),
            Err(err) => {
                self.permits.give_back();
                return Err(err);
            }
        };
        worker.core().attach_pool(self.id);
        let setup = {
            let mut state = self.state.lock();
            state.leased.push(Arc::clone(&worker));
            state.setup.clone()
        };

        for step in &setup {
            if let Err(err) = step(&worker) {
                tracing::warn!(pool = %self.id, worker = %worker.core(), error = %err, "setup step failed");
                self.state
                    .lock()
                    .leased
                    .retain(|leased| !Arc::ptr_eq(leased, &worker));
                if let Err(close_err) = worker.close() {
                    tracing::debug!(worker = %worker.core(), error = %close_err, "closing rejected worker failed");
                }
                worker.core().detach_pool();
                self.permits.give_back();
                return Err(err);
            }
        }
        tracing::info!(pool = %self.id, worker = %worker.core(), "worker leased");
        Ok(Some(worker))
    }

    /// Ends a lease: runs the cleanup hooks, closes the worker and returns
    /// its permit. Hook and close failures are logged and swallowed.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::ForeignWorker`] when `worker` is not currently
    /// leased from this pool, including when it was already released.
    pub fn release(&self, worker: &Arc<W>) -> Result<(), WorkerError> {
        let cleanup = {
            let mut state = self.state.lock();
            let Some(position) = state
                .leased
                .iter()
                .position(|leased| Arc::ptr_eq(leased, worker))
            else {
                return Err(WorkerError::ForeignWorker {
                    worker: worker.core().to_string(),
                });
            };
            state.leased.swap_remove(position);
            state.cleanup.clone()
        };

        for step in &cleanup {
            if let Err(err) = step(worker) {
                tracing::warn!(pool = %self.id, worker = %worker.core(), error = %err, "cleanup step failed");
            }
        }
        if let Err(err) = worker.close() {
            tracing::debug!(pool = %self.id, worker = %worker.core(), error = %err, "ignoring close failure on release");
        }
        worker.core().detach_pool();
        self.permits.give_back();
        tracing::info!(pool = %self.id, worker = %worker.core(), "worker released");
        Ok(())
    }
}
