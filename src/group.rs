//! Worker groups with named locks and reusable barriers.
//!
//! The registries mapping names to primitives are guarded by the group's
//! lock. Acquiring a lock or waiting on a barrier clones the primitive out of
//! the registry first, so coordination on one name never serialises lookups
//! of another.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{PrimitiveKind, WorkerError};
use crate::worker::{Worker, WorkerId};

/// Process-unique group identifier.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct GroupId(u64);

impl GroupId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group-{}", self.0)
    }
}

/// A mutual-exclusion lock that any holder may release.
#[derive(Debug, Default)]
struct NamedLock {
    held: Mutex<bool>,
    freed: Condvar,
}

impl NamedLock {
    fn acquire(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.and_then(|limit| Instant::now().checked_add(limit));
        let mut held = self.held.lock();
        while *held {
            match deadline {
                None => self.freed.wait(&mut held),
                Some(at) => {
                    if self.freed.wait_until(&mut held, at).timed_out() && *held {
                        return false;
                    }
                }
            }
        }
        *held = true;
        true
    }

    fn release(&self) -> bool {
        let mut held = self.held.lock();
        if !*held {
            return false;
        }
        *held = false;
        drop(held);
        self.freed.notify_one();
        true
    }
}

#[derive(Debug, Default)]
struct Round {
    arrived: usize,
    generation: u64,
}

/// A barrier for a fixed number of parties, reusable across rounds.
///
/// Arrivals and the round reset happen under one lock; waiters block until
/// the generation moves on, so a fast thread entering the next round can
/// never be counted in the previous one.
#[derive(Debug)]
struct Barrier {
    parties: usize,
    round: Mutex<Round>,
    released: Condvar,
}

impl Barrier {
    fn new(parties: usize) -> Self {
        Self {
            parties,
            round: Mutex::new(Round::default()),
            released: Condvar::new(),
        }
    }

    /// Returns `true` for the arrival that completed the round.
    fn wait(&self) -> bool {
        if self.parties <= 1 {
            return true;
        }
        let mut round = self.round.lock();
        let generation = round.generation;
        round.arrived = round.arrived.saturating_add(1);
        if round.arrived >= self.parties {
            round.arrived = 0;
            round.generation = generation.wrapping_add(1);
            drop(round);
            self.released.notify_all();
            return true;
        }
        while round.generation == generation {
            self.released.wait(&mut round);
        }
        false
    }
}

#[derive(Default)]
struct Registry {
    workers: Vec<Arc<dyn Worker>>,
    locks: HashMap<String, Arc<NamedLock>>,
    barriers: HashMap<String, Arc<Barrier>>,
}

/// A set of workers coordinating through named locks and barriers.
///
/// A worker belongs to at most one group at a time.
pub struct WorkerGroup {
    id: GroupId,
    registry: Mutex<Registry>,
}

impl fmt::Debug for WorkerGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry.lock();
        f.debug_struct("WorkerGroup")
            .field("id", &self.id)
            .field("workers", &registry.workers.len())
            .field("locks", &registry.locks.keys().collect::<Vec<_>>())
            .field("barriers", &registry.barriers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for WorkerGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerGroup {
    /// Creates an empty group.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: GroupId::next(),
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Process-unique identifier.
    #[must_use]
    pub const fn id(&self) -> GroupId {
        self.id
    }

    /// Adds `worker` to the group.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::AlreadyMember`] when it is already a member, or
    /// [`WorkerError::AlreadyGrouped`] when it belongs to another group.
    pub fn add_worker<W: Worker + 'static>(&self, worker: Arc<W>) -> Result<(), WorkerError> {
        let mut registry = self.registry.lock();
        if registry.workers.iter().any(|member| member.id() == worker.id()) {
            return Err(WorkerError::AlreadyMember {
                worker: worker.core().to_string(),
            });
        }
        worker.core().join_group(self.id)?;
        tracing::debug!(group = %self.id, worker = %worker.core(), "worker joined group");
        registry.workers.push(worker);
        Ok(())
    }

    /// Removes `worker` from the group.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::NotMember`] when it is not a member.
    pub fn remove_worker<W: Worker + ?Sized>(&self, worker: &W) -> Result<(), WorkerError> {
        let mut registry = self.registry.lock();
        let Some(position) = registry
            .workers
            .iter()
            .position(|member| member.id() == worker.id())
        else {
            return Err(WorkerError::NotMember {
                worker: worker.core().to_string(),
            });
        };
        let member = registry.workers.remove(position);
        member.core().leave_group(self.id);
        tracing::debug!(group = %self.id, worker = %member.core(), "worker left group");
        Ok(())
    }

    /// Current members, in joining order.
    #[must_use]
    pub fn workers(&self) -> Vec<Arc<dyn Worker>> {
        self.registry.lock().workers.clone()
    }

    /// Returns whether `id` is a member.
    #[must_use]
    pub fn contains(&self, id: WorkerId) -> bool {
        self.registry
            .lock()
            .workers
            .iter()
            .any(|member| member.id() == id)
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.lock().workers.len()
    }

    /// Returns `true` when the group has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers a new unheld lock.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::DuplicateName`] when the name is taken.
    pub fn create_lock(&self, name: &str) -> Result<(), WorkerError> {
        let mut registry = self.registry.lock();
        if registry.locks.contains_key(name) {
            return Err(duplicate(PrimitiveKind::Lock, name));
        }
        registry
            .locks
            .insert(name.to_owned(), Arc::new(NamedLock::default()));
        Ok(())
    }

    /// Acquires the named lock, waiting up to `timeout`. `None` waits
    /// indefinitely.
    ///
    /// Returns `Ok(false)` when the lock stayed held until the timeout.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::NotFound`] for an unknown name.
    pub fn acquire_lock(&self, name: &str, timeout: Option<Duration>) -> Result<bool, WorkerError> {
        let lock = self.lock(name)?;
        let acquired = lock.acquire(timeout);
        tracing::debug!(group = %self.id, lock = name, acquired, "lock acquire");
        Ok(acquired)
    }

    /// Releases the named lock.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::NotFound`] for an unknown name, or
    /// [`WorkerError::LockNotHeld`] when nobody holds it.
    pub fn release_lock(&self, name: &str) -> Result<(), WorkerError> {
        if !self.lock(name)?.release() {
            return Err(WorkerError::LockNotHeld {
                name: name.to_owned(),
            });
        }
        tracing::debug!(group = %self.id, lock = name, "lock released");
        Ok(())
    }

    /// Unregisters the named lock. Current holders keep their clone.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::NotFound`] for an unknown name.
    pub fn remove_lock(&self, name: &str) -> Result<(), WorkerError> {
        self.registry
            .lock()
            .locks
            .remove(name)
            .map(drop)
            .ok_or_else(|| not_found(PrimitiveKind::Lock, name))
    }

    /// Registers a barrier whose party count is the current member count.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::DuplicateName`] when the name is taken.
    pub fn create_barrier(&self, name: &str) -> Result<(), WorkerError> {
        let mut registry = self.registry.lock();
        if registry.barriers.contains_key(name) {
            return Err(duplicate(PrimitiveKind::Barrier, name));
        }
        let parties = registry.workers.len();
        registry
            .barriers
            .insert(name.to_owned(), Arc::new(Barrier::new(parties)));
        tracing::debug!(group = %self.id, barrier = name, parties, "barrier created");
        Ok(())
    }

    /// Party count fixed when the barrier was created.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::NotFound`] for an unknown name.
    pub fn barrier_parties(&self, name: &str) -> Result<usize, WorkerError> {
        Ok(self.barrier(name)?.parties)
    }

    /// Blocks until every party of the named barrier has arrived in this
    /// round. Returns `true` for exactly one caller per round.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::NotFound`] for an unknown name.
    pub fn wait_barrier(&self, name: &str) -> Result<bool, WorkerError> {
        let barrier = self.barrier(name)?;
        Ok(barrier.wait())
    }

    /// Unregisters the named barrier. Current waiters keep their clone.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::NotFound`] for an unknown name.
    pub fn remove_barrier(&self, name: &str) -> Result<(), WorkerError> {
        self.registry
            .lock()
            .barriers
            .remove(name)
            .map(drop)
            .ok_or_else(|| not_found(PrimitiveKind::Barrier, name))
    }

    fn lock(&self, name: &str) -> Result<Arc<NamedLock>, WorkerError> {
        self.registry
            .lock()
            .locks
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(PrimitiveKind::Lock, name))
    }

    fn barrier(&self, name: &str) -> Result<Arc<Barrier>, WorkerError> {
        self.registry
            .lock()
            .barriers
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(PrimitiveKind::Barrier, name))
    }
}

impl Drop for WorkerGroup {
    fn drop(&mut self) {
        for member in &self.registry.get_mut().workers {
            member.core().leave_group(self.id);
        }
    }
}

fn duplicate(kind: PrimitiveKind, name: &str) -> WorkerError {
    WorkerError::DuplicateName {
        kind,
        name: name.to_owned(),
    }
}

fn not_found(kind: PrimitiveKind, name: &str) -> WorkerError {
    WorkerError::NotFound {
        kind,
        name: name.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use rstest::{fixture, rstest};

    use super::*;

    #[fixture]
    fn group() -> WorkerGroup {
        let group = WorkerGroup::new();
        group.create_lock("deploy").expect("create lock");
        group
    }

    #[rstest]
    fn duplicate_names_are_rejected(group: WorkerGroup) {
        assert!(matches!(
            group.create_lock("deploy"),
            Err(WorkerError::DuplicateName {
                kind: PrimitiveKind::Lock,
                ..
            })
        ));
        group.create_barrier("sync").expect("create barrier");
        assert!(matches!(
            group.create_barrier("sync"),
            Err(WorkerError::DuplicateName {
                kind: PrimitiveKind::Barrier,
                ..
            })
        ));
    }

    #[rstest]
    fn lock_times_out_while_held(group: WorkerGroup) {
        assert!(group.acquire_lock("deploy", None).expect("acquire"));
        assert!(
            !group
                .acquire_lock("deploy", Some(Duration::from_millis(20)))
                .expect("second acquire")
        );
        group.release_lock("deploy").expect("release");
        assert!(
            group
                .acquire_lock("deploy", Some(Duration::ZERO))
                .expect("reacquire")
        );
    }

    #[rstest]
    fn releasing_an_unheld_lock_fails(group: WorkerGroup) {
        assert!(matches!(
            group.release_lock("deploy"),
            Err(WorkerError::LockNotHeld { .. })
        ));
    }

    #[rstest]
    #[case("lock")]
    #[case("barrier")]
    fn removing_unknown_names_fails(group: WorkerGroup, #[case] kind: &str) {
        let result = if kind == "lock" {
            group.remove_lock("missing")
        } else {
            group.remove_barrier("missing")
        };
        assert!(matches!(result, Err(WorkerError::NotFound { .. })));
    }

    #[rstest]
    fn removed_lock_is_no_longer_found(group: WorkerGroup) {
        group.remove_lock("deploy").expect("remove");
        assert!(matches!(
            group.acquire_lock("deploy", Some(Duration::ZERO)),
            Err(WorkerError::NotFound { .. })
        ));
    }

    #[rstest]
    fn empty_barrier_never_blocks(group: WorkerGroup) {
        group.create_barrier("solo").expect("create");
        assert_eq!(group.barrier_parties("solo").expect("parties"), 0);
        assert!(group.wait_barrier("solo").expect("wait"));
    }

    #[test]
    fn barrier_releases_every_party_each_round() {
        let barrier = Arc::new(Barrier::new(3));
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let shared = Arc::clone(&barrier);
                thread::spawn(move || (0..5).map(|_| shared.wait()).filter(|&led| led).count())
            })
            .collect();

        let leaders: usize = handles
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .sum();

        assert_eq!(leaders, 5);
    }

    #[test]
    fn named_lock_wakes_a_waiter() {
        let lock = Arc::new(NamedLock::default());
        assert!(lock.acquire(None));
        let waiter = {
            let shared = Arc::clone(&lock);
            thread::spawn(move || shared.acquire(Some(Duration::from_secs(5))))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(lock.release());

        assert!(waiter.join().expect("join"));
    }
}
