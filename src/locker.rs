use {
    crate::{gate::GlobalGate, table::LockTable},
    static_assertions::assert_impl_all,
    std::{
        fmt::{Debug, Formatter},
        hash::Hash,
        time::{Duration, Instant},
    },
};

#[cfg(test)]
mod tests;

/// A locker that serializes work per entity identity and can exclude all
/// entity-scoped work for a global operation.
///
/// Work is executed on the calling thread; the locker performs no execution
/// management of its own. Two identities that compare equal map to the same
/// lock, so at most one thread runs entity-scoped work for a given identity
/// at a time, while work for distinct identities proceeds in parallel.
///
/// Each `EntityLocker` is an independent locking domain: locks are never
/// shared between instances.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
/// use std::thread;
/// use entity_locker::EntityLocker;
///
/// let locker = Arc::new(EntityLocker::new());
/// let counter = Arc::new(AtomicU64::new(0));
///
/// thread::scope(|s| {
///     for _ in 0..4 {
///         s.spawn(|| {
///             for _ in 0..100 {
///                 locker.run_under_entity_lock(&"account-1", || {
///                     // Non-atomic read-modify-write, protected by the
///                     // entity lock.
///                     counter.store(counter.load(Relaxed) + 1, Relaxed);
///                 });
///             }
///         });
///     }
/// });
///
/// assert_eq!(counter.load(Relaxed), 400);
/// ```
///
/// # Deadlock avoidance
///
/// The locker avoids deadlocks for its own nested uses: a thread already
/// running under an entity lock may lock the same or further identities,
/// and a thread inside [`run_under_global_lock`](Self::run_under_global_lock)
/// may take entity locks or nest another global section. None of these
/// nested acquisitions block behind a waiting global request. Deadlocks
/// *between callers* remain the caller's responsibility: two threads
/// locking identities `A` and `B` in opposite orders can deadlock each
/// other, and requesting the global lock while holding an entity lock
/// deadlocks against the thread's own entity-scoped hold. Callers that
/// need multiple locks must order their acquisitions consistently.
pub struct EntityLocker<T> {
    gate: GlobalGate,
    table: LockTable<T>,
}

assert_impl_all!(EntityLocker<u64>: Send, Sync);

impl<T> Default for EntityLocker<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EntityLocker<T> {
    /// Creates a locker with no held locks.
    pub fn new() -> Self {
        Self {
            gate: GlobalGate::default(),
            table: LockTable::default(),
        }
    }
}

impl<T: Eq + Hash + Clone> EntityLocker<T> {
    /// Runs `work` while holding the lock for `id`.
    ///
    /// If another thread holds the lock for an equal identity, the calling
    /// thread blocks until the lock becomes available. A thread that already
    /// holds the lock for `id` re-enters it without blocking; the identity
    /// stays locked until the outermost call returns. The call also blocks
    /// while a global operation is running or waiting, except when the
    /// calling thread is the one inside the global section or already holds
    /// an entity lock from this locker.
    ///
    /// The lock is released on every exit path, including a panic unwinding
    /// out of `work`; the panic then resumes propagating to the caller.
    ///
    /// # Example
    ///
    /// ```
    /// use entity_locker::EntityLocker;
    ///
    /// let locker = EntityLocker::new();
    /// let value = locker.run_under_entity_lock(&17, || {
    ///     assert!(locker.is_locked(&17));
    ///     // Re-entrant: the holder may lock the same identity again.
    ///     locker.run_under_entity_lock(&17, || "updated")
    /// });
    /// assert_eq!(value, "updated");
    /// assert!(!locker.is_locked(&17));
    /// ```
    pub fn run_under_entity_lock<R>(&self, id: &T, work: impl FnOnce() -> R) -> R {
        // Fast path for the re-entrant case: the outer call already holds
        // the gate in shared mode, so only the entry's depth changes.
        if let Some(_reentered) = self.table.reenter(id) {
            return work();
        }
        let _gate = self.gate.acquire_shared();
        let _entry = self.table.acquire(id);
        work()
    }

    /// Runs `work` while holding the lock for `id`, but only if every
    /// required lock can be acquired without blocking.
    ///
    /// Returns `None`, without running `work`, if the lock for `id` is held
    /// by another thread, if a global operation is running, or if one is
    /// waiting to run. The exemptions of
    /// [`run_under_entity_lock`](Self::run_under_entity_lock) apply: a
    /// thread that already holds a lock from this locker is not turned away
    /// by a waiting global request.
    ///
    /// # Example
    ///
    /// ```
    /// use std::thread;
    /// use entity_locker::EntityLocker;
    ///
    /// let locker = EntityLocker::new();
    /// locker.run_under_entity_lock(&1, || {
    ///     // The holder itself can still re-enter.
    ///     assert!(locker.try_run_under_entity_lock(&1, || ()).is_some());
    ///     thread::scope(|s| {
    ///         s.spawn(|| {
    ///             // Another thread cannot.
    ///             assert!(locker.try_run_under_entity_lock(&1, || ()).is_none());
    ///         });
    ///     });
    /// });
    /// assert!(locker.try_run_under_entity_lock(&1, || ()).is_some());
    /// ```
    pub fn try_run_under_entity_lock<R>(&self, id: &T, work: impl FnOnce() -> R) -> Option<R> {
        if let Some(_reentered) = self.table.reenter(id) {
            return Some(work());
        }
        let _gate = self.gate.try_acquire_shared()?;
        let _entry = self.table.try_acquire(id)?;
        Some(work())
    }

    /// Runs `work` while holding the lock for `id`, waiting at most
    /// `timeout` for all required locks together.
    ///
    /// Returns `None`, without running `work`, if the locks could not be
    /// acquired before the timeout expired.
    ///
    /// # Example
    ///
    /// ```
    /// use std::thread;
    /// use std::time::Duration;
    /// use entity_locker::EntityLocker;
    ///
    /// let timeout = Duration::from_millis(50);
    /// let locker = EntityLocker::new();
    /// locker.run_under_entity_lock(&1, || {
    ///     thread::scope(|s| {
    ///         s.spawn(|| {
    ///             assert!(locker
    ///                 .try_run_under_entity_lock_for(&1, timeout, || ())
    ///                 .is_none());
    ///         });
    ///     });
    /// });
    /// assert!(locker
    ///     .try_run_under_entity_lock_for(&1, timeout, || ())
    ///     .is_some());
    /// ```
    pub fn try_run_under_entity_lock_for<R>(
        &self,
        id: &T,
        timeout: Duration,
        work: impl FnOnce() -> R,
    ) -> Option<R> {
        if let Some(_reentered) = self.table.reenter(id) {
            return Some(work());
        }
        let deadline = Instant::now() + timeout;
        let _gate = self.gate.acquire_shared_until(deadline)?;
        let _entry = self.table.acquire_until(id, deadline)?;
        Some(work())
    }

    /// Runs `work` with all entity-scoped work excluded.
    ///
    /// Blocks until every in-flight entity-scoped call has finished, and
    /// keeps new entity-scoped calls (from other threads) blocked until
    /// `work` returns. While a thread is waiting here, no new entity-scoped
    /// call is admitted, so the wait is bounded by the entity work that was
    /// already in flight.
    ///
    /// Re-entrant: the thread inside the global section may nest another
    /// global section or take entity locks.
    ///
    /// The exclusion is released on every exit path, including a panic
    /// unwinding out of `work`.
    ///
    /// # Example
    ///
    /// ```
    /// use entity_locker::EntityLocker;
    ///
    /// let locker: EntityLocker<u32> = EntityLocker::new();
    /// let snapshot = locker.run_under_global_lock(|| {
    ///     // No entity-scoped work is running anywhere in this locker.
    ///     locker.run_under_entity_lock(&3, || 3)
    /// });
    /// assert_eq!(snapshot, 3);
    /// ```
    pub fn run_under_global_lock<R>(&self, work: impl FnOnce() -> R) -> R {
        let _gate = self.gate.acquire_exclusive();
        work()
    }

    /// Runs `work` with all entity-scoped work excluded, but only if the
    /// exclusion can be acquired without blocking.
    ///
    /// Returns `None`, without running `work`, if any entity-scoped or
    /// global work is in flight on another thread.
    pub fn try_run_under_global_lock<R>(&self, work: impl FnOnce() -> R) -> Option<R> {
        let _gate = self.gate.try_acquire_exclusive()?;
        Some(work())
    }

    /// Runs `work` with all entity-scoped work excluded, waiting at most
    /// `timeout` for the exclusion.
    ///
    /// Returns `None`, without running `work`, if in-flight work did not
    /// finish before the timeout expired. A timed-out request stops blocking
    /// new entity-scoped calls.
    pub fn try_run_under_global_lock_for<R>(
        &self,
        timeout: Duration,
        work: impl FnOnce() -> R,
    ) -> Option<R> {
        let _gate = self.gate.acquire_exclusive_until(Instant::now() + timeout)?;
        Some(work())
    }

    /// Reports whether `id` is currently locked by any thread.
    ///
    /// The answer can be stale by the time the caller observes it. This is a
    /// diagnostic for tests and debugging, never a substitute for running
    /// the dependent code under [`run_under_entity_lock`](Self::run_under_entity_lock).
    ///
    /// # Example
    ///
    /// ```
    /// use entity_locker::EntityLocker;
    ///
    /// let locker = EntityLocker::new();
    /// assert!(!locker.is_locked(&8));
    /// locker.run_under_entity_lock(&8, || {
    ///     assert!(locker.is_locked(&8));
    /// });
    /// assert!(!locker.is_locked(&8));
    /// ```
    pub fn is_locked(&self, id: &T) -> bool {
        self.table.is_locked(id)
    }
}

impl<T> Debug for EntityLocker<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityLocker")
            .field("entries", &self.table.entry_count())
            .finish_non_exhaustive()
    }
}
