use {
    crate::owner::OwnerId,
    parking_lot::{Condvar, Mutex},
    static_assertions::assert_not_impl_any,
    std::{
        collections::HashMap,
        hash::Hash,
        marker::PhantomData,
        sync::{
            atomic::{AtomicUsize, Ordering::Relaxed},
            Arc,
        },
        time::Instant,
    },
};


/// The map from entity identity to its lock entry.
///
/// Entries are created on demand and removed as soon as no context holds or
/// waits for them. Creation, removal, and the reference-count updates that
/// decide removal all happen under the table mutex, so at most one entry per
/// identity is ever observable and a removal cannot race an acquisition into
/// two live entries for the same identity.
pub(crate) struct LockTable<T> {
    entries: Mutex<HashMap<T, Arc<LockEntry>>>,
}

/// The re-entrant lock for one entity identity.
struct LockEntry {
    state: Mutex<EntryState>,
    unlocked: Condvar,
    // Contexts holding or waiting for this entry. Mutated only under the
    // table mutex; the entry is removed from the table exactly when this
    // drops to zero.
    users: AtomicUsize,
}

// Invariant: owner == OwnerId::NONE if and only if depth == 0.
struct EntryState {
    owner: OwnerId,
    depth: u64,
}

/// A hold of one entity's lock entry, released on drop.
///
/// Dropping the guard decrements the recursion depth, wakes one waiter when
/// the depth reaches zero, and releases the guard's table reference,
/// removing the entry if it was the last one.
pub(crate) struct EntryGuard<'a, T: Eq + Hash> {
    table: &'a LockTable<T>,
    entry: Arc<LockEntry>,
    id: T,
    _not_send: PhantomData<*const ()>,
}

// Release inspects the identity of the dropping context, so a guard must be
// dropped by the context that acquired it.
assert_not_impl_any!(EntryGuard<'_, u64>: Send, Sync);

impl LockEntry {
    fn new() -> Self {
        Self {
            state: Mutex::new(EntryState {
                owner: OwnerId::NONE,
                depth: 0,
            }),
            unlocked: Condvar::new(),
            users: AtomicUsize::new(0),
        }
    }
}

impl EntryState {
    fn grant(&mut self, me: OwnerId) -> bool {
        if self.owner == OwnerId::NONE {
            self.owner = me;
            self.depth = 1;
            true
        } else if self.owner == me {
            self.depth += 1;
            true
        } else {
            false
        }
    }
}

impl<T> Default for LockTable<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> LockTable<T> {
    /// The number of live entries. Diagnostics only.
    pub(crate) fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }
}

impl<T: Eq + Hash> LockTable<T> {
    /// Drops one user registration of `entry`, removing it from the table if
    /// it was the last one.
    fn release_user(&self, id: &T, entry: &Arc<LockEntry>) {
        let mut entries = self.entries.lock();
        if entry.users.fetch_sub(1, Relaxed) == 1 {
            // While users > 0 the entry cannot be replaced, so the installed
            // entry is still this one.
            let _removed = entries.remove(id);
            debug_assert!(matches!(&_removed, Some(e) if Arc::ptr_eq(e, entry)));
        }
    }

    /// Reports whether the entry for `id` is currently held by any context.
    ///
    /// The answer can be stale by the time the caller observes it; this is a
    /// diagnostic, not a synchronization primitive.
    pub(crate) fn is_locked(&self, id: &T) -> bool {
        let entry = self.entries.lock().get(id).cloned();
        match entry {
            Some(entry) => entry.state.lock().depth > 0,
            None => false,
        }
    }
}

impl<T: Eq + Hash + Clone> LockTable<T> {
    /// Looks up or creates the entry for `id` and registers the calling
    /// context as one of its users, as a single atomic step.
    fn checkout(&self, id: &T) -> Arc<LockEntry> {
        let mut entries = self.entries.lock();
        let entry = match entries.get(id) {
            Some(entry) => entry.clone(),
            None => {
                let entry = Arc::new(LockEntry::new());
                entries.insert(id.clone(), entry.clone());
                entry
            }
        };
        entry.users.fetch_add(1, Relaxed);
        entry
    }

    /// Acquires the entry for `id`, blocking until the calling context
    /// becomes its holder. If the calling context already holds the entry,
    /// the recursion depth is incremented instead of blocking.
    pub(crate) fn acquire(&self, id: &T) -> EntryGuard<'_, T> {
        let entry = self.checkout(id);
        let me = OwnerId::current();
        let mut state = entry.state.lock();
        while !state.grant(me) {
            entry.unlocked.wait(&mut state);
        }
        drop(state);
        self.guard_for(id, entry)
    }

    /// Acquires the entry for `id`, giving up at `deadline`.
    pub(crate) fn acquire_until(&self, id: &T, deadline: Instant) -> Option<EntryGuard<'_, T>> {
        let entry = self.checkout(id);
        let me = OwnerId::current();
        let mut state = entry.state.lock();
        loop {
            if state.grant(me) {
                break;
            }
            if entry.unlocked.wait_until(&mut state, deadline).timed_out() {
                if state.grant(me) {
                    break;
                }
                drop(state);
                self.release_user(id, &entry);
                return None;
            }
        }
        drop(state);
        Some(self.guard_for(id, entry))
    }

    /// Acquires the entry for `id` only if that is possible without
    /// blocking.
    pub(crate) fn try_acquire(&self, id: &T) -> Option<EntryGuard<'_, T>> {
        let entry = self.checkout(id);
        let me = OwnerId::current();
        let granted = entry.state.lock().grant(me);
        if !granted {
            self.release_user(id, &entry);
            return None;
        }
        Some(self.guard_for(id, entry))
    }

    /// Re-enters the entry for `id` if the calling context already holds it.
    /// Never blocks and never creates an entry.
    pub(crate) fn reenter(&self, id: &T) -> Option<EntryGuard<'_, T>> {
        let me = OwnerId::current();
        // Lock order is table, then entry state. No release path takes the
        // entry state lock while holding the table mutex.
        let entries = self.entries.lock();
        let entry = entries.get(id)?.clone();
        let mut state = entry.state.lock();
        if state.owner != me {
            return None;
        }
        state.depth += 1;
        entry.users.fetch_add(1, Relaxed);
        drop(state);
        drop(entries);
        Some(self.guard_for(id, entry))
    }

    fn guard_for(&self, id: &T, entry: Arc<LockEntry>) -> EntryGuard<'_, T> {
        EntryGuard {
            table: self,
            entry,
            id: id.clone(),
            _not_send: PhantomData,
        }
    }
}

impl<T: Eq + Hash> Drop for EntryGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.entry.state.lock();
        assert_eq!(
            state.owner,
            OwnerId::current(),
            "entity lock released by a context that does not hold it",
        );
        state.depth -= 1;
        let unheld = state.depth == 0;
        if unheld {
            state.owner = OwnerId::NONE;
        }
        drop(state);
        if unheld {
            self.entry.unlocked.notify_one();
        }
        self.table.release_user(&self.id, &self.entry);
    }
}
