use {
    crate::owner::OwnerId,
    parking_lot::{Condvar, Mutex},
    static_assertions::assert_not_impl_any,
    std::{collections::HashMap, marker::PhantomData, time::Instant},
};


/// The gate that orders entity-scoped work against global work.
///
/// Entity-scoped operations hold the gate in shared mode and run
/// concurrently with each other. A global operation holds it exclusively and
/// runs with no entity-scoped operation in flight.
///
/// The gate is writer-preferring: once a context is blocked in
/// [`GlobalGate::acquire_exclusive`], no new shared acquisition is granted
/// until that request has been served, so the exclusive wait is bounded by
/// the shared holds that were already in flight. Contexts that already hold
/// the gate are exempt: a shared holder may take further shared holds, and
/// an exclusive holder may re-acquire the gate in either mode. Blocking
/// either of those behind the pending request would deadlock it against
/// the hold it already has.
pub(crate) struct GlobalGate {
    inner: Mutex<Inner>,
    cond: Condvar,
}

struct Inner {
    state: GateState,
    // Contexts currently blocked in acquire_exclusive. While this is
    // non-zero, grant_shared refuses shared holds from new contexts.
    pending_exclusive: usize,
    // Shared holds per context. Non-empty exactly while state is Shared;
    // the counts sum to the Shared count. Holds taken by the exclusive
    // owner are tracked in the Exclusive depth instead.
    shared_holders: HashMap<OwnerId, usize>,
}

// Invariants:
// 1. Shared(n) always has n >= 1.
// 2. Exclusive { depth } always has depth >= 1; depth counts the owning
//    context's exclusive holds plus any shared holds it took while
//    exclusive, which unwind in reverse order.
#[derive(Copy, Clone, Debug)]
enum GateState {
    Open,
    Shared(usize),
    Exclusive { owner: OwnerId, depth: u64 },
}

/// A shared hold of the gate, released on drop.
pub(crate) struct SharedGuard<'a> {
    gate: &'a GlobalGate,
    _not_send: PhantomData<*const ()>,
}

/// An exclusive hold of the gate, released on drop.
pub(crate) struct ExclusiveGuard<'a> {
    gate: &'a GlobalGate,
    _not_send: PhantomData<*const ()>,
}

// Release inspects the identity of the dropping context, so a guard must be
// dropped by the context that acquired it.
assert_not_impl_any!(SharedGuard<'_>: Send, Sync);
assert_not_impl_any!(ExclusiveGuard<'_>: Send, Sync);

impl Default for GlobalGate {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: GateState::Open,
                pending_exclusive: 0,
                shared_holders: HashMap::new(),
            }),
            cond: Condvar::new(),
        }
    }
}

impl Inner {
    fn grant_shared(&mut self, me: OwnerId) -> bool {
        match &mut self.state {
            // A context holding the gate exclusively may also take it in
            // shared mode, even past pending exclusive requests, since
            // blocking here would be a self-deadlock.
            GateState::Exclusive { owner, depth } if *owner == me => {
                *depth += 1;
                true
            }
            // A context already holding a shared hold is admitted past
            // pending exclusive requests for the same reason: the request
            // cannot be served until this context's existing hold is gone.
            GateState::Shared(n)
                if self.pending_exclusive == 0 || self.shared_holders.contains_key(&me) =>
            {
                *n += 1;
                *self.shared_holders.entry(me).or_insert(0) += 1;
                true
            }
            GateState::Open if self.pending_exclusive == 0 => {
                debug_assert!(self.shared_holders.is_empty());
                self.state = GateState::Shared(1);
                self.shared_holders.insert(me, 1);
                true
            }
            _ => false,
        }
    }

    fn grant_exclusive_reentrant(&mut self, me: OwnerId) -> bool {
        match &mut self.state {
            GateState::Exclusive { owner, depth } if *owner == me => {
                *depth += 1;
                true
            }
            _ => false,
        }
    }

    // Returns whether the gate became open, which is the only transition
    // waiters care about.
    fn release_shared_hold(&mut self, me: OwnerId) -> bool {
        match &mut self.state {
            GateState::Shared(n) => {
                match self.shared_holders.get_mut(&me) {
                    Some(held) if *held > 1 => *held -= 1,
                    Some(_) => {
                        self.shared_holders.remove(&me);
                    }
                    None => panic!("released a shared gate hold that is not held"),
                }
                if *n == 1 {
                    debug_assert!(self.shared_holders.is_empty());
                    self.state = GateState::Open;
                    true
                } else {
                    *n -= 1;
                    false
                }
            }
            // A shared hold taken while this context held the gate
            // exclusively. The outermost exclusive hold is still below it on
            // the stack, so the depth cannot reach zero here.
            GateState::Exclusive { owner, depth } if *owner == me => {
                debug_assert!(*depth > 1);
                *depth -= 1;
                false
            }
            _ => panic!("released a shared gate hold that is not held"),
        }
    }

    fn release_exclusive_hold(&mut self, me: OwnerId) -> bool {
        match &mut self.state {
            GateState::Exclusive { owner, depth } if *owner == me => {
                if *depth == 1 {
                    self.state = GateState::Open;
                    true
                } else {
                    *depth -= 1;
                    false
                }
            }
            _ => panic!("released an exclusive gate hold that is not held"),
        }
    }

    fn is_open(&self) -> bool {
        matches!(self.state, GateState::Open)
    }
}

impl GlobalGate {
    /// Acquires the gate in shared mode, blocking while a global operation
    /// holds it or is waiting for it.
    pub(crate) fn acquire_shared(&self) -> SharedGuard<'_> {
        let me = OwnerId::current();
        let mut inner = self.inner.lock();
        while !inner.grant_shared(me) {
            self.cond.wait(&mut inner);
        }
        drop(inner);
        self.shared_guard()
    }

    /// Acquires the gate in shared mode, giving up at `deadline`.
    pub(crate) fn acquire_shared_until(&self, deadline: Instant) -> Option<SharedGuard<'_>> {
        let me = OwnerId::current();
        let mut inner = self.inner.lock();
        loop {
            if inner.grant_shared(me) {
                break;
            }
            if self.cond.wait_until(&mut inner, deadline).timed_out() {
                if !inner.grant_shared(me) {
                    return None;
                }
                break;
            }
        }
        drop(inner);
        Some(self.shared_guard())
    }

    /// Acquires the gate in shared mode only if that is possible without
    /// blocking. A pending exclusive request counts as blocking unless the
    /// calling context already holds the gate.
    pub(crate) fn try_acquire_shared(&self) -> Option<SharedGuard<'_>> {
        let me = OwnerId::current();
        let granted = self.inner.lock().grant_shared(me);
        granted.then(|| self.shared_guard())
    }

    /// Acquires the gate exclusively, blocking until all shared holds and any
    /// other exclusive hold are released. Re-entrant for the context that
    /// already holds the gate exclusively.
    pub(crate) fn acquire_exclusive(&self) -> ExclusiveGuard<'_> {
        let me = OwnerId::current();
        let mut inner = self.inner.lock();
        if !inner.grant_exclusive_reentrant(me) {
            inner.pending_exclusive += 1;
            while !inner.is_open() {
                self.cond.wait(&mut inner);
            }
            inner.pending_exclusive -= 1;
            inner.state = GateState::Exclusive {
                owner: me,
                depth: 1,
            };
        }
        drop(inner);
        self.exclusive_guard()
    }

    /// Acquires the gate exclusively, giving up at `deadline`.
    ///
    /// A request that gives up stops holding back shared acquisitions and
    /// re-wakes any it was blocking.
    pub(crate) fn acquire_exclusive_until(&self, deadline: Instant) -> Option<ExclusiveGuard<'_>> {
        let me = OwnerId::current();
        let mut inner = self.inner.lock();
        if inner.grant_exclusive_reentrant(me) {
            drop(inner);
            return Some(self.exclusive_guard());
        }
        inner.pending_exclusive += 1;
        while !inner.is_open() {
            if self.cond.wait_until(&mut inner, deadline).timed_out() {
                if inner.is_open() {
                    break;
                }
                inner.pending_exclusive -= 1;
                let wake_readers = inner.pending_exclusive == 0;
                drop(inner);
                if wake_readers {
                    self.cond.notify_all();
                }
                return None;
            }
        }
        inner.pending_exclusive -= 1;
        inner.state = GateState::Exclusive {
            owner: me,
            depth: 1,
        };
        drop(inner);
        Some(self.exclusive_guard())
    }

    /// Acquires the gate exclusively only if that is possible without
    /// blocking.
    pub(crate) fn try_acquire_exclusive(&self) -> Option<ExclusiveGuard<'_>> {
        let me = OwnerId::current();
        let mut inner = self.inner.lock();
        if !inner.grant_exclusive_reentrant(me) {
            if !inner.is_open() {
                return None;
            }
            inner.state = GateState::Exclusive {
                owner: me,
                depth: 1,
            };
        }
        drop(inner);
        Some(self.exclusive_guard())
    }

    fn shared_guard(&self) -> SharedGuard<'_> {
        SharedGuard {
            gate: self,
            _not_send: PhantomData,
        }
    }

    fn exclusive_guard(&self) -> ExclusiveGuard<'_> {
        ExclusiveGuard {
            gate: self,
            _not_send: PhantomData,
        }
    }

    fn release_shared(&self) {
        let me = OwnerId::current();
        let mut inner = self.inner.lock();
        let notify = inner.release_shared_hold(me);
        drop(inner);
        if notify {
            self.cond.notify_all();
        }
    }

    fn release_exclusive(&self) {
        let me = OwnerId::current();
        let mut inner = self.inner.lock();
        let notify = inner.release_exclusive_hold(me);
        drop(inner);
        if notify {
            self.cond.notify_all();
        }
    }
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        self.gate.release_shared();
    }
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.gate.release_exclusive();
    }
}
