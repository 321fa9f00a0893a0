use {
    crate::EntityLocker,
    parking_lot::Mutex,
    std::{
        panic::{catch_unwind, AssertUnwindSafe},
        sync::{
            atomic::{
                AtomicBool, AtomicU64,
                Ordering::SeqCst,
            },
            mpsc, Barrier,
        },
        thread,
        time::{Duration, Instant},
    },
};

fn run_in_thread<T: Send>(f: impl FnOnce() -> T + Send) -> T {
    thread::scope(|s| s.spawn(|| f()).join().unwrap())
}

fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::yield_now();
    }
}

#[test]
fn runs_work_and_returns_value() {
    let locker = EntityLocker::new();
    assert_eq!(locker.run_under_entity_lock(&1, || 41 + 1), 42);
    let locker: EntityLocker<u8> = EntityLocker::new();
    assert_eq!(locker.run_under_global_lock(|| "done"), "done");
}

#[test]
fn is_locked_visibility() {
    let locker = EntityLocker::new();
    assert!(!locker.is_locked(&1));

    let (entered_tx, entered_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    thread::scope(|s| {
        let locker = &locker;
        s.spawn(move || {
            locker.run_under_entity_lock(&1, || {
                entered_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            });
        });
        entered_rx.recv().unwrap();
        assert!(locker.is_locked(&1));
        release_tx.send(()).unwrap();
    });
    assert!(!locker.is_locked(&1));
}

#[test]
fn same_id_waits() {
    let locker = EntityLocker::new();
    let second_done = AtomicBool::new(false);

    let (entered_tx, entered_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    thread::scope(|s| {
        let locker = &locker;
        let second_done = &second_done;
        s.spawn(move || {
            locker.run_under_entity_lock(&1, || {
                entered_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            });
        });
        entered_rx.recv().unwrap();
        s.spawn(move || {
            locker.run_under_entity_lock(&1, || {});
            second_done.store(true, SeqCst);
        });
        thread::sleep(Duration::from_millis(100));
        assert!(!second_done.load(SeqCst));
        release_tx.send(()).unwrap();
    });
    assert!(second_done.load(SeqCst));
}

#[test]
fn different_ids_run_in_parallel() {
    let locker = EntityLocker::new();
    let barrier = Barrier::new(2);
    thread::scope(|s| {
        for id in [1, 2] {
            let locker = &locker;
            let barrier = &barrier;
            s.spawn(move || {
                locker.run_under_entity_lock(&id, || {
                    assert!(locker.is_locked(&id));
                    // Both entities are locked at the same time or this
                    // rendezvous never completes.
                    barrier.wait();
                });
            });
        }
    });
    assert!(!locker.is_locked(&1));
    assert!(!locker.is_locked(&2));
}

#[test]
fn mutual_exclusion_per_id() {
    let locker = EntityLocker::new();
    let counter = AtomicU64::new(0);
    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..250 {
                    locker.run_under_entity_lock(&1, || {
                        counter.store(counter.load(SeqCst) + 1, SeqCst);
                    });
                }
            });
        }
    });
    assert_eq!(counter.load(SeqCst), 1000);
    assert_eq!(locker.table.entry_count(), 0);
}

#[test]
fn reentrancy() {
    let locker = EntityLocker::new();
    locker.run_under_entity_lock(&1, || {
        locker.run_under_entity_lock(&1, || {
            locker.run_under_entity_lock(&1, || {
                assert!(locker.is_locked(&1));
            });
            assert!(locker.is_locked(&1));
        });
        assert!(locker.is_locked(&1));
        run_in_thread(|| {
            assert!(locker.try_run_under_entity_lock(&1, || ()).is_none());
        });
    });
    assert!(!locker.is_locked(&1));
    run_in_thread(|| {
        assert!(locker.try_run_under_entity_lock(&1, || ()).is_some());
    });
}

#[test]
fn global_orders_entity_work() {
    let locker = EntityLocker::new();
    let events = Mutex::new(Vec::new());

    let (a_entered_tx, a_entered_rx) = mpsc::channel::<()>();
    let (a_release_tx, a_release_rx) = mpsc::channel::<()>();
    let (b_release_tx, b_release_rx) = mpsc::channel::<()>();
    thread::scope(|s| {
        let locker = &locker;
        let events = &events;
        s.spawn(move || {
            locker.run_under_entity_lock(&1, || {
                a_entered_tx.send(()).unwrap();
                a_release_rx.recv().unwrap();
                events.lock().push('a');
            });
        });
        a_entered_rx.recv().unwrap();
        s.spawn(move || {
            locker.run_under_global_lock(|| {
                events.lock().push('b');
                b_release_rx.recv().unwrap();
            });
        });
        // The global section must not start while entity work is in flight.
        thread::sleep(Duration::from_millis(100));
        assert!(events.lock().is_empty());
        // A new entity call must not start while the global request is
        // pending or running.
        s.spawn(move || {
            locker.run_under_entity_lock(&1, || {
                events.lock().push('c');
            });
        });
        thread::sleep(Duration::from_millis(50));
        assert!(events.lock().is_empty());
        a_release_tx.send(()).unwrap();
        wait_for(|| events.lock().contains(&'b'));
        thread::sleep(Duration::from_millis(50));
        assert!(!events.lock().contains(&'c'));
        b_release_tx.send(()).unwrap();
    });
    assert_eq!(*events.lock(), vec!['a', 'b', 'c']);
}

#[test]
fn nested_entity_locks_with_pending_global() {
    let locker = EntityLocker::new();
    let nested_done = AtomicBool::new(false);

    let (entered_tx, entered_rx) = mpsc::channel::<()>();
    let (resume_tx, resume_rx) = mpsc::channel::<()>();
    thread::scope(|s| {
        let locker = &locker;
        let nested_done = &nested_done;
        s.spawn(move || {
            locker.run_under_entity_lock(&1, || {
                entered_tx.send(()).unwrap();
                resume_rx.recv().unwrap();
                // Must be admitted even while a global request is waiting:
                // the request cannot be served before this thread's outer
                // call finishes.
                locker.run_under_entity_lock(&2, || {
                    nested_done.store(true, SeqCst);
                });
            });
        });
        entered_rx.recv().unwrap();
        s.spawn(move || {
            locker.run_under_global_lock(|| {});
        });
        // Give the global request time to start waiting.
        thread::sleep(Duration::from_millis(100));
        resume_tx.send(()).unwrap();
        wait_for(|| nested_done.load(SeqCst));
    });
    assert!(!locker.is_locked(&1));
    assert!(!locker.is_locked(&2));
    assert_eq!(locker.table.entry_count(), 0);
}

#[test]
fn global_reentrancy() {
    let locker = EntityLocker::new();
    let value = locker.run_under_global_lock(|| {
        locker.run_under_global_lock(|| {
            locker.run_under_entity_lock(&5, || {
                assert!(locker.is_locked(&5));
                locker.run_under_entity_lock(&5, || 99)
            })
        })
    });
    assert_eq!(value, 99);
    assert!(!locker.is_locked(&5));
    assert_eq!(locker.table.entry_count(), 0);
    run_in_thread(|| {
        assert!(locker.try_run_under_global_lock(|| ()).is_some());
    });
}

#[test]
fn release_on_panic() {
    let locker = EntityLocker::new();
    let result = catch_unwind(AssertUnwindSafe(|| {
        locker.run_under_entity_lock(&1, || panic!("work failed"));
    }));
    assert!(result.is_err());
    assert!(!locker.is_locked(&1));
    assert_eq!(locker.table.entry_count(), 0);
    run_in_thread(|| {
        assert!(locker.try_run_under_entity_lock(&1, || ()).is_some());
    });
}

#[test]
fn release_on_panic_in_nested_call() {
    let locker = EntityLocker::new();
    let result = catch_unwind(AssertUnwindSafe(|| {
        locker.run_under_entity_lock(&1, || {
            locker.run_under_entity_lock(&1, || panic!("inner work failed"));
        });
    }));
    assert!(result.is_err());
    assert!(!locker.is_locked(&1));
    assert_eq!(locker.table.entry_count(), 0);
    run_in_thread(|| {
        assert!(locker.try_run_under_entity_lock(&1, || ()).is_some());
    });
}

#[test]
fn release_on_panic_in_global_work() {
    let locker: EntityLocker<u32> = EntityLocker::new();
    let result = catch_unwind(AssertUnwindSafe(|| {
        locker.run_under_global_lock(|| panic!("global work failed"));
    }));
    assert!(result.is_err());
    // Would block forever if the exclusion had leaked.
    locker.run_under_entity_lock(&1, || {});
    run_in_thread(|| {
        assert!(locker.try_run_under_global_lock(|| ()).is_some());
    });
}

#[test]
fn try_variants() {
    let locker = EntityLocker::new();
    let ran = AtomicBool::new(false);
    locker.run_under_entity_lock(&1, || {
        run_in_thread(|| {
            assert!(locker
                .try_run_under_entity_lock(&1, || ran.store(true, SeqCst))
                .is_none());
            assert!(locker
                .try_run_under_global_lock(|| ran.store(true, SeqCst))
                .is_none());
            assert!(locker.try_run_under_entity_lock(&2, || ()).is_some());
        });
        // The holder itself can re-enter without blocking.
        assert!(locker.try_run_under_entity_lock(&1, || ()).is_some());
    });
    locker.run_under_global_lock(|| {
        run_in_thread(|| {
            assert!(locker
                .try_run_under_entity_lock(&1, || ran.store(true, SeqCst))
                .is_none());
            assert!(locker
                .try_run_under_global_lock(|| ran.store(true, SeqCst))
                .is_none());
        });
    });
    assert!(!ran.load(SeqCst));
    assert!(locker.try_run_under_entity_lock(&1, || ()).is_some());
    assert!(locker.try_run_under_global_lock(|| ()).is_some());
}

#[test]
fn timed_variants() {
    let locker = EntityLocker::new();
    let timeout = Duration::from_millis(100);
    locker.run_under_entity_lock(&1, || {
        run_in_thread(|| {
            let start = Instant::now();
            assert!(locker
                .try_run_under_entity_lock_for(&1, timeout, || ())
                .is_none());
            assert!(start.elapsed() >= timeout);
            let start = Instant::now();
            assert!(locker
                .try_run_under_global_lock_for(timeout, || ())
                .is_none());
            assert!(start.elapsed() >= timeout);
        });
        // Re-entering never waits for the timeout.
        assert!(locker
            .try_run_under_entity_lock_for(&1, timeout, || ())
            .is_some());
    });
    assert!(locker
        .try_run_under_entity_lock_for(&1, timeout, || ())
        .is_some());
    assert!(locker
        .try_run_under_global_lock_for(timeout, || ())
        .is_some());
    assert_eq!(locker.table.entry_count(), 0);
}

#[test]
fn instances_are_independent() {
    let first = EntityLocker::new();
    let second = EntityLocker::new();
    first.run_under_entity_lock(&1, || {
        assert!(!second.is_locked(&1));
        run_in_thread(|| {
            assert!(second.try_run_under_entity_lock(&1, || ()).is_some());
        });
    });
}

#[test]
fn debug() {
    let locker: EntityLocker<u32> = EntityLocker::new();
    assert_eq!(format!("{locker:?}"), "EntityLocker { entries: 0, .. }");
}
