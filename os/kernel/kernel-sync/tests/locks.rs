use kernel_sync::{FlagIrq, GlobalLock, Irq, LocalLock, SpinLock};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::{panic, thread};

#[test]
fn spin_lock_basic_raii() {
    let l = SpinLock::new(0_u32);
    {
        let mut g = l.lock();
        *g = 41;
        assert!(l.is_locked());
    }
    assert!(!l.is_locked());
    l.with_lock(|v| *v += 1);
    assert_eq!(*l.lock(), 42);
}

#[test]
fn spin_lock_try_lock_semantics() {
    let l = SpinLock::new(1u8);
    let g1 = l.try_lock();
    assert!(g1.is_some());
    assert!(l.try_lock().is_none());
    drop(g1);
    assert!(l.try_lock().is_some());
}

#[test]
fn spin_lock_is_released_on_panic() {
    let l = SpinLock::new(0u32);
    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        l.with_lock(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err(), "expected panic");
    assert_eq!(l.with_lock(|v| *v), 123);
}

#[test]
fn spin_lock_contended_increments_are_exact() {
    let threads = 8;
    let iters = 5_000;

    let lock = Arc::new(SpinLock::new(0usize));
    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let in_cs = Arc::clone(&in_cs);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..iters {
                    lock.with_lock(|v| {
                        let prev = in_cs.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(prev, 0, "mutual exclusion violated");
                        *v += 1;
                        in_cs.fetch_sub(1, Ordering::SeqCst);
                    });
                    thread::yield_now();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(lock.with_lock(|v| *v), threads * iters);
}

struct Shared(UnsafeCell<usize>);
unsafe impl Sync for Shared {}

/// Each std thread plays one core: its own local lock and interrupt flag.
#[test]
fn global_lock_excludes_cores_and_nests() {
    let cores = 4u32;
    let iters = 2_000;

    let lock = Arc::new(GlobalLock::new());
    let counter = Arc::new(Shared(UnsafeCell::new(0)));
    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(cores as usize));

    let handles: Vec<_> = (0..cores)
        .map(|cpu| {
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            let in_cs = Arc::clone(&in_cs);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                let irq = FlagIrq::new(true);
                let local = LocalLock::new();
                start.wait();
                for _ in 0..iters {
                    let _outer = lock.acquire(cpu, &local, &irq);
                    assert!(!irq.interrupts_enabled());
                    let _inner = lock.acquire(cpu, &local, &irq);
                    assert_eq!(in_cs.fetch_add(1, Ordering::SeqCst), 0);
                    unsafe { *counter.0.get() += 1 };
                    in_cs.fetch_sub(1, Ordering::SeqCst);
                }
                assert!(irq.interrupts_enabled());
                assert_eq!(local.depth(), 0);
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(unsafe { *counter.0.get() }, cores as usize * iters);
    assert_eq!(lock.owner(), None);
}
