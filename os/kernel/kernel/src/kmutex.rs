//! # Blocking Reader/Writer Mutex
//!
//! [`KMutex`] sits above the scheduler: a thread that cannot enter is queued,
//! marked blocked and switched away from. It must never be taken with the
//! local or global lock held.
//!
//! `status` is `0` when free, `n > 0` with `n` readers inside and `-1` while a
//! writer holds it.
//!
//! ## Hand-off
//!
//! The releasing thread grants the lock to waiters itself: it updates the
//! state on their behalf, removes them from the wait queue and wakes them. A
//! woken waiter therefore only checks that it is no longer queued.
//!
//! ## Policy
//!
//! Read-preferring. New readers enter whenever no writer holds the lock, and
//! a releasing writer admits every queued reader before the next writer. A
//! steady stream of readers can starve writers; this is the intended policy.
//!
//! ## Forced acquisition
//!
//! Fault handling may need the write lock on a path that might already hold
//! it. [`KMutex::write_force`] returns [`ForcedWrite`], which says whether a
//! new acquisition happened; dropping an [`ForcedWrite::AlreadyHeld`] does
//! nothing, dropping an [`ForcedWrite::Acquired`] unlocks. A read holder
//! calling it is a kernel defect and panics.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use kernel_sync::SpinLock;

/// Scheduler services a [`KMutex`] needs.
pub trait Blocker {
    /// Id of the calling thread.
    fn current(&self) -> u32;

    /// Runs `f` with preemption on this core excluded.
    fn masked<R>(&self, f: impl FnOnce() -> R) -> R;

    /// Marks `tid` as blocked. Called inside [`masked`](Self::masked).
    fn prepare_block(&self, tid: u32);

    /// Gives up the processor until `tid` is woken. Returns at once if the
    /// wake-up already happened.
    fn suspend(&self, tid: u32);

    /// Makes a blocked `tid` runnable again.
    fn wake(&self, tid: u32);
}

#[derive(Debug, Default)]
struct State {
    status: i32,
    writer: Option<u32>,
    readers: Vec<u32>,
    waiting_readers: VecDeque<u32>,
    waiting_writers: VecDeque<u32>,
}

impl State {
    /// Grant the lock to queued waiters after a release. Returns who to wake.
    fn hand_off(&mut self) -> Vec<u32> {
        let mut woken = Vec::new();
        if self.status == 0 && !self.waiting_readers.is_empty() {
            while let Some(r) = self.waiting_readers.pop_front() {
                self.status += 1;
                self.readers.push(r);
                woken.push(r);
            }
        } else if self.status == 0 {
            if let Some(w) = self.waiting_writers.pop_front() {
                self.status = -1;
                self.writer = Some(w);
                woken.push(w);
            }
        }
        woken
    }
}

/// Blocking reader/writer lock.
#[derive(Debug, Default)]
pub struct KMutex {
    state: SpinLock<State>,
}

impl KMutex {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: SpinLock::new(State {
                status: 0,
                writer: None,
                readers: Vec::new(),
                waiting_readers: VecDeque::new(),
                waiting_writers: VecDeque::new(),
            }),
        }
    }

    /// `0` free, `n > 0` readers, `-1` writer.
    #[must_use]
    pub fn status(&self) -> i32 {
        self.state.lock().status
    }

    /// Queued `(readers, writers)`.
    #[must_use]
    pub fn waiting(&self) -> (usize, usize) {
        let s = self.state.lock();
        (s.waiting_readers.len(), s.waiting_writers.len())
    }

    /// Whether `tid` holds the write lock.
    #[must_use]
    pub fn is_writer(&self, tid: u32) -> bool {
        self.state.lock().writer == Some(tid)
    }

    pub fn read<'a, B: Blocker>(&'a self, blocker: &'a B) -> ReadGuard<'a, B> {
        let tid = blocker.current();
        let entered = blocker.masked(|| {
            let mut s = self.state.lock();
            if s.status >= 0 {
                s.status += 1;
                s.readers.push(tid);
                true
            } else {
                s.waiting_readers.push_back(tid);
                blocker.prepare_block(tid);
                false
            }
        });
        if !entered {
            self.park(blocker, tid, |s| s.waiting_readers.contains(&tid));
        }
        ReadGuard {
            mutex: self,
            blocker,
            tid,
        }
    }

    pub fn write<'a, B: Blocker>(&'a self, blocker: &'a B) -> WriteGuard<'a, B> {
        let tid = blocker.current();
        let entered = blocker.masked(|| {
            let mut s = self.state.lock();
            assert_ne!(s.writer, Some(tid), "kmutex: recursive write lock by thread {tid}");
            if s.status == 0 {
                s.status = -1;
                s.writer = Some(tid);
                true
            } else {
                s.waiting_writers.push_back(tid);
                blocker.prepare_block(tid);
                false
            }
        });
        if !entered {
            self.park(blocker, tid, |s| s.waiting_writers.contains(&tid));
        }
        WriteGuard {
            mutex: self,
            blocker,
            tid,
        }
    }

    /// Write lock that tolerates the caller already holding it.
    ///
    /// # Panics
    /// If the caller holds the lock for reading.
    pub fn write_force<'a, B: Blocker>(&'a self, blocker: &'a B) -> ForcedWrite<'a, B> {
        let tid = blocker.current();
        let held = blocker.masked(|| {
            let s = self.state.lock();
            assert!(
                !s.readers.contains(&tid),
                "kmutex: forced write lock by read holder {tid}"
            );
            s.writer == Some(tid)
        });
        if held {
            ForcedWrite::AlreadyHeld(HeldWrite { tid })
        } else {
            ForcedWrite::Acquired(self.write(blocker))
        }
    }

    /// Sleeps until a releaser has dequeued `tid`, i.e. granted it the lock.
    fn park<B: Blocker>(&self, blocker: &B, tid: u32, queued: impl Fn(&State) -> bool) {
        loop {
            blocker.suspend(tid);
            let granted = blocker.masked(|| {
                let s = self.state.lock();
                if queued(&s) {
                    blocker.prepare_block(tid);
                    false
                } else {
                    true
                }
            });
            if granted {
                return;
            }
        }
    }

    fn unlock_read<B: Blocker>(&self, blocker: &B, tid: u32) {
        blocker.masked(|| {
            let woken = {
                let mut s = self.state.lock();
                debug_assert!(s.status > 0);
                if let Some(i) = s.readers.iter().position(|r| *r == tid) {
                    s.readers.swap_remove(i);
                }
                s.status -= 1;
                s.hand_off()
            };
            for w in woken {
                blocker.wake(w);
            }
        });
    }

    fn unlock_write<B: Blocker>(&self, blocker: &B, tid: u32) {
        blocker.masked(|| {
            let woken = {
                let mut s = self.state.lock();
                debug_assert_eq!(s.writer, Some(tid));
                s.status = 0;
                s.writer = None;
                s.hand_off()
            };
            for w in woken {
                blocker.wake(w);
            }
        });
    }
}

/// Shared hold of a [`KMutex`].
#[must_use = "dropping the guard releases the lock"]
pub struct ReadGuard<'a, B: Blocker> {
    mutex: &'a KMutex,
    blocker: &'a B,
    tid: u32,
}

impl<B: Blocker> Drop for ReadGuard<'_, B> {
    fn drop(&mut self) {
        self.mutex.unlock_read(self.blocker, self.tid);
    }
}

/// Exclusive hold of a [`KMutex`].
#[must_use = "dropping the guard releases the lock"]
pub struct WriteGuard<'a, B: Blocker> {
    mutex: &'a KMutex,
    blocker: &'a B,
    tid: u32,
}

impl<B: Blocker> Drop for WriteGuard<'_, B> {
    fn drop(&mut self) {
        self.mutex.unlock_write(self.blocker, self.tid);
    }
}

/// Proof that the caller already held the write lock when forcing it.
#[derive(Debug)]
pub struct HeldWrite {
    tid: u32,
}

impl HeldWrite {
    #[must_use]
    pub const fn holder(&self) -> u32 {
        self.tid
    }
}

/// Outcome of [`KMutex::write_force`].
#[must_use = "dropping the result releases a fresh acquisition"]
pub enum ForcedWrite<'a, B: Blocker> {
    /// Newly acquired; released on drop.
    Acquired(WriteGuard<'a, B>),
    /// The caller already held it; dropping leaves it held.
    AlreadyHeld(HeldWrite),
}

impl<B: Blocker> ForcedWrite<'_, B> {
    #[must_use]
    pub const fn is_fresh(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::{Arc, Condvar, Mutex};
    use std::time::Duration;

    thread_local! {
        static TID: Cell<u32> = const { Cell::new(0) };
    }

    #[derive(Default)]
    struct Parker {
        blocked: Mutex<HashMap<u32, bool>>,
        cv: Condvar,
    }

    impl Blocker for Parker {
        fn current(&self) -> u32 {
            TID.with(Cell::get)
        }

        fn masked<R>(&self, f: impl FnOnce() -> R) -> R {
            f()
        }

        fn prepare_block(&self, tid: u32) {
            self.blocked.lock().unwrap().insert(tid, true);
        }

        fn suspend(&self, tid: u32) {
            let mut blocked = self.blocked.lock().unwrap();
            while blocked.get(&tid).copied().unwrap_or(false) {
                blocked = self.cv.wait(blocked).unwrap();
            }
        }

        fn wake(&self, tid: u32) {
            self.blocked.lock().unwrap().insert(tid, false);
            self.cv.notify_all();
        }
    }

    fn as_thread<R>(tid: u32, f: impl FnOnce() -> R) -> R {
        TID.with(|t| t.set(tid));
        f()
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        while !cond() {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn writers_exclude_everyone() {
        let mutex = Arc::new(KMutex::new());
        let parker = Arc::new(Parker::default());
        let inside = Arc::new(AtomicI32::new(0));

        let handles: Vec<_> = (1..=6)
            .map(|tid| {
                let (mutex, parker, inside) = (mutex.clone(), parker.clone(), inside.clone());
                std::thread::spawn(move || {
                    as_thread(tid, || {
                        for _ in 0..50 {
                            if tid % 2 == 0 {
                                let _w = mutex.write(&*parker);
                                assert_eq!(inside.swap(-100, Ordering::SeqCst), 0, "writer overlapped");
                                std::thread::yield_now();
                                inside.store(0, Ordering::SeqCst);
                            } else {
                                let _r = mutex.read(&*parker);
                                assert!(inside.fetch_add(1, Ordering::SeqCst) >= 0, "reader overlapped a writer");
                                std::thread::yield_now();
                                inside.fetch_sub(1, Ordering::SeqCst);
                            }
                        }
                    });
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(mutex.status(), 0);
        assert_eq!(mutex.waiting(), (0, 0));
    }

    #[test]
    fn readers_share() {
        let mutex = KMutex::new();
        let parker = Parker::default();
        let a = as_thread(1, || mutex.read(&parker));
        let b = as_thread(2, || mutex.read(&parker));
        assert_eq!(mutex.status(), 2);
        drop(a);
        drop(b);
        assert_eq!(mutex.status(), 0);
    }

    #[test]
    fn releasing_writer_prefers_queued_readers() {
        let mutex = Arc::new(KMutex::new());
        let parker = Arc::new(Parker::default());
        let order = Arc::new(Mutex::new(Vec::new()));

        let held = as_thread(1, || mutex.write(&*parker));

        let writer = {
            let (mutex, parker, order) = (mutex.clone(), parker.clone(), order.clone());
            std::thread::spawn(move || {
                as_thread(2, || {
                    let _w = mutex.write(&*parker);
                    order.lock().unwrap().push("writer");
                });
            })
        };
        wait_until(|| mutex.waiting() == (0, 1));

        let reader = {
            let (mutex, parker, order) = (mutex.clone(), parker.clone(), order.clone());
            std::thread::spawn(move || {
                as_thread(3, || {
                    let r = mutex.read(&*parker);
                    order.lock().unwrap().push("reader");
                    std::thread::sleep(Duration::from_millis(20));
                    drop(r);
                });
            })
        };
        wait_until(|| mutex.waiting() == (1, 1));

        as_thread(1, || drop(held));
        reader.join().unwrap();
        writer.join().unwrap();
        assert_eq!(*order.lock().unwrap(), ["reader", "writer"]);
    }

    #[test]
    fn forced_write_is_idempotent_for_the_holder() {
        let mutex = KMutex::new();
        let parker = Parker::default();
        as_thread(4, || {
            let outer = mutex.write_force(&parker);
            assert!(outer.is_fresh());
            {
                let inner = mutex.write_force(&parker);
                assert!(matches!(&inner, ForcedWrite::AlreadyHeld(h) if h.holder() == 4));
            }
            assert!(mutex.is_writer(4), "nested release must not unlock");
            drop(outer);
        });
        assert_eq!(mutex.status(), 0);
    }

    #[test]
    #[should_panic(expected = "read holder")]
    fn forced_write_by_reader_panics() {
        let mutex = KMutex::new();
        let parker = Parker::default();
        as_thread(9, || {
            let _r = mutex.read(&parker);
            let _w = mutex.write_force(&parker);
        });
    }
}
