//! # Reaper
//!
//! Reclaims dead threads on behalf of the scheduler. A thread cannot free
//! the kernel stack it runs on, so `vanish` leaves that to whichever thread
//! next walks past it in [`Kernel::yield_to_next`].
//!
//! Reaping runs with the local lock held and the dead thread's token claimed
//! by this core. It must not block: page tables are torn down directly
//! without the process's `memlock`, which is safe because nothing is left
//! that could use the address space.

use crate::arch::Arch;
use crate::kernel::Kernel;
use crate::kmutex::Blocker;
use crate::process::{Process, ProcessInner, ProcessState};
use crate::thread::ThreadStatus;
use alloc::collections::{BTreeSet, VecDeque};
use core::mem;
use log::{debug, trace, warn};

impl<A: Arch> Kernel<A> {
    /// Frees dead thread `tid` and, with the last thread of an exited
    /// process, the process's address space.
    pub(crate) fn reap(&self, tid: u32) {
        let Some(thread) = self.thread(tid) else {
            return;
        };
        debug_assert_eq!(thread.status(), ThreadStatus::Dead);
        thread.set_status(ThreadStatus::Reaped);
        let (pid, stack) = (thread.pid(), thread.kernel_stack());
        drop(thread);

        self.threads.remove(self.irq(), tid);
        self.with_frames(|pools| pools.kernel.free(stack));
        trace!("reaper: thread {tid} of {pid} gone");

        let Some(process) = self.process(pid) else {
            return;
        };
        let remaining = process.with(self.irq(), |p| {
            p.threads -= 1;
            p.threads
        });
        if remaining == 0 && process.state() == ProcessState::PreZombie {
            self.reap_process(&process);
        }
    }

    /// Turns an exited process into a zombie and hands it to its parent.
    fn reap_process(&self, process: &Process) {
        let pid = process.pid();
        let directory = process.directory();
        if self.arch.active() == directory {
            self.arch.activate(self.kernel_directory);
        }
        process.replace_directory(self.kernel_directory);
        self.destroy_address_space(directory);

        let (parent, children, zombies, console) = process.with(self.irq(), |p| {
            p.zfod_reserved = 0;
            (p.parent.take(), mem::take(&mut p.children), mem::take(&mut p.zombies), p.console)
        });
        process.set_state(ProcessState::Zombie);
        self.consoles_release(console);
        self.adopt_orphans(pid, children, zombies);

        let parent = parent.and_then(|ppid| self.process(ppid)).filter(|p| p.state() != ProcessState::Zombie);
        match parent {
            Some(parent) => {
                let waiters = parent.with(self.irq(), |p| {
                    p.children.remove(&pid);
                    p.zombies.push_back(pid);
                    waiters_to_wake(p)
                });
                for waiter in waiters {
                    self.wake(waiter);
                }
                debug!("reaper: pid {pid} is a zombie of {}", parent.pid());
            }
            None => {
                self.processes.remove(self.irq(), pid);
                debug!("reaper: pid {pid} had no parent, freed");
            }
        }
    }

    /// Moves the children and uncollected zombies of `pid` to INIT.
    fn adopt_orphans(&self, pid: u32, children: BTreeSet<u32>, zombies: VecDeque<u32>) {
        if children.is_empty() && zombies.is_empty() {
            return;
        }
        let init = self.init_pid().filter(|init| *init != pid).and_then(|init| self.process(init));
        let Some(init) = init else {
            warn!("reaper: pid {pid} leaves orphans and there is no INIT to take them");
            for child in &children {
                if let Some(c) = self.process(*child) {
                    c.with(self.irq(), |c| c.parent = None);
                }
            }
            for zombie in zombies {
                self.processes.remove(self.irq(), zombie);
            }
            return;
        };

        for child in &children {
            if let Some(c) = self.process(*child) {
                c.with(self.irq(), |c| c.parent = Some(init.pid()));
            }
        }
        let woken = !zombies.is_empty();
        let waiters = init.with(self.irq(), |i| {
            i.children.extend(children.iter().copied());
            i.zombies.extend(zombies);
            if woken { waiters_to_wake(i) } else { VecDeque::new() }
        });
        for waiter in waiters {
            self.wake(waiter);
        }
        debug!("reaper: INIT adopted {} children of {pid}", children.len());
    }
}

/// Waiters to wake after a zombie arrived: one per zombie while children
/// remain, all of them once none do, so the rest see that nothing is left.
pub(crate) fn waiters_to_wake(p: &mut ProcessInner) -> VecDeque<u32> {
    if p.children.is_empty() {
        return mem::take(&mut p.waiters);
    }
    let take = p.zombies.len().min(p.waiters.len());
    p.waiters.drain(..take).collect()
}
