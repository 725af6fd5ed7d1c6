//! # Process and Thread Lifecycle
//!
//! ```text
//!   spawn / fork / thread_fork            vanish (last thread)        reaper             wait
//!  ───────────────────────────► Initialized ──────────────► PreZombie ───────► Zombie ───────► freed
//! ```
//!
//! `vanish` only marks the calling thread dead and leaves the processor; the
//! kernel stack it is still running on is reclaimed later by the reaper (see
//! [`reaper`](crate::reaper)), which the scheduler invokes when it walks past
//! the dead thread.

use crate::arch::{Arch, KernelContext};
use crate::fork::ForkError;
use crate::hv::HyperInfo;
use crate::kernel::Kernel;
use crate::kmutex::Blocker;
use crate::loader::{LoadError, LoadedImage};
use crate::process::{Process, ProcessInner, ProcessState};
use crate::thread::{Thread, ThreadStatus};
use crate::trap::TrapFrame;
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;
use core::mem;
use kernel_memory_addresses::{PhysicalPage, VirtualAddress};
use kernel_vmem::{AccessError, AddressSpace};
use log::{debug, info};

/// Why `wait` returned without a child.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("no children left to wait for")]
    NoChildren,
}

/// Why `exec` kept the old image.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecError {
    #[error("caller has more than one thread")]
    NotSingleThreaded,
    #[error(transparent)]
    Load(#[from] LoadError),
}

impl<A: Arch> Kernel<A> {
    /// Registers the calling context as this core's idle thread and starts
    /// INIT. Returns INIT's pid.
    ///
    /// # Errors
    /// INIT could not be loaded.
    pub fn boot(&self, init: &[u8]) -> Result<u32, LoadError> {
        let cpu = self.cpu();
        let stack = self.with_frames(|p| p.kernel.allocate()).ok_or(LoadError::OutOfMemory)?;
        let tid = self.allocate_id();
        let idle = Thread::new(tid, tid, stack, KernelContext::default());
        idle.set_status(ThreadStatus::Running);
        idle.owner.adopt(tid);
        if self.threads.insert(self.irq(), tid, idle).is_err() {
            panic!("boot: idle thread {tid} registered twice");
        }
        cpu.set_current(tid);
        cpu.set_idle(tid);
        self.arch.activate(self.kernel_directory);

        let pid = self.spawn(init, &[init.to_vec()])?;
        self.set_init_pid(pid);
        info!("boot: idle thread {tid}, init pid {pid}");
        Ok(pid)
    }

    /// Body of the idle thread.
    pub fn idle_loop(&self) -> ! {
        loop {
            self.yield_to_next();
            self.arch.wait_for_interrupt();
        }
    }

    /// Starts image `name` as a new parentless process.
    ///
    /// # Errors
    /// See [`LoadError`]; nothing stays allocated on failure.
    pub fn spawn(&self, name: &[u8], args: &[Vec<u8>]) -> Result<u32, LoadError> {
        let (directory, loaded) = self.build_image(name, args)?;
        let Some(stack) = self.with_frames(|p| p.kernel.allocate()) else {
            self.destroy_address_space(directory);
            return Err(LoadError::OutOfMemory);
        };

        let pid = self.allocate_id();
        let process = Process::new(
            pid,
            directory,
            ProcessInner {
                live_threads: 1,
                threads: 1,
                layout: loaded.layout,
                ..ProcessInner::default()
            },
        );
        if loaded.guest {
            process.set_guest(self.irq(), Some(Box::new(HyperInfo::new(directory, self.config.delayed_irq_capacity))));
        }
        let thread = Thread::new(pid, pid, stack, self.arch.initial_context(stack));
        self.masked(|| *thread.user_frame(self.arch.mapper()) = loaded.frame);
        self.consoles_retain(0);
        self.register(process, thread);
        debug!("spawn: {} as pid {pid}", String::from_utf8_lossy(name));
        Ok(pid)
    }

    /// Fresh directory holding image `name`.
    fn build_image(&self, name: &[u8], args: &[Vec<u8>]) -> Result<(PhysicalPage, LoadedImage), LoadError> {
        let directory = self.with_frames(|pools| {
            AddressSpace::create(self.arch.mapper(), &mut pools.kernel, self.kernel_map.entries()).map(|s| s.root())
        })?;
        let space = AddressSpace::from_root(self.arch.mapper(), directory);
        match self.load_image(space, name, args) {
            Ok(loaded) => Ok((directory, loaded)),
            Err(e) => {
                self.destroy_address_space(directory);
                Err(e)
            }
        }
    }

    /// Replaces the image of the calling process. Returns the register
    /// state to enter the new program with.
    ///
    /// # Errors
    /// See [`ExecError`]; the old image is untouched on failure.
    pub fn exec(&self, name: &[u8], args: &[Vec<u8>]) -> Result<TrapFrame, ExecError> {
        let Some(process) = self.current_process() else {
            return Err(ExecError::NotSingleThreaded);
        };
        if process.with(self.irq(), |p| p.live_threads) != 1 {
            return Err(ExecError::NotSingleThreaded);
        }
        let (directory, loaded) = self.build_image(name, args)?;

        let old = {
            let _w = process.memlock.write(self);
            let old = self.masked(|| {
                let old = process.replace_directory(directory);
                self.arch.activate(directory);
                old
            });
            process.with(self.irq(), |p| {
                p.layout = loaded.layout;
                p.zfod_reserved = 0;
            });
            old
        };
        self.destroy_address_space(old);
        self.current_thread().set_swexn(self.irq(), None);
        if loaded.guest {
            process.set_guest(self.irq(), Some(Box::new(HyperInfo::new(directory, self.config.delayed_irq_capacity))));
        }
        debug!("exec: pid {} now runs {}", process.pid(), String::from_utf8_lossy(name));
        Ok(loaded.frame)
    }

    /// Adds a thread to the calling process that resumes from the same user
    /// frame with `eax = 0`. Returns its tid.
    ///
    /// # Errors
    /// [`ForkError::OutOfMemory`] when no kernel stack is left.
    pub fn thread_fork(&self) -> Result<u32, ForkError> {
        let Some(process) = self.current_process() else {
            return Err(ForkError::NotSingleThreaded);
        };
        let stack = self.with_frames(|p| p.kernel.allocate()).ok_or(ForkError::OutOfMemory)?;
        let tid = self.allocate_id();
        let thread = Thread::new(tid, process.pid(), stack, self.arch.initial_context(stack));
        let me = self.current_thread();
        self.masked(|| {
            let parent = *me.user_frame(self.arch.mapper());
            *thread.user_frame(self.arch.mapper()) = TrapFrame { eax: 0, ..parent };
        });
        process.with(self.irq(), |p| {
            p.live_threads += 1;
            p.threads += 1;
        });
        thread.set_status(ThreadStatus::Runnable);
        if self.threads.insert(self.irq(), tid, thread).is_err() {
            panic!("thread_fork: duplicate tid {tid}");
        }
        debug!("thread_fork: pid {} gained thread {tid}", process.pid());
        Ok(tid)
    }

    /// Records the exit status of the calling process.
    pub fn set_status(&self, status: i32) {
        if let Some(process) = self.current_process() {
            process.with(self.irq(), |p| p.exit_status = status);
        }
    }

    /// Ends the calling thread. The last thread of a process turns it into a
    /// pre-zombie for the reaper.
    pub fn vanish_current(&self) -> ! {
        let tid = self.cpu().current();
        if let Some(process) = self.current_process() {
            let last = process.with(self.irq(), |p| {
                p.live_threads -= 1;
                p.live_threads == 0
            });
            if last {
                if process.is_guest(self.irq()) {
                    self.leave_guest(&process);
                }
                process.set_state(ProcessState::PreZombie);
                debug!("vanish: pid {} exiting", process.pid());
            }
        }
        self.masked(|| self.current_thread().set_status(ThreadStatus::Dead));
        self.yield_to_next();
        unreachable!("thread {tid} ran after vanishing");
    }

    /// Collects the oldest exited child: `(pid, exit status)`.
    ///
    /// # Errors
    /// [`WaitError::NoChildren`] when nothing is left to wait for.
    pub fn wait(&self) -> Result<(u32, i32), WaitError> {
        let Some(process) = self.current_process() else {
            return Err(WaitError::NoChildren);
        };
        let tid = self.cpu().current();
        loop {
            let found = self.masked(|| {
                let (found, idle) = process.with(self.irq(), |p| {
                    if let Some(zombie) = p.zombies.pop_front() {
                        // Nothing left for any other waiter to collect.
                        let idle = if p.zombies.is_empty() && p.children.is_empty() {
                            mem::take(&mut p.waiters)
                        } else {
                            VecDeque::new()
                        };
                        return (Some(Ok(zombie)), idle);
                    }
                    if p.children.is_empty() {
                        return (Some(Err(WaitError::NoChildren)), VecDeque::new());
                    }
                    p.waiters.push_back(tid);
                    (None, VecDeque::new())
                });
                for waiter in idle {
                    self.wake(waiter);
                }
                if found.is_none() {
                    self.prepare_block(tid);
                }
                found
            });
            match found {
                Some(Ok(pid)) => {
                    let status = self.process(pid).map_or(0, |z| z.with(self.irq(), |z| z.exit_status));
                    self.processes.remove(self.irq(), pid);
                    debug!("wait: pid {} collected {pid} ({status})", process.pid());
                    return Ok((pid, status));
                }
                Some(Err(e)) => return Err(e),
                None => self.suspend(tid),
            }
        }
    }

    /// Blocks the caller unless the word at `reject` is non-zero.
    ///
    /// # Errors
    /// `reject` is not readable.
    pub fn deschedule(&self, reject: VirtualAddress) -> Result<(), AccessError> {
        let Some(process) = self.current_process() else {
            return Ok(());
        };
        let tid = self.cpu().current();
        let blocked = {
            let _r = process.memlock.read(self);
            let space = self.space_of(&process);
            self.masked(|| {
                if space.read_u32(reject)? != 0 {
                    return Ok(false);
                }
                if let Some(me) = self.thread(tid) {
                    me.set_descheduled(true);
                }
                self.prepare_block(tid);
                Ok(true)
            })?
        };
        if blocked {
            self.suspend(tid);
        }
        Ok(())
    }

    /// Wakes `tid` if it is blocked in `deschedule`. Returns whether it was.
    pub fn make_runnable(&self, tid: u32) -> bool {
        let Some(thread) = self.thread(tid) else {
            return false;
        };
        self.masked(|| {
            if thread.is_descheduled() && thread.transition(ThreadStatus::Blocked, ThreadStatus::Runnable).is_ok() {
                thread.set_descheduled(false);
                true
            } else {
                false
            }
        })
    }

    /// Blocks the caller for `ticks` timer ticks.
    pub fn sleep(&self, ticks: u32) {
        if ticks == 0 {
            return;
        }
        let tid = self.cpu().current();
        let wake_at = self.ticks().wrapping_add(ticks);
        self.masked(|| {
            let mut sleepers = self.sleepers.lock();
            sleepers.reserve(1);
            sleepers.push((wake_at, tid));
            self.prepare_block(tid);
        });
        self.suspend(tid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimArch;
    use crate::fork::ForkRendezvous;
    use crate::testkit::{USER_ENTRY, booted, expect_vanish, run_as, start_current};

    /// Forks the current process and runs the child up to user mode.
    fn forked_child(k: &Kernel<SimArch>, rendezvous: &ForkRendezvous) -> u32 {
        let child = {
            let parent = k.current_process().unwrap();
            k.fork_snapshot(&parent, rendezvous).unwrap()
        };
        run_as(k, child);
        start_current(k);
        child
    }

    #[test]
    fn exited_child_is_reaped_then_collected() {
        let (k, init) = booted();
        let rendezvous = ForkRendezvous::new();
        let child = forked_child(&k, &rendezvous);

        k.set_status(7);
        expect_vanish(&k, || k.vanish_current());
        assert_eq!(k.cpu().current(), init);
        assert_eq!(k.process(child).unwrap().state(), ProcessState::PreZombie);

        // Walking past the dead thread reaps it.
        k.yield_to_next();
        assert!(k.thread(child).is_none());
        assert_eq!(k.process(child).unwrap().state(), ProcessState::Zombie);

        assert_eq!(k.wait(), Ok((child, 7)));
        assert!(k.process(child).is_none());
        assert_eq!(k.wait(), Err(WaitError::NoChildren));
    }

    #[test]
    fn children_are_collected_in_arrival_order() {
        let (k, init) = booted();
        let first_fork = ForkRendezvous::new();
        let first = forked_child(&k, &first_fork);
        run_as(&k, init);
        let second_fork = ForkRendezvous::new();
        let second = forked_child(&k, &second_fork);

        // The younger child exits first and is reaped before the older one.
        k.set_status(22);
        expect_vanish(&k, || k.vanish_current());
        run_as(&k, first);
        k.yield_to_next();
        assert_eq!(k.process(second).unwrap().state(), ProcessState::Zombie);

        run_as(&k, first);
        k.set_status(11);
        expect_vanish(&k, || k.vanish_current());
        assert_eq!(k.cpu().current(), init);
        k.yield_to_next();
        assert_eq!(k.process(first).unwrap().state(), ProcessState::Zombie);

        assert_eq!(k.wait(), Ok((second, 22)));
        assert_eq!(k.wait(), Ok((first, 11)));
        assert_eq!(k.wait(), Err(WaitError::NoChildren));
    }

    #[test]
    fn every_waiter_learns_when_the_last_child_is_gone() {
        let (k, init) = booted();
        let rendezvous = ForkRendezvous::new();
        let child = forked_child(&k, &rendezvous);
        run_as(&k, init);
        let sibling = k.thread_fork().unwrap();

        // Both threads of INIT wait for the one child.
        run_as(&k, child);
        let parent = k.process(init).unwrap();
        k.masked(|| {
            parent.with(k.irq(), |p| p.waiters.extend([init, sibling]));
            k.prepare_block(init);
            k.prepare_block(sibling);
        });

        expect_vanish(&k, || k.vanish_current());
        k.yield_to_next();
        assert!(parent.with(k.irq(), |p| p.waiters.is_empty()));
        assert_eq!(k.thread(sibling).unwrap().status(), ThreadStatus::Runnable);

        run_as(&k, init);
        assert_eq!(k.wait(), Ok((child, 0)));
        run_as(&k, sibling);
        assert_eq!(k.wait(), Err(WaitError::NoChildren));
    }

    #[test]
    fn orphans_go_to_init() {
        let (k, init) = booted();
        let outer = ForkRendezvous::new();
        let middle = forked_child(&k, &outer);
        let inner = ForkRendezvous::new();
        let grandchild = forked_child(&k, &inner);

        run_as(&k, middle);
        expect_vanish(&k, || k.vanish_current());
        run_as(&k, init);
        k.yield_to_next();
        run_as(&k, init);

        let adopted = k.process(grandchild).unwrap().with(k.irq(), |p| p.parent);
        assert_eq!(adopted, Some(init));
        let children = k.process(init).unwrap().with(k.irq(), |p| p.children.clone());
        assert!(children.contains(&grandchild));
        assert_eq!(k.wait(), Ok((middle, 0)));
    }

    #[test]
    fn make_runnable_only_wakes_descheduled_threads() {
        let (k, _) = booted();
        let other = k.spawn(b"prog", &[]).unwrap();
        assert!(!k.make_runnable(other));

        let thread = k.thread(other).unwrap();
        k.masked(|| {
            thread.set_descheduled(true);
            k.prepare_block(other);
        });
        assert!(k.make_runnable(other));
        assert_eq!(thread.status(), ThreadStatus::Runnable);
        assert!(!thread.is_descheduled());
        assert!(!k.make_runnable(other));
    }

    #[test]
    fn sleeping_zero_ticks_returns_at_once() {
        let (k, init) = booted();
        k.sleep(0);
        assert_eq!(k.cpu().current(), init);
        assert!(k.sleepers.lock().is_empty());
    }

    #[test]
    fn exec_replaces_the_image() {
        let (k, init) = booted();
        let frame = k.exec(b"prog", &[b"prog".to_vec(), b"-v".to_vec()]).unwrap();
        assert_eq!(frame.eip, USER_ENTRY);
        assert_eq!(k.exec(b"missing", &[]), Err(ExecError::Load(LoadError::NoSuchImage)));
        assert_eq!(k.cpu().current(), init);
    }
}
