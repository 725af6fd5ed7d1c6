//! # Two-Phase Fork
//!
//! ```text
//!  parent                                   child
//!  ──────                                   ─────
//!  snapshot: clone page tables (leaves
//!  shared), copy kernel stack, relocate
//!  frame-pointer chain, register child
//!  block until rendezvous.done  ─ ─ ─ ─ ─►  thread_entry → rebuild:
//!                                             private copy of every leaf
//!                                             (zero-fill pages: fresh zero frame)
//!                               ◄─ ─ ─ ─ ─   rendezvous.complete(ok / err), wake
//!  return child pid / error                 return 0 to user
//! ```
//!
//! The parent stays blocked for the whole rebuild, so the shared leaves are
//! never written while both page tables point at them. The rendezvous lives
//! on the parent's kernel stack; the child touches it only before waking
//! the parent.

use crate::arch::Arch;
use crate::kernel::Kernel;
use crate::kmutex::Blocker;
use crate::process::{Process, ProcessInner};
use crate::thread::{Thread, ThreadStatus};
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_info::memory::{KERNEL_STACK_SIZE, PAGE_SIZE};
use kernel_vmem::{EntryFlags, PageEntry, PhysMapper, SoftwareBits, USER_PDE_RANGE};
use log::debug;

/// Why a fork did not produce a child.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ForkError {
    #[error("caller has more than one thread")]
    NotSingleThreaded,
    #[error("out of memory")]
    OutOfMemory,
}

/// Completion flag the child writes on the parent's stack.
#[derive(Debug, Default)]
pub struct ForkRendezvous {
    done: AtomicBool,
    failed: AtomicBool,
}

impl ForkRendezvous {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn complete(&self, result: Result<(), ForkError>) {
        self.failed.store(result.is_err(), Ordering::Relaxed);
        self.done.store(true, Ordering::Release);
    }

    /// Outcome once [`is_done`](Self::is_done).
    ///
    /// # Errors
    /// [`ForkError::OutOfMemory`] if the child could not rebuild.
    pub fn outcome(&self) -> Result<(), ForkError> {
        debug_assert!(self.is_done());
        if self.failed.load(Ordering::Acquire) {
            Err(ForkError::OutOfMemory)
        } else {
            Ok(())
        }
    }
}

/// Rebuild work handed to a fresh fork child.
#[derive(Debug)]
pub struct ForkJob {
    pub(crate) parent_pid: u32,
    pub(crate) parent_tid: u32,
    rendezvous: *const ForkRendezvous,
}

// SAFETY: the pointee outlives the job (the parent blocks until `complete`).
unsafe impl Send for ForkJob {}

/// Rewrites the saved-`ebp` chain of a kernel stack copied from
/// `[from_base, from_base + KERNEL_STACK_SIZE)` so every link points into the
/// copy at `to_base`. `ebp` is the innermost frame pointer (in the original
/// stack). The walk ends at a zero link or at the first link leaving the
/// original stack. Returns the number of links rewritten.
pub fn relocate_frame_chain(stack: &mut [u8; KERNEL_STACK_SIZE as usize], from_base: u32, to_base: u32, ebp: u32) -> usize {
    let end = from_base + KERNEL_STACK_SIZE;
    let in_stack = |a: u32| a >= from_base && a <= end - 4;
    let mut rewritten = 0;
    let mut at = ebp;
    while in_stack(at) {
        let offset = (at - from_base) as usize;
        let link = u32::from_le_bytes([stack[offset], stack[offset + 1], stack[offset + 2], stack[offset + 3]]);
        if link == 0 || !in_stack(link) || link <= at {
            break;
        }
        let relocated = link - from_base + to_base;
        stack[offset..offset + 4].copy_from_slice(&relocated.to_le_bytes());
        rewritten += 1;
        at = link;
    }
    rewritten
}

impl<A: Arch> Kernel<A> {
    /// `fork` for the calling thread. Returns the child's pid in the
    /// parent; the child returns 0 to user mode from its own entry path.
    ///
    /// # Errors
    /// See [`ForkError`].
    pub fn fork(&self) -> Result<u32, ForkError> {
        let Some(parent) = self.current_process() else {
            return Err(ForkError::NotSingleThreaded);
        };
        let rendezvous = ForkRendezvous::new();
        let child = self.fork_snapshot(&parent, &rendezvous)?;
        drop(parent);
        self.block_until(|| rendezvous.is_done());
        rendezvous.outcome().map(|()| child)
    }

    /// Phase one, run by the parent: builds and registers the child.
    ///
    /// # Errors
    /// See [`ForkError`]; nothing is left allocated on failure.
    pub(crate) fn fork_snapshot(&self, parent: &Process, rendezvous: &ForkRendezvous) -> Result<u32, ForkError> {
        if parent.with(self.irq(), |p| p.live_threads) != 1 {
            return Err(ForkError::NotSingleThreaded);
        }
        let me = self.current_thread();
        let mapper = self.arch.mapper();

        let _r = parent.memlock.read(self);
        let (directory, stack) = self.with_frames(|pools| {
            let space = self.space_of(parent).clone_tables(&mut pools.kernel).map_err(|_| ForkError::OutOfMemory)?;
            let Some(stack) = pools.kernel.allocate() else {
                space.destroy(&mut pools.kernel);
                return Err(ForkError::OutOfMemory);
            };
            mapper.copy_frame(me.kernel_stack(), stack);
            let from = me.kernel_stack().base().as_u32();
            let links = relocate_frame_chain(mapper.frame_bytes(stack), from, stack.base().as_u32(), self.arch.frame_pointer());
            debug!("fork: snapshot of {} relocated {links} frame links", parent.pid());
            Ok((space.root(), stack))
        })?;

        let pid = self.allocate_id();
        let (layout, console) = parent.with(self.irq(), |p| {
            p.children.insert(pid);
            (p.layout, p.console)
        });
        let child = Process::new(
            pid,
            directory,
            ProcessInner {
                parent: Some(parent.pid()),
                live_threads: 1,
                threads: 1,
                layout,
                console,
                ..ProcessInner::default()
            },
        );
        let thread = Thread::new(pid, pid, stack, self.arch.initial_context(stack));
        thread.set_swexn(self.irq(), me.swexn(self.irq()));
        thread.set_fork_job(
            self.irq(),
            ForkJob {
                parent_pid: parent.pid(),
                parent_tid: me.tid(),
                rendezvous,
            },
        );
        self.consoles_retain(console);
        self.register(child, thread);
        debug!("fork: {} -> {pid}", parent.pid());
        Ok(pid)
    }

    /// Registers a freshly built process and its first thread, runnable.
    pub(crate) fn register(&self, process: Process, thread: Thread) {
        let pid = process.pid();
        let tid = thread.tid();
        thread.set_status(ThreadStatus::Runnable);
        if self.processes.insert(self.irq(), pid, process).is_err() || self.threads.insert(self.irq(), tid, thread).is_err() {
            panic!("duplicate id {pid}/{tid}");
        }
    }

    /// Phase two, run by the child: gives it private copies of every user
    /// frame and reports to the parent.
    ///
    /// # Errors
    /// [`ForkError::OutOfMemory`]; the parent has been told and the child
    /// detached from it.
    pub(crate) fn fork_rebuild(&self, job: ForkJob) -> Result<(), ForkError> {
        let Some(child) = self.current_process() else {
            panic!("fork: rebuild without a process");
        };
        let result = {
            let _w = child.memlock.write(self);
            let space = self.space_of(&child);
            let mapper = self.arch.mapper();
            self.with_frames(|pools| {
                space.traverse(USER_PDE_RANGE, Ok(()), |_, entry, state| {
                    if state.is_err() {
                        *entry = PageEntry::zero();
                        return state;
                    }
                    let Some(frame) = pools.user.allocate() else {
                        *entry = PageEntry::zero();
                        return Err(ForkError::OutOfMemory);
                    };
                    if entry.is_zfod_placeholder() {
                        mapper.zero_frame(frame);
                        let sw = entry.software() - SoftwareBits::ZFOD;
                        *entry = PageEntry::leaf(frame, EntryFlags::WRITABLE | EntryFlags::USER, sw);
                    } else {
                        mapper.copy_frame(entry.frame(), frame);
                        *entry = entry.with_frame(frame);
                    }
                    Ok(())
                })
            })
        };
        self.arch.flush_all();

        if result.is_err() {
            child.with(self.irq(), |c| c.parent = None);
            if let Some(parent) = self.process(job.parent_pid) {
                parent.with(self.irq(), |p| p.children.remove(&child.pid()));
            }
        }
        debug!("fork: child {} rebuilt: {result:?}", child.pid());
        self.masked(|| {
            // SAFETY: the parent is blocked on this rendezvous until `complete`.
            unsafe { &*job.rendezvous }.complete(result);
            self.wake(job.parent_tid);
        });
        result
    }
}

const _: () = assert!(KERNEL_STACK_SIZE == PAGE_SIZE);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{USER_DATA, booted, expect_vanish, run_as, start_current};
    use kernel_memory_addresses::VirtualAddress;

    #[test]
    fn frame_chain_is_rebased_until_the_sentinel() {
        let from: u32 = 0x0050_0000;
        let to = 0x0060_0000;
        let mut stack = [0u8; 4096];
        // ebp0 at +0x100 -> +0x180 -> +0x200 -> 0
        stack[0x100..0x104].copy_from_slice(&(from + 0x180).to_le_bytes());
        stack[0x180..0x184].copy_from_slice(&(from + 0x200).to_le_bytes());
        stack[0x200..0x204].copy_from_slice(&0u32.to_le_bytes());

        assert_eq!(relocate_frame_chain(&mut stack, from, to, from + 0x100), 2);
        assert_eq!(u32::from_le_bytes(stack[0x100..0x104].try_into().unwrap()), to + 0x180);
        assert_eq!(u32::from_le_bytes(stack[0x180..0x184].try_into().unwrap()), to + 0x200);
        assert_eq!(u32::from_le_bytes(stack[0x200..0x204].try_into().unwrap()), 0);
    }

    #[test]
    fn frame_chain_stops_at_foreign_links() {
        let from = 0x0050_0000;
        let mut stack = [0u8; 4096];
        stack[0x40..0x44].copy_from_slice(&0x0070_0000u32.to_le_bytes());
        assert_eq!(relocate_frame_chain(&mut stack, from, 0x0060_0000, from + 0x40), 0);
        assert_eq!(u32::from_le_bytes(stack[0x40..0x44].try_into().unwrap()), 0x0070_0000);
        assert_eq!(relocate_frame_chain(&mut stack, from, 0x0060_0000, 0), 0);
    }

    const SCRATCH: u32 = 0x0200_0000;

    #[test]
    fn child_gets_a_private_copy_and_returns_zero() {
        let (k, init) = booted();
        let rendezvous = ForkRendezvous::new();
        let child = {
            let parent = k.current_process().unwrap();
            k.new_pages(&parent, VirtualAddress::new(SCRATCH), 0x1000).unwrap();
            k.fork_snapshot(&parent, &rendezvous).unwrap()
        };
        assert!(!rendezvous.is_done());
        assert!(k.process(init).unwrap().with(k.irq(), |p| p.children.contains(&child)));

        run_as(&k, child);
        let entered = start_current(&k);
        assert_eq!(entered.eax, 0);
        assert!(rendezvous.is_done());
        assert_eq!(rendezvous.outcome(), Ok(()));

        let parent = k.process(init).unwrap();
        let me = k.process(child).unwrap();
        k.copy_out(&me, VirtualAddress::new(USER_DATA), b"child").unwrap();
        let mut buf = [0u8; 11];
        k.copy_in(&parent, VirtualAddress::new(USER_DATA), &mut buf).unwrap();
        assert_eq!(&buf, b"parent data");
        k.copy_in(&me, VirtualAddress::new(USER_DATA), &mut buf).unwrap();
        assert_eq!(&buf, b"childt data");
    }

    #[test]
    fn zero_fill_pages_become_real_in_the_child_only() {
        let (k, init) = booted();
        let rendezvous = ForkRendezvous::new();
        let child = {
            let parent = k.current_process().unwrap();
            k.new_pages(&parent, VirtualAddress::new(SCRATCH), 0x1000).unwrap();
            k.fork_snapshot(&parent, &rendezvous).unwrap()
        };
        run_as(&k, child);
        start_current(&k);

        let va = VirtualAddress::new(SCRATCH);
        let parent = k.process(init).unwrap();
        let me = k.process(child).unwrap();
        assert!(k.space_of(&parent).leaf(va).unwrap().is_zfod_placeholder());
        let leaf = k.space_of(&me).leaf(va).unwrap();
        assert!(!leaf.is_zfod_placeholder());
        assert!(leaf.flags().contains(EntryFlags::WRITABLE));
        assert_ne!(leaf.frame(), k.zero_frame);

        let mut buf = [0xAAu8; 16];
        k.copy_in(&me, va, &mut buf).unwrap();
        assert_eq!(buf, [0; 16]);
    }

    #[test]
    fn child_that_cannot_rebuild_vanishes_without_leaking() {
        let (k, init) = booted();
        let free_before = k.free_frames();
        let rendezvous = ForkRendezvous::new();
        let child = {
            let parent = k.current_process().unwrap();
            k.fork_snapshot(&parent, &rendezvous).unwrap()
        };

        // One user frame is left: the first private copy succeeds, the next fails.
        let held = k.with_frames(|pools| {
            let mut held = Vec::new();
            while pools.user.available() > 1 {
                held.extend(pools.user.allocate());
            }
            held
        });

        run_as(&k, child);
        expect_vanish(&k, || {
            start_current(&k);
        });
        assert!(rendezvous.is_done());
        assert_eq!(rendezvous.outcome(), Err(ForkError::OutOfMemory));
        assert!(!k.process(init).unwrap().with(k.irq(), |p| p.children.contains(&child)));
        assert_eq!(k.process(child).unwrap().with(k.irq(), |c| c.parent), None);

        assert_eq!(k.cpu().current(), init);
        k.yield_to_next();
        assert!(k.thread(child).is_none());
        assert!(k.process(child).is_none());

        k.with_frames(|pools| {
            for frame in held {
                pools.user.free(frame);
            }
        });
        assert_eq!(k.free_frames(), free_before);
    }

    #[test]
    fn multithreaded_callers_cannot_fork() {
        let (k, _) = booted();
        k.thread_fork().unwrap();
        let rendezvous = ForkRendezvous::new();
        let parent = k.current_process().unwrap();
        assert_eq!(k.fork_snapshot(&parent, &rendezvous), Err(ForkError::NotSingleThreaded));
    }
}
