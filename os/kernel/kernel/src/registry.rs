//! # Registries
//!
//! An arena of boxed entries addressed by a user-visible id. Ids are handed
//! out monotonically by the caller and map to a `(slot, generation)` pair;
//! the generation is bumped every time a slot is recycled, so a stale handle
//! can never reach a newer occupant.
//!
//! ## Ephemeral access
//!
//! [`Registry::find`] returns an [`Ephemeral`] guard that keeps the entry
//! alive until it is dropped. [`Registry::remove`] unlinks the id at once, so
//! the entry can no longer be found, but only frees it when no guard is
//! outstanding; otherwise the entry is marked abandoned and the last guard to
//! drop frees it.
//!
//! An entry is freed exactly when it is abandoned and its ephemeral count is
//! zero. Both the count and the abandoned flag only change with the registry
//! lock held, so there is exactly one freeing party.
//!
//! Registry operations run with interrupts masked; interrupt handlers look
//! threads up too.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::ops::{Bound, Deref};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use kernel_sync::{Irq, IrqGuard, SpinLock};

struct Entry<T> {
    id: u32,
    value: T,
    ephemeral: AtomicU32,
    abandoned: AtomicBool,
}

struct Slot<T> {
    generation: u32,
    entry: Option<Box<Entry<T>>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct SlotRef {
    index: usize,
    generation: u32,
}

struct Inner<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    /// Live ids in registry order.
    ids: BTreeMap<u32, SlotRef>,
}

impl<T> Inner<T> {
    /// Takes the entry out of its slot if it is abandoned and unreferenced.
    fn reclaim(&mut self, slot: SlotRef) -> Option<Box<Entry<T>>> {
        let s = self.slots.get_mut(slot.index)?;
        if s.generation != slot.generation {
            return None;
        }
        let ready = s.entry.as_ref().is_some_and(|e| {
            e.abandoned.load(Ordering::Acquire) && e.ephemeral.load(Ordering::Acquire) == 0
        });
        if !ready {
            return None;
        }
        let entry = s.entry.take();
        s.generation = s.generation.wrapping_add(1);
        self.free.push(slot.index);
        entry
    }
}

/// Id-addressed arena with deferred reclamation.
pub struct Registry<T> {
    inner: SpinLock<Inner<T>>,
}

// SAFETY: entries are shared across cores only through `Ephemeral`, which
// hands out `&T`.
unsafe impl<T: Send + Sync> Sync for Registry<T> {}
unsafe impl<T: Send> Send for Registry<T> {}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Registry<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(Inner {
                slots: Vec::new(),
                free: Vec::new(),
                ids: BTreeMap::new(),
            }),
        }
    }

    /// Registers `value` under `id`. Returns the value back if `id` is taken.
    ///
    /// # Errors
    /// The value itself when `id` is already registered.
    pub fn insert(&self, irq: &dyn Irq, id: u32, value: T) -> Result<(), T> {
        let _masked = IrqGuard::new(irq);
        let mut inner = self.inner.lock();
        if inner.ids.contains_key(&id) {
            return Err(value);
        }
        let entry = Box::new(Entry {
            id,
            value,
            ephemeral: AtomicU32::new(0),
            abandoned: AtomicBool::new(false),
        });
        let slot = if let Some(index) = inner.free.pop() {
            let s = &mut inner.slots[index];
            s.entry = Some(entry);
            SlotRef {
                index,
                generation: s.generation,
            }
        } else {
            inner.slots.push(Slot {
                generation: 0,
                entry: Some(entry),
            });
            SlotRef {
                index: inner.slots.len() - 1,
                generation: 0,
            }
        };
        inner.ids.insert(id, slot);
        Ok(())
    }

    /// Looks `id` up and pins the entry until the guard drops.
    pub fn find<'r>(&'r self, irq: &'r dyn Irq, id: u32) -> Option<Ephemeral<'r, T>> {
        let _masked = IrqGuard::new(irq);
        let inner = self.inner.lock();
        let slot = *inner.ids.get(&id)?;
        let entry = inner.slots[slot.index].entry.as_deref()?;
        entry.ephemeral.fetch_add(1, Ordering::AcqRel);
        Some(Ephemeral {
            registry: self,
            irq,
            slot,
            entry: NonNull::from(entry),
        })
    }

    /// Unlinks `id`. The entry is freed now if nobody holds a guard on it,
    /// otherwise when the last guard drops. Returns whether `id` was present.
    pub fn remove(&self, irq: &dyn Irq, id: u32) -> bool {
        let reclaimed = {
            let _masked = IrqGuard::new(irq);
            let mut inner = self.inner.lock();
            let Some(slot) = inner.ids.remove(&id) else {
                return false;
            };
            if let Some(entry) = inner.slots[slot.index].entry.as_deref() {
                entry.abandoned.store(true, Ordering::Release);
            }
            inner.reclaim(slot)
        };
        drop(reclaimed);
        true
    }

    #[must_use]
    pub fn contains(&self, irq: &dyn Irq, id: u32) -> bool {
        let _masked = IrqGuard::new(irq);
        self.inner.lock().ids.contains_key(&id)
    }

    #[must_use]
    pub fn len(&self, irq: &dyn Irq) -> usize {
        let _masked = IrqGuard::new(irq);
        self.inner.lock().ids.len()
    }

    #[must_use]
    pub fn is_empty(&self, irq: &dyn Irq) -> bool {
        self.len(irq) == 0
    }

    /// Snapshot of the live ids in registry order.
    #[must_use]
    pub fn ids(&self, irq: &dyn Irq) -> Vec<u32> {
        let _masked = IrqGuard::new(irq);
        self.inner.lock().ids.keys().copied().collect()
    }

    /// The live id following `id` in registry order, wrapping around.
    /// `id` itself need not be live.
    #[must_use]
    pub fn next_after(&self, irq: &dyn Irq, id: u32) -> Option<u32> {
        let _masked = IrqGuard::new(irq);
        let inner = self.inner.lock();
        inner
            .ids
            .range((Bound::Excluded(id), Bound::Unbounded))
            .next()
            .or_else(|| inner.ids.iter().next())
            .map(|(id, _)| *id)
    }

    /// Number of entries that are unlinked but still pinned.
    #[must_use]
    pub fn abandoned(&self, irq: &dyn Irq) -> usize {
        let _masked = IrqGuard::new(irq);
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .filter_map(|s| s.entry.as_ref())
            .filter(|e| e.abandoned.load(Ordering::Acquire))
            .count()
    }

    fn release(&self, irq: &dyn Irq, slot: SlotRef, entry: NonNull<Entry<T>>) {
        let reclaimed = {
            let _masked = IrqGuard::new(irq);
            let mut inner = self.inner.lock();
            debug_assert_eq!(
                inner.slots[slot.index].generation, slot.generation,
                "ephemeral guard outlived its entry"
            );
            // SAFETY: the guard being released pinned the entry; nobody could
            // have freed it while the count was non-zero.
            let previous = unsafe { entry.as_ref() }.ephemeral.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(previous > 0);
            inner.reclaim(slot)
        };
        drop(reclaimed);
    }
}

/// Pinned access to a registry entry.
pub struct Ephemeral<'r, T> {
    registry: &'r Registry<T>,
    irq: &'r dyn Irq,
    slot: SlotRef,
    entry: NonNull<Entry<T>>,
}

// SAFETY: behaves like `&T`.
unsafe impl<T: Sync> Sync for Ephemeral<'_, T> {}

impl<T> Ephemeral<'_, T> {
    /// Id the entry was registered under.
    #[must_use]
    pub fn id(&self) -> u32 {
        // SAFETY: pinned by this guard.
        unsafe { self.entry.as_ref() }.id
    }

    /// The entry has been removed from the registry.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        // SAFETY: pinned by this guard.
        unsafe { self.entry.as_ref() }.abandoned.load(Ordering::Acquire)
    }
}

impl<T> Deref for Ephemeral<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: pinned by this guard.
        &unsafe { self.entry.as_ref() }.value
    }
}

impl<T> Drop for Ephemeral<'_, T> {
    fn drop(&mut self) {
        self.registry.release(self.irq, self.slot, self.entry);
    }
}
