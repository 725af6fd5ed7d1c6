//! # Thread Ownership Tokens
//!
//! A thread may be context-switched by at most one core at a time. Every TCB
//! carries an [`OwnershipToken`] that moves through:
//!
//! ```text
//!            claim (CAS)                switch completes
//! NotOwned ─────────────► OwnedByCpu(c) ────────────────► OwnedByThread(t)
//!    ▲                         │                                 │
//!    │      not runnable       │                                 │
//!    ├─────────────────────────┘                                 │
//!    │              switched away from, released by the next     │
//!    └──────────────────────────── thread on that core ──────────┘
//! ```
//!
//! Only `NotOwned → OwnedByCpu` is contended and uses compare-and-swap. The
//! other transitions are performed by the single owner. The token is not a
//! mutex: a thread that is switched away keeps its token until the *next*
//! thread on that core hands it back, which is what keeps a dead thread's
//! stack from being reclaimed while it is still being switched off of.

use core::sync::atomic::{AtomicU32, Ordering};

const NOT_OWNED: u32 = 0;
const CPU_TAG: u32 = 1 << 31;

/// Decoded token state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Owner {
    NotOwned,
    /// Claimed by the scheduler on core `n`.
    Cpu(u32),
    /// Running as thread `tid`.
    Thread(u32),
}

impl Owner {
    const fn encode(self) -> u32 {
        match self {
            Self::NotOwned => NOT_OWNED,
            Self::Cpu(cpu) => CPU_TAG | cpu,
            Self::Thread(tid) => tid + 1,
        }
    }

    const fn decode(bits: u32) -> Self {
        if bits == NOT_OWNED {
            Self::NotOwned
        } else if bits & CPU_TAG != 0 {
            Self::Cpu(bits & !CPU_TAG)
        } else {
            Self::Thread(bits - 1)
        }
    }
}

/// Atomic tagged [`Owner`].
#[derive(Debug)]
pub struct OwnershipToken(AtomicU32);

impl Default for OwnershipToken {
    fn default() -> Self {
        Self::new()
    }
}

impl OwnershipToken {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU32::new(NOT_OWNED))
    }

    #[must_use]
    pub fn get(&self) -> Owner {
        Owner::decode(self.0.load(Ordering::Acquire))
    }

    /// `NotOwned → Cpu(cpu)`. Returns the current owner on failure.
    ///
    /// # Errors
    /// The owner that holds the token.
    pub fn claim(&self, cpu: u32) -> Result<(), Owner> {
        debug_assert!(cpu < CPU_TAG);
        self.0
            .compare_exchange(NOT_OWNED, Owner::Cpu(cpu).encode(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(Owner::decode)
    }

    /// `Cpu(cpu) → Thread(tid)`, once the switch onto `tid` is complete.
    pub fn adopt(&self, tid: u32) {
        debug_assert!(
            matches!(self.get(), Owner::Cpu(_) | Owner::Thread(_)),
            "adopting an unclaimed thread"
        );
        self.0.store(Owner::Thread(tid).encode(), Ordering::Release);
    }

    /// Back to `NotOwned`.
    pub fn release(&self) {
        self.0.store(NOT_OWNED, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    #[test]
    fn encoding_round_trips_edge_values() {
        for owner in [Owner::NotOwned, Owner::Cpu(0), Owner::Cpu(7), Owner::Thread(0), Owner::Thread(4242)] {
            assert_eq!(Owner::decode(owner.encode()), owner);
        }
    }

    #[test]
    fn claim_adopt_release_cycle() {
        let token = OwnershipToken::new();
        assert_eq!(token.claim(0), Ok(()));
        assert_eq!(token.claim(1), Err(Owner::Cpu(0)));
        token.adopt(5);
        assert_eq!(token.get(), Owner::Thread(5));
        assert_eq!(token.claim(1), Err(Owner::Thread(5)));
        token.release();
        assert_eq!(token.claim(1), Ok(()));
    }

    #[test]
    fn exactly_one_core_wins_a_claim() {
        let token = Arc::new(OwnershipToken::new());
        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|cpu| {
                let (token, barrier) = (token.clone(), barrier.clone());
                std::thread::spawn(move || {
                    barrier.wait();
                    token.claim(cpu).is_ok()
                })
            })
            .collect();
        let winners = handles.into_iter().map(|h| h.join().unwrap()).filter(|w| *w).count();
        assert_eq!(winners, 1);
    }
}
