// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Version stamps and the global version clock.
//!
//! A version stamp is a single word combining a monotonic timestamp with a
//! lock bit in the most significant position. The all-ones pattern is
//! reserved as the off-state of a thread's epoch slot and is never produced
//! by the clock.

use std::sync::atomic::{AtomicU64, Ordering};

/// The version stamp word. Configurable in one place; everything else in the
/// crate goes through this alias.
pub type Epoch = u64;

/// Most significant bit of a stamp marks the cell as locked by a committer.
pub(crate) const LOCK_BIT: Epoch = 1 << (Epoch::BITS - 1);

/// All-ones pattern: a thread that is not inside any critical section.
/// Note that `OFF_STATE` also has the lock bit set, so it always fails the
/// `stamp <= snapshot` validity check.
pub(crate) const OFF_STATE: Epoch = Epoch::MAX;

/// Largest timestamp the clock may hand out before the lock bit would be hit.
pub(crate) const MAX_VERSION: Epoch = !LOCK_BIT;

#[inline(always)]
pub(crate) const fn locked(stamp: Epoch) -> bool {
    stamp & LOCK_BIT != 0
}

#[inline(always)]
pub(crate) const fn as_locked(stamp: Epoch) -> Epoch {
    stamp | LOCK_BIT
}

/// Boundary cells and counters are padded to so that neighbouring state does
/// not share a cache line with hot atomics.
pub const CACHE_LINE: usize = 64;

#[repr(align(64))]
#[derive(Default, Debug)]
pub(crate) struct CachePadded<T>(pub T);

/// The process-wide (per [`crate::Domain`]) monotonic commit clock.
///
/// Two operations only: an acquire snapshot and a release fetch-and-bump
/// returning the pre-bump value. The bump increment is 1.
#[derive(Default, Debug)]
pub struct VersionClock {
    clock: CachePadded<AtomicU64>,
}

impl VersionClock {
    pub fn new() -> Self {
        Self {
            clock: CachePadded(AtomicU64::new(0)),
        }
    }

    /// Returns the current clock value.
    #[inline]
    pub fn get(&self) -> Epoch {
        self.clock.0.load(Ordering::Acquire)
    }

    /// Atomically bumps the clock by one and returns the previous value.
    #[inline]
    pub fn fetch_and_bump(&self) -> Epoch {
        let prev = self.clock.0.fetch_add(1, Ordering::Release);
        debug_assert!(prev < MAX_VERSION - 1);
        prev
    }
}
