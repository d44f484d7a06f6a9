// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Thread registry and epoch publication.
//!
//! Every participating thread owns an [`EpochSlot`]: one atomic word that is
//! either the off-state (not in a critical section) or the snapshot epoch
//! the thread entered its critical section with. The registry keeps all
//! slots behind a shared/exclusive lock; registration is rare, the
//! synchronize traversal holds only the shared side.

use std::sync::{
    atomic::{fence, AtomicU64, Ordering},
    Arc, RwLock,
};

use crate::{
    backoff::{Backoff, ExponentialDelay},
    version::{locked, Epoch, OFF_STATE},
};

/// One thread's published epoch. Cache-aligned so that two threads' slots
/// never share a line.
#[repr(align(64))]
pub(crate) struct EpochSlot {
    active: AtomicU64,
}

impl EpochSlot {
    fn new() -> Self {
        Self {
            active: AtomicU64::new(OFF_STATE),
        }
    }

    #[inline]
    pub(crate) fn epoch(&self) -> Epoch {
        self.active.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn in_critical_section(&self) -> bool {
        self.epoch() != OFF_STATE
    }

    /// Publishes `epoch` and enters the critical section. The release store
    /// orders the publication before any cell access; the acquire fence
    /// keeps those accesses from floating above it.
    #[inline]
    pub(crate) fn access_lock(&self, epoch: Epoch) {
        debug_assert!(!self.in_critical_section());
        debug_assert!(epoch != OFF_STATE);

        self.active.store(epoch, Ordering::Release);
        fence(Ordering::Acquire);
    }

    /// Advances the published epoch without leaving the critical section.
    #[inline]
    pub(crate) fn access_relock(&self, epoch: Epoch) {
        debug_assert!(self.in_critical_section());
        debug_assert!(epoch != OFF_STATE);
        debug_assert!(self.epoch() <= epoch);

        self.active.store(epoch, Ordering::Release);
        fence(Ordering::Acquire);
    }

    #[inline]
    pub(crate) fn access_unlock(&self) {
        debug_assert!(self.in_critical_section());
        self.active.store(OFF_STATE, Ordering::Release);
    }

    #[inline]
    fn epoch_less_equal_to(&self, epoch: Epoch) -> bool {
        self.active.load(Ordering::Acquire) <= epoch
    }
}

/// The per-domain list of epoch slots.
pub(crate) struct Registry {
    slots: RwLock<Vec<Arc<EpochSlot>>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
        }
    }

    /// Registers a fresh slot for the calling thread.
    pub(crate) fn register(&self) -> Arc<EpochSlot> {
        let slot = Arc::new(EpochSlot::new());
        self.slots
            .write()
            .expect("thread registry poisoned")
            .push(slot.clone());
        slot
    }

    /// Removes a thread's slot. Called on thread exit, after the final
    /// reclamation drain.
    pub(crate) fn deregister(&self, slot: &Arc<EpochSlot>) {
        debug_assert!(!slot.in_critical_section());
        let mut slots = self.slots.write().expect("thread registry poisoned");
        if let Some(position) = slots.iter().position(|s| Arc::ptr_eq(s, slot)) {
            slots.swap_remove(position);
        }
    }

    /// Waits until no thread is still inside a critical section at an epoch
    /// `<= target`, and returns the smallest epoch any thread might still be
    /// reading at (`OFF_STATE` when every thread is out).
    ///
    /// Spinning is unbounded in the absence of progress; starvation is
    /// prevented only by keeping critical sections short.
    pub(crate) fn synchronize_min_epoch(&self, target: Epoch) -> Epoch {
        self.synchronize_min_epoch_with::<ExponentialDelay>(target)
    }

    /// [`Registry::synchronize_min_epoch`] with an explicit delay strategy.
    pub(crate) fn synchronize_min_epoch_with<B: Backoff>(&self, target: Epoch) -> Epoch {
        debug_assert!(target != OFF_STATE);
        debug_assert!(!locked(target));

        let slots = self.slots.read().expect("thread registry poisoned");

        let mut min_epoch = OFF_STATE;
        for slot in slots.iter() {
            let epoch = slot.active.load(Ordering::Acquire);
            if epoch <= target {
                Self::wait_on_epoch::<B>(slot, target);
            } else if epoch < min_epoch {
                min_epoch = epoch;
            }
        }

        min_epoch
    }

    fn wait_on_epoch<B: Backoff>(slot: &EpochSlot, target: Epoch) {
        let mut backoff = B::default();
        loop {
            backoff.delay();
            if !slot.epoch_less_equal_to(target) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Duration};

    #[test]
    fn test_slot_transitions() {
        let slot = EpochSlot::new();
        assert!(!slot.in_critical_section());

        slot.access_lock(3);
        assert!(slot.in_critical_section());
        assert_eq!(slot.epoch(), 3);

        slot.access_relock(7);
        assert_eq!(slot.epoch(), 7);

        slot.access_unlock();
        assert!(!slot.in_critical_section());
    }

    #[test]
    fn test_synchronize_returns_min_of_advanced_slots() {
        let registry = Registry::new();
        let a = registry.register();
        let b = registry.register();

        a.access_lock(10);
        b.access_lock(12);

        assert_eq!(registry.synchronize_min_epoch(5), 10);

        a.access_unlock();
        b.access_unlock();
        assert_eq!(registry.synchronize_min_epoch(5), OFF_STATE);

        registry.deregister(&a);
        registry.deregister(&b);
    }

    #[test]
    fn test_synchronize_waits_for_stragglers() {
        let registry = Arc::new(Registry::new());
        let slot = registry.register();

        slot.access_lock(2);

        let inner = slot.clone();
        let straggler = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            inner.access_unlock();
        });

        // must block until the slot leaves its critical section
        assert_eq!(registry.synchronize_min_epoch(4), OFF_STATE);

        straggler.join().unwrap();
        registry.deregister(&slot);
    }
}
