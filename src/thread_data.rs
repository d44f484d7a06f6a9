// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Per-thread state.
//!
//! Each participating thread lazily installs one [`ThreadData`] block per
//! domain it touches: the speculative logs, the callback queues, the
//! transaction tag and the registered epoch slot. The block lives until the
//! thread exits, at which point any pending reclamations are drained by one
//! final synchronize and the slot is deregistered.

use std::cell::RefCell;

use log::{debug, trace};

use crate::{
    domain::Domain,
    reclaim::{Reclaim, ReclaimBuffer},
    sync::EpochSlot,
    txlog::{ReadSet, WriteSet},
    version::{locked, Epoch, OFF_STATE},
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum TxKind {
    None,
    ReadOnly,
    ReadWrite,
}

#[repr(align(64))]
pub(crate) struct ThreadData {
    domain: Domain,
    slot: std::sync::Arc<EpochSlot>,
    pub(crate) read_set: ReadSet,
    pub(crate) write_set: WriteSet,
    pub(crate) fail_callbacks: Vec<Reclaim>,
    pub(crate) succ_callbacks: ReclaimBuffer,
    pub(crate) tx_state: TxKind,
}

impl ThreadData {
    fn new(domain: Domain) -> Self {
        trace!("installing thread data block");
        let slot = domain.registry().register();
        Self {
            read_set: ReadSet::default(),
            write_set: WriteSet::default(),
            fail_callbacks: Vec::new(),
            succ_callbacks: ReclaimBuffer::new(domain.reclaim_threshold()),
            tx_state: TxKind::None,
            slot,
            domain,
        }
    }

    #[inline(always)]
    pub(crate) fn domain(&self) -> &Domain {
        &self.domain
    }

    #[inline(always)]
    pub(crate) fn epoch(&self) -> Epoch {
        self.slot.epoch()
    }

    #[inline(always)]
    pub(crate) fn in_transaction(&self) -> bool {
        self.tx_state != TxKind::None
    }

    #[inline(always)]
    pub(crate) fn in_critical_section(&self) -> bool {
        self.slot.in_critical_section()
    }

    #[inline(always)]
    pub(crate) fn access_lock(&self, epoch: Epoch) {
        self.slot.access_lock(epoch);
    }

    #[inline(always)]
    pub(crate) fn access_relock(&self, epoch: Epoch) {
        self.slot.access_relock(epoch);
    }

    #[inline(always)]
    pub(crate) fn access_unlock(&self) {
        self.slot.access_unlock();
    }

    pub(crate) fn clear_read_write_sets(&mut self) {
        self.read_set.clear();
        self.write_set.clear();
    }

    /// Queues the destruction of a value superseded by this transaction; it
    /// runs after every thread has advanced past the commit epoch.
    pub(crate) fn queue_succ_callback(&mut self, callback: Reclaim) {
        debug_assert!(self.in_transaction());
        self.succ_callbacks.push(callback);
    }

    /// Queues a cleanup for a pending allocation; it runs only when the
    /// transaction fails.
    pub(crate) fn queue_fail_callback(&mut self, callback: Reclaim) {
        debug_assert!(self.in_transaction());
        self.fail_callbacks.push(callback);
    }

    /// Runs fail callbacks in reverse registration order and clears them.
    pub(crate) fn do_fail_callbacks(&mut self) {
        while let Some(callback) = self.fail_callbacks.pop() {
            callback.run();
        }
    }

    /// Seals the working epoch chunk at `sync_epoch` and, when the buffer
    /// crosses the threshold, drains whatever the registry proves dead.
    pub(crate) fn reclaim(&mut self, sync_epoch: Epoch) {
        debug_assert!(!self.in_critical_section());
        debug_assert!(!self.in_transaction());
        debug_assert!(sync_epoch != OFF_STATE);
        debug_assert!(!locked(sync_epoch));

        if self.succ_callbacks.finalize_epoch(sync_epoch) {
            self.reclaim_slow_path();
        }
    }

    fn reclaim_slow_path(&mut self) {
        let target = self.succ_callbacks.front_epoch();
        debug!("reclamation slow path, oldest epoch {}", target);

        let min_epoch = self.domain.registry().synchronize_min_epoch(target);

        // the oldest chunk was waited out above; everything below the
        // returned bound follows
        self.succ_callbacks.run_front_chunk();
        while self.succ_callbacks.has_sealed() && self.succ_callbacks.front_epoch() < min_epoch {
            self.succ_callbacks.run_front_chunk();
        }
    }

    /// Waits for every thread to pass the newest queued epoch, then drains
    /// the whole buffer. Used on thread exit and by `shrink_to_fit`.
    pub(crate) fn reclaim_all(&mut self) {
        debug_assert!(!self.in_critical_section());
        debug_assert!(!self.in_transaction());

        if !self.succ_callbacks.has_sealed() {
            return;
        }
        self.domain
            .registry()
            .synchronize_min_epoch(self.succ_callbacks.back_epoch());
        while self.succ_callbacks.has_sealed() {
            self.succ_callbacks.run_front_chunk();
        }
    }

    /// Releases the extra storage the logs hold on to between bursts.
    pub(crate) fn shrink_to_fit(&mut self) {
        if !self.in_critical_section() && !self.succ_callbacks.is_empty() {
            self.reclaim_all();
        }
        self.read_set.shrink_to_fit();
        self.write_set.shrink_to_fit();
        self.fail_callbacks.shrink_to_fit();
        self.succ_callbacks.shrink_to_fit();
    }
}

impl Drop for ThreadData {
    fn drop(&mut self) {
        debug_assert!(!self.in_transaction());
        debug_assert!(!self.in_critical_section());
        debug_assert!(self.succ_callbacks.working_is_empty());

        self.reclaim_all();
        self.domain.registry().deregister(&self.slot);
        trace!("thread data block retired");
    }
}

thread_local! {
    static THREAD_BLOCKS: RefCell<Vec<Box<ThreadData>>> = const { RefCell::new(Vec::new()) };
}

/// Hands `f` the calling thread's data block for `domain`, installing one on
/// first use. The pointer stays valid for the thread's lifetime; callers
/// must not keep overlapping mutable borrows across user code.
pub(crate) fn with_thread_data<R>(domain: &Domain, f: impl FnOnce(*mut ThreadData) -> R) -> R {
    let ptr = THREAD_BLOCKS.with(|blocks| {
        let mut blocks = blocks.borrow_mut();
        let index = match blocks.iter().position(|td| td.domain().id() == domain.id()) {
            Some(index) => index,
            None => {
                blocks.push(Box::new(ThreadData::new(domain.clone())));
                blocks.len() - 1
            }
        };
        &mut *blocks[index] as *mut ThreadData
    });
    f(ptr)
}

/// Shrinks the caches of every data block the calling thread installed.
/// A block whose transaction is still running is left alone.
pub(crate) fn shrink_thread_caches() {
    THREAD_BLOCKS.with(|blocks| {
        for td in blocks.borrow_mut().iter_mut() {
            if !td.in_transaction() {
                td.shrink_to_fit();
            }
        }
    });
}
