// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Epoch-tagged deferred-destruction buffer.
//!
//! A committing thread queues the destructor of every value it superseded
//! into its working epoch chunk. After publishing, the chunk is stamped with
//! the commit epoch and sealed; sealed chunks are drained once the registry
//! confirms that no thread can still observe their epoch.

use std::{
    collections::VecDeque,
    mem::{self, MaybeUninit},
    ptr,
};

use crate::version::Epoch;

/// Inline payload capacity of a [`Reclaim`] callback: three words. Larger
/// closures take the boxed path.
type Payload = [usize; 3];

/// A type-erased deferred callback.
///
/// Dropping a `Reclaim` without running it discards the payload; this is the
/// intended behavior for fail callbacks after a successful commit and for
/// the working chunk of a failed transaction.
pub(crate) struct Reclaim {
    call: unsafe fn(*mut u8, bool),
    payload: MaybeUninit<Payload>,
}

impl Reclaim {
    pub(crate) fn new<F: FnOnce() + 'static>(f: F) -> Self {
        unsafe fn invoke_inline<F: FnOnce()>(raw: *mut u8, run: bool) {
            let f: F = unsafe { ptr::read(raw.cast::<F>()) };
            if run {
                f();
            }
        }

        unsafe fn invoke_boxed<F: FnOnce()>(raw: *mut u8, run: bool) {
            let f: Box<F> = unsafe { ptr::read(raw.cast::<Box<F>>()) };
            if run {
                (*f)();
            }
        }

        let mut payload = MaybeUninit::<Payload>::uninit();
        if mem::size_of::<F>() <= mem::size_of::<Payload>()
            && mem::align_of::<F>() <= mem::align_of::<Payload>()
        {
            unsafe { ptr::write(payload.as_mut_ptr().cast::<F>(), f) };
            Self {
                call: invoke_inline::<F>,
                payload,
            }
        } else {
            unsafe { ptr::write(payload.as_mut_ptr().cast::<Box<F>>(), Box::new(f)) };
            Self {
                call: invoke_boxed::<F>,
                payload,
            }
        }
    }

    /// Consumes the callback and invokes it.
    pub(crate) fn run(self) {
        let mut this = mem::ManuallyDrop::new(self);
        unsafe { (this.call)(this.payload.as_mut_ptr().cast(), true) }
    }
}

impl Drop for Reclaim {
    fn drop(&mut self) {
        unsafe { (self.call)(self.payload.as_mut_ptr().cast(), false) }
    }
}

struct EpochChunk {
    epoch: Epoch,
    callbacks: Vec<Reclaim>,
}

/// Ring of sealed epoch chunks plus the working chunk being filled.
///
/// Invariants: sealed epochs are non-decreasing front to back; callbacks run
/// in registered order within a chunk and older chunks drain before newer
/// ones.
pub(crate) struct ReclaimBuffer {
    sealed: VecDeque<EpochChunk>,
    working: Vec<Reclaim>,
    // capacity recycled from drained chunks so steady-state commits do not
    // allocate for their callback storage
    spare: Vec<Vec<Reclaim>>,
    queued: usize,
    threshold: usize,
}

impl ReclaimBuffer {
    pub(crate) fn new(threshold: usize) -> Self {
        debug_assert!(threshold > 0);
        Self {
            sealed: VecDeque::new(),
            working: Vec::new(),
            spare: Vec::new(),
            queued: 0,
            threshold,
        }
    }

    #[inline]
    pub(crate) fn push(&mut self, callback: Reclaim) {
        self.working.push(callback);
    }

    #[inline]
    pub(crate) fn working_is_empty(&self) -> bool {
        self.working.is_empty()
    }

    /// Discards the working chunk without running anything. Used when a
    /// transaction fails: none of its writes were published, so the old
    /// values stay owned by their cells.
    pub(crate) fn clear_working(&mut self) {
        self.working.clear();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.sealed.is_empty() && self.working.is_empty()
    }

    pub(crate) fn has_sealed(&self) -> bool {
        !self.sealed.is_empty()
    }

    /// Epoch of the oldest sealed chunk.
    pub(crate) fn front_epoch(&self) -> Epoch {
        debug_assert!(self.has_sealed());
        self.sealed.front().map(|c| c.epoch).unwrap_or(Epoch::MAX)
    }

    /// Epoch of the newest sealed chunk.
    pub(crate) fn back_epoch(&self) -> Epoch {
        debug_assert!(self.has_sealed());
        self.sealed.back().map(|c| c.epoch).unwrap_or(0)
    }

    /// Stamps the working chunk with `epoch`, seals it and starts a fresh
    /// one. Returns `true` when the buffer now holds at least the reclaim
    /// threshold of callbacks and the caller should run the slow path.
    ///
    /// A no-op returning `false` when the working chunk is empty.
    pub(crate) fn finalize_epoch(&mut self, epoch: Epoch) -> bool {
        if self.working.is_empty() {
            return false;
        }
        debug_assert!(self.sealed.back().map_or(true, |c| c.epoch <= epoch));

        let fresh = self.spare.pop().unwrap_or_default();
        let callbacks = mem::replace(&mut self.working, fresh);
        self.queued += callbacks.len();
        self.sealed.push_back(EpochChunk { epoch, callbacks });

        self.queued >= self.threshold
    }

    /// Pops the oldest sealed chunk and runs its callbacks in registered
    /// order.
    pub(crate) fn run_front_chunk(&mut self) {
        if let Some(mut chunk) = self.sealed.pop_front() {
            self.queued -= chunk.callbacks.len();
            for callback in chunk.callbacks.drain(..) {
                callback.run();
            }
            self.spare.push(chunk.callbacks);
        }
    }

    pub(crate) fn shrink_to_fit(&mut self) {
        self.spare.clear();
        self.spare.shrink_to_fit();
        self.working.shrink_to_fit();
        self.sealed.shrink_to_fit();
    }
}
