// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Transactional cells.
//!
//! A [`TVar`] owns one value and a version-lock word. Small trivially
//! destructible values are stored bit-reinterpreted inside the slot itself
//! (no allocation, no deferred destruction); everything else lives in a heap
//! cell whose superseded incarnations are destroyed through the reclamation
//! buffer.
//!
//! The identity of a cell is the address of its shared word pair; read and
//! write sets key on it. Logged entries pin the shared state alive, so a
//! cell handle may be dropped on one thread while a transaction on another
//! still has it logged.

use std::{
    fmt,
    marker::PhantomData,
    mem, ptr,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use crate::version::{locked, Epoch, LOCK_BIT};

/// The untyped core of a cell: a versioned spinlock word and a one-word
/// value slot. This is all the commit protocol needs to see.
#[repr(align(64))]
pub(crate) struct RawVar {
    pub(crate) version_lock: AtomicU64,
    pub(crate) storage: AtomicUsize,
}

impl RawVar {
    fn new(storage: usize) -> Self {
        Self {
            version_lock: AtomicU64::new(0),
            storage: AtomicUsize::new(storage),
        }
    }

    /// Identity used as the read/write-set hash key.
    #[inline(always)]
    pub(crate) fn addr(&self) -> usize {
        self as *const RawVar as usize
    }
}

/// Type-erased view of a cell held by read and write sets: keeps the cell's
/// shared state alive and exposes the untyped word pair.
pub(crate) trait VarBase: Send + Sync {
    fn raw(&self) -> &RawVar;
}

/// `true` when `T` is stored bit-reinterpreted in the value slot.
pub(crate) const fn stores_inline<T>() -> bool {
    mem::size_of::<T>() <= mem::size_of::<usize>()
        && mem::align_of::<T>() <= mem::align_of::<usize>()
        && !mem::needs_drop::<T>()
}

/// Materializes a storage word for `value`: the raw bits for inline types, a
/// fresh heap cell otherwise.
pub(crate) fn make_storage<T>(value: T) -> usize {
    if stores_inline::<T>() {
        let mut bits = 0usize;
        // write T's bytes into the low end of the word; the reverse of
        // `load_storage`
        unsafe { ptr::write(&mut bits as *mut usize as *mut T, value) };
        bits
    } else {
        Box::into_raw(Box::new(value)) as usize
    }
}

/// Produces an owned value out of a storage word.
///
/// # Safety
/// For boxed types the word must point at a live heap cell that outlives
/// this call (a transaction guarantees that through its epoch slot).
pub(crate) unsafe fn load_storage<T: Clone>(storage: usize) -> T {
    if stores_inline::<T>() {
        unsafe { mem::transmute_copy(&storage) }
    } else {
        unsafe { (*(storage as *const T)).clone() }
    }
}

/// Overwrites a pending storage word in place (repeat write to the same cell
/// within one transaction).
///
/// # Safety
/// For boxed types `slot` must hold a heap cell privately owned by the
/// calling transaction.
pub(crate) unsafe fn store_storage<T>(slot: &mut usize, value: T) {
    if stores_inline::<T>() {
        *slot = make_storage(value);
    } else {
        unsafe { *(*slot as *mut T) = value };
    }
}

/// Destroys the heap cell behind a storage word; no-op for inline types.
///
/// # Safety
/// The caller must own the storage word exclusively.
pub(crate) unsafe fn drop_storage<T>(storage: usize) {
    if !stores_inline::<T>() {
        unsafe { drop(Box::from_raw(storage as *mut T)) };
    }
}

struct VarInner<T> {
    raw: RawVar,
    _marker: PhantomData<T>,
}

impl<T> Drop for VarInner<T> {
    fn drop(&mut self) {
        // last handle gone; no transaction can hold this cell logged anymore
        if !stores_inline::<T>() {
            let storage = *self.raw.storage.get_mut();
            unsafe { drop(Box::from_raw(storage as *mut T)) };
        }
    }
}

impl<T: Send + Sync + 'static> VarBase for VarInner<T> {
    #[inline(always)]
    fn raw(&self) -> &RawVar {
        &self.raw
    }
}

/// A shared transactional variable.
///
/// Mutated exclusively through a [`crate::Transaction`]; created at version
/// stamp 0. Cloning shares the underlying cell.
pub struct TVar<T> {
    inner: Arc<VarInner<T>>,
}

impl<T: Clone + Send + Sync + 'static> TVar<T> {
    pub(crate) const INLINE: bool = stores_inline::<T>();

    /// Creates a new cell holding `value` at version stamp 0.
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(VarInner {
                raw: RawVar::new(make_storage(value)),
                _marker: PhantomData,
            }),
        }
    }

    /// Reads the currently visible value without any synchronization.
    ///
    /// # Safety
    /// No other thread may be committing a write to this cell while the call
    /// runs. Intended for construction, teardown and single-threaded setup.
    pub unsafe fn unsafe_read(&self) -> T {
        unsafe { load_storage::<T>(self.raw().storage.load(Ordering::Relaxed)) }
    }

    /// Overwrites the currently visible value in place without any
    /// synchronization, leaving the version stamp untouched.
    ///
    /// # Safety
    /// No other thread may access this cell while the call runs.
    pub unsafe fn unsafe_write(&self, value: T) {
        let raw = self.raw();
        if Self::INLINE {
            raw.storage.store(make_storage(value), Ordering::Relaxed);
        } else {
            unsafe { *(raw.storage.load(Ordering::Relaxed) as *mut T) = value };
        }
    }

    /// The version stamp of the last committed write, with the lock bit
    /// masked off.
    pub fn version(&self) -> Epoch {
        self.raw().version_lock.load(Ordering::Acquire) & !LOCK_BIT
    }

    #[inline(always)]
    pub(crate) fn raw(&self) -> &RawVar {
        &self.inner.raw
    }

    /// Pins the cell's shared state for a read/write-set entry.
    #[inline]
    pub(crate) fn base(&self) -> Arc<dyn VarBase> {
        self.inner.clone()
    }
}

impl<T> Clone for TVar<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for TVar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stamp = self.inner.raw.version_lock.load(Ordering::Relaxed);
        f.debug_struct("TVar")
            .field("addr", &self.inner.raw.addr())
            .field("version", &(stamp & !LOCK_BIT))
            .field("locked", &locked(stamp))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_policy() {
        assert!(TVar::<u64>::INLINE);
        assert!(TVar::<bool>::INLINE);
        assert!(TVar::<()>::INLINE);
        assert!(!TVar::<String>::INLINE);
        assert!(!TVar::<Vec<u8>>::INLINE);
        // two words do not fit the slot
        assert!(!TVar::<(usize, usize)>::INLINE);
    }

    #[test]
    fn test_unsafe_read_write_inline() {
        let var = TVar::new(11u64);
        assert_eq!(unsafe { var.unsafe_read() }, 11);
        unsafe { var.unsafe_write(42) };
        assert_eq!(unsafe { var.unsafe_read() }, 42);
        assert_eq!(var.version(), 0);
    }

    #[test]
    fn test_unsafe_read_write_boxed() {
        let var = TVar::new(String::from("alpha"));
        unsafe { var.unsafe_write(String::from("beta")) };
        assert_eq!(unsafe { var.unsafe_read() }, "beta");
    }

    #[test]
    fn test_clone_shares_cell() {
        let a = TVar::new(1usize);
        let b = a.clone();
        assert_eq!(a.raw().addr(), b.raw().addr());
        unsafe { b.unsafe_write(2) };
        assert_eq!(unsafe { a.unsafe_read() }, 2);
    }
}
