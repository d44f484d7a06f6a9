// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Transaction handles.
//!
//! [`Transaction`] is the read-write handle passed to closures run by
//! [`crate::atomic`]; [`ReadTransaction`] is its read-only counterpart. A
//! handle is a thin view over the calling thread's data block plus the
//! snapshot version; it is deliberately neither `Send` nor duplicable, so it
//! cannot outlive the closure invocation it was created for.

use std::{ptr::NonNull, sync::atomic::Ordering};

use log::trace;

use crate::{
    error::{Result, TxError},
    reclaim::Reclaim,
    thread_data::ThreadData,
    tvar::{self, TVar},
    txlog::{reference_hash, WriteSetLookup},
    version::{Epoch, OFF_STATE},
};

/// Handle of a running read-write transaction.
pub struct Transaction {
    td: NonNull<ThreadData>,
    version: Epoch,
}

impl Transaction {
    pub(crate) fn new(td: NonNull<ThreadData>, version: Epoch) -> Self {
        debug_assert!(version != OFF_STATE);
        debug_assert!(!crate::version::locked(version));
        Self { td, version }
    }

    /// The snapshot version this transaction observes.
    pub fn version(&self) -> Epoch {
        self.version
    }

    /// A stamp is valid for this transaction when it is unlocked and no
    /// newer than the snapshot; locked stamps carry the top bit and always
    /// compare greater.
    #[inline(always)]
    fn rw_valid(&self, stamp: Epoch) -> bool {
        stamp <= self.version
    }

    /// Reads `var` consistently with the snapshot and logs the read.
    pub fn get<T>(&mut self, var: &TVar<T>) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let td = unsafe { &mut *self.td.as_ptr() };
        debug_assert!(td.in_transaction());
        let raw = var.raw();

        if td.write_set.filter() & reference_hash(raw.addr()) == 0 {
            let storage = raw.storage.load(Ordering::Acquire);
            if self.rw_valid(raw.version_lock.load(Ordering::Acquire)) {
                td.read_set.push(var.base());
                return Ok(unsafe { tvar::load_storage::<T>(storage) });
            }
        }
        self.get_slow(td, var)
    }

    fn get_slow<T>(&self, td: &mut ThreadData, var: &TVar<T>) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let raw = var.raw();
        match td.write_set.find(raw.addr()) {
            Some(entry) => {
                let pending = entry.pending();
                if self.rw_valid(raw.version_lock.load(Ordering::Relaxed)) {
                    return Ok(unsafe { tvar::load_storage::<T>(pending) });
                }
            }
            None => {
                let storage = raw.storage.load(Ordering::Acquire);
                if self.rw_valid(raw.version_lock.load(Ordering::Acquire)) {
                    td.read_set.push(var.base());
                    return Ok(unsafe { tvar::load_storage::<T>(storage) });
                }
            }
        }
        trace!("read of cell {:#x} invalid, restarting", raw.addr());
        Err(TxError::Retry)
    }

    /// Records a pending write of `value` to `var`.
    pub fn set<T>(&mut self, var: &TVar<T>, value: T) -> Result<()>
    where
        T: Clone + Send + Sync + 'static,
    {
        let td = unsafe { &mut *self.td.as_ptr() };
        debug_assert!(td.in_transaction());
        let raw = var.raw();

        match td.write_set.lookup(raw.addr()) {
            WriteSetLookup::Hit(index) => {
                if self.rw_valid(raw.version_lock.load(Ordering::Relaxed)) {
                    // only the last write of a transaction commits
                    unsafe { tvar::store_storage::<T>(td.write_set.pending_mut(index), value) };
                    return Ok(());
                }
            }
            WriteSetLookup::Miss(hash) => {
                let cur_storage = raw.storage.load(Ordering::Acquire);
                if self.rw_valid(raw.version_lock.load(Ordering::Acquire)) {
                    let pending = tvar::make_storage(value);
                    td.write_set.push(var.base(), pending, hash);
                    if !TVar::<T>::INLINE {
                        // the superseded cell dies after a grace period; the
                        // fresh cell dies instead if the transaction fails
                        td.queue_succ_callback(Reclaim::new(move || unsafe {
                            tvar::drop_storage::<T>(cur_storage)
                        }));
                        td.queue_fail_callback(Reclaim::new(move || unsafe {
                            tvar::drop_storage::<T>(pending)
                        }));
                    }
                    return Ok(());
                }
            }
        }
        trace!("write of cell {:#x} invalid, restarting", raw.addr());
        Err(TxError::Retry)
    }

    /// Reads `var` consistently with the snapshot without logging the read:
    /// the caller accepts that commit-time validation skips this cell.
    pub fn untracked_get<T>(&mut self, var: &TVar<T>) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let td = unsafe { &mut *self.td.as_ptr() };
        debug_assert!(td.in_transaction());
        let raw = var.raw();

        match td.write_set.find(raw.addr()) {
            Some(entry) => {
                let pending = entry.pending();
                if self.rw_valid(raw.version_lock.load(Ordering::Relaxed)) {
                    return Ok(unsafe { tvar::load_storage::<T>(pending) });
                }
            }
            None => {
                let storage = raw.storage.load(Ordering::Acquire);
                if self.rw_valid(raw.version_lock.load(Ordering::Acquire)) {
                    return Ok(unsafe { tvar::load_storage::<T>(storage) });
                }
            }
        }
        trace!("untracked read of cell {:#x} invalid, restarting", raw.addr());
        Err(TxError::Retry)
    }
}

/// Handle of a running read-only transaction.
///
/// Logs nothing: every read validates directly against the snapshot. When
/// nested inside a read-write transaction, reads route through the outer
/// transaction so pending writes stay visible.
pub struct ReadTransaction {
    outer: Option<NonNull<ThreadData>>,
    version: Epoch,
}

impl ReadTransaction {
    pub(crate) fn top_level(version: Epoch) -> Self {
        Self {
            outer: None,
            version,
        }
    }

    pub(crate) fn nested(outer: NonNull<ThreadData>, version: Epoch) -> Self {
        Self {
            outer: Some(outer),
            version,
        }
    }

    /// The snapshot version this transaction observes.
    pub fn version(&self) -> Epoch {
        self.version
    }

    #[inline(always)]
    fn rw_valid(&self, stamp: Epoch) -> bool {
        stamp <= self.version
    }

    /// Reads `var` consistently with the snapshot.
    pub fn get<T>(&mut self, var: &TVar<T>) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        match self.outer {
            None => {
                let raw = var.raw();
                let storage = raw.storage.load(Ordering::Acquire);
                if self.rw_valid(raw.version_lock.load(Ordering::Acquire)) {
                    Ok(unsafe { tvar::load_storage::<T>(storage) })
                } else {
                    Err(TxError::Retry)
                }
            }
            Some(td) => Transaction::new(td, self.version).get(var),
        }
    }

    /// Like [`ReadTransaction::get`]; inside a read-write transaction the
    /// read goes through the outer write set but is not logged.
    pub fn untracked_get<T>(&mut self, var: &TVar<T>) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        match self.outer {
            None => {
                let raw = var.raw();
                let storage = raw.storage.load(Ordering::Acquire);
                if self.rw_valid(raw.version_lock.load(Ordering::Acquire)) {
                    Ok(unsafe { tvar::load_storage::<T>(storage) })
                } else {
                    Err(TxError::Retry)
                }
            }
            Some(td) => Transaction::new(td, self.version).untracked_get(var),
        }
    }
}
