// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Entry facades: the retry loop around user closures.
//!
//! A facade detects nesting through the thread's transaction tag, acquires
//! the epoch slot, runs the closure, and commits. On conflict it restarts
//! from a fresh snapshot; the retry signal never escapes. Any other failure
//! (an `Err` from the closure or a panic) unwinds the transaction so that no
//! partial write is visible and no pending allocation leaks, then
//! propagates.

use std::{mem, ptr::NonNull};

use log::trace;

use crate::{
    commit,
    domain::Domain,
    error::{Result, TxError},
    thread_data::{self, ThreadData, TxKind},
    transaction::{ReadTransaction, Transaction},
    version::Epoch,
};

fn tx_start(td: &mut ThreadData, kind: TxKind) -> Epoch {
    debug_assert!(kind != TxKind::None);
    debug_assert!(valid_start_state(td));

    let version = td.domain().clock().get();
    td.access_lock(version);
    td.tx_state = kind;
    version
}

/// Discards everything the failed attempt logged or allocated.
fn tx_failure(td: &mut ThreadData, kind: TxKind) {
    if kind != TxKind::ReadOnly {
        td.clear_read_write_sets();
    }
    td.succ_callbacks.clear_working();
    td.do_fail_callbacks();
}

fn tx_restart(td: &mut ThreadData, kind: TxKind) -> Epoch {
    tx_failure(td, kind);
    let version = td.domain().clock().get();
    td.access_relock(version);
    trace!("transaction restarting at version {}", version);
    version
}

fn tx_success(td: &mut ThreadData, kind: TxKind, sync_version: Option<Epoch>) {
    td.access_unlock();
    td.tx_state = TxKind::None;
    if kind != TxKind::ReadOnly {
        td.clear_read_write_sets();
    }
    td.fail_callbacks.clear();

    match sync_version {
        Some(pv) => td.reclaim(pv),
        // without a publish nothing was superseded
        None => debug_assert!(td.succ_callbacks.working_is_empty()),
    }
}

/// Unwind path for closure errors that are not the retry signal.
fn unhandled_failure(td: &mut ThreadData, kind: TxKind) {
    td.access_unlock();
    td.tx_state = TxKind::None;
    tx_failure(td, kind);
}

fn valid_start_state(td: &ThreadData) -> bool {
    td.read_set.is_empty()
        && td.write_set.is_empty()
        && td.fail_callbacks.is_empty()
        && td.succ_callbacks.working_is_empty()
}

/// Unwinds the transaction when the user closure panics, then lets the
/// panic continue.
struct UnwindGuard {
    td: *mut ThreadData,
    kind: TxKind,
}

impl Drop for UnwindGuard {
    fn drop(&mut self) {
        let td = unsafe { &mut *self.td };
        unhandled_failure(td, self.kind);
    }
}

pub(crate) fn read_write<U, F>(domain: &Domain, mut f: F) -> Result<U>
where
    F: FnMut(&mut Transaction) -> Result<U>,
{
    thread_data::with_thread_data(domain, |td_ptr| {
        let kind = unsafe { (*td_ptr).tx_state };
        match kind {
            TxKind::ReadWrite => {
                // flat nesting: run on the outer transaction
                let version = unsafe { (*td_ptr).epoch() };
                let mut tx = Transaction::new(NonNull::new(td_ptr).unwrap(), version);
                f(&mut tx)
            }
            TxKind::ReadOnly => {
                panic!("cannot start a read-write transaction inside a read-only transaction")
            }
            TxKind::None => rw_slow_path(td_ptr, f),
        }
    })
}

fn rw_slow_path<U, F>(td_ptr: *mut ThreadData, mut f: F) -> Result<U>
where
    F: FnMut(&mut Transaction) -> Result<U>,
{
    let td_nn = NonNull::new(td_ptr).expect("thread data block missing");
    let mut version = tx_start(unsafe { &mut *td_ptr }, TxKind::ReadWrite);

    loop {
        let result = {
            let guard = UnwindGuard {
                td: td_ptr,
                kind: TxKind::ReadWrite,
            };
            let mut tx = Transaction::new(td_nn, version);
            let result = f(&mut tx);
            mem::forget(guard);
            result
        };

        match result {
            Ok(value) => match commit::try_commit(unsafe { &mut *td_ptr }, version) {
                Ok(sync_version) => {
                    tx_success(unsafe { &mut *td_ptr }, TxKind::ReadWrite, sync_version);
                    return Ok(value);
                }
                Err(TxError::Retry) => {}
                Err(error) => {
                    unhandled_failure(unsafe { &mut *td_ptr }, TxKind::ReadWrite);
                    return Err(error);
                }
            },
            Err(TxError::Retry) => {}
            Err(error) => {
                unhandled_failure(unsafe { &mut *td_ptr }, TxKind::ReadWrite);
                return Err(error);
            }
        }

        version = tx_restart(unsafe { &mut *td_ptr }, TxKind::ReadWrite);
    }
}

pub(crate) fn read_only<U, F>(domain: &Domain, mut f: F) -> Result<U>
where
    F: FnMut(&mut ReadTransaction) -> Result<U>,
{
    thread_data::with_thread_data(domain, |td_ptr| {
        let kind = unsafe { (*td_ptr).tx_state };
        match kind {
            TxKind::ReadOnly => {
                let version = unsafe { (*td_ptr).epoch() };
                f(&mut ReadTransaction::top_level(version))
            }
            TxKind::ReadWrite => {
                // reads must see the outer transaction's pending writes
                let version = unsafe { (*td_ptr).epoch() };
                f(&mut ReadTransaction::nested(
                    NonNull::new(td_ptr).unwrap(),
                    version,
                ))
            }
            TxKind::None => ro_slow_path(td_ptr, f),
        }
    })
}

fn ro_slow_path<U, F>(td_ptr: *mut ThreadData, mut f: F) -> Result<U>
where
    F: FnMut(&mut ReadTransaction) -> Result<U>,
{
    let mut version = tx_start(unsafe { &mut *td_ptr }, TxKind::ReadOnly);

    loop {
        let result = {
            let guard = UnwindGuard {
                td: td_ptr,
                kind: TxKind::ReadOnly,
            };
            let mut tx = ReadTransaction::top_level(version);
            let result = f(&mut tx);
            mem::forget(guard);
            result
        };

        match result {
            Ok(value) => {
                tx_success(unsafe { &mut *td_ptr }, TxKind::ReadOnly, None);
                return Ok(value);
            }
            Err(TxError::Retry) => {}
            Err(error) => {
                unhandled_failure(unsafe { &mut *td_ptr }, TxKind::ReadOnly);
                return Err(error);
            }
        }

        version = tx_restart(unsafe { &mut *td_ptr }, TxKind::ReadOnly);
    }
}
