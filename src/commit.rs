// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The two-phase commit protocol.
//!
//! Lock the write set in iteration order, bump the clock, validate the read
//! set against the snapshot, publish at the new version. Every failure path
//! releases all held cell locks before signalling retry, so two conflicting
//! transactions can only livelock, never deadlock.

use std::sync::atomic::Ordering;

use log::trace;

use crate::{
    error::{Result, TxError},
    thread_data::ThreadData,
    tvar::RawVar,
    version::{as_locked, locked, Epoch, LOCK_BIT},
};

/// Acquires a cell's version lock iff its stamp is unlocked and no newer
/// than the snapshot.
#[inline]
fn lock(raw: &RawVar, rv: Epoch) -> bool {
    let stamp = raw.version_lock.load(Ordering::Relaxed);
    stamp <= rv
        && raw
            .version_lock
            .compare_exchange(stamp, as_locked(stamp), Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
}

/// Releases a lock by restoring the pre-acquisition stamp.
#[inline]
fn unlock(raw: &RawVar) {
    let stamp = raw.version_lock.load(Ordering::Relaxed);
    debug_assert!(locked(stamp));
    raw.version_lock.store(stamp ^ LOCK_BIT, Ordering::Release);
}

/// Releases a lock by publishing the write version; `wv` has a clear lock
/// bit by construction.
#[inline]
fn unlock_at(raw: &RawVar, wv: Epoch) {
    debug_assert!(locked(raw.version_lock.load(Ordering::Relaxed)));
    debug_assert!(!locked(wv));
    raw.version_lock.store(wv, Ordering::Release);
}

fn unlock_first(td: &ThreadData, count: usize) {
    for entry in td.write_set.iter().take(count) {
        unlock(entry.raw());
    }
}

fn unlock_all(td: &ThreadData) {
    for entry in td.write_set.iter() {
        unlock(entry.raw());
    }
}

fn lock_writes(td: &ThreadData, rv: Epoch) -> bool {
    for (index, entry) in td.write_set.iter().enumerate() {
        if !lock(entry.raw(), rv) {
            unlock_first(td, index);
            return false;
        }
    }
    true
}

/// Re-checks every read against the snapshot. A locked stamp is tolerated
/// only when the lock is ours (the cell is in our write set): our own locks
/// were acquired on stamps `<= rv`.
fn validate_reads(td: &ThreadData, rv: Epoch) -> bool {
    for entry in td.read_set.iter() {
        let stamp = entry.raw().version_lock.load(Ordering::Acquire);
        let valid = if locked(stamp) {
            td.write_set.find(entry.raw().addr()).is_some()
        } else {
            stamp <= rv
        };
        if !valid {
            return false;
        }
    }
    true
}

fn publish(td: &ThreadData, wv: Epoch) {
    for entry in td.write_set.iter() {
        let raw = entry.raw();
        raw.storage.store(entry.pending(), Ordering::Relaxed);
        // the release store of the version orders the value publication
        unlock_at(raw, wv);
    }
}

/// Runs the commit for a transaction whose snapshot is `rv`.
///
/// Returns `Ok(None)` for an empty write set (no clock bump, nothing to
/// reclaim), `Ok(Some(pv))` after publishing at `pv + 1` — the caller seals
/// the reclamation epoch at the pre-bump value `pv` — and `Err(Retry)` on
/// conflict with all cell locks released.
pub(crate) fn try_commit(td: &mut ThreadData, rv: Epoch) -> Result<Option<Epoch>> {
    if td.write_set.is_empty() {
        return Ok(None);
    }

    if !lock_writes(td, rv) {
        trace!("commit: write-set lock conflict");
        return Err(TxError::Retry);
    }

    let pv = td.domain().clock().fetch_and_bump();

    // only when another committer slipped in between snapshot and bump can
    // the read set have been invalidated
    if pv != rv && !validate_reads(td, rv) {
        unlock_all(td);
        trace!("commit: read-set validation failed");
        return Err(TxError::Retry);
    }

    publish(td, pv + 1);
    Ok(Some(pv))
}
