// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Word-based software transactional memory
//!
//! A TL2-style transactional engine over versioned spinlock words, combined
//! with epoch-based deferred reclamation. Shared mutable state is wrapped in
//! [`TVar`] cells and mutated through closures run by [`atomic`]; the
//! runtime retries on conflict and guarantees that the observable effect is
//! one atomic, consistent, isolated commit or no effect at all.
//!
//! ```
//! use wstm::{atomic, TVar};
//!
//! let balance = TVar::new(100u64);
//!
//! let var = balance.clone();
//! atomic(|tx| {
//!     let funds = tx.get(&var)?;
//!     tx.set(&var, funds + 10)
//! })
//! .expect("transaction failed");
//!
//! let var = balance.clone();
//! assert_eq!(wstm::read_only(|tx| tx.get(&var)), Ok(110));
//! ```
//!
//! Threads register lazily: the first transaction on a thread installs its
//! data block and epoch slot. Values superseded by committed writes are
//! destroyed only after every thread has advanced past the commit epoch.

mod commit;
mod domain;
mod error;
mod reclaim;
mod stm;
mod sync;
mod thread_data;
mod transaction;
mod tvar;
mod txlog;
mod version;

pub mod backoff;

pub use domain::{global, Domain, DEFAULT_RECLAIM_THRESHOLD};
pub use error::{Result, TxError};
pub use transaction::{ReadTransaction, Transaction};
pub use tvar::TVar;
pub use version::{Epoch, VersionClock, CACHE_LINE};

/// Runs `f` as a read-write transaction on the default [`Domain`] and
/// returns whatever the closure returned.
///
/// When called inside a running read-write transaction the closure joins it
/// (flat nesting): its effects commit or roll back with the outer
/// transaction.
pub fn atomic<U, F>(f: F) -> Result<U>
where
    F: FnMut(&mut Transaction) -> Result<U>,
{
    domain::global().read_write(f)
}

/// Runs `f` as a read-only transaction on the default [`Domain`].
///
/// Nested inside a read-write transaction, reads observe the outer
/// transaction's pending writes.
pub fn read_only<U, F>(f: F) -> Result<U>
where
    F: FnMut(&mut ReadTransaction) -> Result<U>,
{
    domain::global().read_only(f)
}

/// Aborts the current transaction and restarts it from a fresh snapshot.
///
/// Returns the retry signal for propagation with `?`:
///
/// ```
/// use wstm::{atomic, retry, TVar};
///
/// let gate = TVar::new(true);
/// let var = gate.clone();
/// atomic(|tx| {
///     if !tx.get(&var)? {
///         // wait until some other transaction sets the gate
///         return retry();
///     }
///     tx.set(&var, false)
/// })
/// .unwrap();
/// ```
pub fn retry<T>() -> Result<T> {
    Err(TxError::Retry)
}

/// Releases the extra capacity the calling thread's logs and buffers hold
/// on to, after draining any pending reclamations. Only worth calling on
/// long-running threads after a burst of transactional activity.
pub fn shrink_to_fit() {
    thread_data::shrink_thread_caches();
}
