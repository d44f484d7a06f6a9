// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

/// Crate-wide result type.
pub type Result<T> = core::result::Result<T, TxError>;

/// Failure modes of a transactional closure.
///
/// [`TxError::Retry`] is the retry signal: it carries no payload, is raised
/// both by the engine on conflict and by user code via [`crate::retry`], and
/// never escapes the entry facades. Everything else unwinds the transaction
/// atomically and propagates to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TxError {
    /// Conflict detected (or user-requested retry); the engine restarts the
    /// transaction from a fresh snapshot.
    #[error("transaction conflict, restarting")]
    Retry,

    /// User-requested abort. The transaction is rolled back, no write is
    /// published, and the error is returned from the entry facade.
    #[error("transaction aborted by user")]
    Abort,
}
