// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Transaction domains.
//!
//! A [`Domain`] bundles the version clock with the thread registry: the
//! scope within which transactions serialize. Most programs use the single
//! default domain through [`crate::atomic`] and [`crate::read_only`];
//! independent domains may coexist as long as no cell is used under two of
//! them.

use std::sync::Arc;

use lazy_static::lazy_static;

use crate::{
    error::Result,
    stm,
    sync::Registry,
    transaction::{ReadTransaction, Transaction},
    version::{Epoch, VersionClock},
};

/// Minimum number of queued deferred destructions before a commit attempts
/// a synchronize-and-drain.
pub const DEFAULT_RECLAIM_THRESHOLD: usize = 1024;

struct DomainInner {
    clock: VersionClock,
    registry: Registry,
    reclaim_threshold: usize,
}

/// A version clock plus a thread registry. Cloning shares the domain.
#[derive(Clone)]
pub struct Domain {
    inner: Arc<DomainInner>,
}

impl Domain {
    pub fn new() -> Self {
        Self::with_reclaim_threshold(DEFAULT_RECLAIM_THRESHOLD)
    }

    /// Creates a domain with a custom reclamation threshold. Lower values
    /// bound the deferred-destruction backlog more tightly at the cost of
    /// more frequent synchronize traversals.
    pub fn with_reclaim_threshold(reclaim_threshold: usize) -> Self {
        assert!(reclaim_threshold > 0);
        Self {
            inner: Arc::new(DomainInner {
                clock: VersionClock::new(),
                registry: Registry::new(),
                reclaim_threshold,
            }),
        }
    }

    /// Runs `f` as a read-write transaction on this domain.
    pub fn read_write<U, F>(&self, f: F) -> Result<U>
    where
        F: FnMut(&mut Transaction) -> Result<U>,
    {
        stm::read_write(self, f)
    }

    /// Runs `f` as a read-only transaction on this domain.
    pub fn read_only<U, F>(&self, f: F) -> Result<U>
    where
        F: FnMut(&mut ReadTransaction) -> Result<U>,
    {
        stm::read_only(self, f)
    }

    /// The current value of this domain's commit clock.
    pub fn clock_value(&self) -> Epoch {
        self.inner.clock.get()
    }

    #[inline(always)]
    pub(crate) fn clock(&self) -> &VersionClock {
        &self.inner.clock
    }

    #[inline(always)]
    pub(crate) fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub(crate) fn reclaim_threshold(&self) -> usize {
        self.inner.reclaim_threshold
    }

    /// Identity for the thread-local block lookup.
    #[inline(always)]
    pub(crate) fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }
}

impl Default for Domain {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    static ref GLOBAL_DOMAIN: Domain = Domain::new();
}

/// The process-wide default domain used by the free-function entry points.
pub fn global() -> &'static Domain {
    &GLOBAL_DOMAIN
}
