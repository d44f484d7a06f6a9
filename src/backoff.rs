// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Delay strategies for the spin paths.
//!
//! The reclamation synchronize routine has to wait for other threads to
//! leave their critical sections. How it waits is pluggable: anything
//! implementing [`Backoff`] can be used.

use std::{thread, time::Duration};

/// A strategy used to delay between failed checks in a spin loop.
pub trait Backoff: Default {
    /// Waits once. Called repeatedly while the condition does not hold.
    fn delay(&mut self);

    /// Resets the strategy to its initial state.
    fn reset(&mut self);
}

/// Gives the time slice back to the scheduler on every delay.
#[derive(Default, Debug, Clone, Copy)]
pub struct Yield;

impl Backoff for Yield {
    #[inline]
    fn delay(&mut self) {
        thread::yield_now();
    }

    #[inline]
    fn reset(&mut self) {}
}

/// Sleeps for an exponentially growing number of nanoseconds, capped.
///
/// This is the strategy the reclamation path uses while waiting on another
/// thread's epoch slot: the first few delays are cheap, a straggler thread
/// costs progressively longer sleeps instead of a hot spin.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialDelay {
    ns: u64,
}

impl ExponentialDelay {
    const MIN_NS: u64 = 128;
    const MAX_NS: u64 = 1 << 16;
}

impl Default for ExponentialDelay {
    fn default() -> Self {
        Self { ns: Self::MIN_NS }
    }
}

impl Backoff for ExponentialDelay {
    fn delay(&mut self) {
        thread::sleep(Duration::from_nanos(self.ns));
        self.ns <<= 1;
        if self.ns > Self::MAX_NS {
            self.ns = Self::MAX_NS;
        }
    }

    fn reset(&mut self) {
        self.ns = Self::MIN_NS;
    }
}
