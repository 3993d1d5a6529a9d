// SPDX-License-Identifier: Apache-2.0

//! Lock-free metric instruments.
//!
//! The instruments are deliberately minimal: monotonically increasing
//! counters, last-value gauges and an accumulated-duration counter. They
//! are updated from hot paths and must never contend on a lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Increments the counter by one.
    #[inline]
    pub fn inc(&self) {
        let _ = self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds `n` to the counter.
    #[inline]
    pub fn add(&self, n: u64) {
        let _ = self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Returns the current value.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A last-value gauge.
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    /// Records the current value.
    #[inline]
    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    /// Records `value` if it exceeds the current value.
    ///
    /// Used for high-water marks such as peak queue depth. Relaxed
    /// ordering is sufficient: the mark is advisory, not a synchronizer.
    #[inline]
    pub fn record_max(&self, value: u64) {
        let _ = self.0.fetch_max(value, Ordering::Relaxed);
    }

    /// Returns the current value.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// An accumulated-duration counter, stored as microseconds.
#[derive(Debug, Default)]
pub struct TimeCounter(AtomicU64);

impl TimeCounter {
    /// Adds the given duration to the accumulated total.
    #[inline]
    pub fn add(&self, duration: Duration) {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        let _ = self.0.fetch_add(micros, Ordering::Relaxed);
    }

    /// Returns the accumulated total.
    #[must_use]
    pub fn get(&self) -> Duration {
        Duration::from_micros(self.0.load(Ordering::Relaxed))
    }
}
