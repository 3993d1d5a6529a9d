// SPDX-License-Identifier: Apache-2.0

//! Circuit breaker for failing nodes.
//!
//! The breaker isolates a node that keeps failing: after
//! `failure_threshold` consecutive failures the circuit opens and calls
//! fail fast with a `circuit_open` error until `open_duration` has
//! elapsed. The first calls afterwards run as half-open probes (at most
//! `half_open_probes` in flight); one success closes the circuit again,
//! one failure re-opens it.
//!
//! State transitions happen under a small critical section and are
//! monotonic within an epoch: Closed -> Open -> HalfOpen -> {Closed, Open}.

use crate::error::Error;
use parking_lot::Mutex;
use rill_config::NodeId;
use rill_telemetry::NodeMetrics;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Configuration of a node's circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerOptions {
    /// Consecutive failures required to open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing.
    pub open_duration: Duration,
    /// Maximum concurrent probe calls while half-open.
    pub half_open_probes: u32,
}

impl Default for BreakerOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            half_open_probes: 1,
        }
    }
}

/// The observable state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls flow normally; failures are counted.
    Closed,
    /// Calls fail fast until the open period elapses.
    Open,
    /// A bounded number of probe calls are allowed through.
    HalfOpen,
}

#[derive(Debug)]
enum InnerState {
    Closed,
    Open { until: Instant },
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: InnerState,
    consecutive_failures: u32,
    probes_in_flight: u32,
}

/// A per-node circuit breaker instance, scoped to one run.
pub struct CircuitBreaker {
    node: NodeId,
    options: BreakerOptions,
    inner: Mutex<Inner>,
    metrics: Arc<NodeMetrics>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("node", &self.node)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Creates a breaker for the given node.
    #[must_use]
    pub fn new(node: NodeId, options: BreakerOptions, metrics: Arc<NodeMetrics>) -> Self {
        Self {
            node,
            options,
            inner: Mutex::new(Inner {
                state: InnerState::Closed,
                consecutive_failures: 0,
                probes_in_flight: 0,
            }),
            metrics,
        }
    }

    /// The current state, resolving an expired open period to half-open.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        match inner.state {
            InnerState::Closed => BreakerState::Closed,
            InnerState::Open { .. } => BreakerState::Open,
            InnerState::HalfOpen => BreakerState::HalfOpen,
        }
    }

    /// Gates one call through the breaker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CircuitOpen`] while the circuit is open or when
    /// the half-open probe budget is exhausted.
    pub fn try_acquire(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        match inner.state {
            InnerState::Closed => Ok(()),
            InnerState::Open { .. } => Err(Error::CircuitOpen {
                node: self.node.clone(),
            }),
            InnerState::HalfOpen => {
                if inner.probes_in_flight < self.options.half_open_probes {
                    inner.probes_in_flight += 1;
                    Ok(())
                } else {
                    Err(Error::CircuitOpen {
                        node: self.node.clone(),
                    })
                }
            }
        }
    }

    /// Records a successful call previously admitted by [`Self::try_acquire`].
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            InnerState::HalfOpen => {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                inner.state = InnerState::Closed;
                inner.consecutive_failures = 0;
                self.metrics.breaker_transitions.inc();
                log::debug!("Circuit for node {} closed after successful probe", self.node);
            }
            _ => {
                inner.consecutive_failures = 0;
            }
        }
    }

    /// Records a failed call previously admitted by [`Self::try_acquire`].
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            InnerState::HalfOpen => {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                self.open(&mut inner);
            }
            InnerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.options.failure_threshold {
                    self.open(&mut inner);
                }
            }
            InnerState::Open { .. } => {}
        }
    }

    fn open(&self, inner: &mut Inner) {
        inner.state = InnerState::Open {
            until: Instant::now() + self.options.open_duration,
        };
        inner.consecutive_failures = 0;
        self.metrics.breaker_transitions.inc();
        log::warn!(
            "Circuit for node {} opened for {:?}",
            self.node,
            self.options.open_duration
        );
    }

    fn refresh(&self, inner: &mut Inner) {
        if let InnerState::Open { until } = inner.state {
            if Instant::now() >= until {
                inner.state = InnerState::HalfOpen;
                inner.probes_in_flight = 0;
                self.metrics.breaker_transitions.inc();
                log::debug!("Circuit for node {} half-open, probing", self.node);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, open_ms: u64, probes: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "node".into(),
            BreakerOptions {
                failure_threshold: threshold,
                open_duration: Duration::from_millis(open_ms),
                half_open_probes: probes,
            },
            Arc::new(NodeMetrics::default()),
        )
    }

    #[test]
    fn test_opens_after_threshold() {
        let b = breaker(3, 1000, 1);
        for _ in 0..2 {
            b.try_acquire().unwrap();
            b.record_failure();
        }
        assert_eq!(b.state(), BreakerState::Closed);

        b.try_acquire().unwrap();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(matches!(b.try_acquire(), Err(Error::CircuitOpen { .. })));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let b = breaker(2, 1000, 1);
        b.try_acquire().unwrap();
        b.record_failure();
        b.try_acquire().unwrap();
        b.record_success();
        b.try_acquire().unwrap();
        b.record_failure();
        // Only one consecutive failure since the success.
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_probe_then_close() {
        let b = breaker(1, 10, 1);
        b.try_acquire().unwrap();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(b.state(), BreakerState::HalfOpen);

        b.try_acquire().unwrap();
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_probe_budget_enforced() {
        let b = breaker(1, 10, 1);
        b.try_acquire().unwrap();
        b.record_failure();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // First probe admitted, second rejected while the first is in flight.
        b.try_acquire().unwrap();
        assert!(matches!(b.try_acquire(), Err(Error::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn test_failed_probe_reopens() {
        let b = breaker(1, 10, 1);
        b.try_acquire().unwrap();
        b.record_failure();
        tokio::time::sleep(Duration::from_millis(20)).await;

        b.try_acquire().unwrap();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
    }
}
