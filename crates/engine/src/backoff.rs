// SPDX-License-Identifier: Apache-2.0

//! Backoff and jitter strategies for the retry engine.
//!
//! A delay strategy is the composition of a backoff shape (attempt ->
//! duration) and a jitter shape (duration, rng -> duration). Strategies
//! are cheap to build but stateful (decorrelated jitter carries the
//! previous delay), so one instance is created per node per run and
//! cached in the context's configuration snapshot.

use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use rill_config::retry::{BackoffKind, JitterKind, RetryOptions};
use std::sync::Arc;
use std::time::Duration;

/// A custom backoff function: retry index (1-based) to delay.
pub type CustomBackoff = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// The backoff shape of a delay strategy.
#[derive(Clone)]
pub enum Backoff {
    /// The same delay for every attempt.
    Fixed(Duration),
    /// `base + increment * (retry - 1)`, clamped to `max`.
    Linear {
        /// Delay before the first retry.
        base: Duration,
        /// Added per retry.
        increment: Duration,
        /// Upper clamp for the computed delay.
        max: Duration,
    },
    /// `base * multiplier^(retry - 1)`, clamped to `max`.
    Exponential {
        /// Delay before the first retry.
        base: Duration,
        /// Multiplier applied per retry.
        multiplier: f64,
        /// Upper clamp for the computed delay.
        max: Duration,
    },
    /// A user-provided function of the retry index.
    Custom(CustomBackoff),
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backoff::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            Backoff::Linear {
                base,
                increment,
                max,
            } => f
                .debug_struct("Linear")
                .field("base", base)
                .field("increment", increment)
                .field("max", max)
                .finish(),
            Backoff::Exponential {
                base,
                multiplier,
                max,
            } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("multiplier", multiplier)
                .field("max", max)
                .finish(),
            Backoff::Custom(_) => f.debug_tuple("Custom").finish_non_exhaustive(),
        }
    }
}

impl From<&BackoffKind> for Backoff {
    fn from(kind: &BackoffKind) -> Self {
        match kind {
            BackoffKind::Fixed { delay } => Backoff::Fixed(*delay),
            BackoffKind::Linear {
                base,
                increment,
                max,
            } => Backoff::Linear {
                base: *base,
                increment: *increment,
                max: *max,
            },
            BackoffKind::Exponential {
                base,
                multiplier,
                max,
            } => Backoff::Exponential {
                base: *base,
                multiplier: *multiplier,
                max: *max,
            },
        }
    }
}

impl Backoff {
    /// Computes the raw delay before the given retry (1-based index).
    #[must_use]
    pub fn compute(&self, retry: u32) -> Duration {
        let n = retry.saturating_sub(1);
        match self {
            Backoff::Fixed(delay) => *delay,
            Backoff::Linear {
                base,
                increment,
                max,
            } => base.saturating_add(increment.saturating_mul(n)).min(*max),
            Backoff::Exponential {
                base,
                multiplier,
                max,
            } => {
                let scaled = base.as_secs_f64() * multiplier.powi(n.min(i32::MAX as u32) as i32);
                Duration::try_from_secs_f64(scaled)
                    .unwrap_or(*max)
                    .min(*max)
            }
            Backoff::Custom(f) => f(retry),
        }
    }

    /// The upper clamp of this shape, when one is declared.
    #[must_use]
    pub fn max_delay(&self) -> Option<Duration> {
        match self {
            Backoff::Fixed(delay) => Some(*delay),
            Backoff::Linear { max, .. } | Backoff::Exponential { max, .. } => Some(*max),
            Backoff::Custom(_) => None,
        }
    }
}

/// The jitter shape of a delay strategy.
#[derive(Debug, Clone, Copy)]
pub enum Jitter {
    /// Identity.
    None,
    /// `uniform(0, base)`.
    Full,
    /// `base/2 + uniform(0, base/2)`.
    Equal,
    /// `uniform(base, min(max, prev * factor))`, stateful.
    Decorrelated {
        /// Growth factor applied to the previous delay.
        factor: f64,
    },
}

impl From<JitterKind> for Jitter {
    fn from(kind: JitterKind) -> Self {
        match kind {
            JitterKind::None => Jitter::None,
            JitterKind::Full => Jitter::Full,
            JitterKind::Equal => Jitter::Equal,
            JitterKind::Decorrelated { factor } => Jitter::Decorrelated { factor },
        }
    }
}

/// The composed, per-node-per-run delay strategy.
///
/// Consumed mutably: decorrelated jitter advances internal state on every
/// call, and the RNG is owned by the strategy so seeded runs replay the
/// same delay sequence.
pub struct DelayStrategy {
    backoff: Backoff,
    jitter: Jitter,
    rng: StdRng,
    /// Previous delay emitted, for decorrelated jitter.
    prev: Option<Duration>,
}

impl std::fmt::Debug for DelayStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayStrategy")
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

impl DelayStrategy {
    /// Builds a strategy from retry options, with an optional RNG seed
    /// for reproducible delay sequences.
    #[must_use]
    pub fn new(options: &RetryOptions, seed: Option<u64>) -> Self {
        Self::compose(Backoff::from(&options.backoff), options.jitter.into(), seed)
    }

    /// Builds a strategy from explicit backoff and jitter shapes.
    #[must_use]
    pub fn compose(backoff: Backoff, jitter: Jitter, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        Self {
            backoff,
            jitter,
            rng,
            prev: None,
        }
    }

    /// Computes the delay to sleep before the given retry (1-based index).
    pub fn delay_for(&mut self, retry: u32) -> Duration {
        let base = self.backoff.compute(retry);
        match self.jitter {
            Jitter::None => base,
            Jitter::Full => self.uniform(Duration::ZERO, base),
            Jitter::Equal => {
                let half = base / 2;
                half + self.uniform(Duration::ZERO, base - half)
            }
            Jitter::Decorrelated { factor } => {
                let floor = self.backoff.compute(1);
                let prev = self.prev.unwrap_or(floor);
                let grown = prev.mul_f64(factor.max(1.0));
                let ceiling = match self.backoff.max_delay() {
                    Some(max) => grown.min(max),
                    None => grown,
                };
                let delay = self.uniform(floor, ceiling.max(floor));
                self.prev = Some(delay);
                delay
            }
        }
    }

    fn uniform(&mut self, lo: Duration, hi: Duration) -> Duration {
        if hi <= lo {
            return lo;
        }
        let lo_nanos = u64::try_from(lo.as_nanos()).unwrap_or(u64::MAX);
        let hi_nanos = u64::try_from(hi.as_nanos()).unwrap_or(u64::MAX);
        Duration::from_nanos(self.rng.random_range(lo_nanos..=hi_nanos))
    }
}
