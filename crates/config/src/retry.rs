// SPDX-License-Identifier: Apache-2.0

//! Retry and backoff options.
//!
//! These are plain serializable values. The retryable-error predicate and
//! the composed delay strategy (backoff + jitter + RNG) are runtime
//! concerns owned by `rill-engine`; the options here only parameterize
//! them.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The shape of the delay computed between retry attempts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// The same delay for every attempt.
    Fixed {
        /// Delay applied between attempts.
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },
    /// `base + increment * attempt`, clamped to `max`.
    Linear {
        /// Delay before the first retry.
        #[serde(with = "humantime_serde")]
        base: Duration,
        /// Added per attempt.
        #[serde(with = "humantime_serde")]
        increment: Duration,
        /// Upper clamp for the computed delay.
        #[serde(with = "humantime_serde")]
        max: Duration,
    },
    /// `base * multiplier^attempt`, clamped to `max`.
    Exponential {
        /// Delay before the first retry.
        #[serde(with = "humantime_serde")]
        base: Duration,
        /// Multiplier applied per attempt.
        multiplier: f64,
        /// Upper clamp for the computed delay.
        #[serde(with = "humantime_serde")]
        max: Duration,
    },
}

impl Default for BackoffKind {
    fn default() -> Self {
        BackoffKind::Exponential {
            base: Duration::from_millis(1000),
            multiplier: 2.0,
            max: Duration::from_millis(30_000),
        }
    }
}

/// Randomized perturbation applied to the computed backoff delay to avoid
/// synchronized retry storms.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum JitterKind {
    /// No perturbation.
    #[default]
    None,
    /// `uniform(0, base)`.
    Full,
    /// `base/2 + uniform(0, base/2)`.
    Equal,
    /// `uniform(base, min(max, prev * factor))`, stateful across attempts.
    Decorrelated {
        /// Growth factor applied to the previous delay.
        factor: f64,
    },
}

/// Retry options for a node, or run-level defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RetryOptions {
    /// Maximum number of attempts for a single invocation, including the
    /// first one. A value of 1 disables retries.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// The backoff shape used between attempts.
    #[serde(default)]
    pub backoff: BackoffKind,

    /// The jitter shape applied to the computed backoff.
    #[serde(default)]
    pub jitter: JitterKind,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffKind::default(),
            jitter: JitterKind::default(),
        }
    }
}

impl RetryOptions {
    /// Returns a human-readable description of why these options are
    /// invalid, or `None` when they are well-formed.
    #[must_use]
    pub fn validation_error(&self) -> Option<String> {
        if self.max_attempts == 0 {
            return Some("max_attempts must be at least 1".to_owned());
        }
        match &self.backoff {
            BackoffKind::Exponential { multiplier, .. } if *multiplier < 1.0 => {
                Some(format!("exponential multiplier {multiplier} must be >= 1.0"))
            }
            _ => match self.jitter {
                JitterKind::Decorrelated { factor } if factor < 1.0 => {
                    Some(format!("decorrelated jitter factor {factor} must be >= 1.0"))
                }
                _ => None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let opts = RetryOptions::default();
        assert_eq!(opts.max_attempts, 3);
        assert_eq!(
            opts.backoff,
            BackoffKind::Exponential {
                base: Duration::from_millis(1000),
                multiplier: 2.0,
                max: Duration::from_millis(30_000),
            }
        );
        assert_eq!(opts.jitter, JitterKind::None);
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let opts = RetryOptions {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(opts.validation_error().is_some());
    }

    #[test]
    fn test_roundtrip_with_humantime_durations() {
        let opts = RetryOptions {
            max_attempts: 5,
            backoff: BackoffKind::Linear {
                base: Duration::from_millis(10),
                increment: Duration::from_millis(5),
                max: Duration::from_secs(1),
            },
            jitter: JitterKind::Equal,
        };
        let json = serde_json::to_string(&opts).unwrap();
        let back: RetryOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back, opts);
    }
}
