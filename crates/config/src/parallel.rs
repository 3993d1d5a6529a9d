// SPDX-License-Identifier: Apache-2.0

//! Parallel execution options for transform and filter nodes.

use serde::{Deserialize, Serialize};

/// Behavior of the input queue of a parallel node when it is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    /// Suspend the producer until a slot frees up (lossless backpressure).
    #[default]
    Block,
    /// Discard the incoming item.
    DropNewest,
    /// Evict the oldest queued item, then enqueue the incoming one.
    DropOldest,
}

impl QueuePolicy {
    /// Returns `true` for policies that may discard items.
    #[must_use]
    pub const fn is_lossy(&self) -> bool {
        !matches!(self, QueuePolicy::Block)
    }
}

/// Parallelism options for a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ParallelOptions {
    /// Number of concurrent workers. Zero means "number of logical CPUs",
    /// resolved by the engine at compile time.
    #[serde(default)]
    pub max_parallelism: usize,

    /// Capacity of the input queue feeding the workers.
    #[serde(default = "default_max_queue_length")]
    pub max_queue_length: usize,

    /// What to do when the input queue is full.
    #[serde(default)]
    pub queue_policy: QueuePolicy,

    /// Capacity of the buffer holding processed items pending downstream
    /// read (the reorder buffer on the ordered path).
    #[serde(default = "default_output_buffer_capacity")]
    pub output_buffer_capacity: usize,

    /// Whether the output order must equal the input order. Forced off by
    /// lossy queue policies, which are inherently unordered.
    #[serde(default = "default_preserve_ordering")]
    pub preserve_ordering: bool,
}

fn default_max_queue_length() -> usize {
    64
}

fn default_output_buffer_capacity() -> usize {
    64
}

fn default_preserve_ordering() -> bool {
    true
}

impl Default for ParallelOptions {
    fn default() -> Self {
        Self {
            max_parallelism: 0,
            max_queue_length: default_max_queue_length(),
            queue_policy: QueuePolicy::default(),
            output_buffer_capacity: default_output_buffer_capacity(),
            preserve_ordering: default_preserve_ordering(),
        }
    }
}

impl ParallelOptions {
    /// Creates options with an explicit worker count and defaults elsewhere.
    #[must_use]
    pub fn with_parallelism(max_parallelism: usize) -> Self {
        Self {
            max_parallelism,
            ..Default::default()
        }
    }

    /// Returns a human-readable description of why these options are
    /// invalid, or `None` when they are well-formed.
    #[must_use]
    pub fn validation_error(&self) -> Option<String> {
        if self.max_queue_length == 0 {
            return Some("max_queue_length must be at least 1".to_owned());
        }
        if self.output_buffer_capacity == 0 {
            return Some("output_buffer_capacity must be at least 1".to_owned());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_lossless_and_ordered() {
        let opts = ParallelOptions::default();
        assert_eq!(opts.queue_policy, QueuePolicy::Block);
        assert!(opts.preserve_ordering);
        assert!(!opts.queue_policy.is_lossy());
    }

    #[test]
    fn test_zero_queue_rejected() {
        let opts = ParallelOptions {
            max_queue_length: 0,
            ..Default::default()
        };
        assert!(opts.validation_error().is_some());
    }
}
