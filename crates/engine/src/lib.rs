// SPDX-License-Identifier: Apache-2.0

//! Async dataflow pipeline runtime.
//!
//! The engine executes a user-defined DAG of typed nodes: sources produce
//! items, transforms and filters map them, merges fold several inputs,
//! sinks consume them. Pipelines are declared through the typed
//! [`graph::GraphBuilder`], compiled into a [`graph::Plan`], and executed
//! by [`runner::run`] under well-defined concurrency, backpressure,
//! ordering, retry and observability guarantees:
//!
//! - Edges are bounded pipes (`rill-channel`); a full pipe suspends the
//!   writer, which is how backpressure throttles upstream production.
//! - Every node is wrapped in a resilient executor: retry with
//!   configurable backoff and jitter, an optional circuit breaker, and
//!   optional deadletter routing.
//! - Transforms and filters can fan out across a bounded worker pool,
//!   preserving input order through a reorder buffer by default.
//! - One cancellation root per run; every blocking primitive observes it.
//! - Per-node progress can be checkpointed through a pluggable store.

pub mod backoff;
pub mod breaker;
pub mod checkpoint;
pub mod context;
pub mod error;
pub mod graph;
pub mod node;
pub mod parallel;
pub mod pool;
pub mod resilient;
pub mod runner;

/// Test-only nodes (feature `test-utils`).
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use backoff::{Backoff, CustomBackoff, DelayStrategy, Jitter};
pub use breaker::{BreakerOptions, BreakerState, CircuitBreaker};
pub use checkpoint::{CheckpointRecord, CheckpointStore, InMemoryCheckpointStore};
pub use context::{ConfigSnapshot, ExecutionContext, NodeContext, RunConfig};
pub use error::{Error, ErrorKind};
pub use graph::{
    FilterHandle, GraphBuilder, MergeHandle, NodeHandle, Plan, SinkHandle, SourceHandle,
    TransformHandle,
};
pub use node::{
    Emitter, Filter, Item, ItemStream, MergePolicy, MergeSelector, Sink, Source, SyncOutcome,
    Transform, TryNext,
};
pub use resilient::{
    DeadletterEnvelope, DeadletterMode, DeadletterSink, ItemOutcome, ResilientExecutor, RetryPolicy,
};
pub use runner::{RunOutcome, RunReport, run};
