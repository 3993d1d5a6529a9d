// SPDX-License-Identifier: Apache-2.0

//! Observability surfaces for the rill dataflow engine.
//!
//! Provides lock-free metric instruments, the per-node metric set
//! maintained by the runtime, a registry keyed by node id, and the span
//! observer hooks invoked around node work. Everything here is optional
//! from the embedding application's point of view: observers default to
//! no-ops and metric collection is plain atomic counters.

pub mod instrument;
pub mod metrics;
pub mod observer;

pub use instrument::{Counter, Gauge, TimeCounter};
pub use metrics::{MetricsRegistry, NodeMetrics, NodeMetricsSnapshot};
pub use observer::{NoopSpanObserver, SpanInfo, SpanObserver, SpanStatus};
