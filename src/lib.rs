// SPDX-License-Identifier: Apache-2.0

//! In-process streaming dataflow engine.
//!
//! `rill` executes a directed acyclic graph of typed nodes — sources
//! producing items, transforms and filters mapping them, merges folding
//! several inputs, sinks consuming them — under bounded buffering with
//! backpressure, configurable retry with backoff and jitter, optional
//! circuit breaking and deadletter routing, order-preserving parallel
//! transforms, and a single cancellation root per run.
//!
//! Pipelines are declared through the typed [`GraphBuilder`], compiled
//! into a [`Plan`] and executed with [`run`]:
//!
//! ```no_run
//! use rill::prelude::*;
//! use async_trait::async_trait;
//!
//! struct Numbers;
//!
//! #[async_trait]
//! impl Source<u64> for Numbers {
//!     async fn emit(&mut self, _ctx: &NodeContext, out: &Emitter<u64>) -> Result<(), Error> {
//!         for n in 0..1000 {
//!             out.send(n).await?;
//!         }
//!         Ok(())
//!     }
//! }
//!
//! struct Double;
//!
//! #[async_trait]
//! impl Transform<u64, u64> for Double {
//!     async fn apply(&self, item: u64, _ctx: &NodeContext) -> Result<u64, Error> {
//!         Ok(item * 2)
//!     }
//! }
//!
//! struct Print;
//!
//! #[async_trait]
//! impl Sink<u64> for Print {
//!     async fn drain(&mut self, input: &mut ItemStream<u64>, _ctx: &NodeContext) -> Result<(), Error> {
//!         while let Some(item) = input.next().await? {
//!             log::info!("got {item}");
//!         }
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> Result<(), Error> {
//! let mut builder = GraphBuilder::new("doubler");
//! let src = builder.add_source("src", Numbers);
//! let map = builder.add_transform("double", Double);
//! let out = builder.add_sink("print", Print);
//! builder.connect(&src, &map);
//! builder.connect(&map, &out);
//!
//! let report = run(builder.build()?, RunConfig::new()).await?;
//! assert!(report.is_success());
//! # Ok(())
//! # }
//! ```

pub use rill_channel as channel;
pub use rill_config as config;
pub use rill_engine as engine;
pub use rill_telemetry as telemetry;

pub use rill_engine::{
    BreakerOptions, CheckpointStore, DeadletterEnvelope, DeadletterMode, DeadletterSink, Emitter,
    Error, ErrorKind, Filter, GraphBuilder, InMemoryCheckpointStore, Item, ItemStream, MergePolicy,
    MergeSelector, NodeContext, Plan, RetryPolicy, RunConfig, RunOutcome, RunReport, Sink, Source,
    SyncOutcome, Transform, run,
};

/// The most commonly used types, for glob import.
pub mod prelude {
    pub use rill_config::parallel::{ParallelOptions, QueuePolicy};
    pub use rill_config::retry::{BackoffKind, JitterKind, RetryOptions};
    pub use rill_engine::{
        BreakerOptions, DeadletterMode, DeadletterSink, Emitter, Error, ErrorKind, Filter,
        GraphBuilder, Item, ItemStream, MergePolicy, NodeContext, Plan, RetryPolicy, RunConfig,
        RunOutcome, RunReport, Sink, Source, SyncOutcome, Transform, run,
    };
}
