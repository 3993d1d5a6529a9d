// SPDX-License-Identifier: Apache-2.0

//! Single-purpose nodes for tests and examples.
//!
//! Gated behind the `test-utils` feature; nothing here is part of the
//! stable API surface.

use crate::context::NodeContext;
use crate::error::Error;
use crate::node::{Emitter, Filter, Item, ItemStream, Sink, Source, SyncOutcome, Transform};
use crate::resilient::{DeadletterEnvelope, DeadletterSink};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

/// Emits a contiguous range of numbers, optionally paced.
pub struct RangeSource {
    range: Range<u64>,
    interval: Option<Duration>,
}

impl RangeSource {
    /// Emits every number of `range` as fast as downstream allows.
    #[must_use]
    pub fn new(range: Range<u64>) -> Self {
        Self {
            range,
            interval: None,
        }
    }

    /// Emits one number per `interval`.
    #[must_use]
    pub fn paced(range: Range<u64>, interval: Duration) -> Self {
        Self {
            range,
            interval: Some(interval),
        }
    }
}

#[async_trait]
impl Source<u64> for RangeSource {
    async fn emit(&mut self, _ctx: &NodeContext, out: &Emitter<u64>) -> Result<(), Error> {
        for value in self.range.clone() {
            out.send(value).await?;
            if let Some(interval) = self.interval {
                tokio::time::sleep(interval).await;
            }
        }
        Ok(())
    }
}

/// Emits numbers forever, one per interval. Only cancellation stops it.
pub struct TickingSource {
    interval: Duration,
}

impl TickingSource {
    /// Creates a ticking source.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

#[async_trait]
impl Source<u64> for TickingSource {
    async fn emit(&mut self, ctx: &NodeContext, out: &Emitter<u64>) -> Result<(), Error> {
        let mut value = 0u64;
        loop {
            if ctx.is_cancelled() {
                return Err(ctx.cancellation_error());
            }
            out.send(value).await?;
            value += 1;
            tokio::time::sleep(self.interval).await;
        }
    }
}

/// Multiplies every item by a constant, optionally with a per-item delay.
/// Without a delay the transform completes on the synchronous fast path.
pub struct ScaleTransform {
    factor: u64,
    delay: Option<Duration>,
}

impl ScaleTransform {
    /// Creates an immediate scaling transform.
    #[must_use]
    pub fn new(factor: u64) -> Self {
        Self {
            factor,
            delay: None,
        }
    }

    /// Creates a scaling transform that takes `delay` per item.
    #[must_use]
    pub fn slow(factor: u64, delay: Duration) -> Self {
        Self {
            factor,
            delay: Some(delay),
        }
    }
}

#[async_trait]
impl Transform<u64, u64> for ScaleTransform {
    fn try_apply_sync(&self, item: u64, _ctx: &NodeContext) -> SyncOutcome<u64, u64> {
        match self.delay {
            None => SyncOutcome::Ready(Ok(item * self.factor)),
            Some(_) => SyncOutcome::Pending(item),
        }
    }

    async fn apply(&self, item: u64, _ctx: &NodeContext) -> Result<u64, Error> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(item * self.factor)
    }
}

/// Fails a fixed number of times per item before succeeding, for items
/// selected by a predicate. Tracks attempts per item value.
pub struct FlakyTransform {
    failures_per_item: u32,
    applies_to: fn(u64) -> bool,
    attempts: Mutex<HashMap<u64, u32>>,
}

impl FlakyTransform {
    /// Fails `failures_per_item` times for every item where
    /// `applies_to` returns `true`, then succeeds.
    #[must_use]
    pub fn new(failures_per_item: u32, applies_to: fn(u64) -> bool) -> Self {
        Self {
            failures_per_item,
            applies_to,
            attempts: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Transform<u64, u64> for FlakyTransform {
    async fn apply(&self, item: u64, ctx: &NodeContext) -> Result<u64, Error> {
        if (self.applies_to)(item) {
            let mut attempts = self.attempts.lock();
            let seen = attempts.entry(item).or_insert(0);
            if *seen < self.failures_per_item {
                *seen += 1;
                return Err(Error::transient(
                    ctx.node_id().clone(),
                    format!("simulated transient failure for item {item}"),
                ));
            }
        }
        Ok(item)
    }
}

/// Always fails for items divisible by a constant.
pub struct PoisonTransform {
    divisor: u64,
}

impl PoisonTransform {
    /// Fails every item divisible by `divisor`.
    #[must_use]
    pub fn new(divisor: u64) -> Self {
        Self { divisor }
    }
}

#[async_trait]
impl Transform<u64, u64> for PoisonTransform {
    async fn apply(&self, item: u64, ctx: &NodeContext) -> Result<u64, Error> {
        if item % self.divisor == 0 {
            Err(Error::transient(
                ctx.node_id().clone(),
                format!("item {item} is divisible by {}", self.divisor),
            ))
        } else {
            Ok(item)
        }
    }
}

/// Keeps even numbers.
pub struct EvenFilter;

#[async_trait]
impl Filter<u64> for EvenFilter {
    async fn keep(&self, item: &u64, _ctx: &NodeContext) -> Result<bool, Error> {
        Ok(item % 2 == 0)
    }
}

/// Collects every received item for later inspection.
pub struct CollectingSink<T> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T: Item> CollectingSink<T> {
    /// Creates a sink and the shared handle to its collected items.
    #[must_use]
    pub fn new() -> (Self, Arc<Mutex<Vec<T>>>) {
        let items = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                items: items.clone(),
            },
            items,
        )
    }
}

#[async_trait]
impl<T: Item> Sink<T> for CollectingSink<T> {
    async fn drain(&mut self, input: &mut ItemStream<T>, _ctx: &NodeContext) -> Result<(), Error> {
        while let Some(item) = input.next().await? {
            self.items.lock().push(item);
        }
        Ok(())
    }
}

/// Consumes items at a fixed pace, discarding them.
pub struct SlowSink {
    delay: Duration,
    count: Arc<Mutex<u64>>,
}

impl SlowSink {
    /// Creates a sink taking `delay` per item, plus a received-count handle.
    #[must_use]
    pub fn new(delay: Duration) -> (Self, Arc<Mutex<u64>>) {
        let count = Arc::new(Mutex::new(0));
        (
            Self {
                delay,
                count: count.clone(),
            },
            count,
        )
    }
}

#[async_trait]
impl Sink<u64> for SlowSink {
    async fn drain(&mut self, input: &mut ItemStream<u64>, _ctx: &NodeContext) -> Result<(), Error> {
        while input.next().await?.is_some() {
            *self.count.lock() += 1;
            tokio::time::sleep(self.delay).await;
        }
        Ok(())
    }
}

/// Collects deadletter envelopes for later inspection.
pub struct CollectingDeadletter {
    envelopes: Arc<Mutex<Vec<DeadletterEnvelope>>>,
}

impl CollectingDeadletter {
    /// Creates a sink and the shared handle to its collected envelopes.
    #[must_use]
    pub fn new() -> (Arc<Self>, Arc<Mutex<Vec<DeadletterEnvelope>>>) {
        let envelopes = Arc::new(Mutex::new(Vec::new()));
        (
            Arc::new(Self {
                envelopes: envelopes.clone(),
            }),
            envelopes,
        )
    }
}

#[async_trait]
impl DeadletterSink for CollectingDeadletter {
    async fn deliver(&self, envelope: DeadletterEnvelope) -> Result<(), Error> {
        self.envelopes.lock().push(envelope);
        Ok(())
    }
}
