// SPDX-License-Identifier: Apache-2.0

//! Parallel transform engine.
//!
//! Wraps a per-item stage (transform or filter) to process items
//! concurrently across a bounded worker pool. A dispatcher assigns a
//! monotonically increasing sequence number to each input and feeds a
//! bounded MPMC queue; workers run the resilient per-item operation; on
//! the ordered path a reorder stage releases results in sequence order
//! through a bounded completion channel, so the worst-case buffer is
//! `output_buffer_capacity` plus one in-flight item per worker.
//!
//! Lossy queue policies (`drop_newest`, `drop_oldest`) are inherently
//! unordered; the graph builder clears `preserve_ordering` when one is
//! configured.
//!
//! The output is closed exactly once, after every in-flight item has
//! either emitted a value, been filtered, been deadlettered, or the stage
//! failed.

use crate::context::NodeContext;
use crate::error::Error;
use crate::node::{Emitter, Filter, Item, ItemStream, SyncOutcome, Transform};
use crate::resilient::{ItemOutcome, ResilientExecutor};
use async_trait::async_trait;
use rill_config::parallel::{ParallelOptions, QueuePolicy};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;

/// A per-item operation: the common shape of transforms and filters as
/// seen by the worker pool. `None` means the item produced no output
/// (filtered out).
#[async_trait]
pub trait ItemStage<In: Item, Out: Item>: Send + Sync {
    /// Probes the synchronous fast path.
    fn try_sync(&self, item: In, ctx: &NodeContext) -> SyncOutcome<In, Option<Out>>;

    /// Runs the async path.
    async fn process(&self, item: In, ctx: &NodeContext) -> Result<Option<Out>, Error>;
}

/// Adapts a [`Transform`] to the stage shape.
pub struct TransformStage<In, Out> {
    transform: Arc<dyn Transform<In, Out>>,
}

impl<In: Item, Out: Item> TransformStage<In, Out> {
    /// Wraps a transform.
    #[must_use]
    pub fn new(transform: Arc<dyn Transform<In, Out>>) -> Self {
        Self { transform }
    }
}

#[async_trait]
impl<In: Item, Out: Item> ItemStage<In, Out> for TransformStage<In, Out> {
    fn try_sync(&self, item: In, ctx: &NodeContext) -> SyncOutcome<In, Option<Out>> {
        match self.transform.try_apply_sync(item, ctx) {
            SyncOutcome::Ready(result) => SyncOutcome::Ready(result.map(Some)),
            SyncOutcome::Pending(item) => SyncOutcome::Pending(item),
        }
    }

    async fn process(&self, item: In, ctx: &NodeContext) -> Result<Option<Out>, Error> {
        self.transform.apply(item, ctx).await.map(Some)
    }
}

/// Adapts a [`Filter`] to the stage shape.
pub struct FilterStage<T> {
    filter: Arc<dyn Filter<T>>,
}

impl<T: Item> FilterStage<T> {
    /// Wraps a filter.
    #[must_use]
    pub fn new(filter: Arc<dyn Filter<T>>) -> Self {
        Self { filter }
    }
}

#[async_trait]
impl<T: Item> ItemStage<T, T> for FilterStage<T> {
    fn try_sync(&self, item: T, _ctx: &NodeContext) -> SyncOutcome<T, Option<T>> {
        SyncOutcome::Pending(item)
    }

    async fn process(&self, item: T, ctx: &NodeContext) -> Result<Option<T>, Error> {
        if self.filter.keep(&item, ctx).await? {
            Ok(Some(item))
        } else {
            ctx.metrics().filtered.inc();
            Ok(None)
        }
    }
}

/// Resolves the effective worker count: zero means "logical CPUs".
#[must_use]
pub fn resolve_parallelism(options: Option<&ParallelOptions>) -> usize {
    match options {
        None => 1,
        Some(opts) if opts.max_parallelism == 0 => std::thread::available_parallelism()
            .map(std::num::NonZero::get)
            .unwrap_or(1),
        Some(opts) => opts.max_parallelism,
    }
}

/// Runs a per-item stage to completion: sequentially, or across a worker
/// pool when the resolved parallelism exceeds one.
///
/// Owns the node's input stream and output emitter; the output is closed
/// on success and failed with a derived cause on error.
///
/// # Errors
///
/// Returns the first terminal error of the stage: a node failure after
/// exhausted retries (without a deadletter route), an upstream pipe
/// failure, or cancellation.
pub async fn run_item_stage<In: Item, Out: Item>(
    stage: Arc<dyn ItemStage<In, Out>>,
    node_ctx: NodeContext,
    exec: Arc<ResilientExecutor>,
    input: ItemStream<In>,
    output: Emitter<Out>,
    options: Option<ParallelOptions>,
) -> Result<(), Error> {
    let workers = resolve_parallelism(options.as_ref());
    let result = if workers > 1 {
        let opts = options.unwrap_or_default();
        run_parallel(stage, &node_ctx, exec, input, &output, &opts, workers).await
    } else {
        run_sequential(stage, &node_ctx, exec, input, &output).await
    };

    match result {
        Ok(()) => {
            output.close();
            Ok(())
        }
        Err(error) => {
            output.fail(Arc::new(error.as_pipe_cause(node_ctx.node_id())));
            Err(error)
        }
    }
}

/// Processes one item through the stage, using the resilient wrapper only
/// when the policy can actually change the outcome. With a single attempt
/// and no breaker or deadletter route, the item goes straight through:
/// the sync fast path then never clones and never allocates.
async fn process_one<In: Item, Out: Item>(
    stage: &Arc<dyn ItemStage<In, Out>>,
    node_ctx: &NodeContext,
    exec: &Arc<ResilientExecutor>,
    item: In,
) -> Result<ItemOutcome<Option<Out>>, Error> {
    let plain = exec.max_attempts() == 1
        && exec.breaker().is_none()
        && node_ctx.run().deadletter().is_none();

    if plain {
        let result = match stage.try_sync(item, node_ctx) {
            SyncOutcome::Ready(result) => result,
            SyncOutcome::Pending(item) => stage.process(item, node_ctx).await,
        };
        return match result {
            Ok(out) => Ok(ItemOutcome::Done(out)),
            Err(e) if e.is_cancellation() => Err(e),
            Err(e) => {
                exec.count_error();
                Err(exec.enrich(1, e))
            }
        };
    }

    let stage = stage.clone();
    let ctx = node_ctx.clone();
    exec.execute_item(item, move |item, _attempt| {
        let stage = stage.clone();
        let ctx = ctx.clone();
        async move {
            match stage.try_sync(item, &ctx) {
                SyncOutcome::Ready(result) => result,
                SyncOutcome::Pending(item) => stage.process(item, &ctx).await,
            }
        }
    })
    .await
}

async fn run_sequential<In: Item, Out: Item>(
    stage: Arc<dyn ItemStage<In, Out>>,
    node_ctx: &NodeContext,
    exec: Arc<ResilientExecutor>,
    mut input: ItemStream<In>,
    output: &Emitter<Out>,
) -> Result<(), Error> {
    while let Some(item) = input.next().await? {
        match process_one(&stage, node_ctx, &exec, item).await? {
            ItemOutcome::Done(Some(out)) => output.send(out).await?,
            ItemOutcome::Done(None) | ItemOutcome::Deadlettered => {}
        }
    }
    Ok(())
}

async fn run_parallel<In: Item, Out: Item>(
    stage: Arc<dyn ItemStage<In, Out>>,
    node_ctx: &NodeContext,
    exec: Arc<ResilientExecutor>,
    mut input: ItemStream<In>,
    output: &Emitter<Out>,
    opts: &ParallelOptions,
    workers: usize,
) -> Result<(), Error> {
    let ordered = opts.preserve_ordering && !opts.queue_policy.is_lossy();
    let (work_tx, work_rx) = flume::bounded::<(u64, In)>(opts.max_queue_length);
    // Retained for drop_oldest eviction; does not keep workers alive.
    let evict_rx = work_rx.clone();
    // Cancelled by the first worker that hits a terminal error, so the
    // dispatcher stops feeding a stage that is going down.
    let stage_token = node_ctx.run().cancellation().child_token();

    let mut join: JoinSet<Result<(), Error>> = JoinSet::new();
    let (done_tx, done_rx) =
        tokio::sync::mpsc::channel::<(u64, Option<Out>)>(opts.output_buffer_capacity.max(1));

    for _ in 0..workers {
        let stage = stage.clone();
        let node_ctx = node_ctx.clone();
        let exec = exec.clone();
        let work_rx = work_rx.clone();
        let done_tx = done_tx.clone();
        let output = output.clone();
        let stage_token = stage_token.clone();
        let _handle = join.spawn(async move {
            while let Ok((seq, item)) = work_rx.recv_async().await {
                let outcome = match process_one(&stage, &node_ctx, &exec, item).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        stage_token.cancel();
                        return Err(e);
                    }
                };
                let out = match outcome {
                    ItemOutcome::Done(out) => out,
                    ItemOutcome::Deadlettered => None,
                };
                if ordered {
                    if done_tx.send((seq, out)).await.is_err() {
                        // Collector gone; the stage is unwinding.
                        return Ok(());
                    }
                } else if let Some(value) = out {
                    if let Err(e) = output.send(value).await {
                        stage_token.cancel();
                        return Err(e);
                    }
                }
            }
            Ok(())
        });
    }
    drop(done_tx);
    drop(work_rx);

    if ordered {
        let output = output.clone();
        let stage_token = stage_token.clone();
        let _handle = join.spawn(async move {
            let mut done_rx = done_rx;
            let mut pending: BTreeMap<u64, Option<Out>> = BTreeMap::new();
            let mut next_seq = 0u64;
            while let Some((seq, out)) = done_rx.recv().await {
                let _ = pending.insert(seq, out);
                while let Some(out) = pending.remove(&next_seq) {
                    next_seq += 1;
                    if let Some(value) = out {
                        if let Err(e) = output.send(value).await {
                            stage_token.cancel();
                            return Err(e);
                        }
                    }
                }
            }
            Ok(())
        });
    }

    // Dispatcher: assign sequence numbers and feed the worker queue.
    let metrics = node_ctx.metrics().clone();
    let mut seq = 0u64;
    let mut dispatch_result: Result<(), Error> = Ok(());
    'dispatch: loop {
        let item = tokio::select! {
            biased;
            () = stage_token.cancelled() => break,
            next = input.next() => match next {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(e) => {
                    dispatch_result = Err(e);
                    break;
                }
            },
        };

        match opts.queue_policy {
            QueuePolicy::Block => {
                let sent = tokio::select! {
                    biased;
                    () = stage_token.cancelled() => false,
                    res = work_tx.send_async((seq, item)) => res.is_ok(),
                };
                if !sent {
                    break;
                }
                seq += 1;
            }
            QueuePolicy::DropNewest => match work_tx.try_send((seq, item)) {
                Ok(()) => seq += 1,
                Err(flume::TrySendError::Full(_)) => metrics.drops.inc(),
                Err(flume::TrySendError::Disconnected(_)) => break,
            },
            QueuePolicy::DropOldest => {
                let mut entry = (seq, item);
                loop {
                    match work_tx.try_send(entry) {
                        Ok(()) => {
                            seq += 1;
                            break;
                        }
                        Err(flume::TrySendError::Full(back)) => {
                            entry = back;
                            // Evict the front of the queue, then retry. A
                            // worker may win the race for the slot, in
                            // which case nothing is evicted this round.
                            if evict_rx.try_recv().is_ok() {
                                metrics.drops.inc();
                            }
                        }
                        Err(flume::TrySendError::Disconnected(_)) => break 'dispatch,
                    }
                }
            }
        }

        let depth = work_tx.len() as u64;
        metrics.queue_depth.set(depth);
        metrics.queue_depth_peak.record_max(depth);
    }

    // Close the worker queue, let workers drain, then collect exits.
    drop(work_tx);
    let mut first_error: Option<Error> = None;
    while let Some(joined) = join.join_next().await {
        let task_result = match joined {
            Ok(result) => result,
            Err(e) => Err(Error::JoinTaskError {
                is_canceled: e.is_cancelled(),
                is_panic: e.is_panic(),
                error: e.to_string(),
            }),
        };
        if let Err(e) = task_result {
            if first_error.is_none() || first_error.as_ref().is_some_and(Error::is_cancellation) {
                first_error = Some(e);
            }
        }
    }

    match (dispatch_result, first_error) {
        (Err(e), worker) => {
            // Prefer a concrete worker failure over a secondary dispatch
            // error caused by the stage unwinding.
            match worker {
                Some(w) if !w.is_cancellation() => Err(w),
                _ => Err(e),
            }
        }
        (Ok(()), Some(w)) => Err(w),
        (Ok(()), None) => Ok(()),
    }
}
