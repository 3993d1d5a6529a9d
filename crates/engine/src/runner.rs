// SPDX-License-Identifier: Apache-2.0

//! Scheduler and runner.
//!
//! Compile phase: the typed builder has already produced a validated
//! [`Plan`](crate::graph::Plan) with a topological order, a pipe factory
//! per edge and a launch closure per node. The runner instantiates the
//! pipes, wraps every node in its resilience chain and launches all node
//! tasks concurrently under a single cancellation root.
//!
//! Failure propagation: a failing node fails its outgoing pipes, the root
//! scope is cancelled, other nodes drain their in-flight work and exit,
//! and the run reports the first non-cancellation failure. Pipes are
//! closed by their writer on normal exit; the run succeeds when all sinks
//! succeed.

use crate::context::{NodeContext, RunConfig};
use crate::error::Error;
use crate::graph::{AnyBox, Plan};
use crate::node::{
    Emitter, Item, ItemStream, MergePolicy, Sink, Source, TryNext,
};
use crate::parallel::{ItemStage, run_item_stage};
use crate::resilient::ResilientExecutor;
use futures::future::BoxFuture;
use rill_channel::{PipeReceiver, PipeSender};
use rill_config::NodeId;
use rill_config::node::NodeKind;
use rill_telemetry::NodeMetricsSnapshot;
use serde_json::json;
use smallvec::SmallVec;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

/// The launch closure of one node: consumes the node instance and its
/// runtime wiring, returns the node task future.
pub(crate) type LaunchFn = Box<dyn FnOnce(NodeRuntime) -> BoxFuture<'static, Result<(), Error>> + Send>;

/// One node of a compiled plan.
pub(crate) struct NodeEntry {
    pub kind: NodeKind,
    pub launch: LaunchFn,
}

/// The wiring handed to a node's launch closure.
pub(crate) struct NodeRuntime {
    pub node_ctx: NodeContext,
    pub exec: Arc<ResilientExecutor>,
    /// Incoming pipe receivers, in connection order.
    pub inputs: Vec<AnyBox>,
    /// Outgoing pipe senders, in connection order (fan-out).
    pub outputs: Vec<AnyBox>,
    pub parallel: Option<rill_config::parallel::ParallelOptions>,
}

/// How a run ended.
#[derive(Debug)]
pub enum RunOutcome {
    /// All sinks completed successfully.
    Success,
    /// The first non-cancellation failure observed.
    Failed(Error),
    /// The run was cancelled; `timed_out` carries the deadline when the
    /// cancellation came from the run's own timer.
    Cancelled {
        /// The deadline that expired, when the cancellation was a timeout.
        timed_out: Option<Duration>,
    },
}

impl RunOutcome {
    /// Returns `true` for a successful run.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success)
    }

    /// The failure, when the run failed.
    #[must_use]
    pub fn error(&self) -> Option<&Error> {
        match self {
            RunOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Structured completion report of one run.
#[derive(Debug)]
pub struct RunReport {
    /// How the run ended.
    pub outcome: RunOutcome,
    /// Per-node counters (in, out, errors, retried, dropped, deadlettered).
    pub nodes: BTreeMap<rill_telemetry::metrics::NodeName, NodeMetricsSnapshot>,
    /// Wall-clock duration of the run.
    pub duration: Duration,
    /// The correlation id attached to the run's errors and spans.
    pub correlation_id: String,
}

impl RunReport {
    /// Returns `true` for a successful run.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    /// The counters of one node, when it exists.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&NodeMetricsSnapshot> {
        self.nodes.get(id)
    }
}

/// Executes a compiled plan under the given run configuration.
///
/// The plan is consumed: node instances are single-use. Build a fresh
/// plan for every run.
///
/// # Errors
///
/// Returns an error only for failures of the run machinery itself
/// (internal wiring). Node failures, cancellation and timeouts are
/// reported through [`RunReport::outcome`].
pub async fn run(mut plan: Plan, config: RunConfig) -> Result<RunReport, Error> {
    let deadline = config.deadline();
    let ctx = config.into_context(plan.pipeline_id.clone());
    let token = ctx.cancellation().clone();
    let started = Instant::now();

    log::info!(
        "Starting pipeline `{}` ({} nodes, correlation {})",
        plan.pipeline_id,
        plan.topo.len(),
        ctx.correlation_id()
    );
    ctx.set_item("run/pipeline_id", json!(plan.pipeline_id.as_ref()));

    // Timeouts are cancellation of the root scope after the deadline.
    let deadline_task = deadline.map(|d| {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(d) => {
                    log::warn!("Run deadline of {d:?} exceeded, cancelling");
                    token.cancel();
                    true
                }
                () = token.cancelled() => false,
            }
        })
    });

    // One pipe per edge, capacity from the edge or the graph default.
    let default_capacity = plan.spec.settings.default_pipe_capacity;
    let mut inputs: HashMap<NodeId, Vec<AnyBox>> = HashMap::new();
    let mut outputs: HashMap<NodeId, Vec<AnyBox>> = HashMap::new();
    for edge in &plan.edges {
        let capacity = edge.capacity.unwrap_or(default_capacity);
        let (tx, rx) = (edge.make_pipe)(capacity);
        outputs.entry(edge.from.clone()).or_default().push(tx);
        inputs.entry(edge.to.clone()).or_default().push(rx);
    }

    // Launch every node concurrently, in topological order for
    // deterministic logs.
    let mut join: JoinSet<(NodeId, Result<(), Error>)> = JoinSet::new();
    for node_id in &plan.topo {
        let entry = plan.entries.remove(node_id).ok_or_else(|| Error::InternalError {
            message: format!("no entry for node `{node_id}` in plan"),
        })?;
        let node_ctx = NodeContext::new(node_id.clone(), ctx.clone());
        let exec = Arc::new(ResilientExecutor::new(
            &node_ctx,
            plan.retries.get(node_id).cloned(),
        ));
        let parallel = plan
            .spec
            .nodes
            .get(node_id)
            .and_then(|n| n.parallel.clone());
        let runtime = NodeRuntime {
            node_ctx,
            exec,
            inputs: inputs.remove(node_id).unwrap_or_default(),
            outputs: outputs.remove(node_id).unwrap_or_default(),
            parallel,
        };

        log::debug!("Launching {:?} node `{node_id}`", entry.kind);
        let future = (entry.launch)(runtime);
        let node_id = node_id.clone();
        let token = token.clone();
        let _handle = join.spawn(async move {
            let result = future.await;
            if result.is_err() {
                // First failure cancels the root; peers drain and exit.
                token.cancel();
            }
            (node_id, result)
        });
    }

    // Collect exit reasons: the first non-cancellation failure wins, with
    // node-level failures preferred over secondary pipe errors.
    let mut failure: Option<Error> = None;
    let mut saw_cancellation = false;
    while let Some(joined) = join.join_next().await {
        match joined {
            Ok((node_id, Ok(()))) => {
                log::debug!("Node `{node_id}` completed");
                ctx.set_item(format!("node/{node_id}/status"), json!("completed"));
            }
            Ok((node_id, Err(e))) => {
                if e.is_cancellation() {
                    saw_cancellation = true;
                    log::debug!("Node `{node_id}` cancelled");
                    ctx.set_item(format!("node/{node_id}/status"), json!("cancelled"));
                } else {
                    log::error!("Node `{node_id}` failed: {e}");
                    ctx.set_item(format!("node/{node_id}/status"), json!("failed"));
                    record_failure(&mut failure, e);
                }
            }
            Err(join_error) => {
                record_failure(
                    &mut failure,
                    Error::JoinTaskError {
                        is_canceled: join_error.is_cancelled(),
                        is_panic: join_error.is_panic(),
                        error: join_error.to_string(),
                    },
                );
            }
        }
    }

    let timed_out = match deadline_task {
        Some(task) => {
            task.abort();
            matches!(task.await, Ok(true))
        }
        None => false,
    };

    let outcome = match failure {
        Some(error) => RunOutcome::Failed(error),
        None if saw_cancellation => RunOutcome::Cancelled {
            timed_out: timed_out.then_some(deadline.unwrap_or_default()),
        },
        None => RunOutcome::Success,
    };

    let duration = started.elapsed();
    let report = RunReport {
        nodes: ctx.metrics().snapshot(),
        duration,
        correlation_id: ctx.correlation_id().to_owned(),
        outcome,
    };
    match &report.outcome {
        RunOutcome::Success => {
            log::info!("Pipeline `{}` completed in {duration:?}", plan.pipeline_id);
        }
        RunOutcome::Failed(e) => {
            log::error!("Pipeline `{}` failed in {duration:?}: {e}", plan.pipeline_id);
        }
        RunOutcome::Cancelled { timed_out } => {
            log::warn!(
                "Pipeline `{}` cancelled in {duration:?} (timed_out: {})",
                plan.pipeline_id,
                timed_out.is_some()
            );
        }
    }
    Ok(report)
}

/// Failure precedence: a node-level failure explains the run better than
/// the secondary pipe errors it causes downstream.
fn error_priority(error: &Error) -> u8 {
    match error {
        Error::PipeSendError { .. } | Error::PipeRecvError { .. } => 1,
        _ => 0,
    }
}

fn record_failure(slot: &mut Option<Error>, error: Error) {
    match slot {
        None => *slot = Some(error),
        Some(current) if error_priority(current) > error_priority(&error) => {
            *slot = Some(error);
        }
        Some(_) => {}
    }
}

fn downcast_senders<T: Item>(
    node: &NodeId,
    outputs: Vec<AnyBox>,
) -> Result<SmallVec<[PipeSender<T>; 1]>, Error> {
    outputs
        .into_iter()
        .map(|any| {
            any.downcast::<PipeSender<T>>()
                .map(|boxed| *boxed)
                .map_err(|_| wiring_error::<T>(node, "sender"))
        })
        .collect()
}

fn downcast_receivers<T: Item>(
    node: &NodeId,
    inputs: Vec<AnyBox>,
) -> Result<Vec<PipeReceiver<T>>, Error> {
    inputs
        .into_iter()
        .map(|any| {
            any.downcast::<PipeReceiver<T>>()
                .map(|boxed| *boxed)
                .map_err(|_| wiring_error::<T>(node, "receiver"))
        })
        .collect()
}

fn wiring_error<T>(node: &NodeId, endpoint: &str) -> Error {
    Error::InternalError {
        message: format!(
            "node `{node}` wired with a {endpoint} of the wrong item type (expected {})",
            std::any::type_name::<T>()
        ),
    }
}

fn make_emitter<T: Item>(node_ctx: &NodeContext, outputs: Vec<AnyBox>) -> Result<Emitter<T>, Error> {
    let senders = downcast_senders::<T>(node_ctx.node_id(), outputs)?;
    Ok(Emitter::new(
        node_ctx.node_id().clone(),
        senders,
        node_ctx.run().cancellation().clone(),
        node_ctx.metrics().clone(),
    ))
}

fn make_single_input<T: Item>(
    node_ctx: &NodeContext,
    mut inputs: Vec<AnyBox>,
) -> Result<ItemStream<T>, Error> {
    if inputs.len() != 1 {
        return Err(Error::InternalError {
            message: format!(
                "node `{}` expected exactly one input, got {}",
                node_ctx.node_id(),
                inputs.len()
            ),
        });
    }
    let receiver = downcast_receivers::<T>(node_ctx.node_id(), vec![inputs.remove(0)])?
        .pop()
        .ok_or_else(|| Error::InternalError {
            message: "input receiver vanished during downcast".to_owned(),
        })?;
    Ok(ItemStream::new(
        node_ctx.node_id().clone(),
        receiver,
        node_ctx.run().cancellation().clone(),
        node_ctx.metrics().clone(),
    ))
}

/// Runs a source node: lifecycle hooks, whole-invocation retry around
/// `emit`, and terminal close/fail of the outgoing pipes.
pub(crate) async fn run_source<T: Item>(
    mut source: impl Source<T>,
    rt: NodeRuntime,
) -> Result<(), Error> {
    let NodeRuntime {
        node_ctx,
        exec,
        outputs,
        ..
    } = rt;
    let emitter = make_emitter::<T>(&node_ctx, outputs)?;

    if let Err(e) = source.on_start(&node_ctx).await {
        emitter.fail(Arc::new(e.as_pipe_cause(node_ctx.node_id())));
        return Err(e);
    }

    let result = retry_invocation(&exec, async || source.emit(&node_ctx, &emitter).await).await;
    let stopped = source.on_stop(&node_ctx).await;

    match result.and(stopped) {
        Ok(()) => {
            emitter.close();
            Ok(())
        }
        Err(e) => {
            emitter.fail(Arc::new(e.as_pipe_cause(node_ctx.node_id())));
            Err(e)
        }
    }
}

/// Runs a transform or filter node through the parallel engine.
pub(crate) async fn run_stage_node<In: Item, Out: Item>(
    stage: Arc<dyn ItemStage<In, Out>>,
    rt: NodeRuntime,
) -> Result<(), Error> {
    let NodeRuntime {
        node_ctx,
        exec,
        inputs,
        outputs,
        parallel,
    } = rt;
    let input = make_single_input::<In>(&node_ctx, inputs)?;
    let output = make_emitter::<Out>(&node_ctx, outputs)?;
    run_item_stage(stage, node_ctx, exec, input, output, parallel).await
}

/// Runs a sink node: lifecycle hooks and whole-invocation retry around
/// `drain`.
pub(crate) async fn run_sink<T: Item>(mut sink: impl Sink<T>, rt: NodeRuntime) -> Result<(), Error> {
    let NodeRuntime {
        node_ctx,
        exec,
        inputs,
        ..
    } = rt;
    let mut input = make_single_input::<T>(&node_ctx, inputs)?;

    sink.on_start(&node_ctx).await?;
    let result = retry_invocation(&exec, async || sink.drain(&mut input, &node_ctx).await).await;
    let stopped = sink.on_stop(&node_ctx).await;
    result.and(stopped)
}

/// Runs a merge node: folds all inputs into the output per the policy.
pub(crate) async fn run_merge<T: Item>(policy: MergePolicy<T>, rt: NodeRuntime) -> Result<(), Error> {
    let NodeRuntime {
        node_ctx,
        inputs,
        outputs,
        ..
    } = rt;
    let node = node_ctx.node_id().clone();
    let receivers = downcast_receivers::<T>(&node, inputs)?;
    let emitter = make_emitter::<T>(&node_ctx, outputs)?;
    let mut streams: Vec<ItemStream<T>> = receivers
        .into_iter()
        .map(|rx| {
            ItemStream::new(
                node.clone(),
                rx,
                node_ctx.run().cancellation().clone(),
                node_ctx.metrics().clone(),
            )
        })
        .collect();

    match merge_loop(&policy, &mut streams, &emitter).await {
        Ok(()) => {
            emitter.close();
            Ok(())
        }
        Err(e) => {
            emitter.fail(Arc::new(e.as_pipe_cause(&node)));
            Err(e)
        }
    }
}

async fn merge_loop<T: Item>(
    policy: &MergePolicy<T>,
    streams: &mut [ItemStream<T>],
    emitter: &Emitter<T>,
) -> Result<(), Error> {
    let n = streams.len();
    let mut slots: Vec<Option<T>> = (0..n).map(|_| None).collect();
    let mut open = vec![true; n];
    let mut rotate = 0usize;

    loop {
        // Refill empty slots without blocking.
        for (idx, stream) in streams.iter_mut().enumerate() {
            if open[idx] && slots[idx].is_none() {
                match stream.try_next()? {
                    TryNext::Item(item) => slots[idx] = Some(item),
                    TryNext::Empty => {}
                    TryNext::Closed => open[idx] = false,
                }
            }
        }

        if slots.iter().all(Option::is_none) {
            if !open.iter().any(|&o| o) {
                return Ok(());
            }
            // Nothing buffered: await whichever open input produces first.
            let mut waiters = Vec::new();
            for (idx, stream) in streams.iter_mut().enumerate() {
                if open[idx] {
                    waiters.push(Box::pin(async move { (idx, stream.next().await) }));
                }
            }
            let ((idx, result), _, _) = futures::future::select_all(waiters).await;
            match result? {
                Some(item) => slots[idx] = Some(item),
                None => open[idx] = false,
            }
            continue;
        }

        let pick = match policy {
            MergePolicy::Prioritized => slots.iter().position(Option::is_some),
            MergePolicy::Interleave => {
                (0..n).map(|k| (rotate + k) % n).find(|i| slots[*i].is_some())
            }
            MergePolicy::Custom(selector) => {
                let ready: Vec<(usize, &T)> = slots
                    .iter()
                    .enumerate()
                    .filter_map(|(i, slot)| slot.as_ref().map(|item| (i, item)))
                    .collect();
                let chosen = selector.select(&ready);
                if slots.get(chosen).is_none_or(Option::is_none) {
                    return Err(Error::InternalError {
                        message: format!(
                            "merge selector for `{}` chose input {chosen} with no ready item",
                            emitter.node_id()
                        ),
                    });
                }
                Some(chosen)
            }
        };
        let Some(pick) = pick else {
            return Err(Error::InternalError {
                message: "merge pick missed a ready slot".to_owned(),
            });
        };

        rotate = (pick + 1) % n;
        if let Some(item) = slots[pick].take() {
            emitter.send(item).await?;
        }
    }
}

/// Whole-invocation retry for sources and sinks: restarts the operation
/// on transient failure per the node's policy, with span hooks around
/// every attempt and cancellation-observing backoff sleeps.
async fn retry_invocation<F>(exec: &ResilientExecutor, mut op: F) -> Result<(), Error>
where
    F: AsyncFnMut() -> Result<(), Error>,
{
    let mut attempt = 1u32;
    loop {
        let (span, started) = exec.span_begin(attempt);
        let result = op().await;
        exec.span_end(&span, started, result.as_ref().err());
        match result {
            Ok(()) => return Ok(()),
            Err(e) if e.is_cancellation() => return Err(e),
            Err(e) => {
                exec.count_error();
                if exec.should_retry(&e, attempt) {
                    exec.count_retry();
                    log::debug!("Invocation attempt {attempt} failed, retrying: {e}");
                    exec.backoff_sleep(attempt).await?;
                    attempt += 1;
                } else {
                    return Err(exec.enrich(attempt, e));
                }
            }
        }
    }
}
