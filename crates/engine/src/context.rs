// SPDX-License-Identifier: Apache-2.0

//! Per-run execution context.
//!
//! The context carries everything node work needs: the cancellation root,
//! the read-only parameter bag, the framework items map, observer and
//! checkpoint handles, and the per-node configuration snapshots.
//!
//! Configuration is frozen once a run starts. Nodes cache their resolved
//! `(retry, observer)` pair in a [`ConfigSnapshot`] at entry to avoid
//! per-item lookups on hot paths; the snapshot records the context's
//! configuration generation, and debug builds assert the generation has
//! not advanced mid-invocation. Release builds elide the check entirely.

use crate::checkpoint::{CheckpointKey, CheckpointRecord, CheckpointStore, InMemoryCheckpointStore};
use crate::error::Error;
use crate::pool::{KeyValueMap, Pooled, Pools};
use crate::resilient::{DeadletterMode, DeadletterSink, RetryPolicy};
use parking_lot::Mutex;
use rill_config::{NodeId, PipelineId};
use rill_telemetry::{MetricsRegistry, NodeMetrics, NoopSpanObserver, SpanObserver};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Parameter storage: pooled when the framework built the map, supplied
/// when the caller provided one (and therefore keeps ownership).
enum Parameters {
    Pooled(Pooled<KeyValueMap>),
    Supplied(Arc<KeyValueMap>),
}

impl Parameters {
    fn as_map(&self) -> &KeyValueMap {
        match self {
            Parameters::Pooled(map) => map,
            Parameters::Supplied(map) => map,
        }
    }
}

/// Deadletter routing configured for a run.
#[derive(Clone)]
pub struct DeadletterRoute {
    /// The destination for exhausted items.
    pub sink: Arc<dyn DeadletterSink>,
    /// Whether delivery blocks the failing node until confirmed.
    pub mode: DeadletterMode,
}

/// User-visible configuration for one run.
///
/// Configure before the run; reconfigure only between runs.
pub struct RunConfig {
    app_name: Cow<'static, str>,
    parameters: Option<ParametersSource>,
    cancellation: CancellationToken,
    deadline: Option<Duration>,
    default_retry: Arc<RetryPolicy>,
    span_observer: Arc<dyn SpanObserver>,
    checkpoints: Arc<dyn CheckpointStore>,
    deadletter: Option<DeadletterRoute>,
    pools: Arc<Pools>,
}

enum ParametersSource {
    Supplied(KeyValueMap),
    Entries(Vec<(Cow<'static, str>, Value)>),
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            app_name: "rill".into(),
            parameters: None,
            cancellation: CancellationToken::new(),
            deadline: None,
            default_retry: Arc::new(RetryPolicy::default()),
            span_observer: Arc::new(NoopSpanObserver),
            checkpoints: Arc::new(InMemoryCheckpointStore::new()),
            deadletter: None,
            pools: Pools::new(),
        }
    }
}

impl RunConfig {
    /// Creates a config with all defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the application name surfaced to observers.
    #[must_use]
    pub fn with_app_name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Adds one run parameter. Parameters are read-only once the run starts.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<Cow<'static, str>>, value: Value) -> Self {
        let mut entries = match self.parameters.take() {
            Some(ParametersSource::Entries(entries)) => entries,
            Some(ParametersSource::Supplied(map)) => map.into_iter().collect(),
            None => Vec::new(),
        };
        entries.push((key.into(), value));
        self.parameters = Some(ParametersSource::Entries(entries));
        self
    }

    /// Supplies the whole parameter map. The caller retains ownership
    /// semantics: the map is never returned to the framework pools.
    #[must_use]
    pub fn with_parameters(mut self, map: KeyValueMap) -> Self {
        self.parameters = Some(ParametersSource::Supplied(map));
        self
    }

    /// Links the run to an external cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Sets a run deadline; on expiry the root scope is cancelled.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets the run-level default retry policy.
    #[must_use]
    pub fn with_default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = Arc::new(policy);
        self
    }

    /// Installs a span observer.
    #[must_use]
    pub fn with_span_observer(mut self, observer: Arc<dyn SpanObserver>) -> Self {
        self.span_observer = observer;
        self
    }

    /// Installs a checkpoint store.
    #[must_use]
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = store;
        self
    }

    /// Routes exhausted items to a deadletter sink.
    #[must_use]
    pub fn with_deadletter(mut self, sink: Arc<dyn DeadletterSink>, mode: DeadletterMode) -> Self {
        self.deadletter = Some(DeadletterRoute { sink, mode });
        self
    }

    /// Shares a pool set across runs.
    #[must_use]
    pub fn with_pools(mut self, pools: Arc<Pools>) -> Self {
        self.pools = pools;
        self
    }

    /// The configured deadline, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// Freezes this configuration into the per-run execution context.
    #[must_use]
    pub fn into_context(self, pipeline_id: PipelineId) -> Arc<ExecutionContext> {
        let parameters = match self.parameters {
            Some(ParametersSource::Supplied(map)) => Parameters::Supplied(Arc::new(map)),
            Some(ParametersSource::Entries(entries)) => {
                let mut map = self.pools.params.rent(entries.len());
                for (key, value) in entries {
                    let _ = map.insert(key, value);
                }
                Parameters::Pooled(map)
            }
            None => Parameters::Pooled(self.pools.params.rent(0)),
        };
        let items = Mutex::new(self.pools.items.rent(0));

        Arc::new(ExecutionContext {
            pipeline_id,
            app_name: self.app_name,
            correlation_id: Uuid::new_v4().to_string(),
            cancellation: self.cancellation.child_token(),
            parameters,
            items,
            default_retry: self.default_retry,
            span_observer: self.span_observer,
            metrics: MetricsRegistry::new(),
            checkpoints: self.checkpoints,
            deadletter: self.deadletter,
            pools: self.pools,
            generation: AtomicU64::new(0),
            snapshots: Mutex::new(HashMap::new()),
        })
    }
}

/// The per-run state bag shared read-only by all nodes.
pub struct ExecutionContext {
    pipeline_id: PipelineId,
    app_name: Cow<'static, str>,
    correlation_id: String,
    cancellation: CancellationToken,
    parameters: Parameters,
    /// Framework-owned scratch space (scheduler state, per-node run data).
    items: Mutex<Pooled<KeyValueMap>>,
    default_retry: Arc<RetryPolicy>,
    span_observer: Arc<dyn SpanObserver>,
    metrics: MetricsRegistry,
    checkpoints: Arc<dyn CheckpointStore>,
    deadletter: Option<DeadletterRoute>,
    pools: Arc<Pools>,
    /// Configuration generation; advances only between runs.
    generation: AtomicU64,
    /// Cached per-node configuration snapshots.
    snapshots: Mutex<HashMap<NodeId, Arc<ConfigSnapshot>>>,
}

impl ExecutionContext {
    /// The id of the pipeline being run.
    #[must_use]
    pub fn pipeline_id(&self) -> &PipelineId {
        &self.pipeline_id
    }

    /// The observability application name for this run.
    #[must_use]
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// The correlation id attached to every terminal error of this run.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// The cancellation root for all node work in this run.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// The read-only parameter map.
    #[must_use]
    pub fn parameters(&self) -> &KeyValueMap {
        self.parameters.as_map()
    }

    /// Reads one framework item.
    #[must_use]
    pub fn item(&self, key: &str) -> Option<Value> {
        self.items.lock().get(key).cloned()
    }

    /// Writes one framework item. Reserved for framework use.
    pub fn set_item(&self, key: impl Into<Cow<'static, str>>, value: Value) {
        let _ = self.items.lock().insert(key.into(), value);
    }

    /// The run-level default retry policy.
    #[must_use]
    pub fn default_retry(&self) -> &Arc<RetryPolicy> {
        &self.default_retry
    }

    /// The span observer installed for this run.
    #[must_use]
    pub fn span_observer(&self) -> &Arc<dyn SpanObserver> {
        &self.span_observer
    }

    /// The per-node metrics registry of this run.
    #[must_use]
    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// The checkpoint store for this run.
    #[must_use]
    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    /// The deadletter route, when configured.
    #[must_use]
    pub fn deadletter(&self) -> Option<&DeadletterRoute> {
        self.deadletter.as_ref()
    }

    /// The pools backing this run's maps and buffers.
    #[must_use]
    pub fn pools(&self) -> &Arc<Pools> {
        &self.pools
    }

    /// The current configuration generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Advances the configuration generation. Only legal between runs;
    /// snapshots taken before the bump fail their debug validation.
    pub fn bump_generation(&self) {
        let _ = self.generation.fetch_add(1, Ordering::AcqRel);
        self.snapshots.lock().clear();
    }

    /// Returns the configuration snapshot for a node, capturing it on
    /// first use. The snapshot is immutable for the duration of a node's
    /// invocation.
    #[must_use]
    pub fn snapshot(
        self: &Arc<Self>,
        node_id: &NodeId,
        retry_override: Option<&Arc<RetryPolicy>>,
    ) -> Arc<ConfigSnapshot> {
        if let Some(existing) = self.snapshots.lock().get(node_id) {
            return existing.clone();
        }
        let snapshot = Arc::new(ConfigSnapshot {
            node: node_id.clone(),
            retry: retry_override.cloned().unwrap_or_else(|| self.default_retry.clone()),
            observer: self.span_observer.clone(),
            generation: self.generation(),
        });
        let _ = self
            .snapshots
            .lock()
            .insert(node_id.clone(), snapshot.clone());
        snapshot
    }
}

/// An immutable capture of a node's resolved configuration, taken at node
/// entry and held constant for the duration of the invocation.
pub struct ConfigSnapshot {
    /// The node this snapshot belongs to.
    pub node: NodeId,
    /// The resolved retry policy for the node.
    pub retry: Arc<RetryPolicy>,
    /// The observer identity captured at entry.
    pub observer: Arc<dyn SpanObserver>,
    generation: u64,
}

impl ConfigSnapshot {
    /// Asserts the context configuration has not changed under this
    /// snapshot. Compiled out in release builds for zero overhead.
    #[inline]
    pub fn debug_validate(&self, ctx: &ExecutionContext) {
        #[cfg(debug_assertions)]
        {
            debug_assert_eq!(
                self.generation,
                ctx.generation(),
                "configuration mutated during node `{}` execution; \
                 reconfigure only between runs",
                self.node
            );
            debug_assert!(
                Arc::ptr_eq(&self.observer, ctx.span_observer()),
                "span observer replaced during node `{}` execution",
                self.node
            );
        }
        #[cfg(not(debug_assertions))]
        {
            let _ = ctx;
        }
    }
}

/// The per-node view of the execution context handed to node bodies.
#[derive(Clone)]
pub struct NodeContext {
    node_id: NodeId,
    ctx: Arc<ExecutionContext>,
    metrics: Arc<NodeMetrics>,
}

impl NodeContext {
    /// Creates the context view for one node.
    #[must_use]
    pub fn new(node_id: NodeId, ctx: Arc<ExecutionContext>) -> Self {
        let metrics = ctx.metrics().node(node_id.clone());
        Self {
            node_id,
            ctx,
            metrics,
        }
    }

    /// The id of this node.
    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// The shared run context.
    #[must_use]
    pub fn run(&self) -> &Arc<ExecutionContext> {
        &self.ctx
    }

    /// This node's metric set.
    #[must_use]
    pub fn metrics(&self) -> &Arc<NodeMetrics> {
        &self.metrics
    }

    /// Reads one run parameter.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.ctx.parameters().get(key)
    }

    /// Returns `true` once the run's cancellation signal fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.ctx.cancellation().is_cancelled()
    }

    /// Resolves when the run's cancellation signal fires.
    pub async fn cancelled(&self) {
        self.ctx.cancellation().cancelled().await;
    }

    /// Builds the cancellation error for this node.
    #[must_use]
    pub fn cancellation_error(&self) -> Error {
        Error::cancelled(self.node_id.clone(), "run cancelled")
    }

    /// Saves a checkpoint for this node, keyed within the pipeline.
    ///
    /// # Errors
    ///
    /// Returns a [`Error::CheckpointError`] when the store rejects the write.
    pub async fn save_checkpoint(
        &self,
        key: CheckpointKey,
        value: Value,
        blob: Option<Vec<u8>>,
    ) -> Result<(), Error> {
        self.ctx
            .checkpoints()
            .save(
                self.ctx.pipeline_id().clone(),
                self.node_id.clone(),
                key,
                value,
                blob,
            )
            .await
    }

    /// Loads this node's checkpoint for the given key, if present.
    ///
    /// # Errors
    ///
    /// Returns a [`Error::CheckpointError`] when the store cannot be read.
    pub async fn load_checkpoint(
        &self,
        key: &CheckpointKey,
    ) -> Result<Option<CheckpointRecord>, Error> {
        self.ctx
            .checkpoints()
            .load(self.ctx.pipeline_id(), &self.node_id, key)
            .await
    }
}
