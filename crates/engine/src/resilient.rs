// SPDX-License-Identifier: Apache-2.0

//! Resilient execution wrapper.
//!
//! Wraps a node's work with retry (per the node's delay strategy), an
//! optional circuit breaker and optional deadletter routing. Transforms
//! and filters are wrapped per item; sources and sinks are wrapped around
//! their whole `emit`/`drain` invocation.
//!
//! Retry only happens when attempts remain AND the policy's predicate
//! classifies the error as retryable. Cancellation is never masked: a
//! cancellation observed during a retry sleep terminates immediately.

use crate::backoff::{Backoff, CustomBackoff, DelayStrategy};
use crate::breaker::{BreakerOptions, CircuitBreaker};
use crate::context::{ExecutionContext, NodeContext};
use crate::error::{Error, ErrorKind};
use crate::node::Item;
use async_trait::async_trait;
use parking_lot::Mutex;
use rill_config::NodeId;
use rill_config::retry::RetryOptions;
use rill_telemetry::{NodeMetrics, SpanInfo, SpanStatus};
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

/// Predicate deciding whether an error is worth retrying.
pub type RetryPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// The full retry policy of a node: serializable options plus the runtime
/// pieces (predicate, custom backoff, breaker) that cannot live in config.
#[derive(Clone)]
pub struct RetryPolicy {
    /// The serializable retry options.
    pub options: RetryOptions,
    /// Overrides the options' backoff shape with a user function.
    pub custom_backoff: Option<CustomBackoff>,
    /// Classifies errors as retryable. Defaults to "transient errors only".
    pub retryable: Option<RetryPredicate>,
    /// Enables a circuit breaker with the given options.
    pub breaker: Option<BreakerOptions>,
    /// Seeds the jitter RNG for reproducible delay sequences.
    pub seed: Option<u64>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("options", &self.options)
            .field("breaker", &self.breaker)
            .field("seed", &self.seed)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            options: RetryOptions::default(),
            custom_backoff: None,
            retryable: None,
            breaker: None,
            seed: None,
        }
    }
}

impl RetryPolicy {
    /// Builds a policy from serializable options.
    #[must_use]
    pub fn from_options(options: RetryOptions) -> Self {
        Self {
            options,
            ..Default::default()
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::from_options(RetryOptions {
            max_attempts: 1,
            ..Default::default()
        })
    }

    /// Sets the retryable-error predicate.
    #[must_use]
    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&Error) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retryable = Some(Arc::new(predicate));
        self
    }

    /// Replaces the backoff shape with a user function.
    #[must_use]
    pub fn with_custom_backoff(mut self, backoff: CustomBackoff) -> Self {
        self.custom_backoff = Some(backoff);
        self
    }

    /// Enables a circuit breaker.
    #[must_use]
    pub fn with_breaker(mut self, options: BreakerOptions) -> Self {
        self.breaker = Some(options);
        self
    }

    /// Seeds the jitter RNG.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Whether the given error should be retried under this policy.
    #[must_use]
    pub fn is_retryable(&self, error: &Error) -> bool {
        match &self.retryable {
            Some(predicate) => predicate(error),
            None => error.kind() == ErrorKind::Transient,
        }
    }

    /// Instantiates the per-node-per-run delay strategy.
    #[must_use]
    pub fn strategy(&self) -> DelayStrategy {
        match &self.custom_backoff {
            Some(custom) => DelayStrategy::compose(
                Backoff::Custom(custom.clone()),
                self.options.jitter.into(),
                self.seed,
            ),
            None => DelayStrategy::new(&self.options, self.seed),
        }
    }
}

/// Whether deadletter delivery blocks the failing node until confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeadletterMode {
    /// Await delivery before continuing; preserves at-least-once
    /// semantics end-to-end.
    #[default]
    Synchronous,
    /// Spawn delivery and continue immediately; failures are logged.
    FireAndForget,
}

/// The envelope routed to a deadletter sink after retries are exhausted.
pub struct DeadletterEnvelope {
    /// The node that gave up on the item.
    pub node: NodeId,
    /// Classification of the final failure.
    pub error_kind: ErrorKind,
    /// Rendered message of the final failure, including its cause chain.
    pub message: String,
    /// The original input item.
    pub item: Box<dyn Any + Send>,
    /// The type name of the original input item.
    pub item_type: &'static str,
    /// How many attempts were made before giving up.
    pub attempts: u32,
    /// When the item was given up on.
    pub timestamp: SystemTime,
    /// The correlation id of the run.
    pub correlation_id: String,
}

impl std::fmt::Debug for DeadletterEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadletterEnvelope")
            .field("node", &self.node)
            .field("error_kind", &self.error_kind)
            .field("message", &self.message)
            .field("item_type", &self.item_type)
            .field("attempts", &self.attempts)
            .field("correlation_id", &self.correlation_id)
            .finish_non_exhaustive()
    }
}

impl DeadletterEnvelope {
    /// Borrows the original item as `T`, when the types match.
    #[must_use]
    pub fn item_as<T: 'static>(&self) -> Option<&T> {
        self.item.downcast_ref::<T>()
    }

    /// Recovers the original item as `T`, when the types match.
    ///
    /// # Errors
    ///
    /// Returns the envelope unchanged when the item is not a `T`.
    pub fn into_item<T: 'static>(mut self) -> Result<T, Box<Self>> {
        match self.item.downcast::<T>() {
            Ok(item) => Ok(*item),
            Err(item) => {
                self.item = item;
                Err(Box::new(self))
            }
        }
    }
}

/// Terminal destination for items that cannot be processed after retries.
#[async_trait]
pub trait DeadletterSink: Send + Sync {
    /// Accepts one deadletter envelope.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] when the envelope cannot be accepted; in
    /// synchronous mode this fails the originating node.
    async fn deliver(&self, envelope: DeadletterEnvelope) -> Result<(), Error>;
}

/// The outcome of a resiliently executed per-item operation.
#[derive(Debug)]
pub enum ItemOutcome<T> {
    /// The operation produced a value.
    Done(T),
    /// Retries were exhausted and the item was routed to the deadletter
    /// destination; the pipeline continues without it.
    Deadlettered,
}

/// Wraps a node's operations with retry, circuit breaking and deadletter
/// routing. One instance exists per node per run.
pub struct ResilientExecutor {
    node: NodeId,
    ctx: Arc<ExecutionContext>,
    policy: Arc<RetryPolicy>,
    strategy: Mutex<DelayStrategy>,
    breaker: Option<CircuitBreaker>,
    metrics: Arc<NodeMetrics>,
}

impl std::fmt::Debug for ResilientExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientExecutor")
            .field("node", &self.node)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ResilientExecutor {
    /// Creates the executor for a node, resolving its retry policy from
    /// the context snapshot (node override first, run default otherwise).
    #[must_use]
    pub fn new(node_ctx: &NodeContext, retry_override: Option<Arc<RetryPolicy>>) -> Self {
        let ctx = node_ctx.run().clone();
        let snapshot = ctx.snapshot(node_ctx.node_id(), retry_override.as_ref());
        snapshot.debug_validate(&ctx);
        let policy = snapshot.retry.clone();
        let metrics = node_ctx.metrics().clone();
        let breaker = policy.breaker.clone().map(|options| {
            CircuitBreaker::new(node_ctx.node_id().clone(), options, metrics.clone())
        });

        Self {
            node: node_ctx.node_id().clone(),
            ctx,
            strategy: Mutex::new(policy.strategy()),
            policy,
            breaker,
            metrics,
        }
    }

    /// The maximum number of attempts for one invocation.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.policy.options.max_attempts.max(1)
    }

    /// The breaker attached to this node, when configured.
    #[must_use]
    pub fn breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_ref()
    }

    /// Executes one per-item operation with the full resilience stack.
    ///
    /// The item is cloned per attempt; the last clone feeds the
    /// deadletter envelope when retries are exhausted.
    ///
    /// # Errors
    ///
    /// Returns the enriched terminal error when the item cannot be
    /// processed and no deadletter route is configured, or a cancellation
    /// error when the run is cancelled mid-retry.
    pub async fn execute_item<I, T, F, Fut>(&self, item: I, op: F) -> Result<ItemOutcome<T>, Error>
    where
        I: Item,
        F: Fn(I, u32) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let max = self.max_attempts();
        let mut attempt = 1u32;
        loop {
            if self.ctx.cancellation().is_cancelled() {
                return Err(Error::cancelled(self.node.clone(), "run cancelled"));
            }

            let gate_error = match &self.breaker {
                Some(breaker) => breaker.try_acquire().err(),
                None => None,
            };

            let error = match gate_error {
                Some(gate) => gate,
                None => {
                    let (span, started) = self.span_begin(attempt);
                    let result = op(item.clone(), attempt).await;
                    self.span_end(&span, started, result.as_ref().err());
                    match result {
                        Ok(value) => {
                            if let Some(breaker) = &self.breaker {
                                breaker.record_success();
                            }
                            return Ok(ItemOutcome::Done(value));
                        }
                        Err(e) if e.is_cancellation() => return Err(e),
                        Err(e) => {
                            self.metrics.errors.inc();
                            if let Some(breaker) = &self.breaker {
                                breaker.record_failure();
                            }
                            e
                        }
                    }
                }
            };

            if attempt < max && self.policy.is_retryable(&error) {
                self.metrics.retries.inc();
                log::debug!(
                    "Node {} attempt {attempt} failed, retrying: {error}",
                    self.node
                );
                self.backoff_sleep(attempt).await?;
                attempt += 1;
                continue;
            }

            return self.exhaust(item, attempt, error).await;
        }
    }

    /// Whether the given error warrants another attempt after `attempt`.
    #[must_use]
    pub fn should_retry(&self, error: &Error, attempt: u32) -> bool {
        attempt < self.max_attempts() && !error.is_cancellation() && self.policy.is_retryable(error)
    }

    /// Sleeps the delay before retry number `retry`, observing
    /// cancellation.
    ///
    /// # Errors
    ///
    /// Returns a cancellation error when the run is cancelled during the
    /// sleep; retry loops must not mask it.
    pub async fn backoff_sleep(&self, retry: u32) -> Result<(), Error> {
        let delay = { self.strategy.lock().delay_for(retry) };
        tokio::select! {
            () = tokio::time::sleep(delay) => Ok(()),
            () = self.ctx.cancellation().cancelled() => Err(Error::cancelled(
                self.node.clone(),
                "run cancelled during retry backoff",
            )),
        }
    }

    /// Records the retry counter. Used by whole-invocation wrappers.
    pub fn count_retry(&self) {
        self.metrics.retries.inc();
    }

    /// Records an error against the node's metrics.
    pub fn count_error(&self) {
        self.metrics.errors.inc();
    }

    /// Enriches a terminal error with its execution coordinates.
    #[must_use]
    pub fn enrich(&self, attempt: u32, error: Error) -> Error {
        match error {
            already @ Error::NodeFailed { .. } => already,
            other => Error::NodeFailed {
                node: self.node.clone(),
                attempt,
                correlation_id: self.ctx.correlation_id().to_owned(),
                source: Box::new(other),
            },
        }
    }

    /// Emits the span begin hook for one attempt.
    #[must_use]
    pub fn span_begin(&self, attempt: u32) -> (SpanInfo, Instant) {
        let span = SpanInfo {
            node_id: self.node.clone(),
            attempt,
            input_summary: "".into(),
        };
        self.ctx.span_observer().on_begin(&span);
        (span, Instant::now())
    }

    /// Emits the span end hook for one attempt.
    pub fn span_end(&self, span: &SpanInfo, started: Instant, error: Option<&Error>) {
        let status = match error {
            None => SpanStatus::Success,
            Some(e) if e.is_cancellation() => SpanStatus::Cancelled,
            Some(_) => SpanStatus::Failed,
        };
        self.ctx.span_observer().on_end(
            span,
            status,
            started.elapsed(),
            error.map(Error::variant_name),
        );
    }

    async fn exhaust<I: Item, T>(
        &self,
        item: I,
        attempt: u32,
        error: Error,
    ) -> Result<ItemOutcome<T>, Error> {
        let Some(route) = self.ctx.deadletter().cloned() else {
            log::error!(
                "Node {} exhausted {attempt} attempt(s), failing: {error}",
                self.node
            );
            return Err(self.enrich(attempt, error));
        };

        let envelope = DeadletterEnvelope {
            node: self.node.clone(),
            error_kind: error.kind(),
            message: error.to_string(),
            item: Box::new(item),
            item_type: std::any::type_name::<I>(),
            attempts: attempt,
            timestamp: SystemTime::now(),
            correlation_id: self.ctx.correlation_id().to_owned(),
        };
        log::warn!(
            "Node {} exhausted {attempt} attempt(s), routing item to deadletter: {error}",
            self.node
        );

        match route.mode {
            DeadletterMode::Synchronous => {
                route
                    .sink
                    .deliver(envelope)
                    .await
                    .map_err(|e| Error::DeadletterError {
                        node: self.node.clone(),
                        error: e.to_string(),
                    })?;
            }
            DeadletterMode::FireAndForget => {
                let node = self.node.clone();
                let _handle = tokio::spawn(async move {
                    if let Err(e) = route.sink.deliver(envelope).await {
                        log::error!("Deadletter delivery failed for node {node}: {e}");
                    }
                });
            }
        }
        self.metrics.deadletters.inc();
        Ok(ItemOutcome::Deadlettered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunConfig;
    use rill_config::retry::{BackoffKind, JitterKind};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast_options(max_attempts: u32) -> RetryOptions {
        RetryOptions {
            max_attempts,
            backoff: BackoffKind::Fixed {
                delay: Duration::from_millis(1),
            },
            jitter: JitterKind::None,
        }
    }

    fn executor(policy: RetryPolicy) -> (ResilientExecutor, NodeContext) {
        let ctx = RunConfig::new().into_context("p".into());
        let node_ctx = NodeContext::new("map".into(), ctx);
        let exec = ResilientExecutor::new(&node_ctx, Some(Arc::new(policy)));
        (exec, node_ctx)
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let (exec, node_ctx) = executor(RetryPolicy::from_options(fast_options(3)));
        let calls = AtomicU32::new(0);

        let outcome = exec
            .execute_item(7u32, |item, _attempt| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::transient("map".into(), "flaky"))
                    } else {
                        Ok(item * 2)
                    }
                }
            })
            .await
            .unwrap();

        assert!(matches!(outcome, ItemOutcome::Done(14)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(node_ctx.metrics().retries.get(), 2);
    }

    #[tokio::test]
    async fn test_retry_bound_is_max_attempts() {
        let (exec, _node_ctx) = executor(RetryPolicy::from_options(fast_options(3)));
        let calls = AtomicU32::new(0);

        let result: Result<ItemOutcome<u32>, Error> = exec
            .execute_item(1u32, |_item, _attempt| {
                let _ = calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(Error::transient("map".into(), "always")) }
            })
            .await;

        assert!(result.is_err());
        // No item is attempted more than max_attempts times.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let (exec, node_ctx) = executor(RetryPolicy::from_options(fast_options(5)));
        let calls = AtomicU32::new(0);

        let result: Result<ItemOutcome<u32>, Error> = exec
            .execute_item(1u32, |_item, _attempt| {
                let _ = calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(Error::permanent("map".into(), "bad record")) }
            })
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err, Error::NodeFailed { attempt: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(node_ctx.metrics().retries.get(), 0);
    }

    #[tokio::test]
    async fn test_custom_predicate_overrides_kind() {
        let policy = RetryPolicy::from_options(fast_options(2)).with_predicate(|_| true);
        let (exec, _node_ctx) = executor(policy);
        let calls = AtomicU32::new(0);

        let result: Result<ItemOutcome<u32>, Error> = exec
            .execute_item(1u32, |_item, _attempt| {
                let _ = calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(Error::permanent("map".into(), "retried anyway")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    struct CollectingDeadletter {
        envelopes: Mutex<Vec<DeadletterEnvelope>>,
    }

    #[async_trait]
    impl DeadletterSink for CollectingDeadletter {
        async fn deliver(&self, envelope: DeadletterEnvelope) -> Result<(), Error> {
            self.envelopes.lock().push(envelope);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_exhausted_item_routes_to_deadletter() {
        let sink = Arc::new(CollectingDeadletter {
            envelopes: Mutex::new(Vec::new()),
        });
        let ctx = RunConfig::new()
            .with_deadletter(sink.clone(), DeadletterMode::Synchronous)
            .into_context("p".into());
        let node_ctx = NodeContext::new("map".into(), ctx);
        let exec = ResilientExecutor::new(
            &node_ctx,
            Some(Arc::new(RetryPolicy::from_options(fast_options(2)))),
        );

        let outcome: ItemOutcome<u32> = exec
            .execute_item(35u32, |_item, _attempt| async move {
                Err(Error::transient("map".into(), "poison item"))
            })
            .await
            .unwrap();

        assert!(matches!(outcome, ItemOutcome::Deadlettered));
        let envelopes = sink.envelopes.lock();
        assert_eq!(envelopes.len(), 1);
        let envelope = &envelopes[0];
        assert_eq!(envelope.node.as_ref(), "map");
        assert_eq!(envelope.attempts, 2);
        assert!(!envelope.message.is_empty());
        assert_eq!(envelope.item_as::<u32>(), Some(&35));
        assert_eq!(node_ctx.metrics().deadletters.get(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_during_backoff_terminates_immediately() {
        let ctx = RunConfig::new().into_context("p".into());
        let token = ctx.cancellation().clone();
        let node_ctx = NodeContext::new("map".into(), ctx);
        let slow = RetryPolicy::from_options(RetryOptions {
            max_attempts: 3,
            backoff: BackoffKind::Fixed {
                delay: Duration::from_secs(60),
            },
            jitter: JitterKind::None,
        });
        let exec = Arc::new(ResilientExecutor::new(&node_ctx, Some(Arc::new(slow))));

        let task = tokio::spawn({
            let exec = exec.clone();
            async move {
                exec.execute_item(1u32, |_item, _attempt| async move {
                    Err::<u32, _>(Error::transient("map".into(), "flaky"))
                })
                .await
            }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_millis(100), task)
            .await
            .expect("cancellation must not be masked by the retry sleep")
            .unwrap();
        assert!(result.unwrap_err().is_cancellation());
    }

    #[tokio::test]
    async fn test_breaker_fast_fails_after_threshold() {
        let policy = RetryPolicy::from_options(fast_options(1)).with_breaker(BreakerOptions {
            failure_threshold: 2,
            open_duration: Duration::from_secs(60),
            half_open_probes: 1,
        });
        let sink = Arc::new(CollectingDeadletter {
            envelopes: Mutex::new(Vec::new()),
        });
        let ctx = RunConfig::new()
            .with_deadletter(sink.clone(), DeadletterMode::Synchronous)
            .into_context("p".into());
        let node_ctx = NodeContext::new("map".into(), ctx);
        let exec = ResilientExecutor::new(&node_ctx, Some(Arc::new(policy)));
        let calls = AtomicU32::new(0);

        for i in 0..5u32 {
            let outcome: ItemOutcome<u32> = exec
                .execute_item(i, |_item, _attempt| {
                    let _ = calls.fetch_add(1, Ordering::SeqCst);
                    async move { Err(Error::transient("map".into(), "down")) }
                })
                .await
                .unwrap();
            assert!(matches!(outcome, ItemOutcome::Deadlettered));
        }

        // Only the first two items reached the node; the rest fast-failed.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let kinds: Vec<_> = sink
            .envelopes
            .lock()
            .iter()
            .map(|e| e.error_kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                ErrorKind::Transient,
                ErrorKind::Transient,
                ErrorKind::CircuitOpen,
                ErrorKind::CircuitOpen,
                ErrorKind::CircuitOpen,
            ]
        );
    }
}
