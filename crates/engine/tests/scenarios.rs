// SPDX-License-Identifier: Apache-2.0

//! End-to-end pipeline scenarios: ordering, retry, deadletter,
//! cancellation, backpressure, drop policies and circuit breaking.

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use rill_config::parallel::{ParallelOptions, QueuePolicy};
use rill_config::retry::{BackoffKind, JitterKind, RetryOptions};
use rill_engine::breaker::BreakerOptions;
use rill_engine::context::{NodeContext, RunConfig};
use rill_engine::error::Error;
use rill_engine::graph::GraphBuilder;
use rill_engine::node::{MergePolicy, Transform};
use rill_engine::resilient::{DeadletterMode, RetryPolicy};
use rill_engine::runner::{RunOutcome, run};
use rill_engine::testing::{
    CollectingDeadletter, CollectingSink, EvenFilter, FlakyTransform, PoisonTransform,
    RangeSource, ScaleTransform, SlowSink, TickingSource,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::from_options(RetryOptions {
        max_attempts,
        backoff: BackoffKind::Exponential {
            base: Duration::from_millis(1),
            multiplier: 2.0,
            max: Duration::from_millis(10),
        },
        jitter: JitterKind::None,
    })
}

/// Scenario: ordered parallel map. Source emits 0..10000, the transform
/// doubles across 8 workers with ordering preserved, the sink must see
/// the exact doubled sequence.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ordered_parallel_map_preserves_sequence() {
    const N: u64 = 10_000;
    let mut builder = GraphBuilder::new("ordered-map");
    let src = builder.add_source("src", RangeSource::new(0..N));
    let map = builder.add_transform("map", ScaleTransform::new(2));
    let (sink, collected) = CollectingSink::new();
    let out = builder.add_sink("out", sink);
    builder.connect(&src, &map);
    builder.connect(&map, &out);
    builder.with_parallelism(
        &map,
        ParallelOptions {
            max_parallelism: 8,
            preserve_ordering: true,
            ..Default::default()
        },
    );

    let report = run(builder.build().unwrap(), RunConfig::new()).await.unwrap();

    assert!(report.is_success(), "outcome: {:?}", report.outcome);
    let items = collected.lock();
    let expected: Vec<u64> = (0..N).map(|v| v * 2).collect();
    assert_eq!(*items, expected);
    assert_eq!(report.node("out").unwrap().items_in, N);
    assert_eq!(report.node("map").unwrap().items_out, N);
}

/// Scenario: retry to success. Every third item fails twice with a
/// transient error, then succeeds; with three attempts every input makes
/// it through and the retry counter is exact.
#[tokio::test]
async fn retry_to_success_recovers_every_item() {
    const N: u64 = 300;
    let mut builder = GraphBuilder::new("retry");
    let src = builder.add_source("src", RangeSource::new(0..N));
    let map = builder.add_transform("map", FlakyTransform::new(2, |v| v % 3 == 0));
    let (sink, collected) = CollectingSink::new();
    let out = builder.add_sink("out", sink);
    builder.connect(&src, &map);
    builder.connect(&map, &out);
    builder.with_retry(&map, fast_retry(3));

    let report = run(builder.build().unwrap(), RunConfig::new()).await.unwrap();

    assert!(report.is_success(), "outcome: {:?}", report.outcome);
    let items = collected.lock();
    let expected: Vec<u64> = (0..N).collect();
    assert_eq!(*items, expected);
    // ceil(N / 3) items fail twice each before succeeding.
    assert_eq!(report.node("map").unwrap().retries, N.div_ceil(3) * 2);
}

/// Scenario: deadletter on exhaustion. Items divisible by 5 always fail;
/// with deadletter configured the pipeline continues and every poison
/// item arrives in the deadletter sink with a full envelope.
#[tokio::test]
async fn deadletter_receives_exhausted_items() {
    const N: u64 = 100;
    let (dlq, envelopes) = CollectingDeadletter::new();

    let mut builder = GraphBuilder::new("deadletter");
    let src = builder.add_source("src", RangeSource::new(0..N));
    let map = builder.add_transform("poison", PoisonTransform::new(5));
    let (sink, collected) = CollectingSink::new();
    let out = builder.add_sink("out", sink);
    builder.connect(&src, &map);
    builder.connect(&map, &out);
    builder.with_retry(&map, fast_retry(2));

    let config = RunConfig::new().with_deadletter(dlq, DeadletterMode::Synchronous);
    let report = run(builder.build().unwrap(), config).await.unwrap();

    assert!(report.is_success(), "outcome: {:?}", report.outcome);
    let items = collected.lock();
    let expected: Vec<u64> = (0..N).filter(|v| v % 5 != 0).collect();
    assert_eq!(*items, expected, "survivors arrive in order");

    let envelopes = envelopes.lock();
    assert_eq!(envelopes.len(), 20);
    for envelope in envelopes.iter() {
        assert_eq!(envelope.node.as_ref(), "poison");
        assert!(!envelope.message.is_empty());
        assert_eq!(envelope.attempts, 2);
        assert_eq!(envelope.item_as::<u64>().map(|v| v % 5), Some(0));
        assert!(!envelope.correlation_id.is_empty());
    }
    assert_eq!(report.node("poison").unwrap().deadletters, 20);
}

/// Scenario: without a deadletter route, an exhausted item fails the
/// pipeline and the report carries the enriched error.
#[tokio::test]
async fn exhausted_item_without_deadletter_fails_run() {
    let mut builder = GraphBuilder::new("fail");
    let src = builder.add_source("src", RangeSource::new(0..10));
    let map = builder.add_transform("poison", PoisonTransform::new(5));
    let (sink, _collected) = CollectingSink::new();
    let out = builder.add_sink("out", sink);
    builder.connect(&src, &map);
    builder.connect(&map, &out);
    builder.with_retry(&map, fast_retry(2));

    let report = run(builder.build().unwrap(), RunConfig::new()).await.unwrap();

    let error = report.outcome.error().expect("run must fail");
    assert!(matches!(error, Error::NodeFailed { attempt: 2, .. }));
    assert_eq!(error.node().map(AsRef::as_ref), Some("poison"));
    assert_eq!(&report.correlation_id, {
        let Error::NodeFailed { correlation_id, .. } = error else {
            panic!("expected NodeFailed")
        };
        correlation_id
    });
}

/// Scenario: cancellation mid-run. An infinite source feeds a slow
/// transform; cancelling the external token ends the run promptly and
/// reports a cancelled outcome.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_terminates_promptly() {
    let mut builder = GraphBuilder::new("cancel");
    let src = builder.add_source("src", TickingSource::new(Duration::from_millis(1)));
    let map = builder.add_transform(
        "slow",
        ScaleTransform::slow(1, Duration::from_millis(10)),
    );
    let (sink, _collected) = CollectingSink::new();
    let out = builder.add_sink("out", sink);
    builder.connect_with_capacity(&src, &map, 8);
    builder.connect_with_capacity(&map, &out, 8);

    let token = CancellationToken::new();
    let config = RunConfig::new().with_cancellation(token.clone());
    let handle = tokio::spawn(run(builder.build().unwrap(), config));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let cancelled_at = Instant::now();
    token.cancel();

    let report = tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("run must end promptly after cancellation")
        .unwrap()
        .unwrap();
    assert!(cancelled_at.elapsed() < Duration::from_millis(500));
    assert!(
        matches!(report.outcome, RunOutcome::Cancelled { timed_out: None }),
        "outcome: {:?}",
        report.outcome
    );
}

/// Scenario: a run deadline cancels the root and reports a timeout.
#[tokio::test]
async fn deadline_reports_timeout() {
    let mut builder = GraphBuilder::new("timeout");
    let src = builder.add_source("src", TickingSource::new(Duration::from_millis(1)));
    let (sink, _collected) = CollectingSink::new();
    let out = builder.add_sink("out", sink);
    builder.connect(&src, &out);

    let config = RunConfig::new().with_deadline(Duration::from_millis(50));
    let report = tokio::time::timeout(Duration::from_secs(2), run(builder.build().unwrap(), config))
        .await
        .expect("deadline must end the run")
        .unwrap();

    assert!(
        matches!(
            report.outcome,
            RunOutcome::Cancelled {
                timed_out: Some(d)
            } if d == Duration::from_millis(50)
        ),
        "outcome: {:?}",
        report.outcome
    );
}

/// Scenario: backpressure. A fast source against a slow sequential
/// transform over a capacity-16 pipe: nothing is dropped, the sink sees
/// everything in order, and the transform's input never exceeds the pipe
/// bound.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn backpressure_bounds_buffering_without_loss() {
    const N: u64 = 2_000;
    let mut builder = GraphBuilder::new("backpressure");
    let src = builder.add_source("src", RangeSource::new(0..N));
    let map = builder.add_transform(
        "slow",
        ScaleTransform::slow(1, Duration::from_micros(100)),
    );
    let (sink, collected) = CollectingSink::new();
    let out = builder.add_sink("out", sink);
    builder.connect_with_capacity(&src, &map, 16);
    builder.connect(&map, &out);

    let report = run(builder.build().unwrap(), RunConfig::new()).await.unwrap();

    assert!(report.is_success(), "outcome: {:?}", report.outcome);
    let items = collected.lock();
    let expected: Vec<u64> = (0..N).collect();
    assert_eq!(*items, expected);

    let slow = report.node("slow").unwrap();
    assert_eq!(slow.drops, 0);
    assert!(
        slow.queue_depth_peak <= 16,
        "peak queue depth {} exceeds the pipe bound",
        slow.queue_depth_peak
    );
    // The fast source had to wait on the bounded pipe.
    assert!(report.node("src").unwrap().send_wait_time > Duration::ZERO);
}

/// Scenario: drop-newest under load. The worker queue is full most of the
/// time, so some items are discarded; the sink count plus the drop
/// counter accounts for every emitted item, and no ordering is asserted.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn drop_newest_accounts_for_every_item() {
    const N: u64 = 1_000;
    let mut builder = GraphBuilder::new("drop-newest");
    let src = builder.add_source("src", RangeSource::new(0..N));
    let map = builder.add_transform(
        "lossy",
        ScaleTransform::slow(1, Duration::from_millis(1)),
    );
    let (sink, collected) = CollectingSink::new();
    let out = builder.add_sink("out", sink);
    builder.connect(&src, &map);
    builder.connect(&map, &out);
    builder.with_parallelism(
        &map,
        ParallelOptions {
            max_parallelism: 2,
            max_queue_length: 16,
            queue_policy: QueuePolicy::DropNewest,
            ..Default::default()
        },
    );

    let report = run(builder.build().unwrap(), RunConfig::new()).await.unwrap();

    assert!(report.is_success(), "outcome: {:?}", report.outcome);
    let received = collected.lock().len() as u64;
    let lossy = report.node("lossy").unwrap();
    assert!(received <= N);
    assert_eq!(lossy.drops, N - received, "drops must account for the gap");
    assert!(lossy.drops > 0, "the slow stage must shed load");
}

/// Scenario: drop-oldest evicts the front of the queue; accounting still
/// holds.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn drop_oldest_accounts_for_every_item() {
    const N: u64 = 1_000;
    let mut builder = GraphBuilder::new("drop-oldest");
    let src = builder.add_source("src", RangeSource::new(0..N));
    let map = builder.add_transform(
        "lossy",
        ScaleTransform::slow(1, Duration::from_millis(1)),
    );
    let (sink, collected) = CollectingSink::new();
    let out = builder.add_sink("out", sink);
    builder.connect(&src, &map);
    builder.connect(&map, &out);
    builder.with_parallelism(
        &map,
        ParallelOptions {
            max_parallelism: 2,
            max_queue_length: 16,
            queue_policy: QueuePolicy::DropOldest,
            ..Default::default()
        },
    );

    let report = run(builder.build().unwrap(), RunConfig::new()).await.unwrap();

    assert!(report.is_success(), "outcome: {:?}", report.outcome);
    let received = collected.lock().len() as u64;
    let lossy = report.node("lossy").unwrap();
    assert_eq!(lossy.drops, N - received);
    assert!(lossy.drops > 0);
}

/// A transform that always fails and counts how often it was actually
/// invoked (breaker fast-fails never reach it).
struct CountingFailure {
    calls: Arc<AtomicU64>,
}

#[async_trait]
impl Transform<u64, u64> for CountingFailure {
    async fn apply(&self, _item: u64, ctx: &NodeContext) -> Result<u64, Error> {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::transient(ctx.node_id().clone(), "dependency down"))
    }
}

/// Scenario: circuit open. After ten consecutive failures the breaker
/// opens and the remaining items fail fast without reaching the node.
#[tokio::test]
async fn circuit_opens_after_threshold_and_fast_fails() {
    const N: u64 = 30;
    let calls = Arc::new(AtomicU64::new(0));
    let (dlq, envelopes) = CollectingDeadletter::new();

    let mut builder = GraphBuilder::new("breaker");
    let src = builder.add_source("src", RangeSource::new(0..N));
    let map = builder.add_transform(
        "down",
        CountingFailure {
            calls: calls.clone(),
        },
    );
    let (sink, collected) = CollectingSink::new();
    let out = builder.add_sink("out", sink);
    builder.connect(&src, &map);
    builder.connect(&map, &out);
    builder.with_retry(
        &map,
        RetryPolicy::no_retry().with_breaker(BreakerOptions {
            failure_threshold: 10,
            open_duration: Duration::from_secs(600),
            half_open_probes: 1,
        }),
    );

    let config = RunConfig::new().with_deadletter(dlq, DeadletterMode::Synchronous);
    let report = run(builder.build().unwrap(), config).await.unwrap();

    assert!(report.is_success(), "outcome: {:?}", report.outcome);
    assert!(collected.lock().is_empty());
    // Items 1..=10 were attempted; 11.. failed fast with circuit_open.
    assert_eq!(calls.load(Ordering::SeqCst), 10);
    assert_eq!(envelopes.lock().len() as u64, N);
    assert!(report.node("down").unwrap().breaker_transitions >= 1);
}

/// A failure inside a parallel worker tears the stage down, fails the
/// run and still lets the scheduler report the originating node.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_worker_failure_fails_run() {
    let mut builder = GraphBuilder::new("parallel-failure");
    let src = builder.add_source("src", RangeSource::new(0..1_000));
    let map = builder.add_transform("poison", PoisonTransform::new(7));
    let (sink, _collected) = CollectingSink::new();
    let out = builder.add_sink("out", sink);
    builder.connect(&src, &map);
    builder.connect(&map, &out);
    builder.with_retry(&map, RetryPolicy::no_retry());
    builder.with_parallelism(&map, ParallelOptions::with_parallelism(4));

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        run(builder.build().unwrap(), RunConfig::new()),
    )
    .await
    .expect("failure must tear the run down promptly")
    .unwrap();

    let error = report.outcome.error().expect("run must fail");
    assert_eq!(error.node().map(AsRef::as_ref), Some("poison"));
}

/// Filters drop items silently; survivors keep their relative order.
#[tokio::test]
async fn filter_discards_silently_and_preserves_order() {
    const N: u64 = 1_000;
    let mut builder = GraphBuilder::new("filter");
    let src = builder.add_source("src", RangeSource::new(0..N));
    let keep = builder.add_filter("even", EvenFilter);
    let (sink, collected) = CollectingSink::new();
    let out = builder.add_sink("out", sink);
    builder.connect(&src, &keep);
    builder.connect(&keep, &out);

    let report = run(builder.build().unwrap(), RunConfig::new()).await.unwrap();

    assert!(report.is_success(), "outcome: {:?}", report.outcome);
    let items = collected.lock();
    let expected: Vec<u64> = (0..N).filter(|v| v % 2 == 0).collect();
    assert_eq!(*items, expected);
    assert_eq!(report.node("even").unwrap().filtered, N / 2);
    assert!(report.node("even").unwrap().errors == 0);
}

/// A merge folds two sources into one sink; every item from both inputs
/// arrives exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn merge_interleaves_all_inputs() {
    let mut builder = GraphBuilder::new("merge");
    let a = builder.add_source("a", RangeSource::new(0..500));
    let b = builder.add_source("b", RangeSource::new(500..1_000));
    let merge = builder.add_merge("merge", MergePolicy::<u64>::Interleave);
    let (sink, collected) = CollectingSink::new();
    let out = builder.add_sink("out", sink);
    builder.connect(&a, &merge);
    builder.connect(&b, &merge);
    builder.connect(&merge, &out);

    let report = run(builder.build().unwrap(), RunConfig::new()).await.unwrap();

    assert!(report.is_success(), "outcome: {:?}", report.outcome);
    let mut items = collected.lock().clone();
    items.sort_unstable();
    let expected: Vec<u64> = (0..1_000).collect();
    assert_eq!(items, expected, "exactly-once across merged inputs");
}

/// Fan-out duplicates every item to both downstream branches.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fan_out_delivers_to_every_branch() {
    const N: u64 = 200;
    let mut builder = GraphBuilder::new("fan-out");
    let src = builder.add_source("src", RangeSource::new(0..N));
    let (sink_a, items_a) = CollectingSink::new();
    let (sink_b, items_b) = CollectingSink::new();
    let out_a = builder.add_sink("out_a", sink_a);
    let out_b = builder.add_sink("out_b", sink_b);
    builder.connect(&src, &out_a);
    builder.connect(&src, &out_b);

    let report = run(builder.build().unwrap(), RunConfig::new()).await.unwrap();

    assert!(report.is_success(), "outcome: {:?}", report.outcome);
    let expected: Vec<u64> = (0..N).collect();
    assert_eq!(*items_a.lock(), expected);
    assert_eq!(*items_b.lock(), expected);
}

/// Exactly-once delivery: without retries and drops, source emission and
/// sink receipt counts agree.
#[tokio::test]
async fn exactly_once_counts_agree() {
    const N: u64 = 5_000;
    let mut builder = GraphBuilder::new("exactly-once");
    let src = builder.add_source("src", RangeSource::new(0..N));
    let map = builder.add_transform("map", ScaleTransform::new(3));
    let (sink, collected) = CollectingSink::new();
    let out = builder.add_sink("out", sink);
    builder.connect(&src, &map);
    builder.connect(&map, &out);

    let report = run(builder.build().unwrap(), RunConfig::new()).await.unwrap();

    assert!(report.is_success(), "outcome: {:?}", report.outcome);
    assert_eq!(collected.lock().len() as u64, N);
    assert_eq!(report.node("src").unwrap().items_out, N);
    assert_eq!(report.node("map").unwrap().items_in, N);
    assert_eq!(report.node("map").unwrap().items_out, N);
    assert_eq!(report.node("out").unwrap().items_in, N);
}

/// A slow sink finishes draining buffered items even while the run is
/// being torn down by upstream completion.
#[tokio::test]
async fn slow_sink_receives_all_buffered_items() {
    const N: u64 = 50;
    let mut builder = GraphBuilder::new("slow-sink");
    let src = builder.add_source("src", RangeSource::new(0..N));
    let (sink, count) = SlowSink::new(Duration::from_millis(1));
    let out = builder.add_sink("out", sink);
    builder.connect_with_capacity(&src, &out, 4);

    let report = run(builder.build().unwrap(), RunConfig::new()).await.unwrap();

    assert!(report.is_success(), "outcome: {:?}", report.outcome);
    assert_eq!(*count.lock(), N);
}
