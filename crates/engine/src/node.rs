// SPDX-License-Identifier: Apache-2.0

//! Node contracts and the endpoints handed to node bodies.
//!
//! Five node shapes exist: sources produce items, transforms map them,
//! filters keep or drop them, merges fold several inputs into one output,
//! sinks consume them. Each shape is a single-method contract taking the
//! node context and its input/output endpoints; the runtime owns pipe
//! wiring, retries, parallelism and lifecycle.
//!
//! # Thread safety
//!
//! Transforms and filters require `Send + Sync` and take `&self`: the
//! parallel engine calls them concurrently from several workers, so
//! per-item state needs interior mutability. Sources and sinks run in a
//! single task each and keep the more convenient `&mut self`.

use crate::context::NodeContext;
use crate::error::Error;
use async_trait::async_trait;
use rill_channel::{FailCause, PipeReceiver, PipeSender, RecvError, SendError};
use rill_config::NodeId;
use rill_telemetry::NodeMetrics;
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Marker for types that can flow through a pipeline.
///
/// `Clone` is required for fan-out and for keeping a copy across retry
/// attempts and deadletter envelopes.
pub trait Item: Clone + Send + 'static {}

impl<T: Clone + Send + 'static> Item for T {}

/// The outcome of a non-blocking read from an [`ItemStream`].
#[derive(Debug)]
pub enum TryNext<T> {
    /// An item was available.
    Item(T),
    /// No item is buffered yet; the stream is still open.
    Empty,
    /// The stream ended gracefully.
    Closed,
}

/// The outcome of probing a transform's synchronous fast path.
pub enum SyncOutcome<In, Out> {
    /// The transform completed synchronously without allocation.
    Ready(Result<Out, Error>),
    /// The transform needs the async path; the item is handed back.
    Pending(In),
}

/// A producer of items.
#[async_trait]
pub trait Source<T: Item>: Send {
    /// Called once before `emit`.
    async fn on_start(&mut self, _ctx: &NodeContext) -> Result<(), Error> {
        Ok(())
    }

    /// Produces the stream of items by pushing into `out`.
    ///
    /// May be finite or infinite. Backpressure and cancellation arrive
    /// through `out`: a send suspends while downstream is full and fails
    /// with a cancellation error once the run is cancelled, so a source
    /// that only emits honors cancellation for free.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] when production fails; transient errors are
    /// retried per the node's retry policy by restarting `emit`.
    async fn emit(&mut self, ctx: &NodeContext, out: &Emitter<T>) -> Result<(), Error>;

    /// Called once after `emit` returns, even on failure.
    async fn on_stop(&mut self, _ctx: &NodeContext) -> Result<(), Error> {
        Ok(())
    }
}

/// A one-in, one-out mapping over items.
#[async_trait]
pub trait Transform<In: Item, Out: Item>: Send + Sync {
    /// Synchronous fast path, probed before [`Self::apply`].
    ///
    /// Pure mappings and cache hits can complete here without allocating
    /// a future. Returning [`SyncOutcome::Pending`] hands the item back
    /// for the async path; a returned result is consumed at most once and
    /// never re-polled.
    fn try_apply_sync(&self, item: In, _ctx: &NodeContext) -> SyncOutcome<In, Out> {
        SyncOutcome::Pending(item)
    }

    /// Maps one item.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`]; the runtime decides between retry, deadletter
    /// routing and failing the node based on the error kind and the
    /// node's retry policy.
    async fn apply(&self, item: In, ctx: &NodeContext) -> Result<Out, Error>;
}

/// A predicate keeping or silently discarding items.
#[async_trait]
pub trait Filter<T: Item>: Send + Sync {
    /// Decides whether to keep `item`. Dropped items are discarded
    /// silently, not treated as errors.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] when the predicate itself fails.
    async fn keep(&self, item: &T, ctx: &NodeContext) -> Result<bool, Error>;
}

/// A terminal consumer of items.
#[async_trait]
pub trait Sink<T: Item>: Send {
    /// Called once before `drain`.
    async fn on_start(&mut self, _ctx: &NodeContext) -> Result<(), Error> {
        Ok(())
    }

    /// Consumes the input stream to completion.
    ///
    /// Must keep reading until [`ItemStream::next`] yields `Ok(None)`, or
    /// return the error it yields.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] when consumption fails.
    async fn drain(&mut self, input: &mut ItemStream<T>, ctx: &NodeContext) -> Result<(), Error>;

    /// Called once after `drain` returns, even on failure.
    async fn on_stop(&mut self, _ctx: &NodeContext) -> Result<(), Error> {
        Ok(())
    }
}

/// Chooses the next input of a merge node.
pub trait MergeSelector<T>: Send + Sync {
    /// Picks among inputs that currently hold a buffered item.
    ///
    /// `ready` contains `(input_index, item)` pairs; the returned value
    /// must be one of the listed input indices.
    fn select(&self, ready: &[(usize, &T)]) -> usize;
}

/// How a merge node folds its inputs into one output.
#[derive(Clone)]
pub enum MergePolicy<T> {
    /// Round-robin over inputs that have items available.
    Interleave,
    /// Always prefer the lowest-numbered input with an item available.
    Prioritized,
    /// A user function picks among ready inputs.
    Custom(Arc<dyn MergeSelector<T>>),
}

impl<T> std::fmt::Debug for MergePolicy<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergePolicy::Interleave => f.write_str("Interleave"),
            MergePolicy::Prioritized => f.write_str("Prioritized"),
            MergePolicy::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// The writing endpoint handed to a node: sends into every outgoing pipe
/// of the node's output port, observing cancellation and recording
/// metrics.
pub struct Emitter<T> {
    node: NodeId,
    senders: SmallVec<[PipeSender<T>; 1]>,
    cancellation: CancellationToken,
    metrics: Arc<NodeMetrics>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            senders: self.senders.clone(),
            cancellation: self.cancellation.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<T: Item> Emitter<T> {
    /// Creates an emitter over the node's outgoing pipe senders.
    #[must_use]
    pub fn new(
        node: NodeId,
        senders: SmallVec<[PipeSender<T>; 1]>,
        cancellation: CancellationToken,
        metrics: Arc<NodeMetrics>,
    ) -> Self {
        Self {
            node,
            senders,
            cancellation,
            metrics,
        }
    }

    /// Sends one item downstream, cloning it across fan-out pipes.
    ///
    /// Suspends while a downstream pipe is full.
    ///
    /// # Errors
    ///
    /// Returns a cancellation error when the run is cancelled while the
    /// send is blocked (the outgoing pipes transition to failed), or a
    /// [`Error::PipeSendError`] when a pipe is closed.
    pub async fn send(&self, item: T) -> Result<(), Error> {
        let Some((last, rest)) = self.senders.split_last() else {
            return Ok(());
        };
        let started = Instant::now();
        for sender in rest {
            self.send_one(sender, item.clone()).await?;
        }
        self.send_one(last, item).await?;
        self.metrics.send_wait_time.add(started.elapsed());
        self.metrics.items_out.inc();
        Ok(())
    }

    async fn send_one(&self, sender: &PipeSender<T>, item: T) -> Result<(), Error> {
        tokio::select! {
            biased;
            res = sender.send(item) => match res {
                Ok(()) => Ok(()),
                Err(SendError::Closed(_)) if self.cancellation.is_cancelled() => {
                    Err(self.cancel_outputs())
                }
                Err(e) => Err(Error::PipeSendError {
                    node: self.node.clone(),
                    error: e.to_string(),
                }),
            },
            _ = self.cancellation.cancelled() => Err(self.cancel_outputs()),
        }
    }

    /// Declares the output stream finished.
    pub fn close(&self) {
        for sender in &self.senders {
            sender.close();
        }
    }

    /// Declares terminal failure on every outgoing pipe.
    pub fn fail(&self, cause: Arc<Error>) {
        for sender in &self.senders {
            sender.fail(cause.clone() as FailCause);
        }
    }

    /// The id of the node that owns this emitter.
    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.node
    }

    fn cancel_outputs(&self) -> Error {
        let err = Error::cancelled(self.node.clone(), "run cancelled during send");
        let cause: FailCause = Arc::new(Error::cancelled(
            self.node.clone(),
            "upstream cancelled",
        ));
        for sender in &self.senders {
            sender.fail(cause.clone());
        }
        err
    }
}

/// The reading endpoint handed to a node: yields the items of one
/// incoming pipe, observing cancellation and recording metrics.
pub struct ItemStream<T> {
    node: NodeId,
    receiver: PipeReceiver<T>,
    cancellation: CancellationToken,
    metrics: Arc<NodeMetrics>,
}

impl<T: Item> ItemStream<T> {
    /// Creates a stream over the node's incoming pipe receiver.
    #[must_use]
    pub fn new(
        node: NodeId,
        receiver: PipeReceiver<T>,
        cancellation: CancellationToken,
        metrics: Arc<NodeMetrics>,
    ) -> Self {
        Self {
            node,
            receiver,
            cancellation,
            metrics,
        }
    }

    /// Yields the next item.
    ///
    /// Returns `Ok(None)` on a graceful end of stream. Buffered items are
    /// drained even when the run is being cancelled, so committed work is
    /// not discarded; the stream only reports cancellation once the pipe
    /// is empty.
    ///
    /// # Errors
    ///
    /// Returns a cancellation error when the run is cancelled while the
    /// stream is idle, or a [`Error::PipeRecvError`] carrying the
    /// upstream failure cause.
    pub async fn next(&mut self) -> Result<Option<T>, Error> {
        // Drain-then-raise: prefer buffered items over the cancel signal.
        match self.receiver.try_recv() {
            Ok(item) => {
                self.record_depth();
                self.metrics.items_in.inc();
                return Ok(Some(item));
            }
            Err(RecvError::Empty) => {}
            Err(other) => return self.terminal(other),
        }

        let started = Instant::now();
        tokio::select! {
            res = self.receiver.recv() => {
                self.metrics.recv_wait_time.add(started.elapsed());
                match res {
                    Ok(item) => {
                        self.record_depth();
                        self.metrics.items_in.inc();
                        Ok(Some(item))
                    }
                    Err(e) => self.terminal(e),
                }
            }
            _ = self.cancellation.cancelled() => {
                self.metrics.recv_wait_time.add(started.elapsed());
                Err(Error::cancelled(self.node.clone(), "run cancelled while awaiting input"))
            }
        }
    }

    /// Non-blocking variant of [`Self::next`], used by merge scheduling.
    ///
    /// # Errors
    ///
    /// Same contract as [`Self::next`], with [`TryNext::Empty`] standing
    /// in for suspension.
    pub fn try_next(&mut self) -> Result<TryNext<T>, Error> {
        match self.receiver.try_recv() {
            Ok(item) => {
                self.record_depth();
                self.metrics.items_in.inc();
                Ok(TryNext::Item(item))
            }
            Err(RecvError::Empty) => Ok(TryNext::Empty),
            Err(other) => match self.terminal(other)? {
                None => Ok(TryNext::Closed),
                Some(_) => Err(Error::InternalError {
                    message: "terminal pipe state yielded an item".to_owned(),
                }),
            },
        }
    }

    /// The id of the node that owns this stream.
    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.node
    }

    fn record_depth(&self) {
        let depth = self.receiver.len() as u64;
        self.metrics.queue_depth.set(depth);
        self.metrics.queue_depth_peak.record_max(depth.saturating_add(1));
    }

    fn terminal(&self, err: RecvError) -> Result<Option<T>, Error> {
        match err {
            RecvError::Closed => Ok(None),
            RecvError::Failed(cause) => {
                if self.cancellation.is_cancelled() {
                    Err(Error::cancelled(
                        self.node.clone(),
                        "upstream cancelled",
                    ))
                } else {
                    Err(Error::PipeRecvError {
                        node: self.node.clone(),
                        error: cause.to_string(),
                    })
                }
            }
            RecvError::Empty => Err(Error::InternalError {
                message: "empty pipe reported as terminal".to_owned(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunConfig;
    use rill_channel::pipe;
    use smallvec::smallvec;

    fn node_parts(name: &'static str) -> (NodeContext, CancellationToken) {
        let ctx = RunConfig::new().into_context("p".into());
        let token = ctx.cancellation().clone();
        (NodeContext::new(name.into(), ctx), token)
    }

    #[tokio::test]
    async fn test_emitter_fans_out_to_all_pipes() {
        let (nctx, token) = node_parts("src");
        let (tx1, rx1) = pipe(4);
        let (tx2, rx2) = pipe(4);
        let emitter = Emitter::new(
            "src".into(),
            smallvec![tx1, tx2],
            token,
            nctx.metrics().clone(),
        );

        emitter.send(7u32).await.unwrap();
        emitter.close();

        assert_eq!(rx1.recv().await.unwrap(), 7);
        assert_eq!(rx2.recv().await.unwrap(), 7);
        assert_eq!(nctx.metrics().items_out.get(), 1);
    }

    #[tokio::test]
    async fn test_emitter_send_observes_cancellation() {
        let (nctx, token) = node_parts("src");
        let (tx, rx) = pipe(1);
        let emitter = Emitter::new("src".into(), smallvec![tx], token.clone(), nctx.metrics().clone());

        emitter.send(1u32).await.unwrap();
        let blocked = tokio::spawn(async move { emitter.send(2).await });
        tokio::task::yield_now().await;
        token.cancel();

        let result = blocked.await.unwrap();
        assert!(result.unwrap_err().is_cancellation());
        // Buffered item is still drained, then the failure surfaces.
        assert_eq!(rx.recv().await.unwrap(), 1);
        assert!(matches!(rx.recv().await, Err(RecvError::Failed(_))));
    }

    #[tokio::test]
    async fn test_item_stream_yields_then_ends() {
        let (nctx, token) = node_parts("sink");
        let (tx, rx) = pipe(4);
        let mut stream = ItemStream::new("sink".into(), rx, token, nctx.metrics().clone());

        tx.try_send(1u32).unwrap();
        tx.try_send(2).unwrap();
        tx.close();

        assert_eq!(stream.next().await.unwrap(), Some(1));
        assert_eq!(stream.next().await.unwrap(), Some(2));
        assert_eq!(stream.next().await.unwrap(), None);
        assert_eq!(nctx.metrics().items_in.get(), 2);
    }

    #[tokio::test]
    async fn test_item_stream_drains_buffer_before_reporting_cancellation() {
        let (nctx, token) = node_parts("sink");
        let (tx, rx) = pipe(4);
        let mut stream = ItemStream::new("sink".into(), rx, token.clone(), nctx.metrics().clone());

        tx.try_send(1u32).unwrap();
        token.cancel();

        // The committed item is still delivered.
        assert_eq!(stream.next().await.unwrap(), Some(1));
        let err = stream.next().await.unwrap_err();
        assert!(err.is_cancellation());
    }

    #[tokio::test]
    async fn test_item_stream_surfaces_upstream_failure() {
        let (nctx, token) = node_parts("sink");
        let (tx, rx) = pipe(4);
        let mut stream = ItemStream::new("sink".into(), rx, token, nctx.metrics().clone());

        tx.try_send(1u32).unwrap();
        tx.fail(Arc::new(Error::permanent("up".into(), "exploded")));

        assert_eq!(stream.next().await.unwrap(), Some(1));
        let err = stream.next().await.unwrap_err();
        assert!(matches!(err, Error::PipeRecvError { .. }));
        assert!(err.to_string().contains("exploded"));
    }
}
