// SPDX-License-Identifier: Apache-2.0

//! Bounded typed pipe between two pipeline nodes.
//!
//! A pipe is a FIFO queue with a hard capacity bound. The writer suspends
//! when the buffer is full and readers suspend when it is empty, which is
//! how backpressure propagates upstream. Termination is signalled exactly
//! once by the writer, either gracefully (`close`) or with a terminal
//! failure (`fail`). Failures follow a drain-then-raise policy: readers
//! observe every item enqueued before the failure, then the failure cause.
//!
//! Endpoints are cheaply cloneable and shareable across tasks. Waiting
//! senders are woken in FIFO order so a slow reader does not starve any
//! particular producer.

use crate::error::{FailCause, RecvError, SendError};
use futures::Stream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

/// Terminal state of a pipe. The first transition wins; later calls are no-ops.
#[derive(Clone)]
enum Terminal {
    Closed,
    Failed(FailCause),
}

struct PipeState<T> {
    buffer: VecDeque<T>,
    capacity: usize,
    terminal: Option<Terminal>,
    senders: usize,
    readers: usize,
    reader_wakers: VecDeque<Waker>,
    sender_wakers: VecDeque<Waker>,
}

impl<T> PipeState<T> {
    // Readers are woken en masse: a parked recv future may have been
    // dropped by a select! race, leaving a stale waker at the front of
    // the queue, and waking only that one would strand the live reader.
    fn wake_readers(&mut self) {
        for waker in self.reader_wakers.drain(..) {
            waker.wake();
        }
    }

    fn wake_one_sender(&mut self) {
        if let Some(waker) = self.sender_wakers.pop_front() {
            waker.wake();
        }
    }

    fn wake_all(&mut self) {
        for waker in self.reader_wakers.drain(..) {
            waker.wake();
        }
        for waker in self.sender_wakers.drain(..) {
            waker.wake();
        }
    }
}

struct Pipe<T> {
    state: Mutex<PipeState<T>>,
}

/// Creates a new bounded pipe with the given capacity.
///
/// A capacity of zero is promoted to one: the backpressure contract
/// requires at least one buffered item so a writer can always make
/// progress once a reader consumes.
#[must_use]
pub fn pipe<T>(capacity: usize) -> (PipeSender<T>, PipeReceiver<T>) {
    let capacity = capacity.max(1);
    let inner = Arc::new(Pipe {
        state: Mutex::new(PipeState {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
            terminal: None,
            senders: 1,
            readers: 1,
            reader_wakers: VecDeque::new(),
            sender_wakers: VecDeque::new(),
        }),
    });

    (
        PipeSender {
            pipe: inner.clone(),
        },
        PipeReceiver { pipe: inner },
    )
}

/// Writing endpoint of a pipe. Owned by the upstream node.
pub struct PipeSender<T> {
    pipe: Arc<Pipe<T>>,
}

/// Reading endpoint of a pipe. Items are delivered exactly once even when
/// the endpoint is cloned across competing consumers.
pub struct PipeReceiver<T> {
    pipe: Arc<Pipe<T>>,
}

impl<T> Clone for PipeSender<T> {
    fn clone(&self) -> Self {
        self.pipe.state.lock().senders += 1;
        PipeSender {
            pipe: self.pipe.clone(),
        }
    }
}

impl<T> Clone for PipeReceiver<T> {
    fn clone(&self) -> Self {
        self.pipe.state.lock().readers += 1;
        PipeReceiver {
            pipe: self.pipe.clone(),
        }
    }
}

impl<T> Drop for PipeSender<T> {
    fn drop(&mut self) {
        let mut state = self.pipe.state.lock();
        state.senders -= 1;
        if state.senders == 0 {
            if state.terminal.is_none() {
                state.terminal = Some(Terminal::Closed);
            }
            state.wake_all();
        }
    }
}

impl<T> Drop for PipeReceiver<T> {
    fn drop(&mut self) {
        let mut state = self.pipe.state.lock();
        state.readers -= 1;
        if state.readers == 0 {
            // No reader will ever drain the buffer; senders must not block.
            for waker in state.sender_wakers.drain(..) {
                waker.wake();
            }
        }
    }
}

impl<T> PipeSender<T> {
    /// Attempts to enqueue an item without suspending.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Full`] when the buffer is at capacity and
    /// [`SendError::Closed`] when the pipe is terminal or all readers are gone.
    pub fn try_send(&self, item: T) -> Result<(), SendError<T>> {
        let mut state = self.pipe.state.lock();

        if state.terminal.is_some() || state.readers == 0 {
            return Err(SendError::Closed(item));
        }
        if state.buffer.len() >= state.capacity {
            return Err(SendError::Full(item));
        }

        state.buffer.push_back(item);
        state.wake_readers();
        Ok(())
    }

    /// Enqueues an item, suspending while the buffer is full.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Closed`] when the pipe is terminal or all
    /// readers are gone.
    pub fn send(&self, item: T) -> SendFuture<'_, T> {
        SendFuture {
            sender: self,
            item: Some(item),
        }
    }

    /// Declares the stream finished. Idempotent after the first call.
    pub fn close(&self) {
        let mut state = self.pipe.state.lock();
        if state.terminal.is_none() {
            state.terminal = Some(Terminal::Closed);
        }
        state.wake_all();
    }

    /// Declares terminal failure. One-shot: if the pipe is already closed
    /// or failed, the call is ignored. Buffered items remain readable and
    /// the cause is observed only after they are drained.
    pub fn fail(&self, cause: FailCause) {
        let mut state = self.pipe.state.lock();
        if state.terminal.is_none() {
            state.terminal = Some(Terminal::Failed(cause));
        }
        state.wake_all();
    }

    /// Returns `true` once the pipe reached a terminal state.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.pipe.state.lock().terminal.is_some()
    }

    /// Number of items currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pipe.state.lock().buffer.len()
    }

    /// Returns `true` when no items are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The capacity bound of this pipe.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.pipe.state.lock().capacity
    }
}

impl<T> PipeReceiver<T> {
    /// Attempts to dequeue an item without suspending.
    ///
    /// # Errors
    ///
    /// Returns [`RecvError::Empty`] when no item is buffered yet,
    /// [`RecvError::Closed`] after a graceful close has been drained, and
    /// [`RecvError::Failed`] after a failed pipe has been drained.
    pub fn try_recv(&self) -> Result<T, RecvError> {
        let mut state = self.pipe.state.lock();

        if let Some(item) = state.buffer.pop_front() {
            // A slot freed up; resume the longest-waiting sender.
            state.wake_one_sender();
            return Ok(item);
        }

        match &state.terminal {
            None => Err(RecvError::Empty),
            Some(Terminal::Closed) => Err(RecvError::Closed),
            Some(Terminal::Failed(cause)) => Err(RecvError::Failed(cause.clone())),
        }
    }

    /// Dequeues an item, suspending while the pipe is empty.
    ///
    /// # Errors
    ///
    /// Returns [`RecvError::Closed`] or [`RecvError::Failed`] once the
    /// pipe is terminal and fully drained.
    pub fn recv(&self) -> RecvFuture<'_, T> {
        RecvFuture { receiver: self }
    }

    /// Number of items currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pipe.state.lock().buffer.len()
    }

    /// Returns `true` when no items are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The capacity bound of this pipe.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.pipe.state.lock().capacity
    }

    /// Converts the receiver into a lazy stream of items.
    ///
    /// The stream ends after a graceful close; a terminal failure is
    /// yielded as the final `Err` element once buffered items are drained.
    #[must_use]
    pub fn into_stream(self) -> PipeStream<T> {
        PipeStream {
            receiver: Some(self),
        }
    }
}

/// Future returned by [`PipeSender::send`].
pub struct SendFuture<'a, T> {
    sender: &'a PipeSender<T>,
    item: Option<T>,
}

impl<T> Unpin for SendFuture<'_, T> {}

impl<T> Future for SendFuture<'_, T> {
    type Output = Result<(), SendError<T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let item = self.item.take().expect("SendFuture polled after completion");

        match self.sender.try_send(item) {
            Ok(()) => Poll::Ready(Ok(())),
            Err(SendError::Full(item)) => {
                self.item = Some(item);
                let mut state = self.sender.pipe.state.lock();
                // Re-check under the lock: a slot may have freed between
                // try_send and here, and the waker that would have resumed
                // us has already been consumed.
                if state.buffer.len() < state.capacity || state.terminal.is_some() {
                    drop(state);
                    cx.waker().wake_by_ref();
                } else {
                    state.sender_wakers.push_back(cx.waker().clone());
                }
                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

/// Future returned by [`PipeReceiver::recv`].
pub struct RecvFuture<'a, T> {
    receiver: &'a PipeReceiver<T>,
}

impl<T> Future for RecvFuture<'_, T> {
    type Output = Result<T, RecvError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.receiver.try_recv() {
            Ok(item) => Poll::Ready(Ok(item)),
            Err(RecvError::Empty) => {
                let mut state = self.receiver.pipe.state.lock();
                if !state.buffer.is_empty() || state.terminal.is_some() {
                    drop(state);
                    cx.waker().wake_by_ref();
                } else {
                    state.reader_wakers.push_back(cx.waker().clone());
                }
                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

/// Lazy stream over the items of a pipe. See [`PipeReceiver::into_stream`].
pub struct PipeStream<T> {
    receiver: Option<PipeReceiver<T>>,
}

impl<T> Unpin for PipeStream<T> {}

impl<T> Stream for PipeStream<T> {
    type Item = Result<T, RecvError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let Some(receiver) = &self.receiver else {
            return Poll::Ready(None);
        };

        match receiver.try_recv() {
            Ok(item) => Poll::Ready(Some(Ok(item))),
            Err(RecvError::Empty) => {
                let mut state = receiver.pipe.state.lock();
                if !state.buffer.is_empty() || state.terminal.is_some() {
                    drop(state);
                    cx.waker().wake_by_ref();
                } else {
                    state.reader_wakers.push_back(cx.waker().clone());
                }
                Poll::Pending
            }
            Err(RecvError::Closed) => {
                self.receiver = None;
                Poll::Ready(None)
            }
            Err(err @ RecvError::Failed(_)) => {
                self.receiver = None;
                Poll::Ready(Some(Err(err)))
            }
        }
    }
}
