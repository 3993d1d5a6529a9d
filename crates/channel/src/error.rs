// SPDX-License-Identifier: Apache-2.0

//! Errors returned by pipe endpoints.

use std::sync::Arc;

/// Shared terminal failure cause attached to a failed pipe.
///
/// The cause is reference-counted so that every reader blocked on the pipe
/// can observe the same error after the buffered items have been drained.
pub type FailCause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur when sending into a pipe.
///
/// Both variants return the item to the caller so it can be re-routed
/// (e.g. to a deadletter destination) instead of being silently lost.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SendError<T> {
    /// The pipe buffer is at capacity.
    #[error("Pipe is full")]
    Full(T),
    /// The pipe was closed or failed, or all readers are gone.
    #[error("Pipe is closed")]
    Closed(T),
}

impl<T> SendError<T> {
    /// Consumes the error and returns the item that could not be sent.
    pub fn into_item(self) -> T {
        match self {
            SendError::Full(item) | SendError::Closed(item) => item,
        }
    }
}

/// Errors that can occur when receiving from a pipe.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RecvError {
    /// The pipe buffer is currently empty (returned by `try_recv` only).
    #[error("Pipe is empty")]
    Empty,
    /// The writer closed the pipe and all buffered items have been drained.
    #[error("Pipe is closed")]
    Closed,
    /// The writer failed the pipe; buffered items were drained first.
    #[error("Pipe failed: {0}")]
    Failed(FailCause),
}

impl RecvError {
    /// Returns `true` if this error marks a graceful end of stream.
    #[must_use]
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, RecvError::Closed)
    }
}
