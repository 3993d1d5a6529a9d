// SPDX-License-Identifier: Apache-2.0

//! Errors for the pipeline runtime.
//!
//! Important note: It is important not to use `!Send` data types in errors
//! (e.g. avoid using Rc) to ensure these errors can cross task boundaries
//! and be attached to pipes as shared failure causes.

use rill_config::NodeId;
use std::fmt;
use std::time::Duration;

/// High-level classification of a runtime failure.
///
/// The kind drives the retry decision: `Transient` errors are candidates
/// for retry, everything else is surfaced immediately.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorKind {
    /// A failure that may succeed on a later attempt.
    Transient,
    /// A failure that will not be retried.
    Permanent,
    /// The run's cancellation signal was observed.
    Cancelled,
    /// The circuit breaker is open; the call was not attempted.
    CircuitOpen,
    /// Invalid graph or invalid options; fatal, never retried.
    Config,
    /// The run deadline was exceeded.
    Timeout,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Config => "config",
            ErrorKind::Timeout => "timeout",
        };
        write!(f, "{label}")
    }
}

/// Formats the source chain of an error into a single display string.
#[must_use]
pub fn format_error_sources(error: &(dyn std::error::Error + 'static)) -> String {
    let mut segments = Vec::new();
    let mut current = error.source();
    while let Some(err) = current {
        let msg = err.to_string();
        if !msg.is_empty() {
            segments.push(msg);
        }
        current = err.source();
    }

    if segments.is_empty() {
        String::new()
    } else {
        format!("; source: {}", segments.join(" -> "))
    }
}

/// All errors that can occur in the pipeline runtime.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A wrapper for the config errors.
    #[error("A config error occurred: {0}")]
    ConfigError(#[from] Box<rill_config::error::Error>),

    /// A wrapper for pipe send failures.
    #[error("A pipe send error occurred in node {node}: {error}")]
    PipeSendError {
        /// The node that attempted the send.
        node: NodeId,
        /// The reason (e.g., pipe closed).
        error: String,
    },

    /// A wrapper for pipe receive failures.
    #[error("A pipe receive error occurred in node {node}: {error}")]
    PipeRecvError {
        /// The node that attempted the receive.
        node: NodeId,
        /// The reason (e.g., upstream failed).
        error: String,
    },

    /// A failure raised by a node body.
    #[error("A node error occurred in node {node} ({kind}): {error}{source_detail}")]
    NodeError {
        /// The node that encountered the error.
        node: NodeId,
        /// High-level classification for the failure.
        kind: ErrorKind,
        /// The error that occurred.
        error: String,
        /// Pre-formatted representation of the source chain used when
        /// rendering the error.
        source_detail: String,
    },

    /// Fast-fail raised while a node's circuit breaker is open.
    #[error("Circuit breaker open for node {node}")]
    CircuitOpen {
        /// The node whose breaker is open.
        node: NodeId,
    },

    /// The run's cancellation signal was observed.
    #[error("Cancelled in node {node}: {reason}")]
    Cancelled {
        /// The node that observed the cancellation.
        node: NodeId,
        /// Human-readable reason for the cancellation.
        reason: String,
    },

    /// The run deadline was exceeded.
    #[error("Run deadline of {deadline:?} exceeded")]
    DeadlineExceeded {
        /// The configured deadline.
        deadline: Duration,
    },

    /// A deadletter delivery failed.
    #[error("Deadletter delivery failed for node {node}: {error}")]
    DeadletterError {
        /// The node whose item could not be deadlettered.
        node: NodeId,
        /// The reason the delivery failed.
        error: String,
    },

    /// A checkpoint store operation failed.
    #[error("Checkpoint store error for node {node}: {error}")]
    CheckpointError {
        /// The node whose checkpoint operation failed.
        node: NodeId,
        /// The reason the operation failed.
        error: String,
    },

    /// A task error that occurred during the execution of a join task.
    #[error("Join task error: {error}, cancelled: {is_canceled}, panic: {is_panic}")]
    JoinTaskError {
        /// Flag indicating whether the task was canceled.
        is_canceled: bool,
        /// Flag indicating whether the task panicked.
        is_panic: bool,
        /// The error that occurred.
        error: String,
    },

    /// A terminal failure enriched with its execution coordinates.
    ///
    /// Produced by the resilient executor when surfacing a failure after
    /// retries are exhausted; the inner error is preserved as the cause.
    #[error(
        "Node {node} failed on attempt {attempt} (correlation {correlation_id}): {source}"
    )]
    NodeFailed {
        /// The node that failed.
        node: NodeId,
        /// The attempt number on which the final failure occurred.
        attempt: u32,
        /// The correlation id of the run.
        correlation_id: String,
        /// The underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// An internal error that occurred in the pipeline runtime.
    #[error("Internal error: {message}")]
    InternalError {
        /// An internal error message.
        message: String,
    },
}

impl Error {
    /// Creates a transient node error from a message.
    pub fn transient(node: NodeId, error: impl Into<String>) -> Self {
        Error::NodeError {
            node,
            kind: ErrorKind::Transient,
            error: error.into(),
            source_detail: String::new(),
        }
    }

    /// Creates a permanent node error from a message.
    pub fn permanent(node: NodeId, error: impl Into<String>) -> Self {
        Error::NodeError {
            node,
            kind: ErrorKind::Permanent,
            error: error.into(),
            source_detail: String::new(),
        }
    }

    /// Creates a transient node error from an underlying error, capturing
    /// its source chain.
    pub fn transient_from(
        node: NodeId,
        error: &(dyn std::error::Error + 'static),
    ) -> Self {
        Error::NodeError {
            node,
            kind: ErrorKind::Transient,
            error: error.to_string(),
            source_detail: format_error_sources(error),
        }
    }

    /// Creates a permanent node error from an underlying error, capturing
    /// its source chain.
    pub fn permanent_from(
        node: NodeId,
        error: &(dyn std::error::Error + 'static),
    ) -> Self {
        Error::NodeError {
            node,
            kind: ErrorKind::Permanent,
            error: error.to_string(),
            source_detail: format_error_sources(error),
        }
    }

    /// Creates a cancellation error for the given node.
    pub fn cancelled(node: NodeId, reason: impl Into<String>) -> Self {
        Error::Cancelled {
            node,
            reason: reason.into(),
        }
    }

    /// Returns the classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ConfigError(_) => ErrorKind::Config,
            Error::NodeError { kind, .. } => *kind,
            Error::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Error::Cancelled { .. } => ErrorKind::Cancelled,
            Error::DeadlineExceeded { .. } => ErrorKind::Timeout,
            Error::NodeFailed { source, .. } => source.kind(),
            _ => ErrorKind::Permanent,
        }
    }

    /// Returns `true` when this error stems from cancellation (including
    /// a deadline expiry).
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self.kind(), ErrorKind::Cancelled | ErrorKind::Timeout)
    }

    /// Returns the node id this error is attributed to, if any.
    #[must_use]
    pub fn node(&self) -> Option<&NodeId> {
        match self {
            Error::PipeSendError { node, .. }
            | Error::PipeRecvError { node, .. }
            | Error::NodeError { node, .. }
            | Error::CircuitOpen { node }
            | Error::Cancelled { node, .. }
            | Error::DeadletterError { node, .. }
            | Error::CheckpointError { node, .. }
            | Error::NodeFailed { node, .. } => Some(node),
            _ => None,
        }
    }

    /// Builds the failure cause attached to a node's outgoing pipes,
    /// preserving this error's kind and message. The original error stays
    /// with the scheduler for the run report.
    #[must_use]
    pub fn as_pipe_cause(&self, node: &NodeId) -> Error {
        Error::NodeError {
            node: node.clone(),
            kind: self.kind(),
            error: self.to_string(),
            source_detail: String::new(),
        }
    }

    /// Returns the name of the error variant as a string.
    #[must_use]
    pub fn variant_name(&self) -> &'static str {
        match self {
            Error::ConfigError(_) => "ConfigError",
            Error::PipeSendError { .. } => "PipeSendError",
            Error::PipeRecvError { .. } => "PipeRecvError",
            Error::NodeError { .. } => "NodeError",
            Error::CircuitOpen { .. } => "CircuitOpen",
            Error::Cancelled { .. } => "Cancelled",
            Error::DeadlineExceeded { .. } => "DeadlineExceeded",
            Error::DeadletterError { .. } => "DeadletterError",
            Error::CheckpointError { .. } => "CheckpointError",
            Error::JoinTaskError { .. } => "JoinTaskError",
            Error::NodeFailed { .. } => "NodeFailed",
            Error::InternalError { .. } => "InternalError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        let e = Error::transient("map".into(), "io timeout");
        assert_eq!(e.kind(), ErrorKind::Transient);

        let e = Error::permanent("map".into(), "bad record");
        assert_eq!(e.kind(), ErrorKind::Permanent);

        let e = Error::CircuitOpen { node: "map".into() };
        assert_eq!(e.kind(), ErrorKind::CircuitOpen);
    }

    #[test]
    fn test_enriched_error_preserves_cause_kind() {
        let inner = Error::transient("map".into(), "flaky");
        let enriched = Error::NodeFailed {
            node: "map".into(),
            attempt: 3,
            correlation_id: "c-1".into(),
            source: Box::new(inner),
        };
        assert_eq!(enriched.kind(), ErrorKind::Transient);
        assert!(!enriched.is_cancellation());
        assert!(enriched.to_string().contains("attempt 3"));
    }

    #[test]
    fn test_format_error_sources_walks_chain() {
        #[derive(Debug, thiserror::Error)]
        #[error("outer")]
        struct Outer(#[source] Inner);

        #[derive(Debug, thiserror::Error)]
        #[error("inner")]
        struct Inner;

        let formatted = format_error_sources(&Outer(Inner));
        assert_eq!(formatted, "; source: inner");
    }
}
