// SPDX-License-Identifier: Apache-2.0

//! Span observer hooks.
//!
//! The runtime emits a begin/end pair around every node invocation
//! (including each retry attempt). Observers are shared across all node
//! tasks of a run and must be cheap and non-blocking; expensive exporters
//! should buffer internally.

use std::borrow::Cow;
use std::time::Duration;

/// Identifying information for one node invocation.
#[derive(Debug, Clone)]
pub struct SpanInfo {
    /// The id of the node being invoked.
    pub node_id: Cow<'static, str>,
    /// The attempt number, starting at 1. Retries increment it.
    pub attempt: u32,
    /// A short, human-oriented summary of the input (may be empty).
    pub input_summary: Cow<'static, str>,
}

/// Completion status reported to [`SpanObserver::on_end`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanStatus {
    /// The invocation completed successfully.
    Success,
    /// The invocation failed.
    Failed,
    /// The invocation was interrupted by cancellation.
    Cancelled,
}

/// Observer invoked around node work.
pub trait SpanObserver: Send + Sync {
    /// Called before a node invocation starts.
    fn on_begin(&self, span: &SpanInfo);

    /// Called after a node invocation ends.
    fn on_end(
        &self,
        span: &SpanInfo,
        status: SpanStatus,
        duration: Duration,
        error: Option<&str>,
    );
}

/// The default observer: ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSpanObserver;

impl SpanObserver for NoopSpanObserver {
    fn on_begin(&self, _span: &SpanInfo) {}

    fn on_end(
        &self,
        _span: &SpanInfo,
        _status: SpanStatus,
        _duration: Duration,
        _error: Option<&str>,
    ) {
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<String>>,
    }

    impl SpanObserver for RecordingObserver {
        fn on_begin(&self, span: &SpanInfo) {
            self.events
                .lock()
                .push(format!("begin {} #{}", span.node_id, span.attempt));
        }

        fn on_end(
            &self,
            span: &SpanInfo,
            status: SpanStatus,
            _duration: Duration,
            _error: Option<&str>,
        ) {
            self.events
                .lock()
                .push(format!("end {} {status:?}", span.node_id));
        }
    }

    #[test]
    fn test_observer_receives_begin_end_pair() {
        let observer = RecordingObserver::default();
        let span = SpanInfo {
            node_id: "map".into(),
            attempt: 1,
            input_summary: "".into(),
        };
        observer.on_begin(&span);
        observer.on_end(&span, SpanStatus::Success, Duration::from_millis(1), None);

        let events = observer.events.lock();
        assert_eq!(events.as_slice(), ["begin map #1", "end map Success"]);
    }
}
