// SPDX-License-Identifier: Apache-2.0

//! Bounded, typed pipe primitive connecting dataflow nodes.
//!
//! A pipe carries items from a single logical writer to its readers with
//! FIFO ordering, a hard capacity bound (backpressure), and one-shot
//! termination signalling: graceful close or terminal failure with
//! drain-then-raise semantics.

pub mod error;
pub mod pipe;

pub use error::{FailCause, RecvError, SendError};
pub use pipe::{PipeReceiver, PipeSender, PipeStream, pipe};
