// SPDX-License-Identifier: Apache-2.0

//! Declarative configuration model for rill dataflow graphs.
//!
//! Data model:
//! - graph
//!   - nodes (source, transform, filter, merge, sink)
//!   - edges connecting node output ports to node input ports
//!
//! A graph is a directed acyclic graph of typed nodes. This crate holds the
//! plain-data side of the model: node and edge specifications, retry and
//! parallelism options, and structural validation. The runtime counterpart
//! (live node instances, pipes, scheduling) lives in `rill-engine`.

use std::borrow::Cow;

pub mod error;
pub mod graph;
pub mod node;
pub mod parallel;
pub mod retry;

/// The id of a pipeline (a compiled graph run as a unit).
pub type PipelineId = Cow<'static, str>;

/// The id of a node in the graph.
pub type NodeId = Cow<'static, str>;

/// The name of a node output or input port.
pub type PortName = Cow<'static, str>;

/// The description of a graph or a node.
pub type Description = Cow<'static, str>;

/// Port name used when a node does not declare explicit ports.
pub const DEFAULT_PORT: &str = "out";
