// SPDX-License-Identifier: Apache-2.0

//! Errors for the config crate.

use crate::{NodeId, PipelineId, PortName};
use miette::Diagnostic;
use std::fmt::Display;

/// Errors that can occur while parsing or validating a graph specification.
///
/// Note: All errors are contextualized with the pipeline id, if applicable.
#[derive(thiserror::Error, Debug, Diagnostic)]
pub enum Error {
    /// A collection of errors that occurred during parsing or validating the graph.
    #[error("Invalid graph: {errors:?}")]
    #[diagnostic(code(rill::invalid_graph), url(docsrs))]
    InvalidGraph {
        /// A list of errors that occurred during parsing or validating the graph.
        #[related]
        errors: Vec<Error>,
    },

    /// An error that occurred while reading a graph specification file.
    #[error("File read error: {details}\nContext: {context}")]
    #[diagnostic(code(rill::file_read_error), url(docsrs))]
    FileReadError {
        /// The context in which the error occurred.
        context: Context,
        /// A description of the error that occurred.
        details: String,
    },

    /// An error that occurred while deserializing a graph specification.
    #[error("{format} deserialization error: {details}\nContext: {context}")]
    #[diagnostic(code(rill::deserialization_error), url(docsrs))]
    DeserializationError {
        /// The context in which the error occurred.
        context: Context,
        /// The format of the specification (e.g. "JSON").
        format: String,
        /// A description of the error that occurred.
        details: String,
    },

    /// A cycle was detected in the graph.
    #[error("Cycle detected involving nodes: {nodes:?}\nContext: {context}")]
    #[diagnostic(code(rill::cycle_detected), url(docsrs))]
    CycleDetected {
        /// The context in which the error occurred.
        context: Context,
        /// The nodes involved in the cycle.
        nodes: Vec<NodeId>,
    },

    /// A node with the same id already exists in the graph.
    #[error("Duplicated node id `{node_id}`\nContext: {context}")]
    #[diagnostic(code(rill::duplicate_node), url(docsrs))]
    DuplicateNode {
        /// The context in which the error occurred.
        context: Context,
        /// The id of the node that was duplicated.
        node_id: NodeId,
    },

    /// An edge references a node that does not exist in the graph.
    #[error("Edge endpoint `{node_id}` does not exist\nContext: {context}")]
    #[diagnostic(code(rill::unknown_edge_endpoint), url(docsrs))]
    UnknownEdgeEndpoint {
        /// The context in which the error occurred.
        context: Context,
        /// The id of the missing node.
        node_id: NodeId,
    },

    /// An edge connects a node to itself.
    #[error("Node `{node_id}` is connected to itself\nContext: {context}")]
    #[diagnostic(code(rill::self_edge), url(docsrs))]
    SelfEdge {
        /// The context in which the error occurred.
        context: Context,
        /// The id of the offending node.
        node_id: NodeId,
    },

    /// An input port has more than one incoming edge on a non-merge node.
    #[error(
        "Input port `{port}` of node `{node_id}` has more than one incoming edge\nContext: {context}"
    )]
    #[diagnostic(code(rill::duplicate_input_edge), url(docsrs))]
    DuplicateInputEdge {
        /// The context in which the error occurred.
        context: Context,
        /// The node whose input port is over-connected.
        node_id: NodeId,
        /// The over-connected input port.
        port: PortName,
    },

    /// A non-source node has no incoming edge.
    #[error("Node `{node_id}` has no incoming edge\nContext: {context}")]
    #[diagnostic(code(rill::unconnected_input), url(docsrs))]
    UnconnectedInput {
        /// The context in which the error occurred.
        context: Context,
        /// The node missing an input connection.
        node_id: NodeId,
    },

    /// A source node appears as the downstream end of an edge.
    #[error("Source node `{node_id}` cannot be a downstream target\nContext: {context}")]
    #[diagnostic(code(rill::source_as_target), url(docsrs))]
    SourceAsTarget {
        /// The context in which the error occurred.
        context: Context,
        /// The source node used as a target.
        node_id: NodeId,
    },

    /// A sink node appears as the upstream end of an edge.
    #[error("Sink node `{node_id}` cannot have outgoing edges\nContext: {context}")]
    #[diagnostic(code(rill::sink_as_source), url(docsrs))]
    SinkAsSource {
        /// The context in which the error occurred.
        context: Context,
        /// The sink node used as a source.
        node_id: NodeId,
    },

    /// The item types on the two ends of an edge do not match.
    #[error(
        "Type mismatch on edge `{from}` -> `{to}`: upstream produces `{output_type}`, downstream consumes `{input_type}`\nContext: {context}"
    )]
    #[diagnostic(code(rill::type_mismatch), url(docsrs))]
    TypeMismatch {
        /// The context in which the error occurred.
        context: Context,
        /// The upstream node of the edge.
        from: NodeId,
        /// The downstream node of the edge.
        to: NodeId,
        /// The item type produced by the upstream node.
        output_type: String,
        /// The item type expected by the downstream node.
        input_type: String,
    },

    /// A node is not reachable from any source.
    #[error("Node `{node_id}` is not reachable from any source\nContext: {context}")]
    #[diagnostic(code(rill::unreachable_node), url(docsrs))]
    UnreachableNode {
        /// The context in which the error occurred.
        context: Context,
        /// The unreachable node.
        node_id: NodeId,
    },

    /// The graph has no source or no sink node.
    #[error("Graph must contain at least one source and one sink\nContext: {context}")]
    #[diagnostic(code(rill::empty_graph), url(docsrs))]
    EmptyGraph {
        /// The context in which the error occurred.
        context: Context,
    },

    /// Invalid node options (retry, parallelism) detected at validation time.
    #[error("Invalid options on node `{node_id}`: {details}\nContext: {context}")]
    #[diagnostic(code(rill::invalid_options), url(docsrs))]
    InvalidOptions {
        /// The context in which the error occurred.
        context: Context,
        /// The node carrying the invalid options.
        node_id: NodeId,
        /// A description of what is invalid.
        details: String,
    },
}

/// Information that all errors provide to help identify
/// the context in which they occurred.
#[derive(Debug, Default)]
pub struct Context {
    /// The pipeline id, if applicable.
    pub pipeline_id: Option<PipelineId>,
}

impl Context {
    /// Creates a new context with the given pipeline id.
    #[must_use]
    pub const fn new(pipeline_id: PipelineId) -> Self {
        Self {
            pipeline_id: Some(pipeline_id),
        }
    }
}

impl Display for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(pipeline_id) = &self.pipeline_id {
            write!(f, "Pipeline: '{pipeline_id}'")?;
        }
        Ok(())
    }
}
