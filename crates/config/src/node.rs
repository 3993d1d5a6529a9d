// SPDX-License-Identifier: Apache-2.0

//! Node specification.
//!
//! A node is a unit of work in the graph: a source producing items, a
//! transform or filter mapping items, a merge folding several inputs into
//! one output, or a sink consuming items. The specification here is the
//! plain-data description of a node; the runtime behavior is supplied to
//! the engine builder as a live trait object.

use crate::parallel::ParallelOptions;
use crate::retry::RetryOptions;
use crate::Description;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Node kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// A producer of items.
    #[default]
    Source,
    /// A one-in, one-out mapping over items.
    Transform,
    /// A predicate that keeps or silently discards items.
    Filter,
    /// A many-in, one-out fold over several same-typed inputs.
    Merge,
    /// A terminal consumer of items.
    Sink,
}

impl NodeKind {
    /// Returns `true` for kinds that accept at least one incoming edge.
    #[must_use]
    pub const fn has_input(&self) -> bool {
        !matches!(self, NodeKind::Source)
    }

    /// Returns `true` for kinds that expose an output port.
    #[must_use]
    pub const fn has_output(&self) -> bool {
        !matches!(self, NodeKind::Sink)
    }

    /// Returns `true` for kinds that allow multiple incoming edges on one
    /// input port.
    #[must_use]
    pub const fn allows_fan_in(&self) -> bool {
        matches!(self, NodeKind::Merge)
    }
}

impl From<NodeKind> for Cow<'static, str> {
    fn from(kind: NodeKind) -> Self {
        match kind {
            NodeKind::Source => "source".into(),
            NodeKind::Transform => "transform".into(),
            NodeKind::Filter => "filter".into(),
            NodeKind::Merge => "merge".into(),
            NodeKind::Sink => "sink".into(),
        }
    }
}

/// Specification of a node in the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeSpec {
    /// The kind of this node.
    pub kind: NodeKind,

    /// An optional description of this node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<Description>,

    /// The item type consumed by this node, as a diagnostic type name.
    ///
    /// Filled in by the typed builder; compared across edges at validation
    /// time when both ends declare a type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_type: Option<String>,

    /// The item type produced by this node, as a diagnostic type name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_type: Option<String>,

    /// Retry options for this node, overriding the run-level defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryOptions>,

    /// Parallel execution options for this node (transforms and filters).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<ParallelOptions>,
}

impl NodeSpec {
    /// Creates a new node spec of the given kind with no options set.
    #[must_use]
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            description: None,
            input_type: None,
            output_type: None,
            retry: None,
            parallel: None,
        }
    }
}
