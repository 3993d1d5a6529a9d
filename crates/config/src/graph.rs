// SPDX-License-Identifier: Apache-2.0

//! Graph specification and structural validation.
//!
//! A graph is a set of nodes plus directed edges
//! `(upstream, out_port) -> (downstream, in_port)`. Output ports may fan
//! out to several downstream nodes; each input port accepts exactly one
//! incoming edge unless the downstream node is a merge. Validation checks
//! the full invariant list in one pass and reports every violation, not
//! just the first.

use crate::error::{Context, Error};
use crate::node::{NodeKind, NodeSpec};
use crate::{DEFAULT_PORT, NodeId, PipelineId, PortName};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

/// A directed edge between two node ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EdgeSpec {
    /// The upstream node id.
    pub from: NodeId,

    /// The output port on the upstream node.
    #[serde(default = "default_port")]
    pub out_port: PortName,

    /// The downstream node id.
    pub to: NodeId,

    /// The input port on the downstream node.
    #[serde(default = "default_port")]
    pub in_port: PortName,

    /// Pipe capacity override for this edge. Falls back to
    /// [`GraphSettings::default_pipe_capacity`] when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
}

fn default_port() -> PortName {
    DEFAULT_PORT.into()
}

/// Graph-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSettings {
    /// The default capacity of the pipe created for each edge.
    #[serde(default = "default_pipe_capacity")]
    pub default_pipe_capacity: usize,
}

fn default_pipe_capacity() -> usize {
    100
}

impl Default for GraphSettings {
    fn default() -> Self {
        Self {
            default_pipe_capacity: default_pipe_capacity(),
        }
    }
}

/// A graph specification describing nodes and their interconnections.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct GraphSpec {
    /// Graph-wide settings.
    #[serde(default)]
    pub settings: GraphSettings,

    /// All nodes in this graph, keyed by node id.
    pub nodes: HashMap<NodeId, NodeSpec>,

    /// All edges in this graph.
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
}

impl GraphSpec {
    /// Create a new [`GraphSpec`] from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns a deserialization error or the accumulated validation
    /// errors of the parsed graph.
    pub fn from_json(pipeline_id: PipelineId, json_str: &str) -> Result<Self, Error> {
        let spec: GraphSpec =
            serde_json::from_str(json_str).map_err(|e| Error::DeserializationError {
                context: Context::new(pipeline_id.clone()),
                format: "JSON".to_string(),
                details: e.to_string(),
            })?;
        spec.validate(&pipeline_id)?;
        Ok(spec)
    }

    /// Create a new [`GraphSpec`] from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns a deserialization error or the accumulated validation
    /// errors of the parsed graph.
    pub fn from_yaml(pipeline_id: PipelineId, yaml_str: &str) -> Result<Self, Error> {
        let spec: GraphSpec =
            serde_yaml::from_str(yaml_str).map_err(|e| Error::DeserializationError {
                context: Context::new(pipeline_id.clone()),
                format: "YAML".to_string(),
                details: e.to_string(),
            })?;
        spec.validate(&pipeline_id)?;
        Ok(spec)
    }

    /// Load a [`GraphSpec`] from a file, detecting the format from the
    /// file extension (`.json`, `.yaml`, `.yml`).
    ///
    /// # Errors
    ///
    /// Returns a file read error, a deserialization error, or the
    /// accumulated validation errors of the parsed graph.
    pub fn from_file<P: AsRef<Path>>(pipeline_id: PipelineId, path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| Error::FileReadError {
            context: Context::new(pipeline_id.clone()),
            details: e.to_string(),
        })?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_lowercase());

        match extension.as_deref() {
            Some("json") => Self::from_json(pipeline_id, &contents),
            Some("yaml") | Some("yml") => Self::from_yaml(pipeline_id, &contents),
            _ => Err(Error::FileReadError {
                context: Context::new(pipeline_id),
                details: format!(
                    "Unsupported file extension: {}. Supported extensions are: .json, .yaml, .yml",
                    extension.unwrap_or_else(|| "<none>".to_string())
                ),
            }),
        }
    }

    /// Returns the spec of a node, if present.
    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&NodeSpec> {
        self.nodes.get(id)
    }

    /// Returns the edges arriving at the given node.
    pub fn incoming_edges<'a>(&'a self, id: &'a NodeId) -> impl Iterator<Item = &'a EdgeSpec> {
        self.edges.iter().filter(move |e| &e.to == id)
    }

    /// Returns the edges leaving the given node.
    pub fn outgoing_edges<'a>(&'a self, id: &'a NodeId) -> impl Iterator<Item = &'a EdgeSpec> {
        self.edges.iter().filter(move |e| &e.from == id)
    }

    /// Validate the graph specification.
    ///
    /// This method checks for:
    /// - Edges referencing unknown nodes or forming self-loops
    /// - Source nodes used as targets, sink nodes used as sources
    /// - Input ports with more than one incoming edge (non-merge nodes)
    /// - Non-source nodes without any incoming edge
    /// - Item type mismatches across edges
    /// - Invalid retry/parallel options
    /// - Presence of at least one source and one sink
    /// - Nodes unreachable from every source
    /// - Cycles
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidGraph`] carrying every violation found.
    pub fn validate(&self, pipeline_id: &PipelineId) -> Result<(), Error> {
        let mut errors = Vec::new();
        let ctx = || Context::new(pipeline_id.clone());

        let mut has_source = false;
        let mut has_sink = false;
        for (node_id, node) in &self.nodes {
            match node.kind {
                NodeKind::Source => has_source = true,
                NodeKind::Sink => has_sink = true,
                _ => {}
            }
            if let Some(details) = node.retry.as_ref().and_then(|r| r.validation_error()) {
                errors.push(Error::InvalidOptions {
                    context: ctx(),
                    node_id: node_id.clone(),
                    details,
                });
            }
            if let Some(details) = node.parallel.as_ref().and_then(|p| p.validation_error()) {
                errors.push(Error::InvalidOptions {
                    context: ctx(),
                    node_id: node_id.clone(),
                    details,
                });
            }
        }
        if !has_source || !has_sink {
            errors.push(Error::EmptyGraph { context: ctx() });
        }

        // Per-edge structural checks.
        let mut in_degree: HashMap<(&NodeId, &PortName), usize> = HashMap::new();
        for edge in &self.edges {
            let from = self.nodes.get(&edge.from);
            let to = self.nodes.get(&edge.to);

            if from.is_none() {
                errors.push(Error::UnknownEdgeEndpoint {
                    context: ctx(),
                    node_id: edge.from.clone(),
                });
            }
            if to.is_none() {
                errors.push(Error::UnknownEdgeEndpoint {
                    context: ctx(),
                    node_id: edge.to.clone(),
                });
            }
            if edge.from == edge.to {
                errors.push(Error::SelfEdge {
                    context: ctx(),
                    node_id: edge.from.clone(),
                });
            }

            if let Some(to_spec) = to {
                if to_spec.kind == NodeKind::Source {
                    errors.push(Error::SourceAsTarget {
                        context: ctx(),
                        node_id: edge.to.clone(),
                    });
                }
                if !to_spec.kind.allows_fan_in() {
                    *in_degree.entry((&edge.to, &edge.in_port)).or_insert(0) += 1;
                }
            }
            if let Some(from_spec) = from {
                if from_spec.kind == NodeKind::Sink {
                    errors.push(Error::SinkAsSource {
                        context: ctx(),
                        node_id: edge.from.clone(),
                    });
                }
            }

            // Type compatibility, when both ends declare item types.
            if let (Some(from_spec), Some(to_spec)) = (from, to) {
                if let (Some(output_type), Some(input_type)) =
                    (&from_spec.output_type, &to_spec.input_type)
                {
                    if output_type != input_type {
                        errors.push(Error::TypeMismatch {
                            context: ctx(),
                            from: edge.from.clone(),
                            to: edge.to.clone(),
                            output_type: output_type.clone(),
                            input_type: input_type.clone(),
                        });
                    }
                }
            }
        }

        for ((node_id, port), count) in in_degree {
            if count > 1 {
                errors.push(Error::DuplicateInputEdge {
                    context: ctx(),
                    node_id: node_id.clone(),
                    port: port.clone(),
                });
            }
        }

        // Every non-source node needs at least one incoming edge.
        for (node_id, node) in &self.nodes {
            if node.kind.has_input() && self.incoming_edges(node_id).next().is_none() {
                errors.push(Error::UnconnectedInput {
                    context: ctx(),
                    node_id: node_id.clone(),
                });
            }
        }

        // Reachability and cycles only make sense on a structurally sound
        // edge set.
        if errors.is_empty() {
            for node_id in self.unreachable_nodes() {
                errors.push(Error::UnreachableNode {
                    context: ctx(),
                    node_id,
                });
            }
            for cycle in self.detect_cycles() {
                errors.push(Error::CycleDetected {
                    context: ctx(),
                    nodes: cycle,
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidGraph { errors })
        }
    }

    /// Returns the ids of nodes not reachable from any source.
    fn unreachable_nodes(&self) -> Vec<NodeId> {
        let mut reached: HashSet<&NodeId> = HashSet::new();
        let mut queue: VecDeque<&NodeId> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.kind == NodeKind::Source)
            .map(|(id, _)| id)
            .collect();

        for id in queue.iter() {
            let _ = reached.insert(*id);
        }
        while let Some(id) = queue.pop_front() {
            for edge in self.outgoing_edges(id) {
                if reached.insert(&edge.to) {
                    queue.push_back(&edge.to);
                }
            }
        }

        let mut unreachable: Vec<NodeId> = self
            .nodes
            .keys()
            .filter(|id| !reached.contains(id))
            .cloned()
            .collect();
        unreachable.sort();
        unreachable
    }

    fn detect_cycles(&self) -> Vec<Vec<NodeId>> {
        fn visit(
            node: &NodeId,
            spec: &GraphSpec,
            visiting: &mut HashSet<NodeId>,
            visited: &mut HashSet<NodeId>,
            current_path: &mut Vec<NodeId>,
            cycles: &mut Vec<Vec<NodeId>>,
        ) {
            if visited.contains(node) {
                return;
            }
            if visiting.contains(node) {
                // Cycle found
                if let Some(pos) = current_path.iter().position(|n| n == node) {
                    cycles.push(current_path[pos..].to_vec());
                }
                return;
            }
            _ = visiting.insert(node.clone());
            current_path.push(node.clone());

            for edge in spec.outgoing_edges(node) {
                visit(&edge.to, spec, visiting, visited, current_path, cycles);
            }

            _ = visiting.remove(node);
            _ = visited.insert(node.clone());
            _ = current_path.pop();
        }

        let mut visiting = HashSet::new();
        let mut current_path = Vec::new();
        let mut visited = HashSet::new();
        let mut cycles = Vec::new();

        for node in self.nodes.keys() {
            if !visited.contains(node) {
                visit(
                    node,
                    self,
                    &mut visiting,
                    &mut visited,
                    &mut current_path,
                    &mut cycles,
                );
            }
        }

        cycles
    }

    /// Returns the node ids in topological order (Kahn's algorithm).
    ///
    /// Assumes a validated, acyclic graph; on a cyclic graph the result
    /// omits the nodes on cycles.
    #[must_use]
    pub fn topo_order(&self) -> Vec<NodeId> {
        let mut in_degree: HashMap<&NodeId, usize> =
            self.nodes.keys().map(|id| (id, 0)).collect();
        for edge in &self.edges {
            if let Some(d) = in_degree.get_mut(&edge.to) {
                *d += 1;
            }
        }

        let mut ready: Vec<&NodeId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        // Deterministic order for stable plans and reproducible logs.
        ready.sort();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop() {
            order.push(id.clone());
            for edge in self.outgoing_edges(id) {
                if let Some(d) = in_degree.get_mut(&edge.to) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(&edge.to);
                        ready.sort();
                    }
                }
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeKind, NodeSpec};
    use pretty_assertions::assert_eq;

    fn node(kind: NodeKind) -> NodeSpec {
        NodeSpec::new(kind)
    }

    fn edge(from: &str, to: &str) -> EdgeSpec {
        EdgeSpec {
            from: from.to_owned().into(),
            out_port: DEFAULT_PORT.into(),
            to: to.to_owned().into(),
            in_port: DEFAULT_PORT.into(),
            capacity: None,
        }
    }

    fn linear_graph() -> GraphSpec {
        let mut nodes = HashMap::new();
        let _ = nodes.insert("src".into(), node(NodeKind::Source));
        let _ = nodes.insert("map".into(), node(NodeKind::Transform));
        let _ = nodes.insert("out".into(), node(NodeKind::Sink));
        GraphSpec {
            settings: GraphSettings::default(),
            nodes,
            edges: vec![edge("src", "map"), edge("map", "out")],
        }
    }

    #[test]
    fn test_valid_linear_graph() {
        let spec = linear_graph();
        assert!(spec.validate(&"p".into()).is_ok());
    }

    #[test]
    fn test_cycle_detection_error() {
        let mut spec = linear_graph();
        spec.edges.push(edge("map", "map2"));
        let _ = spec
            .nodes
            .insert("map2".into(), node(NodeKind::Transform));
        spec.edges.push(edge("map2", "map"));

        match spec.validate(&"p".into()) {
            Err(Error::InvalidGraph { errors }) => {
                let cycles: Vec<_> = errors
                    .iter()
                    .filter(|e| matches!(e, Error::CycleDetected { .. }))
                    .collect();
                assert_eq!(cycles.len(), 1);
                if let Error::CycleDetected { nodes, .. } = cycles[0] {
                    assert!(nodes.contains(&"map".into()));
                    assert!(nodes.contains(&"map2".into()));
                }
            }
            other => panic!("expected InvalidGraph, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_endpoint_and_self_edge() {
        let mut spec = linear_graph();
        spec.edges.push(edge("map", "ghost"));
        spec.edges.push(edge("map", "map"));

        let Err(Error::InvalidGraph { errors }) = spec.validate(&"p".into()) else {
            panic!("expected InvalidGraph");
        };
        assert!(errors
            .iter()
            .any(|e| matches!(e, Error::UnknownEdgeEndpoint { node_id, .. } if node_id.as_ref() == "ghost")));
        assert!(errors
            .iter()
            .any(|e| matches!(e, Error::SelfEdge { node_id, .. } if node_id.as_ref() == "map")));
    }

    #[test]
    fn test_duplicate_input_edge_rejected_for_non_merge() {
        let mut spec = linear_graph();
        let _ = spec.nodes.insert("src2".into(), node(NodeKind::Source));
        spec.edges.push(edge("src2", "map"));

        let Err(Error::InvalidGraph { errors }) = spec.validate(&"p".into()) else {
            panic!("expected InvalidGraph");
        };
        assert!(errors
            .iter()
            .any(|e| matches!(e, Error::DuplicateInputEdge { node_id, .. } if node_id.as_ref() == "map")));
    }

    #[test]
    fn test_merge_accepts_fan_in() {
        let mut nodes = HashMap::new();
        let _ = nodes.insert("a".into(), node(NodeKind::Source));
        let _ = nodes.insert("b".into(), node(NodeKind::Source));
        let _ = nodes.insert("m".into(), node(NodeKind::Merge));
        let _ = nodes.insert("out".into(), node(NodeKind::Sink));
        let spec = GraphSpec {
            settings: GraphSettings::default(),
            nodes,
            edges: vec![edge("a", "m"), edge("b", "m"), edge("m", "out")],
        };
        assert!(spec.validate(&"p".into()).is_ok());
    }

    #[test]
    fn test_type_mismatch_detected() {
        let mut spec = linear_graph();
        if let Some(n) = spec.nodes.get_mut(&NodeId::from("src")) {
            n.output_type = Some("u64".to_owned());
        }
        if let Some(n) = spec.nodes.get_mut(&NodeId::from("map")) {
            n.input_type = Some("String".to_owned());
        }

        let Err(Error::InvalidGraph { errors }) = spec.validate(&"p".into()) else {
            panic!("expected InvalidGraph");
        };
        assert!(errors
            .iter()
            .any(|e| matches!(e, Error::TypeMismatch { .. })));
    }

    #[test]
    fn test_unreachable_node_detected() {
        let mut spec = linear_graph();
        let _ = spec
            .nodes
            .insert("island".into(), node(NodeKind::Transform));
        let _ = spec.nodes.insert("island_out".into(), node(NodeKind::Sink));
        spec.edges.push(edge("island", "island_out"));

        let Err(Error::InvalidGraph { errors }) = spec.validate(&"p".into()) else {
            panic!("expected InvalidGraph");
        };
        assert!(errors
            .iter()
            .any(|e| matches!(e, Error::UnconnectedInput { node_id, .. } if node_id.as_ref() == "island")));
    }

    #[test]
    fn test_missing_sink_rejected() {
        let mut nodes = HashMap::new();
        let _ = nodes.insert("src".into(), node(NodeKind::Source));
        let spec = GraphSpec {
            settings: GraphSettings::default(),
            nodes,
            edges: vec![],
        };
        let Err(Error::InvalidGraph { errors }) = spec.validate(&"p".into()) else {
            panic!("expected InvalidGraph");
        };
        assert!(errors.iter().any(|e| matches!(e, Error::EmptyGraph { .. })));
    }

    #[test]
    fn test_topo_order_respects_edges() {
        let spec = linear_graph();
        let order = spec.topo_order();
        let pos = |id: &str| order.iter().position(|n| n == id).unwrap();
        assert!(pos("src") < pos("map"));
        assert!(pos("map") < pos("out"));
    }

    #[test]
    fn test_from_file_detects_format_by_extension() {
        let json = r#"{
            "nodes": {
                "src": { "kind": "source" },
                "out": { "kind": "sink" }
            },
            "edges": [ { "from": "src", "to": "out" } ]
        }"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");
        std::fs::write(&path, json).unwrap();

        let spec = GraphSpec::from_file("p".into(), &path).unwrap();
        assert_eq!(spec.nodes.len(), 2);

        let bad = dir.path().join("graph.toml");
        std::fs::write(&bad, "").unwrap();
        assert!(matches!(
            GraphSpec::from_file("p".into(), &bad),
            Err(Error::FileReadError { .. })
        ));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let yaml = r#"
nodes:
  src:
    kind: source
  map:
    kind: transform
    retry:
      max_attempts: 2
      backoff:
        exponential:
          base: 1ms
          multiplier: 2.0
          max: 10ms
  out:
    kind: sink
edges:
  - from: src
    to: map
  - from: map
    to: out
    capacity: 16
"#;
        let spec = GraphSpec::from_yaml("p".into(), yaml).unwrap();
        assert_eq!(spec.nodes.len(), 3);
        assert_eq!(spec.edges[1].capacity, Some(16));
        let retry = spec.nodes[&NodeId::from("map")].retry.as_ref().unwrap();
        assert_eq!(retry.max_attempts, 2);
    }
}
