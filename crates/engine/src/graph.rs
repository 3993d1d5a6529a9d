// SPDX-License-Identifier: Apache-2.0

//! Typed graph builder.
//!
//! The builder pairs live node implementations with the declarative
//! [`GraphSpec`]: `add_*` registers a node and returns a typed handle,
//! `connect` wires two handles with compile-time item-type matching, and
//! `build` validates the spec and produces an executable [`Plan`].
//!
//! Item types are erased at the wiring boundary: every edge records a
//! factory that creates its typed pipe, and every node records a launch
//! closure that downcasts its endpoints back to their concrete types.
//! The downcasts cannot fail for graphs built through the typed API; the
//! scheduler treats a mismatch as an internal error.

use crate::error::Error;
use crate::node::{Filter, MergePolicy, Sink, Source, Transform};
use crate::resilient::RetryPolicy;
use crate::runner::{LaunchFn, NodeEntry, NodeRuntime};
use rill_channel::pipe;
use rill_config::graph::{EdgeSpec, GraphSpec};
use rill_config::node::{NodeKind, NodeSpec};
use rill_config::parallel::ParallelOptions;
use rill_config::{DEFAULT_PORT, NodeId, PipelineId};
use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::node::Item;

/// Boxed, type-erased pipe endpoint.
pub(crate) type AnyBox = Box<dyn Any + Send>;

/// Handle to a source node producing `T`.
#[derive(Debug, Clone)]
pub struct SourceHandle<T> {
    id: NodeId,
    _marker: PhantomData<fn() -> T>,
}

/// Handle to a transform node mapping `In` to `Out`.
#[derive(Debug, Clone)]
pub struct TransformHandle<In, Out> {
    id: NodeId,
    _marker: PhantomData<fn(In) -> Out>,
}

/// Handle to a filter node over `T`.
#[derive(Debug, Clone)]
pub struct FilterHandle<T> {
    id: NodeId,
    _marker: PhantomData<fn(T) -> T>,
}

/// Handle to a merge node over `T`.
#[derive(Debug, Clone)]
pub struct MergeHandle<T> {
    id: NodeId,
    _marker: PhantomData<fn(T) -> T>,
}

/// Handle to a sink node consuming `T`.
#[derive(Debug, Clone)]
pub struct SinkHandle<T> {
    id: NodeId,
    _marker: PhantomData<fn(T)>,
}

/// Any node handle, for options that apply to every kind.
pub trait NodeHandle {
    /// The id of the node this handle refers to.
    fn id(&self) -> &NodeId;
}

/// A handle whose node produces items of type `T`.
pub trait Upstream<T: Item>: NodeHandle {}

/// A handle whose node consumes items of type `T`.
pub trait Downstream<T: Item>: NodeHandle {}

macro_rules! impl_node_handle {
    ($ty:ident < $($p:ident),+ >) => {
        impl<$($p),+> NodeHandle for $ty<$($p),+> {
            fn id(&self) -> &NodeId {
                &self.id
            }
        }
    };
}

impl_node_handle!(SourceHandle<T>);
impl_node_handle!(TransformHandle<In, Out>);
impl_node_handle!(FilterHandle<T>);
impl_node_handle!(MergeHandle<T>);
impl_node_handle!(SinkHandle<T>);

impl<T: Item> Upstream<T> for SourceHandle<T> {}
impl<In, T: Item> Upstream<T> for TransformHandle<In, T> {}
impl<T: Item> Upstream<T> for FilterHandle<T> {}
impl<T: Item> Upstream<T> for MergeHandle<T> {}

impl<T: Item, Out> Downstream<T> for TransformHandle<T, Out> {}
impl<T: Item> Downstream<T> for FilterHandle<T> {}
impl<T: Item> Downstream<T> for MergeHandle<T> {}
impl<T: Item> Downstream<T> for SinkHandle<T> {}

/// An edge plus the factory creating its typed pipe at run time.
pub(crate) struct EdgePlan {
    pub from: NodeId,
    pub to: NodeId,
    pub capacity: Option<usize>,
    pub make_pipe: Box<dyn Fn(usize) -> (AnyBox, AnyBox) + Send>,
}

/// The executable output of [`GraphBuilder::build`].
///
/// Consumed by the runner: node launch closures are one-shot, so a plan
/// runs exactly once. Build a fresh plan (with fresh node instances) for
/// every run.
pub struct Plan {
    pub(crate) pipeline_id: PipelineId,
    pub(crate) spec: GraphSpec,
    pub(crate) entries: HashMap<NodeId, NodeEntry>,
    pub(crate) edges: Vec<EdgePlan>,
    pub(crate) retries: HashMap<NodeId, Arc<RetryPolicy>>,
    pub(crate) topo: Vec<NodeId>,
}

impl Plan {
    /// The id of the pipeline this plan executes.
    #[must_use]
    pub fn pipeline_id(&self) -> &PipelineId {
        &self.pipeline_id
    }

    /// The validated declarative spec underlying this plan.
    #[must_use]
    pub fn spec(&self) -> &GraphSpec {
        &self.spec
    }
}

/// Builder for a typed dataflow graph.
pub struct GraphBuilder {
    pipeline_id: PipelineId,
    spec: GraphSpec,
    duplicate_nodes: Vec<NodeId>,
    entries: HashMap<NodeId, NodeEntry>,
    edges: Vec<EdgePlan>,
    retries: HashMap<NodeId, Arc<RetryPolicy>>,
}

impl GraphBuilder {
    /// Creates a builder for the given pipeline id.
    #[must_use]
    pub fn new(pipeline_id: impl Into<PipelineId>) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            spec: GraphSpec::default(),
            duplicate_nodes: Vec::new(),
            entries: HashMap::new(),
            edges: Vec::new(),
            retries: HashMap::new(),
        }
    }

    /// Overrides the default pipe capacity used for edges without an
    /// explicit capacity.
    #[must_use]
    pub fn with_default_pipe_capacity(mut self, capacity: usize) -> Self {
        self.spec.settings.default_pipe_capacity = capacity.max(1);
        self
    }

    /// Adds a source node.
    pub fn add_source<T: Item>(
        &mut self,
        id: impl Into<NodeId>,
        source: impl Source<T> + 'static,
    ) -> SourceHandle<T> {
        let id = id.into();
        let mut spec = NodeSpec::new(NodeKind::Source);
        spec.output_type = Some(std::any::type_name::<T>().to_owned());
        self.insert_node(id.clone(), spec, NodeEntry {
            kind: NodeKind::Source,
            launch: source_launcher(source),
        });
        SourceHandle {
            id,
            _marker: PhantomData,
        }
    }

    /// Adds a transform node.
    pub fn add_transform<In: Item, Out: Item>(
        &mut self,
        id: impl Into<NodeId>,
        transform: impl Transform<In, Out> + 'static,
    ) -> TransformHandle<In, Out> {
        let id = id.into();
        let mut spec = NodeSpec::new(NodeKind::Transform);
        spec.input_type = Some(std::any::type_name::<In>().to_owned());
        spec.output_type = Some(std::any::type_name::<Out>().to_owned());
        self.insert_node(id.clone(), spec, NodeEntry {
            kind: NodeKind::Transform,
            launch: transform_launcher(transform),
        });
        TransformHandle {
            id,
            _marker: PhantomData,
        }
    }

    /// Adds a filter node.
    pub fn add_filter<T: Item>(
        &mut self,
        id: impl Into<NodeId>,
        filter: impl Filter<T> + 'static,
    ) -> FilterHandle<T> {
        let id = id.into();
        let mut spec = NodeSpec::new(NodeKind::Filter);
        spec.input_type = Some(std::any::type_name::<T>().to_owned());
        spec.output_type = Some(std::any::type_name::<T>().to_owned());
        self.insert_node(id.clone(), spec, NodeEntry {
            kind: NodeKind::Filter,
            launch: filter_launcher(filter),
        });
        FilterHandle {
            id,
            _marker: PhantomData,
        }
    }

    /// Adds a merge node folding several same-typed inputs into one
    /// output. Input priority (for [`MergePolicy::Prioritized`]) follows
    /// connection order.
    pub fn add_merge<T: Item>(
        &mut self,
        id: impl Into<NodeId>,
        policy: MergePolicy<T>,
    ) -> MergeHandle<T> {
        let id = id.into();
        let mut spec = NodeSpec::new(NodeKind::Merge);
        spec.input_type = Some(std::any::type_name::<T>().to_owned());
        spec.output_type = Some(std::any::type_name::<T>().to_owned());
        self.insert_node(id.clone(), spec, NodeEntry {
            kind: NodeKind::Merge,
            launch: merge_launcher(policy),
        });
        MergeHandle {
            id,
            _marker: PhantomData,
        }
    }

    /// Adds a sink node.
    pub fn add_sink<T: Item>(
        &mut self,
        id: impl Into<NodeId>,
        sink: impl Sink<T> + 'static,
    ) -> SinkHandle<T> {
        let id = id.into();
        let mut spec = NodeSpec::new(NodeKind::Sink);
        spec.input_type = Some(std::any::type_name::<T>().to_owned());
        self.insert_node(id.clone(), spec, NodeEntry {
            kind: NodeKind::Sink,
            launch: sink_launcher(sink),
        });
        SinkHandle {
            id,
            _marker: PhantomData,
        }
    }

    /// Connects an upstream handle to a downstream handle. The item types
    /// must match; the compiler enforces it.
    pub fn connect<T: Item>(&mut self, up: &impl Upstream<T>, down: &impl Downstream<T>) {
        self.connect_inner::<T>(up.id().clone(), down.id().clone(), None);
    }

    /// Connects two handles with an explicit pipe capacity for the edge.
    pub fn connect_with_capacity<T: Item>(
        &mut self,
        up: &impl Upstream<T>,
        down: &impl Downstream<T>,
        capacity: usize,
    ) {
        self.connect_inner::<T>(up.id().clone(), down.id().clone(), Some(capacity.max(1)));
    }

    fn connect_inner<T: Item>(&mut self, from: NodeId, to: NodeId, capacity: Option<usize>) {
        self.spec.edges.push(EdgeSpec {
            from: from.clone(),
            out_port: DEFAULT_PORT.into(),
            to: to.clone(),
            in_port: DEFAULT_PORT.into(),
            capacity,
        });
        self.edges.push(EdgePlan {
            from,
            to,
            capacity,
            make_pipe: Box::new(|cap| {
                let (tx, rx) = pipe::<T>(cap);
                (Box::new(tx) as AnyBox, Box::new(rx) as AnyBox)
            }),
        });
    }

    /// Attaches a retry policy to a node, overriding the run default.
    pub fn with_retry(&mut self, handle: &impl NodeHandle, policy: RetryPolicy) {
        if let Some(node) = self.spec.nodes.get_mut(handle.id()) {
            node.retry = Some(policy.options.clone());
        }
        let _ = self.retries.insert(handle.id().clone(), Arc::new(policy));
    }

    /// Attaches parallel execution options to a transform or filter node.
    ///
    /// Lossy queue policies are inherently unordered: `preserve_ordering`
    /// is cleared (with a warning) when one is configured.
    pub fn with_parallelism(&mut self, handle: &impl NodeHandle, options: ParallelOptions) {
        let mut options = options;
        if options.queue_policy.is_lossy() && options.preserve_ordering {
            log::warn!(
                "Node {}: {:?} queue policy is inherently unordered; clearing preserve_ordering",
                handle.id(),
                options.queue_policy
            );
            options.preserve_ordering = false;
        }
        if let Some(node) = self.spec.nodes.get_mut(handle.id()) {
            node.parallel = Some(options);
        }
    }

    /// Validates the graph and produces the executable plan.
    ///
    /// # Errors
    ///
    /// Returns a [`Error::ConfigError`] carrying every structural
    /// violation found (duplicate ids, cycles, type mismatches, arity
    /// violations, unreachable nodes, invalid options).
    pub fn build(self) -> Result<Plan, Error> {
        let mut errors: Vec<rill_config::error::Error> = self
            .duplicate_nodes
            .iter()
            .map(|node_id| rill_config::error::Error::DuplicateNode {
                context: rill_config::error::Context::new(self.pipeline_id.clone()),
                node_id: node_id.clone(),
            })
            .collect();

        match self.spec.validate(&self.pipeline_id) {
            Ok(()) => {}
            Err(rill_config::error::Error::InvalidGraph { errors: found }) => {
                errors.extend(found);
            }
            Err(other) => errors.push(other),
        }

        if !errors.is_empty() {
            return Err(Error::ConfigError(Box::new(
                rill_config::error::Error::InvalidGraph { errors },
            )));
        }

        let topo = self.spec.topo_order();
        Ok(Plan {
            pipeline_id: self.pipeline_id,
            spec: self.spec,
            entries: self.entries,
            edges: self.edges,
            retries: self.retries,
            topo,
        })
    }

    fn insert_node(&mut self, id: NodeId, spec: NodeSpec, entry: NodeEntry) {
        if self.spec.nodes.contains_key(&id) {
            self.duplicate_nodes.push(id);
            return;
        }
        let _ = self.spec.nodes.insert(id.clone(), spec);
        let _ = self.entries.insert(id, entry);
    }
}

fn source_launcher<T: Item, S: Source<T> + 'static>(source: S) -> LaunchFn {
    Box::new(move |rt: NodeRuntime| Box::pin(async move { crate::runner::run_source(source, rt).await }))
}

fn transform_launcher<In: Item, Out: Item>(
    transform: impl Transform<In, Out> + 'static,
) -> LaunchFn {
    let stage = Arc::new(crate::parallel::TransformStage::new(Arc::new(transform)));
    Box::new(move |rt: NodeRuntime| Box::pin(crate::runner::run_stage_node::<In, Out>(stage, rt)))
}

fn filter_launcher<T: Item>(filter: impl Filter<T> + 'static) -> LaunchFn {
    let stage = Arc::new(crate::parallel::FilterStage::new(Arc::new(filter)));
    Box::new(move |rt: NodeRuntime| Box::pin(crate::runner::run_stage_node::<T, T>(stage, rt)))
}

fn merge_launcher<T: Item>(policy: MergePolicy<T>) -> LaunchFn {
    Box::new(move |rt: NodeRuntime| Box::pin(crate::runner::run_merge(policy, rt)))
}

fn sink_launcher<T: Item, S: Sink<T> + 'static>(sink: S) -> LaunchFn {
    Box::new(move |rt: NodeRuntime| Box::pin(async move { crate::runner::run_sink(sink, rt).await }))
}
