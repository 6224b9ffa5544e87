use crate::registry::NodeRegistry;
use edgecore::{
    AcquisitionSource, GraphError, GraphSettings, GraphSpec, NodeCounters, NodeId, NodeOutputs,
    NodeRole, NodeSpec, RandomSource, Stream, StreamBuffer, StreamLabel, Transform,
};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A validated graph with its buffers allocated and routing resolved.
///
/// Node instances are not held here; acquisition and worker tasks ask for
/// fresh ones so a restarted task starts from a clean node.
pub struct DataFlowGraph {
    spec: GraphSpec,
    root: NodeId,
    order: Vec<NodeId>,
    routes: HashMap<StreamLabel, Vec<NodeId>>,
    inbound: HashMap<NodeId, Vec<StreamLabel>>,
    outputs: HashMap<NodeId, Arc<NodeOutputs>>,
    sequences: HashMap<StreamLabel, AtomicU64>,
}

impl DataFlowGraph {
    /// Validate `spec` and allocate one bounded buffer per declared stream.
    pub fn build(
        spec: GraphSpec,
        registry: &NodeRegistry,
        random: Arc<dyn RandomSource>,
    ) -> Result<Self, GraphError> {
        let layout = validate(&spec, registry)?;

        let outputs = spec
            .nodes
            .iter()
            .map(|node| {
                let buffers = node.outputs.iter().map(|stream| {
                    Arc::new(buffer_for(&node.id, stream, &spec.settings))
                });
                let outputs = NodeOutputs::new(
                    node.id.clone(),
                    buffers,
                    Arc::new(NodeCounters::new()),
                    random.clone(),
                );
                (node.id.clone(), Arc::new(outputs))
            })
            .collect();

        let sequences = spec
            .nodes
            .iter()
            .flat_map(|node| {
                node.outputs
                    .iter()
                    .map(move |stream| StreamLabel::new(node.id.clone(), stream.index))
            })
            .filter(|label| !layout.routes.contains_key(label))
            .map(|label| (label, AtomicU64::new(0)))
            .collect();

        tracing::debug!(
            "Built graph {} with {} transforms in order {:?}",
            spec.name,
            layout.order.len(),
            layout.order
        );

        Ok(Self {
            spec,
            root: layout.root,
            order: layout.order,
            routes: layout.routes,
            inbound: layout.inbound,
            outputs,
            sequences,
        })
    }

    /// Run every structural check without allocating buffers.
    pub fn validate(spec: &GraphSpec, registry: &NodeRegistry) -> Result<(), GraphError> {
        validate(spec, registry).map(|_| ())
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &GraphSpec {
        &self.spec
    }

    pub fn settings(&self) -> &GraphSettings {
        &self.spec.settings
    }

    pub fn root(&self) -> &NodeId {
        &self.root
    }

    pub fn root_spec(&self) -> Option<&NodeSpec> {
        self.spec.find_node(&self.root)
    }

    /// Transform nodes in topological order.
    pub fn transform_order(&self) -> &[NodeId] {
        &self.order
    }

    /// Downstream transforms fed by `label`.
    pub fn routes_from(&self, label: &StreamLabel) -> &[NodeId] {
        self.routes.get(label).map(Vec::as_slice).unwrap_or(&[])
    }

    /// A stream with no outgoing edge is delivered to remote storage.
    pub fn is_terminal(&self, label: &StreamLabel) -> bool {
        !self.routes.contains_key(label)
    }

    pub fn inbound(&self, node: &str) -> &[StreamLabel] {
        self.inbound.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn outputs(&self, node: &str) -> Option<&Arc<NodeOutputs>> {
        self.outputs.get(node)
    }

    pub fn counters(&self, node: &str) -> Option<&Arc<NodeCounters>> {
        self.outputs.get(node).map(|outputs| outputs.counters())
    }

    /// Every node with its role, in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = (&NodeId, NodeRole)> {
        self.spec.nodes.iter().map(|node| (&node.id, node.role))
    }

    pub fn stream(&self, label: &StreamLabel) -> Option<&Stream> {
        self.spec.find_node(&label.node)?.find_stream(label.stream)
    }

    /// Next delivery sequence number for a terminal stream.
    ///
    /// Lives on the graph so it keeps counting across worker restarts.
    pub fn next_sequence(&self, label: &StreamLabel) -> u64 {
        self.sequences
            .get(label)
            .map(|counter| counter.fetch_add(1, Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn instantiate_source(
        &self,
        registry: &NodeRegistry,
    ) -> Result<Box<dyn AcquisitionSource>, GraphError> {
        let spec = self
            .root_spec()
            .ok_or_else(|| GraphError::NodeNotFound(self.root.clone()))?;
        registry
            .create_node(spec)?
            .into_source()
            .ok_or_else(|| GraphError::Invalid(format!("Node {} is not a source", spec.id)))
    }

    pub fn instantiate_transforms(
        &self,
        registry: &NodeRegistry,
    ) -> Result<HashMap<NodeId, Box<dyn Transform>>, GraphError> {
        let mut transforms = HashMap::with_capacity(self.order.len());
        for id in &self.order {
            let spec = self
                .spec
                .find_node(id)
                .ok_or_else(|| GraphError::NodeNotFound(id.clone()))?;
            let transform = registry
                .create_node(spec)?
                .into_transform()
                .ok_or_else(|| GraphError::Invalid(format!("Node {} is not a transform", id)))?;
            transforms.insert(id.clone(), transform);
        }
        Ok(transforms)
    }
}

impl std::fmt::Debug for DataFlowGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFlowGraph")
            .field("name", &self.spec.name)
            .field("root", &self.root)
            .field("order", &self.order)
            .finish()
    }
}

fn buffer_for(node: &NodeId, stream: &Stream, settings: &GraphSettings) -> StreamBuffer {
    StreamBuffer::new(
        StreamLabel::new(node.clone(), stream.index),
        stream.clone(),
        settings.buffer_capacity,
        settings.overflow,
        settings.publish_timeout(),
    )
}

struct Layout {
    root: NodeId,
    order: Vec<NodeId>,
    routes: HashMap<StreamLabel, Vec<NodeId>>,
    inbound: HashMap<NodeId, Vec<StreamLabel>>,
}

fn validate(spec: &GraphSpec, registry: &NodeRegistry) -> Result<Layout, GraphError> {
    let mut graph: DiGraph<NodeId, ()> = DiGraph::new();
    let mut node_to_index: HashMap<&str, NodeIndex> = HashMap::new();

    for node in &spec.nodes {
        if node_to_index.contains_key(node.id.as_str()) {
            return Err(GraphError::DuplicateNode(node.id.clone()));
        }

        let mut indices = HashSet::new();
        for stream in &node.outputs {
            if !indices.insert(stream.index) {
                return Err(GraphError::DuplicateStreamIndex {
                    node: node.id.clone(),
                    index: stream.index,
                });
            }
            stream.validate()?;
        }

        registry.validate_node(node)?;

        let idx = graph.add_node(node.id.clone());
        node_to_index.insert(node.id.as_str(), idx);
    }

    let roots: Vec<&NodeSpec> = spec
        .nodes
        .iter()
        .filter(|node| node.role == NodeRole::Acquisition)
        .collect();
    let root = match roots.as_slice() {
        [root] => root.id.clone(),
        _ => return Err(GraphError::RootCount(roots.len())),
    };

    let mut routes: HashMap<StreamLabel, Vec<NodeId>> = HashMap::new();
    let mut inbound: HashMap<NodeId, Vec<StreamLabel>> = HashMap::new();

    for edge in &spec.edges {
        let from = spec
            .find_node(&edge.from_node)
            .ok_or_else(|| GraphError::NodeNotFound(edge.from_node.clone()))?;
        if from.find_stream(edge.from_stream).is_none() {
            return Err(GraphError::UnknownStream {
                node: edge.from_node.clone(),
                index: edge.from_stream,
            });
        }
        let to = spec
            .find_node(&edge.to_node)
            .ok_or_else(|| GraphError::NodeNotFound(edge.to_node.clone()))?;
        if to.role != NodeRole::Transform {
            return Err(GraphError::InvalidConnection(format!(
                "{}#{} -> {}: only transforms accept inbound streams",
                edge.from_node, edge.from_stream, edge.to_node
            )));
        }

        let label = StreamLabel::new(edge.from_node.clone(), edge.from_stream);
        let targets = routes.entry(label.clone()).or_default();
        if targets.contains(&edge.to_node) {
            return Err(GraphError::InvalidConnection(format!(
                "duplicate edge {} -> {}",
                label, edge.to_node
            )));
        }
        targets.push(edge.to_node.clone());
        inbound.entry(edge.to_node.clone()).or_default().push(label);

        let from_idx = node_to_index[from.id.as_str()];
        let to_idx = node_to_index[to.id.as_str()];
        graph.add_edge(from_idx, to_idx, ());
    }

    let sorted = toposort(&graph, None).map_err(|_| GraphError::CyclicDependency)?;

    let mut reachable = HashSet::new();
    let mut dfs = Dfs::new(&graph, node_to_index[root.as_str()]);
    while let Some(idx) = dfs.next(&graph) {
        reachable.insert(idx);
    }
    for node in &spec.nodes {
        if !reachable.contains(&node_to_index[node.id.as_str()]) {
            return Err(GraphError::Unreachable(node.id.clone()));
        }
    }

    let order = sorted
        .into_iter()
        .map(|idx| graph[idx].clone())
        .filter(|id| *id != root)
        .collect();

    Ok(Layout {
        root,
        order,
        routes,
        inbound,
    })
}
