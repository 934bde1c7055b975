//! In-memory model of a loaded computational graph.
//!
//! The runtime's loader populates a [`Graph`] from a serialized model after
//! type/shape inference and topological sorting; this crate only consumes
//! the result. Nodes reference values by name through [`NodeArg`] defs, the
//! ONNX convention where a missing optional argument is an empty name.

use std::collections::{BTreeSet, HashSet};

use serde::Serialize;
use thiserror::Error;

use crate::alloc::ProviderKind;
use crate::tensor::{Shape, ValueType};

/// Dense index of a logical value in the session's value universe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ValueIndex(pub usize);

/// Dense index of a node in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeIndex(pub usize);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("graph has no topological order bound")]
    TopologicalOrderUnavailable,
}

/// A named use or definition site of a value on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeArg {
    name: String,
    value_type: Option<ValueType>,
}

impl NodeArg {
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        NodeArg {
            name: name.into(),
            value_type: Some(value_type),
        }
    }

    /// An arg whose type is not (yet) known.
    pub fn untyped(name: impl Into<String>) -> Self {
        NodeArg {
            name: name.into(),
            value_type: None,
        }
    }

    /// Placeholder for an omitted optional argument.
    pub fn missing() -> Self {
        NodeArg {
            name: String::new(),
            value_type: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Optional arguments left unbound are represented by the empty name.
    pub fn exists(&self) -> bool {
        !self.name.is_empty()
    }

    pub fn value_type(&self) -> Option<&ValueType> {
        self.value_type.as_ref()
    }

    /// Shape declared on the arg's type, when it is a tensor.
    pub fn declared_shape(&self) -> Option<&Shape> {
        self.value_type
            .as_ref()
            .and_then(|ty| ty.tensor_spec())
            .map(|spec| &spec.shape)
    }

    /// True when the arg carries a non-tensor type (sequence or map).
    pub fn is_non_tensor(&self) -> bool {
        self.value_type
            .as_ref()
            .map(|ty| !ty.is_tensor())
            .unwrap_or(false)
    }
}

/// One operator invocation in the graph.
#[derive(Debug, Clone)]
pub struct Node {
    index: NodeIndex,
    op_type: String,
    name: String,
    provider: ProviderKind,
    inputs: Vec<NodeArg>,
    outputs: Vec<NodeArg>,
}

impl Node {
    pub fn index(&self) -> NodeIndex {
        self.index
    }

    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    pub fn inputs(&self) -> &[NodeArg] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[NodeArg] {
        &self.outputs
    }

    /// Visits every existing def on this node, inputs first.
    pub fn for_each_def<F>(&self, mut f: F)
    where
        F: FnMut(&NodeArg, bool),
    {
        for arg in self.inputs.iter().filter(|arg| arg.exists()) {
            f(arg, true);
        }
        for arg in self.outputs.iter().filter(|arg| arg.exists()) {
            f(arg, false);
        }
    }
}

/// A loaded graph: nodes, the caller-facing input/output lists, the
/// initializer (weight) set, and a topological schedule over the nodes.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    initializers: BTreeSet<String>,
    topo_order: Option<Vec<NodeIndex>>,
    sentinels: HashSet<NodeIndex>,
}

impl Graph {
    pub fn new() -> Self {
        Graph {
            topo_order: Some(Vec::new()),
            ..Graph::default()
        }
    }

    /// Appends a node. Nodes added through this method are recorded in the
    /// topological order in insertion order; loaders that construct nodes
    /// out of order must call [`Graph::set_topological_order`] afterwards.
    pub fn add_node(
        &mut self,
        op_type: impl Into<String>,
        name: impl Into<String>,
        provider: ProviderKind,
        inputs: Vec<NodeArg>,
        outputs: Vec<NodeArg>,
    ) -> NodeIndex {
        let index = NodeIndex(self.nodes.len());
        self.nodes.push(Node {
            index,
            op_type: op_type.into(),
            name: name.into(),
            provider,
            inputs,
            outputs,
        });
        if let Some(order) = self.topo_order.as_mut() {
            order.push(index);
        }
        index
    }

    /// Appends a source/sink placeholder node. Sentinels appear in the
    /// topological order but are excluded from execution planning.
    pub fn add_sentinel(&mut self, name: impl Into<String>) -> NodeIndex {
        let index = self.add_node("Noop", name, ProviderKind::Cpu, Vec::new(), Vec::new());
        self.sentinels.insert(index);
        index
    }

    pub fn is_sentinel(&self, index: NodeIndex) -> bool {
        self.sentinels.contains(&index)
    }

    pub fn node(&self, index: NodeIndex) -> Option<&Node> {
        self.nodes.get(index.0)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn set_inputs(&mut self, names: impl IntoIterator<Item = impl Into<String>>) {
        self.inputs = names.into_iter().map(Into::into).collect();
    }

    pub fn set_outputs(&mut self, names: impl IntoIterator<Item = impl Into<String>>) {
        self.outputs = names.into_iter().map(Into::into).collect();
    }

    pub fn add_initializer(&mut self, name: impl Into<String>) {
        self.initializers.insert(name.into());
    }

    /// Caller-supplied graph inputs, in declaration order.
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    /// Caller-facing graph outputs, in declaration order.
    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn is_graph_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|output| output == name)
    }

    /// Initializer (weight) names, iterated in lexicographic order.
    pub fn initializers(&self) -> &BTreeSet<String> {
        &self.initializers
    }

    pub fn is_initializer(&self, name: &str) -> bool {
        self.initializers.contains(name)
    }

    /// Replaces the node schedule. The order must be a valid topological
    /// sort of the graph; this crate does not re-verify it.
    pub fn set_topological_order(&mut self, order: Vec<NodeIndex>) {
        self.topo_order = Some(order);
    }

    /// Drops the bound schedule, e.g. after structural edits invalidate it.
    pub fn clear_topological_order(&mut self) {
        self.topo_order = None;
    }

    /// The bound topological schedule, sentinels included.
    pub fn topological_order(&self) -> Result<&[NodeIndex], GraphError> {
        self.topo_order
            .as_deref()
            .ok_or(GraphError::TopologicalOrderUnavailable)
    }

    /// Finds the defining or consuming arg for `name` anywhere in the graph,
    /// preferring definition sites (outputs) over uses.
    pub fn find_node_arg(&self, name: &str) -> Option<&NodeArg> {
        let mut found_use = None;
        for node in &self.nodes {
            for arg in node.outputs.iter().filter(|arg| arg.exists()) {
                if arg.name() == name {
                    return Some(arg);
                }
            }
            if found_use.is_none() {
                found_use = node
                    .inputs
                    .iter()
                    .find(|arg| arg.exists() && arg.name() == name);
            }
        }
        found_use
    }
}
