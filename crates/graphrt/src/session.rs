//! Read-only session state consumed by the allocation planner.
//!
//! A [`SessionState`] bundles the loaded graph with the dense value-name
//! index map and the per-node kernel bindings produced earlier in session
//! initialization. The planner treats all of it as immutable input.

use std::collections::HashMap;

use crate::alloc::{AllocatorInfo, MemType};
use crate::graph::{Graph, NodeArg, NodeIndex, ValueIndex};
use crate::kernel::KernelDef;
use crate::tensor::Shape;

/// Shape oracle for planner decisions. The default implementation reads the
/// shape declared on each arg; a session that ran shape inference can
/// substitute its own provider.
pub trait PlannerContext {
    /// Best-known shape of the value behind `arg`, or `None` when unknown.
    fn shape_of<'a>(&'a self, arg: &'a NodeArg) -> Option<&'a Shape>;
}

/// [`PlannerContext`] that trusts the shapes declared on node args.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeclaredShapes;

impl PlannerContext for DeclaredShapes {
    fn shape_of<'a>(&'a self, arg: &'a NodeArg) -> Option<&'a Shape> {
        arg.declared_shape()
    }
}

/// Immutable bundle of everything planning needs to know about a session.
#[derive(Debug, Default)]
pub struct SessionState {
    graph: Option<Graph>,
    value_indices: HashMap<String, ValueIndex>,
    value_names: Vec<String>,
    kernels: HashMap<NodeIndex, KernelDef>,
}

impl SessionState {
    /// Builds session state over `graph`, assigning every distinct value
    /// name a dense index. Graph inputs come first, then initializers, then
    /// node args in schedule-independent node order; the assignment is
    /// deterministic for a given graph.
    pub fn new(graph: Graph) -> Self {
        let mut state = SessionState::default();
        for name in graph.inputs() {
            state.register_value(name);
        }
        for name in graph.initializers() {
            state.register_value(name);
        }
        for node in graph.nodes() {
            for arg in node.inputs().iter().filter(|arg| arg.exists()) {
                state.register_value(arg.name());
            }
            for arg in node.outputs().iter().filter(|arg| arg.exists()) {
                state.register_value(arg.name());
            }
        }
        state.graph = Some(graph);
        state
    }

    /// A session with no graph bound; planning over it fails.
    pub fn unbound() -> Self {
        SessionState::default()
    }

    fn register_value(&mut self, name: &str) -> ValueIndex {
        if let Some(index) = self.value_indices.get(name) {
            return *index;
        }
        let index = ValueIndex(self.value_names.len());
        self.value_indices.insert(name.to_string(), index);
        self.value_names.push(name.to_string());
        index
    }

    pub fn graph(&self) -> Option<&Graph> {
        self.graph.as_ref()
    }

    /// Number of distinct values in the session; value indices are dense in
    /// `[0, num_values)`.
    pub fn num_values(&self) -> usize {
        self.value_names.len()
    }

    pub fn value_index(&self, name: &str) -> Option<ValueIndex> {
        self.value_indices.get(name).copied()
    }

    pub fn value_name(&self, index: ValueIndex) -> Option<&str> {
        self.value_names.get(index.0).map(String::as_str)
    }

    /// Binds the kernel chosen for `node` during kernel resolution.
    pub fn bind_kernel(&mut self, node: NodeIndex, def: KernelDef) {
        self.kernels.insert(node, def);
    }

    /// The kernel bound to `node`, if resolution produced one.
    pub fn kernel_def(&self, node: NodeIndex) -> Option<&KernelDef> {
        self.kernels.get(&node)
    }

    /// Default allocator for `node`'s provider at the requested memory type.
    pub fn allocator_info(&self, node: NodeIndex, mem_type: MemType) -> Option<AllocatorInfo> {
        let graph = self.graph.as_ref()?;
        let node = graph.node(node)?;
        Some(node.provider().default_allocator(mem_type))
    }
}
