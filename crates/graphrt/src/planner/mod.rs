//! Static allocation planning for sequential graph execution.
//!
//! Given a session whose graph is topologically sorted and whose nodes are
//! bound to kernels, [`create_plan`] decides for every value how its buffer
//! comes into existence (fresh allocation, caller-supplied, static weight,
//! or reuse of another value's buffer) and at which execution step each
//! buffer can be released. The planner is a pure function: it allocates no
//! memory itself and produces a deterministic, immutable [`ExecutionPlan`]
//! the executor replays.
//!
//! Planning runs in five phases: working tables are sized to the value
//! universe, a static reference count and tentative allocator location are
//! computed per value, initializers are pinned as statically allocated,
//! execution is simulated left-to-right to decide buffer reuse against a
//! LIFO freelist, and finally the freelist is compacted into per-step
//! deallocation ranges.

mod cache;
mod print;

use std::collections::VecDeque;

use serde::Serialize;
use thiserror::Error;

use crate::alloc::{AllocatorInfo, MemType, ProviderKind};
use crate::graph::{Graph, GraphError, Node, NodeArg, NodeIndex, ValueIndex};
use crate::session::{PlannerContext, SessionState};
use crate::tensor::ValueType;

pub use cache::{get_or_create_plan, PlanKey};
pub use print::PlanDisplay;

/// How a value's buffer comes into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AllocKind {
    /// Supplied by the caller (graph input); never reused by the planner.
    PreExisting,
    /// Weight/initializer, allocated once for the whole session.
    AllocateStatically,
    /// Allocated fresh when first produced during execution.
    Allocate,
    /// Shares the buffer of `reused_buffer`, the root donor value.
    Reuse { reused_buffer: ValueIndex },
    /// A graph output; allocated fresh and never offered for reuse.
    AllocateOutput,
}

impl Default for AllocKind {
    fn default() -> Self {
        AllocKind::Allocate
    }
}

/// Allocation decision for a single value index.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AllocPlanPerValue {
    pub alloc_kind: AllocKind,
    /// Type descriptor carried through for the executor; `None` when the
    /// graph never declared one.
    pub value_type: Option<ValueType>,
    /// Allocator to place the buffer on. `None` defers the choice to the
    /// executing node's default CPU allocator at run time.
    pub location: Option<AllocatorInfo>,
    /// True when any node incident to this value executes on a non-default
    /// device queue and the executor must create a fence for it.
    pub create_fence: bool,
}

/// One step of the sequential execution schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NodeExecutionPlan {
    pub node_index: NodeIndex,
    /// Inclusive bounds into [`ExecutionPlan::to_be_freed`]. The default
    /// `free_from_index > free_to_index` means the step frees nothing.
    pub free_from_index: usize,
    pub free_to_index: usize,
}

impl NodeExecutionPlan {
    fn new(node_index: NodeIndex) -> Self {
        NodeExecutionPlan {
            node_index,
            free_from_index: 1,
            free_to_index: 0,
        }
    }

    /// Values to release after this step, resolved against `to_be_freed`.
    pub fn free_slice<'a>(&self, to_be_freed: &'a [ValueIndex]) -> &'a [ValueIndex] {
        if self.free_from_index <= self.free_to_index {
            &to_be_freed[self.free_from_index..=self.free_to_index]
        } else {
            &[]
        }
    }
}

/// Non-fatal observations recorded while planning.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PlanDiagnostic {
    /// A later node asked for a weight on a different allocator than the
    /// first-encountered reference already pinned. The first assignment
    /// stands.
    WeightLocationConflict {
        value: ValueIndex,
        assigned: AllocatorInfo,
        requested: AllocatorInfo,
        node: NodeIndex,
    },
}

/// The planner's output: one allocation decision per value, the execution
/// schedule with per-step deallocation ranges, and the flat free list the
/// ranges index into.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionPlan {
    pub allocation_plan: Vec<AllocPlanPerValue>,
    pub execution_plan: Vec<NodeExecutionPlan>,
    pub to_be_freed: Vec<ValueIndex>,
    pub diagnostics: Vec<PlanDiagnostic>,
}

impl ExecutionPlan {
    /// Diagnostic rendering of the plan with value names resolved through
    /// the session. The format is not a stable interface.
    pub fn display<'a>(&'a self, session: &'a SessionState) -> PlanDisplay<'a> {
        PlanDisplay::new(self, session)
    }

    /// Pretty JSON export for offline inspection. Not a stable format.
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("no graph bound to the session")]
    GraphUnavailable,
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("no suitable kernel definition found for op {op_type}{}", .node_name.as_deref().map(|name| format!(" (node {name})")).unwrap_or_default())]
    MissingKernel {
        op_type: String,
        node_name: Option<String>,
    },
    #[error("value name '{name}' has no index in the session")]
    UnknownValue { name: String },
    #[error("node index {0} is out of range for the bound graph")]
    UnknownNode(usize),
    #[error("failed to fingerprint session for plan caching: {0}")]
    Fingerprint(String),
}

/// Plans allocation and deallocation for every value in the session.
///
/// Pure and deterministic: identical inputs produce an identical plan, and
/// no state outside the returned value is touched.
pub fn create_plan(
    session: &SessionState,
    context: &dyn PlannerContext,
) -> Result<ExecutionPlan, PlanError> {
    let graph = session.graph().ok_or(PlanError::GraphUnavailable)?;
    let order = graph.topological_order()?;

    let mut planner = PlannerImpl::new(session, context, graph);
    planner.initialize(order);
    planner.compute_use_counts()?;
    planner.compute_reuse_plan()?;
    planner.generate_deallocation_plan();

    let plan = planner.finish();
    if crate::env::plan_stats_enabled() {
        eprintln!("{}", plan.display(session));
    }
    Ok(plan)
}

/// Working state for one value during planning, discarded afterwards.
struct ValueInfo<'a> {
    /// The arg the value was (first) defined at; used to look up shapes for
    /// freelist matching.
    def_site: Option<&'a NodeArg>,
    /// Static reference count; caller-held values carry one phantom use.
    usecount: usize,
    /// Union-find style pointer to the value whose buffer this value
    /// occupies; initially the value itself, re-pointed to the root donor
    /// on reuse.
    reused_buffer_index: ValueIndex,
}

/// A value whose refcount reached zero, eligible for reuse by later
/// outputs until the entry is claimed.
struct FreeBufferInfo {
    value: ValueIndex,
    /// Step in the execution plan after which the buffer is dead.
    deallocate_point: usize,
}

struct PlannerImpl<'a> {
    session: &'a SessionState,
    context: &'a dyn PlannerContext,
    graph: &'a Graph,
    value_info: Vec<ValueInfo<'a>>,
    /// Most recently freed first; claimed entries are removed outright.
    freelist: VecDeque<FreeBufferInfo>,
    plan: ExecutionPlan,
}

impl<'a> PlannerImpl<'a> {
    fn new(session: &'a SessionState, context: &'a dyn PlannerContext, graph: &'a Graph) -> Self {
        PlannerImpl {
            session,
            context,
            graph,
            value_info: Vec::new(),
            freelist: VecDeque::new(),
            plan: ExecutionPlan::default(),
        }
    }

    /// Phase 1: size the working tables and lay down the execution schedule
    /// with sentinels filtered out.
    fn initialize(&mut self, order: &[NodeIndex]) {
        let num_values = self.session.num_values();
        self.value_info = (0..num_values)
            .map(|i| ValueInfo {
                def_site: None,
                usecount: 0,
                reused_buffer_index: ValueIndex(i),
            })
            .collect();
        self.plan.allocation_plan = vec![AllocPlanPerValue::default(); num_values];
        self.plan.execution_plan = order
            .iter()
            .filter(|index| !self.graph.is_sentinel(**index))
            .map(|index| NodeExecutionPlan::new(*index))
            .collect();
    }

    fn finish(self) -> ExecutionPlan {
        self.plan
    }

    fn index(&self, name: &str) -> Result<ValueIndex, PlanError> {
        self.session
            .value_index(name)
            .ok_or_else(|| PlanError::UnknownValue {
                name: name.to_string(),
            })
    }

    fn node(&self, index: NodeIndex) -> Result<&'a Node, PlanError> {
        self.graph.node(index).ok_or(PlanError::UnknownNode(index.0))
    }

    fn use_count(&self, index: ValueIndex) -> usize {
        self.value_info[index.0].usecount
    }

    fn use_count_mut(&mut self, index: ValueIndex) -> &mut usize {
        &mut self.value_info[index.0].usecount
    }

    /// Root of the buffer-sharing forest `index` currently belongs to.
    fn buffer(&self, index: ValueIndex) -> ValueIndex {
        self.value_info[index.0].reused_buffer_index
    }

    fn alloc_plan_mut(&mut self, index: ValueIndex) -> &mut AllocPlanPerValue {
        &mut self.plan.allocation_plan[index.0]
    }

    /// Resets a value's working state at its definition site.
    fn process_def(&mut self, index: ValueIndex, def_site: Option<&'a NodeArg>) {
        let info = &mut self.value_info[index.0];
        info.usecount = 0;
        info.reused_buffer_index = index;
        info.def_site = def_site;
    }

    /// Phase 2: count static uses of every value and assign tentative
    /// allocator locations from kernel metadata.
    fn compute_use_counts(&mut self) -> Result<(), PlanError> {
        let graph = self.graph;
        let session = self.session;

        // Caller-held values (inputs and weights) carry one phantom use so
        // they survive the whole run and are never picked for reuse.
        for input_name in graph.inputs() {
            let index = self.index(input_name)?;
            self.process_def(index, graph.find_node_arg(input_name));
            *self.use_count_mut(index) += 1;
        }
        for init_name in graph.initializers() {
            let index = self.index(init_name)?;
            self.process_def(index, graph.find_node_arg(init_name));
            *self.use_count_mut(index) += 1;
        }

        for step in 0..self.plan.execution_plan.len() {
            let node_index = self.plan.execution_plan[step].node_index;
            let node = self.node(node_index)?;
            for input in node.inputs().iter().filter(|arg| arg.exists()) {
                let index = self.index(input.name())?;
                *self.use_count_mut(index) += 1;
            }

            let kernel =
                session
                    .kernel_def(node_index)
                    .ok_or_else(|| PlanError::MissingKernel {
                        op_type: node.op_type().to_string(),
                        node_name: (!node.name().is_empty()).then(|| node.name().to_string()),
                    })?;

            // Outputs land on the node's default allocator unless the kernel
            // overrides the memory type for that position. CPU-provider
            // outputs keep an unset location so the executor binds its own
            // default allocator at run time.
            let provider = node.provider();
            for (position, output) in node.outputs().iter().enumerate() {
                if !output.exists() {
                    continue;
                }
                let index = self.index(output.name())?;
                self.process_def(index, Some(output));
                if !provider.is_cpu() {
                    let location = match kernel.output_mem_type(position) {
                        None => provider.default_allocator(MemType::Default),
                        Some(mem_type) => provider.default_allocator(mem_type),
                    };
                    self.alloc_plan_mut(index).location = Some(location);
                }
            }

            if kernel.exec_queue_id() != 0 {
                let mut incident = Vec::new();
                node.for_each_def(|arg, _is_input| incident.push(arg.name().to_string()));
                for name in incident {
                    let index = self.index(&name)?;
                    self.alloc_plan_mut(index).create_fence = true;
                }
            }
        }

        for output_name in graph.outputs() {
            let index = self.index(output_name)?;
            *self.use_count_mut(index) += 1;
        }
        Ok(())
    }

    /// Phase 3: pin every initializer that feeds a scheduled node as
    /// statically allocated on the provider the first reference implies.
    fn generate_weight_plan(&mut self) -> Result<(), PlanError> {
        let graph = self.graph;
        let session = self.session;

        for step in 0..self.plan.execution_plan.len() {
            let node_index = self.plan.execution_plan[step].node_index;
            let node = self.node(node_index)?;
            let Some(kernel) = session.kernel_def(node_index) else {
                continue;
            };
            for (position, input) in node.inputs().iter().enumerate() {
                if !input.exists() || !graph.is_initializer(input.name()) {
                    continue;
                }
                let wt_index = self.index(input.name())?;
                // Weights are never produced by a node, so honoring a
                // CPU-explicit input contract by pinning the weight on the
                // CPU provider is safe.
                let location = if kernel.input_on_cpu_explicitly(position) {
                    ProviderKind::Cpu.default_allocator(MemType::Default)
                } else {
                    node.provider().default_allocator(MemType::Default)
                };
                if matches!(
                    self.plan.allocation_plan[wt_index.0].alloc_kind,
                    AllocKind::AllocateStatically
                ) {
                    // First reference wins; weights are read-only and
                    // device-stable, so a disagreement is surfaced but never
                    // overwrites the pinned location.
                    if let Some(assigned) = self.plan.allocation_plan[wt_index.0].location {
                        if assigned != location {
                            self.plan
                                .diagnostics
                                .push(PlanDiagnostic::WeightLocationConflict {
                                    value: wt_index,
                                    assigned,
                                    requested: location,
                                    node: node_index,
                                });
                        }
                    }
                    continue;
                }
                let plan = self.alloc_plan_mut(wt_index);
                plan.alloc_kind = AllocKind::AllocateStatically;
                plan.location = Some(location);
            }
        }
        Ok(())
    }

    /// Phase 4: simulate execution and decide, per output, between fresh
    /// allocation, in-place reuse of an input, and claiming a dead buffer
    /// off the freelist.
    fn compute_reuse_plan(&mut self) -> Result<(), PlanError> {
        let graph = self.graph;

        // Input buffers are owned by the caller; record their types and keep
        // them out of every reuse path.
        for input_name in graph.inputs() {
            let index = self.index(input_name)?;
            let value_type = self.value_info[index.0]
                .def_site
                .and_then(|arg| arg.value_type().cloned());
            let plan = self.alloc_plan_mut(index);
            plan.alloc_kind = AllocKind::PreExisting;
            plan.value_type = value_type;
        }

        self.generate_weight_plan()?;

        for program_counter in 0..self.plan.execution_plan.len() {
            let node_index = self.plan.execution_plan[program_counter].node_index;
            let node = self.node(node_index)?;

            // Outputs first: decide where each one lives.
            let mut output_arg_num = 0;
            for output in node.outputs() {
                if !output.exists() {
                    continue;
                }
                let current = self.index(output.name())?;
                self.alloc_plan_mut(current).value_type = output.value_type().cloned();
                if graph.is_graph_output(output.name()) {
                    // The caller observes this buffer; never hand it a
                    // recycled intermediate.
                    self.alloc_plan_mut(current).alloc_kind = AllocKind::AllocateOutput;
                } else if output.is_non_tensor() {
                    // Sharing is not attempted for sequences/maps.
                    self.alloc_plan_mut(current).alloc_kind = AllocKind::Allocate;
                } else if let Some(reused) =
                    self.find_reusable_input(node, output, output_arg_num)?
                {
                    self.reuse(reused, current);
                } else if let Some(reused) = self.find_reusable_tensor(output, current) {
                    self.reuse(reused, current);
                } else {
                    self.alloc_plan_mut(current).alloc_kind = AllocKind::Allocate;
                }
                output_arg_num += 1;
            }

            // Then retire this node's inputs.
            for input in node.inputs() {
                if !input.exists() {
                    continue;
                }
                let original = self.buffer(self.index(input.name())?);
                let usecount = self.use_count_mut(original);
                *usecount -= 1;
                if *usecount == 0 {
                    self.freelist.push_front(FreeBufferInfo {
                        value: original,
                        deallocate_point: program_counter,
                    });
                }
            }

            // Outputs that are produced but never consumed die immediately.
            for output in node.outputs() {
                if !output.exists() {
                    continue;
                }
                let original = self.buffer(self.index(output.name())?);
                if self.use_count(original) == 0 {
                    self.freelist.push_front(FreeBufferInfo {
                        value: original,
                        deallocate_point: program_counter,
                    });
                }
            }
        }
        Ok(())
    }

    /// Points `reused_for` at the root buffer underlying `reused` and moves
    /// its outstanding uses onto that root.
    fn reuse(&mut self, reused: ValueIndex, reused_for: ValueIndex) {
        debug_assert_ne!(reused, reused_for);
        let original = self.buffer(reused);
        self.value_info[reused_for.0].reused_buffer_index = original;
        let transferred = self.use_count(reused_for);
        *self.use_count_mut(original) += transferred;
        self.alloc_plan_mut(reused_for).alloc_kind = AllocKind::Reuse {
            reused_buffer: original,
        };
    }

    /// Looks for an input of `node` whose buffer output `output` can take
    /// over: first kernel-mandated aliases, then in-place pairs whose input
    /// dies at this very step and matches the output's size.
    fn find_reusable_input(
        &self,
        node: &Node,
        output: &NodeArg,
        output_arg_num: usize,
    ) -> Result<Option<ValueIndex>, PlanError> {
        // The use-count pass already rejected nodes without kernels.
        let Some(kernel) = self.session.kernel_def(node.index()) else {
            return Ok(None);
        };
        let inputs = node.inputs();

        for (input_pos, output_pos) in kernel.alias().iter().copied() {
            if output_pos != output_arg_num {
                continue;
            }
            // The kernel requires this aliasing (e.g. reshape), size checks
            // do not apply.
            if let Some(input) = inputs.get(input_pos) {
                if input.exists() {
                    return Ok(Some(self.index(input.name())?));
                }
            }
        }

        for (input_pos, output_pos) in kernel.may_inplace().iter().copied() {
            if output_pos != output_arg_num {
                continue;
            }
            let Some(input) = inputs.get(input_pos) else {
                continue;
            };
            if !input.exists() {
                continue;
            }
            let input_index = self.index(input.name())?;
            let original = self.buffer(input_index);
            if self.use_count(original) == 1 && self.same_size(input, output) {
                // Last use of the buffer is this consumption; either the raw
                // index or its root denotes the same storage.
                return Ok(Some(input_index));
            }
        }
        Ok(None)
    }

    /// Claims the most recently freed buffer compatible with `output`:
    /// identical allocator, known shapes, matching size.
    fn find_reusable_tensor(&mut self, output: &NodeArg, current: ValueIndex) -> Option<ValueIndex> {
        self.context.shape_of(output)?;
        let required_location = self.plan.allocation_plan[current.0].location;

        let mut claimed = None;
        for (position, entry) in self.freelist.iter().enumerate() {
            let reusable = entry.value;
            let Some(def_site) = self.value_info[reusable.0].def_site else {
                continue;
            };
            if self.plan.allocation_plan[reusable.0].location != required_location {
                continue;
            }
            if self.context.shape_of(def_site).is_some() && self.same_size(def_site, output) {
                claimed = Some((position, reusable));
                break;
            }
        }
        let (position, reusable) = claimed?;
        self.freelist.remove(position);
        Some(reusable)
    }

    /// Conservative size equality: both args must exist with known shapes,
    /// equal element sizes, and axis-wise equal extents (known extents must
    /// match exactly, symbolic extents must carry the same symbol).
    fn same_size(&self, a: &NodeArg, b: &NodeArg) -> bool {
        if !a.exists() || !b.exists() {
            return false;
        }
        let (Some(shape_a), Some(shape_b)) = (self.context.shape_of(a), self.context.shape_of(b))
        else {
            // Unknown shapes may be of any size; assume they differ.
            return false;
        };
        let (Some(elem_a), Some(elem_b)) = (
            a.value_type().and_then(ValueType::element_size),
            b.value_type().and_then(ValueType::element_size),
        ) else {
            return false;
        };
        elem_a == elem_b && shape_a.same_shape(shape_b)
    }

    /// Phase 5: compact the freelist into `to_be_freed` with per-step
    /// inclusive ranges, walking oldest freeings first.
    fn generate_deallocation_plan(&mut self) {
        self.plan.to_be_freed.reserve(self.freelist.len());
        let mut prev_dealloc_point: Option<usize> = None;
        let mut current = 0usize;
        for entry in self.freelist.iter().rev() {
            self.plan.to_be_freed.push(entry.value);
            if prev_dealloc_point != Some(entry.deallocate_point) {
                if let Some(prev) = prev_dealloc_point {
                    self.plan.execution_plan[prev].free_to_index = current - 1;
                }
                prev_dealloc_point = Some(entry.deallocate_point);
                self.plan.execution_plan[entry.deallocate_point].free_from_index = current;
            }
            current += 1;
        }
        if let Some(prev) = prev_dealloc_point {
            self.plan.execution_plan[prev].free_to_index = current - 1;
        }
    }
}
