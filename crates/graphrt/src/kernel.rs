//! Static kernel metadata consumed by the allocation planner.
//!
//! A [`KernelDef`] describes the memory contract of one operator
//! implementation: which outputs alias which inputs, which outputs may be
//! computed in place, where each argument must live, and which device queue
//! the kernel executes on. Kernel *binding* (choosing an implementation per
//! node) happens outside this crate; the planner only reads the bound defs.

use std::collections::HashMap;

use smallvec::SmallVec;

use crate::alloc::MemType;

type ArgPairs = SmallVec<[(usize, usize); 2]>;

/// Memory contract of a bound kernel implementation.
#[derive(Debug, Clone, Default)]
pub struct KernelDef {
    op_type: String,
    alias: ArgPairs,
    may_inplace: ArgPairs,
    input_mem_types: HashMap<usize, MemType>,
    output_mem_types: HashMap<usize, MemType>,
    exec_queue_id: usize,
}

impl KernelDef {
    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    /// `(input, output)` pairs the kernel *requires* to share a buffer
    /// (e.g. reshape returning a view of its input).
    pub fn alias(&self) -> &[(usize, usize)] {
        &self.alias
    }

    /// `(input, output)` pairs the kernel *permits* to share a buffer when
    /// the input is otherwise dead and the sizes match.
    pub fn may_inplace(&self) -> &[(usize, usize)] {
        &self.may_inplace
    }

    /// Memory type declared for input position `index`, defaulting to the
    /// provider's own memory.
    pub fn input_mem_type(&self, index: usize) -> MemType {
        self.input_mem_types
            .get(&index)
            .copied()
            .unwrap_or(MemType::Default)
    }

    /// True when the kernel insists input `index` lives in host memory.
    pub fn input_on_cpu_explicitly(&self, index: usize) -> bool {
        self.input_mem_type(index) == MemType::CpuExplicit
    }

    /// Memory-type override for output position `index`, if any.
    pub fn output_mem_type(&self, index: usize) -> Option<MemType> {
        self.output_mem_types.get(&index).copied()
    }

    /// Device queue the kernel executes on. Non-zero queues require the
    /// executor to fence every value incident to the node.
    pub fn exec_queue_id(&self) -> usize {
        self.exec_queue_id
    }

    /// Deterministic view of the mem-type tables for fingerprinting.
    pub(crate) fn sorted_mem_types(&self) -> (Vec<(usize, MemType)>, Vec<(usize, MemType)>) {
        let mut inputs: Vec<_> = self.input_mem_types.iter().map(|(k, v)| (*k, *v)).collect();
        let mut outputs: Vec<_> = self.output_mem_types.iter().map(|(k, v)| (*k, *v)).collect();
        inputs.sort_unstable_by_key(|(k, _)| *k);
        outputs.sort_unstable_by_key(|(k, _)| *k);
        (inputs, outputs)
    }
}

/// Fluent builder for [`KernelDef`].
#[derive(Debug, Default)]
pub struct KernelDefBuilder {
    def: KernelDef,
}

impl KernelDefBuilder {
    pub fn new(op_type: impl Into<String>) -> Self {
        KernelDefBuilder {
            def: KernelDef {
                op_type: op_type.into(),
                ..KernelDef::default()
            },
        }
    }

    /// Declares that output `output` must alias input `input`.
    pub fn alias(mut self, input: usize, output: usize) -> Self {
        self.def.alias.push((input, output));
        self
    }

    /// Declares that output `output` may be computed in place over input
    /// `input`.
    pub fn may_inplace(mut self, input: usize, output: usize) -> Self {
        self.def.may_inplace.push((input, output));
        self
    }

    pub fn input_mem_type(mut self, index: usize, mem_type: MemType) -> Self {
        self.def.input_mem_types.insert(index, mem_type);
        self
    }

    pub fn output_mem_type(mut self, index: usize, mem_type: MemType) -> Self {
        self.def.output_mem_types.insert(index, mem_type);
        self
    }

    pub fn exec_queue_id(mut self, queue: usize) -> Self {
        self.def.exec_queue_id = queue;
        self
    }

    pub fn build(self) -> KernelDef {
        self.def
    }
}
