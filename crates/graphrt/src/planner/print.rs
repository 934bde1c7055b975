//! Text rendering of execution plans for debugging and tests.

use std::fmt;

use crate::graph::ValueIndex;
use crate::session::SessionState;

use super::{AllocKind, ExecutionPlan};

/// Borrowing wrapper that renders a plan with value names resolved through
/// the owning session. Built by [`ExecutionPlan::display`].
pub struct PlanDisplay<'a> {
    plan: &'a ExecutionPlan,
    session: &'a SessionState,
}

impl<'a> PlanDisplay<'a> {
    pub(super) fn new(plan: &'a ExecutionPlan, session: &'a SessionState) -> Self {
        PlanDisplay { plan, session }
    }

    fn value_name(&self, index: ValueIndex) -> &str {
        self.session.value_name(index).unwrap_or("<unknown>")
    }
}

impl fmt::Display for PlanDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Allocation Plan:")?;
        for (index, value_plan) in self.plan.allocation_plan.iter().enumerate() {
            let index = ValueIndex(index);
            write!(f, "({}) {} : ", index.0, self.value_name(index))?;
            match value_plan.alloc_kind {
                AllocKind::PreExisting => write!(f, "PreExisting")?,
                AllocKind::AllocateStatically => write!(f, "AllocateStatically")?,
                AllocKind::Allocate => write!(f, "Allocate")?,
                AllocKind::Reuse { reused_buffer } => write!(f, "Reuse {}", reused_buffer.0)?,
                AllocKind::AllocateOutput => write!(f, "AllocateOutput")?,
            }
            if let Some(location) = &value_plan.location {
                write!(f, ", {location}")?;
            }
            if value_plan.create_fence {
                write!(f, ", use fence")?;
            }
            writeln!(f)?;
        }

        writeln!(f)?;
        writeln!(f, "Execution Plan:")?;
        let graph = self.session.graph();
        for (step, node_plan) in self.plan.execution_plan.iter().enumerate() {
            let node = graph.and_then(|graph| graph.node(node_plan.node_index));
            let (op_type, name) = match node {
                Some(node) => (node.op_type(), node.name()),
                None => ("<unknown>", ""),
            };
            writeln!(f, "[{step}] {op_type} ({name})")?;
            let freed = node_plan.free_slice(&self.plan.to_be_freed);
            if !freed.is_empty() {
                write!(f, "Free ml-values: ")?;
                for (position, value) in freed.iter().enumerate() {
                    if position > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "({}) {}", value.0, self.value_name(*value))?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}
