//! Plans a small two-branch graph and prints the resulting execution plan.
//!
//! Run with `cargo run --example plan_dump`.

use anyhow::Result;

use graphrt::alloc::ProviderKind;
use graphrt::graph::{Graph, NodeArg};
use graphrt::kernel::KernelDefBuilder;
use graphrt::planner::create_plan;
use graphrt::session::{DeclaredShapes, SessionState};
use graphrt::tensor::{DType, Shape, ValueType};

fn tensor(name: &str, dims: &[usize]) -> NodeArg {
    NodeArg::new(name, ValueType::tensor(DType::F32, Shape::from_static(dims)))
}

fn main() -> Result<()> {
    let dims = [1usize, 64];

    let mut graph = Graph::new();
    let relu = graph.add_node(
        "Relu",
        "relu0",
        ProviderKind::Cpu,
        vec![tensor("x", &dims)],
        vec![tensor("m", &dims)],
    );
    let neg = graph.add_node(
        "Neg",
        "neg0",
        ProviderKind::Cpu,
        vec![tensor("x", &dims)],
        vec![tensor("n", &dims)],
    );
    let add = graph.add_node(
        "Add",
        "add0",
        ProviderKind::Cpu,
        vec![tensor("m", &dims), tensor("n", &dims)],
        vec![tensor("s", &dims)],
    );
    let sigmoid = graph.add_node(
        "Sigmoid",
        "sigmoid0",
        ProviderKind::Cpu,
        vec![tensor("s", &dims)],
        vec![tensor("y", &dims)],
    );
    graph.set_inputs(["x"]);
    graph.set_outputs(["y"]);

    let mut session = SessionState::new(graph);
    session.bind_kernel(relu, KernelDefBuilder::new("Relu").build());
    session.bind_kernel(neg, KernelDefBuilder::new("Neg").build());
    session.bind_kernel(add, KernelDefBuilder::new("Add").may_inplace(0, 0).build());
    session.bind_kernel(
        sigmoid,
        KernelDefBuilder::new("Sigmoid").may_inplace(0, 0).build(),
    );

    let plan = create_plan(&session, &DeclaredShapes)?;
    println!("{}", plan.display(&session));
    Ok(())
}
