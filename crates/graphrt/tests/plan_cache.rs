use std::sync::Arc;

use graphrt::alloc::ProviderKind;
use graphrt::graph::{Graph, NodeArg};
use graphrt::kernel::KernelDefBuilder;
use graphrt::planner::{get_or_create_plan, PlanKey};
use graphrt::{DType, DeclaredShapes, SessionState, Shape, ValueType};

fn tensor(name: &str, dims: &[usize]) -> NodeArg {
    NodeArg::new(name, ValueType::tensor(DType::F32, Shape::from_static(dims)))
}

fn session(op_type: &str, queue: usize, dims: &[usize]) -> SessionState {
    let mut graph = Graph::new();
    let node = graph.add_node(
        op_type,
        "node0",
        ProviderKind::Cpu,
        vec![tensor("x", dims)],
        vec![tensor("y", dims)],
    );
    graph.set_inputs(["x"]);
    graph.set_outputs(["y"]);
    let mut state = SessionState::new(graph);
    state.bind_kernel(node, KernelDefBuilder::new(op_type).exec_queue_id(queue).build());
    state
}

#[test]
fn identical_sessions_share_one_cached_plan() {
    let first = session("CacheRelu", 0, &[3, 3]);
    let second = session("CacheRelu", 0, &[3, 3]);

    let plan_a = get_or_create_plan(&first, &DeclaredShapes).expect("plan a");
    let plan_b = get_or_create_plan(&second, &DeclaredShapes).expect("plan b");
    assert!(Arc::ptr_eq(&plan_a, &plan_b));
}

#[test]
fn cached_plan_matches_fresh_plan() {
    let state = session("CacheSigmoid", 0, &[2, 5]);
    let cached = get_or_create_plan(&state, &DeclaredShapes).expect("cached");
    let fresh = graphrt::create_plan(&state, &DeclaredShapes).expect("fresh");
    assert_eq!(*cached, fresh);
}

#[test]
fn kernel_metadata_changes_the_key() {
    let default_queue = session("CacheTanh", 0, &[2, 2]);
    let fenced = session("CacheTanh", 3, &[2, 2]);

    let key_a = PlanKey::for_session(&default_queue, &DeclaredShapes).expect("key a");
    let key_b = PlanKey::for_session(&fenced, &DeclaredShapes).expect("key b");
    assert_ne!(key_a, key_b);

    let plan_a = get_or_create_plan(&default_queue, &DeclaredShapes).expect("plan a");
    let plan_b = get_or_create_plan(&fenced, &DeclaredShapes).expect("plan b");
    assert!(!Arc::ptr_eq(&plan_a, &plan_b));
}

#[test]
fn shape_changes_the_key() {
    let small = session("CacheExp", 0, &[2, 2]);
    let large = session("CacheExp", 0, &[16, 16]);
    let key_a = PlanKey::for_session(&small, &DeclaredShapes).expect("key a");
    let key_b = PlanKey::for_session(&large, &DeclaredShapes).expect("key b");
    assert_ne!(key_a, key_b);
}

#[test]
fn key_is_stable_across_recomputation() {
    let state = session("CacheAbs", 0, &[7]);
    let key_a = PlanKey::for_session(&state, &DeclaredShapes).expect("key a");
    let key_b = PlanKey::for_session(&state, &DeclaredShapes).expect("key b");
    assert_eq!(key_a, key_b);
    assert_eq!(key_a.hash(), key_b.hash());
}
