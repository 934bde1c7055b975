//! Process-wide cache of execution plans keyed by a structural session
//! fingerprint.
//!
//! Planning is deterministic, so sessions with identical graphs, kernel
//! bindings, and shape knowledge can share one immutable plan. This avoids
//! re-planning when workloads rebuild sessions over the same model (e.g.
//! repeated short-lived inference sessions in one process).

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use once_cell::sync::Lazy;
use serde::Serialize;

use crate::alloc::{MemType, ProviderKind};
use crate::graph::ValueIndex;
use crate::session::{PlannerContext, SessionState};
use crate::tensor::{DType, Shape};

use super::{create_plan, ExecutionPlan, PlanError};

static PLAN_CACHE: Lazy<Mutex<LruCache<PlanKey, Arc<ExecutionPlan>>>> = Lazy::new(|| {
    let capacity = NonZeroUsize::new(crate::env::plan_cache_capacity().max(1))
        .expect("cache capacity is at least one");
    Mutex::new(LruCache::new(capacity))
});

/// Stable cache key over everything that influences planning output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlanKey {
    graph_hash: u64,
    kernel_hash: u64,
    shape_hash: u64,
    hash: u64,
}

impl PlanKey {
    /// Fingerprints the session and shape context. Sessions that hash
    /// equally plan identically.
    pub fn for_session(
        session: &SessionState,
        context: &dyn PlannerContext,
    ) -> Result<Self, PlanError> {
        let signature = SessionSignature::collect(session, context)?;
        let graph_hash = hash_serializable(&signature.graph)?;
        let kernel_hash = hash_serializable(&signature.kernels)?;
        let shape_hash = hash_serializable(&signature.shapes)?;
        let mut combined = [0u8; 24];
        combined[..8].copy_from_slice(&graph_hash.to_le_bytes());
        combined[8..16].copy_from_slice(&kernel_hash.to_le_bytes());
        combined[16..].copy_from_slice(&shape_hash.to_le_bytes());
        Ok(PlanKey {
            graph_hash,
            kernel_hash,
            shape_hash,
            hash: fnv1a_hash(&combined),
        })
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }
}

/// Returns the cached plan for the session's fingerprint, planning and
/// inserting on miss. Cached and fresh plans are byte-identical because
/// planning is deterministic.
pub fn get_or_create_plan(
    session: &SessionState,
    context: &dyn PlannerContext,
) -> Result<Arc<ExecutionPlan>, PlanError> {
    let key = PlanKey::for_session(session, context)?;
    {
        let mut cache = PLAN_CACHE.lock().expect("plan cache poisoned");
        if let Some(plan) = cache.get(&key) {
            return Ok(Arc::clone(plan));
        }
    }
    let plan = Arc::new(create_plan(session, context)?);
    let mut cache = PLAN_CACHE.lock().expect("plan cache poisoned");
    let entry = cache.get_or_insert(key, || Arc::clone(&plan));
    Ok(Arc::clone(entry))
}

#[derive(Serialize)]
struct SessionSignature {
    graph: GraphSignature,
    kernels: Vec<KernelSignature>,
    shapes: Vec<DefSignature>,
}

#[derive(Serialize)]
struct GraphSignature {
    num_values: usize,
    inputs: Vec<ValueIndex>,
    outputs: Vec<ValueIndex>,
    initializers: Vec<ValueIndex>,
    nodes: Vec<NodeSignature>,
}

#[derive(Serialize)]
struct NodeSignature {
    op_type: String,
    provider: ProviderKind,
    sentinel: bool,
    inputs: Vec<Option<ValueIndex>>,
    outputs: Vec<Option<ValueIndex>>,
}

#[derive(Serialize)]
struct KernelSignature {
    bound: bool,
    alias: Vec<(usize, usize)>,
    may_inplace: Vec<(usize, usize)>,
    input_mem_types: Vec<(usize, MemType)>,
    output_mem_types: Vec<(usize, MemType)>,
    exec_queue_id: usize,
}

/// Shape/type knowledge for one def, as the planner will observe it.
#[derive(Serialize)]
struct DefSignature {
    value: ValueIndex,
    dtype: Option<DType>,
    shape: Option<Shape>,
    tensor: bool,
}

impl SessionSignature {
    fn collect(
        session: &SessionState,
        context: &dyn PlannerContext,
    ) -> Result<Self, PlanError> {
        let graph = session.graph().ok_or(PlanError::GraphUnavailable)?;
        let order = graph.topological_order()?;

        let resolve = |name: &str| {
            session
                .value_index(name)
                .ok_or_else(|| PlanError::UnknownValue {
                    name: name.to_string(),
                })
        };

        let mut nodes = Vec::new();
        let mut kernels = Vec::new();
        let mut shapes = Vec::new();
        for node_index in order {
            let node = graph
                .node(*node_index)
                .ok_or(PlanError::UnknownNode(node_index.0))?;
            let mut inputs = Vec::with_capacity(node.inputs().len());
            let mut outputs = Vec::with_capacity(node.outputs().len());
            for (args, slots) in [
                (node.inputs(), &mut inputs),
                (node.outputs(), &mut outputs),
            ] {
                for arg in args {
                    if !arg.exists() {
                        slots.push(None);
                        continue;
                    }
                    let value = resolve(arg.name())?;
                    slots.push(Some(value));
                    shapes.push(DefSignature {
                        value,
                        dtype: arg
                            .value_type()
                            .and_then(|ty| ty.tensor_spec())
                            .map(|spec| spec.dtype),
                        shape: context.shape_of(arg).cloned(),
                        tensor: !arg.is_non_tensor(),
                    });
                }
            }
            nodes.push(NodeSignature {
                op_type: node.op_type().to_string(),
                provider: node.provider(),
                sentinel: graph.is_sentinel(*node_index),
                inputs,
                outputs,
            });
            kernels.push(match session.kernel_def(*node_index) {
                None => KernelSignature {
                    bound: false,
                    alias: Vec::new(),
                    may_inplace: Vec::new(),
                    input_mem_types: Vec::new(),
                    output_mem_types: Vec::new(),
                    exec_queue_id: 0,
                },
                Some(kernel) => {
                    let (input_mem_types, output_mem_types) = kernel.sorted_mem_types();
                    KernelSignature {
                        bound: true,
                        alias: kernel.alias().to_vec(),
                        may_inplace: kernel.may_inplace().to_vec(),
                        input_mem_types,
                        output_mem_types,
                        exec_queue_id: kernel.exec_queue_id(),
                    }
                }
            });
        }

        let graph_signature = GraphSignature {
            num_values: session.num_values(),
            inputs: graph
                .inputs()
                .iter()
                .map(|name| resolve(name))
                .collect::<Result<_, _>>()?,
            outputs: graph
                .outputs()
                .iter()
                .map(|name| resolve(name))
                .collect::<Result<_, _>>()?,
            initializers: graph
                .initializers()
                .iter()
                .map(|name| resolve(name))
                .collect::<Result<_, _>>()?,
            nodes,
        };
        Ok(SessionSignature {
            graph: graph_signature,
            kernels,
            shapes,
        })
    }
}

fn hash_serializable<T: Serialize>(value: &T) -> Result<u64, PlanError> {
    let bytes =
        bincode::serialize(value).map_err(|err| PlanError::Fingerprint(err.to_string()))?;
    Ok(fnv1a_hash(&bytes))
}

fn fnv1a_hash(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET_BASIS;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
