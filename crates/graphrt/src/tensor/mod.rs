//! Value typing for planned graphs: scalar dtypes, symbolic shapes, and the
//! tensor/non-tensor split the planner keys its reuse decisions on.

mod dtype;
mod shape;

use serde::{Deserialize, Serialize};

pub use dtype::DType;
pub use shape::{DimSymbol, Dimension, Shape};

/// Tensor metadata coupling dtype and shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Shape,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: Shape) -> Self {
        Self { dtype, shape }
    }
}

/// Typing information for graph values. Sequences and maps are the
/// non-tensor values: buffer sharing is never attempted for them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Tensor(TensorSpec),
    Sequence(DType),
    Map { key: DType, value: DType },
}

impl ValueType {
    pub fn tensor(dtype: DType, shape: Shape) -> Self {
        ValueType::Tensor(TensorSpec::new(dtype, shape))
    }

    pub fn is_tensor(&self) -> bool {
        matches!(self, ValueType::Tensor(_))
    }

    pub fn tensor_spec(&self) -> Option<&TensorSpec> {
        match self {
            ValueType::Tensor(spec) => Some(spec),
            _ => None,
        }
    }

    /// Element size of the underlying tensor dtype, when this is a tensor.
    pub fn element_size(&self) -> Option<usize> {
        self.tensor_spec().map(|spec| spec.dtype.size_in_bytes())
    }
}
