//! Graph construction errors.

use devgraph_common::DType;
use thiserror::Error;

/// Errors raised while allocating host memory or building a graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("host allocation of {len} bytes failed")]
    AllocationFailed { len: usize },

    #[error("host buffer '{label}' must not be empty")]
    EmptyBuffer { label: String },

    #[error("host buffer '{label}' access out of bounds: offset={offset}, len={len}, size={size}")]
    OutOfBounds {
        label: String,
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("arena '{label}' exhausted: need {needed} bytes, {available} available")]
    ArenaExhausted {
        label: String,
        needed: usize,
        available: usize,
    },

    #[error("tensor '{tensor}' does not belong to host buffer '{label}'")]
    ForeignTensor { tensor: String, label: String },

    #[error("invalid shape {shape:?}: {reason}")]
    InvalidShape { shape: Vec<usize>, reason: String },

    #[error("{op}: shape mismatch {lhs:?} vs {rhs:?}")]
    ShapeMismatch {
        op: String,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },

    #[error("{op}: unsupported dtype {dtype}")]
    UnsupportedDType { op: String, dtype: DType },

    #[error("{op}: expected {expected} operands, got {got}")]
    Arity {
        op: String,
        expected: usize,
        got: usize,
    },
}
