//! Bump-allocating graph builder.
//!
//! Tensors are placed back to back (32-byte aligned) inside host arenas.
//! Switching arenas mid-build models separate weight and scratch buffers;
//! [`GraphBuilder::tensor_at`] places a tensor at an explicit offset, which
//! is how callers express memory reuse and aliasing.

use crate::error::GraphError;
use crate::graph::{ComputeGraph, GraphNode};
use crate::host::HostBuffer;
use crate::op::OpKind;
use crate::tensor::{TensorId, TensorRef};
use devgraph_common::DType;
use devgraph_common::limits::TENSOR_ALIGNMENT;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::trace;

const MAX_RANK: usize = 4;

struct Arena {
    buffer: Arc<HostBuffer>,
    cursor: usize,
}

/// Builds a [`ComputeGraph`] in sequential order.
pub struct GraphBuilder {
    arenas: Vec<Arena>,
    current: usize,
    next_id: u32,
    nodes: Vec<GraphNode>,
    created: Vec<TensorRef>,
}

impl GraphBuilder {
    /// Start a graph whose tensors are allocated from `arena`.
    #[must_use]
    pub fn new(arena: Arc<HostBuffer>) -> Self {
        Self {
            arenas: vec![Arena { buffer: arena, cursor: 0 }],
            current: 0,
            next_id: 0,
            nodes: Vec::new(),
            created: Vec::new(),
        }
    }

    /// Allocate subsequent tensors from `arena`, resuming where it left off
    /// if it was used before.
    pub fn use_arena(&mut self, arena: &Arc<HostBuffer>) {
        if let Some(index) = self.arenas.iter().position(|a| Arc::ptr_eq(&a.buffer, arena)) {
            self.current = index;
        } else {
            self.arenas.push(Arena { buffer: Arc::clone(arena), cursor: 0 });
            self.current = self.arenas.len() - 1;
        }
    }

    /// Bytes already allocated from `arena`.
    #[must_use]
    pub fn arena_used(&self, arena: &Arc<HostBuffer>) -> Option<usize> {
        self.arenas.iter().find(|a| Arc::ptr_eq(&a.buffer, arena)).map(|a| a.cursor)
    }

    fn next_id(&mut self) -> TensorId {
        let id = TensorId(self.next_id);
        self.next_id += 1;
        id
    }

    fn allocate(
        &mut self,
        name: &str,
        dtype: DType,
        shape: &[usize],
    ) -> Result<TensorRef, GraphError> {
        validate_shape(shape)?;
        let nbytes = shape.iter().product::<usize>() * dtype.size();
        let id = self.next_id();
        let arena = &mut self.arenas[self.current];
        let start = arena.cursor.next_multiple_of(TENSOR_ALIGNMENT);
        let available = arena.buffer.len().saturating_sub(start);
        if nbytes > available {
            return Err(GraphError::ArenaExhausted {
                label: arena.buffer.label().to_string(),
                needed: nbytes,
                available,
            });
        }
        arena.cursor = start + nbytes;
        let addr = arena.buffer.base().advance(start);
        trace!(tensor = name, %addr, nbytes, arena = arena.buffer.label(), "tensor allocated");
        Ok(TensorRef::new(id, name, dtype, shape.to_vec(), addr))
    }

    /// A new input tensor allocated from the current arena.
    pub fn tensor(
        &mut self,
        name: &str,
        dtype: DType,
        shape: &[usize],
    ) -> Result<TensorRef, GraphError> {
        let tensor = self.allocate(name, dtype, shape)?;
        self.created.push(tensor.clone());
        Ok(tensor)
    }

    /// A new input tensor placed at `offset` inside `buffer`, outside any
    /// arena bookkeeping. It may overlap other tensors.
    pub fn tensor_at(
        &mut self,
        name: &str,
        dtype: DType,
        shape: &[usize],
        buffer: &Arc<HostBuffer>,
        offset: usize,
    ) -> Result<TensorRef, GraphError> {
        validate_shape(shape)?;
        let nbytes = shape.iter().product::<usize>() * dtype.size();
        let addr = buffer.base().advance(offset);
        if !buffer.contains(addr, nbytes) {
            return Err(GraphError::OutOfBounds {
                label: buffer.label().to_string(),
                offset,
                len: nbytes,
                size: buffer.len(),
            });
        }
        let id = self.next_id();
        let tensor = TensorRef::new(id, name, dtype, shape.to_vec(), addr);
        self.created.push(tensor.clone());
        Ok(tensor)
    }

    fn push(&mut self, op: OpKind, srcs: &[TensorRef], dst: TensorRef) -> TensorRef {
        self.nodes.push(GraphNode::new(op, srcs.to_vec(), dst.clone()));
        dst
    }

    fn emit(
        &mut self,
        op: OpKind,
        srcs: &[TensorRef],
        dtype: DType,
        shape: &[usize],
    ) -> Result<TensorRef, GraphError> {
        let name = format!("{}_{}", op.name(), self.nodes.len());
        let dst = self.allocate(&name, dtype, shape)?;
        Ok(self.push(op, srcs, dst))
    }

    fn elementwise(
        &mut self,
        op: OpKind,
        a: &TensorRef,
        b: &TensorRef,
    ) -> Result<TensorRef, GraphError> {
        require_f32(&op, a)?;
        require_f32(&op, b)?;
        if a.shape != b.shape {
            return Err(GraphError::ShapeMismatch {
                op: op.name().to_string(),
                lhs: a.shape.clone(),
                rhs: b.shape.clone(),
            });
        }
        let shape = a.shape.clone();
        self.emit(op, &[a.clone(), b.clone()], DType::F32, &shape)
    }

    fn unary(&mut self, op: OpKind, a: &TensorRef) -> Result<TensorRef, GraphError> {
        require_f32(&op, a)?;
        let shape = a.shape.clone();
        self.emit(op, std::slice::from_ref(a), DType::F32, &shape)
    }

    pub fn add(&mut self, a: &TensorRef, b: &TensorRef) -> Result<TensorRef, GraphError> {
        self.elementwise(OpKind::Add, a, b)
    }

    pub fn mul(&mut self, a: &TensorRef, b: &TensorRef) -> Result<TensorRef, GraphError> {
        self.elementwise(OpKind::Mul, a, b)
    }

    pub fn scale(&mut self, a: &TensorRef, factor: f32) -> Result<TensorRef, GraphError> {
        self.unary(OpKind::Scale(factor), a)
    }

    pub fn relu(&mut self, a: &TensorRef) -> Result<TensorRef, GraphError> {
        self.unary(OpKind::Relu, a)
    }

    pub fn silu(&mut self, a: &TensorRef) -> Result<TensorRef, GraphError> {
        self.unary(OpKind::Silu, a)
    }

    pub fn gelu(&mut self, a: &TensorRef) -> Result<TensorRef, GraphError> {
        self.unary(OpKind::Gelu, a)
    }

    pub fn softmax(&mut self, a: &TensorRef) -> Result<TensorRef, GraphError> {
        self.unary(OpKind::SoftMax, a)
    }

    pub fn rms_norm(&mut self, a: &TensorRef, eps: f32) -> Result<TensorRef, GraphError> {
        self.unary(OpKind::RmsNorm { eps }, a)
    }

    /// `[m, k] x [k, n] -> [m, n]`.
    pub fn matmul(&mut self, a: &TensorRef, b: &TensorRef) -> Result<TensorRef, GraphError> {
        let op = OpKind::MatMul;
        require_f32(&op, a)?;
        require_f32(&op, b)?;
        let (m, k, n) = match (a.shape.as_slice(), b.shape.as_slice()) {
            (&[m, k], &[k2, n]) if k == k2 => (m, k, n),
            _ => {
                return Err(GraphError::ShapeMismatch {
                    op: op.name().to_string(),
                    lhs: a.shape.clone(),
                    rhs: b.shape.clone(),
                });
            }
        };
        trace!(m, k, n, "matmul shape");
        self.emit(op, &[a.clone(), b.clone()], DType::F32, &[m, n])
    }

    /// Copy `src` into the existing tensor `dst`, converting between float types.
    pub fn copy(&mut self, src: &TensorRef, dst: &TensorRef) -> Result<TensorRef, GraphError> {
        let op = OpKind::Copy;
        for t in [src, dst] {
            if !t.dtype.is_float() {
                return Err(GraphError::UnsupportedDType {
                    op: op.name().to_string(),
                    dtype: t.dtype,
                });
            }
        }
        if src.elements() != dst.elements() {
            return Err(GraphError::ShapeMismatch {
                op: op.name().to_string(),
                lhs: src.shape.clone(),
                rhs: dst.shape.clone(),
            });
        }
        Ok(self.push(op, std::slice::from_ref(src), dst.clone()))
    }

    /// Reinterpret `a` with a new shape; the result aliases `a`'s memory.
    pub fn reshape(&mut self, a: &TensorRef, shape: &[usize]) -> Result<TensorRef, GraphError> {
        validate_shape(shape)?;
        if shape.iter().product::<usize>() != a.elements() {
            return Err(GraphError::ShapeMismatch {
                op: OpKind::Reshape.name().to_string(),
                lhs: a.shape.clone(),
                rhs: shape.to_vec(),
            });
        }
        let id = self.next_id();
        let name = format!("{}_reshaped", a.name);
        let dst = TensorRef::new(id, name, a.dtype, shape.to_vec(), a.addr);
        Ok(self.push(OpKind::Reshape, std::slice::from_ref(a), dst))
    }

    /// A node running the device program installed under `kernel`.
    pub fn custom(
        &mut self,
        kernel: &str,
        srcs: &[TensorRef],
        dtype: DType,
        shape: &[usize],
    ) -> Result<TensorRef, GraphError> {
        self.emit(OpKind::Custom(kernel.to_string()), srcs, dtype, shape)
    }

    /// A node writing into the existing tensor `dst` without shape inference.
    pub fn op_into(
        &mut self,
        op: OpKind,
        srcs: &[TensorRef],
        dst: &TensorRef,
    ) -> Result<TensorRef, GraphError> {
        if let Some(expected) = op.arity() {
            if srcs.len() != expected {
                return Err(GraphError::Arity {
                    op: op.name().to_string(),
                    expected,
                    got: srcs.len(),
                });
            }
        }
        Ok(self.push(op, srcs, dst.clone()))
    }

    /// Number of nodes recorded so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Finish the graph. Leafs are created tensors that no node writes.
    #[must_use]
    pub fn build(self) -> ComputeGraph {
        let written: HashSet<TensorId> = self.nodes.iter().map(|n| n.dst.id).collect();
        let leafs = self.created.into_iter().filter(|t| !written.contains(&t.id)).collect();
        ComputeGraph::new(self.nodes, leafs)
    }
}

fn validate_shape(shape: &[usize]) -> Result<(), GraphError> {
    if shape.is_empty() || shape.len() > MAX_RANK {
        return Err(GraphError::InvalidShape {
            shape: shape.to_vec(),
            reason: format!("rank must be in 1..={MAX_RANK}"),
        });
    }
    if shape.contains(&0) {
        return Err(GraphError::InvalidShape {
            shape: shape.to_vec(),
            reason: "dimensions must be non-zero".into(),
        });
    }
    Ok(())
}

fn require_f32(op: &OpKind, t: &TensorRef) -> Result<(), GraphError> {
    if t.dtype == DType::F32 {
        Ok(())
    } else {
        Err(GraphError::UnsupportedDType { op: op.name().to_string(), dtype: t.dtype })
    }
}
