//! Tensor references.

use crate::host::HostAddr;
use devgraph_common::DType;
use std::fmt;
use std::ops::Range;

/// Identifier of a tensor within one graph builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TensorId(pub u32);

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// An operand of a graph operation: where its bytes live on the host and
/// how to interpret them.
///
/// Two references with different ids may cover overlapping memory (views,
/// reshapes, reused scratch space).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorRef {
    pub id: TensorId,
    pub name: String,
    pub dtype: DType,
    /// Row-major dimensions, outermost first.
    pub shape: Vec<usize>,
    /// Host address of the first byte.
    pub addr: HostAddr,
    /// Size of the tensor data in bytes.
    pub nbytes: usize,
}

impl TensorRef {
    /// Create a reference; the byte size follows from `dtype` and `shape`.
    #[must_use]
    pub fn new(
        id: TensorId,
        name: impl Into<String>,
        dtype: DType,
        shape: Vec<usize>,
        addr: HostAddr,
    ) -> Self {
        let nbytes = shape.iter().product::<usize>() * dtype.size();
        Self { id, name: name.into(), dtype, shape, addr, nbytes }
    }

    /// Number of elements.
    #[must_use]
    pub fn elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Half-open host address range `[addr, addr + nbytes)`.
    #[must_use]
    pub fn byte_range(&self) -> Range<usize> {
        self.addr.get()..self.addr.get() + self.nbytes
    }

    /// Whether the two tensors share at least one byte of host memory.
    #[must_use]
    pub fn overlaps(&self, other: &TensorRef) -> bool {
        let a = self.byte_range();
        let b = other.byte_range();
        !a.is_empty() && !b.is_empty() && a.start < b.end && b.start < a.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(id: u32, addr: usize, shape: Vec<usize>) -> TensorRef {
        TensorRef::new(TensorId(id), format!("t{id}"), DType::F32, shape, HostAddr::new(addr))
    }

    #[test]
    fn nbytes_from_shape() {
        let t = at(0, 0x100, vec![2, 3]);
        assert_eq!(t.elements(), 6);
        assert_eq!(t.nbytes, 24);
        assert_eq!(t.byte_range(), 0x100..0x118);
    }

    #[test]
    fn adjacent_tensors_do_not_overlap() {
        let a = at(0, 0x100, vec![4]);
        let b = at(1, 0x110, vec![4]);
        assert!(!a.overlaps(&b));
        assert!(!b.overlaps(&a));
    }

    #[test]
    fn partial_overlap_detected() {
        let a = at(0, 0x100, vec![4]);
        let b = at(1, 0x10c, vec![4]);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
    }

    #[test]
    fn containment_is_overlap() {
        let outer = at(0, 0x100, vec![64]);
        let inner = at(1, 0x120, vec![2]);
        assert!(outer.overlaps(&inner));
    }

    #[test]
    fn empty_tensor_never_overlaps() {
        let empty = at(0, 0x100, vec![0]);
        let other = at(1, 0x100, vec![4]);
        assert!(!empty.overlaps(&other));
    }

    #[test]
    fn id_display() {
        assert_eq!(TensorId(7).to_string(), "%7");
    }
}
