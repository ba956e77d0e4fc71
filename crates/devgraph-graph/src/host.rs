//! Page-aligned host-visible allocations.
//!
//! A [`HostBuffer`] is a zeroed, page-aligned heap block with a stable base
//! address for its whole lifetime, which is what lets the device backend map
//! it by address and later find it again from a tensor's host pointer.

use crate::error::GraphError;
use crate::tensor::TensorRef;
use devgraph_common::limits::DEFAULT_PAGE_SIZE;
use std::alloc::{self, Layout};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::trace;

/// A host memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostAddr(usize);

impl HostAddr {
    #[must_use]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }

    /// Address `bytes` past this one.
    #[must_use]
    pub const fn advance(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    /// Byte distance from `base` to this address, if this address is not below it.
    #[must_use]
    pub const fn offset_from(self, base: HostAddr) -> Option<usize> {
        self.0.checked_sub(base.0)
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Owned, zeroed allocation with a caller-chosen alignment.
struct AlignedBytes {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

impl AlignedBytes {
    fn zeroed(len: usize, align: usize) -> Option<Self> {
        let size = len.checked_next_multiple_of(align)?;
        let layout = Layout::from_size_align(size, align).ok()?;
        if layout.size() == 0 {
            return None;
        }
        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).map(|ptr| Self { ptr, len, layout })
    }
}

impl Deref for AlignedBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: `ptr` points to `layout.size() >= len` initialised bytes owned by `self`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for AlignedBytes {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBytes {
    fn drop(&mut self) {
        // SAFETY: `ptr` was returned by `alloc_zeroed` with exactly this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

// SAFETY: `AlignedBytes` uniquely owns its allocation, like `Box<[u8]>`.
unsafe impl Send for AlignedBytes {}
// SAFETY: shared access only hands out `&[u8]`.
unsafe impl Sync for AlignedBytes {}

/// A host-visible memory block that tensors are placed into.
pub struct HostBuffer {
    label: String,
    base: HostAddr,
    len: usize,
    bytes: RwLock<AlignedBytes>,
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer")
            .field("label", &self.label)
            .field("base", &format_args!("{}", self.base))
            .field("len", &self.len)
            .finish()
    }
}

/// Allocate a page-aligned, zeroed host buffer eligible for zero-copy mapping.
///
/// The buffer is freed when the last [`Arc`] is dropped.
pub fn alloc_host_visible(len: usize) -> Result<Arc<HostBuffer>, GraphError> {
    HostBuffer::alloc("host", len)
}

impl HostBuffer {
    /// Allocate `len` zeroed bytes aligned to the default page size.
    pub fn alloc(label: impl Into<String>, len: usize) -> Result<Arc<Self>, GraphError> {
        let label = label.into();
        if len == 0 {
            return Err(GraphError::EmptyBuffer { label });
        }
        let bytes = AlignedBytes::zeroed(len, DEFAULT_PAGE_SIZE)
            .ok_or(GraphError::AllocationFailed { len })?;
        let base = HostAddr::new(bytes.ptr.as_ptr().addr());
        trace!(label = %label, len, base = %base, "host buffer allocated");
        Ok(Arc::new(Self { label, base, len, bytes: RwLock::new(bytes) }))
    }

    /// Allocate a buffer holding a copy of `data`.
    pub fn from_bytes(label: impl Into<String>, data: &[u8]) -> Result<Arc<Self>, GraphError> {
        let buffer = Self::alloc(label, data.len())?;
        buffer.write(0, data)?;
        Ok(buffer)
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Base address of the block.
    #[must_use]
    pub const fn base(&self) -> HostAddr {
        self.base
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// One past the last address of the block.
    #[must_use]
    pub const fn end(&self) -> HostAddr {
        self.base.advance(self.len)
    }

    /// Whether `[addr, addr + nbytes)` lies entirely inside this buffer.
    #[must_use]
    pub fn contains(&self, addr: HostAddr, nbytes: usize) -> bool {
        addr.offset_from(self.base)
            .and_then(|offset| offset.checked_add(nbytes))
            .is_some_and(|end| end <= self.len)
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), GraphError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(GraphError::OutOfBounds {
                label: self.label.clone(),
                offset,
                len,
                size: self.len,
            }),
        }
    }

    /// Copy `dst.len()` bytes starting at `offset` into `dst`.
    pub fn read_into(&self, offset: usize, dst: &mut [u8]) -> Result<(), GraphError> {
        self.check(offset, dst.len())?;
        let bytes = self.bytes.read().unwrap_or_else(PoisonError::into_inner);
        dst.copy_from_slice(&bytes[offset..offset + dst.len()]);
        Ok(())
    }

    /// Copy `len` bytes starting at `offset` out of the buffer.
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>, GraphError> {
        let mut out = vec![0u8; len];
        self.read_into(offset, &mut out)?;
        Ok(out)
    }

    /// Overwrite bytes starting at `offset` with `src`.
    pub fn write(&self, offset: usize, src: &[u8]) -> Result<(), GraphError> {
        self.check(offset, src.len())?;
        let mut bytes = self.bytes.write().unwrap_or_else(PoisonError::into_inner);
        bytes[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn tensor_offset(&self, tensor: &TensorRef) -> Result<usize, GraphError> {
        if !self.contains(tensor.addr, tensor.nbytes) {
            return Err(GraphError::ForeignTensor {
                tensor: tensor.name.clone(),
                label: self.label.clone(),
            });
        }
        Ok(tensor.addr.get() - self.base.get())
    }

    /// Raw bytes of `tensor`, which must live in this buffer.
    pub fn read_tensor(&self, tensor: &TensorRef) -> Result<Vec<u8>, GraphError> {
        let offset = self.tensor_offset(tensor)?;
        self.read(offset, tensor.nbytes)
    }

    /// Overwrite the bytes of `tensor`, which must live in this buffer.
    pub fn write_tensor(&self, tensor: &TensorRef, data: &[u8]) -> Result<(), GraphError> {
        let offset = self.tensor_offset(tensor)?;
        if data.len() != tensor.nbytes {
            return Err(GraphError::OutOfBounds {
                label: self.label.clone(),
                offset,
                len: data.len(),
                size: tensor.nbytes,
            });
        }
        self.write(offset, data)
    }

    /// Read an `f32` tensor as values.
    pub fn read_f32(&self, tensor: &TensorRef) -> Result<Vec<f32>, GraphError> {
        let bytes = self.read_tensor(tensor)?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    /// Write `f32` values into a tensor of matching byte size.
    pub fn write_f32(&self, tensor: &TensorRef, values: &[f32]) -> Result<(), GraphError> {
        self.write_tensor(tensor, bytemuck::cast_slice(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_page_aligned_and_zeroed() {
        let buf = HostBuffer::alloc("a", 100).unwrap();
        assert_eq!(buf.base().get() % DEFAULT_PAGE_SIZE, 0);
        assert_eq!(buf.len(), 100);
        assert!(buf.read(0, 100).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn zero_length_rejected() {
        assert!(matches!(HostBuffer::alloc("z", 0), Err(GraphError::EmptyBuffer { .. })));
    }

    #[test]
    fn write_then_read() {
        let buf = HostBuffer::alloc("rw", 16).unwrap();
        buf.write(4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(buf.read(4, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(buf.read(0, 4).unwrap(), vec![0; 4]);
    }

    #[test]
    fn out_of_bounds_access_fails() {
        let buf = HostBuffer::alloc("oob", 8).unwrap();
        assert!(buf.read(4, 8).is_err());
        assert!(buf.write(8, &[1]).is_err());
        assert!(buf.read(usize::MAX, 2).is_err());
    }

    #[test]
    fn contains_is_half_open() {
        let buf = HostBuffer::alloc("c", 64).unwrap();
        assert!(buf.contains(buf.base(), 64));
        assert!(buf.contains(buf.base().advance(63), 1));
        assert!(!buf.contains(buf.base().advance(63), 2));
        assert!(!buf.contains(buf.end(), 1));
        assert!(!buf.contains(HostAddr::new(buf.base().get() - 1), 1));
    }

    #[test]
    fn from_bytes_copies() {
        let buf = HostBuffer::from_bytes("f", &[9, 8, 7]).unwrap();
        assert_eq!(buf.read(0, 3).unwrap(), vec![9, 8, 7]);
    }

    #[test]
    fn host_addr_offsets() {
        let a = HostAddr::new(0x1000);
        assert_eq!(a.advance(0x20).get(), 0x1020);
        assert_eq!(a.advance(0x20).offset_from(a), Some(0x20));
        assert_eq!(a.offset_from(a.advance(1)), None);
        assert_eq!(a.to_string(), "0x1000");
    }
}
