//! Device memory backing a mapped buffer.

use devgraph_common::AccessError;
use devgraph_graph::HostBuffer;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Memory a device view addresses.
///
/// `Shared` aliases the host allocation (unified memory); `Local` is a
/// separate device allocation that host data must be copied into and out of.
pub enum DeviceMemory {
    Shared {
        host: Arc<HostBuffer>,
        base_offset: usize,
        len: usize,
    },
    Local(RwLock<Vec<u8>>),
}

impl fmt::Debug for DeviceMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared { host, base_offset, len } => f
                .debug_struct("Shared")
                .field("host", &host.label())
                .field("base_offset", base_offset)
                .field("len", len)
                .finish(),
            Self::Local(_) => f.debug_struct("Local").field("len", &self.len()).finish(),
        }
    }
}

impl DeviceMemory {
    /// A view aliasing `host[base_offset..base_offset + len]`.
    #[must_use]
    pub fn shared(host: Arc<HostBuffer>, base_offset: usize, len: usize) -> Self {
        Self::Shared { host, base_offset, len }
    }

    /// A device-local allocation initialised from `host[base_offset..base_offset + len]`.
    pub fn local_snapshot(
        host: &HostBuffer,
        base_offset: usize,
        len: usize,
    ) -> Result<Self, AccessError> {
        let bytes = host.read(base_offset, len).map_err(|_| AccessError {
            offset: base_offset,
            len,
            size: host.len(),
        })?;
        Ok(Self::Local(RwLock::new(bytes)))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Shared { len, .. } => *len,
            Self::Local(bytes) => bytes.read().unwrap_or_else(PoisonError::into_inner).len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether host and device see the same bytes.
    #[must_use]
    pub const fn is_shared(&self) -> bool {
        matches!(self, Self::Shared { .. })
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), AccessError> {
        let size = self.len();
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(()),
            _ => Err(AccessError { offset, len, size }),
        }
    }

    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>, AccessError> {
        self.check(offset, len)?;
        match self {
            Self::Shared { host, base_offset, .. } => host
                .read(base_offset + offset, len)
                .map_err(|_| AccessError { offset, len, size: self.len() }),
            Self::Local(bytes) => {
                let bytes = bytes.read().unwrap_or_else(PoisonError::into_inner);
                Ok(bytes[offset..offset + len].to_vec())
            }
        }
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), AccessError> {
        self.check(offset, data.len())?;
        match self {
            Self::Shared { host, base_offset, .. } => host
                .write(base_offset + offset, data)
                .map_err(|_| AccessError { offset, len: data.len(), size: self.len() }),
            Self::Local(bytes) => {
                let mut bytes = bytes.write().unwrap_or_else(PoisonError::into_inner);
                bytes[offset..offset + data.len()].copy_from_slice(data);
                Ok(())
            }
        }
    }
}
