//! Host/device tensor transfers.
//!
//! Every call performs the transfer; nothing is cached. On shared memory the
//! device already sees host writes, so a transfer reduces to a fence.

use crate::registry::{BufferRegistry, Resolution};
use devgraph_common::{AccessError, SyncError};
use devgraph_graph::TensorRef;
use serde::Serialize;
use std::sync::atomic::{Ordering, fence};
use tracing::trace;

/// What a transfer had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transfer {
    /// Host and device alias the same memory.
    Fence,
    /// Bytes were copied between host and device memory.
    Copied { bytes: usize },
}

fn host_access(tensor: &TensorRef, res: &Resolution) -> SyncError {
    SyncError::Access {
        tensor: tensor.name.clone(),
        source: AccessError {
            offset: res.host_offset,
            len: tensor.nbytes,
            size: res.host.len(),
        },
    }
}

fn device_access(tensor: &TensorRef, source: AccessError) -> SyncError {
    SyncError::Access { tensor: tensor.name.clone(), source }
}

/// Copy the tensor's host bytes into device memory.
pub fn push_tensor(registry: &BufferRegistry, tensor: &TensorRef) -> Result<Transfer, SyncError> {
    let res = registry.resolve_tensor(tensor)?;
    if res.memory.is_shared() {
        fence(Ordering::SeqCst);
        return Ok(Transfer::Fence);
    }
    let bytes = res
        .host
        .read(res.host_offset, tensor.nbytes)
        .map_err(|_| host_access(tensor, &res))?;
    res.memory
        .write(res.memory_offset, &bytes)
        .map_err(|e| device_access(tensor, e))?;
    trace!(tensor = %tensor.name, bytes = bytes.len(), "pushed to device");
    Ok(Transfer::Copied { bytes: bytes.len() })
}

/// Copy the tensor's device bytes back into host memory.
pub fn pull_tensor(registry: &BufferRegistry, tensor: &TensorRef) -> Result<Transfer, SyncError> {
    let res = registry.resolve_tensor(tensor)?;
    if res.memory.is_shared() {
        fence(Ordering::SeqCst);
        return Ok(Transfer::Fence);
    }
    let bytes = res
        .memory
        .read(res.memory_offset, tensor.nbytes)
        .map_err(|e| device_access(tensor, e))?;
    res.host.write(res.host_offset, &bytes).map_err(|_| host_access(tensor, &res))?;
    trace!(tensor = %tensor.name, bytes = bytes.len(), "pulled from device");
    Ok(Transfer::Copied { bytes: bytes.len() })
}
