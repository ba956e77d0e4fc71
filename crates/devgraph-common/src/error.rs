//! Error taxonomy for the GPU graph backend.
//!
//! Registration errors are local and recoverable; resolution and device
//! errors abort the execution in progress but leave the device context
//! usable for a corrected retry.

use crate::config::ConfigError;
use thiserror::Error;

/// Umbrella error for callers that do not care which layer failed.
#[derive(Debug, Error)]
pub enum DevGraphError {
    #[error("registration error: {0}")]
    Registry(#[from] RegistryError),

    #[error("resolution error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("execution error: {0}")]
    Exec(#[from] ExecError),

    #[error("kernel error: {0}")]
    Kernel(#[from] KernelError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result alias defaulting to [`DevGraphError`].
pub type Result<T, E = DevGraphError> = std::result::Result<T, E>;

/// Failures of a buffer registration call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("buffer table full: at most {max} buffers can be mapped")]
    TableFull { max: usize },

    #[error("buffer '{0}' is already mapped")]
    DuplicateName(String),

    #[error("buffer '{name}' overlaps mapped buffer '{existing}'")]
    Overlap { name: String, existing: String },

    #[error("buffer '{name}' has an empty or out-of-range region")]
    EmptyRegion { name: String },

    #[error(
        "buffer '{name}' cannot be split into device views \
         (size={size}, max_tensor_size={max_tensor_size}, max_view_length={max_view_length})"
    )]
    Unrepresentable {
        name: String,
        size: usize,
        max_tensor_size: usize,
        max_view_length: usize,
    },
}

/// A tensor's host range is not covered by any mapped buffer view.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("tensor '{tensor}' ({nbytes} bytes at {addr:#x}) is not covered by any mapped buffer")]
    Unmapped { tensor: String, addr: usize, nbytes: usize },
}

/// Out-of-bounds access to host or device memory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("access out of bounds: offset={offset}, len={len}, size={size}")]
pub struct AccessError {
    pub offset: usize,
    pub len: usize,
    pub size: usize,
}

/// Failures of a host/device tensor transfer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("transfer of '{tensor}' failed: {source}")]
    Access {
        tensor: String,
        #[source]
        source: AccessError,
    },
}

/// Failures reported by an installed device program.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("kernel '{kernel}' is not installed")]
    NotInstalled { kernel: String },

    #[error("kernel '{kernel}' rejected its arguments: {reason}")]
    InvalidArguments { kernel: String, reason: String },

    #[error("kernel '{kernel}' does not support dtype {dtype}")]
    UnsupportedDType { kernel: String, dtype: String },

    #[error("kernel '{kernel}' failed: {reason}")]
    Failed { kernel: String, reason: String },

    #[error("device memory {0}")]
    Access(#[from] AccessError),
}

/// Failures of a graph execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("node {node} ({op}) could not be resolved: {source}")]
    Resolve {
        node: usize,
        op: String,
        #[source]
        source: ResolveError,
    },

    #[error("node {node} ({op}) could not be encoded: {source}")]
    Encode {
        node: usize,
        op: String,
        #[source]
        source: KernelError,
    },

    #[error("stream {stream} failed at node {node}: {source}")]
    Device {
        stream: usize,
        node: usize,
        #[source]
        source: KernelError,
    },

    #[error("stale concurrency plan: planned for graph {planned:#018x}, got {actual:#018x}")]
    StalePlan { planned: u64, actual: u64 },

    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("execution worker panicked")]
    WorkerPanicked,
}

impl ExecError {
    /// Whether the failure happened before anything was submitted to the device.
    #[must_use]
    pub const fn is_encoding_failure(&self) -> bool {
        matches!(self, Self::Resolve { .. } | Self::Encode { .. } | Self::StalePlan { .. })
    }
}
