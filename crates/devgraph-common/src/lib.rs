//! Common types shared by the devgraph crates.
//!
//! This crate holds the pieces every layer of the GPU graph backend agrees
//! on: the fixed resource limits, tensor element types, the error taxonomy,
//! and the device configuration loaded from TOML and `DEVGRAPH_*`
//! environment variables.

pub mod config;
pub mod dtype;
pub mod error;
pub mod limits;

pub use config::{ConfigError, DeviceConfig, MemoryModel};
pub use dtype::DType;
pub use error::{
    AccessError, DevGraphError, ExecError, KernelError, RegistryError, ResolveError, Result,
    SyncError,
};
pub use limits::{MAX_BUFFERS, MAX_COMMAND_STREAMS, align_up, ceil_div};
