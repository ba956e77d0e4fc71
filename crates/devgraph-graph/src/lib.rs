//! Tensor graphs as seen by the devgraph GPU backend.
//!
//! The backend consumes graphs that are built and validated on the host.
//! This crate provides the minimal model it needs:
//!
//! - [`host`]: page-aligned host-visible allocations and host addresses
//! - [`tensor`]: tensor references (host address, byte size, element type)
//! - [`op`]: operation kinds, each naming the device program that runs it
//! - [`graph`]: the ordered node list plus its structural fingerprint
//! - [`builder`]: a bump-allocating builder with shape validation

pub mod builder;
pub mod error;
pub mod graph;
pub mod host;
pub mod op;
pub mod tensor;

pub use builder::GraphBuilder;
pub use error::GraphError;
pub use graph::{ComputeGraph, GraphNode};
pub use host::{HostAddr, HostBuffer, alloc_host_visible};
pub use op::OpKind;
pub use tensor::{TensorId, TensorRef};
