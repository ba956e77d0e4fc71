//! GPU execution backend for devgraph tensor graphs.
//!
//! A [`DeviceContext`] maps host buffers into device memory, computes
//! concurrency plans that group independent graph nodes, and executes
//! graphs across a pool of command streams with a barrier between groups.
//!
//! ```no_run
//! use devgraph_common::DType;
//! use devgraph_graph::{GraphBuilder, HostBuffer};
//! use devgraph_runtime::DeviceContext;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let arena = HostBuffer::alloc("arena", 4096)?;
//! let mut builder = GraphBuilder::new(Arc::clone(&arena));
//! let x = builder.tensor("x", DType::F32, &[4])?;
//! let y = builder.relu(&x)?;
//! let graph = builder.build();
//!
//! let mut ctx = DeviceContext::new(4);
//! ctx.register_buffer("arena", &arena, 4096)?;
//! arena.write_f32(&x, &[-1.0, 2.0, -3.0, 4.0])?;
//! ctx.push_tensor(&x)?;
//! ctx.compute_concurrency_plan(&graph, true)?;
//! ctx.execute_graph(&graph)?;
//! ctx.pull_tensor(&y)?;
//! assert_eq!(arena.read_f32(&y)?, vec![0.0, 2.0, 0.0, 4.0]);
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod context;
pub mod device;
pub mod dispatch;
pub mod kernels;
pub mod memory;
pub mod planner;
pub mod registry;
pub mod sync;

pub use command::{CommandStream, StreamState};
pub use context::DeviceContext;
pub use device::SimDevice;
pub use dispatch::{DispatchRecord, ExecutionHandle, ExecutionReport, ExecutionState};
pub use kernels::{KernelArgs, KernelFn, KernelLibrary, TensorData};
pub use memory::DeviceMemory;
pub use planner::{
    ConcurrencyEntry, ConcurrencyPlan, ConcurrencyPlanner, DispatchGroup, plan_concurrency,
};
pub use registry::{BufferRegistry, DeviceView, MappedBuffer, Resolution};
pub use sync::Transfer;
