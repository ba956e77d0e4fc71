//! The device context: one per execution session.
//!
//! Owns the simulated device, the buffer registry, the kernel library, the
//! last concurrency plan and the command-stream dispatcher. Every mutating
//! call takes `&mut self`, so a context has exactly one writer at a time and
//! needs no internal locking.

use crate::device::SimDevice;
use crate::dispatch::{Dispatcher, Encoder, ExecutionHandle, ExecutionReport, ExecutionState};
use crate::kernels::{KernelArgs, KernelLibrary};
use crate::planner::{ConcurrencyEntry, ConcurrencyPlan, ConcurrencyPlanner};
use crate::registry::{BufferRegistry, MappedBuffer};
use crate::sync::{self, Transfer};
use devgraph_common::{
    ConfigError, DeviceConfig, ExecError, KernelError, RegistryError, SyncError,
};
use devgraph_graph::{ComputeGraph, HostBuffer, TensorRef};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Session state for executing graphs on one device.
#[derive(Debug)]
pub struct DeviceContext {
    config: DeviceConfig,
    device: SimDevice,
    registry: BufferRegistry,
    kernels: KernelLibrary,
    planner: ConcurrencyPlanner,
    dispatcher: Dispatcher,
}

impl DeviceContext {
    /// Create a context driving `stream_count` command streams, with every
    /// other setting at its default.
    #[must_use]
    pub fn new(stream_count: usize) -> Self {
        let config = DeviceConfig { stream_count, ..DeviceConfig::default() };
        Self::build(config)
    }

    /// Create a context from a full configuration.
    pub fn with_config(config: DeviceConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(mut config: DeviceConfig) -> Self {
        let device = SimDevice::open(&config);
        let dispatcher = Dispatcher::new(config.stream_count);
        config.stream_count = dispatcher.width();
        info!(
            device = device.name(),
            streams = dispatcher.width(),
            memory_model = %device.memory_model(),
            "device context created"
        );
        Self {
            config,
            device,
            registry: BufferRegistry::new(),
            kernels: KernelLibrary::with_builtins(),
            planner: ConcurrencyPlanner::new(),
            dispatcher,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &DeviceConfig {
        &self.config
    }

    #[must_use]
    pub const fn device(&self) -> &SimDevice {
        &self.device
    }

    #[must_use]
    pub const fn registry(&self) -> &BufferRegistry {
        &self.registry
    }

    #[must_use]
    pub const fn kernels(&self) -> &KernelLibrary {
        &self.kernels
    }

    /// Number of command streams used for execution.
    #[must_use]
    pub const fn stream_count(&self) -> usize {
        self.dispatcher.width()
    }

    /// Change the number of command streams; values outside `1..=32` are
    /// clamped. Returns the count in effect.
    pub fn set_stream_count(&mut self, n: usize) -> usize {
        let width = self.dispatcher.set_width(n);
        self.config.stream_count = width;
        width
    }

    /// Make all of `host` visible to the device.
    pub fn register_buffer(
        &mut self,
        name: &str,
        host: &Arc<HostBuffer>,
        max_tensor_size: usize,
    ) -> Result<&MappedBuffer, RegistryError> {
        self.register_buffer_range(name, host, 0, host.len(), max_tensor_size)
    }

    /// Make `host[offset..offset + len]` visible to the device.
    pub fn register_buffer_range(
        &mut self,
        name: &str,
        host: &Arc<HostBuffer>,
        offset: usize,
        len: usize,
        max_tensor_size: usize,
    ) -> Result<&MappedBuffer, RegistryError> {
        self.registry
            .register_range(&self.device, name, host, offset, len, max_tensor_size)
            .inspect_err(|e| warn!(buffer = name, error = %e, "buffer registration failed"))
    }

    /// Copy a tensor's host contents to the device.
    pub fn push_tensor(&self, tensor: &TensorRef) -> Result<Transfer, SyncError> {
        sync::push_tensor(&self.registry, tensor)
            .inspect_err(|e| error!(tensor = %tensor.name, error = %e, "push to device failed"))
    }

    /// Copy a tensor's device contents back to the host.
    pub fn pull_tensor(&self, tensor: &TensorRef) -> Result<Transfer, SyncError> {
        sync::pull_tensor(&self.registry, tensor)
            .inspect_err(|e| error!(tensor = %tensor.name, error = %e, "pull from device failed"))
    }

    /// Install a device program reachable through `OpKind::Custom(name)`.
    pub fn install_kernel<F>(&mut self, name: &str, kernel: F)
    where
        F: Fn(&KernelArgs<'_>) -> Result<Vec<u8>, KernelError> + Send + Sync + 'static,
    {
        debug!(kernel = name, "installing kernel");
        self.kernels.install(name, kernel);
    }

    /// Compute and remember a concurrency plan for `graph`.
    pub fn compute_concurrency_plan(
        &mut self,
        graph: &ComputeGraph,
        validate_memory_safety: bool,
    ) -> Result<&ConcurrencyPlan, ExecError> {
        self.dispatcher.begin_planning()?;
        Ok(self.planner.plan(graph, validate_memory_safety))
    }

    /// Plan with the configured memory-safety setting.
    pub fn compute_default_plan(
        &mut self,
        graph: &ComputeGraph,
    ) -> Result<&ConcurrencyPlan, ExecError> {
        let validate = self.config.validate_memory_safety;
        self.compute_concurrency_plan(graph, validate)
    }

    #[must_use]
    pub fn is_plan_available(&self) -> bool {
        self.planner.is_available()
    }

    /// Groups in the current plan, or 0 when none has been computed.
    #[must_use]
    pub fn plan_group_count(&self) -> usize {
        self.planner.group_count()
    }

    #[must_use]
    pub fn concurrency_plan(&self) -> Option<&ConcurrencyPlan> {
        self.planner.current()
    }

    /// The current plan flattened with barriers, empty when there is none.
    #[must_use]
    pub fn concurrency_list(&self) -> Vec<ConcurrencyEntry> {
        self.planner.current().map(ConcurrencyPlan::concurrency_list).unwrap_or_default()
    }

    /// Forget the current plan; later executions run serially.
    pub fn clear_concurrency_plan(&mut self) {
        self.planner.clear();
        self.dispatcher.abandon_planning();
    }

    #[must_use]
    pub const fn execution_state(&self) -> ExecutionState {
        self.dispatcher.state()
    }

    fn split(&mut self) -> (Encoder<'_>, Option<&ConcurrencyPlan>, &mut Dispatcher) {
        let encoder =
            Encoder { registry: &self.registry, kernels: &self.kernels, device: &self.device };
        (encoder, self.planner.current(), &mut self.dispatcher)
    }

    /// Execute `graph` and block until the device is done.
    ///
    /// Uses the current plan when it has more than one group; fails with
    /// [`ExecError::StalePlan`] if the plan was computed for a different graph.
    pub fn execute_graph(&mut self, graph: &ComputeGraph) -> Result<ExecutionReport, ExecError> {
        let (encoder, plan, dispatcher) = self.split();
        dispatcher.execute(&encoder, graph, plan)
    }

    /// Encode `graph` and start it in the background.
    pub fn execute_graph_async(
        &mut self,
        graph: &ComputeGraph,
    ) -> Result<ExecutionHandle<'_>, ExecError> {
        let (encoder, plan, dispatcher) = self.split();
        dispatcher.execute_async(&encoder, graph, plan)
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        debug!(
            buffers = self.registry.len(),
            streams = self.dispatcher.width(),
            "releasing device context"
        );
        self.registry.clear();
    }
}
