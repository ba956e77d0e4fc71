//! Simulated compute device.
//!
//! Stands in for the GPU: it decides how mapped buffers are backed
//! (aliasing host memory or a device-local copy), bounds the extent of a
//! single addressable view, and sizes work-group grids for dispatches.

use crate::memory::DeviceMemory;
use devgraph_common::{AccessError, DeviceConfig, MemoryModel, ceil_div};
use devgraph_graph::HostBuffer;
use std::sync::Arc;
use tracing::info;

/// Properties of the device a context drives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimDevice {
    name: String,
    memory_model: MemoryModel,
    max_view_length: usize,
    page_size: usize,
    work_group_size: u32,
}

impl SimDevice {
    /// Open the device described by `config`.
    #[must_use]
    pub fn open(config: &DeviceConfig) -> Self {
        info!(
            device = %config.device_name,
            memory_model = %config.memory_model,
            max_view_length = config.max_view_length,
            "opened simulated compute device"
        );
        Self {
            name: config.device_name.clone(),
            memory_model: config.memory_model,
            max_view_length: config.max_view_length,
            page_size: config.page_size,
            work_group_size: config.work_group_size,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn memory_model(&self) -> MemoryModel {
        self.memory_model
    }

    /// Largest extent a single device view can address.
    #[must_use]
    pub const fn max_view_length(&self) -> usize {
        self.max_view_length
    }

    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub const fn work_group_size(&self) -> u32 {
        self.work_group_size
    }

    /// Back `host[offset..offset + len]` with device memory.
    pub fn map(
        &self,
        host: &Arc<HostBuffer>,
        offset: usize,
        len: usize,
    ) -> Result<Arc<DeviceMemory>, AccessError> {
        let memory = match self.memory_model {
            MemoryModel::Unified => DeviceMemory::shared(Arc::clone(host), offset, len),
            MemoryModel::Discrete => DeviceMemory::local_snapshot(host, offset, len)?,
        };
        Ok(Arc::new(memory))
    }

    /// Number of work groups needed to cover `elements` invocations.
    #[must_use]
    pub fn grid_size(&self, elements: usize) -> u32 {
        let groups = ceil_div(elements, self.work_group_size as usize);
        u32::try_from(groups).unwrap_or(u32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(model: MemoryModel) -> SimDevice {
        SimDevice::open(&DeviceConfig { memory_model: model, ..DeviceConfig::default() })
    }

    #[test]
    fn unified_maps_alias_host() {
        let host = HostBuffer::alloc("h", 128).unwrap();
        let mem = device(MemoryModel::Unified).map(&host, 0, 128).unwrap();
        assert!(mem.is_shared());
    }

    #[test]
    fn discrete_maps_copy_host() {
        let host = HostBuffer::alloc("h", 128).unwrap();
        let mem = device(MemoryModel::Discrete).map(&host, 64, 64).unwrap();
        assert!(!mem.is_shared());
        assert_eq!(mem.len(), 64);
    }

    #[test]
    fn grid_rounds_up() {
        let dev = device(MemoryModel::Unified);
        assert_eq!(dev.work_group_size(), 256);
        assert_eq!(dev.grid_size(1), 1);
        assert_eq!(dev.grid_size(256), 1);
        assert_eq!(dev.grid_size(257), 2);
        assert_eq!(dev.grid_size(0), 0);
    }
}
