//! Device buffer registry.
//!
//! A fixed table of at most [`MAX_BUFFERS`] mapped host regions. Each entry
//! is backed by one device allocation and addressed through one or more
//! views; a region longer than the device's maximum view length is split
//! into overlapping views so that any tensor no larger than the
//! registration's `max_tensor_size` hint lies entirely inside one of them.

use crate::device::SimDevice;
use crate::memory::DeviceMemory;
use devgraph_common::{MAX_BUFFERS, RegistryError, ResolveError, align_up};
use devgraph_graph::{HostAddr, HostBuffer, TensorRef};
use std::sync::Arc;
use tracing::{debug, info};

/// A window onto a mapped buffer's device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceView {
    /// Start of the view relative to the start of the mapped region.
    pub offset: usize,
    pub len: usize,
}

impl DeviceView {
    fn contains(&self, offset: usize, nbytes: usize) -> bool {
        offset >= self.offset
            && offset.checked_add(nbytes).is_some_and(|end| end <= self.offset + self.len)
    }
}

/// One registered host region.
#[derive(Debug)]
pub struct MappedBuffer {
    name: String,
    host: Arc<HostBuffer>,
    host_offset: usize,
    base: HostAddr,
    len: usize,
    memory: Arc<DeviceMemory>,
    views: Vec<DeviceView>,
}

impl MappedBuffer {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// First host address of the region.
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

    #[must_use]
    pub fn views(&self) -> &[DeviceView] {
        &self.views
    }

    #[must_use]
    pub fn host(&self) -> &Arc<HostBuffer> {
        &self.host
    }

    #[must_use]
    pub fn memory(&self) -> &Arc<DeviceMemory> {
        &self.memory
    }

    fn overlaps(&self, base: HostAddr, len: usize) -> bool {
        base.get() < self.base.get() + self.len && self.base.get() < base.get() + len
    }
}

/// Where a host range lives on the device.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Slot of the mapped buffer in the registry table.
    pub buffer: usize,
    /// Index of the view containing the range.
    pub view: usize,
    /// Byte offset of the range inside that view.
    pub offset: usize,
    /// Byte offset of the range inside the buffer's device memory.
    pub memory_offset: usize,
    pub memory: Arc<DeviceMemory>,
    pub host: Arc<HostBuffer>,
    /// Byte offset of the range inside the host allocation.
    pub host_offset: usize,
}

/// Fixed-capacity table of mapped buffers.
#[derive(Debug)]
pub struct BufferRegistry {
    slots: [Option<MappedBuffer>; MAX_BUFFERS],
    count: usize,
}

impl Default for BufferRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self { slots: std::array::from_fn(|_| None), count: 0 }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.count
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.count == MAX_BUFFERS
    }

    /// Mapped buffers in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &MappedBuffer> {
        self.slots.iter().flatten()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&MappedBuffer> {
        self.iter().find(|b| b.name == name)
    }

    /// Map the whole of `host`.
    pub fn register(
        &mut self,
        device: &SimDevice,
        name: &str,
        host: &Arc<HostBuffer>,
        max_tensor_size: usize,
    ) -> Result<&MappedBuffer, RegistryError> {
        self.register_range(device, name, host, 0, host.len(), max_tensor_size)
    }

    /// Map `host[offset..offset + len]`.
    pub fn register_range(
        &mut self,
        device: &SimDevice,
        name: &str,
        host: &Arc<HostBuffer>,
        offset: usize,
        len: usize,
        max_tensor_size: usize,
    ) -> Result<&MappedBuffer, RegistryError> {
        let base = host.base().advance(offset);
        if len == 0 || !host.contains(base, len) {
            return Err(RegistryError::EmptyRegion { name: name.to_string() });
        }
        if self.get(name).is_some() {
            return Err(RegistryError::DuplicateName(name.to_string()));
        }
        if let Some(existing) = self.iter().find(|b| b.overlaps(base, len)) {
            return Err(RegistryError::Overlap {
                name: name.to_string(),
                existing: existing.name.clone(),
            });
        }
        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(RegistryError::TableFull { max: MAX_BUFFERS })?;

        let views = split_views(name, len, max_tensor_size, device)?;
        let memory = device.map(host, offset, len).map_err(|_| RegistryError::EmptyRegion {
            name: name.to_string(),
        })?;

        for (i, view) in views.iter().enumerate() {
            debug!(buffer = name, view = i, offset = view.offset, len = view.len, "device view");
        }
        info!(
            buffer = name,
            %base,
            size = len,
            views = views.len(),
            slot,
            shared = memory.is_shared(),
            "mapped host buffer"
        );

        self.count += 1;
        Ok(self.slots[slot].insert(MappedBuffer {
            name: name.to_string(),
            host: Arc::clone(host),
            host_offset: offset,
            base,
            len,
            memory,
            views,
        }))
    }

    /// Find the first view that fully contains `[addr, addr + nbytes)`.
    ///
    /// A bounded linear scan over the table and each entry's views.
    #[must_use]
    pub fn resolve(&self, addr: HostAddr, nbytes: usize) -> Option<Resolution> {
        self.slots.iter().enumerate().find_map(|(slot, entry)| {
            let buffer = entry.as_ref()?;
            let rel = addr.offset_from(buffer.base)?;
            let (index, view) =
                buffer.views.iter().enumerate().find(|(_, v)| v.contains(rel, nbytes))?;
            Some(Resolution {
                buffer: slot,
                view: index,
                offset: rel - view.offset,
                memory_offset: rel,
                memory: Arc::clone(&buffer.memory),
                host: Arc::clone(&buffer.host),
                host_offset: buffer.host_offset + rel,
            })
        })
    }

    /// Resolve a tensor's host range.
    pub fn resolve_tensor(&self, tensor: &TensorRef) -> Result<Resolution, ResolveError> {
        self.resolve(tensor.addr, tensor.nbytes).ok_or_else(|| ResolveError::Unmapped {
            tensor: tensor.name.clone(),
            addr: tensor.addr.get(),
            nbytes: tensor.nbytes,
        })
    }

    /// Drop every mapping.
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.count = 0;
    }
}

/// Split a region of `len` bytes into views no longer than the device's
/// maximum view length.
///
/// Consecutive views start `max_view_length - align_up(max_tensor_size)`
/// bytes apart, so each overlaps the next by at least `max_tensor_size`.
fn split_views(
    name: &str,
    len: usize,
    max_tensor_size: usize,
    device: &SimDevice,
) -> Result<Vec<DeviceView>, RegistryError> {
    let max_view = device.max_view_length();
    let page = device.page_size();
    let unrepresentable = || RegistryError::Unrepresentable {
        name: name.to_string(),
        size: len,
        max_tensor_size,
        max_view_length: max_view,
    };

    if align_up(len, page).is_some_and(|aligned| aligned <= max_view) {
        return Ok(vec![DeviceView { offset: 0, len }]);
    }

    let max_aligned = align_up(max_tensor_size, page).ok_or_else(unrepresentable)?;
    if max_tensor_size == 0 || max_aligned >= max_view {
        return Err(unrepresentable());
    }
    let step = max_view - max_aligned;

    let mut views = Vec::new();
    let mut start = 0;
    loop {
        let view_len = if start + max_view <= len { max_view } else { len - start };
        views.push(DeviceView { offset: start, len: view_len });
        if start + step >= len {
            break;
        }
        start += step;
    }
    Ok(views)
}

#[cfg(test)]
mod tests {
    use super::*;
    use devgraph_common::{DType, DeviceConfig, MemoryModel};
    use devgraph_graph::TensorId;

    fn device(max_view_length: usize) -> SimDevice {
        SimDevice::open(&DeviceConfig {
            memory_model: MemoryModel::Unified,
            max_view_length,
            page_size: 64,
            ..DeviceConfig::default()
        })
    }

    fn tensor(host: &HostBuffer, offset: usize, len: usize) -> TensorRef {
        TensorRef::new(TensorId(0), "t", DType::F32, vec![len / 4], host.base().advance(offset))
    }

    #[test]
    fn small_buffer_gets_one_view() {
        let dev = device(1024);
        let host = HostBuffer::alloc("w", 1000).unwrap();
        let mut reg = BufferRegistry::new();
        let entry = reg.register(&dev, "w", &host, 0).unwrap();
        assert_eq!(entry.views(), &[DeviceView { offset: 0, len: 1000 }]);
    }

    #[test]
    fn large_buffer_splits_into_overlapping_views() {
        let dev = device(256);
        let host = HostBuffer::alloc("big", 1000).unwrap();
        let mut reg = BufferRegistry::new();
        let entry = reg.register(&dev, "big", &host, 100).unwrap();
        // step = 256 - 128
        let offsets: Vec<_> = entry.views().iter().map(|v| v.offset).collect();
        assert_eq!(offsets, vec![0, 128, 256, 384, 512, 640, 768, 896]);
        assert_eq!(entry.views()[6].len, 1000 - 768);
        assert_eq!(entry.views().last().unwrap().len, 1000 - 896);
        assert!(entry.views().iter().all(|v| v.len <= 256));
    }

    #[test]
    fn unrepresentable_split_is_rejected() {
        let dev = device(256);
        let host = HostBuffer::alloc("big", 1000).unwrap();
        let mut reg = BufferRegistry::new();
        assert!(matches!(
            reg.register(&dev, "big", &host, 0),
            Err(RegistryError::Unrepresentable { .. })
        ));
        assert!(matches!(
            reg.register(&dev, "big", &host, 256),
            Err(RegistryError::Unrepresentable { .. })
        ));
        assert!(reg.is_empty());
    }

    #[test]
    fn resolve_returns_view_relative_offset() {
        let dev = device(256);
        let host = HostBuffer::alloc("big", 1000).unwrap();
        let mut reg = BufferRegistry::new();
        reg.register(&dev, "big", &host, 64).unwrap();
        let t = tensor(&host, 300, 64);
        let r = reg.resolve_tensor(&t).unwrap();
        // step = 192: views at 0, 192, 384, ...
        assert_eq!(r.view, 1);
        assert_eq!(r.offset, 108);
        assert_eq!(r.memory_offset, 300);
        assert_eq!(r.host_offset, 300);
    }

    #[test]
    fn table_full_from_seventeenth_registration() {
        let dev = device(1024);
        let mut reg = BufferRegistry::new();
        let hosts: Vec<_> =
            (0..=MAX_BUFFERS).map(|_| HostBuffer::alloc("b", 64).unwrap()).collect();
        for (i, host) in hosts.iter().take(MAX_BUFFERS).enumerate() {
            reg.register(&dev, &format!("b{i}"), host, 64).unwrap();
        }
        assert!(reg.is_full());
        let err = reg.register(&dev, "extra", &hosts[MAX_BUFFERS], 64).unwrap_err();
        assert_eq!(err, RegistryError::TableFull { max: MAX_BUFFERS });
        assert_eq!(reg.len(), MAX_BUFFERS);
        assert!(reg.get("b0").is_some());
    }

    #[test]
    fn duplicate_and_overlap_rejected() {
        let dev = device(1024);
        let host = HostBuffer::alloc("h", 512).unwrap();
        let other = HostBuffer::alloc("o", 64).unwrap();
        let mut reg = BufferRegistry::new();
        reg.register_range(&dev, "lo", &host, 0, 256, 0).unwrap();
        assert_eq!(
            reg.register(&dev, "lo", &other, 0).unwrap_err(),
            RegistryError::DuplicateName("lo".into())
        );
        assert!(matches!(
            reg.register_range(&dev, "mid", &host, 128, 256, 0),
            Err(RegistryError::Overlap { .. })
        ));
        reg.register_range(&dev, "hi", &host, 256, 256, 0).unwrap();
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn empty_or_out_of_range_region_rejected() {
        let dev = device(1024);
        let host = HostBuffer::alloc("h", 64).unwrap();
        let mut reg = BufferRegistry::new();
        assert!(reg.register_range(&dev, "z", &host, 0, 0, 0).is_err());
        assert!(reg.register_range(&dev, "o", &host, 32, 64, 0).is_err());
    }

    #[test]
    fn unmapped_tensor_fails_resolution() {
        let host = HostBuffer::alloc("h", 64).unwrap();
        let reg = BufferRegistry::new();
        let err = reg.resolve_tensor(&tensor(&host, 0, 16)).unwrap_err();
        assert!(matches!(err, ResolveError::Unmapped { nbytes: 16, .. }));
    }

    #[test]
    fn range_straddling_region_end_is_unmapped() {
        let dev = device(1024);
        let host = HostBuffer::alloc("h", 128).unwrap();
        let mut reg = BufferRegistry::new();
        reg.register_range(&dev, "lo", &host, 0, 64, 0).unwrap();
        assert!(reg.resolve(host.base().advance(48), 32).is_none());
        assert!(reg.resolve(host.base().advance(32), 32).is_some());
    }
}
