// GPU memory accounting
//
// Responsibilities:
// - Front every buffer/image allocation made through the native allocator
// - Keep one record (size + kind) per live allocation for budget reporting
// - Report per-heap budget and leaks
//
// The accounting table is owned by GpuAllocator and only touched under its
// lock, so buffers and images may be created from any thread.

use ash::vk;
use parking_lot::Mutex;
use std::collections::HashMap;

use super::error::{RenderError, RenderResult};

/// Opaque key for one live native allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocationHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationKind {
    Buffer,
    Image,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRecord {
    pub size: u64,
    pub kind: AllocationKind,
}

/// Where the memory should live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryUsage {
    /// Device local, not mappable.
    GpuOnly,
    /// Host visible, for uploads.
    CpuToGpu,
    /// Host visible and cached, for readback.
    GpuToCpu,
}

impl MemoryUsage {
    pub fn is_host_visible(self) -> bool {
        !matches!(self, MemoryUsage::GpuOnly)
    }
}

#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub name: String,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
}

#[derive(Debug, Clone)]
pub struct ImageDesc {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
}

impl ImageDesc {
    pub fn attachment_2d(name: impl Into<String>, width: u32, height: u32, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            mip_levels: 1,
            array_layers: 1,
            format,
            usage,
        }
    }
}

/// A resource plus the native allocation bound to it.
#[derive(Debug)]
pub struct NativeAllocation<T> {
    pub handle: AllocationHandle,
    pub resource: T,
    /// Size reported by the native allocator, not the requested size.
    pub size: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapBudget {
    pub budget: u64,
    pub usage: u64,
}

/// The native allocator seam.
///
/// `Ok(None)` from a create call means the allocator had no memory for the
/// request. `Err` is reserved for driver failures.
pub trait MemoryBackend: Send {
    fn create_buffer(&mut self, desc: &BufferDesc, usage: MemoryUsage) -> RenderResult<Option<NativeAllocation<vk::Buffer>>>;
    fn create_image(&mut self, desc: &ImageDesc, usage: MemoryUsage) -> RenderResult<Option<NativeAllocation<vk::Image>>>;
    /// Release the memory only. The resource itself stays with the caller.
    fn free(&mut self, handle: AllocationHandle);
    fn destroy_buffer(&mut self, buffer: vk::Buffer, handle: AllocationHandle);
    fn destroy_image(&mut self, image: vk::Image, handle: AllocationHandle);
    fn write(&mut self, handle: AllocationHandle, offset: u64, data: &[u8]) -> RenderResult<()>;
    fn heap_budgets(&self) -> Vec<HeapBudget>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub used: u64,
    pub total_available: u64,
    pub allocation_count: usize,
    pub buffer_count: usize,
    pub buffer_bytes: u64,
    pub image_count: usize,
    pub image_bytes: u64,
}

struct AllocatorState {
    backend: Box<dyn MemoryBackend>,
    records: HashMap<AllocationHandle, AllocationRecord>,
    used: u64,
    total_allocated: u64,
}

impl AllocatorState {
    fn insert(&mut self, handle: AllocationHandle, record: AllocationRecord) {
        let previous = self.records.insert(handle, record);
        debug_assert!(previous.is_none(), "allocation handle {:?} reused while live", handle);
        self.used += record.size;
        self.total_allocated += record.size;
        log::trace!(
            "Allocated {:?} {:?} ({}), lifetime total {}",
            record.kind,
            handle,
            format_bytes(record.size),
            format_bytes(self.total_allocated)
        );
    }

    fn remove(&mut self, handle: AllocationHandle) {
        match self.records.remove(&handle) {
            Some(record) => {
                self.used -= record.size;
                log::trace!("Freed {:?} {:?} ({})", record.kind, handle, format_bytes(record.size));
            }
            None => log::error!("Could not find GPU memory allocation {:?}", handle),
        }
    }

    fn stats(&self) -> MemoryStats {
        let mut stats = MemoryStats {
            used: self.used,
            total_available: self.backend.heap_budgets().iter().map(|h| h.budget).sum(),
            allocation_count: self.records.len(),
            ..Default::default()
        };
        for record in self.records.values() {
            match record.kind {
                AllocationKind::Buffer => {
                    stats.buffer_count += 1;
                    stats.buffer_bytes += record.size;
                }
                AllocationKind::Image => {
                    stats.image_count += 1;
                    stats.image_bytes += record.size;
                }
            }
        }
        stats
    }

    fn exhausted(&self, request: String) -> RenderError {
        let stats = self.stats();
        log::error!("Failed to allocate {}", request);
        log::error!(
            "GPU mem usage: {}/{} across {} allocations",
            format_bytes(stats.used),
            format_bytes(stats.total_available),
            stats.allocation_count
        );
        RenderError::OutOfMemory {
            request,
            used: stats.used,
            available: stats.total_available,
        }
    }
}

pub struct GpuAllocator {
    state: Mutex<AllocatorState>,
}

impl GpuAllocator {
    pub fn new(backend: Box<dyn MemoryBackend>) -> Self {
        Self {
            state: Mutex::new(AllocatorState {
                backend,
                records: HashMap::new(),
                used: 0,
                total_allocated: 0,
            }),
        }
    }

    /// Allocate a buffer and bind memory to it.
    ///
    /// Panics on a zero-sized request.
    pub fn allocate_buffer(&self, desc: &BufferDesc, usage: MemoryUsage) -> RenderResult<(AllocationHandle, vk::Buffer)> {
        assert!(desc.size > 0, "zero-sized buffer allocation '{}'", desc.name);

        let mut state = self.state.lock();
        match state.backend.create_buffer(desc, usage)? {
            Some(allocation) => {
                state.insert(
                    allocation.handle,
                    AllocationRecord {
                        size: allocation.size,
                        kind: AllocationKind::Buffer,
                    },
                );
                Ok((allocation.handle, allocation.resource))
            }
            None => Err(state.exhausted(format!(
                "buffer '{}' of {}",
                desc.name,
                format_bytes(desc.size)
            ))),
        }
    }

    /// Allocate an image and bind memory to it. Returns the size the native
    /// allocator actually reserved.
    pub fn allocate_image(&self, desc: &ImageDesc, usage: MemoryUsage) -> RenderResult<(AllocationHandle, vk::Image, u64)> {
        assert!(
            desc.width > 0 && desc.height > 0 && desc.mip_levels > 0 && desc.array_layers > 0,
            "zero-sized image allocation '{}'",
            desc.name
        );

        let mut state = self.state.lock();
        match state.backend.create_image(desc, usage)? {
            Some(allocation) => {
                state.insert(
                    allocation.handle,
                    AllocationRecord {
                        size: allocation.size,
                        kind: AllocationKind::Image,
                    },
                );
                Ok((allocation.handle, allocation.resource, allocation.size))
            }
            None => Err(state.exhausted(format!(
                "image '{}' {}x{} ({} mips, {} layers, {:?})",
                desc.name, desc.width, desc.height, desc.mip_levels, desc.array_layers, desc.format
            ))),
        }
    }

    pub fn free(&self, handle: AllocationHandle) {
        let mut state = self.state.lock();
        state.remove(handle);
        state.backend.free(handle);
    }

    pub fn destroy_buffer(&self, buffer: vk::Buffer, handle: AllocationHandle) {
        let mut state = self.state.lock();
        state.remove(handle);
        state.backend.destroy_buffer(buffer, handle);
    }

    pub fn destroy_image(&self, image: vk::Image, handle: AllocationHandle) {
        let mut state = self.state.lock();
        state.remove(handle);
        state.backend.destroy_image(image, handle);
    }

    /// Copy `data` into a host-visible allocation.
    pub fn write(&self, handle: AllocationHandle, offset: u64, data: &[u8]) -> RenderResult<()> {
        let mut state = self.state.lock();
        if !state.records.contains_key(&handle) {
            return Err(RenderError::InvalidWrite(format!("unknown allocation {:?}", handle)));
        }
        state.backend.write(handle, offset, data)
    }

    pub fn record(&self, handle: AllocationHandle) -> Option<AllocationRecord> {
        self.state.lock().records.get(&handle).copied()
    }

    pub fn stats(&self) -> MemoryStats {
        self.state.lock().stats()
    }

    pub fn heap_budgets(&self) -> Vec<HeapBudget> {
        self.state.lock().backend.heap_budgets()
    }

    pub fn dump_stats(&self) {
        let state = self.state.lock();
        let stats = state.stats();
        log::warn!("-----------------------------------------------------");
        for (i, heap) in state.backend.heap_budgets().iter().enumerate() {
            log::warn!(
                "Heap {}: {} used of {} budget",
                i,
                format_bytes(heap.usage),
                format_bytes(heap.budget)
            );
        }
        log::warn!(
            "Tracked: {} buffers ({}), {} images ({})",
            stats.buffer_count,
            format_bytes(stats.buffer_bytes),
            stats.image_count,
            format_bytes(stats.image_bytes)
        );
        log::warn!("-----------------------------------------------------");
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.records.is_empty() {
            log::warn!(
                "GpuAllocator dropped with {} live allocations ({})",
                state.records.len(),
                format_bytes(state.used)
            );
            for (handle, record) in &state.records {
                log::warn!("  leaked {:?} {:?} ({})", record.kind, handle, format_bytes(record.size));
            }
        }
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::sync::Arc;

    /// In-memory allocator with a fixed budget. Rounds sizes up to 256 bytes
    /// so reported sizes differ from requested ones, like a real allocator.
    struct BudgetBackend {
        budget: u64,
        used: u64,
        next: u64,
        live: HashMap<AllocationHandle, (u64, Option<Vec<u8>>)>,
    }

    impl BudgetBackend {
        fn new(budget: u64) -> Self {
            Self {
                budget,
                used: 0,
                next: 1,
                live: HashMap::new(),
            }
        }

        fn reserve(&mut self, requested: u64, host_visible: bool) -> Option<(AllocationHandle, u64)> {
            let size = requested.div_ceil(256) * 256;
            if self.used + size > self.budget {
                return None;
            }
            let handle = AllocationHandle(self.next);
            self.next += 1;
            self.used += size;
            let mapped = host_visible.then(|| vec![0u8; size as usize]);
            self.live.insert(handle, (size, mapped));
            Some((handle, size))
        }
    }

    impl MemoryBackend for BudgetBackend {
        fn create_buffer(&mut self, desc: &BufferDesc, usage: MemoryUsage) -> RenderResult<Option<NativeAllocation<vk::Buffer>>> {
            Ok(self.reserve(desc.size, usage.is_host_visible()).map(|(handle, size)| NativeAllocation {
                handle,
                resource: vk::Buffer::from_raw(handle.0),
                size,
            }))
        }

        fn create_image(&mut self, desc: &ImageDesc, _usage: MemoryUsage) -> RenderResult<Option<NativeAllocation<vk::Image>>> {
            let bytes = desc.width as u64 * desc.height as u64 * 4 * desc.array_layers as u64;
            Ok(self.reserve(bytes, false).map(|(handle, size)| NativeAllocation {
                handle,
                resource: vk::Image::from_raw(handle.0),
                size,
            }))
        }

        fn free(&mut self, handle: AllocationHandle) {
            if let Some((size, _)) = self.live.remove(&handle) {
                self.used -= size;
            }
        }

        fn destroy_buffer(&mut self, _buffer: vk::Buffer, handle: AllocationHandle) {
            self.free(handle);
        }

        fn destroy_image(&mut self, _image: vk::Image, handle: AllocationHandle) {
            self.free(handle);
        }

        fn write(&mut self, handle: AllocationHandle, offset: u64, data: &[u8]) -> RenderResult<()> {
            let Some((_, Some(bytes))) = self.live.get_mut(&handle) else {
                return Err(RenderError::InvalidWrite("not host visible".into()));
            };
            let start = offset as usize;
            let end = start + data.len();
            if end > bytes.len() {
                return Err(RenderError::InvalidWrite("out of bounds".into()));
            }
            bytes[start..end].copy_from_slice(data);
            Ok(())
        }

        fn heap_budgets(&self) -> Vec<HeapBudget> {
            vec![HeapBudget {
                budget: self.budget,
                usage: self.used,
            }]
        }
    }

    fn buffer(size: u64) -> BufferDesc {
        BufferDesc {
            name: "test".into(),
            size,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
        }
    }

    #[test]
    fn record_lives_exactly_as_long_as_allocation() {
        let allocator = GpuAllocator::new(Box::new(BudgetBackend::new(1 << 20)));

        let (handle, _buffer) = allocator.allocate_buffer(&buffer(1000), MemoryUsage::GpuOnly).unwrap();
        let record = allocator.record(handle).unwrap();
        assert_eq!(record.kind, AllocationKind::Buffer);
        assert_eq!(record.size, 1024);

        allocator.free(handle);
        assert!(allocator.record(handle).is_none());
        assert_eq!(allocator.stats(), MemoryStats {
            total_available: 1 << 20,
            ..Default::default()
        });
    }

    #[test]
    fn stats_match_live_records() {
        let allocator = GpuAllocator::new(Box::new(BudgetBackend::new(1 << 24)));

        let (b0, buf0) = allocator.allocate_buffer(&buffer(256), MemoryUsage::CpuToGpu).unwrap();
        let (_b1, _) = allocator.allocate_buffer(&buffer(512), MemoryUsage::GpuOnly).unwrap();
        let desc = ImageDesc::attachment_2d("color", 16, 16, vk::Format::R8G8B8A8_UNORM, vk::ImageUsageFlags::COLOR_ATTACHMENT);
        let (i0, image, actual) = allocator.allocate_image(&desc, MemoryUsage::GpuOnly).unwrap();
        assert_eq!(actual, 1024);

        let stats = allocator.stats();
        assert_eq!(stats.allocation_count, 3);
        assert_eq!(stats.buffer_count, 2);
        assert_eq!(stats.buffer_bytes, 768);
        assert_eq!(stats.image_count, 1);
        assert_eq!(stats.image_bytes, 1024);
        assert_eq!(stats.used, 768 + 1024);

        allocator.destroy_buffer(buf0, b0);
        allocator.destroy_image(image, i0);
        let stats = allocator.stats();
        assert_eq!(stats.allocation_count, 1);
        assert_eq!(stats.used, 512);
    }

    #[test]
    fn exhaustion_leaves_stats_unchanged() {
        let allocator = GpuAllocator::new(Box::new(BudgetBackend::new(4096)));
        allocator.allocate_buffer(&buffer(1024), MemoryUsage::GpuOnly).unwrap();
        let before = allocator.stats();

        let err = allocator
            .allocate_buffer(&buffer(before.total_available + 1), MemoryUsage::GpuOnly)
            .unwrap_err();

        assert!(matches!(err, RenderError::OutOfMemory { used: 1024, available: 4096, .. }));
        assert!(!err.is_fatal());
        assert_eq!(allocator.stats(), before);
    }

    #[test]
    #[should_panic(expected = "zero-sized buffer")]
    fn zero_sized_buffer_is_a_programming_error() {
        let allocator = GpuAllocator::new(Box::new(BudgetBackend::new(4096)));
        let _ = allocator.allocate_buffer(&buffer(0), MemoryUsage::GpuOnly);
    }

    #[test]
    fn write_requires_host_visible_memory() {
        let allocator = GpuAllocator::new(Box::new(BudgetBackend::new(1 << 16)));
        let (upload, _) = allocator.allocate_buffer(&buffer(64), MemoryUsage::CpuToGpu).unwrap();
        let (device_only, _) = allocator.allocate_buffer(&buffer(64), MemoryUsage::GpuOnly).unwrap();

        allocator.write(upload, 0, &[1, 2, 3, 4]).unwrap();
        assert!(allocator.write(upload, 255, &[0, 0]).is_err());
        assert!(allocator.write(device_only, 0, &[1]).is_err());
        assert!(allocator.write(AllocationHandle(999), 0, &[1]).is_err());
    }

    #[test]
    fn concurrent_allocations_keep_table_consistent() {
        let allocator = Arc::new(GpuAllocator::new(Box::new(BudgetBackend::new(1 << 30))));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let allocator = allocator.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let (handle, buf) = allocator.allocate_buffer(&buffer(300), MemoryUsage::GpuOnly).unwrap();
                        allocator.destroy_buffer(buf, handle);
                    }
                    allocator.allocate_buffer(&buffer(256), MemoryUsage::GpuOnly).unwrap()
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let stats = allocator.stats();
        assert_eq!(stats.allocation_count, 4);
        assert_eq!(stats.used, 4 * 256);
    }

    #[test]
    fn formats_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KiB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MiB");
    }
}
