// Native memory backend
//
// MemoryBackend implementation on top of gpu-allocator. Creates the Vulkan
// buffer/image, sub-allocates memory for it and binds the two together.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::{AllocationError, MemoryLocation};
use std::collections::HashMap;
use std::sync::Arc;

use super::allocator::{AllocationHandle, BufferDesc, HeapBudget, ImageDesc, MemoryBackend, MemoryUsage, NativeAllocation};
use super::error::{RenderError, RenderResult, VkResultExt};
use super::VulkanDevice;

enum BoundResource {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

struct LiveAllocation {
    allocation: Allocation,
    resource: BoundResource,
}

pub struct VulkanMemoryBackend {
    // Allocator must drop before the device it was created from
    allocator: Allocator,
    allocations: HashMap<AllocationHandle, LiveAllocation>,
    next_handle: u64,
    device: Arc<VulkanDevice>,
}

impl VulkanMemoryBackend {
    pub fn new(device: Arc<VulkanDevice>) -> RenderResult<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: device.instance().clone(),
            device: device.device.clone(),
            physical_device: device.physical.handle,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| RenderError::MissingCapability(format!("GPU memory allocator: {}", e)))?;

        log::info!(
            "Memory allocator ready ({} heaps, budget extension {})",
            device.physical.memory_properties.memory_heap_count,
            if device.supports_memory_budget() { "on" } else { "off" }
        );

        Ok(Self {
            allocator,
            allocations: HashMap::new(),
            next_handle: 1,
            device,
        })
    }

    fn location(usage: MemoryUsage) -> MemoryLocation {
        match usage {
            MemoryUsage::GpuOnly => MemoryLocation::GpuOnly,
            MemoryUsage::CpuToGpu => MemoryLocation::CpuToGpu,
            MemoryUsage::GpuToCpu => MemoryLocation::GpuToCpu,
        }
    }

    /// `Ok(None)` when the allocator is out of memory.
    fn allocate(
        &mut self,
        name: &str,
        requirements: vk::MemoryRequirements,
        usage: MemoryUsage,
        linear: bool,
    ) -> RenderResult<Option<Allocation>> {
        let result = self.allocator.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: Self::location(usage),
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });

        match result {
            Ok(allocation) => Ok(Some(allocation)),
            Err(AllocationError::OutOfMemory) => Ok(None),
            Err(e) => {
                log::error!("gpu-allocator failed for '{}': {}", name, e);
                Ok(None)
            }
        }
    }

    fn track(&mut self, allocation: Allocation, resource: BoundResource) -> (AllocationHandle, u64) {
        let handle = AllocationHandle(self.next_handle);
        self.next_handle += 1;
        let size = allocation.size();
        self.allocations.insert(handle, LiveAllocation { allocation, resource });
        (handle, size)
    }

    fn release(&mut self, handle: AllocationHandle) -> Option<BoundResource> {
        let live = self.allocations.remove(&handle)?;
        if let Err(e) = self.allocator.free(live.allocation) {
            log::error!("Failed to free GPU allocation {:?}: {}", handle, e);
        }
        Some(live.resource)
    }
}

impl MemoryBackend for VulkanMemoryBackend {
    fn create_buffer(&mut self, desc: &BufferDesc, usage: MemoryUsage) -> RenderResult<Option<NativeAllocation<vk::Buffer>>> {
        let device = self.device.clone();
        let create_info = vk::BufferCreateInfo::builder()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&create_info, None) }.vk_context("vkCreateBuffer")?;
        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.allocate(&desc.name, requirements, usage, true) {
            Ok(Some(allocation)) => allocation,
            other => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return other.map(|_| None);
            }
        };

        let bound = unsafe {
            device
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            unsafe { device.device.destroy_buffer(buffer, None) };
            let _ = self.allocator.free(allocation);
            return Err(e).vk_context("vkBindBufferMemory");
        }

        device.set_object_name(buffer, &desc.name);
        let (handle, size) = self.track(allocation, BoundResource::Buffer(buffer));
        Ok(Some(NativeAllocation {
            handle,
            resource: buffer,
            size,
        }))
    }

    fn create_image(&mut self, desc: &ImageDesc, usage: MemoryUsage) -> RenderResult<Option<NativeAllocation<vk::Image>>> {
        let device = self.device.clone();
        let create_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .format(desc.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.device.create_image(&create_info, None) }.vk_context("vkCreateImage")?;
        let requirements = unsafe { device.device.get_image_memory_requirements(image) };

        let allocation = match self.allocate(&desc.name, requirements, usage, false) {
            Ok(Some(allocation)) => allocation,
            other => {
                unsafe { device.device.destroy_image(image, None) };
                return other.map(|_| None);
            }
        };

        let bound = unsafe {
            device
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            unsafe { device.device.destroy_image(image, None) };
            let _ = self.allocator.free(allocation);
            return Err(e).vk_context("vkBindImageMemory");
        }

        device.set_object_name(image, &desc.name);
        let (handle, size) = self.track(allocation, BoundResource::Image(image));
        Ok(Some(NativeAllocation {
            handle,
            resource: image,
            size,
        }))
    }

    fn free(&mut self, handle: AllocationHandle) {
        self.release(handle);
    }

    fn destroy_buffer(&mut self, buffer: vk::Buffer, handle: AllocationHandle) {
        unsafe { self.device.device.destroy_buffer(buffer, None) };
        self.release(handle);
    }

    fn destroy_image(&mut self, image: vk::Image, handle: AllocationHandle) {
        unsafe { self.device.device.destroy_image(image, None) };
        self.release(handle);
    }

    fn write(&mut self, handle: AllocationHandle, offset: u64, data: &[u8]) -> RenderResult<()> {
        let live = self
            .allocations
            .get_mut(&handle)
            .ok_or_else(|| RenderError::InvalidWrite(format!("unknown allocation {:?}", handle)))?;

        let mapped = live
            .allocation
            .mapped_slice_mut()
            .ok_or_else(|| RenderError::InvalidWrite(format!("{:?} is not host visible", handle)))?;

        let start = offset as usize;
        let end = start
            .checked_add(data.len())
            .filter(|&end| end <= mapped.len())
            .ok_or_else(|| {
                RenderError::InvalidWrite(format!(
                    "{} bytes at offset {} exceed allocation of {}",
                    data.len(),
                    offset,
                    mapped.len()
                ))
            })?;

        mapped[start..end].copy_from_slice(data);
        Ok(())
    }

    fn heap_budgets(&self) -> Vec<HeapBudget> {
        let memory_properties = &self.device.physical.memory_properties;
        let heap_count = memory_properties.memory_heap_count as usize;

        if self.device.supports_memory_budget() {
            let mut budget = vk::PhysicalDeviceMemoryBudgetPropertiesEXT::default();
            let mut properties2 = vk::PhysicalDeviceMemoryProperties2::builder().push_next(&mut budget);
            unsafe {
                self.device
                    .instance()
                    .get_physical_device_memory_properties2(self.device.physical.handle, &mut properties2);
            }
            return (0..heap_count)
                .map(|i| HeapBudget {
                    budget: budget.heap_budget[i],
                    usage: budget.heap_usage[i],
                })
                .collect();
        }

        // Without the budget extension the best we know is the heap size
        memory_properties.memory_heaps[..heap_count]
            .iter()
            .map(|heap| HeapBudget {
                budget: heap.size,
                usage: 0,
            })
            .collect()
    }
}

impl Drop for VulkanMemoryBackend {
    fn drop(&mut self) {
        let handles: Vec<_> = self.allocations.keys().copied().collect();
        if !handles.is_empty() {
            log::warn!("Freeing {} GPU allocations still live at shutdown", handles.len());
        }
        for handle in handles {
            match self.release(handle) {
                Some(BoundResource::Buffer(buffer)) => unsafe { self.device.device.destroy_buffer(buffer, None) },
                Some(BoundResource::Image(image)) => unsafe { self.device.device.destroy_image(image, None) },
                None => {}
            }
        }
    }
}
