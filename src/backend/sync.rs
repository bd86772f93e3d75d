// Per-slot frame resources
//
// One FrameSlot per frame in flight: its own command pool/buffer plus the
// semaphores and fence that pace it against the GPU and the presentation
// engine, and the slot's GPU timing queries.

use ash::vk;

use super::error::{RenderResult, VkResultExt};
use super::query::FrameQueries;
use super::VulkanDevice;

pub struct FrameSlot {
    pub command_pool: vk::CommandPool,
    pub command_buffer: vk::CommandBuffer,
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
    /// None when the GPU cannot time the graphics queue.
    pub queries: Option<FrameQueries>,
}

impl FrameSlot {
    pub fn new(device: &VulkanDevice, index: usize) -> RenderResult<Self> {
        let raw = &device.device;

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.physical.queue_families.graphics)
            // TRANSIENT: Re-recorded every frame
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let command_pool = unsafe { raw.create_command_pool(&pool_info, None) }.vk_context("vkCreateCommandPool")?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let fence_info = vk::FenceCreateInfo::builder()
            .flags(vk::FenceCreateFlags::SIGNALED); // First wait must not block

        let created = (|| -> RenderResult<_> {
            let command_buffer = unsafe { raw.allocate_command_buffers(&alloc_info) }
                .vk_context("vkAllocateCommandBuffers")?[0];
            let (image_available, render_finished) = Self::create_semaphores(raw)?;
            let in_flight_fence = match unsafe { raw.create_fence(&fence_info, None) } {
                Ok(fence) => fence,
                Err(e) => {
                    unsafe {
                        raw.destroy_semaphore(image_available, None);
                        raw.destroy_semaphore(render_finished, None);
                    }
                    return Err(e).vk_context("vkCreateFence");
                }
            };
            let queries = match FrameQueries::new(device, index) {
                Ok(queries) => queries,
                Err(e) => {
                    unsafe {
                        raw.destroy_semaphore(image_available, None);
                        raw.destroy_semaphore(render_finished, None);
                        raw.destroy_fence(in_flight_fence, None);
                    }
                    return Err(e);
                }
            };
            Ok((command_buffer, image_available, render_finished, in_flight_fence, queries))
        })();

        let (command_buffer, image_available, render_finished, in_flight_fence, queries) = match created {
            Ok(parts) => parts,
            Err(e) => {
                unsafe { raw.destroy_command_pool(command_pool, None) };
                return Err(e);
            }
        };

        device.set_object_name(command_buffer, &format!("Frame {} command buffer", index));
        device.set_object_name(in_flight_fence, &format!("Frame {} fence", index));

        Ok(Self {
            command_pool,
            command_buffer,
            image_available,
            render_finished,
            in_flight_fence,
            queries,
        })
    }

    fn create_semaphores(device: &ash::Device) -> RenderResult<(vk::Semaphore, vk::Semaphore)> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let image_available = unsafe { device.create_semaphore(&semaphore_info, None) }.vk_context("vkCreateSemaphore")?;
        match unsafe { device.create_semaphore(&semaphore_info, None) } {
            Ok(render_finished) => Ok((image_available, render_finished)),
            Err(e) => {
                unsafe { device.destroy_semaphore(image_available, None) };
                Err(e).vk_context("vkCreateSemaphore")
            }
        }
    }

    /// Replace the acquire semaphore. Called after the device is idle during
    /// a swapchain rebuild, so a signal left behind by an abandoned acquire
    /// cannot leak into the next frame. `render_finished` is kept: the
    /// presentation engine may still be waiting on it from the last present,
    /// and every present consumes its signal.
    pub fn recreate_image_available(&mut self, device: &ash::Device) -> RenderResult<()> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let image_available = unsafe { device.create_semaphore(&semaphore_info, None) }.vk_context("vkCreateSemaphore")?;
        let old = std::mem::replace(&mut self.image_available, image_available);
        unsafe { device.destroy_semaphore(old, None) };
        Ok(())
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight_fence, None);
            device.destroy_command_pool(self.command_pool, None);
        }
        if let Some(queries) = &self.queries {
            queries.destroy(device);
        }
    }
}
