// Render target images
//
// An attachment image owns its VkImage, memory and view. Dropping the last
// reference does not destroy anything right away: destruction goes through
// the release queue so command buffers still in flight stay valid.

use ash::vk;
use std::sync::Arc;

use super::allocator::{AllocationHandle, GpuAllocator, ImageDesc, MemoryUsage};
use super::error::{RenderResult, VkResultExt};
use super::release::ReleaseQueue;
use super::render_pass::{has_stencil, is_depth_format};
use super::VulkanDevice;

pub struct AttachmentImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub width: u32,
    pub height: u32,
    pub size: u64,
    allocation: AllocationHandle,
    device: Arc<VulkanDevice>,
    allocator: Arc<GpuAllocator>,
    release: Arc<ReleaseQueue>,
}

impl AttachmentImage {
    pub fn new(
        device: Arc<VulkanDevice>,
        allocator: Arc<GpuAllocator>,
        release: Arc<ReleaseQueue>,
        name: &str,
        width: u32,
        height: u32,
        format: vk::Format,
    ) -> RenderResult<Arc<Self>> {
        let depth = is_depth_format(format);
        let usage = if depth {
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED
        } else {
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_SRC
        };

        let desc = ImageDesc::attachment_2d(name, width, height, format, usage);
        let (allocation, image, size) = allocator.allocate_image(&desc, MemoryUsage::GpuOnly)?;

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect_mask(format),
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = match unsafe { device.device.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(e) => {
                allocator.destroy_image(image, allocation);
                return Err(e).vk_context("vkCreateImageView");
            }
        };
        device.set_object_name(view, &format!("{} view", name));

        Ok(Arc::new(Self {
            image,
            view,
            format,
            width,
            height,
            size,
            allocation,
            device,
            allocator,
            release,
        }))
    }

    pub fn is_depth(&self) -> bool {
        is_depth_format(self.format)
    }
}

impl Drop for AttachmentImage {
    fn drop(&mut self) {
        let (image, view, allocation) = (self.image, self.view, self.allocation);
        let device = self.device.clone();
        let allocator = self.allocator.clone();
        self.release.submit_resource_free(move || {
            unsafe { device.device.destroy_image_view(view, None) };
            allocator.destroy_image(image, allocation);
        });
    }
}

pub fn aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    if !is_depth_format(format) {
        vk::ImageAspectFlags::COLOR
    } else if has_stencil(format) {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else {
        vk::ImageAspectFlags::DEPTH
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aspect_follows_format() {
        assert_eq!(aspect_mask(vk::Format::R16G16B16A16_SFLOAT), vk::ImageAspectFlags::COLOR);
        assert_eq!(aspect_mask(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            aspect_mask(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }
}
