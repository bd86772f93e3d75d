// Window surface
//
// Wraps the VkSurfaceKHR for one window and the queries the swapchain needs
// at (re)creation time. The choose_* helpers are pure so they can be tested
// without a GPU.

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::sync::Arc;

use super::error::{RenderResult, VkResultExt};
use super::instance::VulkanContext;

pub struct WindowSurface {
    pub loader: ash::extensions::khr::Surface,
    pub handle: vk::SurfaceKHR,
    context: Arc<VulkanContext>,
}

impl WindowSurface {
    pub fn new(context: Arc<VulkanContext>, display: RawDisplayHandle, window: RawWindowHandle) -> RenderResult<Self> {
        let loader = ash::extensions::khr::Surface::new(&context.entry, &context.instance);
        let handle = unsafe {
            ash_window::create_surface(&context.entry, &context.instance, display, window, None)
        }
        .vk_context("vkCreateSurfaceKHR")?;

        Ok(Self {
            loader,
            handle,
            context,
        })
    }

    pub fn context(&self) -> &Arc<VulkanContext> {
        &self.context
    }

    pub fn supports_present(&self, physical_device: vk::PhysicalDevice, queue_family: u32) -> RenderResult<bool> {
        unsafe {
            self.loader
                .get_physical_device_surface_support(physical_device, queue_family, self.handle)
        }
        .vk_context("vkGetPhysicalDeviceSurfaceSupportKHR")
    }

    pub fn capabilities(&self, physical_device: vk::PhysicalDevice) -> RenderResult<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.loader
                .get_physical_device_surface_capabilities(physical_device, self.handle)
        }
        .vk_context("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")
    }

    pub fn formats(&self, physical_device: vk::PhysicalDevice) -> RenderResult<Vec<vk::SurfaceFormatKHR>> {
        unsafe {
            self.loader
                .get_physical_device_surface_formats(physical_device, self.handle)
        }
        .vk_context("vkGetPhysicalDeviceSurfaceFormatsKHR")
    }

    pub fn present_modes(&self, physical_device: vk::PhysicalDevice) -> RenderResult<Vec<vk::PresentModeKHR>> {
        unsafe {
            self.loader
                .get_physical_device_surface_present_modes(physical_device, self.handle)
        }
        .vk_context("vkGetPhysicalDeviceSurfacePresentModesKHR")
    }
}

impl Drop for WindowSurface {
    fn drop(&mut self) {
        unsafe { self.loader.destroy_surface(self.handle, None) };
    }
}

/// Prefer B8G8R8A8_UNORM. A lone UNDEFINED entry means the surface has no
/// preference at all.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    const PREFERRED: vk::Format = vk::Format::B8G8R8A8_UNORM;

    match formats {
        [] => None,
        [only] if only.format == vk::Format::UNDEFINED => Some(vk::SurfaceFormatKHR {
            format: PREFERRED,
            color_space: only.color_space,
        }),
        _ => formats
            .iter()
            .find(|f| f.format == PREFERRED)
            .or_else(|| formats.first())
            .copied(),
    }
}

/// FIFO: Vsync enabled, guaranteed available
/// MAILBOX: No vsync, no tearing
/// IMMEDIATE: No vsync, lowest latency, may tear
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| modes.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 && count > caps.max_image_count {
        caps.max_image_count
    } else {
        count
    }
}

pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

pub fn choose_composite_alpha(supported: vk::CompositeAlphaFlagsKHR) -> vk::CompositeAlphaFlagsKHR {
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::INHERIT,
    ]
    .into_iter()
    .find(|flag| supported.contains(*flag))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}

pub fn choose_pre_transform(caps: &vk::SurfaceCapabilitiesKHR) -> vk::SurfaceTransformFlagsKHR {
    if caps.supported_transforms.contains(vk::SurfaceTransformFlagsKHR::IDENTITY) {
        vk::SurfaceTransformFlagsKHR::IDENTITY
    } else {
        caps.current_transform
    }
}
