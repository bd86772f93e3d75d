// Swapchain - Window presentation
//
// Owns the presentable images, their views, the render pass that targets
// them, one framebuffer per image and the N frame slots. Implements
// SwapchainBackend so the frame pipeline can drive it.

use ash::vk;
use std::sync::Arc;

use super::command::QueueKind;
use super::device::CheckpointMarker;
use super::error::{from_vk, RenderError, RenderResult, VkResultExt};
use super::frame::{AcquireOutcome, FrameSlotIndex, PresentImageIndex, PresentOutcome, SwapchainBackend};
use super::query::FrameTimings;
use super::render_pass::swapchain_render_pass_layout;
use super::surface::{self, WindowSurface};
use super::sync::FrameSlot;
use super::VulkanDevice;

pub struct VulkanSwapchain {
    pub loader: ash::extensions::khr::Swapchain,
    pub handle: vk::SwapchainKHR,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
    slots: Vec<FrameSlot>,
    vsync: bool,
    wait_stages: [vk::PipelineStageFlags; 1],
    surface: Arc<WindowSurface>,
    device: Arc<VulkanDevice>,
}

impl VulkanSwapchain {
    /// Set up slots and pick the surface format. Images are created by the
    /// first `recreate`.
    pub fn new(device: Arc<VulkanDevice>, surface: Arc<WindowSurface>, vsync: bool, frames_in_flight: usize) -> RenderResult<Self> {
        let formats = surface.formats(device.physical.handle)?;
        let format = surface::choose_surface_format(&formats)
            .ok_or_else(|| RenderError::MissingCapability("surface format".to_string()))?;
        log::info!("Surface format: {:?} / {:?}", format.format, format.color_space);

        let loader = ash::extensions::khr::Swapchain::new(device.instance(), &device.device);

        let mut slots = Vec::with_capacity(frames_in_flight);
        for index in 0..frames_in_flight {
            match FrameSlot::new(&device, index) {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    for slot in &slots {
                        slot.destroy(&device.device);
                    }
                    return Err(e);
                }
            }
        }

        Ok(Self {
            loader,
            handle: vk::SwapchainKHR::null(),
            format,
            extent: vk::Extent2D::default(),
            images: Vec::new(),
            image_views: Vec::new(),
            render_pass: vk::RenderPass::null(),
            framebuffers: Vec::new(),
            slots,
            vsync,
            wait_stages: [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
            surface,
            device,
        })
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn framebuffer(&self, image: PresentImageIndex) -> vk::Framebuffer {
        self.framebuffers[image.0 as usize]
    }

    /// Begin the swapchain render pass on `image`, clearing it to `clear_color`.
    pub fn begin_render_pass(&self, command_buffer: vk::CommandBuffer, image: PresentImageIndex, clear_color: [f32; 4]) {
        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue { float32: clear_color },
        }];
        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_pass)
            .framebuffer(self.framebuffer(image))
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: self.extent,
            })
            .clear_values(&clear_values);

        self.device.set_checkpoint(command_buffer, CheckpointMarker::RenderPassBegin);
        unsafe {
            self.device
                .device
                .cmd_begin_render_pass(command_buffer, &begin_info, vk::SubpassContents::INLINE);
        }
    }

    pub fn end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        unsafe { self.device.device.cmd_end_render_pass(command_buffer) };
        self.device.set_checkpoint(command_buffer, CheckpointMarker::RenderPassEnd);
    }

    fn destroy_image_resources(&mut self) {
        let device = &self.device.device;
        unsafe {
            for framebuffer in self.framebuffers.drain(..) {
                device.destroy_framebuffer(framebuffer, None);
            }
            for view in self.image_views.drain(..) {
                device.destroy_image_view(view, None);
            }
            if self.render_pass != vk::RenderPass::null() {
                device.destroy_render_pass(self.render_pass, None);
                self.render_pass = vk::RenderPass::null();
            }
        }
        self.images.clear();
    }

    fn create_image_resources(&mut self) -> RenderResult<()> {
        let device = &self.device.device;

        self.images = unsafe { self.loader.get_swapchain_images(self.handle) }.vk_context("vkGetSwapchainImagesKHR")?;
        log::info!("Created swapchain with {} images", self.images.len());

        for (i, &image) in self.images.iter().enumerate() {
            let create_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.format.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            let view = unsafe { device.create_image_view(&create_info, None) }.vk_context("vkCreateImageView")?;
            self.image_views.push(view);
            self.device.set_object_name(image, &format!("Swapchain image {}", i));
        }

        self.render_pass = swapchain_render_pass_layout(self.format.format).create(device)?;
        self.device.set_object_name(self.render_pass, "Swapchain render pass");

        for &view in &self.image_views {
            let attachments = [view];
            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(self.render_pass)
                .attachments(&attachments)
                .width(self.extent.width)
                .height(self.extent.height)
                .layers(1);
            let framebuffer = unsafe { device.create_framebuffer(&framebuffer_info, None) }
                .vk_context("vkCreateFramebuffer")?;
            self.framebuffers.push(framebuffer);
        }

        Ok(())
    }

    fn slot(&self, slot: FrameSlotIndex) -> &FrameSlot {
        &self.slots[slot.0]
    }
}

impl SwapchainBackend for VulkanSwapchain {
    fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    fn recreate(&mut self, width: u32, height: u32) -> RenderResult<vk::Extent2D> {
        let physical_device = self.device.physical.handle;
        let caps = self.surface.capabilities(physical_device)?;
        let present_modes = self.surface.present_modes(physical_device)?;

        let extent = surface::choose_extent(&caps, width, height);
        let image_count = surface::choose_image_count(&caps);
        let present_mode = surface::choose_present_mode(&present_modes, self.vsync);
        log::info!(
            "Creating swapchain: {}x{}, {} images, {:?}",
            extent.width,
            extent.height,
            image_count,
            present_mode
        );

        let mut image_usage = vk::ImageUsageFlags::COLOR_ATTACHMENT;
        for extra in [vk::ImageUsageFlags::TRANSFER_SRC, vk::ImageUsageFlags::TRANSFER_DST] {
            if caps.supported_usage_flags.contains(extra) {
                image_usage |= extra;
            }
        }

        let old_swapchain = self.handle;
        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface.handle)
            .min_image_count(image_count)
            .image_format(self.format.format)
            .image_color_space(self.format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(image_usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(surface::choose_pre_transform(&caps))
            .composite_alpha(surface::choose_composite_alpha(caps.supported_composite_alpha))
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let handle = unsafe { self.loader.create_swapchain(&create_info, None) }.vk_context("vkCreateSwapchainKHR")?;

        self.destroy_image_resources();
        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(old_swapchain, None) };
        }
        self.handle = handle;
        self.extent = extent;

        self.create_image_resources()?;

        for slot in &mut self.slots {
            slot.recreate_image_available(&self.device.device)?;
        }

        Ok(extent)
    }

    fn wait_for_slot(&mut self, slot: FrameSlotIndex) -> RenderResult<()> {
        let fence = self.slot(slot).in_flight_fence;
        unsafe { self.device.device.wait_for_fences(&[fence], true, u64::MAX) }.vk_context("vkWaitForFences")
    }

    fn acquire_next_image(&mut self, slot: FrameSlotIndex) -> RenderResult<AcquireOutcome> {
        let semaphore = self.slot(slot).image_available;
        let result = unsafe {
            self.loader
                .acquire_next_image(self.handle, u64::MAX, semaphore, vk::Fence::null())
        };

        match result {
            Ok((index, false)) => Ok(AcquireOutcome::Ready(PresentImageIndex(index))),
            Ok((index, true)) => Ok(AcquireOutcome::Suboptimal(PresentImageIndex(index))),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(from_vk("vkAcquireNextImageKHR", e)),
        }
    }

    fn read_gpu_timings(&mut self, slot: FrameSlotIndex) -> RenderResult<Option<FrameTimings>> {
        match &mut self.slots[slot.0].queries {
            Some(queries) => queries.read(&self.device.device),
            None => Ok(None),
        }
    }

    fn begin_recording(&mut self, slot: FrameSlotIndex, _image: PresentImageIndex) -> RenderResult<vk::CommandBuffer> {
        let frame = &mut self.slots[slot.0];
        let device = &self.device.device;

        unsafe { device.reset_command_pool(frame.command_pool, vk::CommandPoolResetFlags::empty()) }
            .vk_context("vkResetCommandPool")?;

        let begin_info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(frame.command_buffer, &begin_info) }.vk_context("vkBeginCommandBuffer")?;

        self.device.set_checkpoint(frame.command_buffer, CheckpointMarker::FrameBegin);
        if let Some(queries) = &mut frame.queries {
            queries.begin(device, frame.command_buffer);
        }
        Ok(frame.command_buffer)
    }

    fn submit(&mut self, slot: FrameSlotIndex, _image: PresentImageIndex) -> RenderResult<()> {
        let frame = &mut self.slots[slot.0];
        let device = &self.device.device;

        if let Some(queries) = &mut frame.queries {
            queries.end(device, frame.command_buffer);
        }
        self.device.set_checkpoint(frame.command_buffer, CheckpointMarker::FrameEnd);
        unsafe { device.end_command_buffer(frame.command_buffer) }.vk_context("vkEndCommandBuffer")?;

        let wait_semaphores = [frame.image_available];
        let signal_semaphores = [frame.render_finished];
        let command_buffers = [frame.command_buffer];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&self.wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe { device.reset_fences(&[frame.in_flight_fence]) }.vk_context("vkResetFences")?;

        let queue = self.device.lock_queue(QueueKind::Graphics);
        unsafe { device.queue_submit(*queue, &[submit_info.build()], frame.in_flight_fence) }
            .vk_context("vkQueueSubmit")
    }

    fn present(&mut self, slot: FrameSlotIndex, image: PresentImageIndex) -> RenderResult<PresentOutcome> {
        let wait_semaphores = [self.slot(slot).render_finished];
        let swapchains = [self.handle];
        let image_indices = [image.0];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = {
            let queue = self.device.lock_queue(QueueKind::Graphics);
            unsafe { self.loader.queue_present(*queue, &present_info) }
        };

        match result {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(from_vk("vkQueuePresentKHR", e)),
        }
    }

    fn wait_idle(&mut self) -> RenderResult<()> {
        self.device.wait_idle()
    }
}

impl Drop for VulkanSwapchain {
    fn drop(&mut self) {
        let _ = self.device.wait_idle();
        self.destroy_image_resources();
        unsafe {
            if self.handle != vk::SwapchainKHR::null() {
                self.loader.destroy_swapchain(self.handle, None);
            }
        }
        for slot in &self.slots {
            slot.destroy(&self.device.device);
        }
    }
}
