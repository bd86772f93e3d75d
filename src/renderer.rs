// =============================================================================
// RENDERER - Consumer-facing facade over the backend
// =============================================================================
//
// Owns the device, allocator, release queue and frame pipeline for one
// window. Upstream code talks to this (or to a cloned RenderHandle from a
// worker thread) and never to the backend types directly.

use ash::vk;
use parking_lot::Mutex;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::device::DeviceOptions;
use crate::backend::frame::FrameStats;
use crate::backend::framebuffer::{Framebuffer, FramebufferDesc};
use crate::backend::instance::VulkanContext;
use crate::backend::memory::VulkanMemoryBackend;
use crate::backend::surface::WindowSurface;
use crate::backend::{
    FramePipeline, FrameSlotIndex, GpuAllocator, MemoryStats, PresentImageIndex, ReleaseQueue, RenderError,
    RenderResult, VulkanDevice, VulkanSwapchain,
};
use crate::config::Config;

/// What a render command gets to work with. Commands that need the device
/// capture a RenderHandle.
#[derive(Debug, Clone, Copy)]
pub struct FrameContext {
    pub command_buffer: vk::CommandBuffer,
    pub slot: FrameSlotIndex,
    pub image: PresentImageIndex,
}

pub type RenderCommand = Box<dyn FnOnce(&FrameContext) + Send + 'static>;

/// Work submitted from any thread, recorded on the render thread at the start
/// of the next frame in submission order.
#[derive(Default)]
pub struct RenderCommandQueue {
    commands: Mutex<Vec<RenderCommand>>,
}

impl RenderCommandQueue {
    pub fn submit<F>(&self, command: F)
    where
        F: FnOnce(&FrameContext) + Send + 'static,
    {
        self.commands.lock().push(Box::new(command));
    }

    pub fn len(&self) -> usize {
        self.commands.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.lock().is_empty()
    }

    /// Run and clear everything queued so far. Commands submitted while this
    /// runs wait for the next frame.
    pub fn execute(&self, ctx: &FrameContext) -> usize {
        let commands = std::mem::take(&mut *self.commands.lock());
        let count = commands.len();
        for command in commands {
            command(ctx);
        }
        count
    }
}

#[derive(Debug, Clone)]
pub struct RendererDesc {
    pub app_name: String,
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
    pub frames_in_flight: usize,
    pub validation: bool,
    pub gpu_checkpoints: bool,
    pub device_lost_pause: Duration,
}

impl RendererDesc {
    pub fn from_config(config: &Config) -> Self {
        Self {
            app_name: config.window.title.clone(),
            width: config.window.width,
            height: config.window.height,
            vsync: config.graphics.vsync,
            frames_in_flight: config.graphics.frames_in_flight(),
            validation: cfg!(debug_assertions) && config.debug.validation_layers,
            gpu_checkpoints: config.debug.gpu_checkpoints,
            device_lost_pause: Duration::from_millis(config.debug.device_lost_pause_ms),
        }
    }
}

/// Cloneable access for threads other than the render thread.
#[derive(Clone)]
pub struct RenderHandle {
    device: Arc<VulkanDevice>,
    allocator: Arc<GpuAllocator>,
    release: Arc<ReleaseQueue>,
    commands: Arc<RenderCommandQueue>,
}

impl RenderHandle {
    pub fn submit<F>(&self, command: F)
    where
        F: FnOnce(&FrameContext) + Send + 'static,
    {
        self.commands.submit(command);
    }

    pub fn submit_resource_free<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.release.submit_resource_free(action);
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    pub fn allocator(&self) -> &Arc<GpuAllocator> {
        &self.allocator
    }

    pub fn memory_stats(&self) -> MemoryStats {
        self.allocator.stats()
    }
}

pub struct Renderer {
    frames: FramePipeline<VulkanSwapchain>,
    commands: Arc<RenderCommandQueue>,
    release: Arc<ReleaseQueue>,
    allocator: Arc<GpuAllocator>,
    device: Arc<VulkanDevice>,
    surface: Arc<WindowSurface>,
    device_lost_pause: Duration,
}

impl Renderer {
    /// Bring up everything needed to render into `window`.
    pub fn new<W>(window: &W, desc: &RendererDesc) -> RenderResult<Self>
    where
        W: HasRawWindowHandle + HasRawDisplayHandle,
    {
        log::info!("Initializing renderer ({} frames in flight)", desc.frames_in_flight);

        let display = window.raw_display_handle();
        let context = VulkanContext::new(&desc.app_name, display, desc.validation)?;
        let surface = Arc::new(WindowSurface::new(context.clone(), display, window.raw_window_handle())?);

        let device = VulkanDevice::new(
            context,
            &surface,
            DeviceOptions {
                gpu_checkpoints: desc.gpu_checkpoints,
            },
        )?;

        let (allocator, release, frames) = match Self::create_frame_resources(&device, &surface, desc) {
            Ok(parts) => parts,
            Err(e) => {
                if FatalReport::for_error(&e) == FatalReport::DeviceLost {
                    device.report_device_lost(desc.device_lost_pause);
                }
                return Err(e);
            }
        };

        log::info!("Renderer initialized successfully!");
        Ok(Self {
            frames,
            commands: Arc::new(RenderCommandQueue::default()),
            release,
            allocator,
            device,
            surface,
            device_lost_pause: desc.device_lost_pause,
        })
    }

    fn create_frame_resources(
        device: &Arc<VulkanDevice>,
        surface: &Arc<WindowSurface>,
        desc: &RendererDesc,
    ) -> RenderResult<(Arc<GpuAllocator>, Arc<ReleaseQueue>, FramePipeline<VulkanSwapchain>)> {
        let allocator = Arc::new(GpuAllocator::new(Box::new(VulkanMemoryBackend::new(device.clone())?)));
        let release = Arc::new(ReleaseQueue::new(desc.frames_in_flight));

        let swapchain = VulkanSwapchain::new(device.clone(), surface.clone(), desc.vsync, desc.frames_in_flight)?;
        let frames = FramePipeline::new(swapchain, release.clone(), desc.width, desc.height)?;

        Ok((allocator, release, frames))
    }

    pub fn handle(&self) -> RenderHandle {
        RenderHandle {
            device: self.device.clone(),
            allocator: self.allocator.clone(),
            release: self.release.clone(),
            commands: self.commands.clone(),
        }
    }

    // =========================================================================
    // FRAME
    // =========================================================================

    /// Start a frame and record queued render commands into it.
    /// `Ok(false)` means nothing will be drawn this frame.
    pub fn begin_frame(&mut self) -> RenderResult<bool> {
        if !self.frames.begin_frame()? {
            return Ok(false);
        }

        if let (Some(command_buffer), Some(image)) = (self.frames.command_buffer(), self.frames.current_image()) {
            let ctx = FrameContext {
                command_buffer,
                slot: self.frames.current_slot(),
                image,
            };
            self.commands.execute(&ctx);
        }
        Ok(true)
    }

    pub fn present(&mut self) -> RenderResult<()> {
        self.frames.present()
    }

    /// Begin the swapchain render pass on the frame's image.
    pub fn begin_swapchain_pass(&self, clear_color: [f32; 4]) {
        if let (Some(command_buffer), Some(image)) = (self.frames.command_buffer(), self.frames.current_image()) {
            self.frames
                .backend()
                .begin_render_pass(command_buffer, image, clear_color);
        }
    }

    pub fn end_swapchain_pass(&self) {
        if let Some(command_buffer) = self.frames.command_buffer() {
            self.frames.backend().end_render_pass(command_buffer);
        }
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.frames.resize(width, height, false);
    }

    pub fn force_recreate(&mut self, width: u32, height: u32) {
        self.frames.resize(width, height, true);
    }

    // =========================================================================
    // CONSUMER INTERFACE
    // =========================================================================

    pub fn submit<F>(&self, command: F)
    where
        F: FnOnce(&FrameContext) + Send + 'static,
    {
        self.commands.submit(command);
    }

    pub fn submit_resource_free<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.release.submit_resource_free(action);
    }

    pub fn current_frame_index(&self) -> FrameSlotIndex {
        self.frames.current_slot()
    }

    pub fn current_draw_command_buffer(&self) -> Option<vk::CommandBuffer> {
        self.frames.command_buffer()
    }

    pub fn memory_stats(&self) -> MemoryStats {
        self.allocator.stats()
    }

    pub fn frame_stats(&self) -> FrameStats {
        self.frames.stats()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.frames.extent()
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    pub fn allocator(&self) -> &Arc<GpuAllocator> {
        &self.allocator
    }

    pub fn surface(&self) -> &Arc<WindowSurface> {
        &self.surface
    }

    pub fn create_framebuffer(&self, desc: FramebufferDesc) -> RenderResult<Framebuffer> {
        Framebuffer::new(self.device.clone(), self.allocator.clone(), self.release.clone(), desc)
    }

    /// Last stop for an error from the frame loop. Device loss gets the
    /// checkpoint dump before the caller tears everything down.
    pub fn handle_fatal(&self, error: &RenderError) {
        log::error!("Fatal render error: {}", error);
        match FatalReport::for_error(error) {
            FatalReport::DeviceLost => self.device.report_device_lost(self.device_lost_pause),
            FatalReport::MemoryStats => self.allocator.dump_stats(),
            FatalReport::LogOnly => {}
        }
    }
}

/// Diagnostics collected before an error tears the renderer down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalReport {
    /// Pause, then dump the last GPU checkpoint of every queue.
    DeviceLost,
    MemoryStats,
    LogOnly,
}

impl FatalReport {
    pub fn for_error(error: &RenderError) -> Self {
        match error {
            RenderError::DeviceLost => FatalReport::DeviceLost,
            RenderError::OutOfMemory { .. } => FatalReport::MemoryStats,
            _ => FatalReport::LogOnly,
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Shutting down renderer...");
        if let Err(e) = self.frames.shutdown() {
            log::error!("Renderer shutdown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn render_desc_clamps_frames_in_flight() {
        let mut config = Config::default();
        config.graphics.frames_in_flight = 9;
        config.debug.device_lost_pause_ms = 250;
        let desc = RendererDesc::from_config(&config);
        assert_eq!(desc.frames_in_flight, 4);
        assert_eq!(desc.device_lost_pause, Duration::from_millis(250));
    }

    #[test]
    fn command_queue_drains_in_order() {
        let queue = RenderCommandQueue::default();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            queue.submit(move |ctx| order.lock().push((i, ctx.slot)));
        }
        assert_eq!(queue.len(), 3);

        let ctx = FrameContext {
            command_buffer: vk::CommandBuffer::null(),
            slot: FrameSlotIndex(1),
            image: PresentImageIndex(2),
        };
        assert_eq!(queue.execute(&ctx), 3);
        assert!(queue.is_empty());
        assert_eq!(
            *order.lock(),
            vec![(0, FrameSlotIndex(1)), (1, FrameSlotIndex(1)), (2, FrameSlotIndex(1))]
        );
    }

    #[test]
    fn commands_submitted_during_execution_wait_a_frame() {
        let queue = Arc::new(RenderCommandQueue::default());
        let ran = Arc::new(AtomicUsize::new(0));

        let (q, r) = (queue.clone(), ran.clone());
        queue.submit(move |_| {
            let r2 = r.clone();
            q.submit(move |_| {
                r2.fetch_add(1, Ordering::SeqCst);
            });
        });

        let ctx = FrameContext {
            command_buffer: vk::CommandBuffer::null(),
            slot: FrameSlotIndex(0),
            image: PresentImageIndex(0),
        };
        assert_eq!(queue.execute(&ctx), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(queue.execute(&ctx), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn device_loss_at_any_stage_gets_the_checkpoint_dump() {
        assert_eq!(FatalReport::for_error(&RenderError::DeviceLost), FatalReport::DeviceLost);
        assert_eq!(
            FatalReport::for_error(&RenderError::OutOfMemory {
                request: "vertex buffer".to_string(),
                used: 4096,
                available: 512,
            }),
            FatalReport::MemoryStats
        );
        assert_eq!(
            FatalReport::for_error(&RenderError::FenceTimeout { timeout_ns: 1 }),
            FatalReport::LogOnly
        );
        assert_eq!(FatalReport::for_error(&RenderError::SurfaceOutOfDate), FatalReport::LogOnly);
    }
}
