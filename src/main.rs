// =============================================================================
// EMBER RENDERER - Windowed driver for the Vulkan device/frame layer
// =============================================================================
//
// Opens a window, brings up the renderer and clears the swapchain every
// frame. Everything interesting lives in the library; this binary exercises
// it the way an upstream engine would.
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  App (winit event loop)                                         │
// │    └── Renderer (facade)                                        │
// │          ├── VulkanDevice (queues, per-thread pools)            │
// │          ├── GpuAllocator (accounting over gpu-allocator)       │
// │          ├── ReleaseQueue (deferred frees per frame slot)       │
// │          └── FramePipeline<VulkanSwapchain>                     │
// └─────────────────────────────────────────────────────────────────┘
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use ember_render::backend::allocator::{format_bytes, BufferDesc, MemoryUsage};
use ember_render::backend::QueueKind;
use ember_render::config::Config;
use ember_render::renderer::{RenderHandle, Renderer, RendererDesc};
use ember_render::{RenderError, RenderResult};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting Ember renderer");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!(
        "VSync: {}, frames in flight: {}",
        config.graphics.vsync,
        config.graphics.frames_in_flight()
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    match app.fatal.take() {
        Some(e) => Err(e).context("Renderer stopped on a fatal error"),
        None => Ok(()),
    }
}

/// Initialize logging with optional file output for validation errors
fn init_logging(config: &Config) {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);
    builder.init();

    if config.debug.log_to_file {
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            let _ = writeln!(file, "=== Ember Renderer Log ===");
            let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
            let _ = writeln!(file);
        }
    }
}

// =============================================================================
// UPLOAD SMOKE TEST
// =============================================================================

/// Fill a small host-visible buffer, run a transfer on a one-off command
/// buffer and hand the buffer to the release queue. Exercises the allocator,
/// the per-thread pools and the deferred release path once at startup.
fn upload_smoke_test(handle: &RenderHandle) -> RenderResult<()> {
    const SIZE: u64 = 64 * 1024;

    let allocator = handle.allocator().clone();
    let (allocation, buffer) = allocator.allocate_buffer(
        &BufferDesc {
            name: "startup upload".to_string(),
            size: SIZE,
            usage: vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::TRANSFER_SRC,
        },
        MemoryUsage::CpuToGpu,
    )?;
    allocator.write(allocation, 0, &[0xAB; 256])?;

    let device = handle.device();
    let command_buffer = device.allocate_command_buffer(true, QueueKind::Transfer)?;
    unsafe {
        device.device.cmd_fill_buffer(command_buffer, buffer, 256, SIZE - 256, 0);
    }
    device.flush_command_buffer_on(command_buffer, QueueKind::Transfer)?;

    let stats = allocator.stats();
    log::info!(
        "Upload smoke test done: {} in {} allocations",
        format_bytes(stats.used),
        stats.allocation_count
    );

    handle.submit_resource_free(move || allocator.destroy_buffer(buffer, allocation));
    Ok(())
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Field order matters for Drop: the renderer goes before the window it
/// draws into.
pub struct App {
    config: Config,

    // ─────────────────────────────────────────────────────────────────────────
    // RENDERING
    // ─────────────────────────────────────────────────────────────────────────
    renderer: Option<Renderer>,
    /// Set when the frame loop hit an unrecoverable error.
    fatal: Option<RenderError>,

    // ─────────────────────────────────────────────────────────────────────────
    // WINDOW
    // ─────────────────────────────────────────────────────────────────────────
    window: Option<Arc<Window>>,
    is_fullscreen: bool,

    // ─────────────────────────────────────────────────────────────────────────
    // FPS TRACKING
    // ─────────────────────────────────────────────────────────────────────────
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    pub fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            config,
            renderer: None,
            fatal: None,
            window: None,
            is_fullscreen,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    fn init_renderer(&mut self, window: &Window) -> RenderResult<()> {
        let size = window.inner_size();
        let mut desc = RendererDesc::from_config(&self.config);
        desc.width = size.width;
        desc.height = size.height;

        // Stored before the smoke test so a failure there can still reach
        // handle_fatal with a live device
        let renderer = self.renderer.insert(Renderer::new(window, &desc)?);
        upload_smoke_test(&renderer.handle())
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    /// Render a single frame. `Ok(false)` when nothing was drawn, e.g. while
    /// minimized.
    pub fn render_frame(&mut self) -> RenderResult<bool> {
        let Some(renderer) = self.renderer.as_mut() else {
            return Ok(false);
        };

        if !renderer.begin_frame()? {
            return Ok(false);
        }

        renderer.begin_swapchain_pass(self.config.graphics.clear_color);
        renderer.end_swapchain_pass();
        renderer.present()?;

        Ok(true)
    }

    fn on_render_error(&mut self, event_loop: &ActiveEventLoop, error: RenderError) {
        if !error.is_fatal() {
            log::warn!("Frame skipped: {}", error);
            return;
        }

        if let Some(ref renderer) = self.renderer {
            renderer.handle_fatal(&error);
        }
        self.fatal = Some(error);
        event_loop.exit();
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
            // The Resized event that follows drives the swapchain rebuild
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    pub fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        if now.duration_since(self.last_fps_update).as_secs_f32() >= 1.0 {
            let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
            let fps = self.frame_count as f32 / elapsed;

            if let (Some(window), Some(renderer)) = (&self.window, &self.renderer) {
                let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
                let memory = renderer.memory_stats();
                let gpu_ms = renderer.frame_stats().gpu_frame_time_ns as f64 / 1_000_000.0;
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms, GPU {:.2}ms) [{}] GPU mem {}",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    gpu_ms,
                    mode,
                    format_bytes(memory.used)
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        let init = self.init_renderer(&window);
        self.window = Some(window);

        match init {
            Ok(()) => {}
            Err(e) if self.renderer.is_some() => {
                log::error!("Renderer startup check failed: {}", e);
                self.on_render_error(event_loop, e);
            }
            Err(e) => {
                log::error!("Failed to initialize renderer: {}", e);
                self.fatal = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            // ─────────────────────────────────────────────────────────────────
            // WINDOW RESIZED
            // ─────────────────────────────────────────────────────────────────
            // Requests coalesce; the rebuild happens at the next begin_frame.
            // A zero size parks the renderer until the window comes back.
            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(ref mut renderer) = self.renderer {
                    renderer.resize(size.width, size.height);
                }
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) => self.on_render_error(event_loop, e),
            },

            // ─────────────────────────────────────────────────────────────────
            // KEYBOARD INPUT
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            KeyCode::F12 => {
                                if let Some(ref renderer) = self.renderer {
                                    renderer.allocator().dump_stats();
                                    log::info!("Frames: {:?}", renderer.frame_stats());
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws for maximum FPS.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        // Renderer first: its Drop waits for the GPU and flushes deferred frees
        if let Some(renderer) = self.renderer.take() {
            log::info!("Frames: {:?}", renderer.frame_stats());
            drop(renderer);
        }
        log::info!("Cleanup complete");
    }
}
