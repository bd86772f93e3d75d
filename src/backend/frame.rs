// Frame pipeline
//
// Drives the acquire -> record -> submit -> present protocol over a ring of
// N frame slots. The presentable image index and the frame slot index are
// separate counters; acquire may hand back any of the K images regardless of
// which slot is recording.
//
// FRAME TIMELINE (one slot):
// ┌──────────────────────────────────────────────────────────────────────┐
// │  wait_fence ─> release ─> acquire ─> record ─> submit ─> present     │
// │                                                                      │
// │  (CPU waits    (deferred   (image     (caller)  (GPU      (display   │
// │   for slot)     frees)      ready)               works)    shows)    │
// └──────────────────────────────────────────────────────────────────────┘

use ash::vk;
use std::sync::Arc;

use super::error::{RenderError, RenderResult};
use super::query::{FrameTimings, PipelineStatistics};
use super::release::ReleaseQueue;

/// Index into the ring of frames in flight (0..N).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FrameSlotIndex(pub usize);

/// Index of a presentable swapchain image (0..K).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PresentImageIndex(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Ready(PresentImageIndex),
    /// Usable, but the swapchain no longer matches the surface.
    Suboptimal(PresentImageIndex),
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Shown, but the swapchain should be rebuilt.
    Suboptimal,
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Recording,
    Submitted,
}

/// Platform side of the frame pipeline. Implemented over Vulkan by
/// `VulkanSwapchain`.
pub trait SwapchainBackend {
    fn frames_in_flight(&self) -> usize;

    /// (Re)create presentable images, views, render pass and framebuffers.
    /// Returns the extent actually used.
    fn recreate(&mut self, width: u32, height: u32) -> RenderResult<vk::Extent2D>;

    /// Block until the slot's previous submission has retired.
    fn wait_for_slot(&mut self, slot: FrameSlotIndex) -> RenderResult<()>;

    /// GPU cost of the slot's last submission. Only called right after
    /// `wait_for_slot` on a slot that had been submitted.
    fn read_gpu_timings(&mut self, _slot: FrameSlotIndex) -> RenderResult<Option<FrameTimings>> {
        Ok(None)
    }

    fn acquire_next_image(&mut self, slot: FrameSlotIndex) -> RenderResult<AcquireOutcome>;

    /// Reset the slot's command pool and begin its primary buffer.
    fn begin_recording(&mut self, slot: FrameSlotIndex, image: PresentImageIndex) -> RenderResult<vk::CommandBuffer>;

    /// End and submit the slot's primary buffer, signalling its fence.
    fn submit(&mut self, slot: FrameSlotIndex, image: PresentImageIndex) -> RenderResult<()>;

    fn present(&mut self, slot: FrameSlotIndex, image: PresentImageIndex) -> RenderResult<PresentOutcome>;

    fn wait_idle(&mut self) -> RenderResult<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub frames_presented: u64,
    pub frames_dropped: u64,
    pub swapchain_rebuilds: u64,
    /// GPU time of the most recently retired frame. Zero until one retires.
    pub gpu_frame_time_ns: u64,
    pub pipeline_statistics: Option<PipelineStatistics>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingResize {
    width: u32,
    height: u32,
    force: bool,
}

pub struct FramePipeline<B: SwapchainBackend> {
    backend: B,
    release: Arc<ReleaseQueue>,

    slot: FrameSlotIndex,
    slot_states: Vec<SlotState>,
    image: Option<PresentImageIndex>,
    command_buffer: Option<vk::CommandBuffer>,

    /// Last size the swapchain was built for, as requested by the window.
    size: (u32, u32),
    extent: vk::Extent2D,
    has_swapchain: bool,
    pending_resize: Option<PendingResize>,

    stats: FrameStats,
}

impl<B: SwapchainBackend> FramePipeline<B> {
    pub fn new(mut backend: B, release: Arc<ReleaseQueue>, width: u32, height: u32) -> RenderResult<Self> {
        let frames_in_flight = backend.frames_in_flight();
        assert!(frames_in_flight > 0, "need at least one frame in flight");
        assert_eq!(
            frames_in_flight,
            release.slot_count(),
            "release queue and swapchain disagree on frames in flight"
        );

        let minimized = width == 0 || height == 0;
        let extent = if minimized {
            vk::Extent2D::default()
        } else {
            backend.recreate(width, height)?
        };

        Ok(Self {
            backend,
            release,
            slot: FrameSlotIndex(0),
            slot_states: vec![SlotState::Idle; frames_in_flight],
            image: None,
            command_buffer: None,
            size: (width, height),
            extent,
            has_swapchain: !minimized,
            pending_resize: None,
            stats: FrameStats::default(),
        })
    }

    // =========================================================================
    // Resize
    // =========================================================================

    /// Request a swapchain rebuild at `width` x `height`.
    ///
    /// Applied at the next `begin_frame`. Requests made in between collapse
    /// into one rebuild at the latest size. The current size without `force`
    /// is a no-op.
    pub fn resize(&mut self, width: u32, height: u32, force: bool) {
        if !force && self.pending_resize.is_none() && self.has_swapchain && (width, height) == self.size {
            return;
        }

        let force = force || self.pending_resize.is_some_and(|p| p.force);
        self.pending_resize = Some(PendingResize { width, height, force });
    }

    /// Returns false while the surface has no area.
    fn apply_pending_resize(&mut self) -> RenderResult<bool> {
        let Some(pending) = self.pending_resize else {
            return Ok(self.has_swapchain);
        };
        if pending.width == 0 || pending.height == 0 {
            return Ok(false);
        }
        self.pending_resize = None;

        if pending.force || !self.has_swapchain || (pending.width, pending.height) != self.size {
            self.rebuild(pending.width, pending.height)?;
        }
        Ok(true)
    }

    fn rebuild(&mut self, width: u32, height: u32) -> RenderResult<()> {
        log::warn!("Rebuilding swapchain at {}x{}", width, height);
        self.backend.wait_idle()?;
        self.extent = self.backend.recreate(width, height)?;
        self.size = (width, height);
        if self.has_swapchain {
            self.stats.swapchain_rebuilds += 1;
        }
        self.has_swapchain = true;
        Ok(())
    }

    // =========================================================================
    // Frame protocol
    // =========================================================================

    /// Start recording the current slot.
    ///
    /// Returns `Ok(false)` when there is nothing to render into (minimized
    /// window). On `Ok(true)` the slot's command buffer is recording.
    pub fn begin_frame(&mut self) -> RenderResult<bool> {
        assert_ne!(
            self.slot_states[self.slot.0],
            SlotState::Recording,
            "begin_frame called twice without present"
        );

        if !self.apply_pending_resize()? {
            return Ok(false);
        }

        // Bounds CPU run-ahead to N frames
        self.backend.wait_for_slot(self.slot)?;
        let retired = self.slot_states[self.slot.0] == SlotState::Submitted;
        self.slot_states[self.slot.0] = SlotState::Idle;

        if retired {
            if let Some(timings) = self.backend.read_gpu_timings(self.slot)? {
                self.stats.gpu_frame_time_ns = timings.gpu_time_ns;
                self.stats.pipeline_statistics = timings.statistics;
            }
        }

        self.release.execute(self.slot.0);

        let image = self.acquire()?;
        let command_buffer = self.backend.begin_recording(self.slot, image)?;

        self.image = Some(image);
        self.command_buffer = Some(command_buffer);
        self.slot_states[self.slot.0] = SlotState::Recording;
        Ok(true)
    }

    fn acquire(&mut self) -> RenderResult<PresentImageIndex> {
        match self.backend.acquire_next_image(self.slot)? {
            AcquireOutcome::Ready(image) => return Ok(image),
            AcquireOutcome::Suboptimal(_) | AcquireOutcome::OutOfDate => {
                let (width, height) = self.size;
                self.rebuild(width, height)?;
            }
        }

        match self.backend.acquire_next_image(self.slot)? {
            AcquireOutcome::Ready(image) | AcquireOutcome::Suboptimal(image) => Ok(image),
            AcquireOutcome::OutOfDate => Err(RenderError::SurfaceOutOfDate),
        }
    }

    /// Submit the recorded slot and present its image, then move to the
    /// next slot. Out-of-date and suboptimal surfaces are rebuilt here and
    /// never reported to the caller.
    pub fn present(&mut self) -> RenderResult<()> {
        let slot = self.slot;
        let Some(image) = self.image.take() else {
            panic!("present called without a recording frame");
        };
        assert_eq!(self.slot_states[slot.0], SlotState::Recording);

        self.command_buffer = None;
        self.backend.submit(slot, image)?;
        self.slot_states[slot.0] = SlotState::Submitted;

        let outcome = self.backend.present(slot, image)?;
        self.slot = FrameSlotIndex((slot.0 + 1) % self.slot_states.len());

        match outcome {
            PresentOutcome::Presented => {
                self.stats.frames_presented += 1;
            }
            PresentOutcome::Suboptimal => {
                self.stats.frames_presented += 1;
                let (width, height) = self.size;
                self.rebuild(width, height)?;
            }
            PresentOutcome::OutOfDate => {
                self.stats.frames_dropped += 1;
                let (width, height) = self.size;
                self.rebuild(width, height)?;
            }
        }
        Ok(())
    }

    /// Wait for the GPU and run every outstanding deferred release.
    pub fn shutdown(&mut self) -> RenderResult<()> {
        self.backend.wait_idle()?;
        self.release.flush_all();
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn current_slot(&self) -> FrameSlotIndex {
        self.slot
    }

    pub fn current_image(&self) -> Option<PresentImageIndex> {
        self.image
    }

    /// The slot's primary buffer while a frame is recording.
    pub fn command_buffer(&self) -> Option<vk::CommandBuffer> {
        self.command_buffer
    }

    pub fn slot_state(&self, slot: FrameSlotIndex) -> SlotState {
        self.slot_states[slot.0]
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slot_states.len()
    }

    pub fn is_recording(&self) -> bool {
        self.image.is_some()
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }
}
