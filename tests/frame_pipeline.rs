// Frame protocol against a scripted swapchain. No GPU needed.

use ash::vk;
use ash::vk::Handle;
use ember_render::backend::frame::{
    AcquireOutcome, FramePipeline, FrameSlotIndex, PresentImageIndex, PresentOutcome, SlotState, SwapchainBackend,
};
use ember_render::backend::query::{FrameTimings, PipelineStatistics};
use ember_render::backend::{ReleaseQueue, RenderError, RenderResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Recreate(u32, u32),
    Wait { slot: usize, blocked: bool },
    Acquire(usize),
    Begin(usize, u32),
    Submit(usize, u32),
    Present(usize, u32),
    WaitIdle,
}

type CallLog = Arc<Mutex<Vec<Call>>>;

struct MockSwapchain {
    frames_in_flight: usize,
    image_count: u32,
    next_image: u32,
    /// Slot fences: true while a submission is outstanding.
    in_flight: Vec<bool>,
    acquire_script: VecDeque<AcquireOutcome>,
    present_script: VecDeque<PresentOutcome>,
    report_timings: bool,
    timing_reads: Vec<usize>,
    log: CallLog,
}

impl MockSwapchain {
    fn new(frames_in_flight: usize, log: CallLog) -> Self {
        Self {
            frames_in_flight,
            image_count: 3,
            next_image: 0,
            in_flight: vec![false; frames_in_flight],
            acquire_script: VecDeque::new(),
            present_script: VecDeque::new(),
            report_timings: false,
            timing_reads: Vec::new(),
            log,
        }
    }

    fn next_image(&mut self) -> PresentImageIndex {
        let image = PresentImageIndex(self.next_image);
        self.next_image = (self.next_image + 1) % self.image_count;
        image
    }
}

impl SwapchainBackend for MockSwapchain {
    fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    fn recreate(&mut self, width: u32, height: u32) -> RenderResult<vk::Extent2D> {
        self.log.lock().push(Call::Recreate(width, height));
        self.next_image = 0;
        Ok(vk::Extent2D { width, height })
    }

    fn wait_for_slot(&mut self, slot: FrameSlotIndex) -> RenderResult<()> {
        let blocked = std::mem::replace(&mut self.in_flight[slot.0], false);
        self.log.lock().push(Call::Wait { slot: slot.0, blocked });
        Ok(())
    }

    fn read_gpu_timings(&mut self, slot: FrameSlotIndex) -> RenderResult<Option<FrameTimings>> {
        assert!(!self.in_flight[slot.0], "timings read before slot {} retired", slot.0);
        self.timing_reads.push(slot.0);
        if !self.report_timings {
            return Ok(None);
        }
        Ok(Some(FrameTimings {
            gpu_time_ns: 250_000 * (slot.0 as u64 + 1),
            statistics: (slot.0 == 1).then(|| PipelineStatistics {
                fragment_shader_invocations: 1280 * 720,
                ..Default::default()
            }),
        }))
    }

    fn acquire_next_image(&mut self, slot: FrameSlotIndex) -> RenderResult<AcquireOutcome> {
        self.log.lock().push(Call::Acquire(slot.0));
        Ok(match self.acquire_script.pop_front() {
            Some(outcome) => outcome,
            None => AcquireOutcome::Ready(self.next_image()),
        })
    }

    fn begin_recording(&mut self, slot: FrameSlotIndex, image: PresentImageIndex) -> RenderResult<vk::CommandBuffer> {
        self.log.lock().push(Call::Begin(slot.0, image.0));
        Ok(vk::CommandBuffer::from_raw(0x100 + slot.0 as u64))
    }

    fn submit(&mut self, slot: FrameSlotIndex, image: PresentImageIndex) -> RenderResult<()> {
        self.log.lock().push(Call::Submit(slot.0, image.0));
        self.in_flight[slot.0] = true;
        Ok(())
    }

    fn present(&mut self, slot: FrameSlotIndex, image: PresentImageIndex) -> RenderResult<PresentOutcome> {
        self.log.lock().push(Call::Present(slot.0, image.0));
        Ok(self.present_script.pop_front().unwrap_or(PresentOutcome::Presented))
    }

    fn wait_idle(&mut self) -> RenderResult<()> {
        self.log.lock().push(Call::WaitIdle);
        self.in_flight.iter_mut().for_each(|f| *f = false);
        Ok(())
    }
}

fn pipeline(frames_in_flight: usize, width: u32, height: u32) -> (FramePipeline<MockSwapchain>, Arc<ReleaseQueue>, CallLog) {
    let log = CallLog::default();
    let release = Arc::new(ReleaseQueue::new(frames_in_flight));
    let frames = FramePipeline::new(MockSwapchain::new(frames_in_flight, log.clone()), release.clone(), width, height)
        .unwrap();
    log.lock().clear();
    (frames, release, log)
}

fn run_frame(frames: &mut FramePipeline<MockSwapchain>) {
    assert!(frames.begin_frame().unwrap());
    frames.present().unwrap();
}

fn recreates(log: &CallLog) -> Vec<(u32, u32)> {
    log.lock()
        .iter()
        .filter_map(|call| match call {
            Call::Recreate(w, h) => Some((*w, *h)),
            _ => None,
        })
        .collect()
}

#[test]
fn frame_follows_wait_acquire_record_submit_present() {
    let (mut frames, _release, log) = pipeline(2, 1280, 720);

    assert!(frames.begin_frame().unwrap());
    assert!(frames.is_recording());
    assert_eq!(frames.slot_state(FrameSlotIndex(0)), SlotState::Recording);
    assert_eq!(frames.command_buffer(), Some(vk::CommandBuffer::from_raw(0x100)));

    frames.present().unwrap();
    assert!(!frames.is_recording());
    assert_eq!(frames.slot_state(FrameSlotIndex(0)), SlotState::Submitted);
    assert_eq!(frames.current_slot(), FrameSlotIndex(1));

    assert_eq!(
        *log.lock(),
        vec![
            Call::Wait { slot: 0, blocked: false },
            Call::Acquire(0),
            Call::Begin(0, 0),
            Call::Submit(0, 0),
            Call::Present(0, 0),
        ]
    );
}

#[test]
fn slot_fence_is_waited_before_it_is_reused() {
    let (mut frames, _release, log) = pipeline(2, 1280, 720);

    for _ in 0..4 {
        run_frame(&mut frames);
    }

    let waits: Vec<Call> = log
        .lock()
        .iter()
        .filter(|call| matches!(call, Call::Wait { .. }))
        .cloned()
        .collect();
    assert_eq!(
        waits,
        vec![
            Call::Wait { slot: 0, blocked: false },
            Call::Wait { slot: 1, blocked: false },
            Call::Wait { slot: 0, blocked: true },
            Call::Wait { slot: 1, blocked: true },
        ]
    );
    assert_eq!(frames.stats().frames_presented, 4);
}

#[test]
fn image_index_is_independent_of_slot_index() {
    // Three presentable images cycling under two slots
    let (mut frames, _release, log) = pipeline(2, 1280, 720);

    for _ in 0..3 {
        run_frame(&mut frames);
    }

    let begins: Vec<Call> = log
        .lock()
        .iter()
        .filter(|call| matches!(call, Call::Begin(..)))
        .cloned()
        .collect();
    assert_eq!(begins, vec![Call::Begin(0, 0), Call::Begin(1, 1), Call::Begin(0, 2)]);
}

#[test]
fn resize_requests_coalesce_into_one_rebuild() {
    let (mut frames, _release, log) = pipeline(3, 1280, 720);

    frames.resize(800, 600, false);
    frames.resize(1920, 1080, false);
    run_frame(&mut frames);

    assert_eq!(recreates(&log), vec![(1920, 1080)]);
    assert_eq!(frames.extent(), vk::Extent2D { width: 1920, height: 1080 });
    assert_eq!(frames.stats().swapchain_rebuilds, 1);
}

#[test]
fn resize_to_current_size_is_a_no_op() {
    let (mut frames, _release, log) = pipeline(2, 1280, 720);

    frames.resize(1280, 720, false);
    run_frame(&mut frames);
    assert!(recreates(&log).is_empty());

    frames.resize(1280, 720, true);
    run_frame(&mut frames);
    assert_eq!(recreates(&log), vec![(1280, 720)]);
}

#[test]
fn resize_back_to_original_size_before_frame_skips_rebuild() {
    let (mut frames, _release, log) = pipeline(2, 1280, 720);

    frames.resize(640, 480, false);
    frames.resize(1280, 720, false);
    run_frame(&mut frames);

    assert!(recreates(&log).is_empty());
}

#[test]
fn suboptimal_present_rebuilds_without_error() {
    let (mut frames, _release, log) = pipeline(2, 1280, 720);
    frames.backend_mut().present_script.push_back(PresentOutcome::Suboptimal);

    assert!(frames.begin_frame().unwrap());
    frames.present().unwrap();

    assert_eq!(recreates(&log), vec![(1280, 720)]);
    let stats = frames.stats();
    assert_eq!(stats.frames_presented, 1);
    assert_eq!(stats.frames_dropped, 0);
    assert_eq!(stats.swapchain_rebuilds, 1);

    // The next frame proceeds normally on the new swapchain
    run_frame(&mut frames);
    assert_eq!(frames.stats().frames_presented, 2);
}

#[test]
fn out_of_date_present_counts_a_dropped_frame() {
    let (mut frames, _release, log) = pipeline(2, 1280, 720);
    frames.backend_mut().present_script.push_back(PresentOutcome::OutOfDate);

    run_frame(&mut frames);

    assert_eq!(recreates(&log), vec![(1280, 720)]);
    assert_eq!(frames.stats().frames_dropped, 1);
    assert_eq!(frames.stats().frames_presented, 0);
}

#[test]
fn out_of_date_acquire_rebuilds_and_retries_once() {
    let (mut frames, _release, log) = pipeline(2, 1280, 720);
    frames.backend_mut().acquire_script.push_back(AcquireOutcome::OutOfDate);

    assert!(frames.begin_frame().unwrap());
    frames.present().unwrap();

    let calls = log.lock().clone();
    let acquires = calls.iter().filter(|call| matches!(call, Call::Acquire(_))).count();
    assert_eq!(acquires, 2);
    assert_eq!(recreates(&log), vec![(1280, 720)]);
}

#[test]
fn acquire_out_of_date_twice_is_an_error() {
    let (mut frames, _release, _log) = pipeline(2, 1280, 720);
    frames.backend_mut().acquire_script.extend([AcquireOutcome::OutOfDate, AcquireOutcome::OutOfDate]);

    match frames.begin_frame() {
        Err(RenderError::SurfaceOutOfDate) => {}
        other => panic!("expected SurfaceOutOfDate, got {:?}", other.map(|_| ())),
    }
    assert!(!frames.is_recording());
}

#[test]
fn deferred_release_runs_after_slot_comes_back_around() {
    let (mut frames, release, log) = pipeline(3, 1280, 720);
    let freed = Arc::new(Mutex::new(false));

    assert!(frames.begin_frame().unwrap());
    {
        let (freed, log) = (freed.clone(), log.clone());
        release.submit_resource_free(move || {
            // The slot's fence must already have been waited on
            assert!(matches!(log.lock().last(), Some(Call::Wait { slot: 0, .. })));
            *freed.lock() = true;
        });
    }
    frames.present().unwrap();

    run_frame(&mut frames);
    run_frame(&mut frames);
    assert!(!*freed.lock());
    assert_eq!(release.pending(), 1);

    // Slot 0 again
    assert!(frames.begin_frame().unwrap());
    assert!(*freed.lock());
    assert_eq!(release.pending(), 0);
    frames.present().unwrap();
}

#[test]
fn shutdown_flushes_pending_releases() {
    let (mut frames, release, log) = pipeline(2, 1280, 720);
    let freed = Arc::new(Mutex::new(0));

    run_frame(&mut frames);
    for _ in 0..3 {
        let freed = freed.clone();
        release.submit_resource_free(move || *freed.lock() += 1);
    }

    frames.shutdown().unwrap();
    assert_eq!(*freed.lock(), 3);
    assert_eq!(log.lock().last(), Some(&Call::WaitIdle));
}

#[test]
fn zero_size_skips_frames_until_restored() {
    let (mut frames, _release, log) = pipeline(2, 1280, 720);

    frames.resize(0, 0, false);
    assert!(!frames.begin_frame().unwrap());
    assert!(!frames.begin_frame().unwrap());
    assert!(log.lock().is_empty());

    frames.resize(1024, 768, false);
    run_frame(&mut frames);
    assert_eq!(recreates(&log), vec![(1024, 768)]);
}

#[test]
fn starting_minimized_builds_swapchain_on_first_real_size() {
    let (mut frames, _release, log) = pipeline(2, 0, 0);

    assert!(!frames.begin_frame().unwrap());
    frames.resize(800, 600, false);
    run_frame(&mut frames);

    assert_eq!(recreates(&log), vec![(800, 600)]);
    // First creation is not a rebuild
    assert_eq!(frames.stats().swapchain_rebuilds, 0);
}

#[test]
#[should_panic(expected = "begin_frame called twice")]
fn begin_frame_twice_panics() {
    let (mut frames, _release, _log) = pipeline(2, 1280, 720);
    let _ = frames.begin_frame();
    let _ = frames.begin_frame();
}

#[test]
#[should_panic(expected = "disagree on frames in flight")]
fn mismatched_release_ring_panics() {
    let log = CallLog::default();
    let release = Arc::new(ReleaseQueue::new(3));
    let _ = FramePipeline::new(MockSwapchain::new(2, log), release, 1280, 720);
}

#[test]
fn gpu_time_is_read_once_the_slot_retires() {
    let (mut frames, _release, _log) = pipeline(2, 1280, 720);
    frames.backend_mut().report_timings = true;

    run_frame(&mut frames);
    run_frame(&mut frames);
    assert!(frames.backend().timing_reads.is_empty());
    assert_eq!(frames.stats().gpu_frame_time_ns, 0);

    run_frame(&mut frames);
    assert_eq!(frames.backend().timing_reads, vec![0]);
    assert_eq!(frames.stats().gpu_frame_time_ns, 250_000);
    assert_eq!(frames.stats().pipeline_statistics, None);

    run_frame(&mut frames);
    assert_eq!(frames.backend().timing_reads, vec![0, 1]);
    assert_eq!(frames.stats().gpu_frame_time_ns, 500_000);
    assert_eq!(
        frames.stats().pipeline_statistics.map(|s| s.fragment_shader_invocations),
        Some(1280 * 720)
    );
}

#[test]
fn missing_timings_keep_the_last_reading() {
    let (mut frames, _release, _log) = pipeline(1, 640, 480);
    frames.backend_mut().report_timings = true;
    run_frame(&mut frames);
    run_frame(&mut frames);
    assert_eq!(frames.stats().gpu_frame_time_ns, 250_000);

    frames.backend_mut().report_timings = false;
    run_frame(&mut frames);
    assert_eq!(frames.backend().timing_reads, vec![0, 0]);
    assert_eq!(frames.stats().gpu_frame_time_ns, 250_000);
}
