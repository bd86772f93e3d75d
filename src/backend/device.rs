// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Physical device selection (prefer discrete GPU, require presentation)
// - Logical device + graphics/compute/transfer queue creation
// - Per-thread command pools and one-off command buffer submission
// - Queue submission locks
// - GPU checkpoint markers for device-lost diagnostics

use ash::vk;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, HashSet};
use std::ffi::{c_void, CStr, CString};
use std::sync::Arc;
use std::time::Duration;

use super::command::{QueueKind, ThreadCommandPool, ThreadRegistry};
use super::error::{RenderError, RenderResult, VkResultExt};
use super::instance::VulkanContext;
use super::surface::WindowSurface;

/// Ceiling for a blocking one-off submission. Exceeding it means the GPU hung.
pub const FLUSH_FENCE_TIMEOUT_NS: u64 = 100_000_000_000;

const DEPTH_FORMAT_CANDIDATES: [vk::Format; 5] = [
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D32_SFLOAT,
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D16_UNORM_S8_UINT,
    vk::Format::D16_UNORM,
];

// =============================================================================
// Queue families
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub compute: u32,
    pub transfer: u32,
}

impl QueueFamilyIndices {
    /// Graphics must be able to present. Compute and transfer prefer families
    /// dedicated to them so async work does not contend with rendering.
    pub fn select(
        families: &[vk::QueueFamilyProperties],
        mut supports_present: impl FnMut(u32) -> bool,
    ) -> Option<Self> {
        let indexed = || families.iter().enumerate().map(|(i, f)| (i as u32, f.queue_flags));

        let graphics = indexed()
            .find(|&(i, flags)| flags.contains(vk::QueueFlags::GRAPHICS) && supports_present(i))
            .map(|(i, _)| i)?;

        let compute = indexed()
            .find(|(_, flags)| flags.contains(vk::QueueFlags::COMPUTE) && !flags.contains(vk::QueueFlags::GRAPHICS))
            .or_else(|| indexed().find(|(_, flags)| flags.contains(vk::QueueFlags::COMPUTE)))
            .map(|(i, _)| i)
            .unwrap_or(graphics);

        let transfer = indexed()
            .find(|(_, flags)| {
                flags.contains(vk::QueueFlags::TRANSFER)
                    && !flags.intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            })
            .or_else(|| indexed().find(|(_, flags)| flags.contains(vk::QueueFlags::TRANSFER)))
            .map(|(i, _)| i)
            .unwrap_or(graphics);

        Some(Self {
            graphics,
            compute,
            transfer,
        })
    }

    pub fn family(&self, kind: QueueKind) -> u32 {
        match kind {
            QueueKind::Graphics => self.graphics,
            QueueKind::Compute => self.compute,
            QueueKind::Transfer => self.transfer,
        }
    }

    pub fn unique(&self) -> Vec<u32> {
        let mut families = vec![self.graphics, self.compute, self.transfer];
        families.sort_unstable();
        families.dedup();
        families
    }
}

/// First candidate usable as an optimally tiled depth/stencil attachment.
pub fn pick_depth_format(mut supports_depth_attachment: impl FnMut(vk::Format) -> bool) -> Option<vk::Format> {
    DEPTH_FORMAT_CANDIDATES
        .into_iter()
        .find(|&format| supports_depth_attachment(format))
}

// =============================================================================
// Physical device
// =============================================================================

/// Everything we need to know about the GPU, queried once.
pub struct PhysicalDeviceDescriptor {
    pub handle: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub features: vk::PhysicalDeviceFeatures,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub queue_families: QueueFamilyIndices,
    /// Meaningful bits in a graphics-queue timestamp. Zero means no timestamps.
    pub graphics_timestamp_bits: u32,
    pub extensions: HashSet<String>,
    pub depth_format: vk::Format,
}

impl PhysicalDeviceDescriptor {
    fn query(
        instance: &ash::Instance,
        handle: vk::PhysicalDevice,
        surface: &WindowSurface,
    ) -> RenderResult<Result<Self, String>> {
        let properties = unsafe { instance.get_physical_device_properties(handle) };
        let features = unsafe { instance.get_physical_device_features(handle) };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(handle) };
        let families = unsafe { instance.get_physical_device_queue_family_properties(handle) };

        let extensions: HashSet<String> = unsafe { instance.enumerate_device_extension_properties(handle) }
            .vk_context("vkEnumerateDeviceExtensionProperties")?
            .iter()
            .map(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }.to_string_lossy().into_owned())
            .collect();

        let swapchain_ext = ash::extensions::khr::Swapchain::name().to_string_lossy();
        if !extensions.contains(swapchain_ext.as_ref()) {
            return Ok(Err(swapchain_ext.into_owned()));
        }

        let mut present_error = None;
        let queue_families = QueueFamilyIndices::select(&families, |family| {
            surface.supports_present(handle, family).unwrap_or_else(|e| {
                present_error = Some(e);
                false
            })
        });
        if let Some(e) = present_error {
            return Err(e);
        }
        let Some(queue_families) = queue_families else {
            return Ok(Err("graphics queue with present support".to_string()));
        };

        let graphics_timestamp_bits = families[queue_families.graphics as usize].timestamp_valid_bits;

        let depth_format = pick_depth_format(|format| {
            let props = unsafe { instance.get_physical_device_format_properties(handle, format) };
            props
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        });
        let Some(depth_format) = depth_format else {
            return Ok(Err("depth/stencil attachment format".to_string()));
        };

        Ok(Ok(Self {
            handle,
            properties,
            features,
            memory_properties,
            queue_families,
            graphics_timestamp_bits,
            extensions,
            depth_format,
        }))
    }

    pub fn name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }

    pub fn supports_extension(&self, name: &CStr) -> bool {
        self.extensions.contains(name.to_string_lossy().as_ref())
    }

    /// Pick a discrete GPU when there is one, otherwise the last usable device.
    fn select(instance: &ash::Instance, surface: &WindowSurface) -> RenderResult<Self> {
        let devices = unsafe { instance.enumerate_physical_devices() }.vk_context("vkEnumeratePhysicalDevices")?;
        if devices.is_empty() {
            return Err(RenderError::MissingCapability("Vulkan-capable GPU".to_string()));
        }

        let mut chosen: Option<Self> = None;
        let mut last_missing = String::new();
        for device in devices {
            match Self::query(instance, device, surface)? {
                Ok(candidate) => {
                    let discrete = candidate.properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU;
                    let have_discrete = chosen
                        .as_ref()
                        .is_some_and(|c| c.properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU);
                    if discrete || !have_discrete {
                        chosen = Some(candidate);
                    }
                }
                Err(missing) => {
                    log::warn!("Skipping GPU without {}", missing);
                    last_missing = missing;
                }
            }
        }

        chosen.ok_or(RenderError::MissingCapability(last_missing))
    }
}

// =============================================================================
// Checkpoints
// =============================================================================

/// Markers written into command buffers so a device-lost report can say
/// how far each queue got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMarker {
    FrameBegin,
    RenderPassBegin,
    RenderPassEnd,
    FrameEnd,
    FlushBegin,
}

static FRAME_BEGIN: &CStr = c"FrameBegin";
static RENDER_PASS_BEGIN: &CStr = c"RenderPassBegin";
static RENDER_PASS_END: &CStr = c"RenderPassEnd";
static FRAME_END: &CStr = c"FrameEnd";
static FLUSH_BEGIN: &CStr = c"FlushBegin";

impl CheckpointMarker {
    const ALL: [CheckpointMarker; 5] = [
        CheckpointMarker::FrameBegin,
        CheckpointMarker::RenderPassBegin,
        CheckpointMarker::RenderPassEnd,
        CheckpointMarker::FrameEnd,
        CheckpointMarker::FlushBegin,
    ];

    fn label(self) -> &'static CStr {
        match self {
            CheckpointMarker::FrameBegin => FRAME_BEGIN,
            CheckpointMarker::RenderPassBegin => RENDER_PASS_BEGIN,
            CheckpointMarker::RenderPassEnd => RENDER_PASS_END,
            CheckpointMarker::FrameEnd => FRAME_END,
            CheckpointMarker::FlushBegin => FLUSH_BEGIN,
        }
    }

    fn as_ptr(self) -> *const c_void {
        self.label().as_ptr() as *const c_void
    }

    /// Markers only ever come from the statics above, so the pointer is the identity.
    fn from_ptr(ptr: *const c_void) -> Option<Self> {
        Self::ALL.into_iter().find(|marker| marker.as_ptr() == ptr)
    }
}

// =============================================================================
// Logical device
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceOptions {
    /// Enable NV diagnostic checkpoints when the GPU supports them.
    pub gpu_checkpoints: bool,
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical: PhysicalDeviceDescriptor,

    // Queues that share a family share one lock
    graphics_queue: Arc<Mutex<vk::Queue>>,
    compute_queue: Arc<Mutex<vk::Queue>>,
    transfer_queue: Arc<Mutex<vk::Queue>>,

    thread_pools: ThreadRegistry<ThreadCommandPool>,
    checkpoints: Option<ash::extensions::nv::DeviceDiagnosticCheckpoints>,
    memory_budget: bool,

    context: Arc<VulkanContext>,
}

impl VulkanDevice {
    /// Create the logical device for `surface`.
    ///
    /// Fails if no GPU can present to the surface or the swapchain extension
    /// is missing. There is no reduced-capability mode.
    pub fn new(context: Arc<VulkanContext>, surface: &WindowSurface, options: DeviceOptions) -> RenderResult<Arc<Self>> {
        let instance = &context.instance;
        let physical = PhysicalDeviceDescriptor::select(instance, surface)?;

        log::info!("Selected GPU: {}", physical.name());
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(physical.properties.api_version),
            vk::api_version_minor(physical.properties.api_version),
            vk::api_version_patch(physical.properties.api_version)
        );
        log::info!(
            "Queue families: graphics {}, compute {}, transfer {}",
            physical.queue_families.graphics,
            physical.queue_families.compute,
            physical.queue_families.transfer
        );
        log::info!("Depth format: {:?}", physical.depth_format);

        let queue_priorities = [1.0];
        let unique_families = physical.queue_families.unique();
        let queue_create_infos: Vec<_> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let mut extensions = vec![ash::extensions::khr::Swapchain::name().as_ptr()];

        let checkpoints_name = ash::extensions::nv::DeviceDiagnosticCheckpoints::name();
        let diagnostics_config_name = vk::NvDeviceDiagnosticsConfigFn::name();
        let enable_checkpoints = options.gpu_checkpoints && physical.supports_extension(checkpoints_name);
        let enable_diagnostics_config = enable_checkpoints && physical.supports_extension(diagnostics_config_name);
        if enable_checkpoints {
            extensions.push(checkpoints_name.as_ptr());
        } else if options.gpu_checkpoints {
            log::info!("GPU checkpoints requested but not supported by this device");
        }
        if enable_diagnostics_config {
            extensions.push(diagnostics_config_name.as_ptr());
        }

        let budget_name = vk::ExtMemoryBudgetFn::name();
        let memory_budget = physical.supports_extension(budget_name);
        if memory_budget {
            extensions.push(budget_name.as_ptr());
        }

        // Optional features, enabled where the GPU has them
        let features = vk::PhysicalDeviceFeatures {
            fill_mode_non_solid: physical.features.fill_mode_non_solid,
            wide_lines: physical.features.wide_lines,
            sampler_anisotropy: physical.features.sampler_anisotropy,
            independent_blend: physical.features.independent_blend,
            pipeline_statistics_query: physical.features.pipeline_statistics_query,
            ..Default::default()
        };

        let mut diagnostics_config = vk::DeviceDiagnosticsConfigCreateInfoNV::builder().flags(
            vk::DeviceDiagnosticsConfigFlagsNV::ENABLE_SHADER_DEBUG_INFO
                | vk::DeviceDiagnosticsConfigFlagsNV::ENABLE_RESOURCE_TRACKING
                | vk::DeviceDiagnosticsConfigFlagsNV::ENABLE_AUTOMATIC_CHECKPOINTS,
        );

        let mut create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);
        if enable_diagnostics_config {
            create_info = create_info.push_next(&mut diagnostics_config);
        }

        let device = unsafe { instance.create_device(physical.handle, &create_info, None) }
            .vk_context("vkCreateDevice")?;

        // One lock per distinct VkQueue
        let mut queues: HashMap<u32, Arc<Mutex<vk::Queue>>> = HashMap::new();
        for &family in &unique_families {
            let queue = unsafe { device.get_device_queue(family, 0) };
            queues.insert(family, Arc::new(Mutex::new(queue)));
        }
        let queue_for = |family: u32| queues[&family].clone();

        let checkpoints = enable_checkpoints
            .then(|| ash::extensions::nv::DeviceDiagnosticCheckpoints::new(instance, &device));

        Ok(Arc::new(Self {
            graphics_queue: queue_for(physical.queue_families.graphics),
            compute_queue: queue_for(physical.queue_families.compute),
            transfer_queue: queue_for(physical.queue_families.transfer),
            device,
            physical,
            thread_pools: ThreadRegistry::new(),
            checkpoints,
            memory_budget,
            context,
        }))
    }

    pub fn context(&self) -> &Arc<VulkanContext> {
        &self.context
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.context.instance
    }

    pub fn supports_memory_budget(&self) -> bool {
        self.memory_budget
    }

    pub fn queue_family(&self, kind: QueueKind) -> u32 {
        self.physical.queue_families.family(kind)
    }

    /// Hold the returned guard for the duration of a queue submission.
    pub fn lock_queue(&self, kind: QueueKind) -> MutexGuard<'_, vk::Queue> {
        match kind {
            QueueKind::Graphics => self.graphics_queue.lock(),
            QueueKind::Compute => self.compute_queue.lock(),
            QueueKind::Transfer => self.transfer_queue.lock(),
        }
    }

    // =========================================================================
    // Command buffers
    // =========================================================================

    /// The calling thread's command pools, created on first use.
    pub fn get_or_create_thread_local_pool(&self) -> RenderResult<Arc<ThreadCommandPool>> {
        self.thread_pools.get_or_create(|| {
            ThreadCommandPool::new(&self.device, self.physical.queue_families)
        })
    }

    pub fn thread_pool_count(&self) -> usize {
        self.thread_pools.len()
    }

    /// Allocate a primary command buffer from the calling thread's pool,
    /// optionally already in the recording state.
    pub fn allocate_command_buffer(&self, begin: bool, kind: QueueKind) -> RenderResult<vk::CommandBuffer> {
        let pool = self.get_or_create_thread_local_pool()?;
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool.pool_for(kind))
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let command_buffer = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .vk_context("vkAllocateCommandBuffers")?[0];

        if begin {
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe { self.device.begin_command_buffer(command_buffer, &begin_info) }
                .vk_context("vkBeginCommandBuffer")?;
        }

        Ok(command_buffer)
    }

    /// Secondary buffer for worker-thread recording. Executed from a frame's
    /// primary buffer by the render thread.
    pub fn create_secondary_command_buffer(&self, debug_name: &str) -> RenderResult<vk::CommandBuffer> {
        let pool = self.get_or_create_thread_local_pool()?;
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool.pool_for(QueueKind::Graphics))
            .level(vk::CommandBufferLevel::SECONDARY)
            .command_buffer_count(1);

        let command_buffer = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .vk_context("vkAllocateCommandBuffers")?[0];
        self.set_object_name(command_buffer, debug_name);

        Ok(command_buffer)
    }

    /// Submit on the graphics queue and block until the GPU is done.
    /// For one-off setup work only.
    pub fn flush_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RenderResult<()> {
        self.flush_command_buffer_on(command_buffer, QueueKind::Graphics)
    }

    /// End `command_buffer`, submit it on `kind`'s queue, wait on a disposable
    /// fence and free the buffer. The buffer must come from the calling
    /// thread's pool for `kind`.
    pub fn flush_command_buffer_on(&self, command_buffer: vk::CommandBuffer, kind: QueueKind) -> RenderResult<()> {
        let pool = self
            .thread_pools
            .current()
            .ok_or_else(|| RenderError::NoThreadPool(std::thread::current().id()))?;

        let result = self.submit_and_wait(command_buffer, kind);

        unsafe {
            self.device
                .free_command_buffers(pool.pool_for(kind), &[command_buffer]);
        }
        result
    }

    fn submit_and_wait(&self, command_buffer: vk::CommandBuffer, kind: QueueKind) -> RenderResult<()> {
        self.set_checkpoint(command_buffer, CheckpointMarker::FlushBegin);
        unsafe { self.device.end_command_buffer(command_buffer) }.vk_context("vkEndCommandBuffer")?;

        let fence = unsafe { self.device.create_fence(&vk::FenceCreateInfo::default(), None) }
            .vk_context("vkCreateFence")?;

        let command_buffers = [command_buffer];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);

        let submitted = {
            let queue = self.lock_queue(kind);
            unsafe { self.device.queue_submit(*queue, &[submit_info.build()], fence) }
        }
        .vk_context("vkQueueSubmit");

        let waited = submitted.and_then(|_| {
            match unsafe { self.device.wait_for_fences(&[fence], true, FLUSH_FENCE_TIMEOUT_NS) } {
                Ok(()) => Ok(()),
                Err(vk::Result::TIMEOUT) => {
                    log::error!("One-off submission did not finish within {} ns", FLUSH_FENCE_TIMEOUT_NS);
                    Err(RenderError::FenceTimeout {
                        timeout_ns: FLUSH_FENCE_TIMEOUT_NS,
                    })
                }
                Err(e) => Err(e).vk_context("vkWaitForFences"),
            }
        });

        unsafe { self.device.destroy_fence(fence, None) };
        waited
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Attach a debug name to any Vulkan object. No-op without validation.
    pub fn set_object_name<H: vk::Handle>(&self, handle: H, name: &str) {
        let Some(debug_utils) = self.context.debug_utils() else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };

        let name_info = vk::DebugUtilsObjectNameInfoEXT::builder()
            .object_type(H::TYPE)
            .object_handle(handle.as_raw())
            .object_name(&name);

        if let Err(e) = unsafe { debug_utils.set_debug_utils_object_name(self.device.handle(), &name_info) } {
            log::debug!("Failed to name Vulkan object: {:?}", e);
        }
    }

    pub fn checkpoints_enabled(&self) -> bool {
        self.checkpoints.is_some()
    }

    pub fn set_checkpoint(&self, command_buffer: vk::CommandBuffer, marker: CheckpointMarker) {
        if let Some(checkpoints) = &self.checkpoints {
            unsafe { (checkpoints.fp().cmd_set_checkpoint_nv)(command_buffer, marker.as_ptr()) };
        }
    }

    /// Best-effort capture after VK_ERROR_DEVICE_LOST: give the driver a
    /// moment to flush its own logging, then dump the last checkpoint each
    /// queue reached.
    pub fn report_device_lost(&self, pause: Duration) {
        log::error!("GPU device lost, collecting diagnostics...");
        std::thread::sleep(pause);

        let Some(checkpoints) = &self.checkpoints else {
            log::error!("GPU checkpoints are not enabled; no further device-lost information");
            return;
        };

        for kind in QueueKind::ALL {
            let queue = *self.lock_queue(kind);
            let data = unsafe { Self::queue_checkpoint_data(checkpoints, queue) };
            log::error!("{:?} queue: {} checkpoint(s)", kind, data.len());
            for checkpoint in data {
                let marker = CheckpointMarker::from_ptr(checkpoint.p_checkpoint_marker as *const c_void);
                log::error!("  stage {:?}: {:?}", checkpoint.stage, marker);
            }
        }
    }

    unsafe fn queue_checkpoint_data(
        checkpoints: &ash::extensions::nv::DeviceDiagnosticCheckpoints,
        queue: vk::Queue,
    ) -> Vec<vk::CheckpointDataNV> {
        let fp = checkpoints.fp();
        let mut count = 0u32;
        (fp.get_queue_checkpoint_data_nv)(queue, &mut count, std::ptr::null_mut());
        let mut data = vec![vk::CheckpointDataNV::default(); count as usize];
        (fp.get_queue_checkpoint_data_nv)(queue, &mut count, data.as_mut_ptr());
        data.truncate(count as usize);
        data
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> RenderResult<()> {
        unsafe { self.device.device_wait_idle() }.vk_context("vkDeviceWaitIdle")
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        let pools = self.thread_pools.drain();
        log::debug!("Destroying {} thread command pool(s)", pools.len());
        for pool in pools {
            pool.destroy(&self.device);
        }

        unsafe { self.device.destroy_device(None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn prefers_dedicated_compute_and_transfer() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
        ];
        let indices = QueueFamilyIndices::select(&families, |_| true).unwrap();
        assert_eq!(indices, QueueFamilyIndices {
            graphics: 0,
            compute: 1,
            transfer: 2,
        });
        assert_eq!(indices.unique(), vec![0, 1, 2]);
    }

    #[test]
    fn single_family_serves_every_kind() {
        let families = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER)];
        let indices = QueueFamilyIndices::select(&families, |_| true).unwrap();
        assert_eq!((indices.graphics, indices.compute, indices.transfer), (0, 0, 0));
        assert_eq!(indices.unique(), vec![0]);
    }

    #[test]
    fn graphics_family_must_present() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS),
        ];
        let indices = QueueFamilyIndices::select(&families, |i| i == 1).unwrap();
        assert_eq!(indices.graphics, 1);
        assert_eq!(indices.compute, 0);
        // No family advertises TRANSFER; fall back to graphics
        assert_eq!(indices.transfer, 1);

        assert!(QueueFamilyIndices::select(&families, |_| false).is_none());
    }

    #[test]
    fn depth_format_follows_preference_order() {
        let picked = pick_depth_format(|f| f == vk::Format::D24_UNORM_S8_UINT || f == vk::Format::D16_UNORM);
        assert_eq!(picked, Some(vk::Format::D24_UNORM_S8_UINT));
        assert_eq!(pick_depth_format(|_| true), Some(vk::Format::D32_SFLOAT_S8_UINT));
        assert_eq!(pick_depth_format(|_| false), None);
    }

    #[test]
    fn checkpoint_markers_round_trip_by_address() {
        for marker in CheckpointMarker::ALL {
            assert_eq!(CheckpointMarker::from_ptr(marker.as_ptr()), Some(marker));
        }
        assert_eq!(CheckpointMarker::from_ptr(std::ptr::null()), None);
    }
}
