// Backend module - Vulkan device/frame layer
//
// Design: Thin wrappers around ash. Memory, deferred release and the frame
// protocol sit behind small traits so they run without a GPU in tests.

pub mod allocator;
pub mod command;
pub mod device;
pub mod error;
pub mod frame;
pub mod framebuffer;
pub mod image;
pub mod instance;
pub mod memory;
pub mod query;
pub mod release;
pub mod render_pass;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use allocator::{GpuAllocator, MemoryStats};
pub use command::QueueKind;
pub use device::VulkanDevice;
pub use error::{RenderError, RenderResult};
pub use frame::{FramePipeline, FrameSlotIndex, PresentImageIndex};
pub use release::ReleaseQueue;
pub use swapchain::VulkanSwapchain;
