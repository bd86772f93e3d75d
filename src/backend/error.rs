// Backend errors
//
// Every fallible backend call returns RenderResult. The top-level frame loop
// looks at is_fatal() to decide between "log and continue" and "hard stop".

use ash::vk;
use std::thread::ThreadId;
use thiserror::Error;

pub type RenderResult<T> = std::result::Result<T, RenderError>;

#[derive(Debug, Error)]
pub enum RenderError {
    // ========================================================================
    // Recoverable
    // ========================================================================
    /// The native allocator could not satisfy a request.
    #[error("GPU out of memory allocating {request} (used {used} of {available} bytes)")]
    OutOfMemory {
        request: String,
        used: u64,
        available: u64,
    },

    // ========================================================================
    // Fatal
    // ========================================================================
    #[error("GPU device lost")]
    DeviceLost,

    #[error("Fence wait exceeded {timeout_ns} ns")]
    FenceTimeout { timeout_ns: u64 },

    /// The surface kept reporting out-of-date after a full rebuild.
    #[error("Swapchain still out of date after recreation")]
    SurfaceOutOfDate,

    #[error("Missing required GPU capability: {0}")]
    MissingCapability(String),

    #[error("Host write outside of mapped allocation: {0}")]
    InvalidWrite(String),

    #[error("Vulkan call {call} failed: {result}")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
    },

    #[error("No command pool registered for thread {0:?}")]
    NoThreadPool(ThreadId),
}

impl RenderError {
    /// Only resource exhaustion is something a caller can back off from.
    /// Everything else means GPU state can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            RenderError::OutOfMemory { .. } | RenderError::InvalidWrite(_)
        )
    }

    pub fn is_device_lost(&self) -> bool {
        matches!(self, RenderError::DeviceLost)
    }
}

/// Attach the failing call name to a raw `vk::Result`.
pub trait VkResultExt<T> {
    fn vk_context(self, call: &'static str) -> RenderResult<T>;
}

impl<T> VkResultExt<T> for std::result::Result<T, vk::Result> {
    fn vk_context(self, call: &'static str) -> RenderResult<T> {
        self.map_err(|result| from_vk(call, result))
    }
}

pub fn from_vk(call: &'static str, result: vk::Result) -> RenderError {
    if result == vk::Result::ERROR_DEVICE_LOST {
        log::error!("{} reported VK_ERROR_DEVICE_LOST", call);
        RenderError::DeviceLost
    } else {
        log::error!("{} failed: {:?}", call, result);
        RenderError::Vulkan { call, result }
    }
}
