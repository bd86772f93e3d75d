// Ember renderer - Vulkan device/frame layer
//
// backend/   device, memory, deferred release, frame pipeline, render passes
// renderer   facade handed to upstream systems
// config     config.toml loading

pub mod backend;
pub mod config;
pub mod renderer;

pub use backend::{RenderError, RenderResult};
pub use config::Config;
pub use renderer::{FatalReport, FrameContext, RenderHandle, Renderer, RendererDesc};
