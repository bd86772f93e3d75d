// Offscreen framebuffers
//
// A Framebuffer owns a render pass compiled from its attachment list, the
// VkFramebuffer binding the views, and every attachment image it created
// itself. Images handed in through `existing_images` are borrowed and are
// never destroyed here.

use ash::vk;
use std::collections::HashMap;
use std::sync::Arc;

use super::allocator::GpuAllocator;
use super::error::{RenderResult, VkResultExt};
use super::image::AttachmentImage;
use super::release::ReleaseQueue;
use super::render_pass::{compile_render_pass, AttachmentDesc, ClearPolicy};
use super::VulkanDevice;

#[derive(Clone)]
pub struct FramebufferDesc {
    pub debug_name: String,
    pub width: u32,
    pub height: u32,
    /// Multiplier applied to every owned attachment's size.
    pub scale: f32,
    pub attachments: Vec<AttachmentDesc>,
    pub clear_color: [f32; 4],
    pub depth_clear_value: f32,
    pub clear_policy: ClearPolicy,
    /// Attachment index -> image owned by someone else.
    pub existing_images: HashMap<usize, Arc<AttachmentImage>>,
}

impl Default for FramebufferDesc {
    fn default() -> Self {
        Self {
            debug_name: "Framebuffer".to_string(),
            width: 0,
            height: 0,
            scale: 1.0,
            attachments: Vec::new(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            depth_clear_value: 1.0,
            clear_policy: ClearPolicy::default(),
            existing_images: HashMap::new(),
        }
    }
}

/// Whether a framebuffer at `current` must be rebuilt for a request of
/// `requested`.
pub fn needs_rebuild(current: (u32, u32), requested: (u32, u32), force: bool) -> bool {
    force || current != requested
}

/// Attachment size after applying `scale`, never below one pixel.
pub fn scaled_extent(width: u32, height: u32, scale: f32) -> vk::Extent2D {
    let scale_dim = |dim: u32| ((dim as f32 * scale) as u32).max(1);
    vk::Extent2D {
        width: scale_dim(width),
        height: scale_dim(height),
    }
}

/// Collect one image per attachment. Indices present in `existing` reuse the
/// caller's image; `create` makes the rest, and only those are owned by the
/// result. Dropping the returned list never drops an existing image's last
/// reference.
pub fn collect_attachments<I>(
    count: usize,
    existing: &HashMap<usize, Arc<I>>,
    mut create: impl FnMut(usize) -> RenderResult<Arc<I>>,
) -> RenderResult<Vec<Arc<I>>> {
    (0..count)
        .map(|index| match existing.get(&index) {
            Some(image) => Ok(image.clone()),
            None => create(index),
        })
        .collect()
}

/// Hand a framebuffer/render pass pair to the release queue. Null handles are
/// skipped. Returns whether anything was queued.
pub fn queue_pass_release<D>(
    release: &ReleaseQueue,
    framebuffer: vk::Framebuffer,
    render_pass: vk::RenderPass,
    destroy: D,
) -> bool
where
    D: FnOnce(Option<vk::Framebuffer>, Option<vk::RenderPass>) + Send + 'static,
{
    let framebuffer = (framebuffer != vk::Framebuffer::null()).then_some(framebuffer);
    let render_pass = (render_pass != vk::RenderPass::null()).then_some(render_pass);
    if framebuffer.is_none() && render_pass.is_none() {
        return false;
    }
    release.submit_resource_free(move || destroy(framebuffer, render_pass));
    true
}

pub struct Framebuffer {
    desc: FramebufferDesc,
    width: u32,
    height: u32,
    images: Vec<Arc<AttachmentImage>>,
    render_pass: vk::RenderPass,
    framebuffer: vk::Framebuffer,
    clear_values: Vec<vk::ClearValue>,
    device: Arc<VulkanDevice>,
    allocator: Arc<GpuAllocator>,
    release: Arc<ReleaseQueue>,
}

impl Framebuffer {
    pub fn new(
        device: Arc<VulkanDevice>,
        allocator: Arc<GpuAllocator>,
        release: Arc<ReleaseQueue>,
        desc: FramebufferDesc,
    ) -> RenderResult<Self> {
        let mut framebuffer = Self {
            width: desc.width,
            height: desc.height,
            desc,
            images: Vec::new(),
            render_pass: vk::RenderPass::null(),
            framebuffer: vk::Framebuffer::null(),
            clear_values: Vec::new(),
            device,
            allocator,
            release,
        };
        framebuffer.invalidate()?;
        Ok(framebuffer)
    }

    /// Rebuild at the new size. Returns whether anything was rebuilt.
    pub fn resize(&mut self, width: u32, height: u32, force: bool) -> RenderResult<bool> {
        if !needs_rebuild((self.width, self.height), (width, height), force) {
            return Ok(false);
        }
        self.width = width;
        self.height = height;
        self.invalidate()?;
        Ok(true)
    }

    /// Recreate owned images, the render pass and the framebuffer. The old
    /// objects are released through the release queue.
    pub fn invalidate(&mut self) -> RenderResult<()> {
        self.release();

        let extent = scaled_extent(self.width, self.height, self.desc.scale);
        log::debug!(
            "Invalidating framebuffer '{}' at {}x{}",
            self.desc.debug_name,
            extent.width,
            extent.height
        );

        let (device, allocator, release) = (&self.device, &self.allocator, &self.release);
        let desc = &self.desc;
        self.images = collect_attachments(desc.attachments.len(), &desc.existing_images, |index| {
            AttachmentImage::new(
                device.clone(),
                allocator.clone(),
                release.clone(),
                &format!("{} attachment {}", desc.debug_name, index),
                extent.width,
                extent.height,
                desc.attachments[index].format,
            )
        })?;

        self.clear_values = self
            .desc
            .attachments
            .iter()
            .map(|attachment| {
                if attachment.is_depth() {
                    vk::ClearValue {
                        depth_stencil: vk::ClearDepthStencilValue {
                            depth: self.desc.depth_clear_value,
                            stencil: 0,
                        },
                    }
                } else {
                    vk::ClearValue {
                        color: vk::ClearColorValue {
                            float32: self.desc.clear_color,
                        },
                    }
                }
            })
            .collect();

        let layout = compile_render_pass(&self.desc.attachments, &self.desc.clear_policy);
        self.render_pass = layout.create(&self.device.device)?;
        self.device
            .set_object_name(self.render_pass, &format!("{} render pass", self.desc.debug_name));

        let views: Vec<vk::ImageView> = self.images.iter().map(|image| image.view).collect();
        let framebuffer_info = vk::FramebufferCreateInfo::builder()
            .render_pass(self.render_pass)
            .attachments(&views)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        self.framebuffer = unsafe { self.device.device.create_framebuffer(&framebuffer_info, None) }
            .vk_context("vkCreateFramebuffer")?;
        self.device
            .set_object_name(self.framebuffer, &self.desc.debug_name);

        Ok(())
    }

    /// Queue the framebuffer, render pass and owned images for destruction.
    /// Shared images only lose this framebuffer's reference.
    pub fn release(&mut self) {
        let framebuffer = std::mem::replace(&mut self.framebuffer, vk::Framebuffer::null());
        let render_pass = std::mem::replace(&mut self.render_pass, vk::RenderPass::null());
        let device = self.device.clone();
        queue_pass_release(&self.release, framebuffer, render_pass, move |framebuffer, render_pass| unsafe {
            if let Some(framebuffer) = framebuffer {
                device.device.destroy_framebuffer(framebuffer, None);
            }
            if let Some(render_pass) = render_pass {
                device.device.destroy_render_pass(render_pass, None);
            }
        });

        // Owned images queue their own destruction when the last Arc goes
        self.images.clear();
    }

    pub fn handle(&self) -> vk::Framebuffer {
        self.framebuffer
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn extent(&self) -> vk::Extent2D {
        scaled_extent(self.width, self.height, self.desc.scale)
    }

    pub fn desc(&self) -> &FramebufferDesc {
        &self.desc
    }

    pub fn image(&self, index: usize) -> Option<&Arc<AttachmentImage>> {
        self.images.get(index)
    }

    pub fn depth_image(&self) -> Option<&Arc<AttachmentImage>> {
        self.images.iter().find(|image| image.is_depth())
    }

    pub fn clear_values(&self) -> &[vk::ClearValue] {
        &self.clear_values
    }

    pub fn begin_render_pass(&self, command_buffer: vk::CommandBuffer) {
        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_pass)
            .framebuffer(self.framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: self.extent(),
            })
            .clear_values(&self.clear_values);
        unsafe {
            self.device
                .device
                .cmd_begin_render_pass(command_buffer, &begin_info, vk::SubpassContents::INLINE);
        }
    }

    pub fn end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        unsafe { self.device.device.cmd_end_render_pass(command_buffer) };
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RenderError;
    use ash::vk::Handle;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn same_size_without_force_is_a_no_op() {
        assert!(!needs_rebuild((1280, 720), (1280, 720), false));
        assert!(needs_rebuild((1280, 720), (1280, 720), true));
        assert!(needs_rebuild((1280, 720), (1920, 1080), false));
    }

    #[test]
    fn scale_applies_to_both_dimensions() {
        let half = scaled_extent(1920, 1080, 0.5);
        assert_eq!((half.width, half.height), (960, 540));

        let tiny = scaled_extent(1, 1, 0.25);
        assert_eq!((tiny.width, tiny.height), (1, 1));
    }

    #[test]
    fn default_desc_clears_everything() {
        let desc = FramebufferDesc::default();
        assert_eq!(desc.scale, 1.0);
        assert!(desc.clear_policy.clear_color_on_load);
        assert!(desc.clear_policy.clear_depth_on_load);
        assert!(desc.existing_images.is_empty());
    }

    #[test]
    fn old_pass_objects_wait_for_the_release_queue() {
        let release = ReleaseQueue::new(2);
        let destroyed = Arc::new(Mutex::new(Vec::new()));

        release.execute(0);
        let log = destroyed.clone();
        let queued = queue_pass_release(
            &release,
            vk::Framebuffer::from_raw(7),
            vk::RenderPass::from_raw(9),
            move |framebuffer, render_pass| log.lock().push((framebuffer, render_pass)),
        );

        assert!(queued);
        assert_eq!(release.pending(), 1);
        assert!(destroyed.lock().is_empty());

        release.execute(1);
        assert!(destroyed.lock().is_empty());

        release.execute(0);
        assert_eq!(
            *destroyed.lock(),
            vec![(Some(vk::Framebuffer::from_raw(7)), Some(vk::RenderPass::from_raw(9)))]
        );
        assert_eq!(release.pending(), 0);
    }

    #[test]
    fn null_handles_are_never_destroyed() {
        let release = ReleaseQueue::new(1);
        let queued = queue_pass_release(&release, vk::Framebuffer::null(), vk::RenderPass::null(), |_, _| {
            panic!("null handles must not be destroyed")
        });
        assert!(!queued);
        assert_eq!(release.pending(), 0);

        assert!(queue_pass_release(
            &release,
            vk::Framebuffer::null(),
            vk::RenderPass::from_raw(3),
            |framebuffer, render_pass| {
                assert_eq!(framebuffer, None);
                assert_eq!(render_pass, Some(vk::RenderPass::from_raw(3)));
            },
        ));
        release.flush_all();
    }

    struct TrackedImage {
        destroyed: Arc<AtomicUsize>,
    }

    impl Drop for TrackedImage {
        fn drop(&mut self) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn external_images_outlive_the_framebuffer() {
        let external_destroyed = Arc::new(AtomicUsize::new(0));
        let owned_destroyed = Arc::new(AtomicUsize::new(0));
        let external = Arc::new(TrackedImage {
            destroyed: external_destroyed.clone(),
        });
        let existing = HashMap::from([(1, external.clone())]);

        let mut created = Vec::new();
        let images = collect_attachments(3, &existing, |index| {
            created.push(index);
            Ok(Arc::new(TrackedImage {
                destroyed: owned_destroyed.clone(),
            }))
        })
        .unwrap();

        assert_eq!(created, vec![0, 2]);
        assert!(Arc::ptr_eq(&images[1], &external));
        assert_eq!(Arc::strong_count(&external), 3);

        drop(images);
        assert_eq!(owned_destroyed.load(Ordering::SeqCst), 2);
        assert_eq!(external_destroyed.load(Ordering::SeqCst), 0);
        assert_eq!(Arc::strong_count(&external), 2);

        drop(existing);
        assert_eq!(Arc::strong_count(&external), 1);
        assert_eq!(external_destroyed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_attachment_creation_drops_the_partial_set() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let existing: HashMap<usize, Arc<TrackedImage>> = HashMap::new();

        let result = collect_attachments(3, &existing, |index| {
            if index == 2 {
                return Err(RenderError::MissingCapability("attachment format".to_string()));
            }
            Ok(Arc::new(TrackedImage {
                destroyed: destroyed.clone(),
            }))
        });

        assert!(result.is_err());
        assert_eq!(destroyed.load(Ordering::SeqCst), 2);
    }
}
