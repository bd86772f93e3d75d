// Render pass compilation
//
// Turns an ordered attachment list into attachment descriptions, references
// and subpass dependencies. Attachments are sampled by later passes, so the
// dependencies form a full barrier between "read in the fragment shader" and
// "written as a render target" in both directions.

use ash::vk;

use super::error::{RenderResult, VkResultExt};

/// How an attachment's previous contents are treated at pass start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AttachmentLoadPolicy {
    /// Follow the framebuffer-wide clear flag for this attachment's kind.
    #[default]
    Inherit,
    Clear,
    Load,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentDesc {
    pub format: vk::Format,
    pub load: AttachmentLoadPolicy,
}

impl AttachmentDesc {
    pub fn new(format: vk::Format) -> Self {
        Self {
            format,
            load: AttachmentLoadPolicy::Inherit,
        }
    }

    pub fn with_load(mut self, load: AttachmentLoadPolicy) -> Self {
        self.load = load;
        self
    }

    pub fn is_depth(&self) -> bool {
        is_depth_format(self.format)
    }
}

pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D32_SFLOAT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

pub fn has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Framebuffer-wide clear flags used by `Inherit` attachments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearPolicy {
    pub clear_color_on_load: bool,
    pub clear_depth_on_load: bool,
}

impl Default for ClearPolicy {
    fn default() -> Self {
        Self {
            clear_color_on_load: true,
            clear_depth_on_load: true,
        }
    }
}

pub fn resolve_load_op(load: AttachmentLoadPolicy, is_depth: bool, policy: &ClearPolicy) -> vk::AttachmentLoadOp {
    let clear = match load {
        AttachmentLoadPolicy::Clear => true,
        AttachmentLoadPolicy::Load => false,
        AttachmentLoadPolicy::Inherit if is_depth => policy.clear_depth_on_load,
        AttachmentLoadPolicy::Inherit => policy.clear_color_on_load,
    };
    if clear {
        vk::AttachmentLoadOp::CLEAR
    } else {
        vk::AttachmentLoadOp::LOAD
    }
}

/// Everything needed to create a single-subpass render pass.
#[derive(Debug, Clone, Default)]
pub struct RenderPassLayout {
    pub attachments: Vec<vk::AttachmentDescription>,
    pub color_refs: Vec<vk::AttachmentReference>,
    pub depth_ref: Option<vk::AttachmentReference>,
    pub dependencies: Vec<vk::SubpassDependency>,
}

impl RenderPassLayout {
    pub fn create(&self, device: &ash::Device) -> RenderResult<vk::RenderPass> {
        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&self.color_refs);
        if let Some(depth_ref) = self.depth_ref.as_ref() {
            subpass = subpass.depth_stencil_attachment(depth_ref);
        }
        let subpasses = [subpass.build()];

        let render_pass_info = vk::RenderPassCreateInfo::builder()
            .attachments(&self.attachments)
            .subpasses(&subpasses)
            .dependencies(&self.dependencies);

        unsafe { device.create_render_pass(&render_pass_info, None) }.vk_context("vkCreateRenderPass")
    }
}

/// Compile an attachment list. Panics if more than one depth attachment is given.
pub fn compile_render_pass(attachments: &[AttachmentDesc], policy: &ClearPolicy) -> RenderPassLayout {
    let mut layout = RenderPassLayout::default();

    for (index, attachment) in attachments.iter().enumerate() {
        let is_depth = attachment.is_depth();
        let load_op = resolve_load_op(attachment.load, is_depth, policy);
        let clearing = load_op == vk::AttachmentLoadOp::CLEAR;

        let (read_only, attachment_layout) = if is_depth {
            (
                vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            )
        } else {
            (
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            )
        };

        layout.attachments.push(
            vk::AttachmentDescription::builder()
                .format(attachment.format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(load_op)
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                // Cleared contents don't need a transition from a known layout
                .initial_layout(if clearing { vk::ImageLayout::UNDEFINED } else { read_only })
                .final_layout(read_only)
                .build(),
        );

        let reference = vk::AttachmentReference {
            attachment: index as u32,
            layout: attachment_layout,
        };
        if is_depth {
            assert!(layout.depth_ref.is_none(), "framebuffer has more than one depth attachment");
            layout.depth_ref = Some(reference);
        } else {
            layout.color_refs.push(reference);
        }
    }

    if !layout.color_refs.is_empty() {
        layout.dependencies.push(dependency(
            (vk::SUBPASS_EXTERNAL, 0),
            (vk::PipelineStageFlags::FRAGMENT_SHADER, vk::AccessFlags::SHADER_READ),
            (vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT, vk::AccessFlags::COLOR_ATTACHMENT_WRITE),
        ));
        layout.dependencies.push(dependency(
            (0, vk::SUBPASS_EXTERNAL),
            (vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT, vk::AccessFlags::COLOR_ATTACHMENT_WRITE),
            (vk::PipelineStageFlags::FRAGMENT_SHADER, vk::AccessFlags::SHADER_READ),
        ));
    }

    if layout.depth_ref.is_some() {
        layout.dependencies.push(dependency(
            (vk::SUBPASS_EXTERNAL, 0),
            (vk::PipelineStageFlags::FRAGMENT_SHADER, vk::AccessFlags::SHADER_READ),
            (
                vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            ),
        ));
        layout.dependencies.push(dependency(
            (0, vk::SUBPASS_EXTERNAL),
            (
                vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            ),
            (vk::PipelineStageFlags::FRAGMENT_SHADER, vk::AccessFlags::SHADER_READ),
        ));
    }

    layout
}

fn dependency(
    (src_subpass, dst_subpass): (u32, u32),
    (src_stage, src_access): (vk::PipelineStageFlags, vk::AccessFlags),
    (dst_stage, dst_access): (vk::PipelineStageFlags, vk::AccessFlags),
) -> vk::SubpassDependency {
    vk::SubpassDependency::builder()
        .src_subpass(src_subpass)
        .dst_subpass(dst_subpass)
        .src_stage_mask(src_stage)
        .src_access_mask(src_access)
        .dst_stage_mask(dst_stage)
        .dst_access_mask(dst_access)
        .dependency_flags(vk::DependencyFlags::BY_REGION)
        .build()
}

/// Single color attachment cleared each frame and handed to the presentation engine.
pub fn swapchain_render_pass_layout(format: vk::Format) -> RenderPassLayout {
    let color_attachment = vk::AttachmentDescription::builder()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .build();

    let dependency = vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
        .build();

    RenderPassLayout {
        attachments: vec![color_attachment],
        color_refs: vec![vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }],
        depth_ref: None,
        dependencies: vec![dependency],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COLOR: vk::Format = vk::Format::R8G8B8A8_UNORM;
    const DEPTH: vk::Format = vk::Format::D32_SFLOAT;

    #[test]
    fn load_policy_resolution() {
        let clear_all = ClearPolicy::default();
        let keep_all = ClearPolicy {
            clear_color_on_load: false,
            clear_depth_on_load: false,
        };

        assert_eq!(resolve_load_op(AttachmentLoadPolicy::Inherit, false, &clear_all), vk::AttachmentLoadOp::CLEAR);
        assert_eq!(resolve_load_op(AttachmentLoadPolicy::Inherit, true, &keep_all), vk::AttachmentLoadOp::LOAD);
        assert_eq!(resolve_load_op(AttachmentLoadPolicy::Clear, false, &keep_all), vk::AttachmentLoadOp::CLEAR);
        assert_eq!(resolve_load_op(AttachmentLoadPolicy::Load, true, &clear_all), vk::AttachmentLoadOp::LOAD);

        let depth_only = ClearPolicy {
            clear_color_on_load: false,
            clear_depth_on_load: true,
        };
        assert_eq!(resolve_load_op(AttachmentLoadPolicy::Inherit, false, &depth_only), vk::AttachmentLoadOp::LOAD);
        assert_eq!(resolve_load_op(AttachmentLoadPolicy::Inherit, true, &depth_only), vk::AttachmentLoadOp::CLEAR);
    }

    #[test]
    fn color_and_depth_layouts() {
        let attachments = [
            AttachmentDesc::new(COLOR),
            AttachmentDesc::new(COLOR).with_load(AttachmentLoadPolicy::Load),
            AttachmentDesc::new(DEPTH),
        ];
        let layout = compile_render_pass(&attachments, &ClearPolicy::default());

        assert_eq!(layout.attachments.len(), 3);
        let cleared = &layout.attachments[0];
        assert_eq!(cleared.initial_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(cleared.final_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(cleared.store_op, vk::AttachmentStoreOp::STORE);

        let loaded = &layout.attachments[1];
        assert_eq!(loaded.load_op, vk::AttachmentLoadOp::LOAD);
        assert_eq!(loaded.initial_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

        let depth = &layout.attachments[2];
        assert_eq!(depth.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(depth.final_layout, vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL);

        assert_eq!(layout.color_refs.len(), 2);
        let depth_ref = layout.depth_ref.unwrap();
        assert_eq!(depth_ref.attachment, 2);
        assert_eq!(depth_ref.layout, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
    }

    #[test]
    fn loaded_depth_starts_read_only() {
        let attachments = [AttachmentDesc::new(DEPTH).with_load(AttachmentLoadPolicy::Load)];
        let layout = compile_render_pass(&attachments, &ClearPolicy::default());
        assert_eq!(layout.attachments[0].initial_layout, vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL);
        assert!(layout.color_refs.is_empty());
    }

    #[test]
    fn one_dependency_pair_per_attachment_kind() {
        let both = compile_render_pass(&[AttachmentDesc::new(COLOR), AttachmentDesc::new(DEPTH)], &ClearPolicy::default());
        assert_eq!(both.dependencies.len(), 4);

        let color_in = &both.dependencies[0];
        assert_eq!(color_in.src_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(color_in.src_stage_mask, vk::PipelineStageFlags::FRAGMENT_SHADER);
        assert_eq!(color_in.dst_access_mask, vk::AccessFlags::COLOR_ATTACHMENT_WRITE);
        assert_eq!(color_in.dependency_flags, vk::DependencyFlags::BY_REGION);

        let depth_in = &both.dependencies[2];
        assert_eq!(depth_in.dst_stage_mask, vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS);
        let depth_out = &both.dependencies[3];
        assert_eq!(depth_out.src_stage_mask, vk::PipelineStageFlags::LATE_FRAGMENT_TESTS);
        assert_eq!(depth_out.dst_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(depth_out.dst_access_mask, vk::AccessFlags::SHADER_READ);

        let color_only = compile_render_pass(&[AttachmentDesc::new(COLOR)], &ClearPolicy::default());
        assert_eq!(color_only.dependencies.len(), 2);
        let depth_only = compile_render_pass(&[AttachmentDesc::new(DEPTH)], &ClearPolicy::default());
        assert_eq!(depth_only.dependencies.len(), 2);
    }

    #[test]
    #[should_panic(expected = "more than one depth attachment")]
    fn two_depth_attachments_are_rejected() {
        compile_render_pass(&[AttachmentDesc::new(DEPTH), AttachmentDesc::new(DEPTH)], &ClearPolicy::default());
    }

    #[test]
    fn swapchain_pass_presents() {
        let layout = swapchain_render_pass_layout(vk::Format::B8G8R8A8_UNORM);
        assert_eq!(layout.attachments[0].final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(layout.dependencies.len(), 1);
        assert!(layout.depth_ref.is_none());
    }
}
