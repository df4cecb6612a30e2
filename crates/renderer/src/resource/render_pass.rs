//! Single-subpass render passes.

use std::fmt;

use ash::vk;
use forge_rhi::NativeObject;
use tracing::debug;

use super::{ResourceContext, ResourceKind, Resources, invalid};
use crate::error::RenderResult;

/// Marker for the render pass kind.
pub enum RenderPass {}

/// Clear value of one attachment.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum ClearValue {
    #[default]
    None,
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

impl ClearValue {
    pub fn to_vk(self) -> vk::ClearValue {
        match self {
            ClearValue::None => vk::ClearValue::default(),
            ClearValue::Color(float32) => vk::ClearValue {
                color: vk::ClearColorValue { float32 },
            },
            ClearValue::DepthStencil { depth, stencil } => vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
            },
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct AttachmentDesc {
    /// `UNDEFINED` picks the backbuffer format.
    pub format: vk::Format,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub final_layout: vk::ImageLayout,
    pub clear: ClearValue,
}

impl AttachmentDesc {
    /// A backbuffer attachment cleared to `color` and handed to presentation.
    pub fn backbuffer(color: [f32; 4]) -> Self {
        Self {
            format: vk::Format::UNDEFINED,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            final_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            clear: ClearValue::Color(color),
        }
    }

    pub fn depth(format: vk::Format) -> Self {
        Self {
            format,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            clear: ClearValue::DepthStencil {
                depth: 1.0,
                stencil: 0,
            },
        }
    }

    fn to_vk(self, backbuffer_format: vk::Format) -> vk::AttachmentDescription {
        let format = if self.format == vk::Format::UNDEFINED {
            backbuffer_format
        } else {
            self.format
        };
        // Loaded contents must already be in the final layout.
        let initial_layout = if self.load_op == vk::AttachmentLoadOp::LOAD {
            self.final_layout
        } else {
            vk::ImageLayout::UNDEFINED
        };
        vk::AttachmentDescription::default()
            .format(format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(self.load_op)
            .store_op(self.store_op)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(initial_layout)
            .final_layout(self.final_layout)
    }
}

#[derive(Clone, Debug, Default)]
pub struct RenderPassDesc {
    pub color_attachments: Vec<AttachmentDesc>,
    pub depth_attachment: Option<AttachmentDesc>,
}

impl RenderPassDesc {
    pub fn attachment_count(&self) -> usize {
        self.color_attachments.len() + usize::from(self.depth_attachment.is_some())
    }
}

#[derive(Default)]
pub struct RenderPassNative {
    pub render_pass: vk::RenderPass,
    /// One per attachment, colors first.
    pub clear_values: Vec<vk::ClearValue>,
}

// vk::ClearValue is a union without a Debug impl.
impl fmt::Debug for RenderPassNative {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderPassNative")
            .field("render_pass", &self.render_pass)
            .field("clear_value_count", &self.clear_values.len())
            .finish()
    }
}

impl ResourceKind for RenderPass {
    type Desc = RenderPassDesc;
    type Native = RenderPassNative;

    const NAME: &'static str = "RenderPass";
    const CAPACITY: usize = 1024;

    fn create_native(
        _resources: &Resources,
        ctx: &mut ResourceContext<'_>,
        name: &str,
        desc: &RenderPassDesc,
    ) -> RenderResult<RenderPassNative> {
        if desc.attachment_count() == 0 {
            return Err(invalid::<Self>(name, "no attachments"));
        }

        let attachments: Vec<vk::AttachmentDescription> = desc
            .color_attachments
            .iter()
            .chain(desc.depth_attachment.iter())
            .map(|a| a.to_vk(ctx.backbuffer_format))
            .collect();

        let color_refs: Vec<vk::AttachmentReference> = (0..desc.color_attachments.len())
            .map(|i| vk::AttachmentReference {
                attachment: i as u32,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            })
            .collect();
        let depth_ref = vk::AttachmentReference {
            attachment: desc.color_attachments.len() as u32,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };

        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if desc.depth_attachment.is_some() {
            subpass = subpass.depth_stencil_attachment(&depth_ref);
        }

        let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
        let dependency = vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(stages)
            .dst_stage_mask(stages)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            );

        let subpasses = [subpass];
        let dependencies = [dependency];
        let info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        let render_pass = ctx.device.create_render_pass(&info)?;

        let clear_values = desc
            .color_attachments
            .iter()
            .chain(desc.depth_attachment.iter())
            .map(|a| a.clear.to_vk())
            .collect();

        debug!("Created render pass '{}' ({} attachments)", name, attachments.len());
        Ok(RenderPassNative {
            render_pass,
            clear_values,
        })
    }

    fn release_native(native: RenderPassNative, ctx: &mut ResourceContext<'_>) {
        ctx.release_queue
            .release_object(NativeObject::RenderPass(native.render_pass));
    }

    resource_manager_accessors!(render_passes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::test_support::Fixture;

    #[test]
    fn test_load_keeps_final_layout() {
        let mut attachment = AttachmentDesc::backbuffer([0.0; 4]);
        attachment.load_op = vk::AttachmentLoadOp::LOAD;
        let vk_desc = attachment.to_vk(vk::Format::B8G8R8A8_UNORM);
        assert_eq!(vk_desc.initial_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(vk_desc.format, vk::Format::B8G8R8A8_UNORM);

        let cleared = AttachmentDesc::depth(vk::Format::D32_SFLOAT).to_vk(vk::Format::UNDEFINED);
        assert_eq!(cleared.initial_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(cleared.format, vk::Format::D32_SFLOAT);
    }

    #[test]
    fn test_clear_values_follow_attachment_order() {
        let mut fixture = Fixture::new();
        let (resources, mut ctx) = fixture.split();

        let pass = resources.create::<RenderPass>("main");
        resources.reset_to_default(pass);
        *resources.desc_mut(pass) = RenderPassDesc {
            color_attachments: vec![AttachmentDesc::backbuffer([0.1, 0.2, 0.3, 1.0])],
            depth_attachment: Some(AttachmentDesc::depth(vk::Format::D32_SFLOAT)),
        };
        resources.create_resources(&mut ctx, &[pass]).unwrap();

        let clear_values = &resources.native(pass).clear_values;
        assert_eq!(clear_values.len(), 2);
        // SAFETY: union fields match the attachment kinds set above.
        unsafe {
            assert_eq!(clear_values[0].color.float32[2], 0.3);
            assert_eq!(clear_values[1].depth_stencil.depth, 1.0);
        }
    }

    #[test]
    fn test_native_debug_lists_clear_value_count() {
        let native = RenderPassNative {
            render_pass: vk::RenderPass::null(),
            clear_values: vec![ClearValue::Color([0.0; 4]).to_vk(); 3],
        };
        let text = format!("{:?}", native);
        assert!(text.starts_with("RenderPassNative"));
        assert!(text.contains("clear_value_count: 3"));
    }

    #[test]
    fn test_empty_render_pass_is_rejected() {
        let mut fixture = Fixture::new();
        let (resources, mut ctx) = fixture.split();
        let pass = resources.create::<RenderPass>("empty");
        resources.reset_to_default(pass);
        assert!(resources.create_resources(&mut ctx, &[pass]).is_err());
    }
}
