//! Framebuffers.
//!
//! A framebuffer that renders into the backbuffer holds one native
//! framebuffer per swapchain image; the one matching the acquired image is
//! picked at record time.

use ash::vk;
use forge_rhi::NativeObject;
use tracing::debug;

use super::{Image, Ref, RenderPass, ResourceContext, ResourceKind, Resources, invalid, require};
use crate::error::RenderResult;

/// Marker for the framebuffer kind.
pub enum Framebuffer {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FramebufferAttachment {
    Image(Ref<Image>),
    /// Whichever swapchain image is being rendered this frame.
    Backbuffer,
}

#[derive(Clone, Debug, Default)]
pub struct FramebufferDesc {
    pub render_pass: Option<Ref<RenderPass>>,
    pub attachments: Vec<FramebufferAttachment>,
}

impl FramebufferDesc {
    pub fn uses_backbuffer(&self) -> bool {
        self.attachments.contains(&FramebufferAttachment::Backbuffer)
    }
}

#[derive(Debug, Default)]
pub struct FramebufferNative {
    pub framebuffers: Vec<vk::Framebuffer>,
    pub extent: vk::Extent2D,
}

impl FramebufferNative {
    /// The framebuffer to use while rendering into `backbuffer_index`.
    pub fn framebuffer(&self, backbuffer_index: u32) -> vk::Framebuffer {
        match self.framebuffers.as_slice() {
            [single] => *single,
            all => all[backbuffer_index as usize],
        }
    }
}

/// Name under which the swapchain image `index` is registered.
pub fn backbuffer_name(index: u32) -> String {
    format!("backbuffer{index}")
}

/// True when any attachment changes with the swapchain.
pub(crate) fn is_resolution_dependent(resources: &Resources, desc: &FramebufferDesc) -> bool {
    desc.attachments.iter().any(|a| match *a {
        FramebufferAttachment::Backbuffer => true,
        FramebufferAttachment::Image(image) => {
            resources.images.is_alive(image) && resources.images.desc(image).is_resolution_dependent()
        }
    })
}

impl ResourceKind for Framebuffer {
    type Desc = FramebufferDesc;
    type Native = FramebufferNative;

    const NAME: &'static str = "Framebuffer";
    const CAPACITY: usize = 1024;

    fn create_native(
        resources: &Resources,
        ctx: &mut ResourceContext<'_>,
        name: &str,
        desc: &FramebufferDesc,
    ) -> RenderResult<FramebufferNative> {
        let (render_pass, pass_native) =
            require::<Self, RenderPass>(resources, name, desc.render_pass, "render pass")?;
        let expected = resources.render_passes.desc(render_pass).attachment_count();
        if desc.attachments.len() != expected {
            return Err(invalid::<Self>(
                name,
                format!(
                    "{} attachments for a render pass with {}",
                    desc.attachments.len(),
                    expected
                ),
            ));
        }

        let copies = if desc.uses_backbuffer() {
            ctx.backbuffer_count
        } else {
            1
        };

        let mut native = FramebufferNative::default();
        for copy in 0..copies {
            let mut views = Vec::with_capacity(desc.attachments.len());
            let mut extent: Option<vk::Extent2D> = None;
            for attachment in &desc.attachments {
                let image = match *attachment {
                    FramebufferAttachment::Image(image) => {
                        require::<Self, Image>(resources, name, Some(image), "attachment")?.1
                    }
                    FramebufferAttachment::Backbuffer => {
                        let backbuffer = resources.images.get_by_name(&backbuffer_name(copy));
                        require::<Self, Image>(resources, name, backbuffer, "backbuffer image")?.1
                    }
                };
                match extent {
                    None => extent = Some(image.extent),
                    Some(e) if e != image.extent => {
                        Self::release_native(native, ctx);
                        return Err(invalid::<Self>(name, "attachments differ in size"));
                    }
                    Some(_) => {}
                }
                views.push(image.view);
            }

            let extent = extent.unwrap_or(ctx.backbuffer_extent);
            let info = vk::FramebufferCreateInfo::default()
                .render_pass(pass_native.render_pass)
                .attachments(&views)
                .width(extent.width)
                .height(extent.height)
                .layers(1);
            match ctx.device.create_framebuffer(&info) {
                Ok(framebuffer) => native.framebuffers.push(framebuffer),
                Err(e) => {
                    Self::release_native(native, ctx);
                    return Err(e.into());
                }
            }
            native.extent = extent;
        }

        debug!(
            "Created framebuffer '{}' ({} copies, {}x{})",
            name,
            native.framebuffers.len(),
            native.extent.width,
            native.extent.height
        );
        Ok(native)
    }

    fn release_native(native: FramebufferNative, ctx: &mut ResourceContext<'_>) {
        for framebuffer in native.framebuffers {
            ctx.release_queue
                .release_object(NativeObject::Framebuffer(framebuffer));
        }
    }

    resource_manager_accessors!(framebuffers);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::test_support::Fixture;
    use crate::resource::{AttachmentDesc, ImageExtent, RenderPassDesc};
    use ash::vk::Handle;

    fn register_backbuffers(resources: &mut Resources, ctx: &mut ResourceContext<'_>) {
        for i in 0..ctx.backbuffer_count {
            let image = resources.create::<Image>(&backbuffer_name(i));
            resources.reset_to_default(image);
            resources.desc_mut(image).external = Some(vk::Image::from_raw(0x1000 + i as u64));
            resources.desc_mut(image).format = vk::Format::UNDEFINED;
            resources.create_resources(ctx, &[image]).unwrap();
        }
    }

    fn color_pass(resources: &mut Resources, ctx: &mut ResourceContext<'_>) -> Ref<RenderPass> {
        let pass = resources.create::<RenderPass>("color");
        resources.reset_to_default(pass);
        *resources.desc_mut(pass) = RenderPassDesc {
            color_attachments: vec![AttachmentDesc::backbuffer([0.0; 4])],
            depth_attachment: None,
        };
        resources.create_resources(ctx, &[pass]).unwrap();
        pass
    }

    #[test]
    fn test_backbuffer_framebuffer_has_one_copy_per_image() {
        let mut fixture = Fixture::new();
        let (resources, mut ctx) = fixture.split();
        register_backbuffers(resources, &mut ctx);
        let pass = color_pass(resources, &mut ctx);

        let fb = resources.create::<Framebuffer>("main");
        resources.reset_to_default(fb);
        *resources.desc_mut(fb) = FramebufferDesc {
            render_pass: Some(pass),
            attachments: vec![FramebufferAttachment::Backbuffer],
        };
        resources.create_resources(&mut ctx, &[fb]).unwrap();

        let native = resources.native(fb);
        assert_eq!(native.framebuffers.len(), 2);
        assert_ne!(native.framebuffer(0), native.framebuffer(1));
        assert_eq!((native.extent.width, native.extent.height), (640, 480));
        assert!(is_resolution_dependent(resources, resources.desc(fb)));
    }

    #[test]
    fn test_offscreen_framebuffer_has_single_copy() {
        let mut fixture = Fixture::new();
        let (resources, mut ctx) = fixture.split();
        let pass = color_pass(resources, &mut ctx);

        let target = resources.create::<Image>("shadow");
        resources.reset_to_default(target);
        resources.desc_mut(target).extent = ImageExtent::Absolute {
            width: 512,
            height: 512,
        };
        resources.create_resources(&mut ctx, &[target]).unwrap();

        let fb = resources.create::<Framebuffer>("shadow");
        resources.reset_to_default(fb);
        *resources.desc_mut(fb) = FramebufferDesc {
            render_pass: Some(pass),
            attachments: vec![FramebufferAttachment::Image(target)],
        };
        resources.create_resources(&mut ctx, &[fb]).unwrap();

        let native = resources.native(fb);
        assert_eq!(native.framebuffers.len(), 1);
        assert_eq!(native.framebuffer(1), native.framebuffer(0));
        assert!(!is_resolution_dependent(resources, resources.desc(fb)));
    }

    #[test]
    fn test_missing_render_pass_is_an_error() {
        let mut fixture = Fixture::new();
        let (resources, mut ctx) = fixture.split();
        let fb = resources.create::<Framebuffer>("orphan");
        resources.reset_to_default(fb);
        resources.desc_mut(fb).attachments = vec![FramebufferAttachment::Backbuffer];
        let err = resources.create_resources(&mut ctx, &[fb]).unwrap_err();
        assert!(err.to_string().contains("no render pass set"));
    }
}
