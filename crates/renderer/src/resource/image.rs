//! Images and their default views.

use ash::vk;
use forge_rhi::NativeObject;
use tracing::debug;

use super::{ResourceContext, ResourceKind, Resources, invalid};
use crate::error::RenderResult;
use crate::memory::{AllocationInfo, PoolType};

/// Marker for the image kind.
pub enum Image {}

/// How big an image is.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ImageExtent {
    Absolute { width: u32, height: u32 },
    /// A multiple of the backbuffer size, rebuilt on resize.
    BackbufferRelative { scale: f32 },
}

impl ImageExtent {
    pub fn resolve(self, backbuffer: vk::Extent2D) -> vk::Extent2D {
        match self {
            ImageExtent::Absolute { width, height } => vk::Extent2D { width, height },
            ImageExtent::BackbufferRelative { scale } => vk::Extent2D {
                width: ((backbuffer.width as f32 * scale) as u32).max(1),
                height: ((backbuffer.height as f32 * scale) as u32).max(1),
            },
        }
    }
}

#[derive(Clone, Debug)]
pub struct ImageDesc {
    /// `UNDEFINED` picks the backbuffer format.
    pub format: vk::Format,
    pub extent: ImageExtent,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
    pub mip_levels: u32,
    /// An image owned elsewhere, such as a swapchain image. Only the view is
    /// created and released.
    pub external: Option<vk::Image>,
}

impl Default for ImageDesc {
    fn default() -> Self {
        Self {
            format: vk::Format::R8G8B8A8_UNORM,
            extent: ImageExtent::BackbufferRelative { scale: 1.0 },
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::COLOR_ATTACHMENT,
            aspect: vk::ImageAspectFlags::COLOR,
            mip_levels: 1,
            external: None,
        }
    }
}

impl ImageDesc {
    /// Sized from the backbuffer, or one of the backbuffers themselves.
    pub fn is_resolution_dependent(&self) -> bool {
        self.external.is_some() || matches!(self.extent, ImageExtent::BackbufferRelative { .. })
    }

    pub fn resolve_format(&self, backbuffer: vk::Format) -> vk::Format {
        if self.format == vk::Format::UNDEFINED {
            backbuffer
        } else {
            self.format
        }
    }

    fn pool(&self) -> PoolType {
        if self.is_resolution_dependent() {
            PoolType::ResolutionDependentImages
        } else {
            PoolType::StaticImages
        }
    }
}

#[derive(Debug, Default)]
pub struct ImageNative {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub allocation: Option<AllocationInfo>,
    /// False for external images.
    pub owned: bool,
}

impl ResourceKind for Image {
    type Desc = ImageDesc;
    type Native = ImageNative;

    const NAME: &'static str = "Image";
    const CAPACITY: usize = 1024;

    fn create_native(
        _resources: &Resources,
        ctx: &mut ResourceContext<'_>,
        name: &str,
        desc: &ImageDesc,
    ) -> RenderResult<ImageNative> {
        let extent = desc.extent.resolve(ctx.backbuffer_extent);
        if let ImageExtent::Absolute { width, height } = desc.extent
            && (width == 0 || height == 0)
        {
            return Err(invalid::<Self>(name, "zero sized extent"));
        }
        if desc.mip_levels == 0 {
            return Err(invalid::<Self>(name, "mip_levels is zero"));
        }
        let format = desc.resolve_format(ctx.backbuffer_format);

        let (image, allocation, owned) = match desc.external {
            Some(image) => (image, None, false),
            None => {
                let info = vk::ImageCreateInfo::default()
                    .image_type(vk::ImageType::TYPE_2D)
                    .format(format)
                    .extent(vk::Extent3D {
                        width: extent.width,
                        height: extent.height,
                        depth: 1,
                    })
                    .mip_levels(desc.mip_levels)
                    .array_layers(1)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .tiling(vk::ImageTiling::OPTIMAL)
                    .usage(desc.usage)
                    .sharing_mode(vk::SharingMode::EXCLUSIVE)
                    .initial_layout(vk::ImageLayout::UNDEFINED);
                let image = ctx.device.create_image(&info)?;
                let allocation = ctx.memory.bind_image(desc.pool(), image)?;
                (image, Some(allocation), true)
            }
        };

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: desc.aspect,
                base_mip_level: 0,
                level_count: desc.mip_levels,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = match ctx.device.create_image_view(&view_info) {
            Ok(view) => view,
            Err(e) => {
                if owned {
                    ctx.release_queue.release_object(NativeObject::Image(image));
                }
                return Err(e.into());
            }
        };

        debug!(
            "Created image '{}' ({}x{}, {:?})",
            name, extent.width, extent.height, format
        );

        Ok(ImageNative {
            image,
            view,
            format,
            extent,
            allocation,
            owned,
        })
    }

    fn release_native(native: ImageNative, ctx: &mut ResourceContext<'_>) {
        ctx.release_queue
            .release_object(NativeObject::ImageView(native.view));
        if native.owned {
            ctx.release_queue
                .release_object(NativeObject::Image(native.image));
        }
    }

    resource_manager_accessors!(images);
}
