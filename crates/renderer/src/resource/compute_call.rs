//! Compute calls: a compute pipeline, its bindings and a group count.

use ash::vk;
use forge_rhi::NativeObject;
use tracing::debug;

use super::descriptor_writes::DescriptorWrites;
use super::{
    Buffer, DescriptorKind, Image, ImageBinding, Pipeline, PipelineLayout, Ref, ResourceContext,
    ResourceKind, Resources, invalid, require,
};
use crate::error::RenderResult;

/// Marker for the compute call kind.
pub enum ComputeCall {}

/// A storage buffer bound to a layout slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StorageBinding {
    pub binding: u32,
    pub buffer: Ref<Buffer>,
}

#[derive(Clone, Debug)]
pub struct ComputeCallDesc {
    pub pipeline: Option<Ref<Pipeline>>,
    pub group_count: [u32; 3],
    pub storage_buffers: Vec<StorageBinding>,
    /// Storage images, bound in `GENERAL` layout.
    pub storage_images: Vec<(u32, Ref<Image>)>,
    /// Sampled images.
    pub images: Vec<ImageBinding>,
}

impl Default for ComputeCallDesc {
    fn default() -> Self {
        Self {
            pipeline: None,
            group_count: [1, 1, 1],
            storage_buffers: Vec::new(),
            storage_images: Vec::new(),
            images: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ComputeCallNative {
    pub descriptor_set: vk::DescriptorSet,
}

pub(crate) fn references_resolution_dependent(
    resources: &Resources,
    desc: &ComputeCallDesc,
) -> bool {
    let image_dependent = desc
        .storage_images
        .iter()
        .map(|&(_, image)| image)
        .chain(desc.images.iter().map(|b| b.image))
        .any(|image| {
            resources.images.is_alive(image) && resources.images.desc(image).is_resolution_dependent()
        });
    image_dependent
        || desc.storage_buffers.iter().any(|b| {
            resources.buffers.is_alive(b.buffer) && resources.buffers.desc(b.buffer).resolution_dependent
        })
}

impl ResourceKind for ComputeCall {
    type Desc = ComputeCallDesc;
    type Native = ComputeCallNative;

    const NAME: &'static str = "ComputeCall";
    const CAPACITY: usize = 1024;

    fn create_native(
        resources: &Resources,
        ctx: &mut ResourceContext<'_>,
        name: &str,
        desc: &ComputeCallDesc,
    ) -> RenderResult<ComputeCallNative> {
        let (pipeline, _) = require::<Self, Pipeline>(resources, name, desc.pipeline, "pipeline")?;
        if resources.pipelines.native(pipeline).bind_point != vk::PipelineBindPoint::COMPUTE {
            return Err(invalid::<Self>(name, "pipeline is not a compute pipeline"));
        }
        if desc.group_count.contains(&0) {
            return Err(invalid::<Self>(name, "zero group count"));
        }
        let (layout, layout_native) = require::<Self, PipelineLayout>(
            resources,
            name,
            resources.pipelines.desc(pipeline).layout,
            "layout",
        )?;
        let layout_desc = resources.pipeline_layouts.desc(layout);

        let mut writes = DescriptorWrites::default();
        for binding in &layout_desc.bindings {
            let ty = binding.kind.descriptor_type();
            match binding.kind {
                DescriptorKind::StorageBuffer => {
                    let Some(storage) = desc
                        .storage_buffers
                        .iter()
                        .find(|b| b.binding == binding.binding)
                    else {
                        return Err(invalid::<Self>(
                            name,
                            format!("no storage buffer for binding {}", binding.binding),
                        ));
                    };
                    let (_, buffer) =
                        require::<Self, Buffer>(resources, name, Some(storage.buffer), "storage buffer")?;
                    writes.buffer(binding.binding, ty, buffer.buffer, 0, vk::WHOLE_SIZE);
                }
                DescriptorKind::StorageImage => {
                    let Some(&(_, image)) = desc
                        .storage_images
                        .iter()
                        .find(|(b, _)| *b == binding.binding)
                    else {
                        return Err(invalid::<Self>(
                            name,
                            format!("no storage image for binding {}", binding.binding),
                        ));
                    };
                    let (_, image) = require::<Self, Image>(resources, name, Some(image), "storage image")?;
                    writes.image(
                        binding.binding,
                        ty,
                        image.view,
                        vk::Sampler::null(),
                        vk::ImageLayout::GENERAL,
                    );
                }
                DescriptorKind::SampledImage => {
                    let Some(sampled) = desc.images.iter().find(|i| i.binding == binding.binding)
                    else {
                        return Err(invalid::<Self>(
                            name,
                            format!("no image for binding {}", binding.binding),
                        ));
                    };
                    let (_, image) = require::<Self, Image>(resources, name, Some(sampled.image), "image")?;
                    writes.image(
                        binding.binding,
                        ty,
                        image.view,
                        ctx.samplers.get(sampled.sampler),
                        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    );
                }
                DescriptorKind::InstanceUniform { .. } | DescriptorKind::MaterialUniform => {
                    return Err(invalid::<Self>(
                        name,
                        format!("binding {} needs a draw call", binding.binding),
                    ));
                }
            }
        }

        let descriptor_set = writes.allocate_and_apply(
            ctx.device.as_ref(),
            ctx.descriptor_pool,
            layout_native.set_layout,
        )?;
        debug!(
            "Created compute call '{}' ({:?} groups)",
            name, desc.group_count
        );
        Ok(ComputeCallNative { descriptor_set })
    }

    fn release_native(native: ComputeCallNative, ctx: &mut ResourceContext<'_>) {
        ctx.release_queue.release_object(NativeObject::DescriptorSet {
            pool: ctx.descriptor_pool,
            set: native.descriptor_set,
        });
    }

    resource_manager_accessors!(compute_calls);
}
