//! Draw calls.
//!
//! A draw call bundles everything one draw needs: pipeline, vertex and index
//! buffers, a descriptor set and its uniform blocks. Pipelines are looked up
//! at record time because they are rebuilt on resize while draw calls mostly
//! are not.

use std::sync::atomic::{AtomicU32, Ordering};

use ash::vk;
use bytemuck::Pod;
use forge_core::TaskScheduler;
use forge_rhi::NativeObject;
use tracing::{debug, trace};

use super::descriptor_writes::DescriptorWrites;
use super::{
    Buffer, DescriptorKind, Image, Pipeline, PipelineLayout, Ref, ResourceContext, ResourceKind,
    Resources, invalid, require,
};
use crate::dispatcher::batch_size;
use crate::error::RenderResult;
use crate::sampler::SamplerKind;
use crate::uniforms::{BlockClass, UniformManager};

/// Marker for the draw call kind.
pub enum DrawCall {}

/// A sampled image bound to a layout slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageBinding {
    pub binding: u32,
    pub image: Ref<Image>,
    pub sampler: SamplerKind,
}

#[derive(Clone, Debug)]
pub struct DrawCallDesc {
    pub pipeline: Option<Ref<Pipeline>>,
    pub vertex_buffers: Vec<Ref<Buffer>>,
    /// Indexed draw when set.
    pub index_buffer: Option<Ref<Buffer>>,
    pub index_type: vk::IndexType,
    pub vertex_count: u32,
    pub index_count: u32,
    pub instance_count: u32,
    pub images: Vec<ImageBinding>,
    /// Initial contents of the material block.
    pub material_data: Vec<u8>,
    /// Primary sort key; draw calls of one pass render together.
    pub material_pass: u32,
    /// Distance from the camera, sorted front to back within a pipeline.
    pub sort_distance: f32,
}

impl Default for DrawCallDesc {
    fn default() -> Self {
        Self {
            pipeline: None,
            vertex_buffers: Vec::new(),
            index_buffer: None,
            index_type: vk::IndexType::UINT32,
            vertex_count: 0,
            index_count: 0,
            instance_count: 1,
            images: Vec::new(),
            material_data: Vec::new(),
            material_pass: 0,
            sort_distance: 0.0,
        }
    }
}

impl DrawCallDesc {
    /// 64-bit ordering key: material pass, then pipeline, then distance.
    pub fn sort_key(&self) -> u64 {
        let pass = (self.material_pass as u64 & 0xFFFF) << 48;
        let pipeline = (self.pipeline.map_or(0, |p| p.index() as u64) & 0xFFFF) << 32;
        // Non-negative floats order like their bit patterns.
        let distance = self.sort_distance.max(0.0).to_bits() as u64;
        pass | pipeline | distance
    }
}

#[derive(Debug, Default)]
pub struct DrawCallNative {
    pub descriptor_set: vk::DescriptorSet,
    pub vertex_buffers: Vec<vk::Buffer>,
    pub vertex_offsets: Vec<vk::DeviceSize>,
    pub index_buffer: vk::Buffer,
    /// Offset of this frame's per-instance block, written by
    /// [`update_uniform_memory`].
    pub dynamic_offset: AtomicU32,
    pub instance_class: Option<BlockClass>,
    pub material_block: Option<u32>,
}

impl DrawCallNative {
    /// Dynamic offsets to bind with the descriptor set.
    pub fn dynamic_offsets(&self) -> Option<u32> {
        self.instance_class
            .map(|_| self.dynamic_offset.load(Ordering::Relaxed))
    }
}

/// Stable sort by [`DrawCallDesc::sort_key`], so consecutive draw calls share
/// pipelines as often as possible.
pub fn sort_draw_calls(resources: &Resources, draw_calls: &mut [Ref<DrawCall>]) {
    draw_calls.sort_by_cached_key(|&dc| resources.draw_calls.desc(dc).sort_key());
}

/// True when a buffer or image the draw call points at is rebuilt on resize.
pub(crate) fn references_resolution_dependent(resources: &Resources, desc: &DrawCallDesc) -> bool {
    let buffer_dependent = desc
        .vertex_buffers
        .iter()
        .chain(desc.index_buffer.iter())
        .any(|&b| resources.buffers.is_alive(b) && resources.buffers.desc(b).resolution_dependent);
    let image_dependent = desc.images.iter().any(|binding| {
        resources.images.is_alive(binding.image)
            && resources.images.desc(binding.image).is_resolution_dependent()
    });
    buffer_dependent || image_dependent
}

/// Write this frame's per-instance data of every draw call in parallel.
///
/// `data` is called once per draw call that has an instance binding; the
/// value's bytes go into a fresh block whose offset is bound at record time.
pub fn update_uniform_memory<T, F>(
    resources: &Resources,
    uniforms: &UniformManager,
    scheduler: &dyn TaskScheduler,
    draw_calls: &[Ref<DrawCall>],
    data: F,
) where
    T: Pod,
    F: Fn(Ref<DrawCall>) -> T + Sync,
{
    if draw_calls.is_empty() {
        return;
    }
    let batch = batch_size(draw_calls.len(), scheduler.worker_count());
    let batches: Vec<&[Ref<DrawCall>]> = draw_calls.chunks(batch).collect();

    scheduler.run_tasks(batches.len(), &|i| {
        for &draw_call in batches[i] {
            let native = resources.draw_calls.native(draw_call);
            let Some(class) = native.instance_class else {
                continue;
            };
            let value = data(draw_call);
            let offset = uniforms.write_instance(class, bytemuck::bytes_of(&value));
            native.dynamic_offset.store(offset, Ordering::Relaxed);
        }
    });
    trace!(
        "Updated uniforms of {} draw calls in {} batches",
        draw_calls.len(),
        batches.len()
    );
}

impl ResourceKind for DrawCall {
    type Desc = DrawCallDesc;
    type Native = DrawCallNative;

    const NAME: &'static str = "DrawCall";
    const CAPACITY: usize = 10240;

    fn create_native(
        resources: &Resources,
        ctx: &mut ResourceContext<'_>,
        name: &str,
        desc: &DrawCallDesc,
    ) -> RenderResult<DrawCallNative> {
        let (pipeline, _) = require::<Self, Pipeline>(resources, name, desc.pipeline, "pipeline")?;
        let pipeline_desc = resources.pipelines.desc(pipeline);
        let (layout, layout_native) =
            require::<Self, PipelineLayout>(resources, name, pipeline_desc.layout, "layout")?;
        let layout_desc = resources.pipeline_layouts.desc(layout);

        let drawn = if desc.index_buffer.is_some() {
            desc.index_count
        } else {
            desc.vertex_count
        };
        if drawn == 0 || desc.instance_count == 0 {
            return Err(invalid::<Self>(name, "nothing to draw"));
        }

        let mut native = DrawCallNative::default();
        for &buffer in &desc.vertex_buffers {
            let (_, buffer_native) = require::<Self, Buffer>(resources, name, Some(buffer), "vertex buffer")?;
            native.vertex_buffers.push(buffer_native.buffer);
            native.vertex_offsets.push(0);
        }
        if let Some(index_buffer) = desc.index_buffer {
            native.index_buffer =
                require::<Self, Buffer>(resources, name, Some(index_buffer), "index buffer")?
                    .1
                    .buffer;
        }

        let mut writes = DescriptorWrites::default();
        for binding in &layout_desc.bindings {
            match binding.kind {
                DescriptorKind::InstanceUniform { large } => {
                    let class = if large { BlockClass::Large } else { BlockClass::Small };
                    native.instance_class = Some(class);
                    writes.buffer(
                        binding.binding,
                        binding.kind.descriptor_type(),
                        ctx.uniforms.instance_buffer(),
                        0,
                        ctx.uniforms.block_size(class) as vk::DeviceSize,
                    );
                }
                DescriptorKind::MaterialUniform => {
                    let size = ctx.uniforms.material_block_size();
                    if desc.material_data.len() > size as usize {
                        Self::release_native(native, ctx);
                        return Err(invalid::<Self>(
                            name,
                            format!("material data exceeds the {size} byte block"),
                        ));
                    }
                    let block = ctx.uniforms.allocate_material_block();
                    native.material_block = Some(block);
                    ctx.uniforms.write_material(block, &desc.material_data);
                    writes.buffer(
                        binding.binding,
                        binding.kind.descriptor_type(),
                        ctx.uniforms.material_buffer(),
                        ctx.uniforms.material_offset(block),
                        size as vk::DeviceSize,
                    );
                }
                DescriptorKind::SampledImage => {
                    let Some(image_binding) =
                        desc.images.iter().find(|i| i.binding == binding.binding)
                    else {
                        Self::release_native(native, ctx);
                        return Err(invalid::<Self>(
                            name,
                            format!("no image for binding {}", binding.binding),
                        ));
                    };
                    let image = match require::<Self, Image>(
                        resources,
                        name,
                        Some(image_binding.image),
                        "image",
                    ) {
                        Ok((_, image)) => image,
                        Err(e) => {
                            Self::release_native(native, ctx);
                            return Err(e);
                        }
                    };
                    writes.image(
                        binding.binding,
                        binding.kind.descriptor_type(),
                        image.view,
                        ctx.samplers.get(image_binding.sampler),
                        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    );
                }
                DescriptorKind::StorageBuffer | DescriptorKind::StorageImage => {
                    Self::release_native(native, ctx);
                    return Err(invalid::<Self>(
                        name,
                        format!("binding {} is a storage binding", binding.binding),
                    ));
                }
            }
        }
        if let Some(stray) = desc
            .images
            .iter()
            .find(|i| layout_desc.binding_of(i.binding).map(|b| b.kind) != Some(DescriptorKind::SampledImage))
        {
            let binding = stray.binding;
            Self::release_native(native, ctx);
            return Err(invalid::<Self>(
                name,
                format!("image binding {binding} is not a sampled image slot"),
            ));
        }

        match writes.allocate_and_apply(
            ctx.device.as_ref(),
            ctx.descriptor_pool,
            layout_native.set_layout,
        ) {
            Ok(set) => native.descriptor_set = set,
            Err(e) => {
                Self::release_native(native, ctx);
                return Err(e);
            }
        }

        debug!("Created draw call '{}'", name);
        Ok(native)
    }

    fn release_native(native: DrawCallNative, ctx: &mut ResourceContext<'_>) {
        ctx.release_queue.release_object(NativeObject::DescriptorSet {
            pool: ctx.descriptor_pool,
            set: native.descriptor_set,
        });
        if let Some(block) = native.material_block {
            ctx.uniforms.release_material_block(block);
        }
    }

    resource_manager_accessors!(draw_calls);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::pipeline::tests::graphics_pipeline;
    use crate::resource::test_support::Fixture;
    use forge_core::InlineScheduler;

    fn draw_call(
        resources: &mut Resources,
        ctx: &mut ResourceContext<'_>,
        name: &str,
        pipeline: Ref<Pipeline>,
    ) -> Ref<DrawCall> {
        let dc = resources.create::<DrawCall>(name);
        resources.reset_to_default(dc);
        *resources.desc_mut(dc) = DrawCallDesc {
            pipeline: Some(pipeline),
            vertex_count: 3,
            material_data: vec![1, 2, 3, 4],
            ..Default::default()
        };
        resources.create_resources(ctx, &[dc]).unwrap();
        dc
    }

    #[test]
    fn test_sort_key_orders_pass_then_pipeline_then_distance() {
        let mut fixture = Fixture::new();
        let (resources, mut ctx) = fixture.split();
        let a = graphics_pipeline(resources, &mut ctx, "a");
        let b = graphics_pipeline(resources, &mut ctx, "b");

        let mut calls = Vec::new();
        for (i, (pipeline, pass, distance)) in [
            (b, 0, 1.0),
            (a, 1, 0.5),
            (a, 0, 9.0),
            (b, 0, 0.5),
            (a, 0, 2.0),
        ]
        .into_iter()
        .enumerate()
        {
            let dc = draw_call(resources, &mut ctx, &format!("dc{i}"), pipeline);
            resources.desc_mut(dc).material_pass = pass;
            resources.desc_mut(dc).sort_distance = distance;
            calls.push(dc);
        }

        sort_draw_calls(resources, &mut calls);
        let names: Vec<&str> = calls.iter().map(|&dc| resources.draw_calls.name(dc)).collect();
        assert_eq!(names, vec!["dc4", "dc2", "dc3", "dc0", "dc1"]);
    }

    #[test]
    fn test_instance_and_material_blocks_are_assigned() {
        let mut fixture = Fixture::new();
        let (resources, mut ctx) = fixture.split();
        let pipeline = graphics_pipeline(resources, &mut ctx, "mesh");
        let dc = draw_call(resources, &mut ctx, "dc", pipeline);

        let native = resources.native(dc);
        assert_eq!(native.instance_class, Some(BlockClass::Small));
        assert_eq!(native.material_block, Some(0));
        assert_ne!(native.descriptor_set, vk::DescriptorSet::null());
    }

    #[test]
    fn test_update_uniform_memory_assigns_unique_offsets() {
        let mut fixture = Fixture::new();
        let (resources, mut ctx) = fixture.split();
        let pipeline = graphics_pipeline(resources, &mut ctx, "mesh");
        let calls: Vec<_> = (0..10)
            .map(|i| draw_call(resources, &mut ctx, &format!("dc{i}"), pipeline))
            .collect();

        ctx.uniforms.begin_frame(1);
        let scheduler = InlineScheduler::new(3);
        update_uniform_memory(resources, ctx.uniforms, &scheduler, &calls, |dc| {
            [dc.index() as u32; 4]
        });

        let mut offsets: Vec<u32> = calls
            .iter()
            .filter_map(|&dc| resources.native(dc).dynamic_offsets())
            .collect();
        assert_eq!(offsets.len(), 10);
        offsets.sort_unstable();
        offsets.dedup();
        assert_eq!(offsets.len(), 10);
        assert_eq!(ctx.uniforms.available_instance_blocks(BlockClass::Small), 54);
    }

    #[test]
    fn test_release_returns_set_and_material_block() {
        let mut fixture = Fixture::new();
        let (resources, mut ctx) = fixture.split();
        let pipeline = graphics_pipeline(resources, &mut ctx, "mesh");
        let dc = draw_call(resources, &mut ctx, "dc", pipeline);
        let set = resources.native(dc).descriptor_set;

        resources.destroy_resources(&mut ctx, &[dc]);
        let last = ctx.release_queue.entries().last().unwrap().item;
        assert_eq!(
            last,
            NativeObject::DescriptorSet {
                pool: ctx.descriptor_pool,
                set
            }
        );
    }

    #[test]
    fn test_missing_image_binding_is_rejected() {
        use crate::resource::{DescriptorBinding, DescriptorKind};

        let mut fixture = Fixture::new();
        let (resources, mut ctx) = fixture.split();
        let pipeline = graphics_pipeline(resources, &mut ctx, "mesh");
        let layout = resources.desc(pipeline).layout.unwrap();
        resources.desc_mut(layout).bindings.push(DescriptorBinding::new(
            2,
            DescriptorKind::SampledImage,
            vk::ShaderStageFlags::FRAGMENT,
        ));
        resources.create_resources(&mut ctx, &[layout]).unwrap();
        resources.create_resources(&mut ctx, &[pipeline]).unwrap();

        let dc = resources.create::<DrawCall>("textured");
        resources.reset_to_default(dc);
        resources.desc_mut(dc).pipeline = Some(pipeline);
        resources.desc_mut(dc).vertex_count = 6;
        let err = resources.create_resources(&mut ctx, &[dc]).unwrap_err();
        assert!(err.to_string().contains("no image for binding 2"));
        assert!(!resources.draw_calls.has_native(dc));
    }
}
