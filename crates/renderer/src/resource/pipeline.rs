//! Graphics and compute pipelines.
//!
//! Graphics pipelines bake their viewport, so every pipeline is rebuilt after
//! a resize. Creation goes through the device's pipeline cache.

use ash::vk;
use forge_rhi::NativeObject;
use forge_rhi::state::RasterState;
use tracing::debug;

use super::{
    GpuProgram, PipelineLayout, Ref, RenderPass, ResourceContext, ResourceKind, Resources,
    VertexLayout, invalid, require,
};
use crate::error::RenderResult;

/// Marker for the pipeline kind.
pub enum Pipeline {}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum Viewport {
    /// The full backbuffer.
    #[default]
    Backbuffer,
    Fixed { width: u32, height: u32 },
}

impl Viewport {
    pub fn resolve(self, backbuffer: vk::Extent2D) -> vk::Extent2D {
        match self {
            Viewport::Backbuffer => backbuffer,
            Viewport::Fixed { width, height } => vk::Extent2D { width, height },
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct PipelineDesc {
    pub program: Option<Ref<GpuProgram>>,
    pub layout: Option<Ref<PipelineLayout>>,
    /// No vertex input when unset.
    pub vertex_layout: Option<Ref<VertexLayout>>,
    /// Required for graphics pipelines.
    pub render_pass: Option<Ref<RenderPass>>,
    pub raster: RasterState,
    pub viewport: Viewport,
}

#[derive(Debug, Default)]
pub struct PipelineNative {
    pub pipeline: vk::Pipeline,
    /// Copied from the layout resource for binding at record time.
    pub layout: vk::PipelineLayout,
    pub bind_point: vk::PipelineBindPoint,
}

impl ResourceKind for Pipeline {
    type Desc = PipelineDesc;
    type Native = PipelineNative;

    const NAME: &'static str = "Pipeline";
    const CAPACITY: usize = 1024;

    fn create_native(
        resources: &Resources,
        ctx: &mut ResourceContext<'_>,
        name: &str,
        desc: &PipelineDesc,
    ) -> RenderResult<PipelineNative> {
        let (program, program_native) =
            require::<Self, GpuProgram>(resources, name, desc.program, "program")?;
        let (_, layout_native) =
            require::<Self, PipelineLayout>(resources, name, desc.layout, "layout")?;
        let stages = program_native.stage_infos();

        if resources.programs.desc(program).is_compute() {
            let info = vk::ComputePipelineCreateInfo::default()
                .stage(stages[0])
                .layout(layout_native.layout);
            let pipeline = ctx.device.create_compute_pipeline(&info)?;
            debug!("Created compute pipeline '{}'", name);
            return Ok(PipelineNative {
                pipeline,
                layout: layout_native.layout,
                bind_point: vk::PipelineBindPoint::COMPUTE,
            });
        }

        let (render_pass, pass_native) =
            require::<Self, RenderPass>(resources, name, desc.render_pass, "render pass")?;
        let pass_desc = resources.render_passes.desc(render_pass);

        let (bindings, attributes) = match desc.vertex_layout {
            Some(layout) => {
                require::<Self, VertexLayout>(resources, name, Some(layout), "vertex layout")?;
                let layout_desc = resources.vertex_layouts.desc(layout);
                (
                    layout_desc.binding_descriptions(),
                    layout_desc.attribute_descriptions(),
                )
            }
            None => (Vec::new(), Vec::new()),
        };
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(desc.raster.topology.to_vk())
            .primitive_restart_enable(false);

        let extent = desc.viewport.resolve(ctx.backbuffer_extent);
        if extent.width == 0 || extent.height == 0 {
            return Err(invalid::<Self>(name, "zero sized viewport"));
        }
        let viewports = [vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }];
        let scissors = [vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        }];
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewports(&viewports)
            .scissors(&scissors);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(desc.raster.cull_mode.to_vk())
            .front_face(desc.raster.front_face.to_vk());

        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let blend_attachments: Vec<_> = pass_desc
            .color_attachments
            .iter()
            .map(|_| desc.raster.blend.to_vk())
            .collect();
        let color_blending =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(desc.raster.depth_test)
            .depth_write_enable(desc.raster.depth_write)
            .depth_compare_op(desc.raster.depth_compare.to_vk());

        let mut info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .color_blend_state(&color_blending)
            .layout(layout_native.layout)
            .render_pass(pass_native.render_pass)
            .subpass(0);
        if pass_desc.depth_attachment.is_some() {
            info = info.depth_stencil_state(&depth_stencil);
        }

        let pipeline = ctx.device.create_graphics_pipeline(&info)?;
        debug!(
            "Created graphics pipeline '{}' ({}x{})",
            name, extent.width, extent.height
        );
        Ok(PipelineNative {
            pipeline,
            layout: layout_native.layout,
            bind_point: vk::PipelineBindPoint::GRAPHICS,
        })
    }

    fn release_native(native: PipelineNative, ctx: &mut ResourceContext<'_>) {
        ctx.release_queue
            .release_object(NativeObject::Pipeline(native.pipeline));
    }

    resource_manager_accessors!(pipelines);
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::resource::test_support::Fixture;
    use crate::resource::{
        AttachmentDesc, DescriptorBinding, DescriptorKind, RenderPassDesc, ShaderStage,
    };

    /// A program, layout and render pass ready for a graphics pipeline.
    pub(crate) fn graphics_pipeline(
        resources: &mut Resources,
        ctx: &mut ResourceContext<'_>,
        name: &str,
    ) -> Ref<Pipeline> {
        let program = resources.create::<GpuProgram>(&format!("{name}.program"));
        resources.reset_to_default(program);
        resources.desc_mut(program).stages = vec![
            ShaderStage {
                stage: vk::ShaderStageFlags::VERTEX,
                code: Arc::from(vec![0x0723_0203u32]),
            },
            ShaderStage {
                stage: vk::ShaderStageFlags::FRAGMENT,
                code: Arc::from(vec![0x0723_0203u32]),
            },
        ];
        resources.create_resources(ctx, &[program]).unwrap();

        let layout = resources.create::<PipelineLayout>(&format!("{name}.layout"));
        resources.reset_to_default(layout);
        resources.desc_mut(layout).bindings = vec![
            DescriptorBinding::new(
                0,
                DescriptorKind::InstanceUniform { large: false },
                vk::ShaderStageFlags::VERTEX,
            ),
            DescriptorBinding::new(
                1,
                DescriptorKind::MaterialUniform,
                vk::ShaderStageFlags::FRAGMENT,
            ),
        ];
        resources.create_resources(ctx, &[layout]).unwrap();

        let pass = resources.create::<RenderPass>(&format!("{name}.pass"));
        resources.reset_to_default(pass);
        *resources.desc_mut(pass) = RenderPassDesc {
            color_attachments: vec![AttachmentDesc::backbuffer([0.0; 4])],
            depth_attachment: None,
        };
        resources.create_resources(ctx, &[pass]).unwrap();

        let pipeline = resources.create::<Pipeline>(name);
        resources.reset_to_default(pipeline);
        *resources.desc_mut(pipeline) = PipelineDesc {
            program: Some(program),
            layout: Some(layout),
            render_pass: Some(pass),
            ..Default::default()
        };
        resources.create_resources(ctx, &[pipeline]).unwrap();
        pipeline
    }

    #[test]
    fn test_graphics_pipeline_copies_layout() {
        let mut fixture = Fixture::new();
        let (resources, mut ctx) = fixture.split();
        let pipeline = graphics_pipeline(resources, &mut ctx, "mesh");

        let native = resources.native(pipeline);
        assert_eq!(native.bind_point, vk::PipelineBindPoint::GRAPHICS);
        let layout = resources.desc(pipeline).layout.unwrap();
        assert_eq!(native.layout, resources.native(layout).layout);
    }

    #[test]
    fn test_compute_pipeline_needs_no_render_pass() {
        let mut fixture = Fixture::new();
        let (resources, mut ctx) = fixture.split();

        let program = resources.create::<GpuProgram>("blur.program");
        resources.reset_to_default(program);
        resources.desc_mut(program).stages = vec![ShaderStage {
            stage: vk::ShaderStageFlags::COMPUTE,
            code: Arc::from(vec![0x0723_0203u32]),
        }];
        let layout = resources.create::<PipelineLayout>("blur.layout");
        resources.reset_to_default(layout);
        resources.desc_mut(layout).bindings = vec![DescriptorBinding::new(
            0,
            DescriptorKind::StorageImage,
            vk::ShaderStageFlags::COMPUTE,
        )];
        resources.create_resources(&mut ctx, &[program]).unwrap();
        resources.create_resources(&mut ctx, &[layout]).unwrap();

        let pipeline = resources.create::<Pipeline>("blur");
        resources.reset_to_default(pipeline);
        resources.desc_mut(pipeline).program = Some(program);
        resources.desc_mut(pipeline).layout = Some(layout);
        resources.create_resources(&mut ctx, &[pipeline]).unwrap();
        assert_eq!(
            resources.native(pipeline).bind_point,
            vk::PipelineBindPoint::COMPUTE
        );
    }

    #[test]
    fn test_destroyed_dependency_is_reported() {
        let mut fixture = Fixture::new();
        let (resources, mut ctx) = fixture.split();
        let pipeline = graphics_pipeline(resources, &mut ctx, "mesh");

        let program = resources.desc(pipeline).program.unwrap();
        resources.destroy_resources(&mut ctx, &[program]);
        let err = resources.create_resources(&mut ctx, &[pipeline]).unwrap_err();
        assert!(err.to_string().contains("has no device objects"));
    }
}
