//! Demo scene: a grid of triangles, one draw call each.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use glam::{Mat4, Quat, Vec3, Vec4};
use tracing::{info, warn};

use forge_renderer::resource::{
    AttachmentDesc, Buffer, DescriptorBinding, DescriptorKind, DrawCall, DrawCallDesc, Framebuffer,
    FramebufferAttachment, FramebufferDesc, GpuProgram, Pipeline, PipelineDesc, PipelineLayout,
    RenderPass, RenderPassDesc, ShaderStage, VertexLayout, VertexLayoutDesc, sort_draw_calls,
    spirv_from_bytes,
};
use forge_renderer::{InstanceUniforms, MaterialUniforms, MemoryLocation, Ref, RenderSystem};
use forge_rhi::state::VertexFormat;
use forge_rhi::vk;

/// SPIR-V for the demo pipeline.
pub struct Shaders {
    vertex: Arc<[u32]>,
    fragment: Arc<[u32]>,
}

impl Shaders {
    /// Load `demo.vert.spv` and `demo.frag.spv` from `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let read = |name: &str| -> Result<Arc<[u32]>> {
            let path = dir.join(name);
            let bytes = std::fs::read(&path)
                .with_context(|| format!("Failed to read shader {}", path.display()))?;
            Ok(spirv_from_bytes(&bytes)?)
        };
        Ok(Self {
            vertex: read("demo.vert.spv")?,
            fragment: read("demo.frag.spv")?,
        })
    }

    /// Placeholder modules for the headless device, which never parses them.
    pub fn headless() -> Self {
        let magic: Arc<[u32]> = Arc::from(vec![0x0723_0203u32]);
        Self {
            vertex: magic.clone(),
            fragment: magic,
        }
    }
}

/// Everything the demo renders each frame.
pub struct DemoScene {
    framebuffer: Ref<Framebuffer>,
    draw_calls: Vec<Ref<DrawCall>>,
    columns: usize,
    time: f32,
}

impl DemoScene {
    /// Build the scene. Without shaders only the clear pass is rendered.
    pub fn new(system: &mut RenderSystem, shaders: Option<Shaders>, count: usize) -> Result<Self> {
        let (resources, mut ctx) = system.split();

        let pass = resources.create::<RenderPass>("demo.pass");
        resources.reset_to_default(pass);
        *resources.desc_mut(pass) = RenderPassDesc {
            color_attachments: vec![AttachmentDesc::backbuffer([0.02, 0.02, 0.05, 1.0])],
            depth_attachment: None,
        };
        resources.create_resources(&mut ctx, &[pass])?;

        let framebuffer = resources.create::<Framebuffer>("demo.framebuffer");
        resources.reset_to_default(framebuffer);
        *resources.desc_mut(framebuffer) = FramebufferDesc {
            render_pass: Some(pass),
            attachments: vec![FramebufferAttachment::Backbuffer],
        };
        resources.create_resources(&mut ctx, &[framebuffer])?;

        let Some(shaders) = shaders else {
            warn!("No shaders given, rendering the clear pass only");
            return Ok(Self {
                framebuffer,
                draw_calls: Vec::new(),
                columns: 1,
                time: 0.0,
            });
        };

        let program = resources.create::<GpuProgram>("demo.program");
        resources.reset_to_default(program);
        resources.desc_mut(program).stages = vec![
            ShaderStage {
                stage: vk::ShaderStageFlags::VERTEX,
                code: shaders.vertex,
            },
            ShaderStage {
                stage: vk::ShaderStageFlags::FRAGMENT,
                code: shaders.fragment,
            },
        ];
        resources.create_resources(&mut ctx, &[program])?;

        let layout = resources.create::<PipelineLayout>("demo.layout");
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
        resources.create_resources(&mut ctx, &[layout])?;

        let vertex_layout = resources.create::<VertexLayout>("demo.vertices");
        resources.reset_to_default(vertex_layout);
        *resources.desc_mut(vertex_layout) = VertexLayoutDesc::packed(&[VertexFormat::Float3]);
        resources.create_resources(&mut ctx, &[vertex_layout])?;

        let pipeline = resources.create::<Pipeline>("demo.pipeline");
        resources.reset_to_default(pipeline);
        *resources.desc_mut(pipeline) = PipelineDesc {
            program: Some(program),
            layout: Some(layout),
            vertex_layout: Some(vertex_layout),
            render_pass: Some(pass),
            ..Default::default()
        };
        resources.create_resources(&mut ctx, &[pipeline])?;

        let triangle: [[f32; 3]; 3] = [[0.0, -0.5, 0.0], [0.5, 0.5, 0.0], [-0.5, 0.5, 0.0]];
        let vertices = resources.create::<Buffer>("demo.triangle");
        resources.reset_to_default(vertices);
        {
            let desc = resources.desc_mut(vertices);
            desc.size = std::mem::size_of_val(&triangle) as vk::DeviceSize;
            desc.usage = vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST;
            desc.location = MemoryLocation::DeviceLocal;
            desc.initial_data = Some(Arc::from(bytemuck::cast_slice::<_, u8>(&triangle)));
        }
        resources.create_resources(&mut ctx, &[vertices])?;

        let mut draw_calls: Vec<_> = (0..count)
            .map(|i| {
                let dc = resources.create::<DrawCall>(&format!("demo.draw{i}"));
                resources.reset_to_default(dc);
                let hue = i as f32 / count.max(1) as f32;
                let color = Vec4::new(hue, 1.0 - hue, 0.5, 1.0);
                *resources.desc_mut(dc) = DrawCallDesc {
                    pipeline: Some(pipeline),
                    vertex_buffers: vec![vertices],
                    vertex_count: 3,
                    material_data: bytemuck::bytes_of(&MaterialUniforms::new(color, 0.5, 0.0))
                        .to_vec(),
                    sort_distance: (count - i) as f32,
                    ..Default::default()
                };
                dc
            })
            .collect();
        resources.create_resources(&mut ctx, &draw_calls)?;
        sort_draw_calls(resources, &mut draw_calls);

        let columns = (count as f32).sqrt().ceil().max(1.0) as usize;
        info!("Demo scene: {} draw calls in a {}-wide grid", count, columns);
        Ok(Self {
            framebuffer,
            draw_calls,
            columns,
            time: 0.0,
        })
    }

    pub fn update(&mut self, delta_secs: f32) {
        self.time += delta_secs;
    }

    /// Record and submit one frame. Returns `false` when it was skipped.
    pub fn render(&self, system: &mut RenderSystem) -> Result<bool> {
        if !system.begin_frame()? {
            return Ok(false);
        }

        let cell = 2.0 / self.columns as f32;
        let spin = Quat::from_rotation_z(self.time);
        let columns = self.columns;
        system.update_uniform_memory(&self.draw_calls, |dc| {
            let i = dc.index();
            let (x, y) = (i % columns, i / columns);
            let position = Vec3::new(
                -1.0 + cell * (x as f32 + 0.5),
                -1.0 + cell * (y as f32 + 0.5),
                0.0,
            );
            let model = Mat4::from_scale_rotation_translation(Vec3::splat(cell), spin, position);
            InstanceUniforms::new(Mat4::IDENTITY, model, Vec4::ONE)
        });

        system.begin_render_pass(self.framebuffer);
        system.queue_draw_calls(&self.draw_calls)?;
        system.end_render_pass();
        system.end_frame()?;
        Ok(true)
    }
}
