//! Integration tests driving the full frame loop on the headless backend.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use ash::vk;
use glam::{Mat4, Vec4};
use parking_lot::Mutex;
use rand::Rng;

use forge_core::{InlineScheduler, RayonScheduler, RendererConfig, TaskScheduler, UniformConfig};
use forge_renderer::resource::{
    AttachmentDesc, Buffer, DescriptorBinding, DescriptorKind, DrawCall, DrawCallDesc, Framebuffer,
    FramebufferAttachment, FramebufferDesc, GpuProgram, Pipeline, PipelineDesc, PipelineLayout,
    RenderPass, RenderPassDesc, ShaderStage,
};
use forge_renderer::{FrameState, InstanceUniforms, Ref, RenderSystem};
use forge_rhi::{GpuDevice, NativeObject, PipelineCacheStore};
use forge_rhi::headless::{HeadlessDevice, HeadlessPresenter, PresenterControl, RecordedCommand};

const SPIRV_MAGIC: u32 = 0x0723_0203;

fn test_config() -> RendererConfig {
    RendererConfig {
        page_size_bytes: 4 * 1024 * 1024,
        resize_interval_secs: 1.0,
        uniforms: UniformConfig {
            small_block_count: 512,
            large_block_count: 16,
            material_block_count: 256,
            ..Default::default()
        },
        ..Default::default()
    }
}

struct Harness {
    headless: Arc<HeadlessDevice>,
    control: Arc<PresenterControl>,
    system: RenderSystem,
}

impl Harness {
    fn new(images: u32, scheduler: Arc<dyn TaskScheduler>) -> Self {
        let _ = forge_core::try_init_logging();
        let headless = Arc::new(HeadlessDevice::new());
        let presenter = HeadlessPresenter::new(
            &headless,
            images,
            vk::Extent2D {
                width: 1280,
                height: 720,
            },
        );
        let control = presenter.control();
        let system =
            RenderSystem::new(headless.clone(), Box::new(presenter), scheduler, &test_config())
                .unwrap();
        Self {
            headless,
            control,
            system,
        }
    }

    fn with_workers(workers: usize) -> Self {
        Self::new(2, Arc::new(InlineScheduler::new(workers)))
    }

    /// Pipeline and backbuffer framebuffer for a single color pass.
    fn forward_pass(&mut self) -> (Ref<Pipeline>, Ref<Framebuffer>) {
        let (resources, mut ctx) = self.system.split();

        let program = resources.create::<GpuProgram>("forward.program");
        resources.reset_to_default(program);
        resources.desc_mut(program).stages = vec![
            ShaderStage {
                stage: vk::ShaderStageFlags::VERTEX,
                code: Arc::from(vec![SPIRV_MAGIC]),
            },
            ShaderStage {
                stage: vk::ShaderStageFlags::FRAGMENT,
                code: Arc::from(vec![SPIRV_MAGIC]),
            },
        ];
        resources.create_resources(&mut ctx, &[program]).unwrap();

        let layout = resources.create::<PipelineLayout>("forward.layout");
        resources.reset_to_default(layout);
        resources.desc_mut(layout).bindings = vec![DescriptorBinding::new(
            0,
            DescriptorKind::InstanceUniform { large: false },
            vk::ShaderStageFlags::VERTEX,
        )];
        resources.create_resources(&mut ctx, &[layout]).unwrap();

        let pass = resources.create::<RenderPass>("forward.pass");
        resources.reset_to_default(pass);
        *resources.desc_mut(pass) = RenderPassDesc {
            color_attachments: vec![AttachmentDesc::backbuffer([0.1, 0.1, 0.1, 1.0])],
            depth_attachment: None,
        };
        resources.create_resources(&mut ctx, &[pass]).unwrap();

        let framebuffer = resources.create::<Framebuffer>("forward.framebuffer");
        resources.reset_to_default(framebuffer);
        *resources.desc_mut(framebuffer) = FramebufferDesc {
            render_pass: Some(pass),
            attachments: vec![FramebufferAttachment::Backbuffer],
        };
        resources.create_resources(&mut ctx, &[framebuffer]).unwrap();

        let pipeline = resources.create::<Pipeline>("forward");
        resources.reset_to_default(pipeline);
        *resources.desc_mut(pipeline) = PipelineDesc {
            program: Some(program),
            layout: Some(layout),
            render_pass: Some(pass),
            ..Default::default()
        };
        resources.create_resources(&mut ctx, &[pipeline]).unwrap();

        (pipeline, framebuffer)
    }

    /// `count` non-indexed draw calls; draw call `i` draws `i + 3` vertices.
    fn draw_calls(&mut self, pipeline: Ref<Pipeline>, count: usize) -> Vec<Ref<DrawCall>> {
        let (resources, mut ctx) = self.system.split();
        let calls: Vec<_> = (0..count)
            .map(|i| {
                let dc = resources.create::<DrawCall>(&format!("draw{i}"));
                resources.reset_to_default(dc);
                *resources.desc_mut(dc) = DrawCallDesc {
                    pipeline: Some(pipeline),
                    vertex_count: i as u32 + 3,
                    ..Default::default()
                };
                dc
            })
            .collect();
        resources.create_resources(&mut ctx, &calls).unwrap();
        calls
    }

    /// Render one frame of `draw_calls` into `framebuffer` and return the
    /// submitted primary buffer.
    fn render(
        &mut self,
        framebuffer: Ref<Framebuffer>,
        draw_calls: &[Ref<DrawCall>],
    ) -> vk::CommandBuffer {
        assert!(self.system.begin_frame().unwrap());
        self.system.update_uniform_memory(draw_calls, |_| {
            InstanceUniforms::new(Mat4::IDENTITY, Mat4::IDENTITY, Vec4::ONE)
        });
        self.system.begin_render_pass(framebuffer);
        self.system.queue_draw_calls(draw_calls).unwrap();
        self.system.end_render_pass();
        self.system.end_frame().unwrap();
        *self
            .headless
            .submissions()
            .last()
            .and_then(|s| s.first())
            .unwrap()
    }

    /// Secondaries executed into `primary`, in replay order.
    fn replayed(&self, primary: vk::CommandBuffer) -> Vec<vk::CommandBuffer> {
        self.headless
            .commands(primary)
            .into_iter()
            .filter_map(|c| match c {
                RecordedCommand::ExecuteCommands { secondaries } => Some(secondaries),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Vertex counts drawn by `secondary`, in recording order.
    fn drawn(&self, secondary: vk::CommandBuffer) -> Vec<u32> {
        self.headless
            .commands(secondary)
            .into_iter()
            .filter_map(|c| match c {
                RecordedCommand::Draw { vertex_count, .. } => Some(vertex_count),
                _ => None,
            })
            .collect()
    }
}

/// Runs every task on its own thread after a random delay.
struct JitterScheduler {
    workers: usize,
    completed: Mutex<Vec<usize>>,
}

impl TaskScheduler for JitterScheduler {
    fn worker_count(&self) -> usize {
        self.workers
    }

    fn run_tasks(&self, task_count: usize, task: &(dyn Fn(usize) + Sync)) {
        std::thread::scope(|scope| {
            for index in 0..task_count {
                let delay = rand::rng().random_range(0..5u64);
                scope.spawn(move || {
                    std::thread::sleep(Duration::from_millis(delay));
                    task(index);
                    self.completed.lock().push(index);
                });
            }
        });
    }
}

/// Counts how often tasks were forked.
struct CountingScheduler {
    inner: InlineScheduler,
    forks: AtomicUsize,
}

impl TaskScheduler for CountingScheduler {
    fn worker_count(&self) -> usize {
        self.inner.worker_count()
    }

    fn run_tasks(&self, task_count: usize, task: &(dyn Fn(usize) + Sync)) {
        self.forks.fetch_add(1, Ordering::SeqCst);
        self.inner.run_tasks(task_count, task);
    }
}

#[test]
fn test_hundred_draw_calls_on_four_workers() {
    let scheduler = Arc::new(RayonScheduler::new(4).unwrap());
    let mut harness = Harness::new(2, scheduler);
    let (pipeline, framebuffer) = harness.forward_pass();
    let calls = harness.draw_calls(pipeline, 100);

    let primary = harness.render(framebuffer, &calls);
    let stats = harness.system.dispatcher().stats();
    assert_eq!(stats.draw_calls, 100);
    assert_eq!(stats.batches, 4);

    let secondaries = harness.replayed(primary);
    assert_eq!(secondaries.len(), 4);
    for (batch, &secondary) in secondaries.iter().enumerate() {
        let expected: Vec<u32> = (batch as u32 * 25..(batch as u32 + 1) * 25)
            .map(|i| i + 3)
            .collect();
        assert_eq!(harness.drawn(secondary), expected);
    }
}

#[test]
fn test_replay_order_ignores_completion_order() {
    let scheduler = Arc::new(JitterScheduler {
        workers: 8,
        completed: Mutex::new(Vec::new()),
    });
    let mut harness = Harness::new(2, scheduler.clone());
    let (pipeline, framebuffer) = harness.forward_pass();
    let calls = harness.draw_calls(pipeline, 37);

    for _ in 0..5 {
        scheduler.completed.lock().clear();
        let primary = harness.render(framebuffer, &calls);

        // 37 / 8 = 4 per batch, the last batch takes the single remainder.
        let secondaries = harness.replayed(primary);
        assert_eq!(secondaries.len(), 10);

        // Uniform updates fork on the same scheduler, with the same batching.
        let mut completed = scheduler.completed.lock().clone();
        completed.sort_unstable();
        completed.dedup();
        assert_eq!(completed, (0..10).collect::<Vec<_>>());

        let drawn: Vec<u32> = secondaries.iter().flat_map(|&s| harness.drawn(s)).collect();
        assert_eq!(drawn, (3..40).collect::<Vec<u32>>());

        // Replay happens strictly after the last batch finished recording.
        let last_recorded = secondaries
            .iter()
            .flat_map(|&s| harness.headless.sequenced_commands(s))
            .map(|c| c.sequence)
            .max()
            .unwrap();
        let replayed_at = harness
            .headless
            .sequenced_commands(primary)
            .into_iter()
            .find(|c| matches!(c.command, RecordedCommand::ExecuteCommands { .. }))
            .unwrap()
            .sequence;
        assert!(replayed_at > last_recorded);
    }
}

#[test]
fn test_empty_draw_list_forks_nothing() {
    let scheduler = Arc::new(CountingScheduler {
        inner: InlineScheduler::new(4),
        forks: AtomicUsize::new(0),
    });
    let mut harness = Harness::new(2, scheduler.clone());
    let (_, framebuffer) = harness.forward_pass();

    let primary = harness.render(framebuffer, &[]);
    assert_eq!(scheduler.forks.load(Ordering::SeqCst), 0);
    assert_eq!(harness.system.dispatcher().stats(), Default::default());
    assert!(harness.replayed(primary).is_empty());
}

#[test]
fn test_each_draw_binds_its_own_uniform_block() {
    let mut harness = Harness::with_workers(3);
    let (pipeline, framebuffer) = harness.forward_pass();
    let calls = harness.draw_calls(pipeline, 12);

    let primary = harness.render(framebuffer, &calls);
    let mut offsets: Vec<u32> = harness
        .replayed(primary)
        .into_iter()
        .flat_map(|s| harness.headless.commands(s))
        .filter_map(|c| match c {
            RecordedCommand::BindDescriptorSets {
                dynamic_offsets, ..
            } => Some(dynamic_offsets),
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(offsets.len(), 12);
    offsets.sort_unstable();
    offsets.dedup();
    assert_eq!(offsets.len(), 12);

    // Pipelines are only bound when they change.
    let binds = harness
        .replayed(primary)
        .into_iter()
        .flat_map(|s| harness.headless.commands(s))
        .filter(|c| matches!(c, RecordedCommand::BindPipeline { .. }))
        .count();
    assert_eq!(binds, 3);
}

#[test]
fn test_release_waits_for_buffering_depth() {
    let mut harness = Harness::with_workers(1);
    let (_, framebuffer) = harness.forward_pass();

    let buffer = {
        let (resources, mut ctx) = harness.system.split();
        let buffer = resources.create::<Buffer>("scratch");
        resources.reset_to_default(buffer);
        resources.desc_mut(buffer).size = 1024;
        resources.create_resources(&mut ctx, &[buffer]).unwrap();
        buffer
    };
    let native = harness.system.resources().native(buffer).buffer;
    harness.system.destroy_resources(&[buffer]);
    assert_eq!(harness.system.release_queue().len(), 1);

    let destroyed = |h: &Harness| {
        h.headless
            .destroyed_objects()
            .contains(&NativeObject::Buffer(native))
    };

    // Two backbuffers: the buffer outlives the next two frames.
    harness.render(framebuffer, &[]);
    assert!(!destroyed(&harness));
    harness.render(framebuffer, &[]);
    assert!(!destroyed(&harness));
    harness.render(framebuffer, &[]);
    assert!(destroyed(&harness));
    assert!(harness.system.release_queue().is_empty());
}

#[test]
fn test_resize_is_rate_limited() {
    let mut harness = Harness::with_workers(2);

    harness.system.resize(1024, 768);
    assert!(harness.system.update(0.0).unwrap());
    assert_eq!(
        harness.system.backbuffer_extent(),
        vk::Extent2D {
            width: 1024,
            height: 768
        }
    );

    harness.system.resize(800, 600);
    assert!(!harness.system.update(0.5).unwrap());
    assert!(harness.system.is_resize_pending());
    assert!(harness.system.update(0.6).unwrap());

    assert_eq!(harness.system.resize_count(), 2);
    assert_eq!(harness.control.recreate_count(), 2);
    assert_eq!(harness.system.backbuffer_extent().width, 800);
}

#[test]
fn test_resize_rebuilds_backbuffer_objects() {
    let mut harness = Harness::with_workers(2);
    let (pipeline, framebuffer) = harness.forward_pass();
    let calls = harness.draw_calls(pipeline, 4);
    harness.render(framebuffer, &calls);

    let old_framebuffers = harness
        .system
        .resources()
        .native(framebuffer)
        .framebuffers
        .clone();
    let old_pipeline = harness.system.resources().native(pipeline).pipeline;

    harness.system.resize(640, 360);
    assert!(harness.system.update(0.0).unwrap());

    let native = harness.system.resources().native(framebuffer);
    assert_eq!(
        native.extent,
        vk::Extent2D {
            width: 640,
            height: 360
        }
    );
    assert!(native.framebuffers.iter().all(|fb| !old_framebuffers.contains(fb)));
    assert_ne!(harness.system.resources().native(pipeline).pipeline, old_pipeline);

    // The device was idle, so the old objects are gone right away.
    let destroyed = harness.headless.destroyed_objects();
    for fb in old_framebuffers {
        assert!(destroyed.contains(&NativeObject::Framebuffer(fb)));
    }
    assert!(destroyed.contains(&NativeObject::Pipeline(old_pipeline)));

    let primary = harness.render(framebuffer, &calls);
    assert_eq!(harness.replayed(primary).len(), 2);
}

#[test]
fn test_out_of_date_acquire_skips_frames_until_resize() {
    let mut harness = Harness::with_workers(2);
    let submitted = harness.headless.submissions().len();

    harness.control.fail_next_acquire();
    assert!(!harness.system.begin_frame().unwrap());
    assert_eq!(harness.system.state(), FrameState::Idle);
    assert!(harness.system.is_resize_pending());
    assert!(!harness.system.begin_frame().unwrap());
    assert_eq!(harness.headless.submissions().len(), submitted);

    assert!(harness.system.update(0.016).unwrap());
    assert!(harness.system.begin_frame().unwrap());
    harness.system.end_frame().unwrap();
    assert_eq!(harness.control.present_count(), 1);
}

#[test]
fn test_suboptimal_present_requests_resize() {
    let mut harness = Harness::with_workers(2);
    let (_, framebuffer) = harness.forward_pass();

    harness.control.suboptimal_next_present();
    harness.render(framebuffer, &[]);
    assert!(harness.system.is_resize_pending());
    assert_eq!(harness.control.present_count(), 1);

    // The swapchain still works while the resize is pending.
    harness.render(framebuffer, &[]);
    assert!(harness.system.update(0.016).unwrap());
    assert!(!harness.system.is_resize_pending());
}

#[test]
fn test_drop_frees_all_device_memory() {
    let headless = {
        let mut harness = Harness::with_workers(2);
        let (pipeline, framebuffer) = harness.forward_pass();
        let calls = harness.draw_calls(pipeline, 8);
        harness.render(framebuffer, &calls);
        harness.render(framebuffer, &calls);
        assert!(harness.headless.live_memory_allocations() > 0);
        harness.headless.clone()
    };
    assert_eq!(headless.live_memory_allocations(), 0);
}

#[test]
fn test_shutdown_stores_pipeline_cache() {
    let dir = tempfile::tempdir().unwrap();
    let headless = Arc::new(HeadlessDevice::new());
    let presenter = HeadlessPresenter::new(
        &headless,
        2,
        vk::Extent2D {
            width: 640,
            height: 480,
        },
    );
    let config = RendererConfig {
        pipeline_cache_dir: Some(dir.path().to_path_buf()),
        ..test_config()
    };
    let scheduler = Arc::new(InlineScheduler::new(1));
    let mut system =
        RenderSystem::new(headless.clone(), Box::new(presenter), scheduler, &config).unwrap();
    system.shutdown().unwrap();
    // A second call is a no-op.
    system.shutdown().unwrap();

    let uuid = headless.info().pipeline_cache_uuid;
    let blob = PipelineCacheStore::new(dir.path()).load(&uuid).unwrap();
    assert_eq!(&blob[16..32], &uuid);
}
