//! The frame loop.
//!
//! [`RenderSystem`] owns the device-side state of the renderer: memory pools,
//! resources, the deferred release queue, uniform memory, per-backbuffer
//! synchronization and the draw call dispatcher. A frame looks like this:
//!
//! ```text
//! begin_frame()                 process releases, acquire, wait fence, begin primary
//!   dispatch_compute_calls()    optional, outside render passes
//!   begin_render_pass(fb)
//!     queue_draw_calls(..)      parallel secondaries, replayed in order
//!   end_render_pass()
//! end_frame()                   barrier, submit, present, telemetry
//! ```
//!
//! Swapchain resizes are requested by `resize`, by an out of date acquire or
//! by a suboptimal present, and performed from [`RenderSystem::update`] at
//! most once per configured interval.

use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;
use forge_core::{RendererConfig, TaskScheduler};
use forge_rhi::{
    BackbufferSync, CommandBuffer, CommandPool, GpuDevice, NativeObject, PipelineCacheStore,
    Presenter, RenderPassBegin, Semaphore, Submission,
};
use tracing::{debug, error, info, trace, warn};

use crate::dispatcher::{DispatchStats, DrawCallDispatcher};
use crate::error::RenderResult;
use crate::memory::{GpuMemoryManager, PoolType};
use crate::release_queue::DeferredReleaseQueue;
use crate::resource::framebuffer::backbuffer_name;
use crate::resource::{
    ComputeCall, DrawCall, Framebuffer, Image, ImageDesc, Ref, ResourceContext, ResourceKind,
    Resources, draw_call,
};
use crate::sampler::Samplers;
use crate::uniforms::UniformManager;

/// Where the control thread is within a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    /// The primary buffer is recording, outside any render pass.
    Recording,
    /// The primary buffer is inside a render pass with secondary contents.
    InRenderPass {
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
    },
}

/// Create the descriptor pool every draw and compute call allocates from.
pub(crate) fn create_descriptor_pool(device: &dyn GpuDevice) -> RenderResult<vk::DescriptorPool> {
    let sets = (DrawCall::CAPACITY + ComputeCall::CAPACITY) as u32;
    let sizes = [
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            descriptor_count: DrawCall::CAPACITY as u32,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: DrawCall::CAPACITY as u32,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: 4 * sets,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count: 4 * ComputeCall::CAPACITY as u32,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_IMAGE,
            descriptor_count: 4 * ComputeCall::CAPACITY as u32,
        },
    ];
    let info = vk::DescriptorPoolCreateInfo::default()
        .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
        .max_sets(sets)
        .pool_sizes(&sizes);
    Ok(device.create_descriptor_pool(&info)?)
}

/// Stages and access masks for a backbuffer layout transition.
fn backbuffer_barrier(
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> (
    vk::PipelineStageFlags,
    vk::PipelineStageFlags,
    vk::ImageMemoryBarrier<'static>,
) {
    let (src_stage, src_access, dst_stage, dst_access) = match (old_layout, new_layout) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL) => (
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ),
        (vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL, vk::ImageLayout::PRESENT_SRC_KHR) => (
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::AccessFlags::empty(),
        ),
        _ => unreachable!("unsupported backbuffer transition {old_layout:?} -> {new_layout:?}"),
    };

    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(1),
        )
        .src_access_mask(src_access)
        .dst_access_mask(dst_access);
    (src_stage, dst_stage, barrier)
}

/// Primary command buffer and synchronization of one backbuffer.
struct BackbufferFrame {
    pool: CommandPool,
    primary: vk::CommandBuffer,
    sync: BackbufferSync,
}

impl BackbufferFrame {
    fn new(device: &Arc<dyn GpuDevice>) -> RenderResult<Self> {
        let pool = CommandPool::new(device.clone())?;
        let primary = pool.allocate_primary()?;
        let sync = BackbufferSync::new(device.clone())?;
        Ok(Self {
            pool,
            primary,
            sync,
        })
    }
}

/// Owner of the renderer core and driver of its frame loop.
///
/// # Drop order
///
/// `Drop` waits for the device and releases every resource before the
/// fields holding sync objects, pools and uniform buffers are dropped.
pub struct RenderSystem {
    device: Arc<dyn GpuDevice>,
    presenter: Box<dyn Presenter>,
    config: RendererConfig,

    memory: GpuMemoryManager,
    release_queue: DeferredReleaseQueue,
    uniforms: UniformManager,
    samplers: Samplers,
    descriptor_pool: vk::DescriptorPool,
    upload_pool: CommandPool,
    resources: Resources,
    backbuffers: Vec<Ref<Image>>,

    frames: Vec<BackbufferFrame>,
    /// Rotated per frame; the image index is unknown before acquiring.
    acquire_semaphores: Vec<Semaphore>,
    acquire_index: usize,
    dispatcher: DrawCallDispatcher,

    state: FrameState,
    backbuffer_index: u32,
    frame_count: u64,

    resize_pending: bool,
    /// Set by an out of date acquire; frames are skipped until the resize.
    out_of_date: bool,
    requested_extent: Option<vk::Extent2D>,
    /// Seconds since the last resize, `None` before the first one.
    since_resize: Option<f32>,
    resize_count: u32,

    shut_down: bool,
}

impl RenderSystem {
    /// Build the renderer core on top of `device` and `presenter`.
    pub fn new(
        device: Arc<dyn GpuDevice>,
        presenter: Box<dyn Presenter>,
        scheduler: Arc<dyn TaskScheduler>,
        config: &RendererConfig,
    ) -> RenderResult<Self> {
        config.validate()?;

        let backbuffer_count = presenter.image_count();
        let mut memory = GpuMemoryManager::new(device.clone(), config.page_size_bytes);
        let uniforms = UniformManager::new(device.clone(), &mut memory, &config.uniforms, backbuffer_count)?;
        let samplers = Samplers::new(device.clone())?;
        let descriptor_pool = create_descriptor_pool(device.as_ref())?;
        let upload_pool = CommandPool::new_transient(device.clone())?;

        let frames = (0..backbuffer_count)
            .map(|_| BackbufferFrame::new(&device))
            .collect::<RenderResult<Vec<_>>>()?;
        let acquire_semaphores = (0..backbuffer_count)
            .map(|_| Semaphore::new(device.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        let dispatcher = DrawCallDispatcher::new(
            device.clone(),
            scheduler,
            backbuffer_count,
            config.secondary_command_buffers_per_frame,
        );

        let mut system = Self {
            device,
            presenter,
            config: config.clone(),
            memory,
            release_queue: DeferredReleaseQueue::new(),
            uniforms,
            samplers,
            descriptor_pool,
            upload_pool,
            resources: Resources::new(),
            backbuffers: Vec::new(),
            frames,
            acquire_semaphores,
            acquire_index: 0,
            dispatcher,
            state: FrameState::Idle,
            backbuffer_index: 0,
            frame_count: 0,
            resize_pending: false,
            out_of_date: false,
            requested_extent: None,
            since_resize: None,
            resize_count: 0,
            shut_down: false,
        };
        system.sync_backbuffer_images()?;

        let extent = system.presenter.extent();
        info!(
            "Render system ready: {} backbuffers at {}x{}, {} workers",
            backbuffer_count,
            extent.width,
            extent.height,
            system.dispatcher.worker_count()
        );
        Ok(system)
    }

    /// Borrow the resource registry together with a context for creating or
    /// releasing device objects.
    pub fn split(&mut self) -> (&mut Resources, ResourceContext<'_>) {
        let ctx = ResourceContext {
            device: &self.device,
            memory: &mut self.memory,
            release_queue: &mut self.release_queue,
            uniforms: &mut self.uniforms,
            samplers: &self.samplers,
            descriptor_pool: self.descriptor_pool,
            upload_pool: &self.upload_pool,
            backbuffer_extent: self.presenter.extent(),
            backbuffer_format: self.presenter.format(),
            backbuffer_count: self.presenter.image_count(),
        };
        (&mut self.resources, ctx)
    }

    /// Create (or re-create) the device objects of `handles`.
    pub fn create_resources<K: ResourceKind>(&mut self, handles: &[Ref<K>]) -> RenderResult<()> {
        let (resources, mut ctx) = self.split();
        resources.create_resources(&mut ctx, handles)
    }

    /// Queue the device objects of `handles` for deferred release.
    pub fn destroy_resources<K: ResourceKind>(&mut self, handles: &[Ref<K>]) {
        let (resources, mut ctx) = self.split();
        resources.destroy_resources(&mut ctx, handles);
    }

    pub fn resources(&self) -> &Resources {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut Resources {
        &mut self.resources
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub fn memory(&self) -> &GpuMemoryManager {
        &self.memory
    }

    pub fn uniforms(&self) -> &UniformManager {
        &self.uniforms
    }

    pub fn release_queue(&self) -> &DeferredReleaseQueue {
        &self.release_queue
    }

    pub fn dispatcher(&self) -> &DrawCallDispatcher {
        &self.dispatcher
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Frames submitted so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Swapchain rebuilds performed so far.
    pub fn resize_count(&self) -> u32 {
        self.resize_count
    }

    pub fn is_resize_pending(&self) -> bool {
        self.resize_pending
    }

    /// Backbuffer of the current (or last) frame.
    pub fn backbuffer_index(&self) -> u32 {
        self.backbuffer_index
    }

    pub fn backbuffer_count(&self) -> u32 {
        self.presenter.image_count()
    }

    pub fn backbuffer_extent(&self) -> vk::Extent2D {
        self.presenter.extent()
    }

    pub fn backbuffer_format(&self) -> vk::Format {
        self.presenter.format()
    }

    /// The `Image` resource wrapping backbuffer `index`.
    pub fn backbuffer(&self, index: u32) -> Ref<Image> {
        self.backbuffers[index as usize]
    }

    fn primary(&self) -> CommandBuffer<'_> {
        CommandBuffer::new(
            self.device.as_ref(),
            self.frames[self.backbuffer_index as usize].primary,
        )
    }

    // =========================================================================
    // Frame
    // =========================================================================

    /// Start a frame.
    ///
    /// Returns `false` when no image could be acquired; the frame must then
    /// be skipped entirely. Nothing has been recorded in that case.
    ///
    /// # Panics
    ///
    /// Panics if the previous frame was not ended.
    pub fn begin_frame(&mut self) -> RenderResult<bool> {
        assert_eq!(
            self.state,
            FrameState::Idle,
            "begin_frame called while a frame is recording"
        );
        if self.out_of_date {
            return Ok(false);
        }

        let depth = self.presenter.image_count();
        let device = &self.device;
        let released = self
            .release_queue
            .process_queue(depth, |object| device.destroy(object));
        if released > 0 {
            trace!("Destroyed {} released objects", released);
        }

        let acquire = self.acquire_semaphores[self.acquire_index].handle();
        let acquired = match self.presenter.acquire_next_image(acquire) {
            Ok(acquired) => acquired,
            Err(e) if e.is_out_of_date() => {
                debug!("Swapchain out of date on acquire, skipping frame");
                self.out_of_date = true;
                self.request_resize();
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        if acquired.suboptimal {
            self.request_resize();
        }

        let index = acquired.index;
        let frame = &self.frames[index as usize];
        frame.sync.in_flight().wait()?;
        frame.sync.in_flight().reset()?;
        frame.pool.reset()?;

        self.backbuffer_index = index;
        self.dispatcher.begin_frame(index)?;
        self.uniforms.begin_frame(index);

        let primary = self.primary();
        primary.begin()?;
        let image = self.presenter.images()[index as usize];
        let (src, dst, barrier) = backbuffer_barrier(
            image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );
        primary.pipeline_barrier(src, dst, &[barrier]);

        self.state = FrameState::Recording;
        trace!("Frame {} began on backbuffer {}", self.frame_count, index);
        Ok(true)
    }

    /// Begin `framebuffer`'s render pass on the primary buffer. Its contents
    /// come from secondary command buffers.
    pub fn begin_render_pass(&mut self, framebuffer: Ref<Framebuffer>) {
        assert_eq!(
            self.state,
            FrameState::Recording,
            "begin_render_pass outside a frame or inside another render pass"
        );
        let fb_native = self.resources.framebuffers.native(framebuffer);
        let Some(render_pass) = self.resources.framebuffers.desc(framebuffer).render_pass else {
            panic!("{framebuffer:?} has no render pass");
        };
        let rp_native = self.resources.render_passes.native(render_pass);
        let vk_framebuffer = fb_native.framebuffer(self.backbuffer_index);

        self.primary().begin_render_pass(&RenderPassBegin {
            render_pass: rp_native.render_pass,
            framebuffer: vk_framebuffer,
            extent: fb_native.extent,
            clear_values: &rp_native.clear_values,
            contents: vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
        });
        self.state = FrameState::InRenderPass {
            render_pass: rp_native.render_pass,
            framebuffer: vk_framebuffer,
        };
    }

    /// Record `draw_calls` into the current render pass.
    pub fn queue_draw_calls(&mut self, draw_calls: &[Ref<DrawCall>]) -> RenderResult<()> {
        let FrameState::InRenderPass {
            render_pass,
            framebuffer,
        } = self.state
        else {
            panic!("queue_draw_calls outside a render pass");
        };
        let primary = CommandBuffer::new(
            self.device.as_ref(),
            self.frames[self.backbuffer_index as usize].primary,
        );
        self.dispatcher.queue_draw_calls(
            &self.resources,
            &primary,
            draw_calls,
            render_pass,
            framebuffer,
        )
    }

    pub fn end_render_pass(&mut self) {
        assert!(
            matches!(self.state, FrameState::InRenderPass { .. }),
            "end_render_pass without a render pass"
        );
        self.primary().end_render_pass();
        self.state = FrameState::Recording;
    }

    /// Record compute dispatches. Only valid outside render passes.
    pub fn dispatch_compute_calls(&mut self, compute_calls: &[Ref<ComputeCall>]) {
        assert_eq!(
            self.state,
            FrameState::Recording,
            "dispatch_compute_calls outside a frame or inside a render pass"
        );
        let primary = CommandBuffer::new(
            self.device.as_ref(),
            self.frames[self.backbuffer_index as usize].primary,
        );
        self.dispatcher
            .dispatch_compute_calls(&self.resources, &primary, compute_calls);
    }

    /// Write this frame's per-instance uniforms of `draw_calls` on the
    /// worker pool. See [`draw_call::update_uniform_memory`].
    pub fn update_uniform_memory<T, F>(&self, draw_calls: &[Ref<DrawCall>], data: F)
    where
        T: Pod,
        F: Fn(Ref<DrawCall>) -> T + Sync,
    {
        assert_ne!(self.state, FrameState::Idle, "uniform update outside a frame");
        draw_call::update_uniform_memory(
            &self.resources,
            &self.uniforms,
            self.dispatcher.scheduler(),
            draw_calls,
            data,
        );
    }

    /// Submit and present the frame.
    pub fn end_frame(&mut self) -> RenderResult<DispatchStats> {
        assert_eq!(
            self.state,
            FrameState::Recording,
            "end_frame outside a frame or inside a render pass"
        );
        let stats = self.dispatcher.end_frame();

        let index = self.backbuffer_index as usize;
        let primary = self.primary();
        let image = self.presenter.images()[index];
        let (src, dst, barrier) = backbuffer_barrier(
            image,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );
        primary.pipeline_barrier(src, dst, &[barrier]);
        primary.end()?;

        let frame = &self.frames[index];
        let command_buffers = [frame.primary];
        let wait_semaphores = [self.acquire_semaphores[self.acquire_index].handle()];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [frame.sync.render_finished().handle()];
        self.device.queue_submit(
            &Submission {
                command_buffers: &command_buffers,
                wait_semaphores: &wait_semaphores,
                wait_stages: &wait_stages,
                signal_semaphores: &signal_semaphores,
            },
            frame.sync.in_flight().handle(),
        )?;

        self.state = FrameState::Idle;
        self.acquire_index = (self.acquire_index + 1) % self.acquire_semaphores.len();
        self.frame_count += 1;

        match self
            .presenter
            .present(self.backbuffer_index, &signal_semaphores)
        {
            Ok(false) => {}
            Ok(true) => {
                warn!("Swapchain suboptimal after present");
                self.request_resize();
            }
            Err(e) if e.is_out_of_date() => {
                debug!("Swapchain out of date on present");
                self.request_resize();
            }
            Err(e) => return Err(e.into()),
        }

        self.memory.update_stats();
        Ok(stats)
    }

    // =========================================================================
    // Resize
    // =========================================================================

    /// The surface now has `width` x `height` pixels. Zero sizes (minimized
    /// windows) are ignored.
    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            debug!("Ignoring resize to zero dimensions");
            return;
        }
        self.requested_extent = Some(vk::Extent2D { width, height });
        self.request_resize();
    }

    /// Mark the swapchain for rebuilding on a later [`update`](Self::update).
    pub fn request_resize(&mut self) {
        if !self.resize_pending {
            debug!("Swapchain resize requested");
        }
        self.resize_pending = true;
    }

    /// Advance the resize timer by `delta_secs` and perform a pending resize
    /// when the interval allows it. Returns whether a resize happened.
    ///
    /// Must be called between frames.
    pub fn update(&mut self, delta_secs: f32) -> RenderResult<bool> {
        if let Some(elapsed) = &mut self.since_resize {
            *elapsed += delta_secs;
        }
        if !self.resize_pending {
            return Ok(false);
        }
        let due = self
            .since_resize
            .is_none_or(|elapsed| elapsed >= self.config.resize_interval_secs);
        if !due {
            return Ok(false);
        }
        self.perform_resize()?;
        Ok(true)
    }

    fn perform_resize(&mut self) -> RenderResult<()> {
        assert_eq!(self.state, FrameState::Idle, "resize during a frame");
        self.device.wait_idle()?;

        let old_count = self.presenter.image_count();
        let extent = self
            .requested_extent
            .take()
            .unwrap_or_else(|| self.presenter.extent());
        self.presenter.recreate(extent)?;

        let count = self.presenter.image_count();
        if count != old_count {
            warn!(
                "Backbuffer count changed from {} to {}; uniform regions stay at {}",
                old_count,
                count,
                self.uniforms.region_count()
            );
            self.frames = (0..count)
                .map(|_| BackbufferFrame::new(&self.device))
                .collect::<RenderResult<Vec<_>>>()?;
            self.acquire_semaphores = (0..count)
                .map(|_| Semaphore::new(self.device.clone()))
                .collect::<Result<Vec<_>, _>>()?;
            self.dispatcher.set_backbuffer_count(count);
        }
        self.acquire_index = 0;
        self.backbuffer_index = 0;

        for pool in PoolType::ALL {
            if pool.is_resolution_dependent() {
                self.memory.reset_pool(pool);
            }
        }
        self.sync_backbuffer_images()?;
        {
            let (resources, mut ctx) = self.split();
            resources.recreate_resolution_dependent(&mut ctx)?;
        }

        // Idle device: nothing released so far can still be in use.
        let device = &self.device;
        self.release_queue.flush(|object| device.destroy(object));

        self.resize_pending = false;
        self.out_of_date = false;
        self.since_resize = Some(0.0);
        self.resize_count += 1;
        let extent = self.presenter.extent();
        info!(
            "Swapchain resized to {}x{} ({} backbuffers)",
            extent.width, extent.height, count
        );
        Ok(())
    }

    /// Make `backbuffer0..N` match the presenter's images.
    ///
    /// Existing wrappers get their new image handle and are rebuilt by
    /// `recreate_resolution_dependent`; new wrappers are created here.
    fn sync_backbuffer_images(&mut self) -> RenderResult<()> {
        let images = self.presenter.images().to_vec();

        while self.backbuffers.len() > images.len() {
            if let Some(stale) = self.backbuffers.pop() {
                self.destroy_resources(&[stale]);
                self.resources.destroy(stale);
            }
        }

        let mut created = Vec::new();
        for (index, &image) in images.iter().enumerate() {
            match self.backbuffers.get(index) {
                Some(&existing) => self.resources.desc_mut(existing).external = Some(image),
                None => {
                    let handle = self.resources.create::<Image>(&backbuffer_name(index as u32));
                    self.resources.reset_to_default(handle);
                    *self.resources.desc_mut(handle) = ImageDesc {
                        format: vk::Format::UNDEFINED,
                        usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
                        external: Some(image),
                        ..Default::default()
                    };
                    self.backbuffers.push(handle);
                    created.push(handle);
                }
            }
        }
        if !created.is_empty() {
            self.create_resources(&created)?;
            debug!("Registered {} backbuffer images", created.len());
        }
        Ok(())
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Wait for the GPU and destroy every device object the core owns.
    ///
    /// Called by `Drop`; calling it earlier surfaces errors instead of
    /// logging them.
    pub fn shutdown(&mut self) -> RenderResult<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        self.device.wait_idle()?;

        if let Some(dir) = &self.config.pipeline_cache_dir {
            let uuid = self.device.info().pipeline_cache_uuid;
            match self.device.pipeline_cache_data() {
                Ok(data) => {
                    if let Err(e) = PipelineCacheStore::new(dir).store(&uuid, &data) {
                        warn!("Failed to store pipeline cache: {}", e);
                    }
                }
                Err(e) => warn!("Failed to read pipeline cache: {}", e),
            }
        }

        {
            let (resources, mut ctx) = self.split();
            resources.destroy_all(&mut ctx);
        }
        self.backbuffers.clear();

        let device = &self.device;
        let flushed = self.release_queue.flush(|object| device.destroy(object));
        self.device
            .destroy(NativeObject::DescriptorPool(self.descriptor_pool));
        self.memory.destroy();

        info!(
            "Render system shut down after {} frames ({} objects flushed)",
            self.frame_count, flushed
        );
        Ok(())
    }
}

impl Drop for RenderSystem {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Render system shutdown failed: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::InlineScheduler;
    use forge_rhi::headless::{HeadlessDevice, HeadlessPresenter, RecordedCommand};

    fn system(images: u32) -> (Arc<HeadlessDevice>, RenderSystem) {
        let headless = Arc::new(HeadlessDevice::new());
        let presenter = HeadlessPresenter::new(
            &headless,
            images,
            vk::Extent2D {
                width: 320,
                height: 240,
            },
        );
        let config = RendererConfig {
            page_size_bytes: 4 * 1024 * 1024,
            uniforms: forge_core::UniformConfig {
                small_block_count: 256,
                large_block_count: 16,
                material_block_count: 64,
                ..Default::default()
            },
            ..Default::default()
        };
        let system = RenderSystem::new(
            headless.clone(),
            Box::new(presenter),
            Arc::new(InlineScheduler::new(2)),
            &config,
        )
        .unwrap();
        (headless, system)
    }

    #[test]
    fn test_backbuffers_are_registered_as_images() {
        let (_headless, system) = system(3);
        for index in 0..3 {
            let image = system.backbuffer(index);
            assert_eq!(
                system.resources().get_by_name::<Image>(&backbuffer_name(index)),
                Some(image)
            );
            assert_eq!(
                system.resources().native(image).image,
                system.presenter.images()[index as usize]
            );
        }
    }

    #[test]
    fn test_empty_frame_transitions_and_submits() {
        let (headless, mut system) = system(2);
        assert!(system.begin_frame().unwrap());
        assert_eq!(system.state(), FrameState::Recording);
        let primary = system.frames[0].primary;
        system.end_frame().unwrap();
        assert_eq!(system.state(), FrameState::Idle);

        let layouts: Vec<_> = headless
            .commands(primary)
            .into_iter()
            .filter_map(|c| match c {
                RecordedCommand::Barrier { new_layouts } => Some(new_layouts),
                _ => None,
            })
            .collect();
        assert_eq!(
            layouts,
            vec![
                vec![vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL],
                vec![vk::ImageLayout::PRESENT_SRC_KHR]
            ]
        );
        assert_eq!(headless.submissions(), vec![vec![primary]]);
        assert_eq!(system.frame_count(), 1);
    }

    #[test]
    fn test_backbuffer_index_follows_presenter() {
        let (_headless, mut system) = system(3);
        for expected in [0, 1, 2, 0] {
            assert!(system.begin_frame().unwrap());
            assert_eq!(system.backbuffer_index(), expected);
            system.end_frame().unwrap();
        }
    }

    #[test]
    #[should_panic(expected = "end_frame outside a frame")]
    fn test_end_frame_without_begin_panics() {
        let (_headless, mut system) = system(2);
        let _ = system.end_frame();
    }

    #[test]
    #[should_panic(expected = "begin_frame called while a frame is recording")]
    fn test_nested_begin_frame_panics() {
        let (_headless, mut system) = system(2);
        system.begin_frame().unwrap();
        let _ = system.begin_frame();
    }

    #[test]
    fn test_zero_resize_is_ignored() {
        let (_headless, mut system) = system(2);
        system.resize(0, 600);
        assert!(!system.is_resize_pending());
        assert!(!system.update(0.016).unwrap());
    }

    #[test]
    fn test_shutdown_destroys_descriptor_pool_once() {
        let (headless, mut system) = system(2);
        let pool = system.descriptor_pool;
        system.shutdown().unwrap();
        system.shutdown().unwrap();
        let destroyed = headless
            .destroyed_objects()
            .into_iter()
            .filter(|o| *o == NativeObject::DescriptorPool(pool))
            .count();
        assert_eq!(destroyed, 1);
        assert_eq!(headless.live_memory_allocations(), 0);
    }
}
