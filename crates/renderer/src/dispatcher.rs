//! Parallel draw call recording.
//!
//! [`DrawCallDispatcher::queue_draw_calls`] splits a sorted list of draw
//! calls into contiguous batches, records every batch into its own secondary
//! command buffer on the task scheduler, waits for all of them and then
//! executes the secondaries into the primary buffer in batch order. Recording
//! order across threads is therefore irrelevant to the submitted result.
//!
//! Every secondary buffer has its own command pool, because pools may only
//! be used from one thread at a time. Pools are kept per backbuffer and reset
//! when that backbuffer comes around again.

use std::sync::Arc;

use ash::vk;
use forge_core::{TaskScheduler, fork_join};
use forge_rhi::{CommandBuffer, CommandPool, GpuDevice, Inheritance};
use tracing::{debug, trace};

use crate::error::RenderResult;
use crate::resource::{ComputeCall, DrawCall, Ref, Resources};

/// Draw calls per batch: `max(1, count / workers)`.
///
/// A remainder forms one extra, shorter batch, so there are
/// `count.div_ceil(batch)` batches.
pub fn batch_size(count: usize, workers: usize) -> usize {
    (count / workers.max(1)).max(1)
}

/// Per-frame dispatcher counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub draw_calls: u32,
    pub dispatch_calls: u32,
    pub batches: u32,
}

struct SecondarySlot {
    pool: CommandPool,
    buffer: vk::CommandBuffer,
}

/// Records draw calls into secondary command buffers on worker threads.
pub struct DrawCallDispatcher {
    device: Arc<dyn GpuDevice>,
    scheduler: Arc<dyn TaskScheduler>,
    /// Secondary buffers per backbuffer, created on first use.
    slots: Vec<Vec<SecondarySlot>>,
    /// Secondaries recorded during the last frame of each backbuffer.
    recorded: Vec<usize>,
    max_secondaries: usize,
    backbuffer_index: usize,
    used: usize,
    stats: DispatchStats,
}

impl DrawCallDispatcher {
    pub fn new(
        device: Arc<dyn GpuDevice>,
        scheduler: Arc<dyn TaskScheduler>,
        backbuffer_count: u32,
        max_secondaries: u32,
    ) -> Self {
        debug!(
            "Draw call dispatcher: {} workers, {} secondaries per backbuffer",
            scheduler.worker_count(),
            max_secondaries
        );
        let mut dispatcher = Self {
            device,
            scheduler,
            slots: Vec::new(),
            recorded: Vec::new(),
            max_secondaries: max_secondaries as usize,
            backbuffer_index: 0,
            used: 0,
            stats: DispatchStats::default(),
        };
        dispatcher.set_backbuffer_count(backbuffer_count);
        dispatcher
    }

    /// Follow a swapchain whose image count changed. The device must be idle.
    pub fn set_backbuffer_count(&mut self, count: u32) {
        let count = count.max(1) as usize;
        self.slots.resize_with(count, Vec::new);
        self.recorded.resize(count, 0);
        self.backbuffer_index = self.backbuffer_index.min(count - 1);
    }

    /// Start recording for `backbuffer_index`, whose fence has been waited on.
    pub fn begin_frame(&mut self, backbuffer_index: u32) -> RenderResult<()> {
        let index = backbuffer_index as usize;
        assert!(
            index < self.slots.len(),
            "backbuffer {index} out of range ({} backbuffers)",
            self.slots.len()
        );
        for slot in &self.slots[index][..self.recorded[index]] {
            slot.pool.reset()?;
        }
        self.recorded[index] = 0;
        self.backbuffer_index = index;
        self.used = 0;
        self.stats = DispatchStats::default();
        Ok(())
    }

    /// Finish the frame and return its counters.
    ///
    /// Recording joins inside every `queue_draw_calls`, so no task can still
    /// be running here.
    pub fn end_frame(&mut self) -> DispatchStats {
        self.recorded[self.backbuffer_index] = self.used;
        trace!(
            "Dispatched {} draw calls in {} batches, {} compute dispatches",
            self.stats.draw_calls, self.stats.batches, self.stats.dispatch_calls
        );
        self.stats
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    pub fn worker_count(&self) -> usize {
        self.scheduler.worker_count()
    }

    pub fn scheduler(&self) -> &dyn TaskScheduler {
        self.scheduler.as_ref()
    }

    /// Record `draw_calls` in parallel and execute them into `primary`,
    /// which must be inside `render_pass` with secondary contents.
    ///
    /// # Panics
    ///
    /// Panics when the frame would need more secondary buffers than
    /// configured.
    pub fn queue_draw_calls(
        &mut self,
        resources: &Resources,
        primary: &CommandBuffer<'_>,
        draw_calls: &[Ref<DrawCall>],
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
    ) -> RenderResult<()> {
        if draw_calls.is_empty() {
            return Ok(());
        }

        let count = draw_calls.len();
        let batch = batch_size(count, self.scheduler.worker_count());
        let batches = count.div_ceil(batch);
        assert!(
            self.used + batches <= self.max_secondaries,
            "secondary command buffers exhausted: {} in use, {} more needed, {} per frame",
            self.used,
            batches,
            self.max_secondaries
        );
        let buffers = self.claim_secondaries(batches)?;

        let inheritance = Inheritance {
            render_pass,
            subpass: 0,
            framebuffer,
        };
        let device = self.device.as_ref();
        let results = fork_join(self.scheduler.as_ref(), batches, |i| {
            let range = i * batch..((i + 1) * batch).min(count);
            record_batch(device, resources, buffers[i], &inheritance, &draw_calls[range])
        });
        for result in results {
            result?;
        }

        primary.execute_commands(&buffers);

        self.used += batches;
        self.stats.batches += batches as u32;
        self.stats.draw_calls += count as u32;
        trace!("Queued {} draw calls in {} batches of {}", count, batches, batch);
        Ok(())
    }

    /// Record compute dispatches straight into `primary`, outside any
    /// render pass.
    pub fn dispatch_compute_calls(
        &mut self,
        resources: &Resources,
        primary: &CommandBuffer<'_>,
        compute_calls: &[Ref<ComputeCall>],
    ) {
        for &call in compute_calls {
            let desc = resources.compute_calls.desc(call);
            let native = resources.compute_calls.native(call);
            let Some(pipeline) = desc.pipeline else {
                panic!("{call:?} has no pipeline");
            };
            let pipeline = resources.pipelines.native(pipeline);

            primary.bind_pipeline(vk::PipelineBindPoint::COMPUTE, pipeline.pipeline);
            primary.bind_descriptor_sets(
                vk::PipelineBindPoint::COMPUTE,
                pipeline.layout,
                0,
                &[native.descriptor_set],
                &[],
            );
            let [x, y, z] = desc.group_count;
            primary.dispatch(x, y, z);
        }
        self.stats.dispatch_calls += compute_calls.len() as u32;
    }

    /// The next `count` secondary buffers of the current backbuffer.
    fn claim_secondaries(&mut self, count: usize) -> RenderResult<Vec<vk::CommandBuffer>> {
        let slots = &mut self.slots[self.backbuffer_index];
        while slots.len() < self.used + count {
            let pool = CommandPool::new(self.device.clone())?;
            let buffer = pool.allocate_secondary()?;
            slots.push(SecondarySlot { pool, buffer });
        }
        Ok(slots[self.used..self.used + count]
            .iter()
            .map(|slot| slot.buffer)
            .collect())
    }
}

/// Record one contiguous batch into a secondary buffer. Runs on a worker.
fn record_batch(
    device: &dyn GpuDevice,
    resources: &Resources,
    buffer: vk::CommandBuffer,
    inheritance: &Inheritance,
    batch: &[Ref<DrawCall>],
) -> RenderResult<()> {
    let cmd = CommandBuffer::new(device, buffer);
    cmd.begin_secondary(inheritance)?;

    let mut bound = vk::Pipeline::null();
    for &draw_call in batch {
        let desc = resources.draw_calls.desc(draw_call);
        let native = resources.draw_calls.native(draw_call);
        debug_assert!(
            resources.draw_calls.has_native(draw_call),
            "{draw_call:?} queued without device objects"
        );
        let Some(pipeline) = desc.pipeline else {
            panic!("{draw_call:?} has no pipeline");
        };
        let pipeline = resources.pipelines.native(pipeline);

        // Sorted input makes runs of one pipeline common.
        if pipeline.pipeline != bound {
            cmd.bind_pipeline(pipeline.bind_point, pipeline.pipeline);
            bound = pipeline.pipeline;
        }
        cmd.bind_descriptor_sets(
            pipeline.bind_point,
            pipeline.layout,
            0,
            &[native.descriptor_set],
            native.dynamic_offsets().as_slice(),
        );
        if !native.vertex_buffers.is_empty() {
            cmd.bind_vertex_buffers(0, &native.vertex_buffers, &native.vertex_offsets);
        }
        if native.index_buffer != vk::Buffer::null() {
            cmd.bind_index_buffer(native.index_buffer, 0, desc.index_type);
            cmd.draw_indexed(desc.index_count, desc.instance_count);
        } else {
            cmd.draw(desc.vertex_count, desc.instance_count);
        }
    }

    cmd.end()?;
    Ok(())
}
