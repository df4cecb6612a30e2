//! In-process backend without a GPU.
//!
//! [`HeadlessDevice`] hands out unique fake handles, backs host-visible memory
//! with real host allocations (so mapped pointers can be written), signals
//! fences as soon as work is submitted and logs every recorded command per
//! command buffer. The log carries a global sequence number, which lets tests
//! reconstruct the order in which commands were recorded across threads.
//!
//! [`HeadlessPresenter`] cycles through a fixed set of fake backbuffers.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use ash::vk;
use ash::vk::Handle;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::device::{
    DeviceInfo, GpuDevice, Inheritance, MemoryType, RenderPassBegin, Submission,
};
use crate::error::{RhiError, RhiResult};
use crate::object::NativeObject;
use crate::present::{AcquiredImage, Presenter};

const HEADLESS_CACHE_UUID: [u8; vk::UUID_SIZE] = *b"forge-headless-0";
const BUFFER_ALIGNMENT: vk::DeviceSize = 256;
const IMAGE_ALIGNMENT: vk::DeviceSize = 4096;

/// A command captured by the headless device.
#[derive(Clone, Debug, PartialEq)]
pub enum RecordedCommand {
    Begin {
        secondary: bool,
        inheritance: Option<Inheritance>,
    },
    End,
    BeginRenderPass {
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        contents: vk::SubpassContents,
    },
    EndRenderPass,
    BindPipeline {
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    },
    BindDescriptorSets {
        layout: vk::PipelineLayout,
        sets: Vec<vk::DescriptorSet>,
        dynamic_offsets: Vec<u32>,
    },
    BindVertexBuffers {
        buffers: Vec<vk::Buffer>,
    },
    BindIndexBuffer {
        buffer: vk::Buffer,
        index_type: vk::IndexType,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        bytes: vk::DeviceSize,
    },
    Barrier {
        new_layouts: Vec<vk::ImageLayout>,
    },
    ExecuteCommands {
        secondaries: Vec<vk::CommandBuffer>,
    },
}

/// A command together with its global recording sequence number.
#[derive(Clone, Debug)]
pub struct SequencedCommand {
    pub sequence: u64,
    pub command: RecordedCommand,
}

#[derive(Default)]
struct HeadlessState {
    host_memory: HashMap<vk::DeviceMemory, Box<[u8]>>,
    live_memory: HashMap<vk::DeviceMemory, vk::DeviceSize>,
    buffer_sizes: HashMap<vk::Buffer, vk::DeviceSize>,
    image_sizes: HashMap<vk::Image, vk::DeviceSize>,
    fences: HashMap<vk::Fence, bool>,
    destroyed: Vec<NativeObject>,
    submissions: Vec<Vec<vk::CommandBuffer>>,
    fail_next_submit: bool,
}

/// Fake device for tests and `--headless` runs.
pub struct HeadlessDevice {
    info: DeviceInfo,
    memory_types: Vec<MemoryType>,
    next_handle: AtomicU64,
    sequence: AtomicU64,
    pipeline_cache: vk::PipelineCache,
    state: Mutex<HeadlessState>,
    commands: Mutex<HashMap<vk::CommandBuffer, Vec<SequencedCommand>>>,
}

impl HeadlessDevice {
    pub fn new() -> Self {
        let memory_types = vec![
            MemoryType {
                property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                heap_index: 0,
            },
            MemoryType {
                property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT,
                heap_index: 1,
            },
            MemoryType {
                property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL
                    | vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT,
                heap_index: 0,
            },
        ];

        let info = DeviceInfo {
            name: "forge headless device".to_string(),
            vendor_id: 0,
            device_id: 0,
            driver_version: 1,
            pipeline_cache_uuid: HEADLESS_CACHE_UUID,
            min_uniform_buffer_offset_alignment: 256,
            graphics_queue_family: 0,
        };

        debug!("Headless device created");

        Self {
            info,
            memory_types,
            next_handle: AtomicU64::new(2),
            sequence: AtomicU64::new(0),
            pipeline_cache: vk::PipelineCache::from_raw(1),
            state: Mutex::new(HeadlessState::default()),
            commands: Mutex::new(HashMap::new()),
        }
    }

    fn next<H: Handle>(&self) -> H {
        H::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn record(&self, cmd: vk::CommandBuffer, command: RecordedCommand) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        trace!(?cmd, ?command, "recorded");
        self.commands
            .lock()
            .entry(cmd)
            .or_default()
            .push(SequencedCommand { sequence, command });
    }

    /// Commands currently recorded into `cmd`.
    pub fn commands(&self, cmd: vk::CommandBuffer) -> Vec<RecordedCommand> {
        self.sequenced_commands(cmd)
            .into_iter()
            .map(|c| c.command)
            .collect()
    }

    /// Commands currently recorded into `cmd`, with sequence numbers.
    pub fn sequenced_commands(&self, cmd: vk::CommandBuffer) -> Vec<SequencedCommand> {
        self.commands.lock().get(&cmd).cloned().unwrap_or_default()
    }

    /// Every object passed to [`GpuDevice::destroy`], in order.
    pub fn destroyed_objects(&self) -> Vec<NativeObject> {
        self.state.lock().destroyed.clone()
    }

    /// Command buffers of every submission so far.
    pub fn submissions(&self) -> Vec<Vec<vk::CommandBuffer>> {
        self.state.lock().submissions.clone()
    }

    /// Make the next queue submission fail with `ERROR_DEVICE_LOST`.
    pub fn fail_next_submit(&self) {
        self.state.lock().fail_next_submit = true;
    }

    /// Device memory allocations not yet freed.
    pub fn live_memory_allocations(&self) -> usize {
        self.state.lock().live_memory.len()
    }

    /// Total bytes of device memory not yet freed.
    pub fn live_memory_bytes(&self) -> vk::DeviceSize {
        self.state.lock().live_memory.values().sum()
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn align_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    value.div_ceil(alignment) * alignment
}

impl GpuDevice for HeadlessDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn memory_types(&self) -> &[MemoryType] {
        &self.memory_types
    }

    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
    ) -> RhiResult<vk::DeviceMemory> {
        let ty = self
            .memory_types
            .get(memory_type_index as usize)
            .ok_or(RhiError::VulkanError(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY))?;
        let memory: vk::DeviceMemory = self.next();

        let mut state = self.state.lock();
        if ty
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
        {
            let bytes = usize::try_from(size)
                .map_err(|_| RhiError::VulkanError(vk::Result::ERROR_OUT_OF_HOST_MEMORY))?;
            state
                .host_memory
                .insert(memory, vec![0u8; bytes].into_boxed_slice());
        }
        state.live_memory.insert(memory, size);
        Ok(memory)
    }

    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        _size: vk::DeviceSize,
    ) -> RhiResult<NonNull<u8>> {
        let mut state = self.state.lock();
        let bytes = state
            .host_memory
            .get_mut(&memory)
            .ok_or(RhiError::VulkanError(vk::Result::ERROR_MEMORY_MAP_FAILED))?;
        NonNull::new(bytes.as_mut_ptr())
            .ok_or(RhiError::VulkanError(vk::Result::ERROR_MEMORY_MAP_FAILED))
    }

    fn create_buffer(&self, info: &vk::BufferCreateInfo<'_>) -> RhiResult<vk::Buffer> {
        let buffer = self.next();
        self.state.lock().buffer_sizes.insert(buffer, info.size);
        Ok(buffer)
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let size = self
            .state
            .lock()
            .buffer_sizes
            .get(&buffer)
            .copied()
            .unwrap_or(0);
        vk::MemoryRequirements {
            size: align_up(size, BUFFER_ALIGNMENT),
            alignment: BUFFER_ALIGNMENT,
            memory_type_bits: u32::MAX >> (32 - self.memory_types.len()),
        }
    }

    fn bind_buffer_memory(
        &self,
        _buffer: vk::Buffer,
        _memory: vk::DeviceMemory,
        _offset: vk::DeviceSize,
    ) -> RhiResult<()> {
        Ok(())
    }

    fn create_image(&self, info: &vk::ImageCreateInfo<'_>) -> RhiResult<vk::Image> {
        let image = self.next();
        let texels = info.extent.width as u64
            * info.extent.height as u64
            * info.extent.depth.max(1) as u64
            * info.array_layers.max(1) as u64;
        // Four bytes per texel, doubled for a full mip chain.
        let mip_factor = if info.mip_levels > 1 { 2 } else { 1 };
        self.state
            .lock()
            .image_sizes
            .insert(image, texels * 4 * mip_factor);
        Ok(image)
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        let size = self
            .state
            .lock()
            .image_sizes
            .get(&image)
            .copied()
            .unwrap_or(0);
        vk::MemoryRequirements {
            size: align_up(size, IMAGE_ALIGNMENT),
            alignment: IMAGE_ALIGNMENT,
            // Images never land in host-visible-only memory.
            memory_type_bits: 0b101,
        }
    }

    fn bind_image_memory(
        &self,
        _image: vk::Image,
        _memory: vk::DeviceMemory,
        _offset: vk::DeviceSize,
    ) -> RhiResult<()> {
        Ok(())
    }

    fn create_image_view(&self, _info: &vk::ImageViewCreateInfo<'_>) -> RhiResult<vk::ImageView> {
        Ok(self.next())
    }

    fn create_sampler(&self, _info: &vk::SamplerCreateInfo<'_>) -> RhiResult<vk::Sampler> {
        Ok(self.next())
    }

    fn create_shader_module(&self, code: &[u32]) -> RhiResult<vk::ShaderModule> {
        if code.is_empty() {
            return Err(RhiError::VulkanError(vk::Result::ERROR_INVALID_SHADER_NV));
        }
        Ok(self.next())
    }

    fn create_descriptor_set_layout(
        &self,
        _info: &vk::DescriptorSetLayoutCreateInfo<'_>,
    ) -> RhiResult<vk::DescriptorSetLayout> {
        Ok(self.next())
    }

    fn create_descriptor_pool(
        &self,
        _info: &vk::DescriptorPoolCreateInfo<'_>,
    ) -> RhiResult<vk::DescriptorPool> {
        Ok(self.next())
    }

    fn allocate_descriptor_set(
        &self,
        _pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
    ) -> RhiResult<vk::DescriptorSet> {
        Ok(self.next())
    }

    fn update_descriptor_sets(&self, _writes: &[vk::WriteDescriptorSet<'_>]) {}

    fn create_pipeline_layout(
        &self,
        _info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> RhiResult<vk::PipelineLayout> {
        Ok(self.next())
    }

    fn create_graphics_pipeline(
        &self,
        _info: &vk::GraphicsPipelineCreateInfo<'_>,
    ) -> RhiResult<vk::Pipeline> {
        Ok(self.next())
    }

    fn create_compute_pipeline(
        &self,
        _info: &vk::ComputePipelineCreateInfo<'_>,
    ) -> RhiResult<vk::Pipeline> {
        Ok(self.next())
    }

    fn create_render_pass(
        &self,
        _info: &vk::RenderPassCreateInfo<'_>,
    ) -> RhiResult<vk::RenderPass> {
        Ok(self.next())
    }

    fn create_framebuffer(
        &self,
        _info: &vk::FramebufferCreateInfo<'_>,
    ) -> RhiResult<vk::Framebuffer> {
        Ok(self.next())
    }

    fn destroy(&self, object: NativeObject) {
        let mut state = self.state.lock();
        match object {
            NativeObject::DeviceMemory(memory) => {
                state.host_memory.remove(&memory);
                state.live_memory.remove(&memory);
            }
            NativeObject::Buffer(buffer) => {
                state.buffer_sizes.remove(&buffer);
            }
            NativeObject::Image(image) => {
                state.image_sizes.remove(&image);
            }
            NativeObject::Fence(fence) => {
                state.fences.remove(&fence);
            }
            _ => {}
        }
        state.destroyed.push(object);
    }

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore> {
        Ok(self.next())
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let fence = self.next();
        self.state.lock().fences.insert(fence, signaled);
        Ok(fence)
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> RhiResult<()> {
        // Nothing can signal the fence later, so an unsignaled wait would hang.
        match self.state.lock().fences.get(&fence) {
            Some(true) => Ok(()),
            Some(false) => Err(RhiError::VulkanError(vk::Result::TIMEOUT)),
            None => Err(RhiError::VulkanError(vk::Result::ERROR_UNKNOWN)),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> RhiResult<()> {
        match self.state.lock().fences.get_mut(&fence) {
            Some(signaled) => {
                *signaled = false;
                Ok(())
            }
            None => Err(RhiError::VulkanError(vk::Result::ERROR_UNKNOWN)),
        }
    }

    fn fence_signaled(&self, fence: vk::Fence) -> RhiResult<bool> {
        self.state
            .lock()
            .fences
            .get(&fence)
            .copied()
            .ok_or(RhiError::VulkanError(vk::Result::ERROR_UNKNOWN))
    }

    fn create_command_pool(
        &self,
        _flags: vk::CommandPoolCreateFlags,
    ) -> RhiResult<vk::CommandPool> {
        Ok(self.next())
    }

    fn reset_command_pool(&self, _pool: vk::CommandPool) -> RhiResult<()> {
        Ok(())
    }

    fn allocate_command_buffers(
        &self,
        _pool: vk::CommandPool,
        _level: vk::CommandBufferLevel,
        count: u32,
    ) -> RhiResult<Vec<vk::CommandBuffer>> {
        Ok((0..count).map(|_| self.next()).collect())
    }

    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        _usage: vk::CommandBufferUsageFlags,
        inheritance: Option<&Inheritance>,
    ) -> RhiResult<()> {
        // Beginning a buffer implicitly resets it.
        self.commands.lock().remove(&cmd);
        self.record(
            cmd,
            RecordedCommand::Begin {
                secondary: inheritance.is_some(),
                inheritance: inheritance.copied(),
            },
        );
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> RhiResult<()> {
        self.record(cmd, RecordedCommand::End);
        Ok(())
    }

    fn cmd_begin_render_pass(&self, cmd: vk::CommandBuffer, begin: &RenderPassBegin<'_>) {
        self.record(
            cmd,
            RecordedCommand::BeginRenderPass {
                render_pass: begin.render_pass,
                framebuffer: begin.framebuffer,
                contents: begin.contents,
            },
        );
    }

    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer) {
        self.record(cmd, RecordedCommand::EndRenderPass);
    }

    fn cmd_bind_pipeline(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        self.record(
            cmd,
            RecordedCommand::BindPipeline {
                bind_point,
                pipeline,
            },
        );
    }

    fn cmd_bind_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        _first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        self.record(
            cmd,
            RecordedCommand::BindDescriptorSets {
                layout,
                sets: sets.to_vec(),
                dynamic_offsets: dynamic_offsets.to_vec(),
            },
        );
    }

    fn cmd_bind_vertex_buffers(
        &self,
        cmd: vk::CommandBuffer,
        _first_binding: u32,
        buffers: &[vk::Buffer],
        _offsets: &[vk::DeviceSize],
    ) {
        self.record(
            cmd,
            RecordedCommand::BindVertexBuffers {
                buffers: buffers.to_vec(),
            },
        );
    }

    fn cmd_bind_index_buffer(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        _offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        self.record(cmd, RecordedCommand::BindIndexBuffer { buffer, index_type });
    }

    fn cmd_draw(
        &self,
        cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        _first_vertex: u32,
        _first_instance: u32,
    ) {
        self.record(
            cmd,
            RecordedCommand::Draw {
                vertex_count,
                instance_count,
            },
        );
    }

    fn cmd_draw_indexed(
        &self,
        cmd: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.record(
            cmd,
            RecordedCommand::DrawIndexed {
                index_count,
                instance_count,
            },
        );
    }

    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        self.record(cmd, RecordedCommand::Dispatch { x, y, z });
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        self.record(
            cmd,
            RecordedCommand::CopyBuffer {
                src,
                dst,
                bytes: regions.iter().map(|r| r.size).sum(),
            },
        );
    }

    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        _src_stage: vk::PipelineStageFlags,
        _dst_stage: vk::PipelineStageFlags,
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        self.record(
            cmd,
            RecordedCommand::Barrier {
                new_layouts: image_barriers.iter().map(|b| b.new_layout).collect(),
            },
        );
    }

    fn cmd_execute_commands(&self, cmd: vk::CommandBuffer, secondaries: &[vk::CommandBuffer]) {
        self.record(
            cmd,
            RecordedCommand::ExecuteCommands {
                secondaries: secondaries.to_vec(),
            },
        );
    }

    fn queue_submit(&self, submission: &Submission<'_>, fence: vk::Fence) -> RhiResult<()> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_submit) {
            return Err(RhiError::VulkanError(vk::Result::ERROR_DEVICE_LOST));
        }
        state.submissions.push(submission.command_buffers.to_vec());
        if fence != vk::Fence::null() {
            match state.fences.get_mut(&fence) {
                Some(signaled) => *signaled = true,
                None => return Err(RhiError::VulkanError(vk::Result::ERROR_UNKNOWN)),
            }
        }
        Ok(())
    }

    fn wait_idle(&self) -> RhiResult<()> {
        Ok(())
    }

    fn pipeline_cache(&self) -> vk::PipelineCache {
        self.pipeline_cache
    }

    fn pipeline_cache_data(&self) -> RhiResult<Vec<u8>> {
        // Same header layout as VK_PIPELINE_CACHE_HEADER_VERSION_ONE.
        let mut data = Vec::with_capacity(32);
        data.extend_from_slice(&32u32.to_le_bytes());
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&self.info.vendor_id.to_le_bytes());
        data.extend_from_slice(&self.info.device_id.to_le_bytes());
        data.extend_from_slice(&self.info.pipeline_cache_uuid);
        Ok(data)
    }
}

/// Test hooks shared between a [`HeadlessPresenter`] and whoever drives it.
#[derive(Default)]
pub struct PresenterControl {
    out_of_date_next_acquire: AtomicBool,
    suboptimal_next_present: AtomicBool,
    presents: AtomicU32,
    recreations: AtomicU32,
}

impl PresenterControl {
    /// Make the next acquire fail with [`RhiError::SwapchainOutOfDate`].
    pub fn fail_next_acquire(&self) {
        self.out_of_date_next_acquire.store(true, Ordering::SeqCst);
    }

    /// Make the next present report a suboptimal swapchain.
    pub fn suboptimal_next_present(&self) {
        self.suboptimal_next_present.store(true, Ordering::SeqCst);
    }

    pub fn present_count(&self) -> u32 {
        self.presents.load(Ordering::SeqCst)
    }

    pub fn recreate_count(&self) -> u32 {
        self.recreations.load(Ordering::SeqCst)
    }
}

/// Fake swapchain with a fixed number of backbuffers.
pub struct HeadlessPresenter {
    images: Vec<vk::Image>,
    extent: vk::Extent2D,
    next_index: u32,
    control: Arc<PresenterControl>,
}

impl HeadlessPresenter {
    pub fn new(device: &HeadlessDevice, image_count: u32, extent: vk::Extent2D) -> Self {
        let images = (0..image_count.max(1)).map(|_| device.next()).collect();
        Self {
            images,
            extent,
            next_index: 0,
            control: Arc::new(PresenterControl::default()),
        }
    }

    pub fn control(&self) -> Arc<PresenterControl> {
        self.control.clone()
    }
}

impl Presenter for HeadlessPresenter {
    fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn format(&self) -> vk::Format {
        vk::Format::B8G8R8A8_UNORM
    }

    fn images(&self) -> &[vk::Image] {
        &self.images
    }

    fn acquire_next_image(&mut self, _signal: vk::Semaphore) -> RhiResult<AcquiredImage> {
        if self
            .control
            .out_of_date_next_acquire
            .swap(false, Ordering::SeqCst)
        {
            return Err(RhiError::SwapchainOutOfDate);
        }
        let index = self.next_index;
        self.next_index = (self.next_index + 1) % self.image_count();
        Ok(AcquiredImage {
            index,
            suboptimal: false,
        })
    }

    fn present(&mut self, _index: u32, _wait: &[vk::Semaphore]) -> RhiResult<bool> {
        self.control.presents.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .control
            .suboptimal_next_present
            .swap(false, Ordering::SeqCst))
    }

    fn recreate(&mut self, extent: vk::Extent2D) -> RhiResult<()> {
        self.extent = extent;
        self.next_index = 0;
        self.control.recreations.fetch_add(1, Ordering::SeqCst);
        debug!("Headless swapchain recreated: {}x{}", extent.width, extent.height);
        Ok(())
    }
}
