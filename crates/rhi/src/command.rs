//! Command pool and command buffer management.
//!
//! - [`CommandPool`] owns a VkCommandPool and allocates command buffers from it
//! - [`CommandBuffer`] borrows the device and records into one VkCommandBuffer
//!
//! # Thread Safety
//!
//! Command pools are externally synchronized. Buffers recorded concurrently
//! must come from distinct pools; the renderer gives every secondary command
//! buffer slot its own pool.

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::device::{GpuDevice, Inheritance, RenderPassBegin};
use crate::error::RhiResult;
use crate::object::NativeObject;

/// Owned command pool on the graphics queue family.
pub struct CommandPool {
    device: Arc<dyn GpuDevice>,
    pool: vk::CommandPool,
}

impl CommandPool {
    /// Creates a pool whose buffers can be reset individually.
    pub fn new(device: Arc<dyn GpuDevice>) -> RhiResult<Self> {
        let pool = device.create_command_pool(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)?;
        debug!("Command pool created");
        Ok(Self { device, pool })
    }

    /// Creates a pool for short-lived, record-once buffers.
    pub fn new_transient(device: Arc<dyn GpuDevice>) -> RhiResult<Self> {
        let pool = device.create_command_pool(
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER
                | vk::CommandPoolCreateFlags::TRANSIENT,
        )?;
        debug!("Transient command pool created");
        Ok(Self { device, pool })
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    pub fn allocate_primary(&self) -> RhiResult<vk::CommandBuffer> {
        self.allocate(vk::CommandBufferLevel::PRIMARY)
    }

    pub fn allocate_secondary(&self) -> RhiResult<vk::CommandBuffer> {
        self.allocate(vk::CommandBufferLevel::SECONDARY)
    }

    fn allocate(&self, level: vk::CommandBufferLevel) -> RhiResult<vk::CommandBuffer> {
        let mut buffers = self.device.allocate_command_buffers(self.pool, level, 1)?;
        buffers.pop().ok_or(crate::RhiError::VulkanError(
            vk::Result::ERROR_OUT_OF_HOST_MEMORY,
        ))
    }

    /// Return every buffer of the pool to the initial state.
    pub fn reset(&self) -> RhiResult<()> {
        self.device.reset_command_pool(self.pool)
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        self.device.destroy(NativeObject::CommandPool(self.pool));
        debug!("Command pool destroyed");
    }
}

/// Recording view over a command buffer.
///
/// Does not own the handle; the buffer is freed with its pool.
#[derive(Clone, Copy)]
pub struct CommandBuffer<'a> {
    device: &'a dyn GpuDevice,
    buffer: vk::CommandBuffer,
}

impl<'a> CommandBuffer<'a> {
    #[inline]
    pub fn new(device: &'a dyn GpuDevice, buffer: vk::CommandBuffer) -> Self {
        Self { device, buffer }
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer
    }

    // =========================================================================
    // Recording Control
    // =========================================================================

    /// Begin a primary buffer for one-time submission.
    pub fn begin(&self) -> RhiResult<()> {
        self.device.begin_command_buffer(
            self.buffer,
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            None,
        )
    }

    /// Begin a secondary buffer that continues `inheritance`'s render pass.
    pub fn begin_secondary(&self, inheritance: &Inheritance) -> RhiResult<()> {
        self.device.begin_command_buffer(
            self.buffer,
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
                | vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE,
            Some(inheritance),
        )
    }

    pub fn end(&self) -> RhiResult<()> {
        self.device.end_command_buffer(self.buffer)
    }

    // =========================================================================
    // Render Passes
    // =========================================================================

    pub fn begin_render_pass(&self, begin: &RenderPassBegin<'_>) {
        self.device.cmd_begin_render_pass(self.buffer, begin);
    }

    pub fn end_render_pass(&self) {
        self.device.cmd_end_render_pass(self.buffer);
    }

    // =========================================================================
    // Binding
    // =========================================================================

    pub fn bind_pipeline(&self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        self.device.cmd_bind_pipeline(self.buffer, bind_point, pipeline);
    }

    pub fn bind_descriptor_sets(
        &self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        self.device.cmd_bind_descriptor_sets(
            self.buffer,
            bind_point,
            layout,
            first_set,
            sets,
            dynamic_offsets,
        );
    }

    pub fn bind_vertex_buffers(
        &self,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) {
        self.device
            .cmd_bind_vertex_buffers(self.buffer, first_binding, buffers, offsets);
    }

    pub fn bind_index_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        self.device
            .cmd_bind_index_buffer(self.buffer, buffer, offset, index_type);
    }

    // =========================================================================
    // Work
    // =========================================================================

    pub fn draw(&self, vertex_count: u32, instance_count: u32) {
        self.device
            .cmd_draw(self.buffer, vertex_count, instance_count, 0, 0);
    }

    pub fn draw_indexed(&self, index_count: u32, instance_count: u32) {
        self.device
            .cmd_draw_indexed(self.buffer, index_count, instance_count, 0, 0, 0);
    }

    pub fn dispatch(&self, x: u32, y: u32, z: u32) {
        self.device.cmd_dispatch(self.buffer, x, y, z);
    }

    pub fn copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        self.device.cmd_copy_buffer(self.buffer, src, dst, regions);
    }

    pub fn pipeline_barrier(
        &self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        self.device
            .cmd_pipeline_barrier(self.buffer, src_stage, dst_stage, image_barriers);
    }

    /// Replay recorded secondary buffers into this primary buffer.
    pub fn execute_commands(&self, secondaries: &[vk::CommandBuffer]) {
        self.device.cmd_execute_commands(self.buffer, secondaries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{HeadlessDevice, RecordedCommand};

    #[test]
    fn test_recording_goes_through_device() {
        let headless = Arc::new(HeadlessDevice::new());
        let device: Arc<dyn GpuDevice> = headless.clone();
        let pool = CommandPool::new(device.clone()).unwrap();
        let handle = pool.allocate_primary().unwrap();

        let cmd = CommandBuffer::new(device.as_ref(), handle);
        cmd.begin().unwrap();
        cmd.draw(3, 1);
        cmd.end().unwrap();

        let log = headless.commands(handle);
        assert!(matches!(log[0], RecordedCommand::Begin { secondary: false, .. }));
        assert!(matches!(
            log[1],
            RecordedCommand::Draw {
                vertex_count: 3,
                instance_count: 1
            }
        ));
        assert!(matches!(log[2], RecordedCommand::End));
    }

    #[test]
    fn test_pool_drop_destroys_pool() {
        let headless = Arc::new(HeadlessDevice::new());
        let pool = CommandPool::new_transient(headless.clone()).unwrap();
        let handle = pool.handle();
        drop(pool);
        assert!(headless
            .destroyed_objects()
            .contains(&NativeObject::CommandPool(handle)));
    }

    #[test]
    fn test_command_types_are_send() {
        fn assert_send<T: Send>() {}
        assert_send::<CommandPool>();
        assert_send::<CommandBuffer<'static>>();
    }
}
