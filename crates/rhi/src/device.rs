//! The graphics API boundary.
//!
//! [`GpuDevice`] is the only way the renderer core talks to the GPU. It is a
//! thin, object-safe mirror of the Vulkan device calls the core needs, so the
//! core runs unchanged on the Vulkan backend ([`crate::vulkan::VulkanDevice`])
//! and on the in-process [`crate::headless::HeadlessDevice`].
//!
//! Recording calls (`cmd_*`) take `&self` and may be issued from several
//! threads at once, as long as each thread records into its own command
//! buffer allocated from its own pool.

use std::ptr::NonNull;

use ash::vk;

use crate::error::RhiResult;
use crate::object::NativeObject;

/// One entry of the device memory type table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryType {
    pub property_flags: vk::MemoryPropertyFlags,
    pub heap_index: u32,
}

/// Static facts about the device.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub name: String,
    pub vendor_id: u32,
    pub device_id: u32,
    pub driver_version: u32,
    /// Identifies the layout of pipeline cache blobs produced by this device/driver.
    pub pipeline_cache_uuid: [u8; vk::UUID_SIZE],
    pub min_uniform_buffer_offset_alignment: vk::DeviceSize,
    pub graphics_queue_family: u32,
}

/// Render pass and framebuffer a secondary command buffer is recorded for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Inheritance {
    pub render_pass: vk::RenderPass,
    pub subpass: u32,
    pub framebuffer: vk::Framebuffer,
}

/// Everything needed to start a render pass instance on a primary buffer.
///
/// Not `Debug`: `vk::ClearValue` is a union.
#[derive(Clone, Copy)]
pub struct RenderPassBegin<'a> {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    pub clear_values: &'a [vk::ClearValue],
    pub contents: vk::SubpassContents,
}

/// One queue submission.
#[derive(Clone, Copy, Debug, Default)]
pub struct Submission<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub wait_semaphores: &'a [vk::Semaphore],
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub signal_semaphores: &'a [vk::Semaphore],
}

/// The logical device as seen by the renderer core.
pub trait GpuDevice: Send + Sync {
    fn info(&self) -> &DeviceInfo;

    /// The memory type table, indexed by memory type index.
    fn memory_types(&self) -> &[MemoryType];

    /// First memory type allowed by `type_bits` that has all `required` flags.
    fn find_memory_type(
        &self,
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        self.memory_types()
            .iter()
            .enumerate()
            .find(|(index, ty)| {
                type_bits & (1 << index) != 0 && ty.property_flags.contains(required)
            })
            .map(|(index, _)| index as u32)
    }

    // =========================================================================
    // Memory
    // =========================================================================

    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
    ) -> RhiResult<vk::DeviceMemory>;

    /// Persistently map the whole allocation. The mapping lives until the
    /// memory is freed.
    fn map_memory(&self, memory: vk::DeviceMemory, size: vk::DeviceSize)
    -> RhiResult<NonNull<u8>>;

    // =========================================================================
    // Object creation
    // =========================================================================

    fn create_buffer(&self, info: &vk::BufferCreateInfo<'_>) -> RhiResult<vk::Buffer>;
    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;
    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> RhiResult<()>;

    fn create_image(&self, info: &vk::ImageCreateInfo<'_>) -> RhiResult<vk::Image>;
    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;
    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> RhiResult<()>;
    fn create_image_view(&self, info: &vk::ImageViewCreateInfo<'_>) -> RhiResult<vk::ImageView>;
    fn create_sampler(&self, info: &vk::SamplerCreateInfo<'_>) -> RhiResult<vk::Sampler>;

    fn create_shader_module(&self, code: &[u32]) -> RhiResult<vk::ShaderModule>;

    fn create_descriptor_set_layout(
        &self,
        info: &vk::DescriptorSetLayoutCreateInfo<'_>,
    ) -> RhiResult<vk::DescriptorSetLayout>;
    fn create_descriptor_pool(
        &self,
        info: &vk::DescriptorPoolCreateInfo<'_>,
    ) -> RhiResult<vk::DescriptorPool>;
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> RhiResult<vk::DescriptorSet>;
    fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]);

    fn create_pipeline_layout(
        &self,
        info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> RhiResult<vk::PipelineLayout>;
    fn create_graphics_pipeline(
        &self,
        info: &vk::GraphicsPipelineCreateInfo<'_>,
    ) -> RhiResult<vk::Pipeline>;
    fn create_compute_pipeline(
        &self,
        info: &vk::ComputePipelineCreateInfo<'_>,
    ) -> RhiResult<vk::Pipeline>;
    fn create_render_pass(&self, info: &vk::RenderPassCreateInfo<'_>)
    -> RhiResult<vk::RenderPass>;
    fn create_framebuffer(
        &self,
        info: &vk::FramebufferCreateInfo<'_>,
    ) -> RhiResult<vk::Framebuffer>;

    /// Destroy (or free) a native object immediately.
    ///
    /// The caller guarantees the GPU no longer uses it.
    fn destroy(&self, object: NativeObject);

    // =========================================================================
    // Synchronization
    // =========================================================================

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore>;
    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence>;
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> RhiResult<()>;
    fn reset_fence(&self, fence: vk::Fence) -> RhiResult<()>;
    fn fence_signaled(&self, fence: vk::Fence) -> RhiResult<bool>;

    // =========================================================================
    // Command buffers
    // =========================================================================

    fn create_command_pool(
        &self,
        flags: vk::CommandPoolCreateFlags,
    ) -> RhiResult<vk::CommandPool>;
    fn reset_command_pool(&self, pool: vk::CommandPool) -> RhiResult<()>;
    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> RhiResult<Vec<vk::CommandBuffer>>;

    /// Begin recording. Secondary buffers pass the render pass they continue.
    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        usage: vk::CommandBufferUsageFlags,
        inheritance: Option<&Inheritance>,
    ) -> RhiResult<()>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> RhiResult<()>;

    fn cmd_begin_render_pass(&self, cmd: vk::CommandBuffer, begin: &RenderPassBegin<'_>);
    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer);
    fn cmd_bind_pipeline(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    );
    fn cmd_bind_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    );
    fn cmd_bind_vertex_buffers(
        &self,
        cmd: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    );
    fn cmd_bind_index_buffer(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    );
    fn cmd_draw(
        &self,
        cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );
    fn cmd_draw_indexed(
        &self,
        cmd: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );
    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, x: u32, y: u32, z: u32);
    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );
    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    );
    fn cmd_execute_commands(&self, cmd: vk::CommandBuffer, secondaries: &[vk::CommandBuffer]);

    // =========================================================================
    // Queue
    // =========================================================================

    /// Submit to the graphics queue, signalling `fence` on completion.
    fn queue_submit(&self, submission: &Submission<'_>, fence: vk::Fence) -> RhiResult<()>;

    fn wait_idle(&self) -> RhiResult<()>;

    /// The pipeline cache every pipeline is created through.
    fn pipeline_cache(&self) -> vk::PipelineCache;

    /// Serialized contents of the pipeline cache.
    fn pipeline_cache_data(&self) -> RhiResult<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessDevice;

    #[test]
    fn test_find_memory_type_respects_mask_and_flags() {
        let device = HeadlessDevice::new();
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

        let index = device.find_memory_type(u32::MAX, host).unwrap();
        assert!(device.memory_types()[index as usize].property_flags.contains(host));

        // A mask that excludes every host-visible type finds nothing.
        let device_local_only = device
            .memory_types()
            .iter()
            .enumerate()
            .filter(|(_, ty)| !ty.property_flags.contains(host))
            .fold(0u32, |mask, (i, _)| mask | (1 << i));
        assert_eq!(device.find_memory_type(device_local_only, host), None);
    }

    #[test]
    fn test_device_trait_is_object_safe() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}
        assert_send_sync::<dyn GpuDevice>();
    }
}
