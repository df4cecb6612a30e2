//! [`GpuDevice`] over a real `ash::Device`.
//!
//! Queues are externally synchronized in Vulkan; submissions and presents go
//! through `queue_lock`. Everything else is either thread-safe by the API
//! (object creation) or restricted by the caller (per-pool recording).

use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::instance::Instance;
use super::physical_device::PhysicalDeviceInfo;
use crate::device::{DeviceInfo, GpuDevice, Inheritance, MemoryType, RenderPassBegin, Submission};
use crate::error::{RhiError, RhiResult};
use crate::object::NativeObject;

/// Logical device with its graphics and present queues.
pub struct VulkanDevice {
    device: ash::Device,
    physical: PhysicalDeviceInfo,
    info: DeviceInfo,
    memory_types: Vec<MemoryType>,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    queue_lock: Mutex<()>,
    pipeline_cache: vk::PipelineCache,
    // Dropped after the device is destroyed.
    instance: Arc<Instance>,
}

impl VulkanDevice {
    /// Create the logical device.
    ///
    /// `initial_cache` seeds the pipeline cache; the driver validates the
    /// blob and starts empty if it rejects it.
    pub fn new(
        instance: Arc<Instance>,
        physical: PhysicalDeviceInfo,
        initial_cache: Option<&[u8]>,
    ) -> RhiResult<Self> {
        let (Some(graphics_family), Some(present_family)) = (
            physical.queue_families.graphics_family,
            physical.queue_families.present_family,
        ) else {
            return Err(RhiError::NoSuitableGpu);
        };

        let priorities = [1.0f32];
        let queue_infos: Vec<_> = physical
            .queue_families
            .unique_families()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
            })
            .collect();

        let extensions = [ash::khr::swapchain::NAME.as_ptr()];
        let features = vk::PhysicalDeviceFeatures::default();
        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe {
            instance
                .handle()
                .create_device(physical.device, &create_info, None)?
        };
        let graphics_queue = unsafe { device.get_device_queue(graphics_family, 0) };
        let present_queue = unsafe { device.get_device_queue(present_family, 0) };

        let cache_info = vk::PipelineCacheCreateInfo::default()
            .initial_data(initial_cache.unwrap_or_default());
        let pipeline_cache = match unsafe { device.create_pipeline_cache(&cache_info, None) } {
            Ok(cache) => cache,
            Err(e) => {
                warn!("Pipeline cache rejected ({e}), starting empty");
                unsafe {
                    device.create_pipeline_cache(&vk::PipelineCacheCreateInfo::default(), None)?
                }
            }
        };

        info!(
            "Logical device created on '{}' (graphics family {}, present family {})",
            physical.device_name(),
            graphics_family,
            present_family
        );

        Ok(Self {
            info: physical.device_info(),
            memory_types: physical.memory_types(),
            device,
            physical,
            graphics_queue,
            present_queue,
            queue_lock: Mutex::new(()),
            pipeline_cache,
            instance,
        })
    }

    #[inline]
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    #[inline]
    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    #[inline]
    pub fn physical(&self) -> &PhysicalDeviceInfo {
        &self.physical
    }

    /// Run `f` with exclusive access to the present queue.
    pub(crate) fn with_present_queue<R>(&self, f: impl FnOnce(vk::Queue) -> R) -> R {
        let _guard = self.queue_lock.lock();
        f(self.present_queue)
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_pipeline_cache(self.pipeline_cache, None);
            self.device.destroy_device(None);
        }
        info!("Logical device destroyed");
    }
}

impl GpuDevice for VulkanDevice {
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
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        let memory = unsafe { self.device.allocate_memory(&info, None)? };
        debug!("Allocated {size} bytes from memory type {memory_type_index}");
        Ok(memory)
    }

    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        size: vk::DeviceSize,
    ) -> RhiResult<NonNull<u8>> {
        let ptr = unsafe {
            self.device
                .map_memory(memory, 0, size, vk::MemoryMapFlags::empty())?
        };
        NonNull::new(ptr.cast::<u8>()).ok_or(RhiError::VulkanError(vk::Result::ERROR_MEMORY_MAP_FAILED))
    }

    fn create_buffer(&self, info: &vk::BufferCreateInfo<'_>) -> RhiResult<vk::Buffer> {
        Ok(unsafe { self.device.create_buffer(info, None)? })
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.device.get_buffer_memory_requirements(buffer) }
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> RhiResult<()> {
        Ok(unsafe { self.device.bind_buffer_memory(buffer, memory, offset)? })
    }

    fn create_image(&self, info: &vk::ImageCreateInfo<'_>) -> RhiResult<vk::Image> {
        Ok(unsafe { self.device.create_image(info, None)? })
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        unsafe { self.device.get_image_memory_requirements(image) }
    }

    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> RhiResult<()> {
        Ok(unsafe { self.device.bind_image_memory(image, memory, offset)? })
    }

    fn create_image_view(&self, info: &vk::ImageViewCreateInfo<'_>) -> RhiResult<vk::ImageView> {
        Ok(unsafe { self.device.create_image_view(info, None)? })
    }

    fn create_sampler(&self, info: &vk::SamplerCreateInfo<'_>) -> RhiResult<vk::Sampler> {
        Ok(unsafe { self.device.create_sampler(info, None)? })
    }

    fn create_shader_module(&self, code: &[u32]) -> RhiResult<vk::ShaderModule> {
        let info = vk::ShaderModuleCreateInfo::default().code(code);
        Ok(unsafe { self.device.create_shader_module(&info, None)? })
    }

    fn create_descriptor_set_layout(
        &self,
        info: &vk::DescriptorSetLayoutCreateInfo<'_>,
    ) -> RhiResult<vk::DescriptorSetLayout> {
        Ok(unsafe { self.device.create_descriptor_set_layout(info, None)? })
    }

    fn create_descriptor_pool(
        &self,
        info: &vk::DescriptorPoolCreateInfo<'_>,
    ) -> RhiResult<vk::DescriptorPool> {
        Ok(unsafe { self.device.create_descriptor_pool(info, None)? })
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> RhiResult<vk::DescriptorSet> {
        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let mut sets = unsafe { self.device.allocate_descriptor_sets(&info)? };
        sets.pop()
            .ok_or(RhiError::VulkanError(vk::Result::ERROR_OUT_OF_POOL_MEMORY))
    }

    fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]) {
        unsafe { self.device.update_descriptor_sets(writes, &[]) }
    }

    fn create_pipeline_layout(
        &self,
        info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> RhiResult<vk::PipelineLayout> {
        Ok(unsafe { self.device.create_pipeline_layout(info, None)? })
    }

    fn create_graphics_pipeline(
        &self,
        info: &vk::GraphicsPipelineCreateInfo<'_>,
    ) -> RhiResult<vk::Pipeline> {
        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(self.pipeline_cache, std::slice::from_ref(info), None)
                .map_err(|(_, e)| e)?
        };
        pipelines
            .into_iter()
            .next()
            .ok_or(RhiError::VulkanError(vk::Result::ERROR_UNKNOWN))
    }

    fn create_compute_pipeline(
        &self,
        info: &vk::ComputePipelineCreateInfo<'_>,
    ) -> RhiResult<vk::Pipeline> {
        let pipelines = unsafe {
            self.device
                .create_compute_pipelines(self.pipeline_cache, std::slice::from_ref(info), None)
                .map_err(|(_, e)| e)?
        };
        pipelines
            .into_iter()
            .next()
            .ok_or(RhiError::VulkanError(vk::Result::ERROR_UNKNOWN))
    }

    fn create_render_pass(
        &self,
        info: &vk::RenderPassCreateInfo<'_>,
    ) -> RhiResult<vk::RenderPass> {
        Ok(unsafe { self.device.create_render_pass(info, None)? })
    }

    fn create_framebuffer(
        &self,
        info: &vk::FramebufferCreateInfo<'_>,
    ) -> RhiResult<vk::Framebuffer> {
        Ok(unsafe { self.device.create_framebuffer(info, None)? })
    }

    fn destroy(&self, object: NativeObject) {
        if object.is_null() {
            return;
        }
        let d = &self.device;
        unsafe {
            match object {
                NativeObject::Buffer(h) => d.destroy_buffer(h, None),
                NativeObject::Image(h) => d.destroy_image(h, None),
                NativeObject::ImageView(h) => d.destroy_image_view(h, None),
                NativeObject::Sampler(h) => d.destroy_sampler(h, None),
                NativeObject::DeviceMemory(h) => d.free_memory(h, None),
                NativeObject::ShaderModule(h) => d.destroy_shader_module(h, None),
                NativeObject::DescriptorSetLayout(h) => d.destroy_descriptor_set_layout(h, None),
                NativeObject::DescriptorPool(h) => d.destroy_descriptor_pool(h, None),
                NativeObject::DescriptorSet { pool, set } => {
                    if let Err(e) = d.free_descriptor_sets(pool, &[set]) {
                        warn!("Failed to free descriptor set: {e}");
                    }
                }
                NativeObject::PipelineLayout(h) => d.destroy_pipeline_layout(h, None),
                NativeObject::Pipeline(h) => d.destroy_pipeline(h, None),
                NativeObject::RenderPass(h) => d.destroy_render_pass(h, None),
                NativeObject::Framebuffer(h) => d.destroy_framebuffer(h, None),
                NativeObject::Semaphore(h) => d.destroy_semaphore(h, None),
                NativeObject::Fence(h) => d.destroy_fence(h, None),
                NativeObject::CommandPool(h) => d.destroy_command_pool(h, None),
            }
        }
    }

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore> {
        Ok(unsafe {
            self.device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)?
        })
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        Ok(unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default().flags(flags), None)?
        })
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> RhiResult<()> {
        Ok(unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns)? })
    }

    fn reset_fence(&self, fence: vk::Fence) -> RhiResult<()> {
        Ok(unsafe { self.device.reset_fences(&[fence])? })
    }

    fn fence_signaled(&self, fence: vk::Fence) -> RhiResult<bool> {
        Ok(unsafe { self.device.get_fence_status(fence)? })
    }

    fn create_command_pool(
        &self,
        flags: vk::CommandPoolCreateFlags,
    ) -> RhiResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::default()
            .flags(flags)
            .queue_family_index(self.info.graphics_queue_family);
        Ok(unsafe { self.device.create_command_pool(&info, None)? })
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> RhiResult<()> {
        Ok(unsafe {
            self.device
                .reset_command_pool(pool, vk::CommandPoolResetFlags::empty())?
        })
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> RhiResult<Vec<vk::CommandBuffer>> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(level)
            .command_buffer_count(count);
        Ok(unsafe { self.device.allocate_command_buffers(&info)? })
    }

    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        usage: vk::CommandBufferUsageFlags,
        inheritance: Option<&Inheritance>,
    ) -> RhiResult<()> {
        let inheritance_info = inheritance.map(|i| {
            vk::CommandBufferInheritanceInfo::default()
                .render_pass(i.render_pass)
                .subpass(i.subpass)
                .framebuffer(i.framebuffer)
        });
        let mut begin_info = vk::CommandBufferBeginInfo::default().flags(usage);
        if let Some(info) = inheritance_info.as_ref() {
            begin_info = begin_info.inheritance_info(info);
        }
        Ok(unsafe { self.device.begin_command_buffer(cmd, &begin_info)? })
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> RhiResult<()> {
        Ok(unsafe { self.device.end_command_buffer(cmd)? })
    }

    fn cmd_begin_render_pass(&self, cmd: vk::CommandBuffer, begin: &RenderPassBegin<'_>) {
        let info = vk::RenderPassBeginInfo::default()
            .render_pass(begin.render_pass)
            .framebuffer(begin.framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: begin.extent,
            })
            .clear_values(begin.clear_values);
        unsafe {
            self.device
                .cmd_begin_render_pass(cmd, &info, begin.contents)
        }
    }

    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_render_pass(cmd) }
    }

    fn cmd_bind_pipeline(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        unsafe { self.device.cmd_bind_pipeline(cmd, bind_point, pipeline) }
    }

    fn cmd_bind_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                cmd,
                bind_point,
                layout,
                first_set,
                sets,
                dynamic_offsets,
            )
        }
    }

    fn cmd_bind_vertex_buffers(
        &self,
        cmd: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) {
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(cmd, first_binding, buffers, offsets)
        }
    }

    fn cmd_bind_index_buffer(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        unsafe {
            self.device
                .cmd_bind_index_buffer(cmd, buffer, offset, index_type)
        }
    }

    fn cmd_draw(
        &self,
        cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        unsafe {
            self.device
                .cmd_draw(cmd, vertex_count, instance_count, first_vertex, first_instance)
        }
    }

    fn cmd_draw_indexed(
        &self,
        cmd: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw_indexed(
                cmd,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        }
    }

    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        unsafe { self.device.cmd_dispatch(cmd, x, y, z) }
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        unsafe { self.device.cmd_copy_buffer(cmd, src, dst, regions) }
    }

    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                image_barriers,
            )
        }
    }

    fn cmd_execute_commands(&self, cmd: vk::CommandBuffer, secondaries: &[vk::CommandBuffer]) {
        if secondaries.is_empty() {
            return;
        }
        unsafe { self.device.cmd_execute_commands(cmd, secondaries) }
    }

    fn queue_submit(&self, submission: &Submission<'_>, fence: vk::Fence) -> RhiResult<()> {
        let info = vk::SubmitInfo::default()
            .command_buffers(submission.command_buffers)
            .wait_semaphores(submission.wait_semaphores)
            .wait_dst_stage_mask(submission.wait_stages)
            .signal_semaphores(submission.signal_semaphores);
        let _guard = self.queue_lock.lock();
        Ok(unsafe {
            self.device
                .queue_submit(self.graphics_queue, &[info], fence)?
        })
    }

    fn wait_idle(&self) -> RhiResult<()> {
        let _guard = self.queue_lock.lock();
        Ok(unsafe { self.device.device_wait_idle()? })
    }

    fn pipeline_cache(&self) -> vk::PipelineCache {
        self.pipeline_cache
    }

    fn pipeline_cache_data(&self) -> RhiResult<Vec<u8>> {
        Ok(unsafe { self.device.get_pipeline_cache_data(self.pipeline_cache)? })
    }
}
