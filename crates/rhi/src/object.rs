//! Native object taxonomy.
//!
//! Every device object the core may destroy is named here, so destruction can
//! be deferred and later dispatched by type without any dynamic typing.

use ash::vk;
use ash::vk::Handle;

/// A raw device object together with its type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NativeObject {
    Buffer(vk::Buffer),
    Image(vk::Image),
    ImageView(vk::ImageView),
    Sampler(vk::Sampler),
    DeviceMemory(vk::DeviceMemory),
    ShaderModule(vk::ShaderModule),
    DescriptorSetLayout(vk::DescriptorSetLayout),
    DescriptorPool(vk::DescriptorPool),
    /// Descriptor sets are returned to the pool they were allocated from.
    DescriptorSet {
        pool: vk::DescriptorPool,
        set: vk::DescriptorSet,
    },
    PipelineLayout(vk::PipelineLayout),
    Pipeline(vk::Pipeline),
    RenderPass(vk::RenderPass),
    Framebuffer(vk::Framebuffer),
    Semaphore(vk::Semaphore),
    Fence(vk::Fence),
    CommandPool(vk::CommandPool),
}

impl NativeObject {
    /// Vulkan type name, for logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            NativeObject::Buffer(_) => "VkBuffer",
            NativeObject::Image(_) => "VkImage",
            NativeObject::ImageView(_) => "VkImageView",
            NativeObject::Sampler(_) => "VkSampler",
            NativeObject::DeviceMemory(_) => "VkDeviceMemory",
            NativeObject::ShaderModule(_) => "VkShaderModule",
            NativeObject::DescriptorSetLayout(_) => "VkDescriptorSetLayout",
            NativeObject::DescriptorPool(_) => "VkDescriptorPool",
            NativeObject::DescriptorSet { .. } => "VkDescriptorSet",
            NativeObject::PipelineLayout(_) => "VkPipelineLayout",
            NativeObject::Pipeline(_) => "VkPipeline",
            NativeObject::RenderPass(_) => "VkRenderPass",
            NativeObject::Framebuffer(_) => "VkFramebuffer",
            NativeObject::Semaphore(_) => "VkSemaphore",
            NativeObject::Fence(_) => "VkFence",
            NativeObject::CommandPool(_) => "VkCommandPool",
        }
    }

    /// The raw handle values; the second one is only used by descriptor sets.
    pub fn raw_handles(&self) -> (u64, u64) {
        match *self {
            NativeObject::Buffer(h) => (h.as_raw(), 0),
            NativeObject::Image(h) => (h.as_raw(), 0),
            NativeObject::ImageView(h) => (h.as_raw(), 0),
            NativeObject::Sampler(h) => (h.as_raw(), 0),
            NativeObject::DeviceMemory(h) => (h.as_raw(), 0),
            NativeObject::ShaderModule(h) => (h.as_raw(), 0),
            NativeObject::DescriptorSetLayout(h) => (h.as_raw(), 0),
            NativeObject::DescriptorPool(h) => (h.as_raw(), 0),
            NativeObject::DescriptorSet { pool, set } => (set.as_raw(), pool.as_raw()),
            NativeObject::PipelineLayout(h) => (h.as_raw(), 0),
            NativeObject::Pipeline(h) => (h.as_raw(), 0),
            NativeObject::RenderPass(h) => (h.as_raw(), 0),
            NativeObject::Framebuffer(h) => (h.as_raw(), 0),
            NativeObject::Semaphore(h) => (h.as_raw(), 0),
            NativeObject::Fence(h) => (h.as_raw(), 0),
            NativeObject::CommandPool(h) => (h.as_raw(), 0),
        }
    }

    /// True for null handles, which are never worth queueing for release.
    pub fn is_null(&self) -> bool {
        self.raw_handles().0 == 0
    }
}
