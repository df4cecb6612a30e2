//! Descriptor set allocation and updates shared by draw and compute calls.

use ash::vk;
use forge_rhi::GpuDevice;

use crate::error::RenderResult;

/// Writes collected for one descriptor set, applied in a single update.
#[derive(Default)]
pub(crate) struct DescriptorWrites {
    buffers: Vec<(u32, vk::DescriptorType, vk::DescriptorBufferInfo)>,
    images: Vec<(u32, vk::DescriptorType, vk::DescriptorImageInfo)>,
}

impl DescriptorWrites {
    pub fn buffer(
        &mut self,
        binding: u32,
        ty: vk::DescriptorType,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) {
        self.buffers.push((
            binding,
            ty,
            vk::DescriptorBufferInfo {
                buffer,
                offset,
                range,
            },
        ));
    }

    pub fn image(
        &mut self,
        binding: u32,
        ty: vk::DescriptorType,
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    ) {
        self.images.push((
            binding,
            ty,
            vk::DescriptorImageInfo {
                sampler,
                image_view: view,
                image_layout: layout,
            },
        ));
    }

    /// Allocate a set with `layout` from `pool` and write everything into it.
    pub fn allocate_and_apply(
        &self,
        device: &dyn GpuDevice,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> RenderResult<vk::DescriptorSet> {
        let set = device.allocate_descriptor_set(pool, layout)?;

        let buffer_writes = self.buffers.iter().map(|(binding, ty, info)| {
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(*binding)
                .descriptor_type(*ty)
                .buffer_info(std::slice::from_ref(info))
        });
        let image_writes = self.images.iter().map(|(binding, ty, info)| {
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(*binding)
                .descriptor_type(*ty)
                .image_info(std::slice::from_ref(info))
        });
        let writes: Vec<_> = buffer_writes.chain(image_writes).collect();
        if !writes.is_empty() {
            device.update_descriptor_sets(&writes);
        }
        Ok(set)
    }
}

