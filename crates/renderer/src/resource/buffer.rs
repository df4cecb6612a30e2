//! Buffers.
//!
//! Host-visible buffers live in the staging pools and take their initial data
//! through the persistent mapping. Device-local buffers are filled by a copy
//! from a temporary staging buffer in the volatile pool, which is reset as
//! soon as the copy retired.

use std::sync::Arc;

use ash::vk;
use forge_rhi::{CommandBuffer, Fence, NativeObject, Submission};
use tracing::{debug, trace};

use super::{ResourceContext, ResourceKind, Resources, invalid};
use crate::error::RenderResult;
use crate::memory::{AllocationInfo, MemoryLocation, PoolType};

/// Marker for the buffer kind.
pub enum Buffer {}

#[derive(Clone, Debug)]
pub struct BufferDesc {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
    /// Allocate from the pools that are reset on swapchain resize.
    pub resolution_dependent: bool,
    /// Copied into the buffer right after creation.
    pub initial_data: Option<Arc<[u8]>>,
}

impl Default for BufferDesc {
    fn default() -> Self {
        Self {
            size: 0,
            usage: vk::BufferUsageFlags::VERTEX_BUFFER,
            location: MemoryLocation::DeviceLocal,
            resolution_dependent: false,
            initial_data: None,
        }
    }
}

impl BufferDesc {
    /// Pool the buffer memory comes from.
    pub fn pool(&self) -> PoolType {
        match (self.location, self.resolution_dependent) {
            (MemoryLocation::DeviceLocal, false) => PoolType::StaticBuffers,
            (MemoryLocation::DeviceLocal, true) => PoolType::ResolutionDependentBuffers,
            (MemoryLocation::HostVisible, false) => PoolType::StaticStagingBuffers,
            (MemoryLocation::HostVisible, true) => PoolType::ResolutionDependentStagingBuffers,
        }
    }
}

#[derive(Debug, Default)]
pub struct BufferNative {
    pub buffer: vk::Buffer,
    pub allocation: Option<AllocationInfo>,
}

impl ResourceKind for Buffer {
    type Desc = BufferDesc;
    type Native = BufferNative;

    const NAME: &'static str = "Buffer";
    const CAPACITY: usize = 1024;

    fn create_native(
        _resources: &Resources,
        ctx: &mut ResourceContext<'_>,
        name: &str,
        desc: &BufferDesc,
    ) -> RenderResult<BufferNative> {
        if desc.size == 0 {
            return Err(invalid::<Self>(name, "size is zero"));
        }
        if let Some(data) = &desc.initial_data
            && data.len() as vk::DeviceSize > desc.size
        {
            return Err(invalid::<Self>(
                name,
                format!("{} bytes of initial data exceed the size of {}", data.len(), desc.size),
            ));
        }

        let mut usage = desc.usage;
        if desc.location == MemoryLocation::DeviceLocal && desc.initial_data.is_some() {
            usage |= vk::BufferUsageFlags::TRANSFER_DST;
        }

        let info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = ctx.device.create_buffer(&info)?;
        let allocation = match bind_and_fill(ctx, desc, buffer) {
            Ok(allocation) => allocation,
            Err(e) => {
                ctx.release_queue.release_object(NativeObject::Buffer(buffer));
                return Err(e);
            }
        };

        debug!(
            "Created buffer '{}' ({} bytes, {:?})",
            name,
            desc.size,
            desc.pool()
        );

        Ok(BufferNative {
            buffer,
            allocation: Some(allocation),
        })
    }

    fn release_native(native: BufferNative, ctx: &mut ResourceContext<'_>) {
        ctx.release_queue
            .release_object(NativeObject::Buffer(native.buffer));
    }

    resource_manager_accessors!(buffers);
}

fn bind_and_fill(
    ctx: &mut ResourceContext<'_>,
    desc: &BufferDesc,
    buffer: vk::Buffer,
) -> RenderResult<AllocationInfo> {
    let allocation = ctx.memory.bind_buffer(desc.pool(), buffer)?;
    if let Some(data) = &desc.initial_data {
        match desc.location {
            MemoryLocation::HostVisible => {
                // SAFETY: the allocation is fresh and no GPU work references it yet.
                unsafe { allocation.write(data) };
            }
            MemoryLocation::DeviceLocal => upload(ctx, buffer, data)?,
        }
    }
    Ok(allocation)
}

/// Copy `data` into the device-local `dst` through a staging buffer and wait
/// for the copy to retire.
fn upload(ctx: &mut ResourceContext<'_>, dst: vk::Buffer, data: &[u8]) -> RenderResult<()> {
    let size = data.len() as vk::DeviceSize;
    let info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(vk::BufferUsageFlags::TRANSFER_SRC)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    let staging = ctx.device.create_buffer(&info)?;

    match copy_through_staging(ctx, staging, dst, data) {
        Ok(()) => {
            // The copy retired, so the staging buffer and its memory can go now.
            ctx.device.destroy(NativeObject::Buffer(staging));
            ctx.memory.reset_pool(PoolType::VolatileStagingBuffers);
            trace!("Uploaded {} bytes", size);
            Ok(())
        }
        Err(e) => {
            // The copy may still be in flight.
            ctx.release_queue.release_object(NativeObject::Buffer(staging));
            Err(e)
        }
    }
}

fn copy_through_staging(
    ctx: &mut ResourceContext<'_>,
    staging: vk::Buffer,
    dst: vk::Buffer,
    data: &[u8],
) -> RenderResult<()> {
    let device = ctx.device;
    let size = data.len() as vk::DeviceSize;
    let staging_allocation = ctx
        .memory
        .bind_buffer(PoolType::VolatileStagingBuffers, staging)?;
    // SAFETY: the staging allocation was just made and nothing else uses it.
    unsafe { staging_allocation.write(data) };

    let cmd = CommandBuffer::new(device.as_ref(), ctx.upload_pool.allocate_primary()?);
    cmd.begin()?;
    cmd.copy_buffer(
        staging,
        dst,
        &[vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        }],
    );
    cmd.end()?;

    let fence = Fence::new(device.clone(), false)?;
    let command_buffers = [cmd.handle()];
    device.queue_submit(
        &Submission {
            command_buffers: &command_buffers,
            ..Default::default()
        },
        fence.handle(),
    )?;
    fence.wait()?;
    ctx.upload_pool.reset()?;
    Ok(())
}
