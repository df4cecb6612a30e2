//! Per-instance and per-material uniform memory.
//!
//! Per-instance data lives in one persistently mapped buffer split into
//! regions. Backbuffer `i` writes only region `i % regions`, so a region is
//! never written while the GPU may still read it. Every region hands out
//! fixed-size blocks from two [`BoundedPageStack`]s (small and large) which
//! draw calls pop concurrently while recording; the stacks are refilled once
//! per frame.
//!
//! Per-material blocks live in a second buffer. They are claimed when a draw
//! call is created and returned through a frame-delayed free list.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ash::vk;
use forge_core::UniformConfig;
use forge_rhi::{GpuDevice, NativeObject};
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::error::{RenderError, RenderResult};
use crate::memory::{AllocationInfo, GpuMemoryManager, PoolType};
use crate::release_queue::DeferredReleaseQueue;

/// Size class of a per-instance block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlockClass {
    Small,
    Large,
}

/// Lock-free stack over an immutable array of block offsets.
///
/// Popping only moves an atomic length down, so any number of threads may
/// pop at once. Refilling needs exclusive access.
#[derive(Debug)]
pub struct BoundedPageStack {
    pages: Box<[u32]>,
    len: AtomicUsize,
}

impl BoundedPageStack {
    pub fn new(pages: Vec<u32>) -> Self {
        let len = AtomicUsize::new(pages.len());
        Self {
            pages: pages.into_boxed_slice(),
            len,
        }
    }

    /// Take the top entry, or `None` when empty.
    pub fn pop(&self) -> Option<u32> {
        self.len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |len| len.checked_sub(1))
            .ok()
            .map(|previous| self.pages[previous - 1])
    }

    /// Make every entry available again.
    pub fn refill(&mut self) {
        *self.len.get_mut() = self.pages.len();
    }

    pub fn available(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.pages.len()
    }
}

#[derive(Debug)]
struct InstanceRegion {
    base: u32,
    small: BoundedPageStack,
    large: BoundedPageStack,
}

/// A buffer with memory from the static staging pool.
#[derive(Clone, Copy, Debug)]
struct MappedBuffer {
    buffer: vk::Buffer,
    allocation: AllocationInfo,
}

impl MappedBuffer {
    fn new(
        device: &dyn GpuDevice,
        memory: &mut GpuMemoryManager,
        size: vk::DeviceSize,
    ) -> RenderResult<Self> {
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(vk::BufferUsageFlags::UNIFORM_BUFFER)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = device.create_buffer(&info)?;
        match memory.bind_buffer(PoolType::StaticStagingBuffers, buffer) {
            Ok(allocation) => Ok(Self { buffer, allocation }),
            Err(e) => {
                device.destroy(NativeObject::Buffer(buffer));
                Err(e)
            }
        }
    }

    /// # Safety
    ///
    /// `offset + data.len()` must lie in the buffer and no one else may
    /// touch that range until the GPU has consumed it.
    unsafe fn write(&self, offset: usize, data: &[u8]) {
        let Some(mapped) = self.allocation.mapped else {
            unreachable!("staging pools are always mapped");
        };
        // SAFETY: upheld by the caller.
        unsafe { mapped.add(offset).write(data) }
    }
}

/// Owner of the uniform buffers and their block allocators.
pub struct UniformManager {
    device: Arc<dyn GpuDevice>,
    instance: MappedBuffer,
    material: MappedBuffer,
    regions: Vec<InstanceRegion>,
    current: usize,
    small_block_size: u32,
    large_block_size: u32,
    material_block_size: u32,
    material_free: Mutex<Vec<u32>>,
    material_releases: DeferredReleaseQueue<u32>,
    release_depth: u32,
}

impl UniformManager {
    /// Create both buffers. `backbuffer_count` sets the minimum region count
    /// and the delay before a freed material block is reused.
    pub fn new(
        device: Arc<dyn GpuDevice>,
        memory: &mut GpuMemoryManager,
        config: &UniformConfig,
        backbuffer_count: u32,
    ) -> RenderResult<Self> {
        let alignment = device.info().min_uniform_buffer_offset_alignment.max(1);
        for (what, size) in [
            ("small_block_size", config.small_block_size),
            ("large_block_size", config.large_block_size),
            ("material_block_size", config.material_block_size),
        ] {
            if size == 0 || size as vk::DeviceSize % alignment != 0 {
                return Err(RenderError::Core(forge_core::Error::Config(format!(
                    "uniforms.{what} ({size}) must be a non-zero multiple of the device uniform alignment ({alignment})"
                ))));
            }
        }

        let region_count = config.per_instance_buffer_count.max(backbuffer_count).max(1);
        let region_size = config.per_instance_region_size();
        if region_size * region_count as u64 > memory.page_size() {
            return Err(RenderError::Core(forge_core::Error::Config(format!(
                "{region_count} uniform regions of {region_size} bytes do not fit into one {} byte page",
                memory.page_size()
            ))));
        }
        let instance = MappedBuffer::new(
            device.as_ref(),
            memory,
            region_size * region_count as u64,
        )?;
        let material = match MappedBuffer::new(
            device.as_ref(),
            memory,
            config.per_material_buffer_size().max(1),
        ) {
            Ok(material) => material,
            Err(e) => {
                device.destroy(NativeObject::Buffer(instance.buffer));
                return Err(e);
            }
        };

        let small_bytes = config.small_block_size * config.small_block_count;
        let regions = (0..region_count)
            .map(|r| {
                // Stacks pop from the end; reverse so blocks go out in address order.
                let small = (0..config.small_block_count)
                    .rev()
                    .map(|i| i * config.small_block_size)
                    .collect();
                let large = (0..config.large_block_count)
                    .rev()
                    .map(|i| small_bytes + i * config.large_block_size)
                    .collect();
                InstanceRegion {
                    base: r * region_size as u32,
                    small: BoundedPageStack::new(small),
                    large: BoundedPageStack::new(large),
                }
            })
            .collect();

        info!(
            "Uniform memory: {} regions of {} bytes, {} material blocks",
            region_count, region_size, config.material_block_count
        );

        Ok(Self {
            device,
            instance,
            material,
            regions,
            current: 0,
            small_block_size: config.small_block_size,
            large_block_size: config.large_block_size,
            material_block_size: config.material_block_size,
            material_free: Mutex::new((0..config.material_block_count).rev().collect()),
            material_releases: DeferredReleaseQueue::new(),
            release_depth: backbuffer_count,
        })
    }

    /// Switch to the region of `backbuffer_index` and refill it.
    ///
    /// The fence of that backbuffer must have been waited on, so the GPU no
    /// longer reads the region.
    pub fn begin_frame(&mut self, backbuffer_index: u32) {
        self.current = backbuffer_index as usize % self.regions.len();
        let region = &mut self.regions[self.current];
        region.small.refill();
        region.large.refill();

        let free = self.material_free.get_mut();
        let recycled = self
            .material_releases
            .process_queue(self.release_depth, |block| free.push(block));
        if recycled > 0 {
            trace!("Recycled {} material blocks", recycled);
        }
    }

    pub fn block_size(&self, class: BlockClass) -> u32 {
        match class {
            BlockClass::Small => self.small_block_size,
            BlockClass::Large => self.large_block_size,
        }
    }

    /// Smallest block class that holds `size` bytes.
    pub fn class_for(&self, size: usize) -> BlockClass {
        if size <= self.small_block_size as usize {
            BlockClass::Small
        } else {
            BlockClass::Large
        }
    }

    /// Claim a block in the current region, copy `data` into it and return
    /// its dynamic offset. Safe to call from many threads at once.
    ///
    /// # Panics
    ///
    /// Panics when `data` exceeds the block size or the region has no free
    /// block of that class left this frame.
    pub fn write_instance(&self, class: BlockClass, data: &[u8]) -> u32 {
        let size = self.block_size(class);
        assert!(
            data.len() <= size as usize,
            "{} bytes of instance data exceed the {:?} block size of {}",
            data.len(),
            class,
            size
        );
        let region = &self.regions[self.current];
        let stack = match class {
            BlockClass::Small => &region.small,
            BlockClass::Large => &region.large,
        };
        let Some(offset) = stack.pop() else {
            panic!(
                "per-instance uniform region exhausted: all {} {:?} blocks in use",
                stack.capacity(),
                class
            );
        };
        let dynamic_offset = region.base + offset;
        // SAFETY: the block was popped by this call alone, lies inside the
        // region and the region is not read by the GPU this frame.
        unsafe { self.instance.write(dynamic_offset as usize, data) };
        dynamic_offset
    }

    /// Free blocks of `class` left in the current region.
    pub fn available_instance_blocks(&self, class: BlockClass) -> usize {
        let region = &self.regions[self.current];
        match class {
            BlockClass::Small => region.small.available(),
            BlockClass::Large => region.large.available(),
        }
    }

    /// Claim a per-material block.
    ///
    /// # Panics
    ///
    /// Panics when every block is in use.
    pub fn allocate_material_block(&self) -> u32 {
        let Some(block) = self.material_free.lock().pop() else {
            panic!("per-material uniform blocks exhausted");
        };
        block
    }

    /// Copy `data` into material `block`.
    ///
    /// Only blocks no in-flight frame reads may be written, which holds for
    /// blocks claimed after the last frame was submitted.
    pub fn write_material(&self, block: u32, data: &[u8]) {
        assert!(
            data.len() <= self.material_block_size as usize,
            "{} bytes of material data exceed the block size of {}",
            data.len(),
            self.material_block_size
        );
        let offset = self.material_offset(block);
        assert!(
            offset + self.material_block_size as u64 <= self.material.allocation.size,
            "material block {block} out of range"
        );
        // SAFETY: bounds checked above; the block is owned by one draw call.
        unsafe { self.material.write(offset as usize, data) };
    }

    /// Return `block` once every frame that might read it has finished.
    pub fn release_material_block(&mut self, block: u32) {
        self.material_releases.release(block);
    }

    pub fn material_offset(&self, block: u32) -> vk::DeviceSize {
        block as vk::DeviceSize * self.material_block_size as vk::DeviceSize
    }

    pub fn material_block_size(&self) -> u32 {
        self.material_block_size
    }

    pub fn instance_buffer(&self) -> vk::Buffer {
        self.instance.buffer
    }

    pub fn material_buffer(&self) -> vk::Buffer {
        self.material.buffer
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }
}

impl Drop for UniformManager {
    fn drop(&mut self) {
        self.device.destroy(NativeObject::Buffer(self.instance.buffer));
        self.device.destroy(NativeObject::Buffer(self.material.buffer));
        debug!("Destroyed uniform buffers");
    }
}
