//! Pooled, page-based device memory.
//!
//! Every pool is a list of fixed-size pages, each one device memory
//! allocation with a [`PageAllocator`] cursor. Requests are served first-fit
//! from the existing pages; when none has room a new page is allocated.
//! Single allocations are never freed. A pool is reclaimed as a whole with
//! [`GpuMemoryManager::reset_pool`].
//!
//! # Reset cadence
//!
//! | pool | reset |
//! |---|---|
//! | `Static*` | never while the device lives |
//! | `ResolutionDependent*` | on every swapchain resize |
//! | `VolatileStagingBuffers` | after every completed upload |

use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;
use forge_rhi::{GpuDevice, NativeObject};
use tracing::{debug, info, trace};

use crate::error::RenderResult;
use crate::page_allocator::PageAllocator;

/// Where a pool's pages live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    DeviceLocal,
    /// Host-visible and coherent, persistently mapped.
    HostVisible,
}

impl MemoryLocation {
    pub fn required_flags(self) -> vk::MemoryPropertyFlags {
        match self {
            MemoryLocation::DeviceLocal => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryLocation::HostVisible => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
        }
    }
}

/// Usage class of a memory pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PoolType {
    StaticImages,
    StaticBuffers,
    StaticStagingBuffers,
    ResolutionDependentImages,
    ResolutionDependentBuffers,
    ResolutionDependentStagingBuffers,
    VolatileStagingBuffers,
}

impl PoolType {
    pub const ALL: [PoolType; 7] = [
        PoolType::StaticImages,
        PoolType::StaticBuffers,
        PoolType::StaticStagingBuffers,
        PoolType::ResolutionDependentImages,
        PoolType::ResolutionDependentBuffers,
        PoolType::ResolutionDependentStagingBuffers,
        PoolType::VolatileStagingBuffers,
    ];

    pub fn location(self) -> MemoryLocation {
        match self {
            PoolType::StaticImages
            | PoolType::StaticBuffers
            | PoolType::ResolutionDependentImages
            | PoolType::ResolutionDependentBuffers => MemoryLocation::DeviceLocal,
            PoolType::StaticStagingBuffers
            | PoolType::ResolutionDependentStagingBuffers
            | PoolType::VolatileStagingBuffers => MemoryLocation::HostVisible,
        }
    }

    /// Pools reset whenever the swapchain is resized.
    pub fn is_resolution_dependent(self) -> bool {
        matches!(
            self,
            PoolType::ResolutionDependentImages
                | PoolType::ResolutionDependentBuffers
                | PoolType::ResolutionDependentStagingBuffers
        )
    }

    /// Pools that are never reset while the device lives.
    pub fn is_static(self) -> bool {
        matches!(
            self,
            PoolType::StaticImages | PoolType::StaticBuffers | PoolType::StaticStagingBuffers
        )
    }

    #[inline]
    fn index(self) -> usize {
        self as usize
    }
}

/// Persistent CPU mapping of host-visible memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MappedPtr(NonNull<u8>);

// The pointer refers to device memory that stays mapped for the lifetime of
// its page; exclusive access to a sub-range is the allocator's contract.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

impl MappedPtr {
    #[inline]
    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// Pointer `offset` bytes further into the mapping.
    ///
    /// # Safety
    ///
    /// `offset` must stay within the mapped range.
    #[inline]
    pub unsafe fn add(self, offset: usize) -> Self {
        // SAFETY: the caller keeps the result inside the same mapping.
        Self(unsafe { self.0.add(offset) })
    }

    /// Copy `data` to the start of this pointer.
    ///
    /// # Safety
    ///
    /// `data.len()` bytes starting here must lie in the mapping and nobody
    /// else may write them concurrently.
    #[inline]
    pub unsafe fn write(self, data: &[u8]) {
        // SAFETY: upheld by the caller.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), self.as_ptr(), data.len()) }
    }
}

/// A sub-range of one page. Valid until the owning pool is reset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocationInfo {
    pub pool: PoolType,
    pub page_index: u32,
    pub memory: vk::DeviceMemory,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub alignment: vk::DeviceSize,
    /// Mapping of the first byte, for host-visible pools.
    pub mapped: Option<MappedPtr>,
}

impl AllocationInfo {
    /// Copy `data` into the start of a host-visible allocation.
    ///
    /// # Safety
    ///
    /// The allocation must be current (its pool not reset since) and the GPU
    /// must not be reading the range.
    ///
    /// # Panics
    ///
    /// Panics for device-local allocations and for data larger than the
    /// allocation.
    pub unsafe fn write(&self, data: &[u8]) {
        assert!(
            data.len() as vk::DeviceSize <= self.size,
            "write of {} bytes into a {} byte allocation",
            data.len(),
            self.size
        );
        let Some(mapped) = self.mapped else {
            panic!("allocation in {:?} is not host visible", self.pool);
        };
        // SAFETY: bounds checked above, exclusivity upheld by the caller.
        unsafe { mapped.write(data) }
    }
}

struct Page {
    memory: vk::DeviceMemory,
    memory_type_index: u32,
    allocator: PageAllocator,
    mapped: Option<MappedPtr>,
}

#[derive(Default)]
struct MemoryPool {
    pages: Vec<Page>,
}

/// Per-pool numbers for logs and tools.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub page_count: usize,
    pub size: vk::DeviceSize,
    pub available: vk::DeviceSize,
}

/// Owner of every device memory page.
pub struct GpuMemoryManager {
    device: Arc<dyn GpuDevice>,
    page_size: vk::DeviceSize,
    pools: [MemoryPool; PoolType::ALL.len()],
}

impl GpuMemoryManager {
    pub fn new(device: Arc<dyn GpuDevice>, page_size: vk::DeviceSize) -> Self {
        assert!(page_size > 0, "memory page size must be non-zero");
        info!("GPU memory manager created ({} byte pages)", page_size);
        Self {
            device,
            page_size,
            pools: Default::default(),
        }
    }

    #[inline]
    pub fn page_size(&self) -> vk::DeviceSize {
        self.page_size
    }

    /// Reserve `size` bytes in `pool` from a memory type allowed by
    /// `memory_type_bits`.
    ///
    /// # Panics
    ///
    /// Panics when `size` exceeds the page size or when no memory type
    /// satisfies both the pool location and the mask. Both are
    /// configuration errors.
    pub fn allocate_offset(
        &mut self,
        pool: PoolType,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
        memory_type_bits: u32,
    ) -> RenderResult<AllocationInfo> {
        assert!(
            size <= self.page_size,
            "allocation of {size} bytes in {pool:?} exceeds the {} byte page size",
            self.page_size
        );

        let pages = &mut self.pools[pool.index()].pages;
        let existing = pages.iter().position(|page| {
            memory_type_bits & (1 << page.memory_type_index) != 0
                && page.allocator.fits(size, alignment)
        });

        let page_index = match existing {
            Some(index) => index,
            None => {
                let required = pool.location().required_flags();
                let Some(memory_type_index) =
                    self.device.find_memory_type(memory_type_bits, required)
                else {
                    panic!(
                        "no memory type with {required:?} in mask {memory_type_bits:#b} for {pool:?}"
                    );
                };
                let page = Self::allocate_page(
                    self.device.as_ref(),
                    pool,
                    self.page_size,
                    memory_type_index,
                )?;
                let pages = &mut self.pools[pool.index()].pages;
                pages.push(page);
                pages.len() - 1
            }
        };

        let page = &mut self.pools[pool.index()].pages[page_index];
        let offset = page.allocator.allocate(size, alignment);
        // SAFETY: offset + size <= page size, which is the mapped length.
        let mapped = page.mapped.map(|ptr| unsafe { ptr.add(offset as usize) });

        trace!(
            "{:?}: {} bytes at page {} offset {}",
            pool, size, page_index, offset
        );

        Ok(AllocationInfo {
            pool,
            page_index: page_index as u32,
            memory: page.memory,
            offset,
            size,
            alignment,
            mapped,
        })
    }

    /// Allocate memory for `buffer` in `pool` and bind it.
    pub fn bind_buffer(&mut self, pool: PoolType, buffer: vk::Buffer) -> RenderResult<AllocationInfo> {
        let requirements = self.device.buffer_memory_requirements(buffer);
        let allocation = self.allocate_offset(
            pool,
            requirements.size,
            requirements.alignment,
            requirements.memory_type_bits,
        )?;
        self.device
            .bind_buffer_memory(buffer, allocation.memory, allocation.offset)?;
        Ok(allocation)
    }

    /// Allocate memory for `image` in `pool` and bind it.
    pub fn bind_image(&mut self, pool: PoolType, image: vk::Image) -> RenderResult<AllocationInfo> {
        let requirements = self.device.image_memory_requirements(image);
        let allocation = self.allocate_offset(
            pool,
            requirements.size,
            requirements.alignment,
            requirements.memory_type_bits,
        )?;
        self.device
            .bind_image_memory(image, allocation.memory, allocation.offset)?;
        Ok(allocation)
    }

    /// Rewind every page of `pool`. Device memory is kept.
    pub fn reset_pool(&mut self, pool: PoolType) {
        let pages = &mut self.pools[pool.index()].pages;
        for page in pages.iter_mut() {
            page.allocator.reset();
        }
        debug!("Reset {:?} ({} pages)", pool, pages.len());
    }

    /// Free bytes over all pages of `pool`.
    pub fn calc_available(&self, pool: PoolType) -> vk::DeviceSize {
        self.pools[pool.index()]
            .pages
            .iter()
            .map(|page| page.allocator.calc_available_bytes())
            .sum()
    }

    /// Total bytes of device memory held by `pool`.
    pub fn pool_size(&self, pool: PoolType) -> vk::DeviceSize {
        self.pools[pool.index()]
            .pages
            .iter()
            .map(|page| page.allocator.size())
            .sum()
    }

    pub fn page_count(&self, pool: PoolType) -> usize {
        self.pools[pool.index()].pages.len()
    }

    pub fn stats(&self, pool: PoolType) -> PoolStats {
        PoolStats {
            page_count: self.page_count(pool),
            size: self.pool_size(pool),
            available: self.calc_available(pool),
        }
    }

    /// Log the state of every non-empty pool.
    pub fn update_stats(&self) {
        for pool in PoolType::ALL {
            let stats = self.stats(pool);
            if stats.page_count > 0 {
                trace!(
                    "{:?}: {} pages, {} of {} bytes free",
                    pool, stats.page_count, stats.available, stats.size
                );
            }
        }
    }

    /// Free every page of every pool. The device must be idle.
    pub fn destroy(&mut self) {
        let mut freed = 0;
        for pool in &mut self.pools {
            for page in pool.pages.drain(..) {
                self.device.destroy(NativeObject::DeviceMemory(page.memory));
                freed += 1;
            }
        }
        if freed > 0 {
            info!("Freed {} memory pages", freed);
        }
    }

    fn allocate_page(
        device: &dyn GpuDevice,
        pool: PoolType,
        size: vk::DeviceSize,
        memory_type_index: u32,
    ) -> RenderResult<Page> {
        let memory = device.allocate_memory(size, memory_type_index)?;
        let mapped = match pool.location() {
            MemoryLocation::HostVisible => match device.map_memory(memory, size) {
                Ok(ptr) => Some(MappedPtr(ptr)),
                Err(e) => {
                    device.destroy(NativeObject::DeviceMemory(memory));
                    return Err(e.into());
                }
            },
            MemoryLocation::DeviceLocal => None,
        };

        debug!(
            "New {:?} page: {} bytes, memory type {}",
            pool, size, memory_type_index
        );

        Ok(Page {
            memory,
            memory_type_index,
            allocator: PageAllocator::new(size),
            mapped,
        })
    }
}

impl Drop for GpuMemoryManager {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_rhi::headless::HeadlessDevice;

    fn manager(page_size: vk::DeviceSize) -> (Arc<HeadlessDevice>, GpuMemoryManager) {
        let device = Arc::new(HeadlessDevice::new());
        let memory = GpuMemoryManager::new(device.clone(), page_size);
        (device, memory)
    }

    #[test]
    fn test_first_fit_then_new_page() {
        let (_device, mut memory) = manager(1024);
        let pool = PoolType::StaticBuffers;

        let a = memory.allocate_offset(pool, 600, 1, u32::MAX).unwrap();
        let b = memory.allocate_offset(pool, 300, 1, u32::MAX).unwrap();
        let c = memory.allocate_offset(pool, 200, 1, u32::MAX).unwrap();

        assert_eq!((a.page_index, a.offset), (0, 0));
        assert_eq!((b.page_index, b.offset), (0, 600));
        assert_eq!((c.page_index, c.offset), (1, 0));
        assert_eq!(memory.page_count(pool), 2);
        assert_ne!(a.memory, c.memory);
    }

    #[test]
    fn test_earlier_page_is_reused_when_it_fits() {
        let (_device, mut memory) = manager(1024);
        let pool = PoolType::StaticBuffers;
        memory.allocate_offset(pool, 900, 1, u32::MAX).unwrap();
        memory.allocate_offset(pool, 900, 1, u32::MAX).unwrap();

        let small = memory.allocate_offset(pool, 100, 1, u32::MAX).unwrap();
        assert_eq!((small.page_index, small.offset), (0, 900));
    }

    #[test]
    fn test_pool_size_is_sum_of_pages_and_survives_reset() {
        let (device, mut memory) = manager(4096);
        let pool = PoolType::ResolutionDependentImages;
        for _ in 0..5 {
            memory.allocate_offset(pool, 3000, 1, u32::MAX).unwrap();
        }
        assert_eq!(memory.pool_size(pool), 5 * 4096);
        assert_eq!(memory.calc_available(pool), 5 * 1096);

        memory.reset_pool(pool);
        assert_eq!(memory.pool_size(pool), 5 * 4096);
        assert_eq!(memory.calc_available(pool), 5 * 4096);
        assert_eq!(device.live_memory_allocations(), 5);

        // Reset pages are refilled before new ones are allocated.
        let again = memory.allocate_offset(pool, 3000, 1, u32::MAX).unwrap();
        assert_eq!((again.page_index, again.offset), (0, 0));
        assert_eq!(memory.page_count(pool), 5);
    }

    #[test]
    fn test_pools_are_independent() {
        let (_device, mut memory) = manager(1024);
        memory
            .allocate_offset(PoolType::StaticBuffers, 1000, 1, u32::MAX)
            .unwrap();
        let other = memory
            .allocate_offset(PoolType::ResolutionDependentBuffers, 1000, 1, u32::MAX)
            .unwrap();
        assert_eq!(other.page_index, 0);
        assert_eq!(memory.page_count(PoolType::StaticBuffers), 1);
        assert_eq!(memory.page_count(PoolType::StaticImages), 0);
    }

    #[test]
    fn test_staging_allocations_are_mapped_and_writable() {
        let (_device, mut memory) = manager(1024);
        let first = memory
            .allocate_offset(PoolType::VolatileStagingBuffers, 16, 16, u32::MAX)
            .unwrap();
        let second = memory
            .allocate_offset(PoolType::VolatileStagingBuffers, 16, 16, u32::MAX)
            .unwrap();
        let (Some(a), Some(b)) = (first.mapped, second.mapped) else {
            panic!("staging memory must be mapped");
        };
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 16);

        unsafe { second.write(&[7u8; 16]) };
        let read = unsafe { std::slice::from_raw_parts(b.as_ptr(), 16) };
        assert_eq!(read, &[7u8; 16]);

        let device_local = memory
            .allocate_offset(PoolType::StaticBuffers, 16, 16, u32::MAX)
            .unwrap();
        assert!(device_local.mapped.is_none());
    }

    #[test]
    fn test_memory_type_mask_selects_pages() {
        let (device, mut memory) = manager(1024);
        let pool = PoolType::StaticImages;
        let all_device_local = device
            .memory_types()
            .iter()
            .enumerate()
            .filter(|(_, ty)| ty.property_flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL))
            .fold(0u32, |mask, (i, _)| mask | (1 << i));
        let first_type = all_device_local.trailing_zeros();
        let only_first = 1u32 << first_type;
        let only_others = all_device_local & !only_first;

        let a = memory.allocate_offset(pool, 100, 1, only_first).unwrap();
        let b = memory.allocate_offset(pool, 100, 1, only_others).unwrap();
        assert_ne!(a.memory, b.memory);
        assert_eq!(memory.page_count(pool), 2);
    }

    #[test]
    #[should_panic(expected = "exceeds")]
    fn test_oversized_allocation_panics() {
        let (_device, mut memory) = manager(1024);
        let _ = memory.allocate_offset(PoolType::StaticBuffers, 1025, 1, u32::MAX);
    }

    #[test]
    #[should_panic(expected = "no memory type")]
    fn test_incompatible_mask_panics() {
        let (_device, mut memory) = manager(1024);
        let _ = memory.allocate_offset(PoolType::StaticStagingBuffers, 16, 1, 0);
    }

    #[test]
    fn test_destroy_frees_device_memory() {
        let (device, mut memory) = manager(1024);
        memory
            .allocate_offset(PoolType::StaticBuffers, 10, 1, u32::MAX)
            .unwrap();
        memory
            .allocate_offset(PoolType::VolatileStagingBuffers, 10, 1, u32::MAX)
            .unwrap();
        assert_eq!(device.live_memory_allocations(), 2);
        drop(memory);
        assert_eq!(device.live_memory_allocations(), 0);
    }

    #[test]
    fn test_pool_classification() {
        assert!(PoolType::ResolutionDependentImages.is_resolution_dependent());
        assert!(!PoolType::VolatileStagingBuffers.is_resolution_dependent());
        assert!(PoolType::StaticStagingBuffers.is_static());
        assert_eq!(
            PoolType::StaticStagingBuffers.location(),
            MemoryLocation::HostVisible
        );
        assert_eq!(PoolType::StaticImages.location(), MemoryLocation::DeviceLocal);
    }
}
