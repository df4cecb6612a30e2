//! Bump allocator over one fixed-size memory page.
//!
//! Offsets only ever grow until [`PageAllocator::reset`]. There is no way to
//! free a single allocation; the whole page is reclaimed at once.

use ash::vk;

/// Offset cursor for one page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageAllocator {
    size: vk::DeviceSize,
    cursor: vk::DeviceSize,
}

impl PageAllocator {
    pub fn new(size: vk::DeviceSize) -> Self {
        Self { size, cursor: 0 }
    }

    /// Page size in bytes.
    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Whether `size` bytes aligned to `alignment` still fit.
    ///
    /// An alignment of 0 or 1 means unaligned.
    pub fn fits(&self, size: vk::DeviceSize, alignment: vk::DeviceSize) -> bool {
        align_up(self.cursor, alignment)
            .checked_add(size)
            .is_some_and(|end| end <= self.size)
    }

    /// Reserve `size` bytes and return their offset.
    ///
    /// # Panics
    ///
    /// Panics if the allocation does not [`fit`](Self::fits). Callers check
    /// first or move on to another page.
    pub fn allocate(&mut self, size: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
        assert!(
            self.fits(size, alignment),
            "page allocation of {size} bytes (alignment {alignment}) does not fit: {} of {} bytes used",
            self.cursor,
            self.size
        );
        let offset = align_up(self.cursor, alignment);
        self.cursor = offset + size;
        offset
    }

    /// Rewind to the start. Every offset handed out so far becomes invalid.
    #[inline]
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Bytes between the cursor and the end of the page.
    #[inline]
    pub fn calc_available_bytes(&self) -> vk::DeviceSize {
        self.size - self.cursor
    }
}

#[inline]
fn align_up(offset: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    if alignment <= 1 {
        offset
    } else {
        offset.div_ceil(alignment) * alignment
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_sequential_allocations() {
        let mut page = PageAllocator::new(1024);
        assert_eq!(page.allocate(600, 1), 0);
        assert_eq!(page.allocate(300, 1), 600);
        assert_eq!(page.calc_available_bytes(), 124);
        assert!(!page.fits(200, 1));
    }

    #[test]
    fn test_alignment_pads_offset() {
        let mut page = PageAllocator::new(1024);
        page.allocate(10, 0);
        assert_eq!(page.allocate(16, 256), 256);
        assert_eq!(page.allocate(1, 3), 273);
    }

    #[test]
    fn test_alignment_padding_counts_against_fit() {
        let mut page = PageAllocator::new(512);
        page.allocate(1, 1);
        // 256 bytes would fit unaligned but not once padded to offset 256.
        assert!(page.fits(256, 1));
        assert!(!page.fits(257, 256));
        assert!(page.fits(256, 256));
    }

    #[test]
    fn test_reset_returns_to_zero() {
        let mut page = PageAllocator::new(1024);
        page.allocate(1000, 1);
        page.reset();
        assert_eq!(page.calc_available_bytes(), 1024);
        assert_eq!(page.allocate(64, 128), 0);
    }

    #[test]
    fn test_exact_fit_and_huge_request() {
        let mut page = PageAllocator::new(256);
        assert!(page.fits(256, 1));
        assert!(!page.fits(u64::MAX, 1));
        page.allocate(256, 1);
        assert!(page.fits(0, 1));
        assert!(!page.fits(1, 1));
    }

    #[test]
    #[should_panic(expected = "does not fit")]
    fn test_allocate_without_fit_panics() {
        let mut page = PageAllocator::new(128);
        page.allocate(129, 1);
    }

    #[test]
    fn test_random_allocations_never_overlap() {
        let mut rng = rand::rng();
        for _ in 0..50 {
            let mut page = PageAllocator::new(64 * 1024);
            let mut previous_end = 0;
            loop {
                let size = rng.random_range(1..4096);
                let alignment = [0, 1, 4, 16, 256][rng.random_range(0..5)];
                if !page.fits(size, alignment) {
                    break;
                }
                let offset = page.allocate(size, alignment);
                assert!(offset >= previous_end);
                if alignment > 1 {
                    assert_eq!(offset % alignment, 0);
                }
                previous_end = offset + size;
            }
            assert!(previous_end <= page.size());
        }
    }
}
