//! Presentation surface abstraction.

use ash::vk;

use crate::error::RhiResult;

/// A successfully acquired backbuffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcquiredImage {
    pub index: u32,
    /// The swapchain still works but no longer matches the surface exactly.
    pub suboptimal: bool,
}

/// Owner of the swapchain images the renderer presents into.
pub trait Presenter: Send {
    /// Number of backbuffers. This is also the frame buffering depth.
    fn image_count(&self) -> u32;

    fn extent(&self) -> vk::Extent2D;

    fn format(&self) -> vk::Format;

    fn images(&self) -> &[vk::Image];

    /// Acquire the next backbuffer, signalling `signal` once it may be written.
    ///
    /// Returns [`crate::RhiError::SwapchainOutOfDate`] when the swapchain must
    /// be rebuilt before another image can be acquired.
    fn acquire_next_image(&mut self, signal: vk::Semaphore) -> RhiResult<AcquiredImage>;

    /// Queue `index` for presentation after `wait` signals.
    ///
    /// Returns `true` when the swapchain is suboptimal or out of date.
    fn present(&mut self, index: u32, wait: &[vk::Semaphore]) -> RhiResult<bool>;

    /// Rebuild the swapchain for a new surface size. The device must be idle.
    fn recreate(&mut self, extent: vk::Extent2D) -> RhiResult<()>;
}
