//! Synchronization primitives.
//!
//! - [`Semaphore`] - GPU-to-GPU synchronization (acquire -> render -> present)
//! - [`Fence`] - GPU-to-CPU synchronization (has this backbuffer's work retired?)
//! - [`BackbufferSync`] - the pair of objects owned by one backbuffer index
//!
//! All waits use an infinite timeout. A GPU that never signals is a fatal
//! condition for a real-time renderer, not something to recover from.

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::device::GpuDevice;
use crate::error::RhiResult;
use crate::object::NativeObject;

/// Timeout used for every fence wait.
pub const WAIT_FOREVER: u64 = u64::MAX;

/// Owned semaphore, destroyed on drop.
pub struct Semaphore {
    device: Arc<dyn GpuDevice>,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    pub fn new(device: Arc<dyn GpuDevice>) -> RhiResult<Self> {
        let semaphore = device.create_semaphore()?;
        debug!("Created semaphore");
        Ok(Self { device, semaphore })
    }

    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.device.destroy(NativeObject::Semaphore(self.semaphore));
        debug!("Destroyed semaphore");
    }
}

/// Owned fence, destroyed on drop.
pub struct Fence {
    device: Arc<dyn GpuDevice>,
    fence: vk::Fence,
}

impl Fence {
    /// Create a fence. Signaled fences let the first wait pass immediately.
    pub fn new(device: Arc<dyn GpuDevice>, signaled: bool) -> RhiResult<Self> {
        let fence = device.create_fence(signaled)?;
        debug!(
            "Created fence ({})",
            if signaled { "signaled" } else { "unsignaled" }
        );
        Ok(Self { device, fence })
    }

    #[inline]
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    /// Block until the fence is signaled.
    pub fn wait(&self) -> RhiResult<()> {
        self.device.wait_for_fence(self.fence, WAIT_FOREVER)
    }

    pub fn reset(&self) -> RhiResult<()> {
        self.device.reset_fence(self.fence)
    }

    pub fn is_signaled(&self) -> bool {
        matches!(self.device.fence_signaled(self.fence), Ok(true))
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.device.destroy(NativeObject::Fence(self.fence));
        debug!("Destroyed fence");
    }
}

/// Synchronization owned by one backbuffer index.
pub struct BackbufferSync {
    /// Signaled by the submission rendering into this backbuffer, waited on by present.
    render_finished: Semaphore,
    /// Signaled when the last submission using this backbuffer retired.
    in_flight: Fence,
}

impl BackbufferSync {
    pub fn new(device: Arc<dyn GpuDevice>) -> RhiResult<Self> {
        let render_finished = Semaphore::new(device.clone())?;
        // Start signaled so the first wait doesn't block forever
        let in_flight = Fence::new(device, true)?;
        Ok(Self {
            render_finished,
            in_flight,
        })
    }

    #[inline]
    pub fn render_finished(&self) -> &Semaphore {
        &self.render_finished
    }

    #[inline]
    pub fn in_flight(&self) -> &Fence {
        &self.in_flight
    }
}
