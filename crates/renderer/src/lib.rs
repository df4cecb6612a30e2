//! GPU execution core of the forge renderer.
//!
//! This crate turns resource descriptions into device objects and drives
//! them through the frame loop:
//! - Page-based device memory pools ([`memory`], [`page_allocator`])
//! - Typed resource managers with generational handles ([`resource`])
//! - Frame-delayed destruction ([`release_queue`])
//! - Per-instance and per-material uniform memory ([`uniforms`])
//! - Parallel draw call recording with ordered replay ([`dispatcher`])
//! - The frame loop itself ([`render_system`])

mod error;

pub mod dispatcher;
pub mod memory;
pub mod page_allocator;
pub mod release_queue;
pub mod render_system;
pub mod resource;
pub mod sampler;
pub mod ubo;
pub mod uniforms;

pub use dispatcher::{DispatchStats, DrawCallDispatcher, batch_size};
pub use error::{RenderError, RenderResult};
pub use memory::{AllocationInfo, GpuMemoryManager, MemoryLocation, PoolStats, PoolType};
pub use page_allocator::PageAllocator;
pub use release_queue::{DeferredReleaseQueue, ReleaseEntry};
pub use render_system::{FrameState, RenderSystem};
pub use resource::{Ref, ResourceContext, ResourceKind, ResourceManager, Resources};
pub use sampler::{SamplerKind, Samplers};
pub use ubo::{InstanceUniforms, MaterialUniforms};
pub use uniforms::{BlockClass, BoundedPageStack, UniformManager};

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn test_worker_shared_types_are_sync() {
        assert_sync::<Resources>();
        assert_sync::<UniformManager>();
        assert_sync::<BoundedPageStack>();
    }

    #[test]
    fn test_render_system_is_send() {
        assert_send::<RenderSystem>();
        assert_send::<DrawCallDispatcher>();
    }
}
