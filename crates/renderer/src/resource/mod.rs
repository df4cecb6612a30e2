//! GPU resources.
//!
//! Every kind follows the same lifecycle, driven through [`Resources`]:
//!
//! 1. [`Resources::create`] claims a slot and returns a [`Ref`]
//! 2. [`Resources::reset_to_default`] then [`Resources::desc_mut`] fill in the description
//! 3. [`Resources::create_resources`] turns descriptions into device objects
//! 4. [`Resources::destroy_resources`] hands the device objects to the
//!    deferred release queue; the description survives and can be re-created
//! 5. [`Resources::destroy`] frees the slot
//!
//! Kinds are compile-time parameters of [`ResourceManager`]; there is no
//! runtime dispatch over kinds.

/// Implements the registry accessors of a kind.
macro_rules! resource_manager_accessors {
    ($field:ident) => {
        fn manager(resources: &$crate::resource::Resources) -> &$crate::resource::ResourceManager<Self> {
            &resources.$field
        }

        fn manager_mut(
            resources: &mut $crate::resource::Resources,
        ) -> &mut $crate::resource::ResourceManager<Self> {
            &mut resources.$field
        }
    };
}

mod descriptor_writes;
mod manager;

pub mod buffer;
pub mod compute_call;
pub mod draw_call;
pub mod framebuffer;
pub mod image;
pub mod pipeline;
pub mod pipeline_layout;
pub mod program;
pub mod render_pass;
pub mod vertex_layout;

use std::sync::Arc;

use ash::vk;
use forge_rhi::{CommandPool, GpuDevice};
use tracing::{debug, info};

pub use buffer::{Buffer, BufferDesc, BufferNative};
pub use compute_call::{ComputeCall, ComputeCallDesc, ComputeCallNative, StorageBinding};
pub use draw_call::{DrawCall, DrawCallDesc, DrawCallNative, ImageBinding, sort_draw_calls};
pub use framebuffer::{Framebuffer, FramebufferAttachment, FramebufferDesc, FramebufferNative};
pub use image::{Image, ImageDesc, ImageExtent, ImageNative};
pub use manager::{Ref, ResourceKind, ResourceManager};
pub use pipeline::{Pipeline, PipelineDesc, PipelineNative, Viewport};
pub use pipeline_layout::{
    DescriptorBinding, DescriptorKind, PipelineLayout, PipelineLayoutDesc, PipelineLayoutNative,
};
pub use program::{GpuProgram, GpuProgramDesc, GpuProgramNative, ShaderStage, spirv_from_bytes};
pub use render_pass::{AttachmentDesc, ClearValue, RenderPass, RenderPassDesc, RenderPassNative};
pub use vertex_layout::{VertexAttribute, VertexBinding, VertexLayout, VertexLayoutDesc};

use crate::error::RenderResult;
use crate::memory::GpuMemoryManager;
use crate::release_queue::DeferredReleaseQueue;
use crate::sampler::Samplers;
use crate::uniforms::UniformManager;

/// Everything device-side a kind needs while creating or releasing its
/// native objects.
pub struct ResourceContext<'a> {
    pub device: &'a Arc<dyn GpuDevice>,
    pub memory: &'a mut GpuMemoryManager,
    pub release_queue: &'a mut DeferredReleaseQueue,
    pub uniforms: &'a mut UniformManager,
    pub samplers: &'a Samplers,
    pub descriptor_pool: vk::DescriptorPool,
    /// Pool for one-shot upload command buffers.
    pub upload_pool: &'a CommandPool,
    pub backbuffer_extent: vk::Extent2D,
    pub backbuffer_format: vk::Format,
    pub backbuffer_count: u32,
}

/// Registry of every resource manager.
///
/// Passed explicitly to whoever needs resources; there is no global table.
#[derive(Default)]
pub struct Resources {
    pub buffers: ResourceManager<Buffer>,
    pub images: ResourceManager<Image>,
    pub programs: ResourceManager<GpuProgram>,
    pub vertex_layouts: ResourceManager<VertexLayout>,
    pub pipeline_layouts: ResourceManager<PipelineLayout>,
    pub render_passes: ResourceManager<RenderPass>,
    pub framebuffers: ResourceManager<Framebuffer>,
    pub pipelines: ResourceManager<Pipeline>,
    pub draw_calls: ResourceManager<DrawCall>,
    pub compute_calls: ResourceManager<ComputeCall>,
}

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn manager<K: ResourceKind>(&self) -> &ResourceManager<K> {
        K::manager(self)
    }

    #[inline]
    pub fn manager_mut<K: ResourceKind>(&mut self) -> &mut ResourceManager<K> {
        K::manager_mut(self)
    }

    pub fn create<K: ResourceKind>(&mut self, name: &str) -> Ref<K> {
        K::manager_mut(self).create(name)
    }

    pub fn reset_to_default<K: ResourceKind>(&mut self, handle: Ref<K>) {
        K::manager_mut(self).reset_to_default(handle);
    }

    pub fn desc<K: ResourceKind>(&self, handle: Ref<K>) -> &K::Desc {
        K::manager(self).desc(handle)
    }

    pub fn desc_mut<K: ResourceKind>(&mut self, handle: Ref<K>) -> &mut K::Desc {
        K::manager_mut(self).desc_mut(handle)
    }

    pub fn native<K: ResourceKind>(&self, handle: Ref<K>) -> &K::Native {
        K::manager(self).native(handle)
    }

    pub fn get_by_name<K: ResourceKind>(&self, name: &str) -> Option<Ref<K>> {
        K::manager(self).get_by_name(name)
    }

    /// Create device objects for every handle in `handles`.
    ///
    /// A handle that already owns device objects has them released first,
    /// so this doubles as "apply an edited description".
    ///
    /// # Panics
    ///
    /// Panics if a handle is inactive or was never reset to default.
    pub fn create_resources<K: ResourceKind>(
        &mut self,
        ctx: &mut ResourceContext<'_>,
        handles: &[Ref<K>],
    ) -> RenderResult<()> {
        for &handle in handles {
            K::manager(self).assert_described(handle);
            if let Some(old) = K::manager_mut(self).take_native(handle) {
                debug!("Re-creating {:?}", handle);
                K::release_native(old, ctx);
            }

            let native = {
                let manager = K::manager(self);
                K::create_native(self, ctx, manager.name(handle), manager.desc(handle))?
            };
            K::manager_mut(self).install_native(handle, native);
        }
        Ok(())
    }

    /// Queue the device objects of every handle for deferred release.
    /// Descriptions and slots survive.
    pub fn destroy_resources<K: ResourceKind>(
        &mut self,
        ctx: &mut ResourceContext<'_>,
        handles: &[Ref<K>],
    ) {
        for &handle in handles {
            if let Some(native) = K::manager_mut(self).take_native(handle) {
                K::release_native(native, ctx);
            }
        }
    }

    /// Free the slot of `handle`.
    ///
    /// # Panics
    ///
    /// Panics if the handle still owns device objects.
    pub fn destroy<K: ResourceKind>(&mut self, handle: Ref<K>) {
        K::manager_mut(self).destroy(handle);
    }

    /// Release device objects and free the slots of every live resource,
    /// dependents first.
    pub fn destroy_all(&mut self, ctx: &mut ResourceContext<'_>) {
        self.destroy_all_of::<DrawCall>(ctx);
        self.destroy_all_of::<ComputeCall>(ctx);
        self.destroy_all_of::<Pipeline>(ctx);
        self.destroy_all_of::<Framebuffer>(ctx);
        self.destroy_all_of::<RenderPass>(ctx);
        self.destroy_all_of::<PipelineLayout>(ctx);
        self.destroy_all_of::<VertexLayout>(ctx);
        self.destroy_all_of::<GpuProgram>(ctx);
        self.destroy_all_of::<Image>(ctx);
        self.destroy_all_of::<Buffer>(ctx);
    }

    fn destroy_all_of<K: ResourceKind>(&mut self, ctx: &mut ResourceContext<'_>) {
        let handles: Vec<Ref<K>> = K::manager(self).active_refs().collect();
        if handles.is_empty() {
            return;
        }
        self.destroy_resources(ctx, &handles);
        for &handle in &handles {
            self.destroy(handle);
        }
        debug!("Destroyed {} {} resources", handles.len(), K::NAME);
    }

    /// Rebuild everything sized by, or pointing into, the backbuffer.
    ///
    /// Called after the swapchain was recreated and the resolution dependent
    /// pools were reset. Dependencies are rebuilt before their dependents.
    pub fn recreate_resolution_dependent(
        &mut self,
        ctx: &mut ResourceContext<'_>,
    ) -> RenderResult<()> {
        let buffers: Vec<_> = self
            .buffers
            .active_refs()
            .filter(|&r| self.buffers.has_native(r) && self.buffers.desc(r).resolution_dependent)
            .collect();
        self.create_resources(ctx, &buffers)?;

        let images: Vec<_> = self
            .images
            .active_refs()
            .filter(|&r| self.images.has_native(r) && self.images.desc(r).is_resolution_dependent())
            .collect();
        self.create_resources(ctx, &images)?;

        let framebuffers: Vec<_> = self
            .framebuffers
            .active_refs()
            .filter(|&r| {
                self.framebuffers.has_native(r)
                    && framebuffer::is_resolution_dependent(self, self.framebuffers.desc(r))
            })
            .collect();
        self.create_resources(ctx, &framebuffers)?;

        // Viewports are baked into pipelines.
        let pipelines: Vec<_> = self
            .pipelines
            .active_refs()
            .filter(|&r| self.pipelines.has_native(r))
            .collect();
        self.create_resources(ctx, &pipelines)?;

        let draw_calls: Vec<_> = self
            .draw_calls
            .active_refs()
            .filter(|&r| {
                self.draw_calls.has_native(r)
                    && draw_call::references_resolution_dependent(self, self.draw_calls.desc(r))
            })
            .collect();
        self.create_resources(ctx, &draw_calls)?;

        let compute_calls: Vec<_> = self
            .compute_calls
            .active_refs()
            .filter(|&r| {
                self.compute_calls.has_native(r)
                    && compute_call::references_resolution_dependent(
                        self,
                        self.compute_calls.desc(r),
                    )
            })
            .collect();
        self.create_resources(ctx, &compute_calls)?;

        info!(
            "Recreated resolution dependent resources: {} buffers, {} images, {} framebuffers, {} pipelines, {} draw calls, {} compute calls",
            buffers.len(),
            images.len(),
            framebuffers.len(),
            pipelines.len(),
            draw_calls.len(),
            compute_calls.len()
        );
        Ok(())
    }
}


/// Shorthand for an [`crate::error::RenderError::InvalidDescription`].
pub(crate) fn invalid<K: ResourceKind>(name: &str, reason: impl Into<String>) -> crate::error::RenderError {
    crate::error::RenderError::InvalidDescription {
        kind: K::NAME,
        name: name.to_owned(),
        reason: reason.into(),
    }
}

/// Look up the native objects of a dependency that must already exist.
pub(crate) fn require<'r, K: ResourceKind, D: ResourceKind>(
    resources: &'r Resources,
    name: &str,
    dependency: Option<Ref<D>>,
    what: &str,
) -> RenderResult<(Ref<D>, &'r D::Native)> {
    let Some(handle) = dependency else {
        return Err(invalid::<K>(name, format!("no {what} set")));
    };
    let manager = D::manager(resources);
    if !manager.is_alive(handle) {
        return Err(invalid::<K>(name, format!("{what} {handle:?} was destroyed")));
    }
    if !manager.has_native(handle) {
        return Err(invalid::<K>(
            name,
            format!("{what} '{}' has no device objects", manager.name(handle)),
        ));
    }
    Ok((handle, manager.native(handle)))
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use ash::vk;
    use forge_core::UniformConfig;
    use forge_rhi::headless::HeadlessDevice;
    use forge_rhi::{CommandPool, GpuDevice};

    use super::*;

    /// Owner of everything a [`ResourceContext`] borrows.
    pub struct Fixture {
        pub headless: Arc<HeadlessDevice>,
        pub device: Arc<dyn GpuDevice>,
        pub memory: GpuMemoryManager,
        pub release_queue: DeferredReleaseQueue,
        pub uniforms: UniformManager,
        pub samplers: Samplers,
        pub descriptor_pool: vk::DescriptorPool,
        pub upload_pool: CommandPool,
        pub resources: Resources,
    }

    impl Fixture {
        pub fn new() -> Self {
            let headless = Arc::new(HeadlessDevice::new());
            let device: Arc<dyn GpuDevice> = headless.clone();
            let mut memory = GpuMemoryManager::new(device.clone(), 16 * 1024 * 1024);
            let config = UniformConfig {
                small_block_count: 64,
                large_block_count: 8,
                material_block_count: 16,
                ..Default::default()
            };
            let uniforms = UniformManager::new(device.clone(), &mut memory, &config, 2).unwrap();
            let samplers = Samplers::new(device.clone()).unwrap();
            let descriptor_pool = crate::render_system::create_descriptor_pool(device.as_ref()).unwrap();
            let upload_pool = CommandPool::new_transient(device.clone()).unwrap();
            Self {
                headless,
                device,
                memory,
                release_queue: DeferredReleaseQueue::new(),
                uniforms,
                samplers,
                descriptor_pool,
                upload_pool,
                resources: Resources::new(),
            }
        }

        pub fn split(&mut self) -> (&mut Resources, ResourceContext<'_>) {
            let ctx = ResourceContext {
                device: &self.device,
                memory: &mut self.memory,
                release_queue: &mut self.release_queue,
                uniforms: &mut self.uniforms,
                samplers: &self.samplers,
                descriptor_pool: self.descriptor_pool,
                upload_pool: &self.upload_pool,
                backbuffer_extent: vk::Extent2D {
                    width: 640,
                    height: 480,
                },
                backbuffer_format: vk::Format::B8G8R8A8_UNORM,
                backbuffer_count: 2,
            };
            (&mut self.resources, ctx)
        }
    }
}
