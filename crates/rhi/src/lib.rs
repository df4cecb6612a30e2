//! Vulkan abstraction layer (Render Hardware Interface).
//!
//! The renderer core only sees [`GpuDevice`] and [`Presenter`]. Two backends
//! implement them:
//! - [`vulkan`] drives a real GPU through `ash`
//! - [`headless`] records every call in memory, for tests and CI
//!
//! On top of the device trait this crate provides owned command pools,
//! synchronization objects and pipeline cache persistence.

mod error;

pub mod command;
pub mod device;
pub mod headless;
pub mod object;
pub mod pipeline_cache;
pub mod present;
pub mod state;
pub mod sync;
pub mod vulkan;

pub use command::{CommandBuffer, CommandPool};
pub use device::{DeviceInfo, GpuDevice, Inheritance, MemoryType, RenderPassBegin, Submission};
pub use error::{RhiError, RhiResult};
pub use object::NativeObject;
pub use pipeline_cache::PipelineCacheStore;
pub use present::{AcquiredImage, Presenter};
pub use sync::{BackbufferSync, Fence, Semaphore, WAIT_FOREVER};

pub use ash::vk;
