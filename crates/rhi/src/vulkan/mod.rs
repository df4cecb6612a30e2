//! Vulkan backend.
//!
//! Bring-up order is instance, surface, physical device, logical device and
//! finally the swapchain. Each later object holds an `Arc` to the ones it
//! depends on, so teardown happens in reverse without extra bookkeeping.

mod device;
mod instance;
mod physical_device;
mod swapchain;

pub use device::VulkanDevice;
pub use instance::Instance;
pub use physical_device::{
    PhysicalDeviceInfo, QueueFamilyIndices, rate_device, select_physical_device,
};
pub use swapchain::{Surface, SwapchainSupportDetails, VulkanSwapchain};
