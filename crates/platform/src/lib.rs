//! Platform layer for the forge renderer.
//!
//! - Window management via winit
//! - Vulkan surface creation through `ash-window`

mod window;

pub use window::{Window, required_extensions};

// Re-export winit types the app needs
pub use winit::event::WindowEvent;
pub use winit::event_loop::{ActiveEventLoop, EventLoop};
