//! Core utilities shared by every forge crate.
//!
//! - Error types and result aliases
//! - Logging initialization
//! - Renderer configuration
//! - Frame clock
//! - Fork-join task scheduling used for parallel command recording

pub mod config;
mod clock;
mod error;
mod logging;
pub mod task;

pub use clock::FrameClock;
pub use config::{RendererConfig, UniformConfig};
pub use error::{Error, Result};
pub use logging::{init_logging, try_init_logging};
pub use task::{InlineScheduler, RayonScheduler, TaskScheduler, fork_join};
