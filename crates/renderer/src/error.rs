//! Renderer error types.

use forge_rhi::RhiError;
use thiserror::Error;

/// Errors surfaced by the renderer core.
///
/// Only device-level failures and bad input data end up here. Misuse of the
/// API (stale handles, skipped resets, over-capacity arenas) panics instead.
#[derive(Error, Debug)]
pub enum RenderError {
    /// A device call failed
    #[error(transparent)]
    Rhi(#[from] RhiError),

    /// Configuration or IO failure from the core crate
    #[error(transparent)]
    Core(#[from] forge_core::Error),

    /// A resource description references something that cannot be used
    #[error("Invalid {kind} '{name}': {reason}")]
    InvalidDescription {
        kind: &'static str,
        name: String,
        reason: String,
    },
}

impl RenderError {
    /// True when the swapchain must be rebuilt before rendering can continue.
    pub fn is_out_of_date(&self) -> bool {
        matches!(self, RenderError::Rhi(e) if e.is_out_of_date())
    }
}

impl From<ash::vk::Result> for RenderError {
    fn from(result: ash::vk::Result) -> Self {
        RenderError::Rhi(RhiError::VulkanError(result))
    }
}

/// Result type alias for renderer operations.
pub type RenderResult<T> = std::result::Result<T, RenderError>;
