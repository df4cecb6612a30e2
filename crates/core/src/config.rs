//! Renderer configuration.
//!
//! Everything here has a sensible default; a JSON file only needs to name the
//! fields it overrides.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Size of one device memory page. No single resource may exceed it.
pub const DEFAULT_PAGE_SIZE_BYTES: u64 = 80 * 1024 * 1024;

/// Secondary command buffers available per backbuffer and frame.
pub const DEFAULT_SECONDARY_COMMAND_BUFFERS: u32 = 128;

/// Per-instance and per-material uniform memory layout.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UniformConfig {
    /// Number of independent per-instance regions, cycled by backbuffer index.
    pub per_instance_buffer_count: u32,
    pub small_block_size: u32,
    pub small_block_count: u32,
    pub large_block_size: u32,
    pub large_block_count: u32,
    pub material_block_size: u32,
    pub material_block_count: u32,
}

impl Default for UniformConfig {
    fn default() -> Self {
        Self {
            per_instance_buffer_count: 2,
            small_block_size: 256,
            small_block_count: 10240,
            large_block_size: 2048,
            large_block_count: 256,
            material_block_size: 256,
            material_block_count: 1024,
        }
    }
}

impl UniformConfig {
    /// Bytes occupied by one per-instance region.
    pub fn per_instance_region_size(&self) -> u64 {
        self.small_block_size as u64 * self.small_block_count as u64
            + self.large_block_size as u64 * self.large_block_count as u64
    }

    /// Bytes of the whole per-instance buffer.
    pub fn per_instance_buffer_size(&self) -> u64 {
        self.per_instance_region_size() * self.per_instance_buffer_count as u64
    }

    /// Bytes of the per-material buffer.
    pub fn per_material_buffer_size(&self) -> u64 {
        self.material_block_size as u64 * self.material_block_count as u64
    }
}

/// Top-level renderer configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Size of each page in every memory pool.
    pub page_size_bytes: u64,
    /// Secondary command buffers per backbuffer; bounds parallel batches per frame.
    pub secondary_command_buffers_per_frame: u32,
    /// Recording worker threads. Zero selects one per logical CPU.
    pub worker_threads: usize,
    /// Minimum time between two swapchain rebuilds.
    pub resize_interval_secs: f32,
    /// Enable the Khronos validation layer.
    pub validation: bool,
    /// Present with FIFO instead of MAILBOX.
    pub vsync: bool,
    /// Directory for the persisted pipeline cache. `None` disables persistence.
    pub pipeline_cache_dir: Option<PathBuf>,
    pub uniforms: UniformConfig,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            page_size_bytes: DEFAULT_PAGE_SIZE_BYTES,
            secondary_command_buffers_per_frame: DEFAULT_SECONDARY_COMMAND_BUFFERS,
            worker_threads: 0,
            resize_interval_secs: 1.0,
            validation: cfg!(debug_assertions),
            vsync: true,
            pipeline_cache_dir: None,
            uniforms: UniformConfig::default(),
        }
    }
}

impl RendererConfig {
    /// Load a configuration from a JSON file and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        tracing::info!("Loaded renderer config from {}", path.display());
        Ok(config)
    }

    /// Write the configuration as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Reject values the renderer cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.page_size_bytes == 0 {
            return Err(Error::Config("page_size_bytes must be non-zero".into()));
        }
        if self.secondary_command_buffers_per_frame == 0 {
            return Err(Error::Config(
                "secondary_command_buffers_per_frame must be non-zero".into(),
            ));
        }
        if self.resize_interval_secs.is_nan() || self.resize_interval_secs < 0.0 {
            return Err(Error::Config(format!(
                "resize_interval_secs must be >= 0, got {}",
                self.resize_interval_secs
            )));
        }

        let uniforms = &self.uniforms;
        if uniforms.per_instance_buffer_count == 0 {
            return Err(Error::Config(
                "uniforms.per_instance_buffer_count must be non-zero".into(),
            ));
        }
        if uniforms.small_block_size == 0 || uniforms.small_block_size > uniforms.large_block_size
        {
            return Err(Error::Config(format!(
                "uniform block sizes must satisfy 0 < small ({}) <= large ({})",
                uniforms.small_block_size, uniforms.large_block_size
            )));
        }
        if uniforms.per_instance_buffer_size() > self.page_size_bytes
            || uniforms.per_material_buffer_size() > self.page_size_bytes
        {
            return Err(Error::Config(format!(
                "uniform buffers ({} / {} bytes) do not fit into one {} byte page",
                uniforms.per_instance_buffer_size(),
                uniforms.per_material_buffer_size(),
                self.page_size_bytes
            )));
        }
        Ok(())
    }

    /// Resolved worker thread count.
    pub fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads > 0 {
            self.worker_threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}
