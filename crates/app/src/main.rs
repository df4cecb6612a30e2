//! forge - demo driver for the renderer core.
//!
//! Renders a grid of triangles, one draw call each, either into a window or
//! against the headless device for a fixed number of frames.

mod scene;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::WindowId;

use forge_core::{FrameClock, RayonScheduler, RendererConfig, TaskScheduler};
use forge_platform::{Window, required_extensions};
use forge_renderer::RenderSystem;
use forge_rhi::headless::{HeadlessDevice, HeadlessPresenter};
use forge_rhi::vk;
use forge_rhi::vulkan::{Instance, VulkanDevice, VulkanSwapchain, select_physical_device};
use forge_rhi::{GpuDevice, PipelineCacheStore};

use scene::{DemoScene, Shaders};

#[derive(Parser, Debug)]
#[command(name = "forge", version, about = "Parallel draw call recording demo")]
struct Cli {
    /// Renderer configuration file (JSON)
    #[arg(short, long, env = "FORGE_CONFIG")]
    config: Option<PathBuf>,

    /// Render against the headless device instead of a window
    #[arg(long)]
    headless: bool,

    /// Stop after this many frames (headless default: 120)
    #[arg(long)]
    frames: Option<u64>,

    /// Number of draw calls in the demo grid
    #[arg(long, default_value_t = 1024)]
    draw_calls: usize,

    /// Worker threads for recording (0 = one per core)
    #[arg(long)]
    workers: Option<usize>,

    #[arg(long, default_value_t = 1280)]
    width: u32,

    #[arg(long, default_value_t = 720)]
    height: u32,

    /// Disable the Vulkan validation layers
    #[arg(long)]
    no_validation: bool,

    /// Directory holding demo.vert.spv and demo.frag.spv
    #[arg(long)]
    shader_dir: Option<PathBuf>,
}

impl Cli {
    fn renderer_config(&self) -> Result<RendererConfig> {
        let mut config = match &self.config {
            Some(path) => RendererConfig::load(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => RendererConfig::default(),
        };
        if let Some(workers) = self.workers {
            config.worker_threads = workers;
        }
        if self.no_validation {
            config.validation = false;
        }
        config.validate()?;
        Ok(config)
    }

    fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.width,
            height: self.height,
        }
    }
}

fn scheduler(config: &RendererConfig) -> Result<Arc<dyn TaskScheduler>> {
    let scheduler = RayonScheduler::new(config.resolved_worker_threads())?;
    Ok(Arc::new(scheduler))
}

fn run_headless(cli: &Cli, config: &RendererConfig) -> Result<()> {
    let device = HeadlessDevice::new();
    let presenter = HeadlessPresenter::new(&device, 3, cli.extent());
    let device: Arc<dyn GpuDevice> = Arc::new(device);
    let mut system = RenderSystem::new(device, Box::new(presenter), scheduler(config)?, config)?;
    let mut scene = DemoScene::new(&mut system, Some(Shaders::headless()), cli.draw_calls)?;

    let frames = cli.frames.unwrap_or(120);
    let mut clock = FrameClock::new();
    let mut rendered = 0u64;
    for _ in 0..frames {
        clock.tick();
        let dt = clock.delta_secs();
        system.update(dt)?;
        scene.update(dt);
        if scene.render(&mut system)? {
            rendered += 1;
        }
    }

    let stats = system.dispatcher().stats();
    info!(
        "Rendered {}/{} frames, last frame: {} draws in {} batches, {:.1} fps",
        rendered,
        frames,
        stats.draw_calls,
        stats.batches,
        clock.average_fps()
    );
    system.shutdown()?;
    Ok(())
}

/// Live window state. Field order is drop order: the render system owns the
/// swapchain, whose surface must go before the window.
struct Running {
    scene: DemoScene,
    system: RenderSystem,
    window: Window,
}

struct App {
    cli: Cli,
    config: RendererConfig,
    running: Option<Running>,
    clock: FrameClock,
    error: Option<anyhow::Error>,
}

impl App {
    fn new(cli: Cli, config: RendererConfig) -> Self {
        Self {
            cli,
            config,
            running: None,
            clock: FrameClock::new(),
            error: None,
        }
    }

    fn start(&self, event_loop: &ActiveEventLoop) -> Result<Running> {
        let window = Window::new(event_loop, self.cli.width, self.cli.height, "forge")?;
        let extensions = required_extensions(event_loop)?;
        let instance = Arc::new(Instance::new(self.config.validation, &extensions)?);
        let surface = window.create_surface(&instance)?;
        let physical = select_physical_device(instance.handle(), surface.handle(), surface.loader())?;
        info!("Using GPU: {}", physical.device_name());

        let cache = self.config.pipeline_cache_dir.as_ref().and_then(|dir| {
            PipelineCacheStore::new(dir).load(&physical.device_info().pipeline_cache_uuid)
        });
        let device = Arc::new(VulkanDevice::new(instance, physical, cache.as_deref())?);
        let swapchain = VulkanSwapchain::new(device.clone(), surface, window.extent(), self.config.vsync)?;

        let mut system =
            RenderSystem::new(device, Box::new(swapchain), scheduler(&self.config)?, &self.config)?;
        let shaders = self
            .cli
            .shader_dir
            .as_deref()
            .map(Shaders::load)
            .transpose()?;
        let scene = DemoScene::new(&mut system, shaders, self.cli.draw_calls)?;
        info!("Initialization complete, entering main loop");
        Ok(Running {
            scene,
            system,
            window,
        })
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, e: anyhow::Error) {
        error!("{:#}", e);
        self.error = Some(e);
        event_loop.exit();
    }

    fn redraw(&mut self) -> Result<bool> {
        let Some(running) = self.running.as_mut() else {
            return Ok(true);
        };
        self.clock.tick();
        let dt = self.clock.delta_secs();
        running.system.update(dt)?;
        running.scene.update(dt);
        running.scene.render(&mut running.system)?;
        Ok(self
            .cli
            .frames
            .is_none_or(|limit| self.clock.frame_count() < limit))
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.running.is_some() {
            return;
        }
        match self.start(event_loop) {
            Ok(running) => self.running = Some(running),
            Err(e) => self.fail(event_loop, e),
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested, shutting down");
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(running) = self.running.as_mut() {
                    running.window.resize(size.width, size.height);
                    running.system.resize(size.width, size.height);
                }
            }
            WindowEvent::RedrawRequested => match self.redraw() {
                Ok(true) => {}
                Ok(false) => event_loop.exit(),
                Err(e) => self.fail(event_loop, e),
            },
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(running) = &self.running {
            running.window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(mut running) = self.running.take()
            && let Err(e) = running.system.shutdown()
        {
            error!("Shutdown failed: {}", e);
        }
    }
}

fn main() -> Result<()> {
    forge_core::init_logging();
    let cli = Cli::parse();
    let config = cli.renderer_config()?;
    info!("Starting forge with {} workers", config.resolved_worker_threads());

    if cli.headless {
        return run_headless(&cli, &config);
    }

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);
    let mut app = App::new(cli, config);
    event_loop.run_app(&mut app)?;
    match app.error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_config() {
        let cli = Cli::parse_from(["forge", "--headless", "--workers", "3", "--no-validation"]);
        let config = cli.renderer_config().unwrap();
        assert_eq!(config.worker_threads, 3);
        assert!(!config.validation);
        assert!(cli.headless);
    }

    #[test]
    fn test_headless_run() {
        let cli = Cli::parse_from(["forge", "--headless", "--frames", "5", "--draw-calls", "16"]);
        let mut config = cli.renderer_config().unwrap();
        config.page_size_bytes = 4 * 1024 * 1024;
        config.uniforms.small_block_count = 64;
        config.uniforms.large_block_count = 16;
        config.uniforms.material_block_count = 64;
        run_headless(&cli, &config).unwrap();
    }
}
