//! Application runner and event loop.

use std::sync::Arc;
use std::time::Instant;

use cadence_gpu::{GpuContextBuilder, Presenter, PresenterConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::app::CadenceApp;
use crate::context::AppContext;
use crate::frame::FrameContext;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Window title.
    pub title: String,
    /// Initial window width.
    pub width: u32,
    /// Initial window height.
    pub height: u32,
    /// Target frames per second (None for unlimited).
    pub target_fps: Option<u32>,
    /// Enable vsync.
    pub vsync: bool,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Cadence".to_string(),
            width: 1280,
            height: 720,
            target_fps: None,
            vsync: true,
            validation: cfg!(debug_assertions),
        }
    }
}

impl AppConfig {
    /// Create a new config with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Set the window dimensions.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the target FPS.
    pub fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    /// Enable or disable vsync.
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Enable or disable validation layers.
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    fn presenter_config(&self, size: PhysicalSize<u32>) -> PresenterConfig {
        PresenterConfig {
            width: size.width,
            height: size.height,
            vsync: self.vsync,
            target_fps: self.target_fps.unwrap_or(0),
        }
    }
}

/// Run a `CadenceApp` with the given configuration.
///
/// This function initializes logging, creates the window, GPU context and
/// presenter, and runs the event loop until the application exits. Errors
/// raised while starting up are returned once the loop has exited.
pub fn run_app<A: CadenceApp + 'static>(config: AppConfig) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("{} starting...", config.title);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner::<A> {
        config,
        state: None,
        startup_error: None,
    };

    if let Err(e) = event_loop.run_app(&mut runner) {
        error!("Event loop error: {e}");
    }

    runner.startup_error.map_or(Ok(()), Err)
}

/// Internal application runner that implements winit's `ApplicationHandler`.
struct AppRunner<A: CadenceApp> {
    config: AppConfig,
    state: Option<AppState<A>>,
    startup_error: Option<anyhow::Error>,
}

/// Internal application state.
struct AppState<A: CadenceApp> {
    ctx: AppContext,
    app: A,
    // FPS tracking
    min_fps: f64,
    max_fps: f64,
    fps_sum: f64,
}

impl<A: CadenceApp + 'static> ApplicationHandler for AppRunner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        info!("Creating application state...");

        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Application ready!");
            }
            Err(e) => {
                error!("Failed to initialize application: {e:#}");
                self.startup_error = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        // Let the app handle the event first
        if let Some(state) = &mut self.state {
            if state.app.on_event(&event) {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                if let Some(mut state) = self.state.take() {
                    state.cleanup();
                }
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => {
                if let Some(state) = &mut self.state {
                    if let Err(e) = state.render_frame() {
                        error!("Render error: {e:#}");
                    }
                    state.ctx.window.request_redraw();
                }
            }
            WindowEvent::Resized(size) => {
                if let Some(state) = &mut self.state {
                    state.ctx.presenter.request_resize();
                    if let Err(e) = state.handle_resize() {
                        error!("Resize error: {e:#}");
                    }
                    info!("Window resized to {}x{}", size.width, size.height);
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.ctx.window.request_redraw();
        }
    }
}

impl<A: CadenceApp + 'static> AppRunner<A> {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState<A>> {
        let window_attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));

        let window = Arc::new(event_loop.create_window(window_attrs)?);

        let (gpu, surface) = GpuContextBuilder::new()
            .app_name(&self.config.title)
            .validation(self.config.validation)
            .build_for_window(window.as_ref())?;

        info!("GPU: {}", gpu.device_info().summary());

        let presenter = Presenter::new(&gpu, surface, self.config.presenter_config(window.inner_size()))?;
        let mut ctx = AppContext::new(window, gpu, presenter);

        let app = match A::init(&mut ctx) {
            Ok(app) => app,
            Err(e) => {
                ctx.cleanup();
                return Err(e);
            }
        };

        Ok(AppState {
            ctx,
            app,
            min_fps: f64::MAX,
            max_fps: 0.0,
            fps_sum: 0.0,
        })
    }
}

impl<A: CadenceApp> AppState<A> {
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn render_frame(&mut self) -> anyhow::Result<()> {
        if self.ctx.presenter.resize_requested() {
            self.handle_resize()?;
            if self.ctx.presenter.resize_requested() {
                // Minimized; nothing to draw into.
                return Ok(());
            }
        }

        let now = Instant::now();
        let dt = now.duration_since(self.ctx.last_frame_time).as_secs_f32();
        self.ctx.last_frame_time = now;

        if dt > 0.0 {
            let fps = 1.0 / f64::from(dt);
            self.min_fps = self.min_fps.min(fps);
            self.max_fps = self.max_fps.max(fps);
            self.fps_sum += fps;
        }

        self.app.update(&self.ctx, dt);

        let frame = FrameContext {
            dt,
            frame_number: self.ctx.frame_count,
            extent: self.ctx.extent(),
        };
        self.app.render(&mut self.ctx, &frame)?;

        self.ctx.frame_count += 1;
        Ok(())
    }

    fn handle_resize(&mut self) -> anyhow::Result<()> {
        let extent = self.ctx.resize_to_window()?;
        if self.ctx.presenter.resize_requested() {
            return Ok(());
        }

        // Notify the application
        self.app.on_resize(&mut self.ctx, extent.width, extent.height)?;
        Ok(())
    }

    fn cleanup(&mut self) {
        // Print FPS statistics
        if self.ctx.frame_count > 0 {
            let avg_fps = self.fps_sum / self.ctx.frame_count as f64;
            info!("FPS Statistics:");
            info!("  Min: {:.1}", self.min_fps);
            info!("  Max: {:.1}", self.max_fps);
            info!("  Avg: {:.1}", avg_fps);
            info!("  Total frames: {}", self.ctx.frame_count);
        }

        info!("Starting cleanup...");
        if let Err(e) = self.ctx.gpu.wait_idle() {
            error!("Failed to wait idle: {e}");
        }

        // Let the app cleanup first
        self.app.cleanup(&mut self.ctx);

        // Then cleanup context resources
        self.ctx.cleanup();

        info!("Cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = AppConfig::new("Test");
        assert_eq!(config.title, "Test");
        assert_eq!((config.width, config.height), (1280, 720));
        assert_eq!(config.target_fps, None);
        assert!(config.vsync);
        assert_eq!(config.validation, cfg!(debug_assertions));
    }

    #[test]
    fn unlimited_fps_maps_to_zero() {
        let size = PhysicalSize::new(640, 480);
        let config = AppConfig::new("Test").with_vsync(false);
        let presenter = config.presenter_config(size);
        assert_eq!(presenter.target_fps, 0);
        assert!(!presenter.vsync);

        let presenter = config.with_target_fps(30).presenter_config(size);
        assert_eq!(presenter.target_fps, 30);
        assert_eq!((presenter.width, presenter.height), (640, 480));
    }
}
