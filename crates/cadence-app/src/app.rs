//! `CadenceApp` trait definition.

use crate::context::AppContext;
use crate::frame::FrameContext;
use winit::event::WindowEvent;

/// Trait for Cadence applications.
///
/// The framework creates the window, the GPU context and the presenter, and
/// rebuilds the surface when the window changes size. Applications record
/// their own work and hand a finished image to [`AppContext::present`].
pub trait CadenceApp: Sized {
    /// Initialize the application.
    ///
    /// Called once when the application starts, after the GPU context and
    /// presenter have been created.
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self>;

    /// Update application state.
    ///
    /// Called every frame before rendering.
    ///
    /// # Arguments
    /// * `ctx` - Application context with GPU and window access
    /// * `dt` - Delta time in seconds since last frame
    fn update(&mut self, ctx: &AppContext, dt: f32);

    /// Render and present a frame.
    ///
    /// You are responsible for:
    /// - Recording and submitting rendering commands
    /// - Presenting the result with [`AppContext::present`]
    fn render(&mut self, ctx: &mut AppContext, frame: &FrameContext) -> anyhow::Result<()>;

    /// Handle a rebuilt surface.
    ///
    /// Called after the presenter has been resized. The GPU is idle.
    ///
    /// Default implementation does nothing.
    #[allow(unused_variables)]
    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle window events.
    ///
    /// Return `true` if the event was handled and should not be processed
    /// further.
    #[allow(unused_variables)]
    fn on_event(&mut self, event: &WindowEvent) -> bool {
        false
    }

    /// Cleanup resources before shutdown.
    ///
    /// The GPU is idle when this is called.
    #[allow(unused_variables)]
    fn cleanup(&mut self, ctx: &mut AppContext) {}
}
