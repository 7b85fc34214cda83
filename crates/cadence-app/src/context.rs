//! Application context.

use std::sync::Arc;
use std::time::Instant;

use ash::vk;
use cadence_gpu::image::Image;
use cadence_gpu::{GpuContext, PresentOutcome, Presenter};
use winit::window::Window;

/// Application context shared across all app methods.
///
/// Owns the GPU context and the presenter for the window.
pub struct AppContext {
    /// The window handle.
    pub window: Arc<Window>,
    /// GPU context with device and queues.
    pub gpu: GpuContext,
    /// Swapchain, frame slots and pacing.
    pub presenter: Presenter,
    /// Total frames rendered.
    pub frame_count: u64,
    /// Time of last frame (for delta time calculation).
    pub(crate) last_frame_time: Instant,
}

impl AppContext {
    pub(crate) fn new(window: Arc<Window>, gpu: GpuContext, presenter: Presenter) -> Self {
        Self {
            window,
            gpu,
            presenter,
            frame_count: 0,
            last_frame_time: Instant::now(),
        }
    }

    /// Get the current surface extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.presenter.extent()
    }

    /// Get the surface width.
    pub fn width(&self) -> u32 {
        self.extent().width
    }

    /// Get the surface height.
    pub fn height(&self) -> u32 {
        self.extent().height
    }

    /// Get the aspect ratio (width / height).
    pub fn aspect_ratio(&self) -> f32 {
        let extent = self.extent();
        extent.width as f32 / extent.height.max(1) as f32
    }

    /// Whether shaders must encode sRGB themselves for this surface.
    pub fn srgb_required(&self) -> bool {
        self.presenter.srgb_required()
    }

    /// Blit `src` to the window. See [`Presenter::present`].
    pub fn present(
        &mut self,
        src: &mut Image,
        signal_in: vk::Semaphore,
        signal_out: vk::Semaphore,
    ) -> cadence_gpu::Result<PresentOutcome> {
        self.presenter.present(&self.gpu, src, signal_in, signal_out)
    }

    /// Rebuild the presenter at the window's current size.
    pub(crate) fn resize_to_window(&mut self) -> anyhow::Result<vk::Extent2D> {
        let size = self.window.inner_size();
        self.presenter.resize(&self.gpu, size.width, size.height)?;
        Ok(self.presenter.extent())
    }

    /// Cleanup all resources.
    pub(crate) fn cleanup(&mut self) {
        self.presenter.destroy(&self.gpu);
    }
}
