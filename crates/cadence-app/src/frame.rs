//! Per-frame context for rendering.

use ash::vk;

/// Timing and size of the frame being rendered.
#[derive(Debug, Clone, Copy)]
pub struct FrameContext {
    /// Delta time since last frame in seconds.
    pub dt: f32,
    /// Current frame number.
    pub frame_number: u64,
    /// Surface extent at the start of the frame.
    pub extent: vk::Extent2D,
}
