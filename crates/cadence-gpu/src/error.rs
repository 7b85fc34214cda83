//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// The Vulkan loader could not be found or initialized.
    #[error("Failed to load Vulkan: {0}")]
    Loading(String),

    /// No physical device passed every requirement check.
    ///
    /// Carries one line per rejected device naming the failed checks.
    #[error("None of the devices match the requirements:\n{0}")]
    NoSuitableDevice(String),

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// A shader binary could not be parsed for reflection.
    #[error("Shader reflection failed: {0}")]
    ShaderReflection(String),

    /// The same descriptor slot is declared differently by two shader stages.
    #[error("Binding (set {set}, binding {binding}) differs between stages: {detail}")]
    ReflectionMismatch {
        set: u32,
        binding: u32,
        detail: String,
    },

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Host access to memory that is not host-visible.
    #[error("Buffer '{0}' is not host-visible and staging is not implemented")]
    StagingRequired(String),

    /// A read or write would cross the end of a resource.
    #[error("Range {offset}..{end} exceeds resource size {size}")]
    OutOfRange { offset: u64, end: u64, size: u64 },

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
