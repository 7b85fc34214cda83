//! Vulkan device, resource and presentation layer for Cadence.
//!
//! This crate provides:
//! - Capability-driven physical device selection
//! - Logical device creation with queue roles and oneshot submissions
//! - Buffers and images that track their own synchronization state
//! - Frame-paced presentation over a rotating set of frame slots
//! - Pipelines whose descriptor sets and vertex input come from shader reflection

pub mod buffer;
pub mod capabilities;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod error;
pub mod features;
pub mod image;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod presenter;
pub mod queues;
pub mod reflect;
pub mod selector;
pub mod shader;
pub mod state;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use buffer::{Buffer, BufferDesc};
pub use capabilities::{DeviceCandidate, GpuVendor};
pub use context::{default_requirements, DepthFormats, GpuContext, GpuContextBuilder};
pub use descriptors::{default_sampler_info, DescriptorBundle, SamplerOverrides};
pub use error::{GpuError, Result};
pub use features::{FeatureSet, OptionalFeature};
pub use image::{Image, ImageDesc};
pub use memory::GpuAllocator;
pub use pipeline::{
    ComputeDesc, ComputePipeline, DepthState, GraphicsDesc, GraphicsPipeline, StencilState,
};
pub use presenter::{FramePacer, PresentOutcome, Presenter, PresenterConfig};
pub use queues::{Queue, QueueRole};
pub use selector::DeviceRequirements;
pub use shader::{ShaderModuleStrategy, ShaderStage};
pub use state::{Ownership, ResourceState};
pub use surface::{SurfaceCapabilities, SurfaceContext};
pub use sync::{create_fence, create_semaphore, FrameSlot, SlotRing};
