//! GPU images with tracked layout and synchronization state.

use crate::buffer::{Buffer, BufferDesc};
use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::queues::QueueRole;
use crate::state::{full_range, image_barrier, Ownership, ResourceState};
use ash::vk;
use gpu_allocator::vulkan::Allocation;

/// Parameters for [`Image::new`].
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc<'a> {
    pub name: &'a str,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub aspects: vk::ImageAspectFlags,
}

/// A 2D image, its view and its memory.
pub struct Image {
    image: vk::Image,
    view: vk::ImageView,
    format: vk::Format,
    extent: vk::Extent3D,
    aspects: vk::ImageAspectFlags,
    state: ResourceState,
    allocation: Option<Allocation>,
    ownership: Ownership,
}

impl Image {
    /// Create a device-local image with a single mip level and layer.
    pub fn new(gpu: &GpuContext, desc: &ImageDesc<'_>) -> Result<Self> {
        let extent = vk::Extent3D {
            width: desc.extent.width,
            height: desc.extent.height,
            depth: 1,
        };
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let device = gpu.device();
        let image = unsafe { device.create_image(&image_info, None)? };

        let allocation = match gpu.allocator().lock().allocate_image(image, desc.name) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .components(vk::ComponentMapping::default())
            .subresource_range(full_range(desc.aspects));
        let view = match unsafe { device.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                gpu.allocator().lock().free(allocation)?;
                return Err(e.into());
            }
        };

        Ok(Self {
            image,
            view,
            format: desc.format,
            extent,
            aspects: desc.aspects,
            state: ResourceState::INITIAL,
            allocation: Some(allocation),
            ownership: Ownership::Owned,
        })
    }

    /// Depth attachment in the device's preferred depth format.
    pub fn new_depth(gpu: &GpuContext, extent: vk::Extent2D) -> Result<Self> {
        Self::new_depth_image(gpu, extent, gpu.depth_formats().depth, "depth")
    }

    /// Depth-stencil attachment in the device's preferred format.
    pub fn new_depth_stencil(gpu: &GpuContext, extent: vk::Extent2D) -> Result<Self> {
        Self::new_depth_image(gpu, extent, gpu.depth_formats().depth_stencil, "depth-stencil")
    }

    fn new_depth_image(
        gpu: &GpuContext,
        extent: vk::Extent2D,
        format: vk::Format,
        name: &str,
    ) -> Result<Self> {
        if format == vk::Format::UNDEFINED {
            return Err(GpuError::InvalidState(format!("No supported {name} format")));
        }
        Self::new(
            gpu,
            &ImageDesc {
                name,
                extent,
                format,
                usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
                aspects: depth_aspects(format),
            },
        )
    }

    /// Track an image created elsewhere, such as a swapchain image.
    ///
    /// `view` may be null when the image is only used for transfers.
    pub fn wrap(
        image: vk::Image,
        view: vk::ImageView,
        format: vk::Format,
        extent: vk::Extent2D,
        aspects: vk::ImageAspectFlags,
    ) -> Self {
        Self {
            image,
            view,
            format,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            aspects,
            state: ResourceState::INITIAL,
            allocation: None,
            ownership: Ownership::Wrapped,
        }
    }

    pub fn handle(&self) -> vk::Image {
        self.image
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.extent.width,
            height: self.extent.height,
        }
    }

    pub fn aspects(&self) -> vk::ImageAspectFlags {
        self.aspects
    }

    /// Last transitioned state.
    pub fn state(&self) -> ResourceState {
        self.state
    }

    /// Current layout.
    pub fn layout(&self) -> vk::ImageLayout {
        self.state.layout
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Record a barrier moving the image into `layout` for `stage`/`access`.
    pub fn transition(
        &mut self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        layout: vk::ImageLayout,
        stage: vk::PipelineStageFlags2,
        access: vk::AccessFlags2,
    ) {
        let next = ResourceState::new(stage, access, layout);
        record_barrier(device, cmd, &mut self.state, next, self.image, self.aspects);
    }

    /// Overwrite the tracked state without recording a barrier.
    ///
    /// For images whose state changed outside this crate, such as a surface
    /// image handed back by the presentation engine.
    pub fn assume_state(&mut self, state: ResourceState) {
        self.state = state;
    }

    /// Blit the whole of `src` onto the whole of this image with linear filtering.
    ///
    /// `src` must be in `TRANSFER_SRC_OPTIMAL` and this image in
    /// `TRANSFER_DST_OPTIMAL`.
    pub fn blit(&self, device: &ash::Device, cmd: vk::CommandBuffer, src: &Self) {
        let region = vk::ImageBlit2::default()
            .src_subresource(color_layers(src.aspects))
            .src_offsets(full_offsets(src.extent))
            .dst_subresource(color_layers(self.aspects))
            .dst_offsets(full_offsets(self.extent));
        let regions = [region];
        let blit_info = vk::BlitImageInfo2::default()
            .src_image(src.image)
            .src_image_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .dst_image(self.image)
            .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .regions(&regions)
            .filter(vk::Filter::LINEAR);
        unsafe { device.cmd_blit_image2(cmd, &blit_info) };
    }

    /// Upload tightly packed texels through a staging buffer.
    ///
    /// Blocks until the copy has executed. The image is left in
    /// `TRANSFER_DST_OPTIMAL`; its tracked state only changes once the copy
    /// has completed.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn upload(&mut self, gpu: &GpuContext, bytes: &[u8]) -> Result<()> {
        check_upload_len(self.format, self.extent, bytes.len())?;
        let mut staging = Buffer::new(
            gpu,
            &BufferDesc::new("staging", bytes.len() as vk::DeviceSize, vk::BufferUsageFlags::TRANSFER_SRC)
                .host_accessible(),
        )?;

        let mut state = self.state;
        let result = staging.write_bytes(gpu.device(), 0, bytes).and_then(|()| {
            gpu.oneshot(QueueRole::Universal, |cmd| {
                let device = gpu.device();
                let next = ResourceState::new(
                    vk::PipelineStageFlags2::TRANSFER,
                    vk::AccessFlags2::TRANSFER_WRITE,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                );
                record_barrier(device, cmd, &mut state, next, self.image, self.aspects);
                let region = vk::BufferImageCopy2::default()
                    .image_subresource(color_layers(self.aspects))
                    .image_extent(self.extent);
                let regions = [region];
                let copy_info = vk::CopyBufferToImageInfo2::default()
                    .src_buffer(staging.handle())
                    .dst_image(self.image)
                    .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                    .regions(&regions);
                unsafe { device.cmd_copy_buffer_to_image2(cmd, &copy_info) };
                Ok(())
            })
        });
        if result.is_ok() {
            self.state = state;
        }

        staging.destroy(gpu)?;
        result
    }

    /// Free the view, image and memory. Does nothing for wrapped images.
    pub fn destroy(&mut self, gpu: &GpuContext) -> Result<()> {
        if self.ownership == Ownership::Wrapped {
            return Ok(());
        }
        unsafe {
            gpu.device().destroy_image_view(self.view, None);
            gpu.device().destroy_image(self.image, None);
        }
        self.view = vk::ImageView::null();
        self.image = vk::Image::null();
        if let Some(allocation) = self.allocation.take() {
            gpu.allocator().lock().free(allocation)?;
        }
        Ok(())
    }
}

/// Aspects covered by a depth or depth-stencil format.
pub fn depth_aspects(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::DEPTH,
    }
}

fn record_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    state: &mut ResourceState,
    next: ResourceState,
    image: vk::Image,
    aspects: vk::ImageAspectFlags,
) {
    let barrier = image_barrier(state, next, image, full_range(aspects));
    let barriers = [barrier];
    let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
    unsafe { device.cmd_pipeline_barrier2(cmd, &dependency) };
}

/// Bytes per texel for the uncompressed color formats uploads accept.
pub fn texel_size(format: vk::Format) -> Option<u64> {
    let size = match format {
        vk::Format::R8_UNORM | vk::Format::R8_SRGB => 1,
        vk::Format::R8G8_UNORM | vk::Format::R16_SFLOAT => 2,
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::A2B10G10R10_UNORM_PACK32
        | vk::Format::R16G16_SFLOAT
        | vk::Format::R32_SFLOAT => 4,
        vk::Format::R16G16B16A16_SFLOAT
        | vk::Format::R16G16B16A16_UNORM
        | vk::Format::R32G32_SFLOAT => 8,
        vk::Format::R32G32B32A32_SFLOAT => 16,
        _ => return None,
    };
    Some(size)
}

fn check_upload_len(format: vk::Format, extent: vk::Extent3D, len: usize) -> Result<()> {
    let texel = texel_size(format)
        .ok_or_else(|| GpuError::InvalidState(format!("Cannot upload to {format:?} images")))?;
    let needed = u64::from(extent.width) * u64::from(extent.height) * u64::from(extent.depth) * texel;
    if (len as u64) < needed {
        return Err(GpuError::OutOfRange {
            offset: 0,
            end: needed,
            size: len as u64,
        });
    }
    Ok(())
}

fn color_layers(aspects: vk::ImageAspectFlags) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers::default()
        .aspect_mask(aspects)
        .mip_level(0)
        .base_array_layer(0)
        .layer_count(1)
}

fn full_offsets(extent: vk::Extent3D) -> [vk::Offset3D; 2] {
    [
        vk::Offset3D::default(),
        vk::Offset3D {
            x: extent.width as i32,
            y: extent.height as i32,
            z: extent.depth as i32,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrapped() -> Image {
        Image::wrap(
            vk::Image::null(),
            vk::ImageView::null(),
            vk::Format::B8G8R8A8_SRGB,
            vk::Extent2D {
                width: 640,
                height: 480,
            },
            vk::ImageAspectFlags::COLOR,
        )
    }

    #[test]
    fn wrapped_image_starts_undefined() {
        let image = wrapped();
        assert_eq!(image.ownership(), Ownership::Wrapped);
        assert_eq!(image.layout(), vk::ImageLayout::UNDEFINED);
        assert_eq!(image.state(), ResourceState::INITIAL);
        assert_eq!(image.extent().width, 640);
    }

    #[test]
    fn blit_offsets_span_extent() {
        let offsets = full_offsets(wrapped().extent);
        assert_eq!(offsets[0], vk::Offset3D::default());
        assert_eq!(offsets[1], vk::Offset3D { x: 640, y: 480, z: 1 });
    }

    #[test]
    fn upload_needs_a_texel_per_pixel() {
        let extent = vk::Extent3D {
            width: 4,
            height: 2,
            depth: 1,
        };
        assert!(check_upload_len(vk::Format::R8G8B8A8_UNORM, extent, 32).is_ok());
        assert!(matches!(
            check_upload_len(vk::Format::R8G8B8A8_UNORM, extent, 31),
            Err(GpuError::OutOfRange { end: 32, size: 31, .. })
        ));
        assert!(check_upload_len(vk::Format::R16G16B16A16_SFLOAT, extent, 32).is_err());
        assert!(check_upload_len(vk::Format::BC1_RGB_UNORM_BLOCK, extent, 1024).is_err());
    }

    #[test]
    fn assumed_state_replaces_tracking() {
        let mut image = wrapped();
        let acquired = ResourceState::new(
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::NONE,
            vk::ImageLayout::UNDEFINED,
        );
        image.assume_state(acquired);
        assert_eq!(image.state(), acquired);
    }

    #[test]
    fn depth_aspects_include_stencil_when_present() {
        assert_eq!(depth_aspects(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            depth_aspects(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }
}
