//! Swapchain management.

use crate::error::{GpuError, Result};
use crate::image::Image;
use ash::prelude::VkResult;
use ash::vk;

/// Surface formats in order of preference, all with `SRGB_NONLINEAR`.
pub const PREFERRED_FORMATS: [vk::Format; 8] = [
    vk::Format::A2R10G10B10_UNORM_PACK32,
    vk::Format::A2B10G10R10_UNORM_PACK32,
    vk::Format::R16G16B16A16_SFLOAT,
    vk::Format::R16G16B16A16_UNORM,
    vk::Format::R8G8B8A8_SRGB,
    vk::Format::B8G8R8A8_SRGB,
    vk::Format::R8G8B8A8_UNORM,
    vk::Format::B8G8R8A8_UNORM,
];

/// Swapchain wrapper.
pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    /// Surface images wrapped for state tracking; they have no views.
    pub images: Vec<Image>,
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
}

impl Swapchain {
    /// Create a new swapchain whose images can be blitted to.
    ///
    /// # Safety
    /// All handles must be valid.
    pub unsafe fn new(
        swapchain_loader: &ash::khr::swapchain::Device,
        surface: vk::SurfaceKHR,
        surface_capabilities: &vk::SurfaceCapabilitiesKHR,
        surface_format: vk::SurfaceFormatKHR,
        present_mode: vk::PresentModeKHR,
        extent: vk::Extent2D,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<Self> {
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count(surface_capabilities))
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(surface_capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = swapchain_loader
            .create_swapchain(&create_info, None)
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;

        let images = match swapchain_loader.get_swapchain_images(swapchain) {
            Ok(images) => images,
            Err(e) => {
                swapchain_loader.destroy_swapchain(swapchain, None);
                return Err(e.into());
            }
        };
        let images = images
            .into_iter()
            .map(|image| {
                Image::wrap(
                    image,
                    vk::ImageView::null(),
                    surface_format.format,
                    extent,
                    vk::ImageAspectFlags::COLOR,
                )
            })
            .collect();

        Ok(Self {
            swapchain,
            images,
            format: surface_format,
            present_mode,
            extent,
        })
    }

    /// Acquire the next image, signalling `semaphore` when it is writable.
    ///
    /// # Safety
    /// All handles must be valid.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub unsafe fn acquire_next_image(
        &self,
        swapchain_loader: &ash::khr::swapchain::Device,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        swapchain_loader.acquire_next_image(self.swapchain, u64::MAX, semaphore, vk::Fence::null())
    }

    /// Present an image.
    ///
    /// # Safety
    /// All handles must be valid.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub unsafe fn present(
        &self,
        swapchain_loader: &ash::khr::swapchain::Device,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> VkResult<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        swapchain_loader.queue_present(queue, &present_info)
    }

    /// Destroy the swapchain. The wrapped images go with it.
    ///
    /// # Safety
    /// The swapchain must not be in use.
    pub unsafe fn destroy(&mut self, swapchain_loader: &ash::khr::swapchain::Device) {
        self.images.clear();
        swapchain_loader.destroy_swapchain(self.swapchain, None);
        self.swapchain = vk::SwapchainKHR::null();
    }
}

/// Select the best surface format.
///
/// Falls back to the first available format.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    PREFERRED_FORMATS
        .iter()
        .find_map(|&preferred| {
            available.iter().copied().find(|format| {
                format.format == preferred && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
        })
        .or_else(|| available.first().copied())
}

/// Whether shaders must apply sRGB encoding themselves for this format.
pub fn srgb_required(format: vk::Format) -> bool {
    !matches!(
        format,
        vk::Format::R8G8B8A8_SRGB | vk::Format::B8G8R8A8_SRGB
    )
}

/// Select the best present mode.
///
/// With vsync the order is FIFO, MAILBOX, IMMEDIATE; without it MAILBOX,
/// IMMEDIATE, FIFO. FIFO is always supported.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    let preference: [vk::PresentModeKHR; 3] = if vsync {
        [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
        ]
    } else {
        [
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::FIFO,
        ]
    };
    preference
        .into_iter()
        .find(|mode| available.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Calculate swapchain extent.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

/// One more than the minimum image count, bounded by the maximum (0 = unbounded).
pub fn image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface_format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn preferred_format_wins_over_order() {
        let available = [
            surface_format(vk::Format::B8G8R8A8_UNORM),
            surface_format(vk::Format::B8G8R8A8_SRGB),
            surface_format(vk::Format::A2B10G10R10_UNORM_PACK32),
        ];
        let chosen = select_surface_format(&available).unwrap();
        assert_eq!(chosen.format, vk::Format::A2B10G10R10_UNORM_PACK32);
        assert!(srgb_required(chosen.format));
    }

    #[test]
    fn color_space_must_match() {
        let available = [
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
            },
            surface_format(vk::Format::B8G8R8A8_SRGB),
        ];
        let chosen = select_surface_format(&available).unwrap();
        assert_eq!(chosen.color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);
        assert!(!srgb_required(chosen.format));
    }

    #[test]
    fn unknown_formats_fall_back_to_first() {
        let available = [
            surface_format(vk::Format::R5G6B5_UNORM_PACK16),
            surface_format(vk::Format::R4G4B4A4_UNORM_PACK16),
        ];
        assert_eq!(
            select_surface_format(&available).unwrap().format,
            vk::Format::R5G6B5_UNORM_PACK16
        );
        assert!(select_surface_format(&[]).is_none());
    }

    #[test]
    fn present_mode_preference() {
        let all = [
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::FIFO,
        ];
        assert_eq!(select_present_mode(&all, true), vk::PresentModeKHR::FIFO);
        assert_eq!(select_present_mode(&all, false), vk::PresentModeKHR::MAILBOX);

        let no_mailbox = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            select_present_mode(&no_mailbox, false),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(select_present_mode(&[], false), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn extent_uses_current_or_clamps() {
        let mut caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            ..Default::default()
        };
        assert_eq!(calculate_extent(&caps, 1280, 720).width, 800);

        caps.current_extent.width = u32::MAX;
        let extent = calculate_extent(&caps, 4000, 0);
        assert_eq!(extent.width, 1920);
        assert_eq!(extent.height, 1);
    }

    #[test]
    fn image_count_respects_bounds() {
        let mut caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(image_count(&caps), 3);
        caps.max_image_count = 2;
        assert_eq!(image_count(&caps), 2);
        caps.max_image_count = 8;
        assert_eq!(image_count(&caps), 3);
    }
}
