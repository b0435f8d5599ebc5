// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen,
// with double or triple buffering.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use super::VulkanDevice;

/// How many images the presentation engine cycles through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferingMode {
    Double,
    Triple,
}

impl BufferingMode {
    pub fn image_count(self) -> u32 {
        match self {
            BufferingMode::Double => 2,
            BufferingMode::Triple => 3,
        }
    }

    /// A `max_image_count` of zero means no upper limit
    pub fn is_supported(self, caps: &vk::SurfaceCapabilitiesKHR) -> bool {
        caps.max_image_count == 0 || caps.max_image_count >= self.image_count()
    }

    /// The requested mode, or double buffering when the surface can't do it
    pub fn resolve(self, caps: &vk::SurfaceCapabilitiesKHR) -> BufferingMode {
        if self.is_supported(caps) {
            self
        } else {
            log::warn!(
                "{:?} buffering not supported (max {} images), using double buffering",
                self,
                caps.max_image_count
            );
            BufferingMode::Double
        }
    }
}

/// Number of images to request for the given buffering mode
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR, mode: BufferingMode) -> u32 {
    let count = caps.min_image_count.max(mode.resolve(caps).image_count());
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

/// Prefer an SRGB format so colors come out gamma-correct
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    const PREFERRED: [vk::Format; 2] = [vk::Format::B8G8R8A8_SRGB, vk::Format::R8G8B8A8_SRGB];

    PREFERRED
        .iter()
        .find_map(|&format| {
            formats.iter().copied().find(|f| {
                f.format == format && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
        })
        .or_else(|| formats.first().copied())
}

/// The configured present mode when available, FIFO otherwise (always supported)
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&preferred) {
        preferred
    } else {
        log::warn!("Present mode {:?} not supported, using FIFO", preferred);
        vk::PresentModeKHR::FIFO
    }
}

/// `current_extent` wins unless the surface leaves the size up to us
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// Settings a swapchain is built from
#[derive(Debug, Clone, Copy)]
pub struct SwapchainDesc {
    pub width: u32,
    pub height: u32,
    pub present_mode: vk::PresentModeKHR,
    pub buffering: BufferingMode,
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: ash::extensions::khr::Swapchain,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    /// Create a swapchain, handing `old` to the driver so it can recycle it
    pub fn new(
        device: Arc<VulkanDevice>,
        desc: &SwapchainDesc,
        old: Option<&Swapchain>,
    ) -> Result<Self> {
        let surface = device.surface;
        let surface_loader = &device.surface_loader;

        // Query surface capabilities
        let surface_caps = unsafe {
            surface_loader.get_physical_device_surface_capabilities(device.physical_device, surface)
        }
        .context("Failed to query surface capabilities")?;

        // Query supported formats
        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(device.physical_device, surface)
        }
        .context("Failed to query surface formats")?;

        // Query supported present modes
        let present_modes = unsafe {
            surface_loader.get_physical_device_surface_present_modes(device.physical_device, surface)
        }
        .context("Failed to query present modes")?;

        let surface_format = choose_surface_format(&formats).context("No suitable surface format")?;
        let present_mode = choose_present_mode(&present_modes, desc.present_mode);
        let extent = choose_extent(&surface_caps, desc.width, desc.height);
        let image_count = choose_image_count(&surface_caps, desc.buffering);

        log::info!(
            "Creating swapchain: {}x{}, {:?}, {:?}, {} images requested",
            extent.width,
            extent.height,
            surface_format.format,
            present_mode,
            image_count
        );

        // Images are shared between the two families when they differ
        let families = device.queue_families;
        let family_indices = [families.graphics, families.present];
        let (sharing_mode, shared_families): (vk::SharingMode, &[u32]) = if families.is_shared() {
            (vk::SharingMode::EXCLUSIVE, &[])
        } else {
            (vk::SharingMode::CONCURRENT, &family_indices)
        };

        let swapchain_loader =
            ash::extensions::khr::Swapchain::new(&device.instance, &device.device);

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(shared_families)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old.map_or(vk::SwapchainKHR::null(), |old| old.swapchain));

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        // Get swapchain images
        let images = unsafe { swapchain_loader.get_swapchain_images(swapchain) }
            .context("Failed to get swapchain images")?;

        log::info!("Created swapchain with {} images", images.len());

        // Create image views
        let image_views: Result<Vec<_>> = images
            .iter()
            .map(|&image| {
                let create_info = vk::ImageViewCreateInfo::builder()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(surface_format.format)
                    .components(vk::ComponentMapping {
                        r: vk::ComponentSwizzle::IDENTITY,
                        g: vk::ComponentSwizzle::IDENTITY,
                        b: vk::ComponentSwizzle::IDENTITY,
                        a: vk::ComponentSwizzle::IDENTITY,
                    })
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    });

                unsafe {
                    device.device.create_image_view(&create_info, None)
                        .context("Failed to create image view")
                }
            })
            .collect();

        Ok(Self {
            swapchain,
            swapchain_loader,
            images,
            image_views: image_views?,
            format: surface_format.format,
            extent,
            present_mode,
            device,
        })
    }

    /// Acquire next image for rendering
    ///
    /// Returns `None` when the swapchain is out of date and must be recreated.
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<Option<(u32, bool)>> {
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, suboptimal)) => Ok(Some((index, suboptimal))),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(None),
            Err(e) => Err(e).context("Failed to acquire swapchain image"),
        }
    }

    /// Present rendered image to screen
    ///
    /// Returns `true` when the swapchain should be recreated.
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.swapchain_loader.queue_present(queue, &present_info) };

        match result {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(e).context("Failed to present swapchain image"),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for &view in &self.image_views {
                self.device.device.destroy_image_view(view, None);
            }
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: 640,
                height: 480,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    #[test]
    fn buffering_support() {
        assert!(BufferingMode::Double.is_supported(&caps(1, 2)));
        assert!(!BufferingMode::Triple.is_supported(&caps(1, 2)));
        assert!(BufferingMode::Triple.is_supported(&caps(1, 3)));
        assert!(BufferingMode::Triple.is_supported(&caps(1, 0)));
        assert!(!BufferingMode::Double.is_supported(&caps(1, 1)));
    }

    #[test]
    fn image_count_follows_mode() {
        assert_eq!(choose_image_count(&caps(1, 8), BufferingMode::Double), 2);
        assert_eq!(choose_image_count(&caps(1, 8), BufferingMode::Triple), 3);
        assert_eq!(choose_image_count(&caps(2, 0), BufferingMode::Triple), 3);
    }

    #[test]
    fn image_count_respects_surface_limits() {
        // Driver minimum wins over the mode
        assert_eq!(choose_image_count(&caps(4, 8), BufferingMode::Double), 4);
        // Triple falls back to double when only two images are allowed
        assert_eq!(choose_image_count(&caps(2, 2), BufferingMode::Triple), 2);
        // Never above the maximum
        assert_eq!(choose_image_count(&caps(1, 1), BufferingMode::Double), 1);
    }

    #[test]
    fn surface_format_prefers_srgb() {
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let rgba_srgb = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let bgra_srgb = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };

        let pick = |formats: &[vk::SurfaceFormatKHR]| choose_surface_format(formats).map(|f| f.format);
        assert_eq!(pick(&[unorm, rgba_srgb, bgra_srgb]), Some(bgra_srgb.format));
        assert_eq!(pick(&[unorm, rgba_srgb]), Some(rgba_srgb.format));
        assert_eq!(pick(&[unorm]), Some(unorm.format));
        assert_eq!(pick(&[]), None);
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&available, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&available, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_uses_current_or_clamps_window() {
        let fixed = caps(2, 3);
        assert_eq!(
            choose_extent(&fixed, 1920, 1080),
            vk::Extent2D {
                width: 640,
                height: 480
            }
        );

        let mut free = caps(2, 3);
        free.current_extent = vk::Extent2D {
            width: u32::MAX,
            height: u32::MAX,
        };
        assert_eq!(
            choose_extent(&free, 8000, 600),
            vk::Extent2D {
                width: 4096,
                height: 600
            }
        );
        assert_eq!(
            choose_extent(&free, 0, 0),
            vk::Extent2D {
                width: 1,
                height: 1
            }
        );
    }
}
