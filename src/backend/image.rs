// Depth buffer
//
// One depth image shared by every framebuffer, sized like the swapchain.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;
use super::VulkanDevice;

/// Depth formats to try, best first
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// First candidate whose optimal tiling can be a depth attachment
pub fn pick_depth_format<F>(candidates: &[vk::Format], mut properties: F) -> Option<vk::Format>
where
    F: FnMut(vk::Format) -> vk::FormatProperties,
{
    candidates.iter().copied().find(|&format| {
        properties(format)
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
    })
}

pub fn find_depth_format(device: &VulkanDevice) -> Result<vk::Format> {
    pick_depth_format(&DEPTH_FORMAT_CANDIDATES, |format| unsafe {
        device
            .instance
            .get_physical_device_format_properties(device.physical_device, format)
    })
    .context("No supported depth format")
}

pub struct DepthImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    allocation: Option<Allocation>,
    device: Arc<VulkanDevice>,
}

impl DepthImage {
    pub fn new(device: Arc<VulkanDevice>, format: vk::Format, extent: vk::Extent2D) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.device.create_image(&image_info, None) }
            .context("Failed to create depth image")?;

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };
        let allocation = match device.allocate(&AllocationCreateDesc {
            name: "depth image",
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let mut depth = Self {
            image,
            view: vk::ImageView::null(),
            allocation: Some(allocation),
            device,
        };

        // From here on Drop cleans up whatever was created
        let allocation = depth.allocation.as_ref().context("Depth allocation missing")?;
        unsafe {
            depth
                .device
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        }
        .context("Failed to bind depth image memory")?;

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::DEPTH,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        depth.view = unsafe { depth.device.device.create_image_view(&view_info, None) }
            .context("Failed to create depth image view")?;

        log::debug!(
            "Created depth buffer {}x{} ({:?})",
            extent.width,
            extent.height,
            format
        );

        Ok(depth)
    }
}

impl Drop for DepthImage {
    fn drop(&mut self) {
        unsafe {
            if self.view != vk::ImageView::null() {
                self.device.device.destroy_image_view(self.view, None);
            }
            self.device.device.destroy_image(self.image, None);
        }
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.free(allocation) {
                log::error!("{:#}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_optimal(features: vk::FormatFeatureFlags) -> vk::FormatProperties {
        vk::FormatProperties {
            optimal_tiling_features: features,
            ..Default::default()
        }
    }

    #[test]
    fn picks_first_supported_candidate() {
        let picked = pick_depth_format(&DEPTH_FORMAT_CANDIDATES, |format| {
            if format == vk::Format::D32_SFLOAT {
                with_optimal(vk::FormatFeatureFlags::SAMPLED_IMAGE)
            } else {
                with_optimal(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
            }
        });
        assert_eq!(picked, Some(vk::Format::D32_SFLOAT_S8_UINT));

        let picked = pick_depth_format(&DEPTH_FORMAT_CANDIDATES, |_| {
            with_optimal(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        });
        assert_eq!(picked, Some(vk::Format::D32_SFLOAT));
    }

    #[test]
    fn linear_tiling_support_is_not_enough() {
        let picked = pick_depth_format(&DEPTH_FORMAT_CANDIDATES, |_| vk::FormatProperties {
            linear_tiling_features: vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            ..Default::default()
        });
        assert_eq!(picked, None);
    }
}
