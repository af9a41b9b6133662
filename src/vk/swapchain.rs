use ash::vk;

use super::device::VulkanDevice;
use super::instance::VulkanInstance;

/// Presentation target. Images are only ever written by transfer (blit).
pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl Swapchain {
    pub fn new(
        vk_instance: &VulkanInstance,
        vk_dev: &VulkanDevice,
        width: u32,
        height: u32,
    ) -> Result<Self, vk::Result> {
        let surface_loader = &vk_instance.surface_loader;
        let (surface_caps, surface_formats) = unsafe {
            (
                surface_loader.get_physical_device_surface_capabilities(
                    vk_dev.physical_device,
                    vk_instance.surface,
                )?,
                surface_loader
                    .get_physical_device_surface_formats(vk_dev.physical_device, vk_instance.surface)?,
            )
        };

        // The output image is linear RGBA8, so prefer a UNORM target
        let surface_format = surface_formats
            .iter()
            .find(|f| {
                f.format == vk::Format::B8G8R8A8_UNORM
                    && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .or_else(|| surface_formats.first())
            .copied()
            .ok_or(vk::Result::ERROR_FORMAT_NOT_SUPPORTED)?;

        let extent = if surface_caps.current_extent.width != u32::MAX {
            surface_caps.current_extent
        } else {
            vk::Extent2D {
                width: width.clamp(
                    surface_caps.min_image_extent.width,
                    surface_caps.max_image_extent.width,
                ),
                height: height.clamp(
                    surface_caps.min_image_extent.height,
                    surface_caps.max_image_extent.height,
                ),
            }
        };

        let mut image_count = surface_caps.min_image_count + 1;
        if surface_caps.max_image_count > 0 {
            image_count = image_count.min(surface_caps.max_image_count);
        }

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(vk_instance.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(vk::PresentModeKHR::FIFO)
            .clipped(true);

        let swapchain = unsafe { vk_dev.swapchain_loader.create_swapchain(&create_info, None)? };
        let images = unsafe { vk_dev.swapchain_loader.get_swapchain_images(swapchain)? };

        log::info!(
            "Swapchain created: {}x{}, format {:?}, {} images",
            extent.width,
            extent.height,
            surface_format.format,
            images.len()
        );

        Ok(Swapchain {
            swapchain,
            images,
            format: surface_format.format,
            extent,
        })
    }

    pub fn destroy(&self, vk_dev: &VulkanDevice) {
        unsafe {
            vk_dev
                .swapchain_loader
                .destroy_swapchain(self.swapchain, None);
        }
    }
}
