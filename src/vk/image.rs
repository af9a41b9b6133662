use ash::vk;

use super::buffer::find_memory_type;
use super::device::VulkanDevice;
use crate::error::DeviceError;
use crate::gpu::{ImageFormat, ResourceState};

pub const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

pub fn vk_format(format: ImageFormat) -> vk::Format {
    match format {
        ImageFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
    }
}

/// Layout an image is in while in `state`. Fresh images have undefined
/// contents, so leaving `Common` discards them.
pub fn layout_of(state: ResourceState, as_source: bool) -> vk::ImageLayout {
    match state {
        ResourceState::Common if as_source => vk::ImageLayout::UNDEFINED,
        ResourceState::Common | ResourceState::UnorderedAccess => vk::ImageLayout::GENERAL,
        ResourceState::CopySource => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        ResourceState::CopyDest => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ResourceState::ShaderResource => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    }
}

/// Access mask and pipeline stage that touch an image in `state`.
pub fn access_of(state: ResourceState) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match state {
        ResourceState::Common => (vk::AccessFlags::empty(), vk::PipelineStageFlags::TOP_OF_PIPE),
        ResourceState::UnorderedAccess => (
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
        ),
        ResourceState::ShaderResource => (
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
        ),
        ResourceState::CopySource => {
            (vk::AccessFlags::TRANSFER_READ, vk::PipelineStageFlags::TRANSFER)
        }
        ResourceState::CopyDest => {
            (vk::AccessFlags::TRANSFER_WRITE, vk::PipelineStageFlags::TRANSFER)
        }
    }
}

/// 2D image written by ray tracing shaders and read back by blits.
pub struct StorageImage {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
}

impl StorageImage {
    pub fn new(
        vk_dev: &VulkanDevice,
        width: u32,
        height: u32,
        format: ImageFormat,
    ) -> Result<Self, DeviceError> {
        let device = &vk_dev.device;
        let format = vk_format(format);

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(
                vk::ImageUsageFlags::STORAGE
                    | vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::SAMPLED,
            );

        unsafe {
            let image = device.create_image(&image_info, None)?;
            let mem_reqs = device.get_image_memory_requirements(image);
            let Some(memory_index) = find_memory_type(
                &vk_dev.memory_properties,
                mem_reqs.memory_type_bits,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            ) else {
                device.destroy_image(image, None);
                return Err(DeviceError::Unsupported(
                    "no device-local memory for storage image".to_string(),
                ));
            };

            let mem_info = vk::MemoryAllocateInfo::default()
                .allocation_size(mem_reqs.size)
                .memory_type_index(memory_index);
            let memory = match device.allocate_memory(&mem_info, None) {
                Ok(memory) => memory,
                Err(err) => {
                    device.destroy_image(image, None);
                    return Err(err.into());
                }
            };
            device.bind_image_memory(image, memory, 0)?;

            let view_info = vk::ImageViewCreateInfo::default()
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format)
                .subresource_range(COLOR_RANGE)
                .image(image);
            let view = device.create_image_view(&view_info, None)?;

            Ok(StorageImage {
                image,
                memory,
                view,
                width,
                height,
                format,
            })
        }
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_image_view(self.view, None);
            device.destroy_image(self.image, None);
            device.free_memory(self.memory, None);
        }
    }
}

pub fn cmd_transition(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    before: ResourceState,
    after: ResourceState,
) {
    let (src_access, src_stage) = access_of(before);
    let (dst_access, dst_stage) = access_of(after);
    let barrier = vk::ImageMemoryBarrier::default()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .old_layout(layout_of(before, true))
        .new_layout(layout_of(after, false))
        .image(image)
        .subresource_range(COLOR_RANGE);
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}
