use std::collections::HashMap;

use ash::vk;

use crate::error::DeviceError;
use crate::gpu::{DescriptorRangeKind, LayoutParam, RootArgument};

const RT_STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::RAYGEN_KHR.as_raw()
        | vk::ShaderStageFlags::CLOSEST_HIT_KHR.as_raw()
        | vk::ShaderStageFlags::MISS_KHR.as_raw(),
);

/// Sets kept alive at once. One per distinct argument list; frames in
/// flight only differ by their output image.
const MAX_CACHED_SETS: u32 = 8;
const DESCRIPTORS_PER_TYPE: u32 = 64;

/// Descriptor type and array length of one global layout parameter.
/// Parameter `i` becomes binding `i` of set 0.
pub fn binding_of(param: &LayoutParam) -> Result<(vk::DescriptorType, u32), DeviceError> {
    match *param {
        LayoutParam::Range { kind, count, .. } => {
            let ty = match kind {
                DescriptorRangeKind::Uav => vk::DescriptorType::STORAGE_IMAGE,
                DescriptorRangeKind::Srv => vk::DescriptorType::STORAGE_BUFFER,
                DescriptorRangeKind::Sampler => vk::DescriptorType::SAMPLER,
            };
            Ok((ty, count))
        }
        LayoutParam::RootAccel { .. } => Ok((vk::DescriptorType::ACCELERATION_STRUCTURE_KHR, 1)),
        LayoutParam::Constants { .. } => Err(DeviceError::Unsupported(
            "inline constants in a global layout".to_string(),
        )),
    }
}

/// Descriptor set layout and pipeline layout of a global layout.
pub struct GlobalLayout {
    pub set_layout: vk::DescriptorSetLayout,
    pub pipeline_layout: vk::PipelineLayout,
    pub bindings: Vec<(vk::DescriptorType, u32)>,
}

impl GlobalLayout {
    pub fn new(device: &ash::Device, params: &[LayoutParam]) -> Result<Self, DeviceError> {
        let bindings = params
            .iter()
            .map(binding_of)
            .collect::<Result<Vec<_>, _>>()?;

        let set_bindings: Vec<_> = bindings
            .iter()
            .enumerate()
            .map(|(slot, &(ty, count))| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(slot as u32)
                    .descriptor_count(count)
                    .descriptor_type(ty)
                    .stage_flags(RT_STAGES)
            })
            .collect();

        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&set_bindings);
        let set_layout = unsafe { device.create_descriptor_set_layout(&layout_info, None)? };

        let layouts = [set_layout];
        let pipeline_layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&layouts);
        let pipeline_layout =
            match unsafe { device.create_pipeline_layout(&pipeline_layout_info, None) } {
                Ok(layout) => layout,
                Err(err) => {
                    unsafe { device.destroy_descriptor_set_layout(set_layout, None) };
                    return Err(err.into());
                }
            };

        Ok(GlobalLayout {
            set_layout,
            pipeline_layout,
            bindings,
        })
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

/// A descriptor resolved to the Vulkan object it names.
#[derive(Debug, Clone, Copy)]
pub enum Resolved {
    StorageImage(vk::ImageView),
    Accel(vk::AccelerationStructureKHR),
    StorageBuffer { buffer: vk::Buffer, offset: u64, range: u64 },
    Sampler(vk::Sampler),
}

fn mismatch(binding: u32) -> DeviceError {
    DeviceError::InvalidCommand(format!("descriptors of mixed kinds bound to binding {binding}"))
}

/// Writes `resolved` into consecutive elements of `binding`.
pub fn write_binding(
    device: &ash::Device,
    set: vk::DescriptorSet,
    binding: u32,
    resolved: &[Resolved],
) -> Result<(), DeviceError> {
    let Some(first) = resolved.first() else {
        return Ok(());
    };
    let write = vk::WriteDescriptorSet::default()
        .dst_set(set)
        .dst_binding(binding)
        .dst_array_element(0);

    match first {
        Resolved::StorageImage(_) => {
            let infos = resolved
                .iter()
                .map(|r| match r {
                    Resolved::StorageImage(view) => Ok(vk::DescriptorImageInfo::default()
                        .image_layout(vk::ImageLayout::GENERAL)
                        .image_view(*view)),
                    _ => Err(mismatch(binding)),
                })
                .collect::<Result<Vec<_>, _>>()?;
            let write = write
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .image_info(&infos);
            unsafe { device.update_descriptor_sets(&[write], &[]) };
        }
        Resolved::Sampler(_) => {
            let infos = resolved
                .iter()
                .map(|r| match r {
                    Resolved::Sampler(sampler) => {
                        Ok(vk::DescriptorImageInfo::default().sampler(*sampler))
                    }
                    _ => Err(mismatch(binding)),
                })
                .collect::<Result<Vec<_>, _>>()?;
            let write = write
                .descriptor_type(vk::DescriptorType::SAMPLER)
                .image_info(&infos);
            unsafe { device.update_descriptor_sets(&[write], &[]) };
        }
        Resolved::StorageBuffer { .. } => {
            let infos = resolved
                .iter()
                .map(|r| match r {
                    Resolved::StorageBuffer {
                        buffer,
                        offset,
                        range,
                    } => Ok(vk::DescriptorBufferInfo::default()
                        .buffer(*buffer)
                        .offset(*offset)
                        .range(*range)),
                    _ => Err(mismatch(binding)),
                })
                .collect::<Result<Vec<_>, _>>()?;
            let write = write
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(&infos);
            unsafe { device.update_descriptor_sets(&[write], &[]) };
        }
        Resolved::Accel(_) => {
            let accels = resolved
                .iter()
                .map(|r| match r {
                    Resolved::Accel(accel) => Ok(*accel),
                    _ => Err(mismatch(binding)),
                })
                .collect::<Result<Vec<_>, _>>()?;
            let mut accel_info = vk::WriteDescriptorSetAccelerationStructureKHR::default()
                .acceleration_structures(&accels);
            let mut write = write
                .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                .push_next(&mut accel_info);
            write.descriptor_count = accels.len() as u32;
            unsafe { device.update_descriptor_sets(&[write], &[]) };
        }
    }
    Ok(())
}

/// Descriptor sets materialized from argument lists, reused across frames
/// until a descriptor they were built from changes.
pub struct DescriptorSetCache {
    pool: vk::DescriptorPool,
    sets: HashMap<Vec<(u32, RootArgument)>, vk::DescriptorSet>,
}

impl DescriptorSetCache {
    pub fn new(device: &ash::Device) -> Result<Self, DeviceError> {
        let pool_sizes = [
            vk::DescriptorType::STORAGE_IMAGE,
            vk::DescriptorType::STORAGE_BUFFER,
            vk::DescriptorType::SAMPLER,
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
        ]
        .map(|ty| vk::DescriptorPoolSize {
            ty,
            descriptor_count: DESCRIPTORS_PER_TYPE,
        });

        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .pool_sizes(&pool_sizes)
            .max_sets(MAX_CACHED_SETS);
        let pool = unsafe { device.create_descriptor_pool(&pool_info, None)? };

        Ok(DescriptorSetCache {
            pool,
            sets: HashMap::new(),
        })
    }

    pub fn get(&self, arguments: &[(u32, RootArgument)]) -> Option<vk::DescriptorSet> {
        self.sets.get(arguments).copied()
    }

    /// Allocates a set for `arguments`; the caller fills it in.
    pub fn allocate(
        &mut self,
        device: &ash::Device,
        layout: vk::DescriptorSetLayout,
        arguments: &[(u32, RootArgument)],
    ) -> Result<vk::DescriptorSet, DeviceError> {
        if self.sets.len() as u32 >= MAX_CACHED_SETS {
            self.invalidate(device)?;
        }
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);
        let set = unsafe { device.allocate_descriptor_sets(&alloc_info)?[0] };
        self.sets.insert(arguments.to_vec(), set);
        Ok(set)
    }

    /// Drops every cached set once the device is idle.
    pub fn invalidate(&mut self, device: &ash::Device) -> Result<(), DeviceError> {
        if self.sets.is_empty() {
            return Ok(());
        }
        let sets: Vec<_> = self.sets.drain().map(|(_, set)| set).collect();
        unsafe {
            device.device_wait_idle()?;
            device.free_descriptor_sets(self.pool, &sets)?;
        }
        log::debug!("vk: released {} cached descriptor sets", sets.len());
        Ok(())
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe { device.destroy_descriptor_pool(self.pool, None) };
    }
}
