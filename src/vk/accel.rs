//! Acceleration-structure plumbing for the Vulkan backend.

use ash::vk;

use super::buffer::BufferResource;
use super::device::VulkanDevice;
use crate::error::DeviceError;
use crate::gpu::{AccelBuildInputs, AccelLevel, AccelSizes, BuildFlags, BuildMode};

pub struct VulkanAccel {
    pub accel: vk::AccelerationStructureKHR,
    pub storage: BufferResource,
    pub level: AccelLevel,
    pub address: u64,
}

/// Device addresses an [`AccelBuildInputs`] refers to.
#[derive(Debug, Clone, Copy)]
pub enum InputAddresses {
    Bottom { vertices: u64, indices: u64 },
    Top { instances: u64 },
}

pub fn accel_type(level: AccelLevel) -> vk::AccelerationStructureTypeKHR {
    match level {
        AccelLevel::Bottom => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        AccelLevel::Top => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
    }
}

pub fn build_flags(flags: BuildFlags) -> vk::BuildAccelerationStructureFlagsKHR {
    let mut out = if flags.prefer_fast_trace {
        vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
    } else {
        vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD
    };
    if flags.allow_update {
        out |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE;
    }
    out
}

fn level_of(inputs: &AccelBuildInputs) -> AccelLevel {
    match inputs {
        AccelBuildInputs::Bottom(_) => AccelLevel::Bottom,
        AccelBuildInputs::Top { .. } => AccelLevel::Top,
    }
}

/// Geometry description of `inputs`. Instance data starts at the block's
/// byte offset, so the build range offset stays zero.
pub fn geometry(
    inputs: &AccelBuildInputs,
    addresses: InputAddresses,
) -> Result<vk::AccelerationStructureGeometryKHR<'static>, DeviceError> {
    match (inputs, addresses) {
        (AccelBuildInputs::Bottom(desc), InputAddresses::Bottom { vertices, indices }) => {
            let flags = if desc.opaque {
                vk::GeometryFlagsKHR::OPAQUE
            } else {
                vk::GeometryFlagsKHR::empty()
            };
            Ok(vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                .geometry(vk::AccelerationStructureGeometryDataKHR {
                    triangles: vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                        .vertex_data(vk::DeviceOrHostAddressConstKHR {
                            device_address: vertices,
                        })
                        .max_vertex(desc.vertex_count.saturating_sub(1))
                        .vertex_stride(desc.vertex_stride as u64)
                        .vertex_format(vk::Format::R32G32B32_SFLOAT)
                        .index_data(vk::DeviceOrHostAddressConstKHR {
                            device_address: indices,
                        })
                        .index_type(vk::IndexType::UINT32),
                })
                .flags(flags))
        }
        (AccelBuildInputs::Top { offset, .. }, InputAddresses::Top { instances }) => {
            Ok(vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                .geometry(vk::AccelerationStructureGeometryDataKHR {
                    instances: vk::AccelerationStructureGeometryInstancesDataKHR::default()
                        .array_of_pointers(false)
                        .data(vk::DeviceOrHostAddressConstKHR {
                            device_address: instances + offset,
                        }),
                }))
        }
        _ => Err(DeviceError::InvalidCommand(
            "build inputs and resolved addresses disagree on level".to_string(),
        )),
    }
}

pub fn prebuild_sizes(
    vk_dev: &VulkanDevice,
    inputs: &AccelBuildInputs,
    addresses: InputAddresses,
    flags: BuildFlags,
) -> Result<AccelSizes, DeviceError> {
    let geometries = [geometry(inputs, addresses)?];
    let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .flags(build_flags(flags))
        .geometries(&geometries)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .ty(accel_type(level_of(inputs)));

    let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
    unsafe {
        vk_dev.accel_structure.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &build_info,
            &[inputs.primitive_count()],
            &mut size_info,
        );
    }
    Ok(AccelSizes {
        result_size: size_info.acceleration_structure_size,
        build_scratch_size: size_info.build_scratch_size,
        update_scratch_size: size_info.update_scratch_size,
    })
}

pub fn create(
    vk_dev: &VulkanDevice,
    level: AccelLevel,
    size: u64,
) -> Result<VulkanAccel, DeviceError> {
    let storage = BufferResource::new(
        &vk_dev.device,
        &vk_dev.memory_properties,
        size,
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
        1,
    )?;

    let create_info = vk::AccelerationStructureCreateInfoKHR::default()
        .ty(accel_type(level))
        .size(size)
        .buffer(storage.buffer);
    let accel = match unsafe {
        vk_dev
            .accel_structure
            .create_acceleration_structure(&create_info, None)
    } {
        Ok(accel) => accel,
        Err(err) => {
            storage.destroy(&vk_dev.device);
            return Err(err.into());
        }
    };

    let address = unsafe {
        let info = vk::AccelerationStructureDeviceAddressInfoKHR::default()
            .acceleration_structure(accel);
        vk_dev
            .accel_structure
            .get_acceleration_structure_device_address(&info)
    };

    Ok(VulkanAccel {
        accel,
        storage,
        level,
        address,
    })
}

/// Records a build, or an in-place refit with source == destination.
pub fn cmd_build(
    vk_dev: &VulkanDevice,
    cmd: vk::CommandBuffer,
    dst: &VulkanAccel,
    inputs: &AccelBuildInputs,
    addresses: InputAddresses,
    flags: BuildFlags,
    mode: BuildMode,
    scratch_address: u64,
) -> Result<(), DeviceError> {
    let geometries = [geometry(inputs, addresses)?];
    let (vk_mode, src) = match mode {
        BuildMode::Build => (
            vk::BuildAccelerationStructureModeKHR::BUILD,
            vk::AccelerationStructureKHR::null(),
        ),
        BuildMode::Update => (vk::BuildAccelerationStructureModeKHR::UPDATE, dst.accel),
    };
    let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .flags(build_flags(flags))
        .geometries(&geometries)
        .mode(vk_mode)
        .ty(accel_type(dst.level))
        .src_acceleration_structure(src)
        .dst_acceleration_structure(dst.accel)
        .scratch_data(vk::DeviceOrHostAddressKHR {
            device_address: scratch_address,
        });

    let build_range = vk::AccelerationStructureBuildRangeInfoKHR::default()
        .primitive_count(inputs.primitive_count())
        .primitive_offset(0)
        .first_vertex(0)
        .transform_offset(0);

    unsafe {
        vk_dev
            .accel_structure
            .cmd_build_acceleration_structures(cmd, &[build_info], &[&[build_range]]);
    }
    Ok(())
}

/// Makes a finished build visible to later builds and to ray tracing shaders.
pub fn cmd_build_barrier(vk_dev: &VulkanDevice, cmd: vk::CommandBuffer) {
    let barrier = vk::MemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR)
        .dst_access_mask(
            vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR
                | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
        );
    unsafe {
        vk_dev.device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR
                | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
            vk::DependencyFlags::empty(),
            &[barrier],
            &[],
            &[],
        );
    }
}

/// Waits for earlier traces and builds before a refit overwrites the
/// structure and the shared scratch buffer.
pub fn cmd_refit_barrier(vk_dev: &VulkanDevice, cmd: vk::CommandBuffer) {
    let (src_stage, src_access, dst_stage, dst_access) = refit_scopes();
    let barrier = vk::MemoryBarrier::default()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access);
    unsafe {
        vk_dev.device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[barrier],
            &[],
            &[],
        );
    }
}

fn refit_scopes() -> (
    vk::PipelineStageFlags,
    vk::AccessFlags,
    vk::PipelineStageFlags,
    vk::AccessFlags,
) {
    let access = vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR
        | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR;
    (
        vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR
            | vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
        access,
        vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
        access,
    )
}

pub fn destroy(vk_dev: &VulkanDevice, accel: &VulkanAccel) {
    unsafe {
        vk_dev
            .accel_structure
            .destroy_acceleration_structure(accel.accel, None);
    }
    accel.storage.destroy(&vk_dev.device);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refit_waits_for_traces_and_builds() {
        let (src_stage, src_access, dst_stage, dst_access) = refit_scopes();
        assert!(src_stage.contains(
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR
                | vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR
        ));
        assert!(src_access.contains(vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR));
        assert_eq!(
            dst_stage,
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR
        );
        assert!(dst_access.contains(vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR));
    }

    #[test]
    fn test_updatable_flags() {
        let flags = build_flags(BuildFlags {
            allow_update: true,
            prefer_fast_trace: true,
        });
        assert!(flags.contains(
            vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE
                | vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
        ));
    }
}
