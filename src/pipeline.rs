//! Ray tracing pipeline and its argument layouts.
//!
//! Compiled once at initialization and read-only afterwards. Shader
//! identifiers are fetched right after compilation and cached here.

use std::path::Path;

use glam::{Mat4, Vec3};

use crate::error::{RayTracerError, Result};
use crate::gpu::{
    DescriptorRangeKind, LayoutHandle, LayoutParam, LayoutScope, LocalLayoutAssociation,
    PipelineDesc, PipelineHandle, PipelineLayoutDesc, RtDevice,
};

pub const RAYGEN_SHADER: &str = "raygenMain";
pub const CLOSEST_HIT_SHADER: &str = "closestHitMain";
pub const MISS_SHADER: &str = "missMain";
pub const HIT_GROUP: &str = "hitGroup";

/// float4 color
pub const RAY_PAYLOAD_SIZE: u32 = 16;
/// float2 barycentrics
pub const HIT_ATTRIBUTE_SIZE: u32 = 8;
pub const MAX_RECURSION_DEPTH: u32 = 3;

/// Inline arguments of the ray-generation record.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct RayGenConstants {
    /// Transposed projection-to-world matrix
    pub proj_to_world: [f32; 16],
    pub eye: [f32; 3],
}

impl RayGenConstants {
    pub const SIZE: u32 = std::mem::size_of::<RayGenConstants>() as u32;

    /// Constants for a camera at `eye` with the given world-to-clip matrix.
    pub fn new(eye: Vec3, view_proj: Mat4) -> Self {
        Self {
            proj_to_world: view_proj.inverse().transpose().to_cols_array(),
            eye: eye.to_array(),
        }
    }
}

/// Inline arguments of the hit-group record: the transposed object rotation.
pub const HIT_GROUP_CONSTANTS_SIZE: u32 = std::mem::size_of::<[f32; 16]>() as u32;

pub fn hit_group_constants(rotation: Mat4) -> [f32; 16] {
    rotation.transpose().to_cols_array()
}

/// Slots of the global layout, in binding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalSlot {
    Output = 0,
    Accel = 1,
    Sampler = 2,
    IndexBuffers = 3,
    VertexBuffers = 4,
}

const fn size_in_u32(bytes: u32) -> u32 {
    bytes.div_ceil(4)
}

const GLOBAL_PARAMS: [LayoutParam; 5] = [
    LayoutParam::Range {
        kind: DescriptorRangeKind::Uav,
        count: 1,
        register: 0,
        space: 0,
    },
    LayoutParam::RootAccel { register: 0 },
    LayoutParam::Range {
        kind: DescriptorRangeKind::Sampler,
        count: 1,
        register: 0,
        space: 0,
    },
    LayoutParam::Range {
        kind: DescriptorRangeKind::Srv,
        count: 2,
        register: 0,
        space: 1,
    },
    LayoutParam::Range {
        kind: DescriptorRangeKind::Srv,
        count: 2,
        register: 0,
        space: 2,
    },
];

const RAYGEN_PARAMS: [LayoutParam; 1] = [LayoutParam::Constants {
    num_u32: size_in_u32(RayGenConstants::SIZE),
    register: 0,
}];

const HIT_GROUP_PARAMS: [LayoutParam; 1] = [LayoutParam::Constants {
    num_u32: size_in_u32(HIT_GROUP_CONSTANTS_SIZE),
    register: 1,
}];

/// Shader identifiers of every export a shader table references.
#[derive(Debug, Clone)]
pub struct ShaderIdentifiers {
    pub raygen: Vec<u8>,
    pub hit_group: Vec<u8>,
    pub miss: Vec<u8>,
}

#[derive(Debug)]
pub struct PipelineRegistry {
    pipeline: PipelineHandle,
    global_layout: LayoutHandle,
    raygen_layout: LayoutHandle,
    hit_group_layout: LayoutHandle,
    identifiers: ShaderIdentifiers,
    identifier_size: u32,
}

/// Reads a precompiled shader library from disk.
pub fn load_library<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let path = path.as_ref();
    std::fs::read(path).map_err(|source| RayTracerError::ShaderLibrary {
        path: path.to_path_buf(),
        source,
    })
}

impl PipelineRegistry {
    pub fn compile<D: RtDevice>(device: &mut D, library: &[u8]) -> Result<Self> {
        let global_layout = device.create_pipeline_layout(&PipelineLayoutDesc {
            params: &GLOBAL_PARAMS,
            scope: LayoutScope::Global,
            name: "GlobalRootSignature",
        })?;
        let raygen_layout = device.create_pipeline_layout(&PipelineLayoutDesc {
            params: &RAYGEN_PARAMS,
            scope: LayoutScope::Local,
            name: "RayGenLocalRootSignature",
        })?;
        let hit_group_layout = device.create_pipeline_layout(&PipelineLayoutDesc {
            params: &HIT_GROUP_PARAMS,
            scope: LayoutScope::Local,
            name: "HitGroupLocalRootSignature",
        })?;

        let pipeline = device.create_pipeline(&PipelineDesc {
            library,
            raygen: RAYGEN_SHADER,
            closest_hit: CLOSEST_HIT_SHADER,
            miss: MISS_SHADER,
            hit_group: HIT_GROUP,
            payload_size: RAY_PAYLOAD_SIZE,
            attribute_size: HIT_ATTRIBUTE_SIZE,
            global_layout,
            local_layouts: &[
                LocalLayoutAssociation {
                    layout: raygen_layout,
                    exports: &[RAYGEN_SHADER],
                },
                LocalLayoutAssociation {
                    layout: hit_group_layout,
                    exports: &[HIT_GROUP],
                },
            ],
            max_recursion_depth: MAX_RECURSION_DEPTH,
            name: "RaytracingPipeline",
        })?;

        let identifiers = ShaderIdentifiers {
            raygen: device.shader_identifier(pipeline, RAYGEN_SHADER)?,
            hit_group: device.shader_identifier(pipeline, HIT_GROUP)?,
            miss: device.shader_identifier(pipeline, MISS_SHADER)?,
        };
        let identifier_size = device.shader_identifier_size();

        log::info!(
            "Ray tracing pipeline compiled ({} byte library, recursion depth {MAX_RECURSION_DEPTH})",
            library.len()
        );
        Ok(Self {
            pipeline,
            global_layout,
            raygen_layout,
            hit_group_layout,
            identifiers,
            identifier_size,
        })
    }

    pub fn pipeline(&self) -> PipelineHandle {
        self.pipeline
    }

    pub fn global_layout(&self) -> LayoutHandle {
        self.global_layout
    }

    pub fn raygen_layout(&self) -> LayoutHandle {
        self.raygen_layout
    }

    pub fn hit_group_layout(&self) -> LayoutHandle {
        self.hit_group_layout
    }

    pub fn identifiers(&self) -> &ShaderIdentifiers {
        &self.identifiers
    }

    pub fn identifier_size(&self) -> u32 {
        self.identifier_size
    }

    pub fn raygen_record_size(&self) -> u32 {
        self.identifier_size + RayGenConstants::SIZE
    }

    pub fn hit_group_record_size(&self) -> u32 {
        self.identifier_size + HIT_GROUP_CONSTANTS_SIZE
    }

    pub fn miss_record_size(&self) -> u32 {
        self.identifier_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeviceError;
    use crate::gpu::null::NullDevice;

    #[test]
    fn test_constant_sizes() {
        assert_eq!(RayGenConstants::SIZE, 76);
        assert_eq!(size_in_u32(RayGenConstants::SIZE), 19);
        assert_eq!(HIT_GROUP_CONSTANTS_SIZE, 64);
        assert_eq!(size_in_u32(HIT_GROUP_CONSTANTS_SIZE), 16);
    }

    #[test]
    fn test_raygen_constants_invert_view_proj() {
        let view_proj = Mat4::from_scale(Vec3::new(2.0, 4.0, 8.0));
        let constants = RayGenConstants::new(Vec3::new(1.0, 2.0, 3.0), view_proj);
        let decoded = Mat4::from_cols_array(&constants.proj_to_world).transpose();
        assert!(decoded.abs_diff_eq(view_proj.inverse(), 1e-6));
        assert_eq!(constants.eye, [1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_compile_caches_identifiers() {
        let mut device = NullDevice::new();
        let registry = PipelineRegistry::compile(&mut device, &[0x03, 0x02, 0x23, 0x07]).unwrap();
        let ids = registry.identifiers();
        assert_eq!(ids.raygen.len(), 32);
        assert_ne!(ids.raygen, ids.hit_group);
        assert_ne!(ids.hit_group, ids.miss);
        assert_eq!(registry.raygen_record_size(), 32 + 76);
        assert_eq!(registry.hit_group_record_size(), 32 + 64);
        assert_eq!(registry.miss_record_size(), 32);
    }

    #[test]
    fn test_compile_rejects_empty_library() {
        let mut device = NullDevice::new();
        let err = PipelineRegistry::compile(&mut device, &[]).unwrap_err();
        assert!(matches!(
            err,
            RayTracerError::Device(DeviceError::InvalidPipeline(_))
        ));
    }

    #[test]
    fn test_load_library_missing_file() {
        let err = load_library("/nonexistent/library.spv").unwrap_err();
        assert!(matches!(err, RayTracerError::ShaderLibrary { .. }));
    }
}
