//! Backend-neutral GPU vocabulary.
//!
//! The ray tracer core allocates resources through [`RtDevice`] and records
//! GPU work as plain data into a [`CommandList`]. A backend (Vulkan, or the
//! headless [`null::NullDevice`]) turns both into real API calls.

mod command;
pub mod null;

pub use command::{
    AccelBuild, AccelBuildInputs, BuildMode, Command, CommandList, DispatchRays, RootArgument,
    TableRegion,
};

use crate::error::DeviceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccelHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineHandle(pub u32);

/// What a buffer is used for. Determines both usage flags and which memory
/// it lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    /// Host-visible source of a one-time upload
    Staging,
    Vertex,
    Index,
    /// Scratch memory for acceleration-structure builds
    Scratch,
    /// Host-visible instance records consumed by top-level builds
    Instances,
    /// Host-visible shader records
    ShaderTable,
}

impl BufferUsage {
    pub fn host_visible(self) -> bool {
        matches!(
            self,
            BufferUsage::Staging | BufferUsage::Instances | BufferUsage::ShaderTable
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub size: u64,
    pub usage: BufferUsage,
    pub name: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Rgba8Unorm,
}

impl ImageFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            ImageFormat::Rgba8Unorm => 4,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ImageDesc<'a> {
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub name: &'a str,
}

/// Logical resource state of an image, as seen by the command stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// Freshly created, contents undefined
    Common,
    CopyDest,
    CopySource,
    /// Writable from shaders
    UnorderedAccess,
    /// Readable from shaders
    ShaderResource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Float3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    U32,
}

/// Triangle geometry as consumed by a bottom-level build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryDesc {
    pub vertex_buffer: BufferHandle,
    pub vertex_count: u32,
    pub vertex_stride: u32,
    pub vertex_format: VertexFormat,
    pub index_buffer: BufferHandle,
    pub index_count: u32,
    pub index_format: IndexFormat,
    pub opaque: bool,
}

impl GeometryDesc {
    pub fn triangle_count(&self) -> u32 {
        self.index_count / 3
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccelLevel {
    Bottom,
    Top,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BuildFlags {
    pub allow_update: bool,
    pub prefer_fast_trace: bool,
}

impl BuildFlags {
    pub const FAST_TRACE: BuildFlags = BuildFlags {
        allow_update: false,
        prefer_fast_trace: true,
    };
}

/// Result of an acceleration-structure pre-build query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccelSizes {
    pub result_size: u64,
    pub build_scratch_size: u64,
    pub update_scratch_size: u64,
}

impl AccelSizes {
    /// Scratch large enough for both the initial build and any later refit.
    pub fn scratch_max(&self) -> u64 {
        self.build_scratch_size.max(self.update_scratch_size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorPoolKind {
    CbvSrvUav,
    Sampler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SamplerPreset {
    AnisotropicWrap,
}

/// A view written into a descriptor pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Descriptor {
    ImageUav(ImageHandle),
    AccelUav(AccelHandle),
    /// Structured read-only view over a whole buffer
    BufferSrv { buffer: BufferHandle, stride: u32 },
    Sampler(SamplerPreset),
}

/// A contiguous run of descriptors inside one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorTable {
    pub pool: DescriptorPoolKind,
    pub first: u32,
    pub count: u32,
}

impl DescriptorTable {
    pub fn index(&self, offset: u32) -> u32 {
        debug_assert!(offset < self.count);
        self.first + offset
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorRangeKind {
    Uav,
    Srv,
    Sampler,
}

/// One parameter of a pipeline layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayoutParam {
    Range {
        kind: DescriptorRangeKind,
        count: u32,
        register: u32,
        space: u32,
    },
    /// Acceleration structure bound by address rather than through a table
    RootAccel { register: u32 },
    /// Inline 32-bit constants; for local layouts these live in the shader record
    Constants { num_u32: u32, register: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayoutScope {
    /// Shared by every shader of a dispatch
    Global,
    /// Arguments that come from a shader record
    Local,
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineLayoutDesc<'a> {
    pub params: &'a [LayoutParam],
    pub scope: LayoutScope,
    pub name: &'a str,
}

/// Associates a local layout with the exports whose records use it.
#[derive(Debug, Clone, Copy)]
pub struct LocalLayoutAssociation<'a> {
    pub layout: LayoutHandle,
    pub exports: &'a [&'a str],
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineDesc<'a> {
    /// Precompiled shader library
    pub library: &'a [u8],
    pub raygen: &'a str,
    pub closest_hit: &'a str,
    pub miss: &'a str,
    pub hit_group: &'a str,
    pub payload_size: u32,
    pub attribute_size: u32,
    pub global_layout: LayoutHandle,
    pub local_layouts: &'a [LocalLayoutAssociation<'a>],
    pub max_recursion_depth: u32,
    pub name: &'a str,
}

/// Resource allocation and pipeline compilation for a ray tracing capable device.
///
/// Command recording is not part of this trait: work is recorded into a
/// [`CommandList`] and handed to the backend separately.
pub trait RtDevice {
    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<BufferHandle, DeviceError>;

    /// Host write into a host-visible buffer.
    fn write_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DeviceError>;

    fn destroy_buffer(&mut self, buffer: BufferHandle);

    fn create_image(&mut self, desc: &ImageDesc<'_>) -> Result<ImageHandle, DeviceError>;

    /// Sizes of the result and scratch memory an acceleration structure
    /// built from `inputs` with `flags` requires.
    fn accel_prebuild(
        &self,
        inputs: &AccelBuildInputs,
        flags: BuildFlags,
    ) -> Result<AccelSizes, DeviceError>;

    /// Allocates result storage of `size` bytes and an acceleration structure over it.
    fn create_accel(
        &mut self,
        level: AccelLevel,
        size: u64,
        name: &str,
    ) -> Result<AccelHandle, DeviceError>;

    /// GPU address referenced by instance records.
    fn accel_address(&self, accel: AccelHandle) -> Result<u64, DeviceError>;

    fn write_descriptors(
        &mut self,
        pool: DescriptorPoolKind,
        first: u32,
        descriptors: &[Descriptor],
    ) -> Result<(), DeviceError>;

    fn create_pipeline_layout(
        &mut self,
        desc: &PipelineLayoutDesc<'_>,
    ) -> Result<LayoutHandle, DeviceError>;

    fn create_pipeline(&mut self, desc: &PipelineDesc<'_>) -> Result<PipelineHandle, DeviceError>;

    /// Size in bytes of one shader identifier. Constant for a device.
    fn shader_identifier_size(&self) -> u32;

    /// Required alignment of a shader record stride.
    fn shader_record_alignment(&self) -> u32;

    /// Opaque identifier of an exported raygen/miss shader or hit group.
    fn shader_identifier(
        &self,
        pipeline: PipelineHandle,
        export: &str,
    ) -> Result<Vec<u8>, DeviceError>;
}

pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}
