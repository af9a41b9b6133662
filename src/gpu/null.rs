//! Headless backend.
//!
//! Keeps every buffer in host memory, hands out deterministic sizes and
//! addresses, and validates command lists on [`NullDevice::execute`]. Used by
//! the test suite and the `dry-run` command.

use std::collections::HashMap;

use super::{
    align_up, AccelBuildInputs, AccelHandle, AccelLevel, AccelSizes, BufferDesc, BufferHandle,
    BufferUsage, BuildFlags, BuildMode, Command, CommandList, Descriptor, DescriptorPoolKind,
    ImageDesc, ImageFormat, ImageHandle, LayoutHandle, LayoutScope,
    PipelineDesc, PipelineHandle, PipelineLayoutDesc, ResourceState, RtDevice,
};
use crate::accel::InstanceRecord;
use crate::error::DeviceError;

const SHADER_IDENTIFIER_SIZE: u32 = 32;
const SHADER_RECORD_ALIGNMENT: u32 = 32;
const ACCEL_ADDRESS_BASE: u64 = 0x1_0000_0000;

#[derive(Debug)]
pub struct NullBuffer {
    pub name: String,
    pub usage: BufferUsage,
    pub contents: Vec<u8>,
}

#[derive(Debug)]
pub struct NullImage {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub state: ResourceState,
}

#[derive(Debug)]
struct NullAccel {
    name: String,
    level: AccelLevel,
    size: u64,
    /// Flags of the last full build, if any
    built_with: Option<BuildFlags>,
    /// A refit barrier was recorded since the last build or refit
    refit_ordered: bool,
}

#[derive(Debug)]
struct NullPipeline {
    exports: Vec<String>,
}

/// Counters accumulated over every executed command list.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NullStats {
    pub buffers_created: u32,
    pub buffers_destroyed: u32,
    pub full_builds: u32,
    pub refits: u32,
    pub dispatches: u32,
    pub submissions: u32,
}

#[derive(Debug, Default)]
pub struct NullDevice {
    buffers: Vec<Option<NullBuffer>>,
    images: Vec<NullImage>,
    accels: Vec<NullAccel>,
    layouts: Vec<LayoutScope>,
    pipelines: Vec<NullPipeline>,
    descriptors: HashMap<(DescriptorPoolKind, u32), Descriptor>,
    memory_budget: Option<u64>,
    allocated: u64,
    /// Name and size of every allocation, in creation order
    allocations: Vec<(String, u64)>,
    stats: NullStats,
}

impl NullDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Device whose allocations fail once `bytes` have been handed out.
    pub fn with_memory_budget(bytes: u64) -> Self {
        Self {
            memory_budget: Some(bytes),
            ..Self::default()
        }
    }

    pub fn stats(&self) -> NullStats {
        self.stats
    }

    pub fn buffer(&self, handle: BufferHandle) -> Option<&NullBuffer> {
        self.buffers.get(handle.0 as usize).and_then(Option::as_ref)
    }

    pub fn buffer_contents(&self, handle: BufferHandle) -> Option<&[u8]> {
        self.buffer(handle).map(|b| b.contents.as_slice())
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.iter().filter(|b| b.is_some()).count()
    }

    pub fn image(&self, handle: ImageHandle) -> Option<&NullImage> {
        self.images.get(handle.0 as usize)
    }

    pub fn descriptor(&self, pool: DescriptorPoolKind, index: u32) -> Option<Descriptor> {
        self.descriptors.get(&(pool, index)).copied()
    }

    pub fn allocations(&self) -> &[(String, u64)] {
        &self.allocations
    }

    fn reserve(&mut self, name: &str, size: u64) -> Result<(), DeviceError> {
        if let Some(budget) = self.memory_budget {
            if self.allocated + size > budget {
                return Err(DeviceError::OutOfMemory {
                    name: name.to_string(),
                    size,
                });
            }
        }
        self.allocated += size;
        self.allocations.push((name.to_string(), size));
        Ok(())
    }

    fn buffer_mut(&mut self, handle: BufferHandle) -> Result<&mut NullBuffer, DeviceError> {
        self.buffers
            .get_mut(handle.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(DeviceError::InvalidHandle {
                kind: "buffer",
                index: handle.0,
            })
    }

    fn buffer_size(&self, handle: BufferHandle) -> Result<u64, DeviceError> {
        self.buffer(handle)
            .map(|b| b.contents.len() as u64)
            .ok_or(DeviceError::InvalidHandle {
                kind: "buffer",
                index: handle.0,
            })
    }

    /// Validates and "runs" a recorded command list.
    pub fn execute(&mut self, list: &CommandList) -> Result<(), DeviceError> {
        for command in list.commands() {
            match command {
                Command::CopyBuffer { src, dst, size } => {
                    let data = self
                        .buffer(*src)
                        .ok_or(DeviceError::InvalidHandle {
                            kind: "buffer",
                            index: src.0,
                        })?
                        .contents
                        .get(..*size as usize)
                        .ok_or_else(|| {
                            DeviceError::InvalidCommand(format!(
                                "copy of {size} bytes overruns source buffer {}",
                                src.0
                            ))
                        })?
                        .to_vec();
                    let target = self.buffer_mut(*dst)?;
                    if target.contents.len() < data.len() {
                        return Err(DeviceError::InvalidCommand(format!(
                            "copy of {size} bytes overruns {}",
                            target.name
                        )));
                    }
                    target.contents[..data.len()].copy_from_slice(&data);
                }
                Command::BufferBarrier { buffer, .. } => {
                    self.buffer_size(*buffer)?;
                }
                Command::ImageBarrier {
                    image,
                    before,
                    after,
                } => {
                    let tracked = self.images.get_mut(image.0 as usize).ok_or(
                        DeviceError::InvalidHandle {
                            kind: "image",
                            index: image.0,
                        },
                    )?;
                    if tracked.state != *before {
                        return Err(DeviceError::InvalidCommand(format!(
                            "{} transitioned from {before:?} but is in {:?}",
                            tracked.name, tracked.state
                        )));
                    }
                    tracked.state = *after;
                }
                Command::BuildAccel(build) => {
                    let required = self.accel_prebuild(&build.inputs, build.flags)?;
                    let scratch = self.buffer_size(build.scratch)?;
                    if let AccelBuildInputs::Top {
                        instances,
                        offset,
                        count,
                    } = build.inputs
                    {
                        let end = offset + count as u64 * InstanceRecord::SIZE;
                        if end > self.buffer_size(instances)? {
                            return Err(DeviceError::InvalidCommand(format!(
                                "instance block ending at {end} overruns buffer {}",
                                instances.0
                            )));
                        }
                    }
                    let accel = self.accels.get_mut(build.dst.0 as usize).ok_or(
                        DeviceError::InvalidHandle {
                            kind: "acceleration structure",
                            index: build.dst.0,
                        },
                    )?;
                    let level = match build.inputs {
                        AccelBuildInputs::Bottom(_) => AccelLevel::Bottom,
                        AccelBuildInputs::Top { .. } => AccelLevel::Top,
                    };
                    if accel.level != level {
                        return Err(DeviceError::InvalidCommand(format!(
                            "{level:?} inputs built into {:?} structure {}",
                            accel.level, accel.name
                        )));
                    }
                    if accel.size < required.result_size {
                        return Err(DeviceError::InvalidCommand(format!(
                            "{} holds {} bytes, build needs {}",
                            accel.name, accel.size, required.result_size
                        )));
                    }
                    match build.mode {
                        BuildMode::Build => {
                            if scratch < required.build_scratch_size {
                                return Err(DeviceError::InvalidCommand(format!(
                                    "scratch of {scratch} bytes too small to build {}",
                                    accel.name
                                )));
                            }
                            accel.built_with = Some(build.flags);
                            self.stats.full_builds += 1;
                        }
                        BuildMode::Update => {
                            if accel.built_with != Some(build.flags) || !build.flags.allow_update {
                                return Err(DeviceError::InvalidCommand(format!(
                                    "{} refit without a matching updatable build",
                                    accel.name
                                )));
                            }
                            if scratch < required.update_scratch_size {
                                return Err(DeviceError::InvalidCommand(format!(
                                    "scratch of {scratch} bytes too small to refit {}",
                                    accel.name
                                )));
                            }
                            if !accel.refit_ordered {
                                return Err(DeviceError::InvalidCommand(format!(
                                    "{} refit without a preceding refit barrier",
                                    accel.name
                                )));
                            }
                            self.stats.refits += 1;
                        }
                    }
                    accel.refit_ordered = false;
                }
                Command::AccelBarrier { accel } => {
                    if self.accels.get(accel.0 as usize).is_none() {
                        return Err(DeviceError::InvalidHandle {
                            kind: "acceleration structure",
                            index: accel.0,
                        });
                    }
                }
                Command::RefitBarrier { accel } => {
                    let tracked = self.accels.get_mut(accel.0 as usize).ok_or(
                        DeviceError::InvalidHandle {
                            kind: "acceleration structure",
                            index: accel.0,
                        },
                    )?;
                    tracked.refit_ordered = true;
                }
                Command::DispatchRays(dispatch) => {
                    if self.pipelines.get(dispatch.pipeline.0 as usize).is_none() {
                        return Err(DeviceError::InvalidHandle {
                            kind: "pipeline",
                            index: dispatch.pipeline.0,
                        });
                    }
                    for region in [&dispatch.raygen, &dispatch.hit_group, &dispatch.miss] {
                        if region.offset + region.size > self.buffer_size(region.buffer)? {
                            return Err(DeviceError::InvalidCommand(format!(
                                "shader table region overruns buffer {}",
                                region.buffer.0
                            )));
                        }
                    }
                    self.stats.dispatches += 1;
                }
            }
        }
        self.stats.submissions += 1;
        Ok(())
    }
}

impl RtDevice for NullDevice {
    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<BufferHandle, DeviceError> {
        self.reserve(desc.name, desc.size)?;
        let handle = BufferHandle(self.buffers.len() as u32);
        self.buffers.push(Some(NullBuffer {
            name: desc.name.to_string(),
            usage: desc.usage,
            contents: vec![0; desc.size as usize],
        }));
        self.stats.buffers_created += 1;
        Ok(handle)
    }

    fn write_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        let target = self.buffer_mut(buffer)?;
        if !target.usage.host_visible() {
            return Err(DeviceError::InvalidCommand(format!(
                "host write into device-local buffer {}",
                target.name
            )));
        }
        let size = target.contents.len() as u64;
        let end = offset + data.len() as u64;
        if end > size {
            return Err(DeviceError::WriteOutOfBounds {
                offset,
                len: data.len(),
                size,
            });
        }
        target.contents[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(slot) = self.buffers.get_mut(buffer.0 as usize) {
            if let Some(released) = slot.take() {
                self.allocated -= released.contents.len() as u64;
                self.stats.buffers_destroyed += 1;
            }
        }
    }

    fn create_image(&mut self, desc: &ImageDesc<'_>) -> Result<ImageHandle, DeviceError> {
        let size = desc.width as u64 * desc.height as u64 * desc.format.bytes_per_pixel() as u64;
        self.reserve(desc.name, size)?;
        let handle = ImageHandle(self.images.len() as u32);
        self.images.push(NullImage {
            name: desc.name.to_string(),
            width: desc.width,
            height: desc.height,
            format: desc.format,
            state: ResourceState::Common,
        });
        Ok(handle)
    }

    fn accel_prebuild(
        &self,
        inputs: &AccelBuildInputs,
        flags: BuildFlags,
    ) -> Result<AccelSizes, DeviceError> {
        let prims = inputs.primitive_count() as u64;
        if prims == 0 {
            return Err(DeviceError::InvalidCommand(
                "acceleration structure without primitives".to_string(),
            ));
        }
        let per_prim = match inputs {
            AccelBuildInputs::Bottom(_) => 64,
            AccelBuildInputs::Top { .. } => 128,
        };
        Ok(AccelSizes {
            result_size: align_up(256 + prims * per_prim, 256),
            build_scratch_size: align_up(128 + prims * per_prim / 2, 256),
            update_scratch_size: if flags.allow_update {
                align_up(64 + prims * per_prim / 4, 256)
            } else {
                0
            },
        })
    }

    fn create_accel(
        &mut self,
        level: AccelLevel,
        size: u64,
        name: &str,
    ) -> Result<AccelHandle, DeviceError> {
        self.reserve(name, size)?;
        let handle = AccelHandle(self.accels.len() as u32);
        self.accels.push(NullAccel {
            name: name.to_string(),
            level,
            size,
            built_with: None,
            refit_ordered: false,
        });
        log::trace!("null: created {level:?} acceleration structure {name} ({size} bytes)");
        Ok(handle)
    }

    fn accel_address(&self, accel: AccelHandle) -> Result<u64, DeviceError> {
        let tracked = self
            .accels
            .get(accel.0 as usize)
            .ok_or(DeviceError::InvalidHandle {
                kind: "acceleration structure",
                index: accel.0,
            })?;
        debug_assert!(tracked.size > 0);
        Ok(ACCEL_ADDRESS_BASE + accel.0 as u64 * 0x10000)
    }

    fn write_descriptors(
        &mut self,
        pool: DescriptorPoolKind,
        first: u32,
        descriptors: &[Descriptor],
    ) -> Result<(), DeviceError> {
        for (i, descriptor) in descriptors.iter().enumerate() {
            self.descriptors.insert((pool, first + i as u32), *descriptor);
        }
        Ok(())
    }

    fn create_pipeline_layout(
        &mut self,
        desc: &PipelineLayoutDesc<'_>,
    ) -> Result<LayoutHandle, DeviceError> {
        let handle = LayoutHandle(self.layouts.len() as u32);
        self.layouts.push(desc.scope);
        Ok(handle)
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc<'_>) -> Result<PipelineHandle, DeviceError> {
        if desc.library.is_empty() {
            return Err(DeviceError::InvalidPipeline(format!(
                "{}: empty shader library",
                desc.name
            )));
        }
        match self.layouts.get(desc.global_layout.0 as usize) {
            Some(LayoutScope::Global) => {}
            _ => {
                return Err(DeviceError::InvalidPipeline(format!(
                    "{}: global layout {} is not a global layout",
                    desc.name, desc.global_layout.0
                )))
            }
        }
        for association in desc.local_layouts {
            if self.layouts.get(association.layout.0 as usize) != Some(&LayoutScope::Local) {
                return Err(DeviceError::InvalidPipeline(format!(
                    "{}: layout {} is not a local layout",
                    desc.name, association.layout.0
                )));
            }
        }
        let handle = PipelineHandle(self.pipelines.len() as u32);
        self.pipelines.push(NullPipeline {
            exports: vec![
                desc.raygen.to_string(),
                desc.hit_group.to_string(),
                desc.miss.to_string(),
            ],
        });
        Ok(handle)
    }

    fn shader_identifier_size(&self) -> u32 {
        SHADER_IDENTIFIER_SIZE
    }

    fn shader_record_alignment(&self) -> u32 {
        SHADER_RECORD_ALIGNMENT
    }

    fn shader_identifier(
        &self,
        pipeline: PipelineHandle,
        export: &str,
    ) -> Result<Vec<u8>, DeviceError> {
        let tracked = self
            .pipelines
            .get(pipeline.0 as usize)
            .ok_or(DeviceError::InvalidHandle {
                kind: "pipeline",
                index: pipeline.0,
            })?;
        let group = tracked
            .exports
            .iter()
            .position(|e| e == export)
            .ok_or_else(|| DeviceError::UnknownExport(export.to_string()))?;

        let mut identifier = vec![0u8; SHADER_IDENTIFIER_SIZE as usize];
        identifier[0] = pipeline.0 as u8 + 1;
        identifier[1] = group as u8 + 1;
        for (dst, src) in identifier[2..].iter_mut().zip(export.bytes()) {
            *dst = src;
        }
        Ok(identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{AccelBuild, GeometryDesc, IndexFormat, VertexFormat};

    fn geometry(vb: BufferHandle, ib: BufferHandle) -> GeometryDesc {
        GeometryDesc {
            vertex_buffer: vb,
            vertex_count: 3,
            vertex_stride: 24,
            vertex_format: VertexFormat::Float3,
            index_buffer: ib,
            index_count: 3,
            index_format: IndexFormat::U32,
            opaque: true,
        }
    }

    fn buffer(device: &mut NullDevice, size: u64, usage: BufferUsage) -> BufferHandle {
        device
            .create_buffer(&BufferDesc {
                size,
                usage,
                name: "test",
            })
            .unwrap()
    }

    #[test]
    fn test_memory_budget_rejects_allocation() {
        let mut device = NullDevice::with_memory_budget(100);
        let ok = device.create_buffer(&BufferDesc {
            size: 64,
            usage: BufferUsage::Staging,
            name: "a",
        });
        assert!(ok.is_ok());
        let err = device
            .create_buffer(&BufferDesc {
                size: 64,
                usage: BufferUsage::Staging,
                name: "b",
            })
            .unwrap_err();
        assert!(matches!(err, DeviceError::OutOfMemory { size: 64, .. }));
    }

    #[test]
    fn test_host_write_into_device_local_rejected() {
        let mut device = NullDevice::new();
        let vb = buffer(&mut device, 16, BufferUsage::Vertex);
        assert!(device.write_buffer(vb, 0, &[1, 2, 3]).is_err());
    }

    #[test]
    fn test_write_out_of_bounds_rejected() {
        let mut device = NullDevice::new();
        let staging = buffer(&mut device, 4, BufferUsage::Staging);
        let err = device.write_buffer(staging, 2, &[0; 4]).unwrap_err();
        assert!(matches!(err, DeviceError::WriteOutOfBounds { .. }));
    }

    #[test]
    fn test_refit_requires_updatable_build() {
        let mut device = NullDevice::new();
        let vb = buffer(&mut device, 72, BufferUsage::Vertex);
        let ib = buffer(&mut device, 12, BufferUsage::Index);
        let inputs = AccelBuildInputs::Bottom(geometry(vb, ib));
        let sizes = device.accel_prebuild(&inputs, BuildFlags::FAST_TRACE).unwrap();
        let accel = device
            .create_accel(AccelLevel::Bottom, sizes.result_size, "blas")
            .unwrap();
        let scratch = buffer(&mut device, sizes.scratch_max(), BufferUsage::Scratch);

        let mut list = CommandList::new();
        list.push(Command::BuildAccel(AccelBuild {
            dst: accel,
            inputs,
            flags: BuildFlags::FAST_TRACE,
            mode: BuildMode::Update,
            scratch,
            descriptor: 0,
        }));
        assert!(device.execute(&list).is_err());

        list.clear();
        list.push(Command::BuildAccel(AccelBuild {
            dst: accel,
            inputs,
            flags: BuildFlags::FAST_TRACE,
            mode: BuildMode::Build,
            scratch,
            descriptor: 0,
        }));
        device.execute(&list).unwrap();
        assert_eq!(device.stats().full_builds, 1);
        assert_eq!(device.stats().refits, 0);
    }

    #[test]
    fn test_refit_requires_refit_barrier() {
        let updatable = BuildFlags {
            allow_update: true,
            prefer_fast_trace: true,
        };
        let mut device = NullDevice::new();
        let vb = buffer(&mut device, 72, BufferUsage::Vertex);
        let ib = buffer(&mut device, 12, BufferUsage::Index);
        let inputs = AccelBuildInputs::Bottom(geometry(vb, ib));
        let sizes = device.accel_prebuild(&inputs, updatable).unwrap();
        let accel = device
            .create_accel(AccelLevel::Bottom, sizes.result_size, "blas")
            .unwrap();
        let scratch = buffer(&mut device, sizes.scratch_max(), BufferUsage::Scratch);
        let build = |mode| {
            Command::BuildAccel(AccelBuild {
                dst: accel,
                inputs,
                flags: updatable,
                mode,
                scratch,
                descriptor: 0,
            })
        };

        let mut list = CommandList::new();
        list.push(build(BuildMode::Build));
        device.execute(&list).unwrap();

        list.clear();
        list.push(build(BuildMode::Update));
        assert!(device.execute(&list).is_err());

        list.clear();
        list.push(Command::RefitBarrier { accel });
        list.push(build(BuildMode::Update));
        device.execute(&list).unwrap();
        assert_eq!(device.stats().refits, 1);

        // One barrier covers one refit
        list.clear();
        list.push(build(BuildMode::Update));
        assert!(device.execute(&list).is_err());
        assert_eq!(device.stats().refits, 1);
    }

    #[test]
    fn test_copy_buffer_moves_contents() {
        let mut device = NullDevice::new();
        let staging = buffer(&mut device, 4, BufferUsage::Staging);
        let vb = buffer(&mut device, 4, BufferUsage::Vertex);
        device.write_buffer(staging, 0, &[9, 8, 7, 6]).unwrap();

        let mut list = CommandList::new();
        list.push(Command::CopyBuffer {
            src: staging,
            dst: vb,
            size: 4,
        });
        device.execute(&list).unwrap();
        assert_eq!(device.buffer_contents(vb), Some(&[9u8, 8, 7, 6][..]));
    }

    #[test]
    fn test_image_barrier_tracks_state() {
        let mut device = NullDevice::new();
        let image = device
            .create_image(&ImageDesc {
                width: 4,
                height: 4,
                format: ImageFormat::Rgba8Unorm,
                name: "out",
            })
            .unwrap();
        let mut list = CommandList::new();
        list.push(Command::ImageBarrier {
            image,
            before: ResourceState::UnorderedAccess,
            after: ResourceState::ShaderResource,
        });
        assert!(device.execute(&list).is_err());

        list.clear();
        list.push(Command::ImageBarrier {
            image,
            before: ResourceState::Common,
            after: ResourceState::UnorderedAccess,
        });
        device.execute(&list).unwrap();
        assert_eq!(
            device.image(image).unwrap().state,
            ResourceState::UnorderedAccess
        );
    }

    #[test]
    fn test_shader_identifiers_are_distinct_per_export() {
        let mut device = NullDevice::new();
        let global = device
            .create_pipeline_layout(&PipelineLayoutDesc {
                params: &[],
                scope: LayoutScope::Global,
                name: "global",
            })
            .unwrap();
        let pipeline = device
            .create_pipeline(&PipelineDesc {
                library: &[0x03, 0x02, 0x23, 0x07],
                raygen: "rg",
                closest_hit: "ch",
                miss: "ms",
                hit_group: "hg",
                payload_size: 16,
                attribute_size: 8,
                global_layout: global,
                local_layouts: &[],
                max_recursion_depth: 3,
                name: "test",
            })
            .unwrap();
        let rg = device.shader_identifier(pipeline, "rg").unwrap();
        let hg = device.shader_identifier(pipeline, "hg").unwrap();
        assert_eq!(rg.len(), 32);
        assert_ne!(rg, hg);
        assert!(matches!(
            device.shader_identifier(pipeline, "ch"),
            Err(DeviceError::UnknownExport(_))
        ));
    }
}
