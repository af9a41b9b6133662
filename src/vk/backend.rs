//! [`RtDevice`] on top of Vulkan ray tracing.

use std::collections::HashMap;

use ash::vk;

use super::accel::{self, InputAddresses, VulkanAccel};
use super::buffer::BufferResource;
use super::descriptor::{self, DescriptorSetCache, GlobalLayout, Resolved};
use super::device::VulkanDevice;
use super::image::{self, StorageImage};
use super::pipeline::RtPipeline;
use crate::error::DeviceError;
use crate::gpu::{
    AccelBuild, AccelBuildInputs, AccelHandle, AccelLevel, AccelSizes, BufferDesc,
    BufferHandle, BufferUsage, BuildFlags, Command, CommandList, Descriptor, DescriptorPoolKind,
    DispatchRays, ImageDesc, ImageHandle, LayoutHandle, LayoutScope, PipelineDesc,
    PipelineHandle, PipelineLayoutDesc, ResourceState, RootArgument, RtDevice, SamplerPreset,
    TableRegion,
};

const SCRATCH_ALIGNMENT: u64 = 256;
const INSTANCE_ALIGNMENT: u64 = 16;
const MAX_ANISOTROPY: f32 = 16.0;

struct TrackedBuffer {
    resource: BufferResource,
    usage: BufferUsage,
    name: String,
}

enum TrackedLayout {
    Global(GlobalLayout),
    /// Local arguments are shader record data; nothing to create.
    Local,
}

fn invalid(kind: &'static str, index: u32) -> DeviceError {
    DeviceError::InvalidHandle { kind, index }
}

/// Maps allocation failures of `name` to [`DeviceError::OutOfMemory`].
fn allocation_error(name: &str, size: u64) -> impl FnOnce(DeviceError) -> DeviceError + '_ {
    move |err| match err {
        DeviceError::Vulkan(
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY,
        ) => DeviceError::OutOfMemory {
            name: name.to_string(),
            size,
        },
        other => other,
    }
}

fn buffer_flags(
    usage: BufferUsage,
) -> (vk::BufferUsageFlags, vk::MemoryPropertyFlags) {
    let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
    let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;
    match usage {
        BufferUsage::Staging => (vk::BufferUsageFlags::TRANSFER_SRC, host),
        BufferUsage::Vertex | BufferUsage::Index => (
            vk::BufferUsageFlags::TRANSFER_DST
                | vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
            local,
        ),
        BufferUsage::Scratch => (
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            local,
        ),
        BufferUsage::Instances => (
            vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
            host,
        ),
        BufferUsage::ShaderTable => (
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            host,
        ),
    }
}

fn buffer_access(state: ResourceState) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match state {
        ResourceState::Common => (vk::AccessFlags::empty(), vk::PipelineStageFlags::TOP_OF_PIPE),
        ResourceState::CopyDest => {
            (vk::AccessFlags::TRANSFER_WRITE, vk::PipelineStageFlags::TRANSFER)
        }
        ResourceState::CopySource => {
            (vk::AccessFlags::TRANSFER_READ, vk::PipelineStageFlags::TRANSFER)
        }
        ResourceState::ShaderResource => (
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR
                | vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
        ),
        ResourceState::UnorderedAccess => (
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
        ),
    }
}

pub struct VulkanBackend {
    vk_dev: VulkanDevice,
    command_pool: vk::CommandPool,
    sampler: vk::Sampler,
    buffers: Vec<Option<TrackedBuffer>>,
    images: Vec<StorageImage>,
    accels: Vec<VulkanAccel>,
    layouts: Vec<TrackedLayout>,
    pipelines: Vec<RtPipeline>,
    /// Host copy of every written descriptor slot
    descriptors: HashMap<(DescriptorPoolKind, u32), Descriptor>,
    sets: DescriptorSetCache,
}

impl VulkanBackend {
    pub fn new(vk_dev: VulkanDevice) -> Result<Self, DeviceError> {
        let command_pool = vk_dev.create_command_pool()?;

        let anisotropy = MAX_ANISOTROPY.min(vk_dev.max_sampler_anisotropy);
        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(true)
            .max_anisotropy(anisotropy)
            .max_lod(vk::LOD_CLAMP_NONE);
        let sampler = unsafe { vk_dev.device.create_sampler(&sampler_info, None)? };
        let sets = DescriptorSetCache::new(&vk_dev.device)?;

        log::debug!("vk: backend ready (sampler anisotropy {anisotropy})");

        Ok(VulkanBackend {
            vk_dev,
            command_pool,
            sampler,
            buffers: Vec::new(),
            images: Vec::new(),
            accels: Vec::new(),
            layouts: Vec::new(),
            pipelines: Vec::new(),
            descriptors: HashMap::new(),
            sets,
        })
    }

    pub fn vk_device(&self) -> &VulkanDevice {
        &self.vk_dev
    }

    pub fn image(&self, handle: ImageHandle) -> Option<&StorageImage> {
        self.images.get(handle.0 as usize)
    }

    fn tracked_buffer(&self, handle: BufferHandle) -> Result<&TrackedBuffer, DeviceError> {
        self.buffers
            .get(handle.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(invalid("buffer", handle.0))
    }

    fn buffer_address(&self, handle: BufferHandle) -> Result<u64, DeviceError> {
        self.tracked_buffer(handle)?.resource.address()
    }

    fn tracked_accel(&self, handle: AccelHandle) -> Result<&VulkanAccel, DeviceError> {
        self.accels
            .get(handle.0 as usize)
            .ok_or(invalid("acceleration structure", handle.0))
    }

    fn input_addresses(&self, inputs: &AccelBuildInputs) -> Result<InputAddresses, DeviceError> {
        Ok(match inputs {
            AccelBuildInputs::Bottom(geometry) => InputAddresses::Bottom {
                vertices: self.buffer_address(geometry.vertex_buffer)?,
                indices: self.buffer_address(geometry.index_buffer)?,
            },
            AccelBuildInputs::Top { instances, .. } => InputAddresses::Top {
                instances: self.buffer_address(*instances)?,
            },
        })
    }

    fn region(&self, region: &TableRegion) -> Result<vk::StridedDeviceAddressRegionKHR, DeviceError> {
        Ok(vk::StridedDeviceAddressRegionKHR {
            device_address: self.buffer_address(region.buffer)? + region.offset,
            stride: region.stride,
            size: region.size,
        })
    }

    fn resolve(&self, descriptor: Descriptor) -> Result<Resolved, DeviceError> {
        Ok(match descriptor {
            Descriptor::ImageUav(handle) => Resolved::StorageImage(
                self.image(handle).ok_or(invalid("image", handle.0))?.view,
            ),
            Descriptor::AccelUav(handle) => Resolved::Accel(self.tracked_accel(handle)?.accel),
            Descriptor::BufferSrv { buffer, .. } => {
                let tracked = self.tracked_buffer(buffer)?;
                Resolved::StorageBuffer {
                    buffer: tracked.resource.buffer,
                    offset: tracked.resource.offset(),
                    range: tracked.resource.size,
                }
            }
            Descriptor::Sampler(SamplerPreset::AnisotropicWrap) => Resolved::Sampler(self.sampler),
        })
    }

    fn resolve_argument(&self, argument: &RootArgument) -> Result<Vec<Resolved>, DeviceError> {
        match argument {
            RootArgument::Accel(handle) => {
                Ok(vec![Resolved::Accel(self.tracked_accel(*handle)?.accel)])
            }
            RootArgument::Table(table) => (0..table.count)
                .map(|offset| {
                    let index = table.index(offset);
                    let descriptor = self
                        .descriptors
                        .get(&(table.pool, index))
                        .copied()
                        .ok_or_else(|| {
                            DeviceError::InvalidCommand(format!(
                                "{:?} descriptor {index} bound before it was written",
                                table.pool
                            ))
                        })?;
                    self.resolve(descriptor)
                })
                .collect(),
        }
    }

    fn descriptor_set(&mut self, dispatch: &DispatchRays) -> Result<vk::DescriptorSet, DeviceError> {
        if let Some(set) = self.sets.get(&dispatch.arguments) {
            return Ok(set);
        }
        let Some(TrackedLayout::Global(layout)) = self.layouts.get(dispatch.global_layout.0 as usize)
        else {
            return Err(invalid("global layout", dispatch.global_layout.0));
        };
        let set_layout = layout.set_layout;

        let mut writes = Vec::with_capacity(dispatch.arguments.len());
        for (slot, argument) in &dispatch.arguments {
            let capacity = layout
                .bindings
                .get(*slot as usize)
                .map(|&(_, count)| count)
                .ok_or_else(|| {
                    DeviceError::InvalidCommand(format!("argument bound to missing slot {slot}"))
                })?;
            let resolved = self.resolve_argument(argument)?;
            if resolved.len() as u32 > capacity {
                return Err(DeviceError::InvalidCommand(format!(
                    "{} descriptors bound to slot {slot} of {capacity}",
                    resolved.len()
                )));
            }
            writes.push((*slot, resolved));
        }

        let device = &self.vk_dev.device;
        let set = self.sets.allocate(device, set_layout, &dispatch.arguments)?;
        for (binding, resolved) in &writes {
            descriptor::write_binding(device, set, *binding, resolved)?;
        }
        Ok(set)
    }

    fn record_build(&self, cmd: vk::CommandBuffer, build: &AccelBuild) -> Result<(), DeviceError> {
        let dst = self.tracked_accel(build.dst)?;
        let addresses = self.input_addresses(&build.inputs)?;
        let scratch = self.buffer_address(build.scratch)?;
        accel::cmd_build(
            &self.vk_dev,
            cmd,
            dst,
            &build.inputs,
            addresses,
            build.flags,
            build.mode,
            scratch,
        )
    }

    fn record_dispatch(
        &mut self,
        cmd: vk::CommandBuffer,
        dispatch: &DispatchRays,
    ) -> Result<(), DeviceError> {
        let set = self.descriptor_set(dispatch)?;
        let pipeline = self
            .pipelines
            .get(dispatch.pipeline.0 as usize)
            .ok_or(invalid("pipeline", dispatch.pipeline.0))?;
        let Some(TrackedLayout::Global(layout)) = self.layouts.get(dispatch.global_layout.0 as usize)
        else {
            return Err(invalid("global layout", dispatch.global_layout.0));
        };

        let raygen = self.region(&dispatch.raygen)?;
        let miss = self.region(&dispatch.miss)?;
        let hit_group = self.region(&dispatch.hit_group)?;
        let callable = vk::StridedDeviceAddressRegionKHR::default();

        let device = &self.vk_dev.device;
        unsafe {
            device.cmd_bind_pipeline(
                cmd,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                pipeline.pipeline,
            );
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                layout.pipeline_layout,
                0,
                &[set],
                &[],
            );
            self.vk_dev.rt_pipeline.cmd_trace_rays(
                cmd,
                &raygen,
                &miss,
                &hit_group,
                &callable,
                dispatch.width,
                dispatch.height,
                dispatch.depth,
            );
        }
        Ok(())
    }

    /// Translates `list` into `cmd`, which must be recording.
    pub fn record(&mut self, cmd: vk::CommandBuffer, list: &CommandList) -> Result<(), DeviceError> {
        for command in list.commands() {
            match command {
                Command::CopyBuffer { src, dst, size } => {
                    let src = self.tracked_buffer(*src)?;
                    let dst = self.tracked_buffer(*dst)?;
                    let region = vk::BufferCopy {
                        src_offset: src.resource.offset(),
                        dst_offset: dst.resource.offset(),
                        size: *size,
                    };
                    unsafe {
                        self.vk_dev.device.cmd_copy_buffer(
                            cmd,
                            src.resource.buffer,
                            dst.resource.buffer,
                            &[region],
                        );
                    }
                }
                Command::BufferBarrier {
                    buffer,
                    before,
                    after,
                } => {
                    let tracked = self.tracked_buffer(*buffer)?;
                    let (src_access, src_stage) = buffer_access(*before);
                    let (dst_access, dst_stage) = buffer_access(*after);
                    let barrier = vk::BufferMemoryBarrier::default()
                        .src_access_mask(src_access)
                        .dst_access_mask(dst_access)
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .buffer(tracked.resource.buffer)
                        .offset(0)
                        .size(vk::WHOLE_SIZE);
                    unsafe {
                        self.vk_dev.device.cmd_pipeline_barrier(
                            cmd,
                            src_stage,
                            dst_stage,
                            vk::DependencyFlags::empty(),
                            &[],
                            &[barrier],
                            &[],
                        );
                    }
                }
                Command::ImageBarrier {
                    image,
                    before,
                    after,
                } => {
                    let tracked = self.image(*image).ok_or(invalid("image", image.0))?;
                    image::cmd_transition(&self.vk_dev.device, cmd, tracked.image, *before, *after);
                }
                Command::BuildAccel(build) => self.record_build(cmd, build)?,
                Command::AccelBarrier { accel } => {
                    self.tracked_accel(*accel)?;
                    accel::cmd_build_barrier(&self.vk_dev, cmd);
                }
                Command::RefitBarrier { accel } => {
                    self.tracked_accel(*accel)?;
                    accel::cmd_refit_barrier(&self.vk_dev, cmd);
                }
                Command::DispatchRays(dispatch) => self.record_dispatch(cmd, dispatch)?,
            }
        }
        Ok(())
    }

    /// Records `list` into a throwaway command buffer and waits for it.
    pub fn submit_one_time(&mut self, list: &CommandList) -> Result<(), DeviceError> {
        let cmd = self.vk_dev.begin_one_time(self.command_pool)?;
        let recorded = self.record(cmd, list);
        self.vk_dev
            .finish_one_time(self.command_pool, cmd, recorded.is_ok())?;
        recorded
    }
}

impl RtDevice for VulkanBackend {
    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<BufferHandle, DeviceError> {
        let (usage, memory) = buffer_flags(desc.usage);
        let alignment = match desc.usage {
            BufferUsage::ShaderTable => self.vk_dev.shader_group_base_alignment as u64,
            BufferUsage::Scratch => SCRATCH_ALIGNMENT,
            BufferUsage::Instances => INSTANCE_ALIGNMENT,
            _ => 1,
        };
        let resource = BufferResource::new(
            &self.vk_dev.device,
            &self.vk_dev.memory_properties,
            desc.size,
            usage,
            memory,
            alignment,
        )
        .map_err(allocation_error(desc.name, desc.size))?;

        let handle = BufferHandle(self.buffers.len() as u32);
        self.buffers.push(Some(TrackedBuffer {
            resource,
            usage: desc.usage,
            name: desc.name.to_string(),
        }));
        log::trace!("vk: created buffer {} ({} bytes)", desc.name, desc.size);
        Ok(handle)
    }

    fn write_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        let tracked = self.tracked_buffer(buffer)?;
        if !tracked.usage.host_visible() {
            return Err(DeviceError::InvalidCommand(format!(
                "host write into device-local buffer {}",
                tracked.name
            )));
        }
        tracked.resource.store_at(&self.vk_dev.device, offset, data)
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(tracked) = self
            .buffers
            .get_mut(buffer.0 as usize)
            .and_then(Option::take)
        {
            tracked.resource.destroy(&self.vk_dev.device);
        }
    }

    fn create_image(&mut self, desc: &ImageDesc<'_>) -> Result<ImageHandle, DeviceError> {
        let size = desc.width as u64 * desc.height as u64 * desc.format.bytes_per_pixel() as u64;
        let image = StorageImage::new(&self.vk_dev, desc.width, desc.height, desc.format)
            .map_err(allocation_error(desc.name, size))?;
        let handle = ImageHandle(self.images.len() as u32);
        self.images.push(image);
        Ok(handle)
    }

    fn accel_prebuild(
        &self,
        inputs: &AccelBuildInputs,
        flags: BuildFlags,
    ) -> Result<AccelSizes, DeviceError> {
        // Size queries ignore addresses
        let addresses = match inputs {
            AccelBuildInputs::Bottom(_) => InputAddresses::Bottom {
                vertices: 0,
                indices: 0,
            },
            AccelBuildInputs::Top { .. } => InputAddresses::Top { instances: 0 },
        };
        accel::prebuild_sizes(&self.vk_dev, inputs, addresses, flags)
    }

    fn create_accel(
        &mut self,
        level: AccelLevel,
        size: u64,
        name: &str,
    ) -> Result<AccelHandle, DeviceError> {
        let created = accel::create(&self.vk_dev, level, size).map_err(allocation_error(name, size))?;
        let handle = AccelHandle(self.accels.len() as u32);
        self.accels.push(created);
        log::debug!("vk: created {level:?} acceleration structure {name} ({size} bytes)");
        Ok(handle)
    }

    fn accel_address(&self, accel: AccelHandle) -> Result<u64, DeviceError> {
        Ok(self.tracked_accel(accel)?.address)
    }

    fn write_descriptors(
        &mut self,
        pool: DescriptorPoolKind,
        first: u32,
        descriptors: &[Descriptor],
    ) -> Result<(), DeviceError> {
        for descriptor in descriptors {
            // Reject dangling handles at write time rather than at dispatch
            self.resolve(*descriptor)?;
        }
        for (i, descriptor) in descriptors.iter().enumerate() {
            self.descriptors.insert((pool, first + i as u32), *descriptor);
        }
        self.sets.invalidate(&self.vk_dev.device)
    }

    fn create_pipeline_layout(
        &mut self,
        desc: &PipelineLayoutDesc<'_>,
    ) -> Result<LayoutHandle, DeviceError> {
        let layout = match desc.scope {
            LayoutScope::Global => {
                TrackedLayout::Global(GlobalLayout::new(&self.vk_dev.device, desc.params)?)
            }
            LayoutScope::Local => TrackedLayout::Local,
        };
        let handle = LayoutHandle(self.layouts.len() as u32);
        self.layouts.push(layout);
        log::debug!("vk: created {:?} layout {}", desc.scope, desc.name);
        Ok(handle)
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc<'_>) -> Result<PipelineHandle, DeviceError> {
        let Some(TrackedLayout::Global(global)) = self.layouts.get(desc.global_layout.0 as usize)
        else {
            return Err(DeviceError::InvalidPipeline(format!(
                "{}: layout {} is not a global layout",
                desc.name, desc.global_layout.0
            )));
        };
        for association in desc.local_layouts {
            if !matches!(
                self.layouts.get(association.layout.0 as usize),
                Some(TrackedLayout::Local)
            ) {
                return Err(DeviceError::InvalidPipeline(format!(
                    "{}: layout {} is not a local layout",
                    desc.name, association.layout.0
                )));
            }
        }
        log::debug!(
            "vk: {} payload {} bytes, attributes {} bytes",
            desc.name,
            desc.payload_size,
            desc.attribute_size
        );

        let pipeline = RtPipeline::new(&self.vk_dev, desc, global.pipeline_layout)?;
        let handle = PipelineHandle(self.pipelines.len() as u32);
        self.pipelines.push(pipeline);
        Ok(handle)
    }

    fn shader_identifier_size(&self) -> u32 {
        self.vk_dev.shader_group_handle_size
    }

    fn shader_record_alignment(&self) -> u32 {
        self.vk_dev.shader_group_handle_alignment
    }

    fn shader_identifier(
        &self,
        pipeline: PipelineHandle,
        export: &str,
    ) -> Result<Vec<u8>, DeviceError> {
        self.pipelines
            .get(pipeline.0 as usize)
            .ok_or(invalid("pipeline", pipeline.0))?
            .identifier(export)
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        let device = &self.vk_dev.device;
        unsafe {
            device.device_wait_idle().ok();
        }
        self.sets.destroy(device);
        for pipeline in &self.pipelines {
            pipeline.destroy(device);
        }
        for layout in &self.layouts {
            if let TrackedLayout::Global(global) = layout {
                global.destroy(device);
            }
        }
        for tracked in &self.accels {
            accel::destroy(&self.vk_dev, tracked);
        }
        for image in &self.images {
            image.destroy(device);
        }
        for tracked in self.buffers.iter().flatten() {
            tracked.resource.destroy(device);
        }
        unsafe {
            device.destroy_sampler(self.sampler, None);
            device.destroy_command_pool(self.command_pool, None);
        }
    }
}
