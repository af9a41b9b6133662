//! Frame orchestrator.
//!
//! Owns everything built at initialization and drives the per-frame
//! sequence: `advance_frame` (animation + shader tables), then
//! `render_frame` (TLAS refit + trace dispatch).

use glam::{Mat4, Vec3};

use crate::accel::{AccelConfig, BottomLevelAs, ScratchBuffer, TopLevelAs};
use crate::config::AppConfig;
use crate::descriptor::DescriptorHeap;
use crate::error::{RayTracerError, Result};
use crate::geometry::{GeometryBuffers, StagingBuffers};
use crate::gpu::{
    BuildFlags, Command, CommandList, Descriptor, DescriptorPoolKind, DescriptorTable,
    DispatchRays, ResourceState, RootArgument, RtDevice, SamplerPreset,
};
use crate::mesh::{self, MeshData, MeshSlot, SlotArray, Vertex};
use crate::output::OutputImage;
use crate::pipeline::{self, GlobalSlot, PipelineRegistry, RayGenConstants};
use crate::scene::SceneState;
use crate::shader_table::{ShaderRecord, ShaderTable};

/// BLAS UAVs, the TLAS UAV and the two per-slot buffer tables.
const FIXED_DESCRIPTORS: u32 = MeshSlot::COUNT as u32 + 1 + 2 * MeshSlot::COUNT as u32;

const TLAS_FLAGS: BuildFlags = BuildFlags {
    allow_update: true,
    prefer_fast_trace: true,
};

pub struct RayTracer {
    width: u32,
    height: u32,
    frames_in_flight: u32,
    geometry: GeometryBuffers,
    blas: SlotArray<BottomLevelAs>,
    tlas: TopLevelAs,
    scratch: ScratchBuffer,
    pipeline: PipelineRegistry,
    heap: DescriptorHeap,
    output_uavs: DescriptorTable,
    sampler_table: DescriptorTable,
    index_buffers: DescriptorTable,
    vertex_buffers: DescriptorTable,
    outputs: Vec<OutputImage>,
    raygen_tables: Vec<ShaderTable>,
    hit_group_tables: Vec<ShaderTable>,
    miss_table: ShaderTable,
    scene: SceneState,
    /// Frame whose tables were written by the last `advance_frame`
    advanced: Option<u32>,
    frames_rendered: u64,
}

impl RayTracer {
    /// Loads the model and shader library named by `config`, then builds
    /// everything. See [`RayTracer::initialize_with`].
    pub fn initialize<D: RtDevice>(
        device: &mut D,
        cmd: &mut CommandList,
        staging: &mut StagingBuffers,
        config: &AppConfig,
    ) -> Result<Self> {
        let model = mesh::load_obj(&config.scene.mesh_path)?;
        let library = pipeline::load_library(&config.shaders.library_path)?;
        Self::initialize_with(device, cmd, staging, config, model, &library)
    }

    /// Creates output images, uploads geometry, compiles the pipeline,
    /// records the BLAS builds and the first full TLAS build into `cmd`, and
    /// writes every shader table.
    ///
    /// `cmd` must complete before the first frame is recorded, and `staging`
    /// must stay alive until then.
    pub fn initialize_with<D: RtDevice>(
        device: &mut D,
        cmd: &mut CommandList,
        staging: &mut StagingBuffers,
        config: &AppConfig,
        model: MeshData,
        library: &[u8],
    ) -> Result<Self> {
        config.validate()?;
        let width = config.viewport.width;
        let height = config.viewport.height;
        let frames_in_flight = config.frames.frames_in_flight;

        let mut heap = DescriptorHeap::new(frames_in_flight + FIXED_DESCRIPTORS, 1);
        let output_uavs = heap.reserve(DescriptorPoolKind::CbvSrvUav, frames_in_flight)?;
        let blas_uavs = heap.reserve(DescriptorPoolKind::CbvSrvUav, MeshSlot::COUNT as u32)?;
        let tlas_uav = heap.reserve(DescriptorPoolKind::CbvSrvUav, 1)?;

        let outputs = (0..frames_in_flight)
            .map(|i| OutputImage::new(device, width, height, &format!("RayTracingOut{i}")))
            .collect::<Result<Vec<_>>>()?;
        let output_views: Vec<_> = outputs
            .iter()
            .map(|o| Descriptor::ImageUav(o.image()))
            .collect();
        heap.write(device, &output_uavs, &output_views)?;

        // Geometry
        let meshes = SlotArray::from_fn(|slot| match slot {
            MeshSlot::Ground => mesh::ground_cube(),
            MeshSlot::Model => model.clone(),
        });
        let geometry = GeometryBuffers::upload(device, cmd, staging, &meshes)?;
        let index_views: Vec<_> = MeshSlot::ALL
            .iter()
            .map(|&slot| Descriptor::BufferSrv {
                buffer: geometry.slot(slot).index_buffer,
                stride: std::mem::size_of::<u32>() as u32,
            })
            .collect();
        let vertex_views: Vec<_> = MeshSlot::ALL
            .iter()
            .map(|&slot| Descriptor::BufferSrv {
                buffer: geometry.slot(slot).vertex_buffer,
                stride: Vertex::STRIDE,
            })
            .collect();

        let pipeline = PipelineRegistry::compile(device, library)?;

        // Acceleration structures
        let descs = geometry.geometry_descs();
        let mut blas = SlotArray::try_from_fn(|slot| {
            BottomLevelAs::prebuild(
                device,
                descs[slot],
                blas_uavs.index(slot.index() as u32),
                &format!("{}BLAS", slot.name()),
            )
        })?;
        let mut tlas = TopLevelAs::prebuild(
            device,
            &AccelConfig { frames_in_flight },
            TLAS_FLAGS,
            tlas_uav.first,
        )?;
        let accel_uavs: Vec<_> = blas
            .iter()
            .map(|(_, b)| Descriptor::AccelUav(b.handle()))
            .chain(std::iter::once(Descriptor::AccelUav(tlas.handle())))
            .collect();
        heap.write(device, &blas_uavs, &accel_uavs[..MeshSlot::COUNT])?;
        heap.write(device, &tlas_uav, &accel_uavs[MeshSlot::COUNT..])?;

        let index_buffers =
            heap.allocate_table(device, DescriptorPoolKind::CbvSrvUav, &index_views)?;
        let vertex_buffers =
            heap.allocate_table(device, DescriptorPoolKind::CbvSrvUav, &vertex_views)?;
        let sampler_table = heap.allocate_table(
            device,
            DescriptorPoolKind::Sampler,
            &[Descriptor::Sampler(SamplerPreset::AnisotropicWrap)],
        )?;
        log::debug!(
            "Descriptors: outputs {}..{}, BLAS {}..{}, TLAS {}, index buffers {}, vertex buffers {}",
            output_uavs.first,
            output_uavs.first + output_uavs.count,
            blas_uavs.first,
            blas_uavs.first + blas_uavs.count,
            tlas_uav.first,
            index_buffers.first,
            vertex_buffers.first
        );

        let sizes: Vec<_> = blas
            .iter()
            .map(|(_, b)| b.sizes())
            .chain(std::iter::once(tlas.sizes()))
            .collect();
        let scratch = ScratchBuffer::allocate(device, &sizes)?;

        for (_, structure) in blas.iter_mut() {
            structure.build(cmd, &scratch)?;
        }
        let scene = SceneState::new(
            config.scene.pos_scale(),
            config.scene.rotation_step_degrees,
        );
        tlas.set_instances(device, 0, &blas, &scene.instance_transforms())?;
        tlas.build(cmd, &scratch, 0, false)?;

        // Shader tables
        let mut raygen_tables = Vec::with_capacity(frames_in_flight as usize);
        let mut hit_group_tables = Vec::with_capacity(frames_in_flight as usize);
        for i in 0..frames_in_flight {
            raygen_tables.push(ShaderTable::create(
                device,
                1,
                pipeline.raygen_record_size(),
                &format!("RayGenShaderTable{i}"),
            )?);
            hit_group_tables.push(ShaderTable::create(
                device,
                1,
                pipeline.hit_group_record_size(),
                &format!("HitGroupShaderTable{i}"),
            )?);
        }
        let mut miss_table =
            ShaderTable::create(device, 1, pipeline.miss_record_size(), "MissShaderTable")?;
        miss_table.add_shader_record(
            device,
            &ShaderRecord::identifier_only(&pipeline.identifiers().miss),
        )?;

        let mut tracer = RayTracer {
            width,
            height,
            frames_in_flight,
            geometry,
            blas,
            tlas,
            scratch,
            pipeline,
            heap,
            output_uavs,
            sampler_table,
            index_buffers,
            vertex_buffers,
            outputs,
            raygen_tables,
            hit_group_tables,
            miss_table,
            scene,
            advanced: None,
            frames_rendered: 0,
        };

        let aspect = width as f32 / height as f32;
        let eye = config.camera.eye();
        let view_proj = config.camera.view_proj(aspect);
        for frame in 0..frames_in_flight {
            tracer.write_frame_tables(device, frame, eye, view_proj)?;
        }

        log::info!(
            "Ray tracer initialized: {width}x{height}, {frames_in_flight} frames in flight, model {} ({} triangles)",
            model.name,
            model.triangle_count()
        );
        Ok(tracer)
    }

    fn check_frame(&self, frame: u32) -> Result<()> {
        if frame >= self.frames_in_flight {
            return Err(RayTracerError::FrameIndex {
                index: frame,
                count: self.frames_in_flight,
            });
        }
        Ok(())
    }

    fn write_frame_tables<D: RtDevice>(
        &mut self,
        device: &mut D,
        frame: u32,
        eye: Vec3,
        view_proj: Mat4,
    ) -> Result<()> {
        let ids = self.pipeline.identifiers();

        let constants = RayGenConstants::new(eye, view_proj);
        let raygen = &mut self.raygen_tables[frame as usize];
        raygen.reset();
        raygen.add_shader_record(
            device,
            &ShaderRecord::new(&ids.raygen, bytemuck::bytes_of(&constants)),
        )?;

        let rotation = pipeline::hit_group_constants(self.scene.rotation());
        let hit_group = &mut self.hit_group_tables[frame as usize];
        hit_group.reset();
        hit_group.add_shader_record(
            device,
            &ShaderRecord::new(&ids.hit_group, bytemuck::bytes_of(&rotation)),
        )?;
        Ok(())
    }

    /// Advances the model rotation and rewrites the ray-generation and
    /// hit-group tables of `frame`.
    ///
    /// The caller guarantees the GPU has finished the previous use of `frame`.
    pub fn advance_frame<D: RtDevice>(
        &mut self,
        device: &mut D,
        frame: u32,
        eye: Vec3,
        view_proj: Mat4,
    ) -> Result<()> {
        self.check_frame(frame)?;
        self.scene.advance();
        self.write_frame_tables(device, frame, eye, view_proj)?;
        self.advanced = Some(frame);
        Ok(())
    }

    /// Records the TLAS refit and the trace dispatch for `frame`.
    ///
    /// Must directly follow `advance_frame` for the same frame, so the
    /// instance transforms and the hit-group record share one rotation.
    pub fn render_frame<D: RtDevice>(
        &mut self,
        device: &mut D,
        frame: u32,
        cmd: &mut CommandList,
    ) -> Result<()> {
        self.check_frame(frame)?;
        if self.advanced != Some(frame) {
            return Err(RayTracerError::FrameNotAdvanced { frame });
        }

        let output = &mut self.outputs[frame as usize];
        output.transition(cmd, ResourceState::UnorderedAccess);

        self.tlas
            .set_instances(device, frame, &self.blas, &self.scene.instance_transforms())?;
        self.tlas.build(cmd, &self.scratch, frame, true)?;

        let output_uav = DescriptorTable {
            pool: DescriptorPoolKind::CbvSrvUav,
            first: self.output_uavs.index(frame),
            count: 1,
        };
        cmd.push(Command::DispatchRays(DispatchRays {
            pipeline: self.pipeline.pipeline(),
            global_layout: self.pipeline.global_layout(),
            arguments: vec![
                (GlobalSlot::Output as u32, RootArgument::Table(output_uav)),
                (GlobalSlot::Accel as u32, RootArgument::Accel(self.tlas.handle())),
                (GlobalSlot::Sampler as u32, RootArgument::Table(self.sampler_table)),
                (GlobalSlot::IndexBuffers as u32, RootArgument::Table(self.index_buffers)),
                (GlobalSlot::VertexBuffers as u32, RootArgument::Table(self.vertex_buffers)),
            ],
            width: self.width,
            height: self.height,
            depth: 1,
            raygen: self.raygen_tables[frame as usize].region(),
            hit_group: self.hit_group_tables[frame as usize].region(),
            miss: self.miss_table.region(),
        }));

        self.advanced = None;
        self.frames_rendered += 1;
        log::trace!(
            "Frame {frame}: refit + dispatch {}x{} at angle {:.4}",
            self.width,
            self.height,
            self.scene.angle()
        );
        Ok(())
    }

    /// Output image of `frame`, transitioned to `state` when one is given.
    pub fn output_image(
        &mut self,
        frame: u32,
        state: Option<ResourceState>,
        cmd: &mut CommandList,
    ) -> Result<&OutputImage> {
        self.check_frame(frame)?;
        let output = &mut self.outputs[frame as usize];
        if let Some(state) = state {
            output.transition(cmd, state);
        }
        Ok(output)
    }

    pub fn viewport(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn frames_in_flight(&self) -> u32 {
        self.frames_in_flight
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    pub fn angle(&self) -> f32 {
        self.scene.angle()
    }

    pub fn scene(&self) -> &SceneState {
        &self.scene
    }

    pub fn geometry(&self) -> &GeometryBuffers {
        &self.geometry
    }

    pub fn blas(&self, slot: MeshSlot) -> &BottomLevelAs {
        &self.blas[slot]
    }

    pub fn tlas(&self) -> &TopLevelAs {
        &self.tlas
    }

    pub fn pipeline(&self) -> &PipelineRegistry {
        &self.pipeline
    }

    pub fn descriptor_heap(&self) -> &DescriptorHeap {
        &self.heap
    }

    pub fn raygen_table(&self, frame: u32) -> Option<&ShaderTable> {
        self.raygen_tables.get(frame as usize)
    }

    pub fn hit_group_table(&self, frame: u32) -> Option<&ShaderTable> {
        self.hit_group_tables.get(frame as usize)
    }

    pub fn miss_table(&self) -> &ShaderTable {
        &self.miss_table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::null::NullDevice;
    use crate::gpu::BuildMode;

    const LIBRARY: &[u8] = &[0x03, 0x02, 0x23, 0x07];

    fn setup(frames: u32) -> (NullDevice, RayTracer) {
        let mut config = AppConfig::for_mesh("cube.obj");
        config.viewport.width = 64;
        config.viewport.height = 32;
        config.frames.frames_in_flight = frames;
        let mut device = NullDevice::new();
        let mut cmd = CommandList::new();
        let mut staging = StagingBuffers::new();
        let tracer = RayTracer::initialize_with(
            &mut device,
            &mut cmd,
            &mut staging,
            &config,
            mesh::ground_cube(),
            LIBRARY,
        )
        .unwrap();
        device.execute(&cmd).unwrap();
        staging.release(&mut device);
        (device, tracer)
    }

    #[test]
    fn test_initialize_records_full_builds() {
        let (device, tracer) = setup(3);
        assert_eq!(device.stats().full_builds, 3);
        assert_eq!(device.stats().refits, 0);
        assert!(tracer.tlas().is_built());
        assert_eq!(tracer.miss_table().len(), 1);
        for frame in 0..3 {
            assert_eq!(tracer.raygen_table(frame).unwrap().len(), 1);
            assert_eq!(tracer.hit_group_table(frame).unwrap().len(), 1);
        }
    }

    #[test]
    fn test_descriptor_layout() {
        let (device, tracer) = setup(2);
        // outputs 0..2, BLAS 2..4, TLAS 4, index buffers 5..7, vertex buffers 7..9
        assert_eq!(tracer.blas(MeshSlot::Ground).descriptor(), 2);
        assert_eq!(tracer.blas(MeshSlot::Model).descriptor(), 3);
        assert_eq!(tracer.tlas().descriptor(), 4);
        assert_eq!(
            device.descriptor(DescriptorPoolKind::CbvSrvUav, 4),
            Some(Descriptor::AccelUav(tracer.tlas().handle()))
        );
        let vb = tracer.geometry().slot(MeshSlot::Model).vertex_buffer;
        assert_eq!(
            device.descriptor(DescriptorPoolKind::CbvSrvUav, 8),
            Some(Descriptor::BufferSrv {
                buffer: vb,
                stride: 24
            })
        );
        assert_eq!(tracer.descriptor_heap().used(DescriptorPoolKind::CbvSrvUav), 9);
        assert_eq!(tracer.descriptor_heap().used(DescriptorPoolKind::Sampler), 1);
    }

    #[test]
    fn test_render_without_advance_rejected() {
        let (mut device, mut tracer) = setup(2);
        let mut cmd = CommandList::new();
        assert!(matches!(
            tracer.render_frame(&mut device, 0, &mut cmd),
            Err(RayTracerError::FrameNotAdvanced { frame: 0 })
        ));

        tracer
            .advance_frame(&mut device, 1, Vec3::ZERO, Mat4::IDENTITY)
            .unwrap();
        assert!(matches!(
            tracer.render_frame(&mut device, 0, &mut cmd),
            Err(RayTracerError::FrameNotAdvanced { frame: 0 })
        ));
        tracer.render_frame(&mut device, 1, &mut cmd).unwrap();
        assert!(matches!(
            tracer.render_frame(&mut device, 1, &mut cmd),
            Err(RayTracerError::FrameNotAdvanced { frame: 1 })
        ));
    }

    #[test]
    fn test_frame_index_out_of_range() {
        let (mut device, mut tracer) = setup(2);
        let mut cmd = CommandList::new();
        assert!(matches!(
            tracer.advance_frame(&mut device, 2, Vec3::ZERO, Mat4::IDENTITY),
            Err(RayTracerError::FrameIndex { index: 2, count: 2 })
        ));
        assert!(tracer.output_image(5, None, &mut cmd).is_err());
    }

    #[test]
    fn test_render_frame_refits_and_dispatches() {
        let (mut device, mut tracer) = setup(2);
        let mut cmd = CommandList::new();
        tracer
            .advance_frame(&mut device, 0, Vec3::ZERO, Mat4::IDENTITY)
            .unwrap();
        tracer.render_frame(&mut device, 0, &mut cmd).unwrap();

        assert!(matches!(cmd.commands()[0], Command::ImageBarrier { .. }));
        let dispatch = cmd.dispatches().next().unwrap();
        assert_eq!((dispatch.width, dispatch.height, dispatch.depth), (64, 32, 1));
        assert_eq!(dispatch.arguments.len(), 5);
        assert_eq!(
            dispatch.arguments[1],
            (1, RootArgument::Accel(tracer.tlas().handle()))
        );

        device.execute(&cmd).unwrap();
        assert_eq!(device.stats().refits, 1);
        assert_eq!(device.stats().dispatches, 1);
        assert_eq!(tracer.frames_rendered(), 1);
    }

    #[test]
    fn test_refit_ordered_after_previous_trace() {
        let (mut device, mut tracer) = setup(2);
        let mut cmd = CommandList::new();
        for n in 0..4 {
            let frame = n % 2;
            tracer
                .advance_frame(&mut device, frame, Vec3::ZERO, Mat4::IDENTITY)
                .unwrap();
            tracer.render_frame(&mut device, frame, &mut cmd).unwrap();
            tracer
                .output_image(frame, Some(ResourceState::CopySource), &mut cmd)
                .unwrap();
        }

        let commands = cmd.commands();
        let mut refits = 0;
        for (i, command) in commands.iter().enumerate() {
            let Command::BuildAccel(build) = command else {
                continue;
            };
            if build.mode != BuildMode::Update {
                continue;
            }
            refits += 1;
            // The barrier sits between the refit and every earlier dispatch
            let barrier = commands[..i]
                .iter()
                .rposition(|c| *c == Command::RefitBarrier { accel: build.dst })
                .unwrap();
            let last_dispatch = commands[..i]
                .iter()
                .rposition(|c| matches!(c, Command::DispatchRays(_)));
            assert!(last_dispatch.map_or(true, |d| d < barrier));
        }
        assert_eq!(refits, 4);
        device.execute(&cmd).unwrap();
        assert_eq!(device.stats().refits, 4);
    }

    #[test]
    fn test_hit_group_and_instances_share_rotation() {
        let (mut device, mut tracer) = setup(1);
        let mut cmd = CommandList::new();
        tracer
            .advance_frame(&mut device, 0, Vec3::ZERO, Mat4::IDENTITY)
            .unwrap();
        tracer.render_frame(&mut device, 0, &mut cmd).unwrap();

        let table = tracer.hit_group_table(0).unwrap();
        let contents = device.buffer_contents(table.buffer()).unwrap();
        let payload: [f32; 16] = bytemuck::pod_read_unaligned(&contents[32..96]);
        let rotation = Mat4::from_cols_array(&payload).transpose();
        assert!(rotation.abs_diff_eq(tracer.scene().rotation(), 1e-6));

        let instances = tracer.tlas().instances(0).unwrap();
        assert_eq!(
            instances[MeshSlot::Model].transform,
            tracer.scene().instance_transforms()[MeshSlot::Model]
        );
    }

    #[test]
    fn test_output_image_transition() {
        let (mut device, mut tracer) = setup(2);
        let mut cmd = CommandList::new();
        let output = tracer
            .output_image(1, Some(ResourceState::CopySource), &mut cmd)
            .unwrap();
        assert_eq!(output.state(), ResourceState::CopySource);
        assert_eq!(cmd.len(), 1);
        tracer.output_image(1, None, &mut cmd).unwrap();
        assert_eq!(cmd.len(), 1);
        device.execute(&cmd).unwrap();
    }
}
