use std::path::Path;

use glam::{Mat4, Vec3};
use tempfile::TempDir;

use rt_refit::accel::InstanceRecord;
use rt_refit::error::DeviceError;
use rt_refit::geometry::StagingBuffers;
use rt_refit::gpu::{ImageFormat, ResourceState};
use rt_refit::mesh::MeshSlot;
use rt_refit::scene::SceneState;
use rt_refit::{AppConfig, CommandList, NullDevice, RayTracer, RayTracerError};

const TETRAHEDRON_OBJ: &str = "\
o tetra
v 0.0 0.0 0.0
v 1.0 0.0 0.0
v 0.0 1.0 0.0
v 0.0 0.0 1.0
f 1 3 2
f 1 2 4
f 1 4 3
f 2 3 4
";

/// Writes a model and a shader library next to each other and returns a
/// config pointing at them.
fn write_assets(dir: &Path) -> AppConfig {
    let mesh_path = dir.join("tetra.obj");
    std::fs::write(&mesh_path, TETRAHEDRON_OBJ).unwrap();
    let library_path = dir.join("lib.spv");
    std::fs::write(&library_path, [0x03, 0x02, 0x23, 0x07, 0, 0, 1, 0]).unwrap();

    let mut config = AppConfig::for_mesh(mesh_path);
    config.shaders.library_path = library_path;
    config.scene.position = [0.0, 1.0, 0.0];
    config.scene.scale = 2.0;
    config
}

fn initialize(config: &AppConfig) -> (NullDevice, RayTracer) {
    let mut device = NullDevice::new();
    let mut cmd = CommandList::new();
    let mut staging = StagingBuffers::new();
    let tracer = RayTracer::initialize(&mut device, &mut cmd, &mut staging, config).unwrap();
    device.execute(&cmd).unwrap();
    staging.release(&mut device);
    (device, tracer)
}

fn camera(config: &AppConfig) -> (Vec3, Mat4) {
    let aspect = config.viewport.width as f32 / config.viewport.height as f32;
    (config.camera.eye(), config.camera.view_proj(aspect))
}

fn hit_group_rotation(device: &NullDevice, tracer: &RayTracer, frame: u32) -> Mat4 {
    let table = tracer.hit_group_table(frame).unwrap();
    let contents = device.buffer_contents(table.buffer()).unwrap();
    let id_size = tracer.pipeline().identifier_size() as usize;
    let payload: [f32; 16] = bytemuck::pod_read_unaligned(&contents[id_size..id_size + 64]);
    Mat4::from_cols_array(&payload).transpose()
}

fn instance_block(device: &NullDevice, tracer: &RayTracer, frame: u32) -> Vec<InstanceRecord> {
    let contents = device
        .buffer_contents(tracer.tlas().instance_buffer())
        .unwrap();
    let block = 2 * InstanceRecord::SIZE as usize;
    contents[frame as usize * block..(frame as usize + 1) * block]
        .chunks_exact(InstanceRecord::SIZE as usize)
        .map(bytemuck::pod_read_unaligned)
        .collect()
}

#[test]
fn test_output_image_readable_after_initialize() {
    let dir = TempDir::new().unwrap();
    let mut config = write_assets(dir.path());
    config.viewport.width = 1920;
    config.viewport.height = 1080;
    let (mut device, mut tracer) = initialize(&config);

    let model = tracer.geometry().slot(MeshSlot::Model);
    assert_eq!(model.vertex_count, 4);
    assert_eq!(model.index_count, 12);
    assert_eq!(tracer.geometry().slot(MeshSlot::Ground).index_count, 36);

    let mut cmd = CommandList::new();
    let output = tracer
        .output_image(0, Some(ResourceState::ShaderResource), &mut cmd)
        .unwrap();
    assert_eq!((output.width(), output.height()), (1920, 1080));
    assert_eq!(output.format(), ImageFormat::Rgba8Unorm);
    let image = output.image();
    device.execute(&cmd).unwrap();

    let tracked = device.image(image).unwrap();
    assert_eq!(tracked.state, ResourceState::ShaderResource);
    assert_eq!((tracked.width, tracked.height), (1920, 1080));
    assert_eq!(device.stats().dispatches, 0);
}

#[test]
fn test_120_frames_refit_with_cumulative_rotation() {
    let dir = TempDir::new().unwrap();
    let config = write_assets(dir.path());
    let (mut device, mut tracer) = initialize(&config);
    let (eye, view_proj) = camera(&config);
    let frames = tracer.frames_in_flight();
    let blas_address = tracer.blas(MeshSlot::Model).address();
    let step = config.scene.rotation_step_degrees.to_radians();

    let mut rotations: Vec<Mat4> = Vec::new();
    let mut cmd = CommandList::new();
    for n in 0..120u32 {
        let frame = n % frames;
        cmd.clear();
        tracer
            .advance_frame(&mut device, frame, eye, view_proj)
            .unwrap();
        tracer.render_frame(&mut device, frame, &mut cmd).unwrap();
        tracer
            .output_image(frame, Some(ResourceState::CopySource), &mut cmd)
            .unwrap();
        device.execute(&cmd).unwrap();

        let rotation = hit_group_rotation(&device, &tracer, frame);
        let expected = Mat4::from_rotation_y((n + 1) as f32 * step);
        assert!(rotation.abs_diff_eq(expected, 1e-4), "frame {n}");
        assert!(rotations.iter().all(|r| !r.abs_diff_eq(rotation, 1e-7)));
        rotations.push(rotation);

        assert_eq!(tracer.blas(MeshSlot::Model).address(), blas_address);
    }

    let stats = device.stats();
    assert_eq!(stats.full_builds, 3);
    assert_eq!(stats.refits, 120);
    assert_eq!(stats.dispatches, 120);
    assert_eq!(tracer.frames_rendered(), 120);
    assert!((tracer.angle() - 120.0 * step).abs() < 1e-4);
}

#[test]
fn test_raygen_table_holds_camera_of_last_advance() {
    let dir = TempDir::new().unwrap();
    let config = write_assets(dir.path());
    let (mut device, mut tracer) = initialize(&config);
    let id_size = tracer.pipeline().identifier_size() as usize;

    for frame in 0..tracer.frames_in_flight() {
        let eye = Vec3::new(frame as f32, 2.0, -8.0);
        let view_proj = Mat4::perspective_lh(1.0, 1.5, 0.1, 50.0)
            * Mat4::look_at_lh(eye, Vec3::ZERO, Vec3::Y);
        tracer
            .advance_frame(&mut device, frame, eye, view_proj)
            .unwrap();

        let table = tracer.raygen_table(frame).unwrap();
        assert_eq!(table.len(), 1);
        let contents = device.buffer_contents(table.buffer()).unwrap();
        let payload: [f32; 19] = bytemuck::pod_read_unaligned(&contents[id_size..id_size + 76]);
        let proj_to_world = Mat4::from_cols_slice(&payload[..16]);
        assert!(proj_to_world.abs_diff_eq(view_proj.inverse().transpose(), 1e-4));
        assert_eq!(&payload[16..], &eye.to_array());

        let mut cmd = CommandList::new();
        tracer.render_frame(&mut device, frame, &mut cmd).unwrap();
        device.execute(&cmd).unwrap();
    }
}

#[test]
fn test_instances_track_scene_per_frame() {
    let dir = TempDir::new().unwrap();
    let config = write_assets(dir.path());
    let (mut device, mut tracer) = initialize(&config);
    let (eye, view_proj) = camera(&config);
    let ground = rt_refit::accel::row_major_3x4(SceneState::ground_transform());

    let mut cmd = CommandList::new();
    for n in 0..7u32 {
        let frame = n % tracer.frames_in_flight();
        cmd.clear();
        tracer
            .advance_frame(&mut device, frame, eye, view_proj)
            .unwrap();
        tracer.render_frame(&mut device, frame, &mut cmd).unwrap();
        device.execute(&cmd).unwrap();

        let block = instance_block(&device, &tracer, frame);
        assert_eq!(block.len(), 2);
        assert_eq!(tracer.tlas().instance_count(), 2);
        assert_eq!(block[0].transform, ground);
        assert_eq!(
            block[1].transform,
            tracer.scene().instance_transforms()[MeshSlot::Model]
        );
        for (slot, record) in MeshSlot::ALL.iter().zip(&block) {
            assert_eq!(record.instance_id(), slot.index() as u32);
            assert_eq!(record.mask(), 0xFF);
            assert_eq!(record.contribution(), 0);
            assert_eq!(record.accel_address, tracer.blas(*slot).address());
        }
    }
}

#[test]
fn test_missing_mesh_fails_initialize() {
    let dir = TempDir::new().unwrap();
    let mut config = write_assets(dir.path());
    config.scene.mesh_path = dir.path().join("missing.obj");

    let mut device = NullDevice::new();
    let mut staging = StagingBuffers::new();
    let result = RayTracer::initialize(&mut device, &mut CommandList::new(), &mut staging, &config);
    assert!(matches!(result, Err(RayTracerError::Mesh(_))));
}

#[test]
fn test_missing_library_fails_initialize() {
    let dir = TempDir::new().unwrap();
    let mut config = write_assets(dir.path());
    config.shaders.library_path = dir.path().join("missing.spv");

    let mut device = NullDevice::new();
    let mut staging = StagingBuffers::new();
    let result = RayTracer::initialize(&mut device, &mut CommandList::new(), &mut staging, &config);
    assert!(matches!(result, Err(RayTracerError::ShaderLibrary { .. })));
}

/// Bytes allocated by a successful initialization before the first
/// allocation whose name ends with `suffix`.
fn budget_before(config: &AppConfig, suffix: &str) -> u64 {
    let mut device = NullDevice::new();
    let mut staging = StagingBuffers::new();
    RayTracer::initialize(&mut device, &mut CommandList::new(), &mut staging, config).unwrap();
    let allocations = device.allocations();
    let first = allocations
        .iter()
        .position(|(name, _)| name.ends_with(suffix))
        .unwrap();
    allocations[..first].iter().map(|(_, size)| size).sum()
}

fn out_of_memory_name(config: &AppConfig, budget: u64) -> String {
    let mut device = NullDevice::with_memory_budget(budget);
    let mut staging = StagingBuffers::new();
    match RayTracer::initialize(&mut device, &mut CommandList::new(), &mut staging, config) {
        Err(RayTracerError::Device(DeviceError::OutOfMemory { name, .. })) => name,
        other => panic!("expected an allocation failure, got {:?}", other.err()),
    }
}

#[test]
fn test_output_allocation_failure_fails_initialize() {
    let dir = TempDir::new().unwrap();
    let config = write_assets(dir.path());
    assert_eq!(out_of_memory_name(&config, 4096), "RayTracingOut0");
}

#[test]
fn test_blas_allocation_failure_fails_initialize() {
    let dir = TempDir::new().unwrap();
    let config = write_assets(dir.path());
    let budget = budget_before(&config, "BLAS");
    assert!(budget > 0);
    assert_eq!(out_of_memory_name(&config, budget), "GroundBLAS");
}

#[test]
fn test_scratch_allocation_failure_fails_initialize() {
    let dir = TempDir::new().unwrap();
    let config = write_assets(dir.path());
    let budget = budget_before(&config, "ScratchResource");
    assert!(budget > budget_before(&config, "BLAS"));
    assert_eq!(out_of_memory_name(&config, budget), "ScratchResource");
}
