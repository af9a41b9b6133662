//! Bottom- and top-level acceleration structures.

use glam::Mat4;

use crate::error::{RayTracerError, Result};
use crate::gpu::{
    AccelBuild, AccelBuildInputs, AccelHandle, AccelLevel, AccelSizes, BufferDesc, BufferHandle,
    BufferUsage, BuildFlags, BuildMode, Command, CommandList, GeometryDesc, RtDevice,
};
use crate::mesh::{MeshSlot, SlotArray};

/// Instance mask that makes an instance visible to every ray.
pub const INSTANCE_MASK_ALL: u8 = 0xFF;

/// One TLAS instance, laid out as the device consumes it.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct InstanceRecord {
    /// Row-major 3x4 object-to-world transform
    pub transform: [f32; 12],
    /// Low 24 bits: instance id. High 8 bits: mask.
    pub instance_id_and_mask: u32,
    /// Low 24 bits: hit-group record offset. High 8 bits: instance flags.
    pub contribution_and_flags: u32,
    pub accel_address: u64,
}

impl InstanceRecord {
    pub const SIZE: u64 = std::mem::size_of::<InstanceRecord>() as u64;

    pub fn new(
        transform: [f32; 12],
        instance_id: u32,
        mask: u8,
        contribution: u32,
        accel_address: u64,
    ) -> Self {
        debug_assert!(instance_id < 1 << 24);
        debug_assert!(contribution < 1 << 24);
        Self {
            transform,
            instance_id_and_mask: (instance_id & 0x00FF_FFFF) | (mask as u32) << 24,
            contribution_and_flags: contribution & 0x00FF_FFFF,
            accel_address,
        }
    }

    pub fn instance_id(&self) -> u32 {
        self.instance_id_and_mask & 0x00FF_FFFF
    }

    pub fn mask(&self) -> u8 {
        (self.instance_id_and_mask >> 24) as u8
    }

    pub fn contribution(&self) -> u32 {
        self.contribution_and_flags & 0x00FF_FFFF
    }
}

/// Row-major 3x4 matrix from a column-vector world transform: the first three
/// rows of the matrix, i.e. the first three columns of its transpose.
pub fn row_major_3x4(world: Mat4) -> [f32; 12] {
    let cols = world.transpose().to_cols_array();
    let mut rows = [0.0; 12];
    rows.copy_from_slice(&cols[..12]);
    rows
}

/// Scratch memory time-shared by every acceleration-structure build.
#[derive(Debug, Clone, Copy)]
pub struct ScratchBuffer {
    buffer: BufferHandle,
    size: u64,
}

impl ScratchBuffer {
    /// Sized to the largest build or refit requirement among `sizes`.
    pub fn allocate<D: RtDevice>(device: &mut D, sizes: &[AccelSizes]) -> Result<Self> {
        let size = sizes.iter().map(AccelSizes::scratch_max).max().unwrap_or(0);
        let buffer = device.create_buffer(&BufferDesc {
            size,
            usage: BufferUsage::Scratch,
            name: "ScratchResource",
        })?;
        log::debug!("Scratch buffer: {size} bytes");
        Ok(Self { buffer, size })
    }

    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Structure over one mesh slot's static geometry. Built exactly once.
#[derive(Debug)]
pub struct BottomLevelAs {
    name: String,
    handle: AccelHandle,
    geometry: GeometryDesc,
    sizes: AccelSizes,
    descriptor: u32,
    address: u64,
    built: bool,
}

impl BottomLevelAs {
    /// Queries sizes and allocates result storage. Nothing is recorded yet.
    pub fn prebuild<D: RtDevice>(
        device: &mut D,
        geometry: GeometryDesc,
        descriptor: u32,
        name: &str,
    ) -> Result<Self> {
        let sizes =
            device.accel_prebuild(&AccelBuildInputs::Bottom(geometry), BuildFlags::FAST_TRACE)?;
        let handle = device.create_accel(AccelLevel::Bottom, sizes.result_size, name)?;
        let address = device.accel_address(handle)?;
        log::debug!(
            "{name}: {} triangles, result {} bytes, scratch {} bytes",
            geometry.triangle_count(),
            sizes.result_size,
            sizes.build_scratch_size
        );
        Ok(Self {
            name: name.to_string(),
            handle,
            geometry,
            sizes,
            descriptor,
            address,
            built: false,
        })
    }

    pub fn build(&mut self, cmd: &mut CommandList, scratch: &ScratchBuffer) -> Result<()> {
        if self.built {
            return Err(RayTracerError::BlasAlreadyBuilt(self.name.clone()));
        }
        cmd.push(Command::BuildAccel(AccelBuild {
            dst: self.handle,
            inputs: AccelBuildInputs::Bottom(self.geometry),
            flags: BuildFlags::FAST_TRACE,
            mode: BuildMode::Build,
            scratch: scratch.buffer(),
            descriptor: self.descriptor,
        }));
        // The scratch buffer is reused by the next build
        cmd.push(Command::AccelBarrier { accel: self.handle });
        self.built = true;
        Ok(())
    }

    pub fn handle(&self) -> AccelHandle {
        self.handle
    }

    pub fn sizes(&self) -> AccelSizes {
        self.sizes
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn descriptor(&self) -> u32 {
        self.descriptor
    }

    pub fn is_built(&self) -> bool {
        self.built
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccelConfig {
    pub frames_in_flight: u32,
}

/// Structure instancing every mesh slot. Refit in place each frame.
///
/// Owns a ring of instance blocks, one per frame in flight; frame `i`
/// always writes and builds from block `i`.
#[derive(Debug)]
pub struct TopLevelAs {
    handle: AccelHandle,
    flags: BuildFlags,
    sizes: AccelSizes,
    descriptor: u32,
    instances: BufferHandle,
    frames_in_flight: u32,
    written: Vec<Option<SlotArray<InstanceRecord>>>,
    built: bool,
}

impl TopLevelAs {
    const INSTANCE_COUNT: u32 = MeshSlot::COUNT as u32;
    const BLOCK_SIZE: u64 = Self::INSTANCE_COUNT as u64 * InstanceRecord::SIZE;

    pub fn prebuild<D: RtDevice>(
        device: &mut D,
        config: &AccelConfig,
        flags: BuildFlags,
        descriptor: u32,
    ) -> Result<Self> {
        let frames_in_flight = config.frames_in_flight;
        let instances = device.create_buffer(&BufferDesc {
            size: frames_in_flight as u64 * Self::BLOCK_SIZE,
            usage: BufferUsage::Instances,
            name: "InstanceDescs",
        })?;
        let inputs = AccelBuildInputs::Top {
            instances,
            offset: 0,
            count: Self::INSTANCE_COUNT,
        };
        let sizes = device.accel_prebuild(&inputs, flags)?;
        let handle = device.create_accel(AccelLevel::Top, sizes.result_size, "TopLevelAS")?;
        log::debug!(
            "TopLevelAS: {} instances, result {} bytes, scratch {}/{} bytes (build/update)",
            Self::INSTANCE_COUNT,
            sizes.result_size,
            sizes.build_scratch_size,
            sizes.update_scratch_size
        );
        Ok(Self {
            handle,
            flags,
            sizes,
            descriptor,
            instances,
            frames_in_flight,
            written: vec![None; frames_in_flight as usize],
            built: false,
        })
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

    /// Writes the instance block of `frame`. Instance `i` is mesh slot `i`.
    pub fn set_instances<D: RtDevice>(
        &mut self,
        device: &mut D,
        frame: u32,
        blas: &SlotArray<BottomLevelAs>,
        transforms: &SlotArray<[f32; 12]>,
    ) -> Result<()> {
        self.check_frame(frame)?;
        let records = SlotArray::from_fn(|slot| {
            InstanceRecord::new(
                transforms[slot],
                slot.index() as u32,
                INSTANCE_MASK_ALL,
                0,
                blas[slot].address(),
            )
        });
        device.write_buffer(
            self.instances,
            frame as u64 * Self::BLOCK_SIZE,
            bytemuck::cast_slice(records.as_slice()),
        )?;
        self.written[frame as usize] = Some(records);
        Ok(())
    }

    /// Records a full build, or a refit when `update` is set.
    pub fn build(
        &mut self,
        cmd: &mut CommandList,
        scratch: &ScratchBuffer,
        frame: u32,
        update: bool,
    ) -> Result<()> {
        self.check_frame(frame)?;
        let mode = if update {
            if !self.built {
                return Err(RayTracerError::RefitBeforeBuild);
            }
            BuildMode::Update
        } else {
            BuildMode::Build
        };
        if mode == BuildMode::Update {
            // Earlier frames may still be tracing against this structure
            cmd.push(Command::RefitBarrier { accel: self.handle });
        }
        cmd.push(Command::BuildAccel(AccelBuild {
            dst: self.handle,
            inputs: AccelBuildInputs::Top {
                instances: self.instances,
                offset: frame as u64 * Self::BLOCK_SIZE,
                count: Self::INSTANCE_COUNT,
            },
            flags: self.flags,
            mode,
            scratch: scratch.buffer(),
            descriptor: self.descriptor,
        }));
        cmd.push(Command::AccelBarrier { accel: self.handle });
        self.built = true;
        log::trace!("TopLevelAS {mode:?} from instance block {frame}");
        Ok(())
    }

    pub fn handle(&self) -> AccelHandle {
        self.handle
    }

    pub fn sizes(&self) -> AccelSizes {
        self.sizes
    }

    pub fn descriptor(&self) -> u32 {
        self.descriptor
    }

    pub fn instance_buffer(&self) -> BufferHandle {
        self.instances
    }

    pub fn instance_count(&self) -> u32 {
        Self::INSTANCE_COUNT
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    /// Last instances written for `frame`, if any.
    pub fn instances(&self, frame: u32) -> Option<&SlotArray<InstanceRecord>> {
        self.written.get(frame as usize).and_then(Option::as_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{GeometryBuffers, StagingBuffers};
    use crate::gpu::null::NullDevice;
    use crate::mesh::ground_cube;
    use glam::Vec3;

    const UPDATABLE: BuildFlags = BuildFlags {
        allow_update: true,
        prefer_fast_trace: true,
    };

    fn blas_pair(device: &mut NullDevice, cmd: &mut CommandList) -> SlotArray<BottomLevelAs> {
        let mut staging = StagingBuffers::new();
        let meshes = SlotArray::from_fn(|_| ground_cube());
        let geometry = GeometryBuffers::upload(device, cmd, &mut staging, &meshes).unwrap();
        SlotArray::try_from_fn(|slot| {
            BottomLevelAs::prebuild(
                device,
                geometry.slot(slot).geometry_desc(),
                3 + slot.index() as u32,
                slot.name(),
            )
        })
        .unwrap()
    }

    #[test]
    fn test_instance_record_layout() {
        assert_eq!(InstanceRecord::SIZE, 64);
        let record = InstanceRecord::new([0.0; 12], 1, 0xFF, 0, 0xDEAD_0000);
        assert_eq!(record.instance_id(), 1);
        assert_eq!(record.mask(), 0xFF);
        assert_eq!(record.contribution(), 0);
        assert_eq!(record.instance_id_and_mask, 0xFF00_0001);
    }

    #[test]
    fn test_row_major_3x4_translation() {
        let m = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let rows = row_major_3x4(m);
        assert_eq!(rows[3], 1.0);
        assert_eq!(rows[7], 2.0);
        assert_eq!(rows[11], 3.0);
        assert_eq!(rows[0], 1.0);
        assert_eq!(rows[5], 1.0);
        assert_eq!(rows[10], 1.0);
    }

    #[test]
    fn test_blas_builds_once() {
        let mut device = NullDevice::new();
        let mut cmd = CommandList::new();
        let mut blas = blas_pair(&mut device, &mut cmd);
        let scratch = ScratchBuffer::allocate(
            &mut device,
            &blas.as_slice().iter().map(|b| b.sizes()).collect::<Vec<_>>(),
        )
        .unwrap();

        blas[MeshSlot::Ground].build(&mut cmd, &scratch).unwrap();
        let err = blas[MeshSlot::Ground].build(&mut cmd, &scratch).unwrap_err();
        assert!(matches!(err, RayTracerError::BlasAlreadyBuilt(_)));

        blas[MeshSlot::Model].build(&mut cmd, &scratch).unwrap();
        device.execute(&cmd).unwrap();
        assert_eq!(device.stats().full_builds, 2);
    }

    #[test]
    fn test_blas_addresses_are_distinct_and_stable() {
        let mut device = NullDevice::new();
        let mut cmd = CommandList::new();
        let blas = blas_pair(&mut device, &mut cmd);
        let ground = blas[MeshSlot::Ground].address();
        assert_ne!(ground, blas[MeshSlot::Model].address());
        assert_eq!(
            device.accel_address(blas[MeshSlot::Ground].handle()).unwrap(),
            ground
        );
    }

    #[test]
    fn test_scratch_covers_largest_requirement() {
        let mut device = NullDevice::new();
        let sizes = [
            AccelSizes {
                result_size: 512,
                build_scratch_size: 256,
                update_scratch_size: 0,
            },
            AccelSizes {
                result_size: 512,
                build_scratch_size: 256,
                update_scratch_size: 768,
            },
        ];
        let scratch = ScratchBuffer::allocate(&mut device, &sizes).unwrap();
        assert_eq!(scratch.size(), 768);
    }

    #[test]
    fn test_tlas_refit_requires_build() {
        let mut device = NullDevice::new();
        let mut cmd = CommandList::new();
        let mut tlas = TopLevelAs::prebuild(
            &mut device,
            &AccelConfig {
                frames_in_flight: 2,
            },
            UPDATABLE,
            5,
        )
        .unwrap();
        let scratch = ScratchBuffer::allocate(&mut device, &[tlas.sizes()]).unwrap();
        assert!(matches!(
            tlas.build(&mut cmd, &scratch, 0, true),
            Err(RayTracerError::RefitBeforeBuild)
        ));
        tlas.build(&mut cmd, &scratch, 0, false).unwrap();
        tlas.build(&mut cmd, &scratch, 1, true).unwrap();
        assert!(matches!(
            tlas.build(&mut cmd, &scratch, 2, true),
            Err(RayTracerError::FrameIndex { index: 2, count: 2 })
        ));

        let modes: Vec<_> = cmd.accel_builds().map(|b| b.mode).collect();
        assert_eq!(modes, vec![BuildMode::Build, BuildMode::Update]);
        device.execute(&cmd).unwrap();
        assert_eq!(device.stats().refits, 1);
    }

    #[test]
    fn test_tlas_instance_blocks_per_frame() {
        let mut device = NullDevice::new();
        let mut cmd = CommandList::new();
        let blas = blas_pair(&mut device, &mut cmd);
        let mut tlas = TopLevelAs::prebuild(
            &mut device,
            &AccelConfig {
                frames_in_flight: 3,
            },
            UPDATABLE,
            5,
        )
        .unwrap();

        let transforms = SlotArray::from_fn(|slot| {
            row_major_3x4(Mat4::from_translation(Vec3::splat(slot.index() as f32)))
        });
        tlas.set_instances(&mut device, 2, &blas, &transforms).unwrap();
        assert!(tlas.instances(0).is_none());

        let contents = device.buffer_contents(tlas.instance_buffer()).unwrap();
        assert_eq!(contents.len(), 3 * 2 * 64);
        let block: Vec<InstanceRecord> = contents[256..384]
            .chunks_exact(64)
            .map(bytemuck::pod_read_unaligned)
            .collect();
        assert_eq!(block.len(), 2);
        assert_eq!(block[0].instance_id(), 0);
        assert_eq!(block[1].instance_id(), 1);
        assert_eq!(block[1].accel_address, blas[MeshSlot::Model].address());
        assert_eq!(block[1].transform[3], 1.0);
        assert_eq!(tlas.instances(2).unwrap().as_slice(), block.as_slice());
        assert_eq!(tlas.instance_count(), 2);
    }
}
