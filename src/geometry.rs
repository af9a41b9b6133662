use crate::error::Result;
use crate::gpu::{
    BufferDesc, BufferHandle, BufferUsage, Command, CommandList, GeometryDesc, IndexFormat,
    ResourceState, RtDevice, VertexFormat,
};
use crate::mesh::{MeshData, MeshSlot, SlotArray, Vertex};

/// Upload buffers that must outlive the command list recording the copies
/// out of them. Owned by the caller; release once that list has completed.
#[derive(Debug, Default)]
pub struct StagingBuffers {
    buffers: Vec<BufferHandle>,
}

impl StagingBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn release<D: RtDevice>(&mut self, device: &mut D) {
        for buffer in self.buffers.drain(..) {
            device.destroy_buffer(buffer);
        }
    }
}

/// Device-local vertex and index streams of one mesh slot.
#[derive(Debug, Clone, Copy)]
pub struct MeshBuffers {
    pub vertex_buffer: BufferHandle,
    pub vertex_count: u32,
    pub vertex_stride: u32,
    pub index_buffer: BufferHandle,
    pub index_count: u32,
}

impl MeshBuffers {
    pub fn geometry_desc(&self) -> GeometryDesc {
        GeometryDesc {
            vertex_buffer: self.vertex_buffer,
            vertex_count: self.vertex_count,
            vertex_stride: self.vertex_stride,
            vertex_format: VertexFormat::Float3,
            index_buffer: self.index_buffer,
            index_count: self.index_count,
            index_format: IndexFormat::U32,
            opaque: true,
        }
    }
}

/// Vertex/index memory of every mesh slot. Contents are immutable once uploaded.
#[derive(Debug)]
pub struct GeometryBuffers {
    slots: SlotArray<MeshBuffers>,
}

impl GeometryBuffers {
    pub fn upload<D: RtDevice>(
        device: &mut D,
        cmd: &mut CommandList,
        staging: &mut StagingBuffers,
        meshes: &SlotArray<MeshData>,
    ) -> Result<Self> {
        let slots = SlotArray::try_from_fn(|slot| {
            upload_mesh(device, cmd, staging, slot, &meshes[slot])
        })?;
        Ok(Self { slots })
    }

    pub fn slot(&self, slot: MeshSlot) -> &MeshBuffers {
        &self.slots[slot]
    }

    pub fn geometry_descs(&self) -> SlotArray<GeometryDesc> {
        self.slots.map(|_, buffers| buffers.geometry_desc())
    }
}

fn upload_mesh<D: RtDevice>(
    device: &mut D,
    cmd: &mut CommandList,
    staging: &mut StagingBuffers,
    slot: MeshSlot,
    mesh: &MeshData,
) -> Result<MeshBuffers> {
    mesh.validate()?;

    let vertex_buffer = upload_stream(
        device,
        cmd,
        staging,
        mesh.vertex_bytes(),
        BufferUsage::Vertex,
        &format!("{}VertexBuffer", slot.name()),
    )?;
    let index_buffer = upload_stream(
        device,
        cmd,
        staging,
        mesh.index_bytes(),
        BufferUsage::Index,
        &format!("{}IndexBuffer", slot.name()),
    )?;

    log::debug!(
        "{} geometry: {} vertices, {} indices",
        slot.name(),
        mesh.vertices.len(),
        mesh.indices.len()
    );

    Ok(MeshBuffers {
        vertex_buffer,
        vertex_count: mesh.vertices.len() as u32,
        vertex_stride: Vertex::STRIDE,
        index_buffer,
        index_count: mesh.indices.len() as u32,
    })
}

fn upload_stream<D: RtDevice>(
    device: &mut D,
    cmd: &mut CommandList,
    staging: &mut StagingBuffers,
    bytes: &[u8],
    usage: BufferUsage,
    name: &str,
) -> Result<BufferHandle> {
    let size = bytes.len() as u64;

    let upload = device.create_buffer(&BufferDesc {
        size,
        usage: BufferUsage::Staging,
        name: &format!("{name}Upload"),
    })?;
    staging.buffers.push(upload);
    device.write_buffer(upload, 0, bytes)?;

    let buffer = device.create_buffer(&BufferDesc { size, usage, name })?;
    cmd.push(Command::CopyBuffer {
        src: upload,
        dst: buffer,
        size,
    });
    cmd.push(Command::BufferBarrier {
        buffer,
        before: ResourceState::CopyDest,
        after: ResourceState::ShaderResource,
    });
    Ok(buffer)
}
