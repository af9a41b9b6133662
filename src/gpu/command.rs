use super::{
    AccelHandle, BufferHandle, BuildFlags, DescriptorTable, GeometryDesc, ImageHandle,
    LayoutHandle, PipelineHandle, ResourceState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelBuildInputs {
    Bottom(GeometryDesc),
    Top {
        instances: BufferHandle,
        /// Byte offset of the first instance record
        offset: u64,
        count: u32,
    },
}

impl AccelBuildInputs {
    pub fn primitive_count(&self) -> u32 {
        match self {
            AccelBuildInputs::Bottom(geometry) => geometry.triangle_count(),
            AccelBuildInputs::Top { count, .. } => *count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    /// Build from scratch
    Build,
    /// Refit the existing structure in place; topology must be unchanged
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccelBuild {
    pub dst: AccelHandle,
    pub inputs: AccelBuildInputs,
    pub flags: BuildFlags,
    pub mode: BuildMode,
    pub scratch: BufferHandle,
    /// Pool slot holding the structure's own UAV
    pub descriptor: u32,
}

/// Slice of a shader table buffer handed to a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableRegion {
    pub buffer: BufferHandle,
    pub offset: u64,
    pub stride: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootArgument {
    Table(DescriptorTable),
    Accel(AccelHandle),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRays {
    pub pipeline: PipelineHandle,
    pub global_layout: LayoutHandle,
    /// Global layout slot and the argument bound to it, in slot order
    pub arguments: Vec<(u32, RootArgument)>,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub raygen: TableRegion,
    pub hit_group: TableRegion,
    pub miss: TableRegion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    CopyBuffer {
        src: BufferHandle,
        dst: BufferHandle,
        size: u64,
    },
    BufferBarrier {
        buffer: BufferHandle,
        before: ResourceState,
        after: ResourceState,
    },
    ImageBarrier {
        image: ImageHandle,
        before: ResourceState,
        after: ResourceState,
    },
    BuildAccel(AccelBuild),
    /// Orders an acceleration-structure build before later builds and traces
    AccelBarrier { accel: AccelHandle },
    /// Orders earlier traces and builds that read `accel` or the shared
    /// scratch before an in-place refit of `accel`
    RefitBarrier { accel: AccelHandle },
    DispatchRays(DispatchRays),
}

/// Commands recorded by one producer for one submission.
#[derive(Debug, Clone, Default)]
pub struct CommandList {
    commands: Vec<Command>,
}

impl CommandList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }

    /// Acceleration-structure builds recorded so far, in order.
    pub fn accel_builds(&self) -> impl Iterator<Item = &AccelBuild> {
        self.commands.iter().filter_map(|c| match c {
            Command::BuildAccel(build) => Some(build),
            _ => None,
        })
    }

    pub fn dispatches(&self) -> impl Iterator<Item = &DispatchRays> {
        self.commands.iter().filter_map(|c| match c {
            Command::DispatchRays(dispatch) => Some(dispatch),
            _ => None,
        })
    }
}
