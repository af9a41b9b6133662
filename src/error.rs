use std::path::PathBuf;

use crate::config::ConfigError;
use crate::gpu::DescriptorPoolKind;
use crate::mesh::MeshError;

/// Failures reported by a GPU backend.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("out of device memory allocating {size} bytes for {name}")]
    OutOfMemory { name: String, size: u64 },

    #[error("invalid {kind} handle {index}")]
    InvalidHandle { kind: &'static str, index: u32 },

    #[error("write of {len} bytes at offset {offset} overflows buffer of {size} bytes")]
    WriteOutOfBounds { offset: u64, len: usize, size: u64 },

    #[error("pipeline creation failed: {0}")]
    InvalidPipeline(String),

    #[error("no shader identifier exported under {0:?}")]
    UnknownExport(String),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("Vulkan call failed: {0}")]
    Vulkan(#[from] ash::vk::Result),
}

/// Failures of the ray tracer core. Every variant is fatal to the calling
/// sequence; nothing is retried.
#[derive(Debug, thiserror::Error)]
pub enum RayTracerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to import mesh: {0}")]
    Mesh(#[from] MeshError),

    #[error("failed to load shader library {path}: {source}")]
    ShaderLibrary {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("shader table {name} is full ({capacity} records)")]
    ShaderTableFull { name: String, capacity: u32 },

    #[error("shader record of {size} bytes does not fit stride {stride} of table {name}")]
    ShaderRecordTooLarge { name: String, size: usize, stride: u64 },

    #[error("descriptor pool {pool:?} exhausted: {requested} requested, {available} available")]
    DescriptorPoolExhausted {
        pool: DescriptorPoolKind,
        requested: u32,
        available: u32,
    },

    #[error("bottom-level acceleration structure {0} holds static geometry and is already built")]
    BlasAlreadyBuilt(String),

    #[error("top-level acceleration structure refit requested before its first build")]
    RefitBeforeBuild,

    #[error("frame index {index} out of range ({count} frames in flight)")]
    FrameIndex { index: u32, count: u32 },

    #[error("frame {frame} rendered without advancing its transforms first")]
    FrameNotAdvanced { frame: u32 },
}

pub type Result<T, E = RayTracerError> = std::result::Result<T, E>;
