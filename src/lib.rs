//! rt-refit: hardware ray tracer with per-frame TLAS refit
//!
//! Features:
//! - Bottom-level structures built once per mesh slot (ground cube, imported model)
//! - One top-level structure refit in place every frame from an instance ring
//! - Per-frame ray-generation and hit-group shader tables
//! - A backend seam with a Vulkan implementation and a headless null device

pub mod accel;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod geometry;
pub mod gpu;
pub mod mesh;
pub mod output;
pub mod pipeline;
pub mod raytracer;
pub mod scene;
pub mod shader_table;
pub mod vk;

pub use config::AppConfig;
pub use error::{DeviceError, RayTracerError, Result};
pub use gpu::null::NullDevice;
pub use gpu::{CommandList, RtDevice};
pub use raytracer::RayTracer;
