mod loader;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub use loader::load_config;

/// Upper bound on frames in flight; output images and shader tables are
/// allocated once per frame.
pub const MAX_FRAMES_IN_FLIGHT: u32 = 3;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub viewport: ViewportConfig,
    pub scene: SceneConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub frames: FrameConfig,
    #[serde(default)]
    pub shaders: ShaderConfig,
}

/// Output image extent
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ViewportConfig {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
        }
    }
}

/// Imported model placement and animation
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SceneConfig {
    /// Wavefront OBJ file for the model slot
    pub mesh_path: PathBuf,
    #[serde(default)]
    pub position: [f32; 3],
    #[serde(default = "default_scale")]
    pub scale: f32,
    /// Rotation about +Y applied every frame, in degrees
    #[serde(default = "default_rotation_step")]
    pub rotation_step_degrees: f32,
}

fn default_scale() -> f32 {
    1.0
}

fn default_rotation_step() -> f32 {
    0.1
}

impl SceneConfig {
    /// Position in xyz, uniform scale in w.
    pub fn pos_scale(&self) -> glam::Vec4 {
        glam::Vec3::from(self.position).extend(self.scale)
    }
}

/// Fixed camera used by the binary to drive per-frame updates
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CameraConfig {
    #[serde(default = "default_eye")]
    pub eye: [f32; 3],
    #[serde(default = "default_target")]
    pub target: [f32; 3],
    #[serde(default = "default_fov")]
    pub fov_degrees: f32,
    #[serde(default = "default_near")]
    pub near: f32,
    #[serde(default = "default_far")]
    pub far: f32,
}

fn default_eye() -> [f32; 3] {
    [0.0, 3.0, -10.0]
}

fn default_target() -> [f32; 3] {
    [0.0, 1.0, 0.0]
}

fn default_fov() -> f32 {
    45.0
}

fn default_near() -> f32 {
    0.1
}

fn default_far() -> f32 {
    100.0
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            eye: default_eye(),
            target: default_target(),
            fov_degrees: default_fov(),
            near: default_near(),
            far: default_far(),
        }
    }
}

impl CameraConfig {
    pub fn eye(&self) -> glam::Vec3 {
        glam::Vec3::from(self.eye)
    }

    /// Left-handed view-projection, +Y up.
    pub fn view_proj(&self, aspect: f32) -> glam::Mat4 {
        let view = glam::Mat4::look_at_lh(self.eye(), self.target.into(), glam::Vec3::Y);
        let proj =
            glam::Mat4::perspective_lh(self.fov_degrees.to_radians(), aspect, self.near, self.far);
        proj * view
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FrameConfig {
    #[serde(default = "default_frames_in_flight")]
    pub frames_in_flight: u32,
}

fn default_frames_in_flight() -> u32 {
    MAX_FRAMES_IN_FLIGHT
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: default_frames_in_flight(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShaderConfig {
    /// Compiled library exporting the ray-generation, closest-hit and miss entry points
    #[serde(default = "default_library_path")]
    pub library_path: PathBuf,
}

fn default_library_path() -> PathBuf {
    PathBuf::from("shaders/ray_traced_test.spv")
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            library_path: default_library_path(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        load_config(path)
    }

    /// Default configuration for a model file, used when no config file is given
    pub fn for_mesh<P: Into<PathBuf>>(mesh_path: P) -> Self {
        Self {
            viewport: ViewportConfig::default(),
            scene: SceneConfig {
                mesh_path: mesh_path.into(),
                position: [0.0; 3],
                scale: default_scale(),
                rotation_step_degrees: default_rotation_step(),
            },
            camera: CameraConfig::default(),
            frames: FrameConfig::default(),
            shaders: ShaderConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.viewport.width == 0 || self.viewport.height == 0 {
            return Err(ConfigError::Validation(format!(
                "viewport must be non-empty, got {}x{}",
                self.viewport.width, self.viewport.height
            )));
        }
        let frames = self.frames.frames_in_flight;
        if !(1..=MAX_FRAMES_IN_FLIGHT).contains(&frames) {
            return Err(ConfigError::Validation(format!(
                "frames_in_flight must be in 1..={MAX_FRAMES_IN_FLIGHT}, got {frames}"
            )));
        }
        if !(self.scene.scale > 0.0) {
            return Err(ConfigError::Validation(format!(
                "scene scale must be positive, got {}",
                self.scene.scale
            )));
        }
        if !self.scene.rotation_step_degrees.is_finite() {
            return Err(ConfigError::Validation(
                "rotation_step_degrees must be finite".to_string(),
            ));
        }
        if !(self.camera.near > 0.0 && self.camera.far > self.camera.near) {
            return Err(ConfigError::Validation(format!(
                "camera clip range must satisfy 0 < near < far, got {}..{}",
                self.camera.near, self.camera.far
            )));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_mesh_defaults_validate() {
        let config = AppConfig::for_mesh("assets/bunny.obj");
        assert!(config.validate().is_ok());
        assert_eq!(config.frames.frames_in_flight, 3);
        assert_eq!(config.viewport.width, 1280);
        assert_eq!(config.scene.pos_scale().w, 1.0);
    }

    #[test]
    fn test_validate_rejects_empty_viewport() {
        let mut config = AppConfig::for_mesh("m.obj");
        config.viewport.height = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("0"));
    }

    #[test]
    fn test_validate_rejects_frames_out_of_range() {
        let mut config = AppConfig::for_mesh("m.obj");
        config.frames.frames_in_flight = 0;
        assert!(config.validate().is_err());
        config.frames.frames_in_flight = 4;
        assert!(config.validate().is_err());
        config.frames.frames_in_flight = 2;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_scale_and_clip() {
        let mut config = AppConfig::for_mesh("m.obj");
        config.scene.scale = 0.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::for_mesh("m.obj");
        config.camera.near = 10.0;
        config.camera.far = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pos_scale_packs_position_and_scale() {
        let mut config = AppConfig::for_mesh("m.obj");
        config.scene.position = [1.0, 2.0, 3.0];
        config.scene.scale = 0.5;
        assert_eq!(
            config.scene.pos_scale(),
            glam::Vec4::new(1.0, 2.0, 3.0, 0.5)
        );
    }

    #[test]
    fn test_view_proj_is_invertible() {
        let camera = CameraConfig::default();
        let vp = camera.view_proj(16.0 / 9.0);
        assert!(vp.determinant().abs() > 1e-6);
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::NotFound("test.yaml".to_string());
        assert!(err.to_string().contains("test.yaml"));

        let err = ConfigError::Parse(serde_yaml::from_str::<AppConfig>("invalid").unwrap_err());
        assert!(err.to_string().contains("parse"));
    }
}
