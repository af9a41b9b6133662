use std::path::Path;

use super::{AppConfig, ConfigError};

/// Load and validate configuration from a YAML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AppConfig, ConfigError> {
    let path = path.as_ref();

    if !path.exists() {
        return Err(ConfigError::NotFound(path.display().to_string()));
    }

    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = serde_yaml::from_str(&content)?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_config() {
        let result = load_config("/nonexistent/config.yaml");
        assert!(matches!(result.unwrap_err(), ConfigError::NotFound(_)));
    }

    #[test]
    fn test_load_config_invalid_yaml() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let temp_file = temp_dir.path().join("invalid.yaml");
        std::fs::write(&temp_file, "scene: [").unwrap();

        let result = load_config(&temp_file);
        assert!(matches!(result.unwrap_err(), ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_config_valid() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let temp_file = temp_dir.path().join("config.yaml");

        let config_content = r#"
viewport:
  width: 1920
  height: 1080

scene:
  mesh_path: "assets/bunny.obj"
  position: [0.0, 1.0, 0.0]
  scale: 2.5
  rotation_step_degrees: 0.5

camera:
  eye: [0.0, 4.0, -12.0]
  fov_degrees: 60.0

frames:
  frames_in_flight: 2

shaders:
  library_path: "out/lib.spv"
"#;
        std::fs::write(&temp_file, config_content).unwrap();

        let config = load_config(&temp_file).unwrap();
        assert_eq!(config.viewport.width, 1920);
        assert_eq!(config.viewport.height, 1080);
        assert_eq!(config.scene.scale, 2.5);
        assert_eq!(config.scene.rotation_step_degrees, 0.5);
        assert_eq!(config.camera.eye, [0.0, 4.0, -12.0]);
        assert_eq!(config.camera.target, [0.0, 1.0, 0.0]);
        assert_eq!(config.frames.frames_in_flight, 2);
        assert_eq!(config.shaders.library_path.to_str(), Some("out/lib.spv"));
    }

    #[test]
    fn test_load_config_minimal() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let temp_file = temp_dir.path().join("minimal.yaml");
        std::fs::write(&temp_file, "scene:\n  mesh_path: model.obj\n").unwrap();

        let config = load_config(&temp_file).unwrap();
        assert_eq!(config.viewport.width, 1280);
        assert_eq!(config.viewport.height, 720);
        assert_eq!(config.scene.scale, 1.0);
        assert_eq!(config.scene.rotation_step_degrees, 0.1);
        assert_eq!(config.frames.frames_in_flight, 3);
    }

    #[test]
    fn test_load_config_fails_validation() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let temp_file = temp_dir.path().join("bad.yaml");
        std::fs::write(
            &temp_file,
            "scene:\n  mesh_path: model.obj\nframes:\n  frames_in_flight: 9\n",
        )
        .unwrap();

        let result = load_config(&temp_file);
        assert!(matches!(result.unwrap_err(), ConfigError::Validation(_)));
    }

    #[test]
    fn test_config_from_file() {
        let result = AppConfig::from_file("/nonexistent/path.yaml");
        assert!(result.is_err());
    }
}
