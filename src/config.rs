//! Configuration management.
//!
//! Loaded from TOML. Every field has a default matching the LIBERO-Spatial
//! checkpoint, so an empty file (or no file) is a valid configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::action::{ACTION_DIM, NUM_ACTIONS_CHUNK};
use crate::error::ConfigError;

/// Default proprio width: eef position(3), axis-angle(3), gripper joints(2).
pub const PROPRIO_DIM: usize = 8;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub deploy: DeployConfig,
}

/// What the model expects and how its output is de-normalized. Fixed for the
/// lifetime of a running service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// 1 = primary camera only, 2 = primary + wrist camera.
    pub num_images_in_input: u8,
    /// Whether `proprio_state` is a required input.
    pub use_proprio: bool,
    /// Number of action steps returned per request.
    pub chunk_horizon: usize,
    pub action_dim: usize,
    pub proprio_dim: usize,
    pub checkpoint_id: String,
    /// Selects the de-normalization statistics.
    pub unnorm_key: String,
    /// Optional `dataset_statistics.json`; the built-in table is used otherwise.
    pub statistics_path: Option<PathBuf>,
    /// Expected image resolution `[height, width]`, unchecked when absent.
    pub image_size: Option<[usize; 2]>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            num_images_in_input: 2,
            use_proprio: false,
            chunk_horizon: NUM_ACTIONS_CHUNK,
            action_dim: ACTION_DIM,
            proprio_dim: PROPRIO_DIM,
            checkpoint_id: "moojink/openvla-7b-oft-finetuned-libero-spatial".to_string(),
            unnorm_key: "libero_spatial_no_noops".to_string(),
            statistics_path: None,
            image_size: None,
        }
    }
}

impl ServiceConfig {
    pub fn requires_wrist_image(&self) -> bool {
        self.num_images_in_input == 2
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.num_images_in_input, 1 | 2) {
            return Err(ConfigError::Invalid(format!(
                "num_images_in_input must be 1 or 2, got {}",
                self.num_images_in_input
            )));
        }
        if self.chunk_horizon == 0 {
            return Err(ConfigError::Invalid("chunk_horizon must be > 0".to_string()));
        }
        if self.action_dim == 0 {
            return Err(ConfigError::Invalid("action_dim must be > 0".to_string()));
        }
        if self.use_proprio && self.proprio_dim == 0 {
            return Err(ConfigError::Invalid(
                "proprio_dim must be > 0 when use_proprio is set".to_string(),
            ));
        }
        if self.checkpoint_id.trim().is_empty() {
            return Err(ConfigError::Invalid("checkpoint_id must not be empty".to_string()));
        }
        if self.unnorm_key.trim().is_empty() {
            return Err(ConfigError::Invalid("unnorm_key must not be empty".to_string()));
        }
        if let Some([h, w]) = self.image_size {
            if h == 0 || w == 0 {
                return Err(ConfigError::Invalid(format!(
                    "image_size must be positive, got {h}x{w}"
                )));
            }
        }
        Ok(())
    }
}

/// Network and persistence settings for the HTTP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    pub host: String,
    pub port: u16,
    /// Records every served chunk when set.
    pub journal_path: Option<PathBuf>,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            journal_path: None,
        }
    }
}

impl DeployConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.service.validate()?;
        if self.deploy.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn empty_file_yields_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.service.chunk_horizon, 8);
        assert!(config.service.requires_wrist_image());
        assert_eq!(config.deploy.bind_addr(), "0.0.0.0:8000");
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml_str(
            r#"
            [service]
            num_images_in_input = 1
            use_proprio = true
            image_size = [224, 224]

            [deploy]
            port = 9000
            "#,
        )
        .unwrap();
        assert!(!config.service.requires_wrist_image());
        assert!(config.service.use_proprio);
        assert_eq!(config.service.image_size, Some([224, 224]));
        assert_eq!(config.service.unnorm_key, "libero_spatial_no_noops");
        assert_eq!(config.deploy.port, 9000);
        assert_eq!(config.deploy.host, "0.0.0.0");
    }

    #[test]
    fn invalid_values_are_rejected() {
        for text in [
            "[service]\nnum_images_in_input = 3",
            "[service]\nchunk_horizon = 0",
            "[service]\nunnorm_key = ' '",
            "[deploy]\nhost = ''",
        ] {
            assert!(
                matches!(Config::from_toml_str(text), Err(ConfigError::Invalid(_))),
                "accepted: {text}"
            );
        }
        assert!(matches!(
            Config::from_toml_str("[service]\nchunk_horizon = 'eight'"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn round_trips_through_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vla.toml");
        let mut config = Config::default();
        config.service.chunk_horizon = 4;
        config.deploy.journal_path = Some(dir.path().join("journal"));
        std::fs::write(&path, config.to_toml().unwrap()).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
