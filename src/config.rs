//! Configuration for Context Warden
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration. Loaded from TOML:
//!
//! ```toml
//! utilization_fraction = 0.75
//! checkpoint_path = "/tmp/warden/checkpoint.json"
//!
//! [detection]
//! timeout_ms = 3000
//! endpoints = { ollama = "http://localhost:11434" }
//!
//! [thresholds]
//! working_memory_capacity = 40
//! ```

use crate::optimizer::OptimizerConfig;
use crate::profile::{ProfileOverrides, WindowProfile};
use crate::window::{DetectionConfig, ZoneThresholds, DEFAULT_UTILIZATION_FRACTION};
use crate::{Result, WardenError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    /// Known window size; skips detection when set
    pub window_size: Option<usize>,

    /// Share of the window this subsystem may use, in (0, 1]
    pub utilization_fraction: f64,

    pub detection: DetectionConfig,

    pub zones: ZoneThresholds,

    /// Full replacement for the built-in profile table
    pub profiles: Option<Vec<WindowProfile>>,

    /// Select a profile by name regardless of window size
    pub profile_override: Option<String>,

    /// Per-field overrides applied to the selected profile
    pub thresholds: ProfileOverrides,

    /// Default checkpoint location
    pub checkpoint_path: Option<PathBuf>,

    /// Directory for the external content store; none disables it
    pub artifact_store_dir: Option<PathBuf>,

    pub optimizer: OptimizerConfig,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            window_size: None,
            utilization_fraction: DEFAULT_UTILIZATION_FRACTION,
            detection: DetectionConfig::default(),
            zones: ZoneThresholds::default(),
            profiles: None,
            profile_override: None,
            thresholds: ProfileOverrides::default(),
            checkpoint_path: None,
            artifact_store_dir: None,
            optimizer: OptimizerConfig::default(),
        }
    }
}

impl WardenConfig {
    /// Load from a TOML file
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config = Self::from_toml_str(&content)?;
        debug!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise fall back to defaults
    pub async fn load_or_default(path: &Path) -> Result<Self> {
        if tokio::fs::try_exists(path).await? {
            Self::load(path).await
        } else {
            debug!("No configuration at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(self.utilization_fraction > 0.0 && self.utilization_fraction <= 1.0) {
            return Err(WardenError::Config(format!(
                "utilization_fraction must be in (0, 1], got {}",
                self.utilization_fraction
            )));
        }
        if self.window_size == Some(0) {
            return Err(WardenError::Config("window_size must be positive".to_string()));
        }
        if self.optimizer.techniques.is_empty() {
            debug!("Optimizer has no techniques enabled");
        }
        Ok(())
    }

    /// `<config dir>/context-warden/config.toml`
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("context-warden").join("config.toml"))
    }

    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = Some(window_size);
        self
    }

    pub fn with_utilization_fraction(mut self, fraction: f64) -> Self {
        self.utilization_fraction = fraction;
        self
    }

    pub fn with_profile_override(mut self, name: impl Into<String>) -> Self {
        self.profile_override = Some(name.into());
        self
    }

    pub fn with_thresholds(mut self, thresholds: ProfileOverrides) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_profiles(mut self, profiles: Vec<WindowProfile>) -> Self {
        self.profiles = Some(profiles);
        self
    }

    pub fn with_checkpoint_path(mut self, path: PathBuf) -> Self {
        self.checkpoint_path = Some(path);
        self
    }

    pub fn with_artifact_store_dir(mut self, dir: PathBuf) -> Self {
        self.artifact_store_dir = Some(dir);
        self
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerConfig) -> Self {
        self.optimizer = optimizer;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::Technique;
    use crate::profile::CheckpointInterval;
    use tempfile::TempDir;

    #[test]
    fn test_empty_config_is_default() {
        let config = WardenConfig::from_toml_str("").unwrap();
        assert_eq!(config, WardenConfig::default());
        assert_eq!(config.utilization_fraction, 0.75);
    }

    #[test]
    fn test_parse_full_config() {
        let config = WardenConfig::from_toml_str(
            r#"
            window_size = 200000
            utilization_fraction = 0.6
            profile_override = "balanced"
            checkpoint_path = "/tmp/warden.json"

            [detection]
            timeout_ms = 1500
            configured_window = 32000
            endpoints = { ollama = "http://localhost:11434" }
            known_windows = [{ model = "my-model-*", tokens = 65536 }]

            [zones]
            yellow = 0.4

            [thresholds]
            working_memory_capacity = 40
            checkpoint_interval = { operations = 15 }

            [optimizer]
            external_storage_threshold_tokens = 4000
            techniques = ["pruning", "summarization"]
            "#,
        )
        .unwrap();

        assert_eq!(config.window_size, Some(200_000));
        assert_eq!(config.profile_override.as_deref(), Some("balanced"));
        assert_eq!(config.detection.timeout_ms, 1_500);
        assert_eq!(config.detection.configured_window, Some(32_000));
        assert_eq!(config.detection.known_windows[0].tokens, 65_536);
        assert_eq!(config.zones.yellow, 0.4);
        assert_eq!(config.zones.red, 0.85);
        assert_eq!(config.thresholds.working_memory_capacity, Some(40));
        assert_eq!(
            config.thresholds.checkpoint_interval,
            Some(CheckpointInterval::Operations(15))
        );
        assert_eq!(
            config.optimizer.techniques,
            vec![Technique::Pruning, Technique::Summarization]
        );
        assert_eq!(config.optimizer.min_summary_tokens, 128);
    }

    #[test]
    fn test_invalid_fraction_rejected() {
        let err = WardenConfig::from_toml_str("utilization_fraction = 1.5").unwrap_err();
        assert!(matches!(err, WardenError::Config(_)));
        assert!(WardenConfig::from_toml_str("utilization_fraction = \"high\"").is_err());
    }

    #[tokio::test]
    async fn test_load_or_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        assert_eq!(
            WardenConfig::load_or_default(&path).await.unwrap(),
            WardenConfig::default()
        );

        std::fs::write(&path, "window_size = 8192\n").unwrap();
        let config = WardenConfig::load_or_default(&path).await.unwrap();
        assert_eq!(config.window_size, Some(8_192));
    }

    #[test]
    fn test_builders() {
        let config = WardenConfig::default()
            .with_window_size(128_000)
            .with_profile_override("relaxed")
            .with_utilization_fraction(0.5);
        assert_eq!(config.window_size, Some(128_000));
        assert_eq!(config.profile_override.as_deref(), Some("relaxed"));
        assert_eq!(config.utilization_fraction, 0.5);
    }
}
