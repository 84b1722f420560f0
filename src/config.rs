//! Runtime configuration for the hub.
//!
//! Loaded from a TOML file with `MODEL_HUB_*` environment overrides; every
//! field has a default so an absent file is not an error.

use std::path::Path;

use serde::Deserialize;

use crate::error::HubError;

/// Which execution backend workers should load pipelines on.
///
/// `Auto` consults the accelerator probe at worker startup and falls back
/// to CPU when no accelerated backend is available.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    #[default]
    Auto,
    Gpu,
    Cpu,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Backend preference applied to every worker startup.
    pub device: DevicePreference,
    /// Log file path; `None` keeps the built-in default.
    pub log_path: Option<String>,
}

impl HubConfig {
    /// Load from a TOML file, then apply environment overrides.
    /// A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, HubError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| HubError::Config(format!("failed to read {}: {e}", path.display())))?;
            toml::from_str(&raw)
                .map_err(|e| HubError::Config(format!("failed to parse {}: {e}", path.display())))?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(device) = std::env::var("MODEL_HUB_DEVICE") {
            match device.to_lowercase().as_str() {
                "auto" => self.device = DevicePreference::Auto,
                "gpu" => self.device = DevicePreference::Gpu,
                "cpu" => self.device = DevicePreference::Cpu,
                other => {
                    crate::log_warn!("ignoring unknown MODEL_HUB_DEVICE value: {other}");
                }
            }
        }
        if let Ok(path) = std::env::var("MODEL_HUB_LOG") {
            self.log_path = Some(path);
        }
    }
}
