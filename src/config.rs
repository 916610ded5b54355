// ABOUTME: Configuration loading for clawlink.
// ABOUTME: Reads ~/.clawlink/config.toml; everything falls back to sensible defaults.

use std::path::PathBuf;

use serde::Deserialize;

use crate::channel::ChannelOptions;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub channel: ChannelConfig,
}

/// Defaults for spawning the assistant binary.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub binary: String,
    pub model: String,
    pub allowed_tools: Vec<String>,
    pub bypass_permissions: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            model: String::new(),
            allowed_tools: Vec::new(),
            bypass_permissions: false,
        }
    }
}

impl Config {
    /// Load config from ~/.clawlink/config.toml, falling back to defaults.
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Path to the config file.
    pub fn config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".clawlink")
            .join("config.toml")
    }

    /// Spawn options seeded from this config (CLI flags layer on top).
    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            binary: self.channel.binary.clone(),
            model: if self.channel.model.is_empty() {
                None
            } else {
                Some(self.channel.model.clone())
            },
            allowed_tools: self.channel.allowed_tools.clone(),
            bypass_permissions: self.channel.bypass_permissions,
            ..ChannelOptions::default()
        }
    }
}
