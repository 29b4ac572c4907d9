//! Configuration loading from TOML files

use std::ffi::c_int;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Global configuration for graceful
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub shutdown: ShutdownConfig,
    pub serve: ServeConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Global deadline for all shutdown tasks
    pub timeout_ms: u64,
    /// Signal names, e.g. "SIGTERM" or "int"
    pub signals: Vec<String>,
    /// Exit immediately on a second interrupt
    pub force_exit_on_repeat: bool,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 1000,
            signals: vec!["SIGTERM".to_string(), "SIGINT".to_string()],
            force_exit_on_repeat: true,
        }
    }
}

impl ShutdownConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Resolve configured names to signal numbers.
    pub fn signal_numbers(&self) -> Result<Vec<c_int>> {
        self.signals
            .iter()
            .map(|name| {
                graceful_core::parse_signal(name)
                    .with_context(|| format!("Invalid [shutdown] signals entry: {name:?}"))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    #[serde(deserialize_with = "deserialize_env_var")]
    pub listen: String,
    /// How long the server waits for open sessions during shutdown
    pub drain_ms: u64,
    /// Append-only session log, closed by its own shutdown task
    pub journal: Option<PathBuf>,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:0".to_string(),
            drain_ms: 500,
            journal: None,
        }
    }
}

/// Deserialize a string that may contain environment variable reference like ${VAR}
fn deserialize_env_var<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    expand_env_var(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("environment variable not set: {raw}")))
}

/// Expand ${VAR} to environment variable value
fn expand_env_var(s: &str) -> Option<String> {
    if let Some(var_name) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        std::env::var(var_name).ok()
    } else {
        Some(s.to_string())
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Search order:
    /// 1. ./graceful.toml (current directory)
    /// 2. ~/.config/graceful/config.toml
    ///
    /// If no config file found, returns default config.
    pub fn load() -> Result<Self> {
        let local_config = PathBuf::from("graceful.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = directories::ProjectDirs::from("", "", "graceful") {
            let user_config = config_dir.config_dir().join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        log::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Load configuration from a specific file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }
}
