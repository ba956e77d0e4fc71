//! Device configuration for the graph backend.
//!
//! Loads [`DeviceConfig`] from a TOML file (`devgraph.toml`) with environment
//! variable overrides via `DEVGRAPH_*` prefixed variables.

use crate::limits::{DEFAULT_MAX_VIEW_LENGTH, DEFAULT_PAGE_SIZE, MAX_COMMAND_STREAMS};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How device views relate to host memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryModel {
    /// Device views alias host memory; push/pull are fences.
    Unified,
    /// Device owns a separate copy of every mapped buffer; push/pull copy.
    Discrete,
}

impl std::fmt::Display for MemoryModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unified => write!(f, "unified"),
            Self::Discrete => write!(f, "discrete"),
        }
    }
}

impl std::str::FromStr for MemoryModel {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unified" | "shared" => Ok(Self::Unified),
            "discrete" | "local" => Ok(Self::Discrete),
            other => Err(format!("unknown memory model: {other}")),
        }
    }
}

/// Device configuration loaded from TOML with environment variable overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Name reported by the device.
    /// Override: `DEVGRAPH_DEVICE_NAME`
    pub device_name: String,

    /// Number of command streams driven in parallel.
    /// Override: `DEVGRAPH_STREAM_COUNT`
    pub stream_count: usize,

    /// Memory model of the device.
    /// Override: `DEVGRAPH_MEMORY_MODEL`
    pub memory_model: MemoryModel,

    /// Largest extent of a single device-addressable view, in bytes.
    /// Override: `DEVGRAPH_MAX_VIEW_LENGTH`
    pub max_view_length: usize,

    /// Page size used to align device views.
    /// Override: `DEVGRAPH_PAGE_SIZE`
    pub page_size: usize,

    /// Threads per work-group used to size kernel grids.
    /// Override: `DEVGRAPH_WORK_GROUP_SIZE`
    pub work_group_size: u32,

    /// Default for concurrency planning: check operations for aliased memory.
    /// Override: `DEVGRAPH_VALIDATE_MEMORY`
    pub validate_memory_safety: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_name: "sim0".to_string(),
            stream_count: 4,
            memory_model: MemoryModel::Discrete,
            max_view_length: DEFAULT_MAX_VIEW_LENGTH,
            page_size: DEFAULT_PAGE_SIZE,
            work_group_size: 256,
            validate_memory_safety: true,
        }
    }
}

/// Errors that can occur when loading or validating a [`DeviceConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid environment override {key}={value}: {reason}")]
    EnvOverride {
        key: String,
        value: String,
        reason: String,
    },
}

impl DeviceConfig {
    /// Default configuration rendered as a TOML document.
    pub fn default_toml() -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&Self::default())?)
    }

    /// Load configuration from a TOML file, falling back to defaults for
    /// missing fields, then apply environment variable overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut cfg: DeviceConfig = toml::from_str(toml_str)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load only from environment variables, starting from defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the configuration, returning an error with a descriptive
    /// message on failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_name.is_empty() {
            return Err(ConfigError::Validation("device_name must not be empty".into()));
        }
        if self.device_name.len() > 64 {
            return Err(ConfigError::Validation(
                "device_name must be <= 64 characters".into(),
            ));
        }
        if self.stream_count == 0 || self.stream_count > MAX_COMMAND_STREAMS {
            return Err(ConfigError::Validation(format!(
                "stream_count must be in 1..={MAX_COMMAND_STREAMS}, got {}",
                self.stream_count
            )));
        }
        if !self.page_size.is_power_of_two() {
            return Err(ConfigError::Validation(format!(
                "page_size must be a power of two, got {}",
                self.page_size
            )));
        }
        if self.max_view_length < self.page_size
            || !self.max_view_length.is_multiple_of(self.page_size)
        {
            return Err(ConfigError::Validation(format!(
                "max_view_length must be a non-zero multiple of page_size ({}), got {}",
                self.page_size, self.max_view_length
            )));
        }
        if self.work_group_size == 0 || !self.work_group_size.is_power_of_two() {
            return Err(ConfigError::Validation(format!(
                "work_group_size must be a power of two, got {}",
                self.work_group_size
            )));
        }
        if self.work_group_size > 1024 {
            return Err(ConfigError::Validation(format!(
                "work_group_size must be <= 1024, got {}",
                self.work_group_size
            )));
        }
        Ok(())
    }

    /// Apply `DEVGRAPH_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("DEVGRAPH_DEVICE_NAME") {
            self.device_name = val;
        }

        if let Ok(val) = std::env::var("DEVGRAPH_STREAM_COUNT") {
            self.stream_count = parse_env("DEVGRAPH_STREAM_COUNT", &val)?;
        }

        if let Ok(val) = std::env::var("DEVGRAPH_MEMORY_MODEL") {
            self.memory_model =
                val.parse::<MemoryModel>().map_err(|reason| ConfigError::EnvOverride {
                    key: "DEVGRAPH_MEMORY_MODEL".into(),
                    value: val.clone(),
                    reason,
                })?;
        }

        if let Ok(val) = std::env::var("DEVGRAPH_MAX_VIEW_LENGTH") {
            self.max_view_length = parse_env("DEVGRAPH_MAX_VIEW_LENGTH", &val)?;
        }

        if let Ok(val) = std::env::var("DEVGRAPH_PAGE_SIZE") {
            self.page_size = parse_env("DEVGRAPH_PAGE_SIZE", &val)?;
        }

        if let Ok(val) = std::env::var("DEVGRAPH_WORK_GROUP_SIZE") {
            self.work_group_size = parse_env("DEVGRAPH_WORK_GROUP_SIZE", &val)?;
        }

        if let Ok(val) = std::env::var("DEVGRAPH_VALIDATE_MEMORY") {
            self.validate_memory_safety = matches!(val.as_str(), "1" | "true" | "yes");
        }

        Ok(())
    }
}

fn parse_env<T>(key: &str, val: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    val.parse::<T>().map_err(|e| ConfigError::EnvOverride {
        key: key.into(),
        value: val.into(),
        reason: e.to_string(),
    })
}
