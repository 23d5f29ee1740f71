//! Configuration types for live-nx-iree.

use serde::Deserialize;
use std::time::Duration;

use crate::capture::SeedPolicy;
use crate::error::{BridgeError, Result};

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Native engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Device selection.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Tensor-mode invocation configuration.
    #[serde(default)]
    pub invocation: InvocationConfig,

    /// Capture loop configuration.
    #[serde(default)]
    pub capture: CaptureConfig,
}

/// Native engine configuration.
#[derive(Debug, Default, Deserialize)]
pub struct EngineConfig {
    /// Path to the engine shared library.
    #[serde(default)]
    pub library_path: Option<String>,
}

/// Device configuration.
#[derive(Debug, Deserialize)]
pub struct DeviceConfig {
    /// Device URI, e.g. `local-sync://` or `cuda://0`.
    #[serde(default = "default_device_uri")]
    pub uri: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            uri: default_device_uri(),
        }
    }
}

/// Invocation configuration.
#[derive(Debug, Deserialize)]
pub struct InvocationConfig {
    /// Number of outputs the entry function returns.
    #[serde(default = "default_num_outputs")]
    pub num_outputs: usize,
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self {
            num_outputs: default_num_outputs(),
        }
    }
}

/// Capture loop configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Tick period in milliseconds.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// How long a tick waits for a frame before giving up.
    #[serde(default = "default_frame_timeout_ms")]
    pub frame_timeout_ms: u64,

    /// Width frames are resized to before the engine call.
    #[serde(default = "default_size")]
    pub width: u32,

    /// Height frames are resized to before the engine call.
    #[serde(default = "default_size")]
    pub height: u32,

    /// Initial noise amount in `[0, 1]`.
    #[serde(default)]
    pub noise_amount: f32,

    /// Fixed noise seed. Unset means a random seed per call.
    #[serde(default)]
    pub seed: Option<u32>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            frame_timeout_ms: default_frame_timeout_ms(),
            width: default_size(),
            height: default_size(),
            noise_amount: 0.0,
            seed: None,
        }
    }
}

impl CaptureConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn seed_policy(&self) -> SeedPolicy {
        self.seed.map_or(SeedPolicy::Random, SeedPolicy::Fixed)
    }
}

fn default_device_uri() -> String {
    "local-sync://".to_string()
}

fn default_num_outputs() -> usize {
    1
}

fn default_tick_interval_ms() -> u64 {
    16
}

fn default_frame_timeout_ms() -> u64 {
    1000
}

fn default_size() -> u32 {
    256
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(BridgeError::FileNotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.device.uri.trim().is_empty() {
            return Err(BridgeError::config("device.uri must not be empty"));
        }
        if self.invocation.num_outputs == 0 {
            return Err(BridgeError::config("invocation.num_outputs must be at least 1"));
        }

        let capture = &self.capture;
        if capture.tick_interval_ms == 0 {
            return Err(BridgeError::config("capture.tick_interval_ms must be positive"));
        }
        if capture.frame_timeout_ms == 0 {
            return Err(BridgeError::config("capture.frame_timeout_ms must be positive"));
        }
        if capture.width == 0 || capture.height == 0 {
            return Err(BridgeError::config(format!(
                "capture size must be positive, got {}x{}",
                capture.width, capture.height
            )));
        }
        if !(0.0..=1.0).contains(&capture.noise_amount) {
            return Err(BridgeError::config(format!(
                "capture.noise_amount must be in [0, 1], got {}",
                capture.noise_amount
            )));
        }
        Ok(())
    }
}
