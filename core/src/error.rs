//! Error types for live-nx-iree.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for live-nx-iree operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Pipeline stage an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Transport decoding, tensor or pixel layout validation.
    Decode,
    /// Device creation or selection.
    Device,
    /// The native engine call itself.
    Engine,
    /// Handle or bridge lifecycle.
    Lifecycle,
    /// Configuration loading.
    Config,
    /// Filesystem and image file access.
    Io,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Decode => "decode",
            Self::Device => "device",
            Self::Engine => "engine",
            Self::Lifecycle => "lifecycle",
            Self::Config => "config",
            Self::Io => "io",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while bridging calls into the native engine.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Malformed transport payload or tensor size/shape mismatch.
    #[error("Decode failed: {0}")]
    Decode(String),

    /// The engine rejected a device URI.
    #[error("Device creation failed for '{uri}': {message}")]
    DeviceCreation { uri: String, message: String },

    /// No device has been selected for the invocation.
    #[error("No device selected")]
    NoDevice,

    /// The engine reported a failure. The message is the engine's own.
    #[error("Engine call failed: {0}")]
    EngineFailure(String),

    /// Engine instance could not be created.
    #[error("Engine initialization failed: {0}")]
    EngineInit(String),

    /// Request rejected before reaching the engine.
    #[error("Invalid invocation: {0}")]
    InvalidInvocation(String),

    /// Use of a bridge or handle after teardown.
    #[error("Resource lifecycle violation: {0}")]
    ResourceLifecycle(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Native library could not be opened or is missing a symbol.
    #[error("Engine library error: {0}")]
    Library(#[from] libloading::Error),

    /// YAML parsing error.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON parsing error.
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// Image file encoding or decoding error.
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// File not found.
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),
}

impl BridgeError {
    /// Create a decode error.
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a device creation error.
    pub fn device_creation(uri: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::DeviceCreation {
            uri: uri.into(),
            message: msg.into(),
        }
    }

    /// Create an engine failure carrying the engine's message verbatim.
    pub fn engine_failure(msg: impl Into<String>) -> Self {
        Self::EngineFailure(msg.into())
    }

    /// Create an invalid invocation error.
    pub fn invalid_invocation(msg: impl Into<String>) -> Self {
        Self::InvalidInvocation(msg.into())
    }

    /// Create a lifecycle error.
    pub fn lifecycle(msg: impl Into<String>) -> Self {
        Self::ResourceLifecycle(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// The stage this error originated from.
    pub fn stage(&self) -> Stage {
        match self {
            Self::Decode(_) | Self::Json(_) => Stage::Decode,
            Self::DeviceCreation { .. } | Self::NoDevice => Stage::Device,
            Self::EngineFailure(_) | Self::EngineInit(_) | Self::InvalidInvocation(_) => {
                Stage::Engine
            }
            Self::ResourceLifecycle(_) => Stage::Lifecycle,
            Self::Config(_) | Self::Yaml(_) => Stage::Config,
            Self::Library(_) | Self::Image(_) | Self::Io(_) | Self::FileNotFound(_) => Stage::Io,
        }
    }
}
