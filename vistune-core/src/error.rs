//! Error types for the vistune-core crate.

use thiserror::Error;

/// Top-level error type for configuration, launch and dataset operations.
#[derive(Debug, Error)]
pub enum VistuneError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(
        "Global batch size {global} is not divisible by batch_per_device ({per_device}) x num_devices ({devices})"
    )]
    IndivisibleBatch {
        global: u32,
        per_device: u32,
        devices: u32,
    },

    #[error("Preflight check failed: {0}")]
    Preflight(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with {}", exit_label(.code))]
    ProcessFailed { program: String, code: Option<i32> },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::ser::Error),

    #[error("Config load error: {0}")]
    Figment(#[from] Box<figment::Error>),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "termination by signal".to_string(),
    }
}

impl VistuneError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn preflight(msg: impl Into<String>) -> Self {
        Self::Preflight(msg.into())
    }

    pub fn dataset(msg: impl Into<String>) -> Self {
        Self::Dataset(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }
}
