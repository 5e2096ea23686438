//! Error types for sandbox fixtures

use std::io;
use thiserror::Error;

/// Result type alias for sandbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Errors that can occur while provisioning a sandbox
#[derive(Error, Debug)]
pub enum SandboxError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error (missing or invalid grain setting)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A grain failed while being set up
    #[error("Grain '{name}' failed: {source}")]
    Grain {
        /// Attribute name the grain was attached under
        name: String,
        /// Underlying failure
        #[source]
        source: Box<SandboxError>,
    },

    /// External process error
    #[error("Process error: {0}")]
    Process(String),

    /// An operation did not complete in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Command not found
    #[error("Command not found: {0}")]
    CommandNotFound(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl SandboxError {
    /// Wrap an error with the name of the grain that produced it
    pub fn grain(name: impl Into<String>, source: SandboxError) -> Self {
        SandboxError::Grain {
            name: name.into(),
            source: Box::new(source),
        }
    }
}

impl From<String> for SandboxError {
    fn from(s: String) -> Self {
        SandboxError::Other(s)
    }
}

impl From<&str> for SandboxError {
    fn from(s: &str) -> Self {
        SandboxError::Other(s.to_string())
    }
}
