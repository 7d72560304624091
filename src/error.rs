//! Error types for achievement-companion

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for save ingestion and watching
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("File watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Failed to parse {format} data: {reason}")]
    Parse {
        format: &'static str,
        reason: String,
    },

    #[error("Achievement schema not found under: {0}")]
    SchemaNotFound(PathBuf),

    #[error("Save directory not found: {0}")]
    SaveDirNotFound(PathBuf),

    #[error("Registry query failed: {0}")]
    Registry(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub(crate) fn parse(format: &'static str, reason: impl Into<String>) -> Self {
        Error::Parse {
            format,
            reason: reason.into(),
        }
    }
}

/// Result type alias for achievement-companion operations
pub type Result<T> = std::result::Result<T, Error>;
