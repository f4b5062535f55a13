//! Custom error types for the backup engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid parameter: {0}")]
    Param(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checksum error: {0}")]
    Checksum(String),

    #[error("Path not empty: {0}")]
    PathNotEmpty(String),

    #[error("Postmaster running: {0}")]
    PostmasterRunning(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Malformed manifest: {0}")]
    MalformedManifest(String),

    #[error("Archive timeout: {0}")]
    ArchiveTimeout(String),

    #[error("Assertion failed: {0}")]
    Assert(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
