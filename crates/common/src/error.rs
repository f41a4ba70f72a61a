//! Error types shared across the InfraSim QMP/QGA tooling

use thiserror::Error;

/// Result type alias using InfraSim's common `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors shared by the CLI front end and other collaborators of
/// `qmpmux`. The client's own error taxonomy lives in
/// `qmpmux::error::Error`; this enum only covers configuration and
/// path resolution concerns outside the client.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
