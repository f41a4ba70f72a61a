//! InfraSim Common Library
//!
//! Shared error types used by `qmpmux` and its collaborators. Path
//! resolution for QMP/QGA sockets lives in `qmpmux::locator` since the
//! client treats socket paths as opaque; `default_store_path` here is
//! only the config-file/runtime-directory root used by the `qmpctl`
//! front end.

pub mod error;

pub use error::{Error, Result};

/// InfraSim version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path for the `qmpctl` front end's config and runtime state
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".infrasim")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
