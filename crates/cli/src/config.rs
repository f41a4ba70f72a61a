//! `qmpctl` configuration
//!
//! Optional TOML file at `~/.infrasim/qmpctl.toml`; CLI flags always
//! take precedence over whatever it sets, mirroring the daemon's own
//! config/flag precedence.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QmpctlConfig {
    /// Directory holding `<vmid>.qmp` / `<vmid>.qga` sockets
    pub socket_dir: PathBuf,

    /// Default socket connect deadline, in seconds
    pub connect_timeout_secs: u64,
}

impl Default for QmpctlConfig {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from("/var/run/qemu-server"),
            connect_timeout_secs: 1,
        }
    }
}

impl QmpctlConfig {
    /// Load from `path`, falling back to defaults if it doesn't exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Default config file location, `~/.infrasim/qmpctl.toml`.
    pub fn default_path() -> PathBuf {
        infrasim_common::default_store_path().join("qmpctl.toml")
    }
}
