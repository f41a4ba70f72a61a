//! Socket path resolution — the collaborator surface
//!
//! The client treats a VM's socket path as opaque: it never constructs
//! or interprets it, only connects to whatever a [`SocketLocator`]
//! hands back.

use std::path::PathBuf;

/// Resolves a VM id and transport to the UNIX socket the client should
/// connect to.
pub trait SocketLocator {
    fn socket_path(&self, vmid: u32, qga: bool) -> PathBuf;
}

/// The path layout used by the source repository this client is
/// modeled on. Provided for parity out of the box; callers with a
/// different runtime layout should supply their own `SocketLocator`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSocketLocator;

impl SocketLocator for DefaultSocketLocator {
    fn socket_path(&self, vmid: u32, qga: bool) -> PathBuf {
        let ext = if qga { "qga" } else { "qmp" };
        PathBuf::from(format!("/var/run/qemu-server/{vmid}.{ext}"))
    }
}
