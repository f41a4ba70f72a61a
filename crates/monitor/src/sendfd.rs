//! Ancillary file-descriptor passing over a connected UNIX socket
//!
//! Used only for `add-fd`/`getfd` commands, whose argument `fd` must be
//! handed to QEMU out-of-band via `SCM_RIGHTS` rather than embedded in
//! the JSON frame. The data payload is the command frame; the ancillary
//! payload is the single descriptor named by `arguments.fd`.

use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
use std::io::IoSlice;
use std::os::fd::RawFd;

/// Send `data` on `fd` together with one ancillary descriptor,
/// `ancillary`. A negative return from the underlying `sendmsg(2)` is
/// fatal to the owning session, same as any other write failure;
/// callers map `Err` to `ErrorKind::Write`.
pub(crate) fn send_with_fd(fd: RawFd, data: &[u8], ancillary: RawFd) -> nix::Result<usize> {
    let iov = [IoSlice::new(data)];
    let cmsgs = [ControlMessage::ScmRights(&[ancillary])];
    sendmsg::<()>(fd, &iov, &cmsgs, MsgFlags::empty(), None)
}
