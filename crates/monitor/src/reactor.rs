//! Single-threaded, non-blocking event loop over a set of UNIX sockets
//!
//! One `Reactor` is created per [`crate::Client::execute`] call and does
//! not outlive it: commands to different VMs are independent, and
//! overlapping their I/O on one thread gives linear throughput without
//! cross-VM locking (QEMU admits only one QMP client per instance
//! anyway, so a worker-per-VM design would only add teardown
//! complexity for no benefit).

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// The capability set a `Session` exposes to the `Reactor`. Replaces the
/// source's name-lookup dispatch (it attaches callbacks to a library
/// reactor by string) with an explicit trait the reactor calls
/// directly.
pub(crate) trait SessionHandler {
    fn on_input(&mut self, buf: &mut Vec<u8>);
    fn on_timeout(&mut self, buf: &mut Vec<u8>);
    fn on_eof(&mut self, buf: &mut Vec<u8>);
    fn on_close(&mut self);
}

struct FdState {
    stream: UnixStream,
    inbuf: Vec<u8>,
    outbuf: Vec<u8>,
    deadline: Option<Instant>,
    handler: Box<dyn SessionHandler>,
}

pub(crate) struct Reactor {
    fds: HashMap<RawFd, FdState>,
    stop: bool,
}

impl Reactor {
    pub(crate) fn new() -> Self {
        Self {
            fds: HashMap::new(),
            stop: false,
        }
    }

    /// Register a connected, not-yet-nonblocking stream. Takes
    /// ownership so the `Reactor` alone decides when the socket closes.
    pub(crate) fn add(&mut self, stream: UnixStream, handler: Box<dyn SessionHandler>) -> RawFd {
        stream
            .set_nonblocking(true)
            .expect("a freshly connected UnixStream accepts O_NONBLOCK");
        let fd = stream.as_raw_fd();
        self.fds.insert(
            fd,
            FdState {
                stream,
                inbuf: Vec::new(),
                outbuf: Vec::new(),
                deadline: None,
                handler,
            },
        );
        fd
    }

    pub(crate) fn remove(&mut self, fd: RawFd) {
        self.fds.remove(&fd);
    }

    pub(crate) fn set_timeout(&mut self, fd: RawFd, seconds: u64) {
        if let Some(state) = self.fds.get_mut(&fd) {
            state.deadline = Some(Instant::now() + Duration::from_secs(seconds));
        }
    }

    /// Enqueue bytes for writing on the next readiness round.
    pub(crate) fn write(&mut self, fd: RawFd, bytes: &[u8]) {
        if let Some(state) = self.fds.get_mut(&fd) {
            state.outbuf.extend_from_slice(bytes);
        }
    }

    pub(crate) fn endloop(&mut self) {
        self.stop = true;
    }

    /// Drive the loop: run `tick` once up front (so a freshly opened
    /// session gets its first command written before any poll wait),
    /// then alternate one readiness wait with one `tick` call until
    /// `endloop()` has been called or no descriptors remain.
    pub(crate) fn run<F: FnMut(&mut Reactor)>(&mut self, mut tick: F) {
        self.stop = false;
        tick(self);
        while !self.stop && !self.fds.is_empty() {
            self.poll_once();
            tick(self);
        }
    }

    fn poll_once(&mut self) {
        self.fire_expired_timeouts();
        if self.fds.is_empty() {
            return;
        }

        let timeout_ms = self.next_timeout_ms();
        let order: Vec<RawFd> = self.fds.keys().copied().collect();
        let mut poll_fds: Vec<PollFd> = Vec::with_capacity(order.len());
        for &fd in &order {
            let state = &self.fds[&fd];
            let mut flags = PollFlags::POLLIN;
            if !state.outbuf.is_empty() {
                flags |= PollFlags::POLLOUT;
            }
            // SAFETY: `fd` stays registered (its UnixStream alive) for
            // as long as this borrow is live.
            let borrowed: BorrowedFd = unsafe { BorrowedFd::borrow_raw(fd) };
            poll_fds.push(PollFd::new(borrowed, flags));
        }

        // No registered deadline should only happen transiently; fall
        // back to a bounded wait rather than blocking forever so a
        // misconfigured session can't wedge the whole reactor.
        const NO_DEADLINE_FALLBACK_MS: i32 = 60_000;
        let timeout_ms = timeout_ms.unwrap_or(NO_DEADLINE_FALLBACK_MS);
        let timeout = PollTimeout::try_from(timeout_ms).unwrap_or(PollTimeout::MAX);

        match poll(&mut poll_fds, timeout) {
            Ok(_) => {}
            Err(Errno::EINTR) => return,
            Err(e) => {
                warn!("poll failed: {e}");
                return;
            }
        }

        for (pfd, &fd) in poll_fds.iter().zip(order.iter()) {
            let Some(revents) = pfd.revents() else {
                continue;
            };
            if revents.contains(PollFlags::POLLOUT) {
                self.flush_output(fd);
            }
            if revents.contains(PollFlags::POLLIN) {
                self.read_input(fd);
            } else if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
                self.handle_close(fd);
            }
        }

        self.fire_expired_timeouts();
    }

    fn next_timeout_ms(&self) -> Option<i32> {
        let now = Instant::now();
        self.fds
            .values()
            .filter_map(|s| s.deadline)
            .map(|d| d.saturating_duration_since(now).as_millis().min(i32::MAX as u128) as i32)
            .min()
    }

    fn fire_expired_timeouts(&mut self) {
        let now = Instant::now();
        let expired: Vec<RawFd> = self
            .fds
            .iter()
            .filter(|(_, s)| s.deadline.is_some_and(|d| d <= now))
            .map(|(&fd, _)| fd)
            .collect();
        for fd in expired {
            if let Some(state) = self.fds.get_mut(&fd) {
                state.deadline = None;
                let mut inbuf = std::mem::take(&mut state.inbuf);
                state.handler.on_timeout(&mut inbuf);
                if let Some(state) = self.fds.get_mut(&fd) {
                    state.inbuf = inbuf;
                }
            }
        }
    }

    fn flush_output(&mut self, fd: RawFd) {
        let Some(state) = self.fds.get_mut(&fd) else {
            return;
        };
        if state.outbuf.is_empty() {
            return;
        }
        match state.stream.write(&state.outbuf) {
            Ok(0) => {}
            Ok(n) => {
                state.outbuf.drain(..n);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => warn!("write failed on fd {fd}: {e}"),
        }
    }

    fn read_input(&mut self, fd: RawFd) {
        let mut chunk = [0u8; 8192];
        loop {
            let Some(state) = self.fds.get_mut(&fd) else {
                return;
            };
            match state.stream.read(&mut chunk) {
                Ok(0) => {
                    self.handle_close(fd);
                    return;
                }
                Ok(n) => {
                    state.inbuf.extend_from_slice(&chunk[..n]);
                    let mut inbuf = std::mem::take(&mut state.inbuf);
                    trace!("fd {fd} read {n} bytes");
                    state.handler.on_input(&mut inbuf);
                    match self.fds.get_mut(&fd) {
                        Some(state) => state.inbuf = inbuf,
                        None => return, // handler closed the session mid-read
                    }
                    if n < chunk.len() {
                        return;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("read failed on fd {fd}: {e}");
                    self.handle_close(fd);
                    return;
                }
            }
        }
    }

    fn handle_close(&mut self, fd: RawFd) {
        if let Some(mut state) = self.fds.remove(&fd) {
            if state.inbuf.is_empty() {
                state.handler.on_close();
            } else {
                let mut inbuf = std::mem::take(&mut state.inbuf);
                state.handler.on_eof(&mut inbuf);
            }
        }
    }
}
