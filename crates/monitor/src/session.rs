//! Per-destination session state machine
//!
//! One `Session` per `(vmid, qga)` pair: opens the socket, performs the
//! protocol handshake, writes one command at a time, correlates a
//! response to the in-flight command, invokes its callback, advances
//! the queue, and closes on drain or error. The dispatch step
//! (`advance`) is driven by `Client`, not scheduled by the `Session`
//! itself.

use crate::error::ErrorKind;
use crate::framer::{self, QmpFrame};
use crate::ids::IdGenerator;
use crate::locator::SocketLocator;
use crate::reactor::{Reactor, SessionHandler};
use crate::sendfd;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// The literal sentinel QEMU uses to report a benign non-error for some
/// incoming-migration commands. Matched as a plain string for now;
/// prefer matching `error.class` once QEMU exposes a dedicated one.
const BENIGN_PROGRESS_DESC: &str = "Connection can not be completed immediately";

/// QGA commands the agent may terminate the connection without
/// answering.
const QGA_ALLOW_CLOSE: &[&str] = &[
    "guest-shutdown",
    "guest-suspend-ram",
    "guest-suspend-disk",
    "guest-suspend-hybrid",
];

const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Transport {
    Qmp,
    Qga { legacy_no_sentinel: bool },
}

impl Transport {
    pub(crate) fn is_qga(self) -> bool {
        matches!(self, Transport::Qga { .. })
    }
}

struct InFlight {
    qmp_id: Option<String>,
    qga_id: Option<u64>,
    execute: String,
    callback: Box<dyn FnOnce(u32, Option<Value>)>,
}

/// An enqueued unit of work: a command name, its arguments, and a
/// one-shot callback invoked with the server's response (or `None` on
/// an allow-close EOF).
pub struct Command {
    execute: String,
    arguments: serde_json::Map<String, Value>,
    callback: Box<dyn FnOnce(u32, Option<Value>)>,
    /// Caller-supplied override for the default timeout table. `Some(0)`
    /// means "use the default run timeout", same as `None` reaching the
    /// table's catch-all.
    timeout_secs: Option<u64>,
}

impl Command {
    pub(crate) fn new(
        execute: String,
        arguments: serde_json::Map<String, Value>,
        callback: Box<dyn FnOnce(u32, Option<Value>)>,
        timeout_secs: Option<u64>,
    ) -> Self {
        Self {
            execute,
            arguments,
            callback,
            timeout_secs,
        }
    }

    fn internal(execute: &str) -> Self {
        Self {
            execute: execute.to_string(),
            arguments: serde_json::Map::new(),
            callback: Box::new(|_vmid, _response| {}),
            timeout_secs: None,
        }
    }

    /// Extract `arguments.fd` for `add-fd`/`getfd`: it travels out of
    /// band via `SCM_RIGHTS` and never reaches the JSON encoding.
    fn take_ancillary_fd(&mut self) -> Option<RawFd> {
        if matches!(self.execute.as_str(), "add-fd" | "getfd") {
            self.arguments
                .remove("fd")
                .and_then(|v| v.as_i64())
                .map(|n| n as RawFd)
        } else {
            None
        }
    }
}

type EventSink = Rc<RefCell<Option<Box<dyn FnMut(u32, Value)>>>>;

pub(crate) struct Session {
    vmid: u32,
    transport: Transport,
    queue: VecDeque<Command>,
    current: Option<InFlight>,
    error: Option<ErrorKind>,
    fd: Option<RawFd>,
    connect_timeout_secs: u64,
    events: EventSink,
}

impl Session {
    pub(crate) fn new(
        vmid: u32,
        transport: Transport,
        connect_timeout_secs: u64,
        events: EventSink,
    ) -> Self {
        Self {
            vmid,
            transport,
            queue: VecDeque::new(),
            current: None,
            error: None,
            fd: None,
            connect_timeout_secs,
            events,
        }
    }

    pub(crate) fn enqueue(&mut self, cmd: Command) {
        self.queue.push_back(cmd);
    }

    pub(crate) fn set_fd(&mut self, fd: RawFd) {
        self.fd = Some(fd);
    }

    pub(crate) fn take_error(&mut self) -> Option<ErrorKind> {
        self.error.take()
    }

    /// Open the socket (boundary: a session with an empty queue skips
    /// this entirely), seeding the QMP handshake ahead of caller
    /// commands. Connect failures are captured on `self.error` rather
    /// than propagated, so the caller's other sessions still run.
    pub(crate) fn open(&mut self, locator: &dyn SocketLocator) -> Option<UnixStream> {
        if self.queue.is_empty() {
            return None;
        }
        if self.transport == Transport::Qmp {
            self.queue.push_front(Command::internal("qmp_capabilities"));
        }

        let path = locator.socket_path(self.vmid, self.transport.is_qga());
        let deadline = Instant::now() + Duration::from_secs(self.connect_timeout_secs.max(1));
        match connect_with_retry(&path, deadline) {
            Ok(stream) => Some(stream),
            Err(kind) => {
                self.error = Some(kind);
                None
            }
        }
    }

    /// Write the next queued command if nothing is currently in flight.
    /// Closes (removes from the reactor) once the queue and `current`
    /// are both empty, or once an error has been captured.
    pub(crate) fn advance(&mut self, reactor: &mut Reactor, ids: &IdGenerator) {
        let Some(fd) = self.fd else {
            return;
        };

        if self.error.is_some() {
            reactor.remove(fd);
            self.fd = None;
            return;
        }

        if self.current.is_some() {
            return;
        }

        let Some(mut cmd) = self.queue.pop_front() else {
            reactor.remove(fd);
            self.fd = None;
            return;
        };

        let ancillary_fd = cmd.take_ancillary_fd();
        let timeout = match cmd.timeout_secs {
            None => default_timeout(self.transport, &cmd.execute),
            // An explicit zero timeout means "use the default run
            // timeout" (3s), not the per-command table lookup.
            Some(0) => 3,
            Some(secs) => secs,
        };
        let (in_flight_ids, frame) = self.build_frame(&cmd, ids);

        let write_result = if let Some(afd) = ancillary_fd {
            sendfd::send_with_fd(fd, &frame, afd)
                .map(|_| ())
                .map_err(|e| ErrorKind::Write(format!("sendfd failed: {e}")))
        } else {
            reactor.write(fd, &frame);
            Ok(())
        };

        match write_result {
            Ok(()) => {
                trace!(vmid = self.vmid, execute = %cmd.execute, "wrote command");
                reactor.set_timeout(fd, timeout);
                let (qmp_id, qga_id) = in_flight_ids;
                self.current = Some(InFlight {
                    qmp_id,
                    qga_id,
                    execute: cmd.execute,
                    callback: cmd.callback,
                });
            }
            Err(kind) => {
                warn!(vmid = self.vmid, "{kind}");
                self.error = Some(kind);
            }
        }
    }

    fn build_frame(&self, cmd: &Command, ids: &IdGenerator) -> ((Option<String>, Option<u64>), Vec<u8>) {
        match self.transport {
            Transport::Qmp => {
                let id = ids.next_qmp();
                let mut obj = serde_json::Map::new();
                obj.insert("execute".into(), Value::String(cmd.execute.clone()));
                obj.insert("arguments".into(), Value::Object(cmd.arguments.clone()));
                obj.insert("id".into(), Value::String(id.clone()));
                let mut bytes =
                    serde_json::to_vec(&Value::Object(obj)).expect("qmp frame always serializes");
                bytes.push(b'\n');
                ((Some(id), None), bytes)
            }
            Transport::Qga { .. } => {
                let id = ids.next_qga();

                let mut sync_args = serde_json::Map::new();
                sync_args.insert("id".into(), Value::Number(id.into()));
                let mut sync = serde_json::Map::new();
                sync.insert(
                    "execute".into(),
                    Value::String("guest-sync-delimited".into()),
                );
                sync.insert("arguments".into(), Value::Object(sync_args));

                let mut real = serde_json::Map::new();
                real.insert("execute".into(), Value::String(cmd.execute.clone()));
                real.insert("arguments".into(), Value::Object(cmd.arguments.clone()));

                let mut bytes = serde_json::to_vec(&Value::Object(sync))
                    .expect("qga sync frame always serializes");
                bytes.extend(
                    serde_json::to_vec(&Value::Object(real))
                        .expect("qga command frame always serializes"),
                );
                ((None, Some(id)), bytes)
            }
        }
    }

    fn handle_qmp_frame(&mut self, frame: QmpFrame) {
        match frame {
            QmpFrame::Greeting => {}
            QmpFrame::Event(data) => {
                if let Some(cb) = self.events.borrow_mut().as_mut() {
                    cb(self.vmid, data);
                }
            }
            QmpFrame::Response(value) => {
                if let Some(err) = value.get("error") {
                    let desc = err.get("desc").and_then(Value::as_str).unwrap_or("");
                    if desc == BENIGN_PROGRESS_DESC {
                        debug!(vmid = self.vmid, "benign in-band progress message, skipped");
                        return;
                    }
                    self.error = Some(ErrorKind::ProtocolRefused(desc.to_string()));
                    return;
                }

                let Some(current) = self.current.take() else {
                    self.error = Some(ErrorKind::Framing(
                        "response with no in-flight command".to_string(),
                    ));
                    return;
                };
                let Some(want) = current.qmp_id.as_deref() else {
                    self.error = Some(ErrorKind::Framing(
                        "qmp session received a qga-shaped response".to_string(),
                    ));
                    return;
                };
                let got = value.get("id").and_then(Value::as_str).unwrap_or("");
                if got != want {
                    self.error = Some(ErrorKind::Framing(format!(
                        "id mismatch \"{got}\" (expected \"{want}\")"
                    )));
                    return;
                }

                (current.callback)(self.vmid, Some(value));
            }
        }
    }

    fn handle_qga_frame(&mut self, sync_id: u64, response: Value) {
        let Some(current) = self.current.as_ref() else {
            self.error = Some(ErrorKind::Framing(
                "qga response with no in-flight command".to_string(),
            ));
            return;
        };
        let Some(want) = current.qga_id else {
            self.error = Some(ErrorKind::Framing(
                "qga session received a qmp-shaped response".to_string(),
            ));
            return;
        };

        if sync_id < want {
            trace!(vmid = self.vmid, sync_id, want, "discarding stale qga sync");
            return;
        }
        if sync_id != want {
            self.error = Some(ErrorKind::Framing(format!(
                "id mismatch \"{sync_id}\" (expected \"{want}\")"
            )));
            return;
        }

        let current = self.current.take().expect("checked above");
        (current.callback)(self.vmid, Some(response));
    }
}

impl SessionHandler for Session {
    fn on_input(&mut self, buf: &mut Vec<u8>) {
        if self.error.is_some() {
            return;
        }
        loop {
            let outcome = match self.transport {
                Transport::Qmp => framer::decode_qmp(buf).map(|f| f.map(Frame::Qmp)),
                Transport::Qga { legacy_no_sentinel } => {
                    framer::decode_qga(buf, !legacy_no_sentinel).map(|f| f.map(Frame::Qga))
                }
            };
            match outcome {
                Ok(Some(Frame::Qmp(frame))) => self.handle_qmp_frame(frame),
                Ok(Some(Frame::Qga(sync_id, response))) => {
                    self.handle_qga_frame(sync_id, response)
                }
                Ok(None) => break,
                Err(kind) => {
                    self.error = Some(kind);
                    break;
                }
            }
            if self.error.is_some() {
                break;
            }
        }
    }

    fn on_timeout(&mut self, buf: &mut Vec<u8>) {
        self.error = Some(ErrorKind::Timeout);
        buf.clear();
    }

    fn on_eof(&mut self, buf: &mut Vec<u8>) {
        if let Some(current) = self.current.as_ref() {
            if self.transport.is_qga() && QGA_ALLOW_CLOSE.contains(&current.execute.as_str()) {
                let legacy = matches!(self.transport, Transport::Qga { legacy_no_sentinel: true });
                let response = if legacy {
                    framer::decode_qga_single_no_sentinel(buf)
                } else {
                    framer::decode_qga_single(buf)
                };
                let current = self.current.take().expect("checked above");
                (current.callback)(self.vmid, response);
                if !self.queue.is_empty() {
                    self.error = Some(ErrorKind::PeerClosed(
                        "Got EOF but command queue is not empty.".to_string(),
                    ));
                }
                return;
            }
        }
        self.error = Some(ErrorKind::PeerClosed("client closed connection".to_string()));
    }

    fn on_close(&mut self) {
        // A clean close (no trailing bytes) still needs the allow-close
        // check: `guest-shutdown` commonly hangs up without writing
        // anything back.
        let mut empty = Vec::new();
        self.on_eof(&mut empty);
    }
}

enum Frame {
    Qmp(QmpFrame),
    Qga(u64, Value),
}

/// Default per-command timeout in seconds, mirroring the source
/// repository's own per-command timeout table. Evaluated as an ordered
/// list of prefix matchers rather than a `HashMap` so a specific entry
/// always wins over the catch-all regardless of hashing order.
pub(crate) fn default_timeout(_transport: Transport, execute: &str) -> u64 {
    const HOUR: u64 = 3600;
    const TEN_MIN: u64 = 600;

    if execute == "query-migrate" {
        return HOUR;
    }
    if execute.starts_with("eject") || execute.starts_with("change") {
        return 60;
    }
    if execute == "guest-fsfreeze-freeze" {
        return HOUR;
    }
    if execute == "guest-fsfreeze-thaw" {
        return 10;
    }
    const TEN_MIN_TABLE: &[&str] = &[
        "query-backup",
        "query-block-jobs",
        "block-job-cancel",
        "block-job-complete",
        "backup-cancel",
        "query-savevm",
        "delete-drive-snapshot",
        "guest-shutdown",
        "snapshot-drive",
    ];
    if execute.starts_with("savevm-") || TEN_MIN_TABLE.contains(&execute) {
        return TEN_MIN;
    }
    3
}

fn connect_with_retry(path: &PathBuf, deadline: Instant) -> Result<UnixStream, ErrorKind> {
    loop {
        match UnixStream::connect(path) {
            Ok(stream) => return Ok(stream),
            Err(e)
                if matches!(
                    e.raw_os_error(),
                    Some(libc::EINTR) | Some(libc::EAGAIN)
                ) =>
            {
                if Instant::now() >= deadline {
                    return Err(ErrorKind::Connect(format!(
                        "socket connect timeout after retries: {}",
                        path.display()
                    )));
                }
                std::thread::sleep(CONNECT_RETRY_DELAY);
            }
            Err(e) => {
                return Err(ErrorKind::Connect(format!(
                    "socket unreachable: {} ({e})",
                    path.display()
                )))
            }
        }
    }
}

/// Bridges a shared `Session` to the `Reactor`'s owned-handler model:
/// the `Reactor` holds this adapter, the `Client` holds the `Rc` it
/// wraps, and both drive the same session state.
pub(crate) struct SessionIo(pub(crate) Rc<RefCell<Session>>);

impl SessionHandler for SessionIo {
    fn on_input(&mut self, buf: &mut Vec<u8>) {
        self.0.borrow_mut().on_input(buf);
    }

    fn on_timeout(&mut self, buf: &mut Vec<u8>) {
        self.0.borrow_mut().on_timeout(buf);
    }

    fn on_eof(&mut self, buf: &mut Vec<u8>) {
        self.0.borrow_mut().on_eof(buf);
    }

    fn on_close(&mut self) {
        self.0.borrow_mut().on_close();
    }
}
