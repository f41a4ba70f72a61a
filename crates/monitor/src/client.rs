//! Public client API: queue commands against many VMs, run them all to
//! completion on one reactor, collect per-session failures.

use crate::error::{Error, ErrorKind};
use crate::ids::IdGenerator;
use crate::locator::SocketLocator;
use crate::reactor::Reactor;
use crate::session::{Command, Session, SessionIo, Transport};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::warn;

/// What `Client::execute` does when one or more sessions capture an
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoErr {
    /// Return `Err(Error::Aggregate(..))` summarizing every failed
    /// session; no `SessionFailure` is returned.
    Fatal,
    /// Keep running every other session, logging each failure via
    /// `tracing::warn!` as it's collected, and return every failure for
    /// the caller to inspect. Differs from `Silent` only in that a log
    /// line is emitted per failure.
    LogAndContinue,
    /// Return `Ok` carrying every session's failure for the caller to
    /// inspect (used by `cmd`, which then looks up its own key). No log
    /// line is emitted.
    Silent,
}

/// One session's captured failure, returned from `execute` under
/// [`NoErr::Silent`].
#[derive(Debug, Clone)]
pub struct SessionFailure {
    pub vmid: u32,
    pub qga: bool,
    pub kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SessionKey {
    vmid: u32,
    qga: bool,
}

struct PendingSession {
    key: SessionKey,
    session: Rc<RefCell<Session>>,
}

/// Drives one or more QMP/QGA sessions to completion. Cheap to
/// construct; holds no sockets between `execute` calls.
pub struct Client {
    locator: Box<dyn SocketLocator>,
    connect_timeout_secs: u64,
    ids: IdGenerator,
    events: Rc<RefCell<Option<Box<dyn FnMut(u32, Value)>>>>,
    pending: HashMap<SessionKey, Rc<RefCell<Session>>>,
    order: Vec<SessionKey>,
    legacy_qga_sentinel: HashMap<u32, bool>,
}

impl Client {
    pub fn new(locator: impl SocketLocator + 'static) -> Self {
        Self {
            locator: Box::new(locator),
            connect_timeout_secs: 1,
            ids: IdGenerator::new(),
            events: Rc::new(RefCell::new(None)),
            pending: HashMap::new(),
            order: Vec::new(),
            legacy_qga_sentinel: HashMap::new(),
        }
    }

    /// Override the socket connect deadline (default 1s), e.g. to match
    /// a slower sandbox.
    pub fn with_connect_timeout_secs(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    /// Register a callback invoked for every QMP event received across
    /// all sessions, tagged with the emitting VM's id.
    pub fn on_event(&mut self, callback: impl FnMut(u32, Value) + 'static) {
        *self.events.borrow_mut() = Some(Box::new(callback));
    }

    /// Mark `vmid`'s QGA session as talking to an agent that predates
    /// the `0xFF` sentinel, so its sync/response pair is read directly
    /// off the wire instead of waiting for one. Has no effect on a QMP
    /// session. Takes effect on the next session opened for this VM, not
    /// one already queued.
    pub fn set_legacy_qga_sentinel(&mut self, vmid: u32, legacy: bool) {
        self.legacy_qga_sentinel.insert(vmid, legacy);
    }

    fn session_for(&mut self, vmid: u32, qga: bool) -> Rc<RefCell<Session>> {
        let key = SessionKey { vmid, qga };
        if let Some(existing) = self.pending.get(&key) {
            return Rc::clone(existing);
        }
        let transport = if qga {
            Transport::Qga {
                legacy_no_sentinel: *self.legacy_qga_sentinel.get(&vmid).unwrap_or(&false),
            }
        } else {
            Transport::Qmp
        };
        let session = Rc::new(RefCell::new(Session::new(
            vmid,
            transport,
            self.connect_timeout_secs,
            Rc::clone(&self.events),
        )));
        self.pending.insert(key, Rc::clone(&session));
        self.order.push(key);
        session
    }

    /// Enqueue `execute`/`arguments` against `vmid`'s QMP (or, if `qga`,
    /// QGA) session, invoking `callback` with the server's response once
    /// `execute` runs the reactor. Multiple calls for the same
    /// `(vmid, qga)` share one session and run FIFO. `timeout_secs`
    /// overrides the default per-command timeout table; `None` uses the
    /// table, `Some(0)` uses the default run timeout (3s).
    pub fn queue_cmd(
        &mut self,
        vmid: u32,
        qga: bool,
        execute: impl Into<String>,
        arguments: serde_json::Map<String, Value>,
        timeout_secs: Option<u64>,
        callback: impl FnOnce(u32, Option<Value>) + 'static,
    ) {
        let session = self.session_for(vmid, qga);
        session.borrow_mut().enqueue(Command::new(
            execute.into(),
            arguments,
            Box::new(callback),
            timeout_secs,
        ));
    }

    /// Queue a single command and, after `execute` runs, return its
    /// response (or the session's captured error). A convenience over
    /// `queue_cmd` + `execute` for the common one-shot case. `timeout`
    /// overrides the default per-command timeout (`None` uses the
    /// table).
    pub fn cmd(
        &mut self,
        vmid: u32,
        qga: bool,
        execute: impl Into<String>,
        arguments: serde_json::Map<String, Value>,
        timeout_secs: Option<u64>,
    ) -> Result<Value, Error> {
        let execute = execute.into();
        if execute.is_empty() {
            return Err(Error::Usage("execute must not be empty".to_string()));
        }
        // Double `Option`: the outer tracks whether the callback fired at
        // all, the inner carries the allow-close `None` response apart
        // from a session that never produced a response at all.
        let result: Rc<RefCell<Option<Option<Value>>>> = Rc::new(RefCell::new(None));
        let result_clone = Rc::clone(&result);
        let execute_for_err = execute.clone();

        self.queue_cmd(vmid, qga, execute, arguments, timeout_secs, move |_vmid, response| {
            *result_clone.borrow_mut() = Some(response);
        });

        let failures = self.execute(NoErr::Silent)?;
        if let Some(response) = result.borrow_mut().take() {
            return Ok(response.unwrap_or(Value::Null));
        }
        match failures.into_iter().find(|f| f.vmid == vmid && f.qga == qga) {
            Some(failure) => Err(Error::Command {
                vmid,
                execute: execute_for_err,
                kind: failure.kind,
            }),
            None => Err(Error::Command {
                vmid,
                execute: execute_for_err,
                kind: ErrorKind::PeerClosed("session closed with no response".to_string()),
            }),
        }
    }

    /// Open every queued session's socket, run them all to completion on
    /// one reactor, and drain the queue. Sessions run independently: one
    /// VM's failure does not stop another's commands.
    ///
    /// Under [`NoErr::Fatal`] any captured failure becomes
    /// `Err(Error::Aggregate(..))`. Under [`NoErr::Silent`] failures are
    /// returned as a list for the caller to inspect.
    pub fn execute(&mut self, policy: NoErr) -> Result<Vec<SessionFailure>, Error> {
        let keys = std::mem::take(&mut self.order);
        let mut sessions: Vec<PendingSession> = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(session) = self.pending.remove(&key) {
                sessions.push(PendingSession { key, session });
            }
        }

        let mut reactor = Reactor::new();
        let mut handles: Vec<(SessionKey, Rc<RefCell<Session>>)> = Vec::with_capacity(sessions.len());

        for pending in sessions {
            let opened = pending.session.borrow_mut().open(self.locator.as_ref());
            match opened {
                Some(stream) => {
                    let handler = Box::new(SessionIo(Rc::clone(&pending.session)));
                    let fd = reactor.add(stream, handler);
                    pending.session.borrow_mut().set_fd(fd);
                    handles.push((pending.key, pending.session));
                }
                None => {
                    // `open` already captured the connect failure on the
                    // session itself; still surface it below.
                    handles.push((pending.key, pending.session));
                }
            }
        }

        let ids = &self.ids;
        reactor.run(|r| {
            for (_, session) in &handles {
                session.borrow_mut().advance(r, ids);
            }
        });

        let mut failures = Vec::new();
        for (key, session) in handles {
            if let Some(kind) = session.borrow_mut().take_error() {
                failures.push(SessionFailure {
                    vmid: key.vmid,
                    qga: key.qga,
                    kind,
                });
            }
        }

        match policy {
            NoErr::Fatal if !failures.is_empty() => {
                let summary = failures
                    .iter()
                    .map(|f| format!("VM {} qmp - {}", f.vmid, f.kind))
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(Error::Aggregate(summary));
            }
            NoErr::LogAndContinue => {
                for f in &failures {
                    warn!(vmid = f.vmid, qga = f.qga, "{}", f.kind);
                }
            }
            NoErr::Fatal | NoErr::Silent => {}
        }

        Ok(failures)
    }
}
