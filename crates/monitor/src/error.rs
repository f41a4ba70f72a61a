//! Error taxonomy for the QMP/QGA client
//!
//! Per the source repository's design notes: replace sticky
//! concatenated error strings with a tagged kind, and let the
//! presentation layer (here, `Error`'s `Display`) format them.

use std::fmt;

/// A session-fatal error, sticky on the `Session` that captured it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The socket could not be reached, or the connect retry loop ran
    /// past its deadline.
    Connect(String),
    /// A `write`/`sendmsg` call on the session's socket failed.
    Write(String),
    /// Malformed JSON, an incomplete QGA two-object frame, or an id
    /// mismatch.
    Framing(String),
    /// The peer returned `error.desc` for a dispatched command.
    ProtocolRefused(String),
    /// The session's reactor timeout fired before a response arrived.
    Timeout,
    /// The peer closed the connection.
    PeerClosed(String),
    /// A caller usage mistake (e.g. an empty `execute`).
    Usage(String),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Connect(msg) => write!(f, "{msg}"),
            ErrorKind::Write(msg) => write!(f, "{msg}"),
            ErrorKind::Framing(msg) => write!(f, "{msg}"),
            ErrorKind::ProtocolRefused(msg) => write!(f, "{msg}"),
            ErrorKind::Timeout => write!(f, "got timeout"),
            ErrorKind::PeerClosed(msg) => write!(f, "{msg}"),
            ErrorKind::Usage(msg) => write!(f, "{msg}"),
        }
    }
}

/// Errors raised by [`crate::Client`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Raised by `cmd` when its VM's session captured an error. The
    /// composed message always reads "... qmp command ..." even for a
    /// QGA session, matching the source repository's own literal
    /// wording (it never distinguished the two transports here).
    #[error("VM {vmid} qmp command '{execute}' failed - {kind}")]
    Command {
        vmid: u32,
        execute: String,
        kind: ErrorKind,
    },

    /// Raised by `execute` under `NoErr::Fatal` when one or more
    /// sessions captured an error; concatenates all of them.
    #[error("{0}")]
    Aggregate(String),

    /// A caller usage mistake not tied to any one session.
    #[error("{0}")]
    Usage(String),
}
