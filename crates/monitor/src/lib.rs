//! `qmpmux` — a single-threaded, multiplexed QMP/QGA client
//!
//! One [`Client`] can drive commands against many VMs' QMP and QGA
//! sockets concurrently without threads: [`Client::execute`] opens
//! every session queued since the last call, runs them all to
//! completion on one internal reactor, and returns. Each `(vmid, qga)`
//! pair gets its own session with its own command queue; sessions never
//! share state, so one VM's protocol error never blocks another's
//! commands.
//!
//! ```no_run
//! use qmpmux::{Client, DefaultSocketLocator, NoErr};
//!
//! let mut client = Client::new(DefaultSocketLocator);
//! let status = client.cmd(100, false, "query-status", Default::default(), None)?;
//! println!("{status}");
//! # Ok::<(), qmpmux::Error>(())
//! ```

mod client;
mod error;
mod framer;
mod ids;
mod locator;
mod reactor;
mod sendfd;
mod session;

pub use client::{Client, NoErr, SessionFailure};
pub use error::{Error, ErrorKind};
pub use locator::{DefaultSocketLocator, SocketLocator};
