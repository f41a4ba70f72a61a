//! Per-process-unique command identifier minting
//!
//! Two monotonic counters, one per transport. The source repository
//! scopes these to the whole process; per the design notes this is
//! scoped to a `Client` instead so two `Client`s in one process never
//! collide, while keeping the wire form (`"<pid>:<n>"` / `<pid>0<n>`)
//! unchanged.

use std::cell::Cell;

pub(crate) struct IdGenerator {
    pid: u32,
    qmp: Cell<u64>,
    qga: Cell<u64>,
}

impl IdGenerator {
    pub(crate) fn new() -> Self {
        Self::with_pid(std::process::id())
    }

    fn with_pid(pid: u32) -> Self {
        Self {
            pid,
            qmp: Cell::new(0),
            qga: Cell::new(0),
        }
    }

    /// Mint the next QMP id: `"<pid>:<n>"`.
    pub(crate) fn next_qmp(&self) -> String {
        let n = self.qmp.get() + 1;
        self.qmp.set(n);
        format!("{}:{}", self.pid, n)
    }

    /// Mint the next QGA id. Rendered as `<pid>0<n>` and parsed back as
    /// an integer, because QGA's `guest-sync` `return` field is typed
    /// as an integer on the wire.
    pub(crate) fn next_qga(&self) -> u64 {
        let n = self.qga.get() + 1;
        self.qga.set(n);
        format!("{}0{}", self.pid, n)
            .parse()
            .expect("pid and counter digits always form a valid u64")
    }
}
