//! Wire framing for QMP and QGA
//!
//! Pure byte-buffer parsing: no I/O. Each `decode_*` function consumes
//! the longest available complete frame from the front of `buf`,
//! leaving a trailing partial frame untouched for the next call.

use crate::error::ErrorKind;
use serde_json::Value;

/// A decoded QMP line.
pub(crate) enum QmpFrame {
    /// The `{"QMP": {...}}` banner sent on connect.
    Greeting,
    /// `{"event": ..., "data": ..., "timestamp": ...}`.
    Event(Value),
    /// `{"return": ...}` / `{"error": ...}`, always carrying `id`.
    Response(Value),
}

impl QmpFrame {
    fn classify(value: Value) -> Self {
        if value.get("QMP").is_some() {
            QmpFrame::Greeting
        } else if value.get("event").is_some() {
            QmpFrame::Event(value)
        } else {
            QmpFrame::Response(value)
        }
    }
}

/// Consume one newline-delimited JSON object (`<object>\r?\n`) from the
/// front of `buf`, skipping blank lines. Returns `Ok(None)` when `buf`
/// holds no complete line yet.
pub(crate) fn decode_qmp(buf: &mut Vec<u8>) -> Result<Option<QmpFrame>, ErrorKind> {
    loop {
        let Some(nl) = buf.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        let mut line_end = nl;
        if line_end > 0 && buf[line_end - 1] == b'\r' {
            line_end -= 1;
        }
        let line = buf[..line_end].to_vec();
        buf.drain(..=nl);

        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let value: Value = serde_json::from_slice(&line)
            .map_err(|e| ErrorKind::Framing(format!("malformed frame: {e}")))?;
        return Ok(Some(QmpFrame::classify(value)));
    }
}

/// Consume the two newline-terminated JSON objects that make up a QGA
/// exchange: the sync-probe acknowledgement (`return` echoes the
/// caller-minted sync id) and the real response. When `require_sentinel`
/// is set, the pair must be preceded by a `0xFF` byte (the agent's usual
/// framing); some older agents never emit it, so callers talking to one
/// of those pass `false` and the pair is read directly off the front of
/// `buf`. Returns `Ok(None)` while the sentinel (if required) or either
/// object is still incomplete.
pub(crate) fn decode_qga(buf: &mut Vec<u8>, require_sentinel: bool) -> Result<Option<(u64, Value)>, ErrorKind> {
    let start = if require_sentinel {
        match buf.iter().position(|&b| b == 0xFF) {
            Some(pos) => pos + 1,
            None => return Ok(None),
        }
    } else {
        0
    };

    let rest = &buf[start..];
    let Some(nl1) = rest.iter().position(|&b| b == b'\n') else {
        return Ok(None);
    };
    let sync_bytes = rest[..nl1].to_vec();

    let after_sync = &rest[nl1 + 1..];
    let Some(nl2) = after_sync.iter().position(|&b| b == b'\n') else {
        return Ok(None);
    };
    let response_bytes = after_sync[..nl2].to_vec();

    let total = start + nl1 + 1 + nl2 + 1;

    let sync: Value = serde_json::from_slice(&sync_bytes)
        .map_err(|e| ErrorKind::Framing(format!("malformed frame: {e}")))?;
    let response: Value = serde_json::from_slice(&response_bytes)
        .map_err(|e| ErrorKind::Framing(format!("malformed frame: {e}")))?;

    let sync_id = sync
        .get("return")
        .and_then(Value::as_u64)
        .ok_or_else(|| ErrorKind::Framing("response is not complete".to_string()))?;

    buf.drain(..total);
    Ok(Some((sync_id, response)))
}

/// Decode a single newline-terminated JSON object from residual input,
/// requiring the `0xFF` sentinel directly before it. Used only to
/// reconstruct an allow-close command's response from whatever made it
/// onto the wire before the peer hung up.
pub(crate) fn decode_qga_single(buf: &[u8]) -> Option<Value> {
    let start = buf.iter().position(|&b| b == 0xFF)?;
    decode_one_object(&buf[start + 1..])
}

/// As [`decode_qga_single`], but does not require the `0xFF` sentinel.
/// Exposed for agents predating the sentinel's introduction.
pub(crate) fn decode_qga_single_no_sentinel(buf: &[u8]) -> Option<Value> {
    decode_one_object(buf)
}

fn decode_one_object(buf: &[u8]) -> Option<Value> {
    let nl = buf.iter().position(|&b| b == b'\n')?;
    serde_json::from_slice(&buf[..nl]).ok()
}
