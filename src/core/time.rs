//! Clock readings, ids and the JSON envelope printed by every CLI command.

use serde_json::Value as JsonValue;
use std::time::{SystemTime, UNIX_EPOCH};
use ulid::Ulid;

pub const ENVELOPE_VERSION: &str = "1.0.0";

fn since_epoch() -> std::time::Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

pub fn now_epoch_secs() -> u64 {
    since_epoch().as_secs()
}

/// Wall-clock milliseconds since the unix epoch.
pub fn now_epoch_millis() -> u64 {
    since_epoch().as_millis() as u64
}

/// Seconds with a `Z` suffix, e.g. `1771220592Z`. Used for every persisted timestamp.
pub fn now_epoch_z() -> String {
    format!("{}Z", now_epoch_secs())
}

pub fn new_event_id() -> String {
    Ulid::new().to_string()
}

/// Prefixed ULID, e.g. `DEC_01J...`.
pub fn prefixed_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// `{envelope_version, ts, event_id, cmd, status, result}`.
pub fn command_envelope(cmd: &str, status: &str, result: JsonValue) -> JsonValue {
    serde_json::json!({
        "envelope_version": ENVELOPE_VERSION,
        "ts": now_epoch_z(),
        "event_id": new_event_id(),
        "cmd": cmd,
        "status": status,
        "result": result,
    })
}
