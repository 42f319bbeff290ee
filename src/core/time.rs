//! Shared timestamp/event helpers for command envelopes and persisted rows.

use chrono::{SecondsFormat, Utc};
use serde_json::Value as JsonValue;
use std::path::Path;
use ulid::Ulid;

pub const ENVELOPE_VERSION: &str = "1.0.0";

/// Current UTC time as RFC 3339 with millisecond precision
/// (e.g. `2026-10-17T09:30:00.123Z`).
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn new_event_id() -> String {
    Ulid::new().to_string()
}

/// JSON envelope printed by every CLI command. Object bodies are merged
/// alongside the header; header keys are never overwritten. Any other body is
/// nested under `result`.
pub fn command_envelope(cmd: &str, status: &str, data_dir: &Path, body: JsonValue) -> JsonValue {
    let mut envelope = serde_json::Map::new();
    envelope.insert("envelope_version".into(), ENVELOPE_VERSION.into());
    envelope.insert("ts".into(), now_rfc3339().into());
    envelope.insert("event_id".into(), new_event_id().into());
    envelope.insert("cmd".into(), cmd.into());
    envelope.insert("status".into(), status.into());
    envelope.insert("data_dir".into(), data_dir.display().to_string().into());
    match body {
        JsonValue::Object(fields) => {
            for (k, v) in fields {
                envelope.entry(k).or_insert(v);
            }
        }
        JsonValue::Null => {}
        other => {
            envelope.insert("result".into(), other);
        }
    }
    JsonValue::Object(envelope)
}
