//! Payload normalization: producer-shaped [`Value`] trees into [`WireValue`] trees.
//!
//! - Scalars pass through unchanged.
//! - Dates become [`Timestamp`]s.
//! - Map entries whose value is [`Value::Absent`] are omitted entirely (a missing
//!   key and a key set to null mean different things to a partial update).
//! - Arrays keep their length; an absent element becomes `Null`.
//!
//! The function is pure and total. `Value` owns its children, so the input is
//! always acyclic and recursion always terminates.

use crate::sync::value::{Timestamp, Value, WireMap, WireValue};
use std::collections::BTreeMap;

/// Normalize a value. Returns `None` only when the value itself is absent.
pub fn normalize(value: &Value) -> Option<WireValue> {
    let wire = match value {
        Value::Absent => return None,
        Value::Null => WireValue::Null,
        Value::Bool(b) => WireValue::Bool(*b),
        Value::Integer(i) => WireValue::Integer(*i),
        Value::Double(d) => WireValue::Double(*d),
        Value::String(s) => WireValue::String(s.clone()),
        Value::Date(dt) => WireValue::Timestamp(Timestamp::from_datetime(dt)),
        Value::Array(items) => WireValue::Array(
            items
                .iter()
                .map(|item| normalize(item).unwrap_or(WireValue::Null))
                .collect(),
        ),
        Value::Map(entries) => WireValue::Map(normalize_entries(entries)),
    };
    Some(wire)
}

/// Normalize the entries of a map, dropping absent ones.
pub fn normalize_entries(entries: &BTreeMap<String, Value>) -> WireMap {
    entries
        .iter()
        .filter_map(|(key, value)| normalize(value).map(|wire| (key.clone(), wire)))
        .collect()
}

/// Normalize a document payload. Non-map payloads yield `None`.
pub fn normalize_document(payload: &Value) -> Option<WireMap> {
    match payload {
        Value::Map(entries) => Some(normalize_entries(entries)),
        _ => None,
    }
}
