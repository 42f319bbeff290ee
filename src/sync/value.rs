//! Payload values as handed in by producers, and their wire-safe counterparts.
//!
//! [`Value`] is what producers queue: it can carry dates and the [`Value::Absent`]
//! marker. [`WireValue`] is what the remote store accepts: dates become
//! [`Timestamp`]s and absent entries no longer exist. The conversion lives in
//! [`crate::sync::normalize`].

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Key used by the JSON conversion to recognise a date (`{"$date": "<rfc3339>"}`).
pub const DATE_KEY: &str = "$date";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// No value was provided. Dropped from maps during normalization.
    Absent,
    Null,
    Bool(bool),
    Integer(i64),
    Double(f64),
    String(String),
    Date(DateTime<Utc>),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(entries) => entries.get(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_map(&self) -> bool {
        matches!(self, Value::Map(_))
    }

    /// Location of the first `NaN` or infinite double, e.g. `ratio` or
    /// `items[2].price`; `Some("")` when `self` is that double. JSON has no
    /// encoding for these, so they cannot be stored.
    pub fn non_finite_path(&self) -> Option<String> {
        match self {
            Value::Double(d) if !d.is_finite() => Some(String::new()),
            Value::Array(items) => items.iter().enumerate().find_map(|(i, item)| {
                item.non_finite_path()
                    .map(|rest| join_path(format!("[{}]", i), rest))
            }),
            Value::Map(entries) => entries.iter().find_map(|(key, value)| {
                value
                    .non_finite_path()
                    .map(|rest| join_path(key.clone(), rest))
            }),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Absent => "absent",
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Integer(_) => "integer",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Date(_) => "date",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
        }
    }
}

fn join_path(head: String, rest: String) -> String {
    if rest.is_empty() || rest.starts_with('[') {
        head + &rest
    } else {
        format!("{}.{}", head, rest)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Date(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

/// `None` is the absent marker, not `Null`.
impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Absent, Into::into)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Double(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(entries) => {
                if entries.len() == 1
                    && let Some(serde_json::Value::String(raw)) = entries.get(DATE_KEY)
                    && let Ok(parsed) = DateTime::parse_from_rfc3339(raw)
                {
                    return Value::Date(parsed.with_timezone(&Utc));
                }
                Value::Map(
                    entries
                        .into_iter()
                        .map(|(k, v)| (k, Value::from(v)))
                        .collect(),
                )
            }
        }
    }
}

/// The remote store's native timestamp: seconds since the Unix epoch plus
/// a sub-second nanosecond part in `0..1_000_000_000`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: u32,
}

impl Timestamp {
    pub fn from_datetime(dt: &DateTime<Utc>) -> Self {
        Self {
            seconds: dt.timestamp(),
            nanos: dt.timestamp_subsec_nanos(),
        }
    }

    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.seconds, self.nanos).single()
    }
}

pub type WireMap = BTreeMap<String, WireValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum WireValue {
    Null,
    Bool(bool),
    Integer(i64),
    Double(f64),
    String(String),
    Timestamp(Timestamp),
    Array(Vec<WireValue>),
    Map(WireMap),
}

impl WireValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            WireValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Plain JSON rendering for display; timestamps become RFC 3339 strings.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            WireValue::Null => serde_json::Value::Null,
            WireValue::Bool(b) => serde_json::Value::Bool(*b),
            WireValue::Integer(i) => serde_json::Value::from(*i),
            WireValue::Double(d) => serde_json::Value::from(*d),
            WireValue::String(s) => serde_json::Value::String(s.clone()),
            WireValue::Timestamp(ts) => match ts.to_datetime() {
                Some(dt) => serde_json::Value::String(dt.to_rfc3339()),
                None => serde_json::json!({ "seconds": ts.seconds, "nanos": ts.nanos }),
            },
            WireValue::Array(items) => {
                serde_json::Value::Array(items.iter().map(WireValue::to_json).collect())
            }
            WireValue::Map(entries) => serde_json::Value::Object(
                entries.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}
