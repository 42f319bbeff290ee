//! Queued mutation records.
//!
//! A [`Mutation`] is a tagged variant, so `Update` and `Delete` always carry a
//! document id. [`QueuedMutation`] adds the addressing that is independent of
//! the action: collection path and optional namespace override.

use crate::core::error::SyncError;
use crate::sync::value::Value;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use ulid::Ulid;

/// Document-store path segments are capped at 1500 bytes.
const MAX_SEGMENT_BYTES: usize = 1500;

static RESERVED_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^__.*__$").expect("static regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Add,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Add => "add",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(Action::Add),
            "update" => Ok(Action::Update),
            "delete" => Ok(Action::Delete),
            other => Err(SyncError::InvalidMutation(format!(
                "unknown action '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Mutation {
    /// Create or overwrite a document. Without a `doc_id` the identity is
    /// resolved when the record is queued.
    Add {
        doc_id: Option<String>,
        payload: Value,
    },
    /// Merge the payload's top-level keys into an existing document.
    Update { doc_id: String, payload: Value },
    Delete { doc_id: String },
}

impl Mutation {
    pub fn action(&self) -> Action {
        match self {
            Mutation::Add { .. } => Action::Add,
            Mutation::Update { .. } => Action::Update,
            Mutation::Delete { .. } => Action::Delete,
        }
    }

    pub fn doc_id(&self) -> Option<&str> {
        match self {
            Mutation::Add { doc_id, .. } => doc_id.as_deref(),
            Mutation::Update { doc_id, .. } | Mutation::Delete { doc_id } => Some(doc_id),
        }
    }

    pub fn payload(&self) -> Option<&Value> {
        match self {
            Mutation::Add { payload, .. } | Mutation::Update { payload, .. } => Some(payload),
            Mutation::Delete { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMutation {
    /// Assigned by the log on enqueue.
    pub id: Option<i64>,
    /// Collection path relative to the owning user's namespace, e.g. `customers`
    /// or `customers/c1/equipment`.
    pub collection_path: String,
    #[serde(flatten)]
    pub mutation: Mutation,
    /// Overrides the namespace supplied at flush time.
    pub target_user_id: Option<String>,
}

impl QueuedMutation {
    pub fn new(collection_path: impl Into<String>, mutation: Mutation) -> Self {
        Self {
            id: None,
            collection_path: collection_path.into(),
            mutation,
            target_user_id: None,
        }
    }

    pub fn add(collection_path: impl Into<String>, payload: Value) -> Self {
        Self::new(
            collection_path,
            Mutation::Add {
                doc_id: None,
                payload,
            },
        )
    }

    pub fn add_with_id(
        collection_path: impl Into<String>,
        doc_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self::new(
            collection_path,
            Mutation::Add {
                doc_id: Some(doc_id.into()),
                payload,
            },
        )
    }

    pub fn update(
        collection_path: impl Into<String>,
        doc_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self::new(
            collection_path,
            Mutation::Update {
                doc_id: doc_id.into(),
                payload,
            },
        )
    }

    pub fn delete(collection_path: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Self::new(
            collection_path,
            Mutation::Delete {
                doc_id: doc_id.into(),
            },
        )
    }

    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.target_user_id = Some(user_id.into());
        self
    }

    pub fn action(&self) -> Action {
        self.mutation.action()
    }

    pub fn doc_id(&self) -> Option<&str> {
        self.mutation.doc_id()
    }

    /// Structural checks that must hold before a record may be queued.
    pub fn validate(&self) -> Result<(), SyncError> {
        validate_collection_path(&self.collection_path)?;
        if let Some(user) = &self.target_user_id {
            validate_segment("target_user_id", user)?;
        }
        if let Some(doc_id) = self.mutation.doc_id() {
            validate_segment("doc_id", doc_id)?;
        }
        let Some(payload) = self.mutation.payload() else {
            return Ok(());
        };
        if !payload.is_map() {
            return Err(SyncError::InvalidMutation(format!(
                "{} payload must be a map, got {}",
                self.action(),
                payload.kind()
            )));
        }
        // Would be persisted as null and fail to decode on the next flush.
        if let Some(field) = payload.non_finite_path() {
            return Err(SyncError::InvalidMutation(format!(
                "{} payload field '{}' is not a finite number",
                self.action(),
                field
            )));
        }
        Ok(())
    }

    /// Give an `Add` without an explicit id a stable identity: the payload's
    /// string `id` field if usable, otherwise a fresh ULID. Replaying the record
    /// then always targets the same document.
    pub fn resolve_identity(&mut self) {
        if let Mutation::Add { doc_id, payload } = &mut self.mutation
            && doc_id.is_none()
        {
            let from_payload = payload
                .get("id")
                .and_then(Value::as_str)
                .filter(|id| validate_segment("id", id).is_ok())
                .map(str::to_string);
            *doc_id = Some(from_payload.unwrap_or_else(|| Ulid::new().to_string()));
        }
    }

    pub(crate) fn encode(&self) -> Result<EncodedMutation, SyncError> {
        let payload = self
            .mutation
            .payload()
            .map(serde_json::to_string)
            .transpose()?;
        let action = self.action().as_str();
        let doc_id = self.doc_id().map(str::to_string);
        let content_hash = content_hash(
            action,
            &self.collection_path,
            doc_id.as_deref(),
            payload.as_deref(),
            self.target_user_id.as_deref(),
        );
        Ok(EncodedMutation {
            action,
            collection_path: self.collection_path.clone(),
            doc_id,
            payload,
            target_user_id: self.target_user_id.clone(),
            content_hash,
        })
    }

    /// Rebuild a record from its stored row, rejecting anything that could be
    /// applied to the wrong document.
    pub(crate) fn decode(row: StoredMutation) -> Result<QueuedMutation, SyncError> {
        let expected = content_hash(
            &row.action,
            &row.collection_path,
            row.doc_id.as_deref(),
            row.payload.as_deref(),
            row.target_user_id.as_deref(),
        );
        if expected != row.content_hash {
            return Err(SyncError::InvalidMutation(format!(
                "record {} failed its content hash check",
                row.id
            )));
        }

        let action: Action = row.action.parse()?;
        let payload = row
            .payload
            .as_deref()
            .map(serde_json::from_str::<Value>)
            .transpose()?;
        let missing = |what: &str| {
            SyncError::InvalidMutation(format!("{} record {} has no {}", action, row.id, what))
        };

        let mutation = match action {
            Action::Add => {
                let payload = payload.ok_or_else(|| missing("payload"))?;
                // Rows written without an identity get one derived from the row
                // itself, so every replay still lands on the same document.
                let doc_id = row.doc_id.or_else(|| {
                    payload
                        .get("id")
                        .and_then(Value::as_str)
                        .filter(|id| validate_segment("id", id).is_ok())
                        .map(str::to_string)
                        .or_else(|| Some(format!("q{}-{}", row.id, &row.content_hash[..16])))
                });
                Mutation::Add { doc_id, payload }
            }
            Action::Update => Mutation::Update {
                doc_id: row.doc_id.ok_or_else(|| missing("doc_id"))?,
                payload: payload.ok_or_else(|| missing("payload"))?,
            },
            Action::Delete => Mutation::Delete {
                doc_id: row.doc_id.ok_or_else(|| missing("doc_id"))?,
            },
        };

        let record = QueuedMutation {
            id: Some(row.id),
            collection_path: row.collection_path,
            mutation,
            target_user_id: row.target_user_id,
        };
        record.validate()?;
        Ok(record)
    }
}

/// Column values for one `mutations` row.
#[derive(Debug)]
pub(crate) struct EncodedMutation {
    pub action: &'static str,
    pub collection_path: String,
    pub doc_id: Option<String>,
    pub payload: Option<String>,
    pub target_user_id: Option<String>,
    pub content_hash: String,
}

/// A `mutations` row as read back from storage.
#[derive(Debug)]
pub(crate) struct StoredMutation {
    pub id: i64,
    pub action: String,
    pub collection_path: String,
    pub doc_id: Option<String>,
    pub payload: Option<String>,
    pub target_user_id: Option<String>,
    pub content_hash: String,
}

/// SHA-256 over length-prefixed fields, so no two field splits collide.
pub fn content_hash(
    action: &str,
    collection_path: &str,
    doc_id: Option<&str>,
    payload: Option<&str>,
    target_user_id: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    for field in [
        Some(action),
        Some(collection_path),
        doc_id,
        payload,
        target_user_id,
    ] {
        match field {
            Some(text) => {
                hasher.update((text.len() as u64).to_le_bytes());
                hasher.update(text.as_bytes());
            }
            None => hasher.update(u64::MAX.to_le_bytes()),
        }
    }
    format!("{:x}", hasher.finalize())
}

/// A single path segment: non-empty, no `/`, not `.`/`..`, not `__reserved__`.
pub fn validate_segment(what: &str, segment: &str) -> Result<(), SyncError> {
    let problem = if segment.is_empty() {
        Some("is empty")
    } else if segment.contains('/') {
        Some("contains '/'")
    } else if segment == "." || segment == ".." {
        Some("is a relative path component")
    } else if RESERVED_SEGMENT.is_match(segment) {
        Some("uses the reserved __name__ form")
    } else if segment.len() > MAX_SEGMENT_BYTES {
        Some("is longer than 1500 bytes")
    } else {
        None
    };
    match problem {
        Some(reason) => Err(SyncError::InvalidMutation(format!(
            "{} '{}' {}",
            what, segment, reason
        ))),
        None => Ok(()),
    }
}

/// A collection path has an odd number of segments (`customers`,
/// `customers/c1/equipment`); an even count would name a document.
pub fn validate_collection_path(path: &str) -> Result<(), SyncError> {
    let segments: Vec<&str> = path.split('/').collect();
    for segment in &segments {
        validate_segment("collection_path segment", segment)?;
    }
    if segments.len() % 2 == 0 {
        return Err(SyncError::InvalidMutation(format!(
            "collection_path '{}' names a document, not a collection",
            path
        )));
    }
    Ok(())
}
