//! Event feed wire types and mirror record types.
//!
//! The remote feed delivers [`FeedEvent`]s in pages ([`EventPage`]) linked by
//! an opaque `after` cursor. Each applied event leaves an [`EventRecord`]
//! behind (the dedup key space), and user lifecycle events mutate the
//! [`UserRecord`] mirror.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Upstream type string for user creation.
pub const USER_CREATED: &str = "user.created";
/// Upstream type string for user updates.
pub const USER_UPDATED: &str = "user.updated";
/// Upstream type string for user deletion.
pub const USER_DELETED: &str = "user.deleted";

/// Event types always requested from the feed.
pub const DEFAULT_EVENT_TYPES: [&str; 3] = [USER_CREATED, USER_UPDATED, USER_DELETED];

/// Build the feed's type filter: the fixed allow-list followed by any extra
/// caller-supplied types, without duplicates and in first-seen order.
pub fn event_type_filter(extra: &[String]) -> Vec<String> {
    let mut types: Vec<String> = DEFAULT_EVENT_TYPES.iter().map(|t| t.to_string()).collect();
    for t in extra {
        let t = t.trim();
        if !t.is_empty() && !types.iter().any(|existing| existing == t) {
            types.push(t.to_string());
        }
    }
    types
}

/// The closed set of event kinds the applier acts on.
///
/// Anything else is carried through as [`EventKind::Other`] so new upstream
/// types are recorded and handed to the post-event handler without touching
/// the mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    UserCreated,
    UserUpdated,
    UserDeleted,
    Other(String),
}

impl EventKind {
    pub fn parse(event_type: &str) -> Self {
        match event_type {
            USER_CREATED => Self::UserCreated,
            USER_UPDATED => Self::UserUpdated,
            USER_DELETED => Self::UserDeleted,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::UserCreated => USER_CREATED,
            Self::UserUpdated => USER_UPDATED,
            Self::UserDeleted => USER_DELETED,
            Self::Other(other) => other,
        }
    }
}

/// One event as delivered by the remote feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEvent {
    /// Upstream event id; the dedup key.
    pub id: String,

    /// Event type, e.g. `user.updated`. The feed names this field `event`;
    /// `type` is accepted as well.
    #[serde(rename = "event", alias = "type")]
    pub event_type: String,

    /// Upstream creation time (opaque, RFC 3339 in practice).
    #[serde(default)]
    pub created_at: String,

    /// Event payload. For user events this is the full user object.
    #[serde(default)]
    pub data: Value,
}

impl FeedEvent {
    pub fn kind(&self) -> EventKind {
        EventKind::parse(&self.event_type)
    }

    /// The `updated_at` carried by the payload, if any.
    pub fn data_updated_at(&self) -> Option<&str> {
        self.data.get("updated_at").and_then(Value::as_str)
    }

    /// The user id carried by the payload, if any.
    pub fn data_id(&self) -> Option<&str> {
        self.data.get("id").and_then(Value::as_str)
    }
}

/// Pagination metadata returned with each page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListMetadata {
    /// Cursor for the next page, `None` when the feed is drained.
    #[serde(default)]
    pub after: Option<String>,
}

/// One page of the remote feed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPage {
    #[serde(default)]
    pub data: Vec<FeedEvent>,
    #[serde(default)]
    pub list_metadata: ListMetadata,
}

impl EventPage {
    /// Continuation token for the next page.
    pub fn next_cursor(&self) -> Option<&str> {
        self.list_metadata.after.as_deref().filter(|c| !c.is_empty())
    }
}

/// Parameters for a single `list_events` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListEventsRequest {
    /// Event types to include.
    pub event_types: Vec<String>,
    /// Resume strictly after this cursor.
    pub after: Option<String>,
    /// Lower time bound (RFC 3339), only used when no cursor exists yet.
    pub range_start: Option<String>,
}

/// Durable record of an applied event.
///
/// Written exactly once, the first time an upstream event id is processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: String,
    pub event_type: String,
    /// The payload's `updated_at` at the time the event was recorded.
    pub recorded_updated_at: Option<String>,
    /// Local insertion time in microseconds since the Unix epoch; strictly
    /// increasing within one store.
    pub creation_time: u64,
}

/// Reconciliation watermark.
///
/// Every event whose `creation_time` is below `creation_time` is known to be
/// present in the event store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub event_id: String,
    pub creation_time: u64,
}

/// A handler delivery that has not succeeded yet.
///
/// Queued in the same unit of work that records the event and removed once
/// the handler returns `Ok`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingHandler {
    pub event: FeedEvent,
    /// Creation time of the event's record; retries run in this order.
    pub creation_time: u64,
}

/// Local mirror of an upstream user.
///
/// Fields the pipeline does not know about are preserved in `extra` so a
/// field-level patch never drops upstream data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email_verified: Option<bool>,
    #[serde(default)]
    pub profile_picture_url: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    /// Upstream last-modified timestamp; the last-writer-wins key.
    pub updated_at: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserRecord {
    /// Build a record from a user event payload.
    pub fn from_event_data(event_type: &str, data: &Value) -> Result<Self> {
        let object = payload_object(event_type, data)?;
        match object.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => {}
            _ => return Err(invalid(event_type, "payload has no user id")),
        }
        serde_json::from_value(data.clone()).map_err(|e| invalid(event_type, e.to_string()))
    }

    /// Apply every top-level field present in `data` on top of this record.
    ///
    /// The record's `id` is never rewritten.
    pub fn patched(&self, event_type: &str, data: &Value) -> Result<Self> {
        let patch = payload_object(event_type, data)?;
        let mut merged = serde_json::to_value(self)?;
        let Some(target) = merged.as_object_mut() else {
            return Err(Error::InvalidField {
                field: "id",
                reason: "user record did not serialize to an object".to_string(),
            });
        };
        for (key, value) in patch {
            if key != "id" {
                target.insert(key.clone(), value.clone());
            }
        }
        serde_json::from_value(merged).map_err(|e| invalid(event_type, e.to_string()))
    }

    /// Whether an incoming change stamped `incoming_updated_at` is stale
    /// relative to this record (equal timestamps count as stale).
    pub fn supersedes(&self, incoming_updated_at: &str) -> bool {
        self.updated_at.as_str() >= incoming_updated_at
    }
}

fn payload_object<'a>(event_type: &str, data: &'a Value) -> Result<&'a Map<String, Value>> {
    data.as_object()
        .ok_or_else(|| invalid(event_type, "payload is not an object"))
}

fn invalid(event_type: &str, reason: impl Into<String>) -> Error {
    Error::InvalidEventData {
        event_type: event_type.to_string(),
        reason: reason.into(),
    }
}
