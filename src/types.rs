//! Core types for the realtime layer.

use crate::error::{RealtimeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of one registered transport connection.
///
/// Assigned by the registry, starting at 1. Never reused within a process.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical user identity, resolved by the auth layer before admission.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    /// Wrap an identity as resolved by the auth layer.
    pub fn new(id: impl Into<String>) -> Self {
        UserId(id.into())
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        UserId(id.to_string())
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        UserId(id.to_string())
    }
}

/// Key partitioning the pub/sub space.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Topic(pub String);

impl Topic {
    /// Arbitrary topic name.
    pub fn new(name: impl Into<String>) -> Self {
        Topic(name.into())
    }

    /// Issue creation events.
    pub fn issue_created() -> Self {
        EventKind::IssueCreated.topic()
    }

    /// Issue update events, across all issues.
    pub fn issue_updated() -> Self {
        EventKind::IssueUpdated.topic()
    }

    /// Issue deletion events.
    pub fn issue_deleted() -> Self {
        EventKind::IssueDeleted.topic()
    }

    /// Login events.
    pub fn user_logged_in() -> Self {
        EventKind::UserLoggedIn.topic()
    }

    /// Logout events.
    pub fn user_logged_out() -> Self {
        EventKind::UserLoggedOut.topic()
    }

    /// Entity-scoped topic for status changes of one issue.
    pub fn issue_status_changed(issue_id: i64) -> Self {
        Topic(format!("issue_status_changed_{}", issue_id))
    }

    /// Topic name as it appears in logs.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", self.0)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        Topic(name.to_string())
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Kind of domain event carried by an envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    IssueCreated,
    IssueUpdated,
    IssueDeleted,
    UserLoggedIn,
    UserLoggedOut,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::IssueCreated,
        EventKind::IssueUpdated,
        EventKind::IssueDeleted,
        EventKind::UserLoggedIn,
        EventKind::UserLoggedOut,
    ];

    /// Wire name, used as the message `type` and as the well-known topic.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::IssueCreated => "issue_created",
            EventKind::IssueUpdated => "issue_updated",
            EventKind::IssueDeleted => "issue_deleted",
            EventKind::UserLoggedIn => "user_logged_in",
            EventKind::UserLoggedOut => "user_logged_out",
        }
    }

    /// The well-known topic this kind is published on.
    pub fn topic(&self) -> Topic {
        Topic(self.as_str().to_string())
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self> {
        EventKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| RealtimeError::UnknownEventKind(s.to_string()))
    }
}

/// One published event. Immutable once built; fan-out shares it behind an `Arc`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: serde_json::Value,
    pub timestamp: Timestamp,
}

impl Envelope {
    /// Stamp `data` with the current time.
    pub fn new(kind: EventKind, data: serde_json::Value) -> Self {
        Self {
            kind,
            data,
            timestamp: Timestamp::now(),
        }
    }

    /// Build an envelope from any serializable payload.
    pub fn from_payload<T: Serialize>(kind: EventKind, payload: &T) -> Result<Self> {
        Ok(Self::new(kind, serde_json::to_value(payload)?))
    }

    /// Wire form: `{"type": ..., "data": ..., "timestamp": ...}`.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Messages the endpoint layer sends outside the event stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Sent once, right after admission.
    ConnectionEstablished {
        message: String,
        connection_id: String,
    },
    /// Reply to a client `ping`, echoing its timestamp.
    Pong { timestamp: Option<serde_json::Value> },
    Error { message: String },
}

impl ControlMessage {
    /// Serialize to the text frame sent to the client.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Tag attached to an issue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TagPayload {
    pub id: i64,
    pub name: String,
    pub color: Option<String>,
}

/// Issue snapshot carried by created/updated events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IssuePayload {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub status: String,
    pub priority: String,
    pub assignee_id: Option<i64>,
    pub reporter_id: i64,
    /// ISO-8601, formatted by the persistence layer.
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub tags: Vec<TagPayload>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IssueDeletedPayload {
    pub id: i64,
    pub deleted_by: i64,
    pub timestamp: String,
}

/// Login/logout payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserSessionPayload {
    pub user_id: i64,
    pub username: String,
    pub timestamp: String,
}
