//! Queued mutation records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::fmt;

/// Kind of user mutation; determines drain priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    CriticalAlert,
    Booking,
    Message,
    Location,
    Other,
}

impl OperationKind {
    /// Fixed priority; higher drains first
    pub fn priority(&self) -> u8 {
        match self {
            OperationKind::CriticalAlert => 4,
            OperationKind::Booking => 3,
            OperationKind::Message => 2,
            OperationKind::Location => 1,
            OperationKind::Other => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::CriticalAlert => "critical_alert",
            OperationKind::Booking => "booking",
            OperationKind::Message => "message",
            OperationKind::Location => "location",
            OperationKind::Other => "other",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationAction {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InFlight,
    Failed,
}

/// A durable, not-yet-confirmed mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    /// Stable identifier, also used as the idempotency key
    pub id: String,
    pub kind: OperationKind,
    /// Target resource, e.g. a table or endpoint name
    pub resource: String,
    pub action: OperationAction,
    pub payload: serde_json::Value,
    pub priority: u8,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Backoff gate; the record is skipped by drains until this passes
    pub next_eligible_at: Option<DateTime<Utc>>,
    /// Insertion sequence, breaks ties between equal timestamps
    pub seq: u64,
    pub status: OperationStatus,
    pub last_error: Option<String>,
}

impl QueuedOperation {
    pub fn new(
        kind: OperationKind,
        resource: impl Into<String>,
        action: OperationAction,
        payload: serde_json::Value,
        created_at: DateTime<Utc>,
        seq: u64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            resource: resource.into(),
            action,
            payload,
            priority: kind.priority(),
            attempt_count: 0,
            created_at,
            last_attempt_at: None,
            next_eligible_at: None,
            seq,
            status: OperationStatus::Pending,
            last_error: None,
        }
    }

    pub fn idempotency_key(&self) -> &str {
        &self.id
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == OperationStatus::Pending
            && self.next_eligible_at.map_or(true, |at| at <= now)
    }

    /// Drain order: priority descending, then creation time, then sequence
    pub fn drain_order(&self, other: &Self) -> Ordering {
        let key = |op: &Self| (Reverse(op.priority), op.created_at, op.seq);
        key(self).cmp(&key(other))
    }
}
