//! The task record: the one entity this system persists.
//!
//! Lifecycle: created by a submission, observed through the change feed, and
//! never mutated or deleted afterwards by this system. `processed` starts out
//! false and nothing here flips it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::TaskId;

/// Caller-supplied task description.
///
/// Opaque to the system; the only rule is that it is non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskPayload(String);

impl TaskPayload {
    /// Validate a raw payload.
    ///
    /// Whitespace-only text is accepted: it is still a non-empty string.
    pub fn parse(raw: impl Into<String>) -> DomainResult<Self> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(DomainError::validation("task payload must not be empty"));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl core::fmt::Display for TaskPayload {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TaskPayload {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<TaskPayload> for String {
    fn from(value: TaskPayload) -> Self {
        value.0
    }
}

/// Intent to insert one task. The storage engine assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub payload: TaskPayload,
}

impl NewTask {
    pub fn new(payload: TaskPayload) -> Self {
        Self { payload }
    }

    /// Validate and wrap a raw payload in one step.
    pub fn from_raw(raw: impl Into<String>) -> DomainResult<Self> {
        Ok(Self::new(TaskPayload::parse(raw)?))
    }
}

/// A persisted task row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub payload: TaskPayload,
    pub processed: bool,
    /// Storage-engine timestamp. Informational only.
    pub created_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// Build the record for a freshly inserted row (`processed` is always false).
    pub fn inserted(id: TaskId, task: NewTask, created_at: Option<DateTime<Utc>>) -> Self {
        Self {
            id,
            payload: task.payload,
            processed: false,
            created_at,
        }
    }
}
