//! Row-change notifications for the task table.
//!
//! A change batch is what the storage engine's change tracking hands to the
//! observer: one or more changed rows, in change-sequence order. Two wire
//! shapes are accepted:
//!
//! - snake_case, as emitted by the Postgres trigger
//!   (`[{"operation":"insert","item":{"id":1,"payload":"x","processed":false,...}}]`)
//! - PascalCase with numeric operations, as emitted by SQL trigger bindings
//!   (`[{"Operation":0,"Item":{"Id":1,"Payload":"x","Processed":false}}]`)

use serde::{Deserialize, Serialize};
use thiserror::Error;

use taskrelay_core::{TaskId, TaskRecord};

/// Kind of row change.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "OperationRepr")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

impl ChangeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Insert => "insert",
            ChangeOperation::Update => "update",
            ChangeOperation::Delete => "delete",
        }
    }
}

impl core::fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OperationRepr {
    Code(u8),
    Name(String),
}

impl TryFrom<OperationRepr> for ChangeOperation {
    type Error = String;

    fn try_from(value: OperationRepr) -> Result<Self, Self::Error> {
        match value {
            OperationRepr::Code(0) => Ok(ChangeOperation::Insert),
            OperationRepr::Code(1) => Ok(ChangeOperation::Update),
            OperationRepr::Code(2) => Ok(ChangeOperation::Delete),
            OperationRepr::Code(other) => Err(format!("unknown operation code {other}")),
            OperationRepr::Name(name) => match name.to_ascii_lowercase().as_str() {
                "insert" => Ok(ChangeOperation::Insert),
                "update" => Ok(ChangeOperation::Update),
                "delete" => Ok(ChangeOperation::Delete),
                _ => Err(format!("unknown operation {name:?}")),
            },
        }
    }
}

/// Image of a changed task row.
///
/// The payload is carried as plain text: the observer reports what the
/// storage engine saw and performs no validation of its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRow {
    #[serde(alias = "Id")]
    pub id: TaskId,
    #[serde(alias = "Payload")]
    pub payload: String,
    #[serde(alias = "Processed", default)]
    pub processed: bool,
}

impl From<&TaskRecord> for TaskRow {
    fn from(record: &TaskRecord) -> Self {
        Self {
            id: record.id,
            payload: record.payload.as_str().to_string(),
            processed: record.processed,
        }
    }
}

/// One row change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskChange {
    #[serde(alias = "Operation")]
    pub operation: ChangeOperation,
    #[serde(alias = "Item")]
    pub item: TaskRow,
}

impl TaskChange {
    pub fn inserted(record: &TaskRecord) -> Self {
        Self {
            operation: ChangeOperation::Insert,
            item: TaskRow::from(record),
        }
    }
}

/// Net changes delivered in one notification, in change-sequence order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeBatch {
    pub changes: Vec<TaskChange>,
}

impl ChangeBatch {
    pub fn new(changes: Vec<TaskChange>) -> Self {
        Self { changes }
    }

    /// Batch describing a single freshly inserted row.
    pub fn inserted(record: &TaskRecord) -> Self {
        Self::new(vec![TaskChange::inserted(record)])
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskChange> {
        self.changes.iter()
    }
}

/// Raw notification payload could not be turned into a batch.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("change payload is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("change payload has unexpected shape: {0}")]
    Shape(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BatchRepr {
    Many(Vec<TaskChange>),
    One(TaskChange),
}

/// Decode a raw change notification (JSON array of changes, or a single change).
pub fn decode_batch(raw: &str) -> Result<ChangeBatch, DecodeError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;

    match serde_json::from_value::<BatchRepr>(value) {
        Ok(BatchRepr::Many(changes)) => Ok(ChangeBatch::new(changes)),
        Ok(BatchRepr::One(change)) => Ok(ChangeBatch::new(vec![change])),
        Err(e) => Err(DecodeError::Shape(e.to_string())),
    }
}
