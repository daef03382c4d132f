use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use taskrelay_core::{NewTask, TaskRecord};

/// Storage operation error.
///
/// These are **infrastructure errors**; caller-input problems are rejected
/// before a store is ever touched.
///
/// ## Categories
///
/// - **Transient**: expected to clear up on retry (timeouts, dropped
///   connections, pool exhaustion, serialization failures)
/// - **Constraint**: the row violated a table constraint; retrying the same
///   insert cannot help
/// - **Fatal**: anything else (bad schema, permissions, protocol errors)
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("transient storage failure: {0}")]
    Transient(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("storage failure: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Idempotency key of one submission, shared by all of its insert attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubmissionKey(Uuid);

impl SubmissionKey {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SubmissionKey {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for SubmissionKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.0.fmt(f)
    }
}

/// Durable home of task records.
///
/// ## Insert Semantics
///
/// `insert()`:
/// - is atomic: the row is fully written or not written at all
/// - assigns the id (monotonic, unique) inside the storage engine
/// - returns the stored record, with `processed = false`
/// - is idempotent per `key`: once a row for `key` is committed, further
///   inserts with the same key write nothing and return that row
///
/// The last point is what makes a retry after an ambiguous failure (a
/// timeout after the statement was sent, a connection lost before the
/// acknowledgement) safe.
///
/// Implementations must not retry internally; the submission path owns the
/// retry budget.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, key: SubmissionKey, task: &NewTask) -> Result<TaskRecord, StoreError>;
}

#[async_trait]
impl<S> TaskStore for Arc<S>
where
    S: TaskStore + ?Sized,
{
    async fn insert(&self, key: SubmissionKey, task: &NewTask) -> Result<TaskRecord, StoreError> {
        (**self).insert(key, task).await
    }
}
