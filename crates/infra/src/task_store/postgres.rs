//! Postgres-backed task store.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `StoreError` as follows:
//!
//! | SQLx Error | SQLSTATE | StoreError | Scenario |
//! |------------|----------|------------|----------|
//! | Database | class `08` | `Transient` | Connection exception |
//! | Database | `40001`, `40P01` | `Transient` | Serialization failure / deadlock |
//! | Database | `53300` | `Transient` | Too many connections |
//! | Database | `57P01`..`57P03` | `Transient` | Server shutting down / not accepting connections |
//! | Database | `57014` | `Transient` | `statement_timeout` hit; the statement was rolled back |
//! | Database | class `23` | `Constraint` | Check / not-null / unique violation |
//! | Database | other | `Fatal` | Schema or permission problems |
//! | PoolTimedOut, Io, Tls, PoolClosed | N/A | `Transient` | Network and pool failures |
//! | Other | N/A | `Fatal` | Protocol, decode, configuration |
//!
//! ## Idempotent Inserts
//!
//! Every row carries the `submission_id` of the submission that wrote it
//! (unique). An insert whose key is already committed writes nothing and
//! returns the existing row, so retrying after an unacknowledged commit
//! cannot duplicate the task. If the earlier attempt is still in flight, the
//! unique index makes the retry wait for it; should the retry's snapshot
//! still miss the row, the attempt reports a transient failure and the next
//! attempt finds it.
//!
//! ## Thread Safety
//!
//! `PostgresTaskStore` is `Send + Sync` and cheap to clone; the SQLx pool
//! handles connection sharing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, info, instrument};

use taskrelay_core::{NewTask, TaskId, TaskPayload, TaskRecord};

use super::r#trait::{StoreError, SubmissionKey, TaskStore};
use crate::schema;

#[derive(Debug, Clone)]
pub struct PostgresTaskStore {
    pool: Arc<PgPool>,
}

impl PostgresTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Build a lazily-connecting pool.
    ///
    /// Nothing is dialed until the first query, so an unreachable database
    /// surfaces as a transient insert failure instead of a boot failure.
    /// `acquire_timeout` bounds how long one attempt may wait for a connection.
    pub fn connect_lazy(
        options: PgConnectOptions,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Self {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect_lazy_with(options);
        Self::new(pool)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the task table and its change-notification trigger (idempotent).
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self, channel: &str) -> Result<(), StoreError> {
        if !schema::is_valid_channel(channel) {
            return Err(StoreError::Fatal(format!("invalid notification channel {channel:?}")));
        }

        for stmt in schema::statements(channel) {
            sqlx::query(&stmt)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }

        info!(channel, "task schema ready");
        Ok(())
    }

    /// Load one task row by id (`None` if it does not exist).
    #[instrument(skip(self), fields(task_id = %id), err)]
    pub async fn fetch(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, payload, processed, created_at
            FROM tasks
            WHERE id = $1
            "#,
        )
        .bind(id.as_i64())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch", e))?;

        row.map(|r| record_from_row(&r)).transpose()
    }

    /// Up to `limit` rows with an id above `after`, in id order.
    #[instrument(skip(self), err)]
    pub async fn fetch_after(
        &self,
        after: Option<TaskId>,
        limit: i64,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, payload, processed, created_at
            FROM tasks
            WHERE id > $1
            ORDER BY id
            LIMIT $2
            "#,
        )
        .bind(after.map(|id| id.as_i64()).unwrap_or(0))
        .bind(limit)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_after", e))?;

        rows.iter().map(record_from_row).collect()
    }

    /// Highest id currently in the table.
    #[instrument(skip(self), err)]
    pub async fn latest_id(&self) -> Result<Option<TaskId>, StoreError> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM tasks")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("latest_id", e))?;

        Ok(max.map(TaskId::from_raw))
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    #[instrument(
        skip(self, task),
        fields(submission = %key, payload_len = task.payload.as_str().len()),
        err
    )]
    async fn insert(&self, key: SubmissionKey, task: &NewTask) -> Result<TaskRecord, StoreError> {
        let row = sqlx::query(
            r#"
            WITH inserted AS (
                INSERT INTO tasks (payload, submission_id)
                VALUES ($1, $2)
                ON CONFLICT (submission_id) DO NOTHING
                RETURNING id, payload, processed, created_at
            )
            SELECT id, payload, processed, created_at FROM inserted
            UNION ALL
            SELECT id, payload, processed, created_at FROM tasks WHERE submission_id = $2
            LIMIT 1
            "#,
        )
        .bind(task.payload.as_str())
        .bind(key.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert", e))?;

        let Some(row) = row else {
            return Err(StoreError::transient(format!(
                "submission {key} is still being committed by an earlier attempt"
            )));
        };

        let record = record_from_row(&row)?;
        debug!(task_id = %record.id, "task row written");
        Ok(record)
    }
}

fn record_from_row(row: &PgRow) -> Result<TaskRecord, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Fatal(format!("failed to decode task row: {e}"));

    let id: i64 = row.try_get("id").map_err(decode)?;
    let payload: String = row.try_get("payload").map_err(decode)?;
    let processed: bool = row.try_get("processed").map_err(decode)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(decode)?;

    let payload = TaskPayload::parse(payload)
        .map_err(|e| StoreError::Fatal(format!("stored payload is invalid: {e}")))?;

    Ok(TaskRecord {
        id: TaskId::from_raw(id),
        payload,
        processed,
        created_at: Some(created_at),
    })
}

/// Classify a SQLSTATE code.
pub(crate) fn classify_sqlstate(code: &str) -> SqlStateClass {
    match code {
        "40001" | "40P01" | "53300" | "57014" | "57P01" | "57P02" | "57P03" => {
            SqlStateClass::Transient
        }
        c if c.starts_with("08") => SqlStateClass::Transient,
        c if c.starts_with("23") => SqlStateClass::Constraint,
        _ => SqlStateClass::Other,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SqlStateClass {
    Transient,
    Constraint,
    Other,
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref().map(classify_sqlstate) {
                Some(SqlStateClass::Transient) => StoreError::Transient(msg),
                Some(SqlStateClass::Constraint) => StoreError::Constraint(msg),
                _ => StoreError::Fatal(msg),
            }
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Transient(format!("timed out acquiring a connection in {operation}"))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Transient(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::Io(e) => StoreError::Transient(format!("io error in {operation}: {e}")),
        sqlx::Error::Tls(e) => StoreError::Transient(format!("tls error in {operation}: {e}")),
        _ => StoreError::Fatal(format!("sqlx error in {}: {}", operation, err)),
    }
}
