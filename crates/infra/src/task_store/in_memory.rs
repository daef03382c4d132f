use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use taskrelay_core::{NewTask, TaskId, TaskRecord};
use taskrelay_events::{ChangeBatch, ChangePublisher};

use super::r#trait::{StoreError, SubmissionKey, TaskStore};

#[derive(Debug, Default)]
struct Table {
    rows: Vec<TaskRecord>,
    by_key: HashMap<SubmissionKey, usize>,
}

/// In-memory task table.
///
/// Intended for tests/dev. When a change feed is attached, every committed
/// insert is announced as a one-row `ChangeBatch`, standing in for the
/// storage engine's own change tracking.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    table: RwLock<Table>,
    feed: Option<ChangePublisher>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce committed inserts on `feed`.
    pub fn with_change_feed(feed: ChangePublisher) -> Self {
        Self {
            table: RwLock::new(Table::default()),
            feed: Some(feed),
        }
    }

    /// Snapshot of every stored record, in id order.
    pub fn records(&self) -> Vec<TaskRecord> {
        self.table
            .read()
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.table.read().map(|t| t.rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, key: SubmissionKey, task: &NewTask) -> Result<TaskRecord, StoreError> {
        let mut table = self
            .table
            .write()
            .map_err(|_| StoreError::Fatal("lock poisoned".to_string()))?;

        if let Some(&index) = table.by_key.get(&key) {
            debug!(submission = %key, "submission already stored");
            return Ok(table.rows[index].clone());
        }

        let id = TaskId::from_raw(table.rows.len() as i64 + 1);
        let record = TaskRecord::inserted(id, task.clone(), Some(Utc::now()));
        let index = table.rows.len();
        table.rows.push(record.clone());
        table.by_key.insert(key, index);

        // Published under the lock so batches leave in id order.
        if let Some(feed) = &self.feed {
            if let Err(err) = feed.publish(ChangeBatch::inserted(&record)) {
                warn!(task_id = %record.id, error = %err, "failed to announce task insert");
            }
        }

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use taskrelay_events::{ChangeOperation, change_feed};

    fn task(payload: &str) -> NewTask {
        NewTask::from_raw(payload).unwrap()
    }

    #[tokio::test]
    async fn assigns_monotonic_ids_and_starts_unprocessed() {
        let store = InMemoryTaskStore::new();

        let a = store.insert(SubmissionKey::new(), &task("a")).await.unwrap();
        let b = store.insert(SubmissionKey::new(), &task("b")).await.unwrap();

        assert_eq!(a.id.as_i64(), 1);
        assert_eq!(b.id.as_i64(), 2);
        assert!(!a.processed && !b.processed);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn repeated_key_returns_the_first_row_and_writes_nothing() {
        let (publisher, mut stream) = change_feed();
        let store = InMemoryTaskStore::with_change_feed(publisher);
        let key = SubmissionKey::new();

        let first = store.insert(key, &task("once")).await.unwrap();
        let again = store.insert(key, &task("once")).await.unwrap();

        assert_eq!(first, again);
        assert_eq!(store.len(), 1);
        assert!(stream.try_next().is_some());
        assert!(stream.try_next().is_none(), "replayed insert must not be announced");
    }

    #[tokio::test]
    async fn announces_each_insert_on_the_attached_feed() {
        let (publisher, mut stream) = change_feed();
        let store = InMemoryTaskStore::with_change_feed(publisher);

        let rec = store.insert(SubmissionKey::new(), &task("ship it")).await.unwrap();

        let delivery = stream.try_next().unwrap();
        assert_eq!(delivery.seq, 1);
        assert_eq!(delivery.batch.len(), 1);
        assert_eq!(delivery.batch.changes[0].operation, ChangeOperation::Insert);
        assert_eq!(delivery.batch.changes[0].item.id, rec.id);
        assert_eq!(delivery.batch.changes[0].item.payload, "ship it");
        assert!(stream.try_next().is_none());
    }

    #[tokio::test]
    async fn concurrent_inserts_get_unique_ids() {
        let store = Arc::new(InMemoryTaskStore::new());
        let mut joins = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            joins.push(tokio::spawn(async move {
                let payload = format!("t{i}");
                store.insert(SubmissionKey::new(), &task(&payload)).await.unwrap().id
            }));
        }

        let mut ids = Vec::new();
        for j in joins {
            ids.push(j.await.unwrap());
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 32);
        assert_eq!(store.len(), 32);
    }
}
