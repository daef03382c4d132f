//! Postgres change-feed listener.
//!
//! Bridges the database's change notifications (see `schema`) into the
//! in-process change feed. A notification normally carries the changed row
//! image and is published as-is; an oversized row arrives as a reference and
//! is read back before publishing.
//!
//! ## Gaps
//!
//! NOTIFY is not durable: anything sent while no session is listening is
//! gone. The listener therefore keeps a watermark, the highest inserted id
//! it has handed to the feed, and after every successful LISTEN it reads the
//! rows above the watermark and publishes them, oldest first, before
//! waiting for notifications again. Rows seen both ways are delivered twice;
//! the feed is at-least-once.
//!
//! Ids are allocated before commit, so a slow transaction can commit an id
//! below the watermark. While connected its notification still arrives;
//! only if it commits during a disconnect is it missed.

use std::time::Duration;

use serde::Deserialize;
use sqlx::postgres::PgListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use taskrelay_core::{TaskId, TaskRecord};
use taskrelay_events::{
    ChangeBatch, ChangeOperation, ChangePublisher, DecodeError, TaskChange, TaskRow, decode_batch,
};

use crate::task_store::{PostgresTaskStore, StoreError};

/// Reference to a changed row whose image was too large to inline.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChangeNotice {
    pub operation: ChangeOperation,
    pub id: TaskId,
}

/// Decoded notification body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Row images, ready to publish.
    Changes(ChangeBatch),
    /// Row must be read back first.
    Reference(ChangeNotice),
}

impl Notification {
    pub fn parse(raw: &str) -> Result<Self, DecodeError> {
        if raw.trim_start().starts_with('[') {
            return decode_batch(raw).map(Notification::Changes);
        }
        serde_json::from_str::<ChangeNotice>(raw)
            .map(Notification::Reference)
            .map_err(|e| DecodeError::Shape(e.to_string()))
    }
}

/// Highest inserted task id already handed to the feed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Watermark(Option<TaskId>);

impl Watermark {
    pub fn starting_at(id: Option<TaskId>) -> Self {
        Self(id)
    }

    pub fn get(&self) -> Option<TaskId> {
        self.0
    }

    /// Advance past every insert in `batch`.
    pub fn observe(&mut self, batch: &ChangeBatch) {
        for change in batch.iter() {
            if change.operation == ChangeOperation::Insert {
                self.advance(change.item.id);
            }
        }
    }

    /// Turn rows read during catch-up into one batch.
    ///
    /// Rows at or below the watermark are dropped, the rest are ordered by
    /// id and reported as inserts. The watermark moves to the highest id.
    pub fn catch_up(&mut self, mut rows: Vec<TaskRecord>) -> ChangeBatch {
        rows.retain(|r| self.0.is_none_or(|mark| r.id > mark));
        rows.sort_by_key(|r| r.id);
        if let Some(last) = rows.last() {
            self.advance(last.id);
        }
        ChangeBatch::new(rows.iter().map(TaskChange::inserted).collect())
    }

    fn advance(&mut self, id: TaskId) {
        if self.0.is_none_or(|mark| id > mark) {
            self.0 = Some(id);
        }
    }
}

/// Handle to a running listener task. Dropping it stops the listener.
#[derive(Debug)]
pub struct ListenerHandle {
    join: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    pub fn shutdown(mut self) {
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}

#[derive(Debug)]
pub struct PgChangeListener;

impl PgChangeListener {
    const RECONNECT_DELAY: Duration = Duration::from_secs(1);
    const CATCH_UP_PAGE: i64 = 500;

    /// Record the current end of the table, then listen from there.
    ///
    /// Every row committed after this returns reaches the feed, including
    /// rows committed before the first LISTEN succeeds.
    pub async fn start(
        store: PostgresTaskStore,
        channel: impl Into<String>,
        feed: ChangePublisher,
    ) -> Result<ListenerHandle, StoreError> {
        let watermark = Watermark::starting_at(store.latest_id().await?);
        let channel = channel.into();
        info!(channel, watermark = ?watermark.get(), "starting change listener");

        let join = tokio::spawn(listen_loop(store, channel, feed, watermark));
        Ok(ListenerHandle { join: Some(join) })
    }
}

async fn listen_loop(
    store: PostgresTaskStore,
    channel: String,
    feed: ChangePublisher,
    mut watermark: Watermark,
) {
    loop {
        let mut listener = match PgListener::connect_with(store.pool()).await {
            Ok(listener) => listener,
            Err(err) => {
                warn!(channel, error = %err, "change listener could not connect");
                tokio::time::sleep(PgChangeListener::RECONNECT_DELAY).await;
                continue;
            }
        };

        if let Err(err) = listener.listen(&channel).await {
            warn!(channel, error = %err, "change listener could not subscribe");
            tokio::time::sleep(PgChangeListener::RECONNECT_DELAY).await;
            continue;
        }

        // Subscribed: anything committed from here on is notified.
        match catch_up(&store, &feed, &mut watermark).await {
            Ok(0) => {}
            Ok(rows) => info!(channel, rows, "published rows committed while not listening"),
            Err(RelayError::Closed) => return,
            Err(RelayError::Store(err)) => {
                warn!(channel, error = %err, "change listener could not catch up");
                tokio::time::sleep(PgChangeListener::RECONNECT_DELAY).await;
                continue;
            }
        }

        info!(channel, "listening for task changes");

        loop {
            match listener.recv().await {
                Ok(notification) => {
                    let raw = notification.payload();
                    if let Err(RelayError::Closed) =
                        relay(&store, &feed, &mut watermark, raw).await
                    {
                        return;
                    }
                }
                Err(err) => {
                    warn!(channel, error = %err, "change listener lost its connection");
                    break;
                }
            }
        }

        tokio::time::sleep(PgChangeListener::RECONNECT_DELAY).await;
    }
}

#[derive(Debug)]
enum RelayError {
    /// Nobody consumes the feed any more; the listener stops.
    Closed,
    Store(StoreError),
}

fn publish(feed: &ChangePublisher, batch: ChangeBatch) -> Result<(), RelayError> {
    match feed.publish(batch) {
        Ok(seq) => {
            debug!(seq, "task change relayed");
            Ok(())
        }
        Err(err) => {
            warn!(error = %err, "change feed is closed; stopping listener");
            Err(RelayError::Closed)
        }
    }
}

async fn catch_up(
    store: &PostgresTaskStore,
    feed: &ChangePublisher,
    watermark: &mut Watermark,
) -> Result<usize, RelayError> {
    let mut published = 0;
    loop {
        let rows = store
            .fetch_after(watermark.get(), PgChangeListener::CATCH_UP_PAGE)
            .await
            .map_err(RelayError::Store)?;
        let page_full = rows.len() as i64 == PgChangeListener::CATCH_UP_PAGE;

        let batch = watermark.catch_up(rows);
        if batch.is_empty() {
            return Ok(published);
        }
        published += batch.len();
        publish(feed, batch)?;

        if !page_full {
            return Ok(published);
        }
    }
}

async fn relay(
    store: &PostgresTaskStore,
    feed: &ChangePublisher,
    watermark: &mut Watermark,
    raw: &str,
) -> Result<(), RelayError> {
    let batch = match Notification::parse(raw) {
        Ok(Notification::Changes(batch)) => batch,
        Ok(Notification::Reference(notice)) => match store.fetch(notice.id).await {
            Ok(Some(record)) => ChangeBatch::new(vec![TaskChange {
                operation: notice.operation,
                item: TaskRow::from(&record),
            }]),
            Ok(None) => {
                warn!(task_id = %notice.id, "referenced task row no longer exists");
                return Ok(());
            }
            Err(err) => {
                error!(task_id = %notice.id, error = %err, "could not load changed task row");
                return Ok(());
            }
        },
        Err(err) => {
            error!(error = %err, raw, "could not decode change notification");
            return Ok(());
        }
    };

    watermark.observe(&batch);
    publish(feed, batch)
}
