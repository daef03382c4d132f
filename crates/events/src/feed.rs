//! In-process change feed.
//!
//! Carries committed `ChangeBatch`es from whatever detects them (the
//! in-memory store, the Postgres listener) to the single observer task.
//!
//! ## Ordering
//!
//! Every published batch is stamped with a sequence number. Stamping and
//! enqueueing happen under one lock, so the stream yields batches in exactly
//! the order `publish` accepted them, with consecutive sequence numbers
//! starting at 1. The queue is unbounded: a slow observer delays delivery
//! but never loses a batch.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc;

use crate::change::ChangeBatch;

/// Position of a batch in the feed.
pub type FeedSeq = u64;

/// One batch as handed to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub seq: FeedSeq,
    pub batch: ChangeBatch,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("change feed closed; batch was not queued")]
    Closed,

    #[error("change feed lock poisoned")]
    Poisoned,
}

#[derive(Debug)]
struct Sequencer {
    next_seq: FeedSeq,
    tx: mpsc::UnboundedSender<Delivery>,
}

/// Producer side. Cheap to clone; all clones share one sequence.
#[derive(Debug, Clone)]
pub struct ChangePublisher {
    sequencer: Arc<Mutex<Sequencer>>,
}

impl ChangePublisher {
    /// Queue `batch` behind everything published before it.
    pub fn publish(&self, batch: ChangeBatch) -> Result<FeedSeq, FeedError> {
        let mut sequencer = self.sequencer.lock().map_err(|_| FeedError::Poisoned)?;
        let seq = sequencer.next_seq;
        sequencer
            .tx
            .send(Delivery { seq, batch })
            .map_err(|_| FeedError::Closed)?;
        sequencer.next_seq += 1;
        Ok(seq)
    }

    /// Has the consuming side gone away?
    pub fn is_closed(&self) -> bool {
        self.sequencer
            .lock()
            .map(|s| s.tx.is_closed())
            .unwrap_or(true)
    }
}

/// Consumer side.
#[derive(Debug)]
pub struct ChangeStream {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl ChangeStream {
    /// Next batch; `None` once every publisher is dropped and the queue is empty.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    /// Next batch if one is already queued.
    pub fn try_next(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }

    /// Refuse further batches. Already queued ones can still be drained.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Create a connected publisher/stream pair.
pub fn change_feed() -> (ChangePublisher, ChangeStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    let publisher = ChangePublisher {
        sequencer: Arc::new(Mutex::new(Sequencer { next_seq: 1, tx })),
    };
    (publisher, ChangeStream { rx })
}
