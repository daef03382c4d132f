//! Drives a `ChangeObserver` from the change feed.
//!
//! One tokio task per observer. It wakes only when a batch is queued, hands
//! batches to the observer strictly in feed order, and stops when every
//! publisher is gone or on shutdown. On shutdown, batches already queued are
//! still observed before the task exits.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use taskrelay_events::{ChangeStream, Delivery, FeedSeq};

use crate::observer::{ChangeObserver, LogSink};

/// What the observer task got through before it stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObserverStats {
    pub batches: u64,
    pub changes: u64,
    pub last_seq: Option<FeedSeq>,
}

/// Handle to a running observer task.
///
/// Dropping the handle also stops the task, after it drains the queue.
#[derive(Debug)]
pub struct ObserverHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<ObserverStats>,
}

impl ObserverHandle {
    /// Stop taking new batches, observe what is queued, and wait for the task.
    pub async fn shutdown(mut self) -> ObserverStats {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match (&mut self.join).await {
            Ok(stats) => stats,
            Err(err) => {
                warn!(error = %err, "change observer task ended abnormally");
                ObserverStats::default()
            }
        }
    }
}

/// Spawn the observer on the current tokio runtime.
pub fn spawn_observer<L>(stream: ChangeStream, observer: Arc<ChangeObserver<L>>) -> ObserverHandle
where
    L: LogSink + 'static,
{
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let join = tokio::spawn(observe(stream, observer, shutdown_rx));
    ObserverHandle {
        shutdown: Some(shutdown_tx),
        join,
    }
}

async fn observe<L: LogSink>(
    mut stream: ChangeStream,
    observer: Arc<ChangeObserver<L>>,
    mut shutdown: oneshot::Receiver<()>,
) -> ObserverStats {
    let mut stats = ObserverStats::default();

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            delivery = stream.next() => match delivery {
                Some(delivery) => acknowledge(&observer, delivery, &mut stats),
                None => {
                    debug!("change feed closed");
                    return stats;
                }
            },
        }
    }

    stream.close();
    while let Some(delivery) = stream.try_next() {
        acknowledge(&observer, delivery, &mut stats);
    }
    info!(batches = stats.batches, changes = stats.changes, "change observer stopped");
    stats
}

fn acknowledge<L: LogSink>(
    observer: &ChangeObserver<L>,
    delivery: Delivery,
    stats: &mut ObserverStats,
) {
    let report = observer.on_change(&delivery.batch);
    stats.batches += 1;
    stats.changes += report.delivered as u64;
    stats.last_seq = Some(delivery.seq);
    debug!(
        seq = delivery.seq,
        delivered = report.delivered,
        logged = report.logged,
        "change batch acknowledged"
    );
}
