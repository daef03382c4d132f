//! Change observer: one structured log record per delivered row change.
//!
//! The observer holds no state and writes nothing durable, so redelivered
//! batches simply produce duplicate log records. Sink failures are downgraded
//! to warnings and never block acknowledgement of the batch.

use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use taskrelay_core::TaskId;
use taskrelay_events::{ChangeBatch, DecodeError, TaskChange, decode_batch};

/// A change could not be written to the log sink.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("failed to record change for task {task_id}: {reason}")]
pub struct ObserverLoggingError {
    pub task_id: TaskId,
    pub reason: String,
}

/// Destination of observed changes.
pub trait LogSink: Send + Sync {
    fn record(&self, change: &TaskChange) -> Result<(), ObserverLoggingError>;
}

impl<L> LogSink for Arc<L>
where
    L: LogSink + ?Sized,
{
    fn record(&self, change: &TaskChange) -> Result<(), ObserverLoggingError> {
        (**self).record(change)
    }
}

/// Writes each change as a `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn record(&self, change: &TaskChange) -> Result<(), ObserverLoggingError> {
        info!(
            operation = %change.operation,
            task_id = %change.item.id,
            payload = %change.item.payload,
            processed = change.item.processed,
            "task change observed"
        );
        Ok(())
    }
}

/// Outcome of one observer invocation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ObserveReport {
    /// Changes contained in the batch.
    pub delivered: usize,
    /// Changes the sink accepted.
    pub logged: usize,
    /// Sink failures, each already logged as a warning.
    pub warnings: usize,
    /// Set when a raw payload could not be decoded.
    pub decode_error: Option<DecodeError>,
}

#[derive(Debug, Clone, Default)]
pub struct ChangeObserver<L = TracingLogSink> {
    sink: L,
}

impl ChangeObserver<TracingLogSink> {
    pub fn tracing() -> Self {
        Self::new(TracingLogSink)
    }
}

impl<L: LogSink> ChangeObserver<L> {
    pub fn new(sink: L) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &L {
        &self.sink
    }

    /// Record every change of `batch`, in batch order.
    pub fn on_change(&self, batch: &ChangeBatch) -> ObserveReport {
        let mut report = ObserveReport {
            delivered: batch.len(),
            ..ObserveReport::default()
        };

        if batch.is_empty() {
            info!("change batch carried no rows");
            return report;
        }

        for change in batch.iter() {
            match self.sink.record(change) {
                Ok(()) => report.logged += 1,
                Err(err) => {
                    report.warnings += 1;
                    warn!(
                        task_id = %change.item.id,
                        error = %err,
                        "could not record task change"
                    );
                }
            }
        }

        report
    }

    /// Decode a raw change notification and record it.
    ///
    /// Entry point for hosts that hand over the trigger payload as text, such
    /// as SQL trigger bindings delivering PascalCase rows with numeric
    /// operations. The in-process feed delivers decoded batches to
    /// `on_change` instead. Undecodable input is logged together with the
    /// raw text and reported, never escalated.
    pub fn on_raw(&self, raw: &str) -> ObserveReport {
        match decode_batch(raw) {
            Ok(batch) => self.on_change(&batch),
            Err(err) => {
                error!(error = %err, raw, "could not decode change notification");
                ObserveReport {
                    decode_error: Some(err),
                    ..ObserveReport::default()
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Sink that remembers what it was given; optionally fails for one id.
    #[derive(Debug, Default)]
    pub struct RecordingSink {
        pub seen: Mutex<Vec<TaskChange>>,
        pub fail_for: Option<TaskId>,
    }

    impl RecordingSink {
        pub fn seen(&self) -> Vec<TaskChange> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl LogSink for RecordingSink {
        fn record(&self, change: &TaskChange) -> Result<(), ObserverLoggingError> {
            if self.fail_for == Some(change.item.id) {
                return Err(ObserverLoggingError {
                    task_id: change.item.id,
                    reason: "sink unavailable".to_string(),
                });
            }
            self.seen.lock().unwrap().push(change.clone());
            Ok(())
        }
    }
}
