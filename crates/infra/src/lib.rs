//! Infrastructure layer: task storage, the submission and observer handlers,
//! change-feed plumbing, and configuration.

pub mod change_listener;
pub mod config;
pub mod observer;
pub mod retry;
pub mod schema;
pub mod submission;
pub mod task_store;
pub mod workers;

#[cfg(test)]
mod log_capture;

pub use change_listener::{ChangeNotice, ListenerHandle, Notification, PgChangeListener, Watermark};
pub use config::{AppConfig, ConfigError, PgConnectionConfig, StorageConfig};
pub use observer::{
    ChangeObserver, LogSink, ObserveReport, ObserverLoggingError, TracingLogSink,
};
pub use retry::{Backoff, RetryPolicy};
pub use submission::{
    SubmissionHandler, SubmissionState, SubmitError, SubmitReceipt, parse_submission,
};
pub use task_store::{InMemoryTaskStore, PostgresTaskStore, StoreError, SubmissionKey, TaskStore};
pub use workers::{ObserverHandle, ObserverStats, spawn_observer};
