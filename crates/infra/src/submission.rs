//! Submission handler: request → validated task → durable row.
//!
//! ```text
//! Received → Validating → Rejected
//!                       → Inserting → Succeeded
//!                                   → RetryWait → Inserting
//!                                   → FailedPermanently
//! ```
//!
//! Transient storage failures (timeouts, dropped connections) are retried up
//! to the policy's bound. Everything else ends the invocation immediately.
//! Every attempt is logged with its number and outcome.
//!
//! All attempts of one invocation insert under the same `SubmissionKey`, so
//! an attempt that committed but was never acknowledged (it timed out, or
//! the connection dropped after commit) is found again by the retry instead
//! of being written twice.

use std::time::Duration;

use thiserror::Error;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use taskrelay_core::{NewTask, TaskRecord};

use crate::retry::RetryPolicy;
use crate::task_store::{StoreError, SubmissionKey, TaskStore};

/// Where an invocation currently is.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SubmissionState {
    Received,
    Validating,
    Rejected,
    Inserting,
    RetryWait,
    Succeeded,
    FailedPermanently,
}

impl SubmissionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubmissionState::Rejected
                | SubmissionState::Succeeded
                | SubmissionState::FailedPermanently
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionState::Received => "received",
            SubmissionState::Validating => "validating",
            SubmissionState::Rejected => "rejected",
            SubmissionState::Inserting => "inserting",
            SubmissionState::RetryWait => "retry_wait",
            SubmissionState::Succeeded => "succeeded",
            SubmissionState::FailedPermanently => "failed_permanently",
        }
    }
}

impl core::fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Submission failure, already classified for the caller.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// Malformed request or empty task. Nothing was attempted.
    #[error("{0}")]
    Client(String),

    /// Every attempt failed transiently.
    #[error("storage unavailable after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: StoreError,
    },

    /// A non-transient storage failure ended the invocation early.
    #[error("storage failure on attempt {attempts}: {source}")]
    Storage { attempts: u32, source: StoreError },
}

impl SubmitError {
    pub fn client(msg: impl Into<String>) -> Self {
        Self::Client(msg.into())
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self, SubmitError::Client(_))
    }

    /// Insert attempts consumed before giving up (0 for client errors).
    pub fn attempts(&self) -> u32 {
        match self {
            SubmitError::Client(_) => 0,
            SubmitError::Exhausted { attempts, .. } | SubmitError::Storage { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Acknowledgement of a stored task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub invocation_id: Uuid,
    pub record: TaskRecord,
    pub attempts: u32,
}

/// Parse a request body of the form `{"task": "<non-empty string>"}`.
pub fn parse_submission(body: &[u8]) -> Result<NewTask, SubmitError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|_| SubmitError::client("Invalid JSON"))?;

    match value.get("task") {
        Some(serde_json::Value::String(task)) if !task.is_empty() => {
            NewTask::from_raw(task.as_str()).map_err(|e| SubmitError::client(e.to_string()))
        }
        _ => Err(SubmitError::client("Missing 'task'")),
    }
}

/// Stateless submission handler; one `handle`/`submit` call per invocation.
#[derive(Debug, Clone)]
pub struct SubmissionHandler<S> {
    store: S,
    policy: RetryPolicy,
}

impl<S: TaskStore> SubmissionHandler<S> {
    pub fn new(store: S, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Validate a raw request body and insert it.
    pub async fn handle(&self, body: &[u8]) -> Result<SubmitReceipt, SubmitError> {
        let invocation_id = Uuid::now_v7();
        let span = info_span!("submission", %invocation_id);

        async {
            transition(SubmissionState::Received);
            transition(SubmissionState::Validating);
            let task = match parse_submission(body) {
                Ok(task) => task,
                Err(err) => {
                    transition(SubmissionState::Rejected);
                    info!(error = %err, "submission rejected");
                    return Err(err);
                }
            };
            self.insert_with_retry(invocation_id, task).await
        }
        .instrument(span)
        .await
    }

    /// Insert an already validated task.
    pub async fn submit(&self, task: NewTask) -> Result<SubmitReceipt, SubmitError> {
        let invocation_id = Uuid::now_v7();
        let span = info_span!("submission", %invocation_id);

        async {
            transition(SubmissionState::Received);
            self.insert_with_retry(invocation_id, task).await
        }
        .instrument(span)
        .await
    }

    async fn insert_with_retry(
        &self,
        invocation_id: Uuid,
        task: NewTask,
    ) -> Result<SubmitReceipt, SubmitError> {
        let key = SubmissionKey::from_uuid(invocation_id);
        let max_attempts = self.policy.attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            transition(SubmissionState::Inserting);

            match self.attempt_insert(key, &task).await {
                Ok(record) => {
                    transition(SubmissionState::Succeeded);
                    info!(
                        attempt,
                        max_attempts,
                        outcome = "inserted",
                        task_id = %record.id,
                        "task inserted"
                    );
                    return Ok(SubmitReceipt {
                        invocation_id,
                        record,
                        attempts: attempt,
                    });
                }
                Err(err) if err.is_transient() && self.policy.should_retry(attempt) => {
                    let delay = self.policy.delay_after(attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        outcome = "retrying",
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64,
                        "insert attempt failed"
                    );
                    transition(SubmissionState::RetryWait);
                    // Nothing is held across the wait: the pooled connection
                    // went back with the failed attempt.
                    tokio::time::sleep(delay).await;
                }
                Err(err) if err.is_transient() => {
                    warn!(
                        attempt,
                        max_attempts,
                        outcome = "exhausted",
                        error = %err,
                        "insert attempt failed"
                    );
                    transition(SubmissionState::FailedPermanently);
                    error!(attempts = attempt, "all {max_attempts} insert attempts failed");
                    return Err(SubmitError::Exhausted {
                        attempts: attempt,
                        last: err,
                    });
                }
                Err(err) => {
                    transition(SubmissionState::FailedPermanently);
                    error!(
                        attempt,
                        max_attempts,
                        outcome = "failed",
                        error = %err,
                        "insert failed with non-retryable error"
                    );
                    return Err(SubmitError::Storage {
                        attempts: attempt,
                        source: err,
                    });
                }
            }
        }
    }

    async fn attempt_insert(
        &self,
        key: SubmissionKey,
        task: &NewTask,
    ) -> Result<TaskRecord, StoreError> {
        let timeout: Duration = self.policy.attempt_timeout;
        match tokio::time::timeout(timeout, self.store.insert(key, task)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::transient(format!(
                "insert timed out after {}ms",
                timeout.as_millis()
            ))),
        }
    }
}

fn transition(state: SubmissionState) {
    debug!(state = %state, terminal = state.is_terminal(), "submission state");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use async_trait::async_trait;
    use proptest::prelude::*;

    use crate::log_capture::CapturedLogs;
    use crate::task_store::InMemoryTaskStore;

    /// Fails the first `failures` inserts with `error`, then delegates.
    struct FlakyStore {
        inner: InMemoryTaskStore,
        failures: AtomicU32,
        error: StoreError,
        calls: AtomicU32,
    }

    impl FlakyStore {
        fn new(failures: u32, error: StoreError) -> Self {
            Self {
                inner: InMemoryTaskStore::new(),
                failures: AtomicU32::new(failures),
                error,
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TaskStore for FlakyStore {
        async fn insert(
            &self,
            key: SubmissionKey,
            task: &NewTask,
        ) -> Result<TaskRecord, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(self.error.clone());
            }
            self.inner.insert(key, task).await
        }
    }

    struct HangingStore;

    #[async_trait]
    impl TaskStore for HangingStore {
        async fn insert(
            &self,
            _key: SubmissionKey,
            _task: &NewTask,
        ) -> Result<TaskRecord, StoreError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(StoreError::Fatal("unreachable".to_string()))
        }
    }

    /// Commits, then sits on the acknowledgement of the first insert.
    #[derive(Default)]
    struct SlowAckStore {
        inner: InMemoryTaskStore,
        stalled: AtomicBool,
        calls: AtomicU32,
    }

    #[async_trait]
    impl TaskStore for SlowAckStore {
        async fn insert(
            &self,
            key: SubmissionKey,
            task: &NewTask,
        ) -> Result<TaskRecord, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let record = self.inner.insert(key, task).await?;
            if !self.stalled.swap(true, Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(record)
        }
    }

    fn transient() -> StoreError {
        StoreError::transient("connection reset")
    }

    #[test]
    fn parse_accepts_task_objects() {
        let task = parse_submission(br#"{"task":"do something"}"#).unwrap();
        assert_eq!(task.payload.as_str(), "do something");
    }

    #[test]
    fn parse_distinguishes_invalid_json_from_missing_task() {
        let invalid = parse_submission(b"{not json").unwrap_err();
        assert_eq!(invalid.to_string(), "Invalid JSON");

        for body in [
            &br#"{}"#[..],
            br#"{"task":""}"#,
            br#"{"task":null}"#,
            br#"{"task":42}"#,
            br#"{"other":"x"}"#,
            br#"["task"]"#,
            br#""task""#,
        ] {
            let err = parse_submission(body).unwrap_err();
            assert!(err.is_client_error());
            assert_eq!(err.to_string(), "Missing 'task'");
        }
    }

    #[tokio::test]
    async fn valid_submission_inserts_exactly_one_unprocessed_row() {
        let store = Arc::new(InMemoryTaskStore::new());
        let handler = SubmissionHandler::new(store.clone(), RetryPolicy::immediate(3));

        let receipt = handler.handle(br#"{"task":"write tests"}"#).await.unwrap();

        assert_eq!(receipt.attempts, 1);
        let rows = store.records();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, receipt.record.id);
        assert_eq!(rows[0].payload.as_str(), "write tests");
        assert!(!rows[0].processed);
    }

    #[tokio::test]
    async fn rejected_submission_touches_no_storage() {
        let store = Arc::new(FlakyStore::new(0, transient()));
        let handler = SubmissionHandler::new(store.clone(), RetryPolicy::immediate(3));

        let err = handler.handle(br#"{"task":""}"#).await.unwrap_err();

        assert!(err.is_client_error());
        assert_eq!(err.attempts(), 0);
        assert_eq!(store.calls(), 0);
        assert!(store.inner.is_empty());
    }

    #[tokio::test]
    async fn transient_failures_below_the_bound_still_insert_once() {
        let store = Arc::new(FlakyStore::new(2, transient()));
        let handler = SubmissionHandler::new(store.clone(), RetryPolicy::immediate(3));

        let receipt = handler.submit(NewTask::from_raw("retry me").unwrap()).await.unwrap();

        assert_eq!(receipt.attempts, 3);
        assert_eq!(store.calls(), 3);
        assert_eq!(store.inner.len(), 1);
    }

    #[tokio::test]
    async fn persistent_transient_failure_exhausts_exactly_the_bound() {
        let store = Arc::new(FlakyStore::new(u32::MAX, transient()));
        let handler = SubmissionHandler::new(store.clone(), RetryPolicy::immediate(3));

        let err = handler.submit(NewTask::from_raw("doomed").unwrap()).await.unwrap_err();

        assert!(matches!(err, SubmitError::Exhausted { attempts: 3, .. }));
        assert_eq!(store.calls(), 3);
        assert!(store.inner.is_empty());
    }

    #[tokio::test]
    async fn constraint_violations_do_not_consume_retry_budget() {
        let store = Arc::new(FlakyStore::new(1, StoreError::Constraint("check".to_string())));
        let handler = SubmissionHandler::new(store.clone(), RetryPolicy::immediate(3));

        let err = handler.submit(NewTask::from_raw("x").unwrap()).await.unwrap_err();

        assert!(matches!(err, SubmitError::Storage { attempts: 1, .. }));
        assert_eq!(store.calls(), 1);
        assert!(store.inner.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_attempts_time_out_and_count_against_the_bound() {
        let policy = RetryPolicy::immediate(2).with_attempt_timeout(Duration::from_secs(1));
        let handler = SubmissionHandler::new(HangingStore, policy);

        let err = handler.submit(NewTask::from_raw("slow").unwrap()).await.unwrap_err();

        match err {
            SubmitError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 2);
                assert!(last.to_string().contains("timed out"));
            }
            other => panic!("expected exhausted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_an_unacknowledged_commit_does_not_duplicate_the_row() {
        let store = Arc::new(SlowAckStore::default());
        let policy = RetryPolicy::immediate(3).with_attempt_timeout(Duration::from_secs(10));
        let handler = SubmissionHandler::new(store.clone(), policy);

        let receipt = handler.handle(br#"{"task":"write once"}"#).await.unwrap();

        assert_eq!(receipt.attempts, 2);
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
        let rows = store.inner.records();
        assert_eq!(rows.len(), 1, "timed-out attempt must not be written twice");
        assert_eq!(rows[0].id, receipt.record.id);
        assert_eq!(rows[0].payload.as_str(), "write once");
    }

    #[tokio::test]
    async fn separate_submissions_of_the_same_text_are_separate_rows() {
        let store = Arc::new(InMemoryTaskStore::new());
        let handler = SubmissionHandler::new(store.clone(), RetryPolicy::immediate(3));

        let a = handler.handle(br#"{"task":"same"}"#).await.unwrap();
        let b = handler.handle(br#"{"task":"same"}"#).await.unwrap();

        assert_ne!(a.record.id, b.record.id);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn exhaustion_logs_one_record_per_attempt() {
        let logs = CapturedLogs::default();
        let _guard = logs.install();
        let store = Arc::new(FlakyStore::new(u32::MAX, transient()));
        let handler = SubmissionHandler::new(store, RetryPolicy::immediate(3));

        handler.submit(NewTask::from_raw("doomed").unwrap()).await.unwrap_err();

        let attempts = logs.with_field("outcome");
        assert_eq!(attempts.len(), 3);
        let numbers: Vec<_> = attempts.iter().map(|e| e["fields"]["attempt"].clone()).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert!(attempts.iter().all(|e| e["fields"]["max_attempts"] == 3));
        let outcomes: Vec<_> = attempts.iter().map(|e| e["fields"]["outcome"].clone()).collect();
        assert_eq!(outcomes, vec!["retrying", "retrying", "exhausted"]);
        assert!(
            attempts
                .iter()
                .all(|e| e["fields"]["error"].as_str().unwrap().contains("connection reset"))
        );
    }

    #[tokio::test]
    async fn success_after_a_retry_logs_both_attempts() {
        let logs = CapturedLogs::default();
        let _guard = logs.install();
        let store = Arc::new(FlakyStore::new(1, transient()));
        let handler = SubmissionHandler::new(store, RetryPolicy::immediate(3));

        let receipt = handler.submit(NewTask::from_raw("second time").unwrap()).await.unwrap();

        let attempts = logs.with_field("outcome");
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0]["fields"]["outcome"], "retrying");
        assert_eq!(attempts[1]["fields"]["outcome"], "inserted");
        assert_eq!(attempts[1]["fields"]["attempt"], 2);
        assert_eq!(attempts[1]["fields"]["task_id"], receipt.record.id.to_string());
    }

    #[tokio::test(start_paused = true)]
    async fn waits_between_attempts_follow_the_backoff() {
        let store = Arc::new(FlakyStore::new(2, transient()));
        let policy = RetryPolicy::default();
        let handler = SubmissionHandler::new(store.clone(), policy);

        let started = tokio::time::Instant::now();
        handler.submit(NewTask::from_raw("paced").unwrap()).await.unwrap();

        // 500ms after attempt 1, 1000ms after attempt 2.
        assert!(started.elapsed() >= Duration::from_millis(1500));
        assert_eq!(store.calls(), 3);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Property: any non-empty task string yields exactly one matching row.
        #[test]
        fn any_non_empty_task_is_stored_once(task in "[^\"\\\\]{1,64}", failures in 0u32..3) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            rt.block_on(async {
                let store = Arc::new(FlakyStore::new(failures, transient()));
                let handler = SubmissionHandler::new(store.clone(), RetryPolicy::immediate(3));
                let body = serde_json::json!({ "task": task }).to_string();

                let receipt = handler.handle(body.as_bytes()).await.unwrap();

                let rows = store.inner.records();
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0].payload.as_str(), task.as_str());
                assert!(!rows[0].processed);
                assert_eq!(receipt.attempts, failures + 1);
            });
        }
    }
}
