use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use taskrelay_events::change_feed;
use taskrelay_infra::{
    AppConfig, ChangeObserver, InMemoryTaskStore, ListenerHandle, ObserverHandle,
    PgChangeListener, PostgresTaskStore, RetryPolicy, StorageConfig, SubmissionHandler,
    TaskStore, spawn_observer,
};

/// Everything the HTTP handlers need, plus the background pieces that must
/// live as long as the server does.
pub struct AppServices {
    submission: SubmissionHandler<Arc<dyn TaskStore>>,
    _observer: Option<ObserverHandle>,
    _listener: Option<ListenerHandle>,
}

impl AppServices {
    /// Submission path only, over an arbitrary store (no change observer).
    pub fn with_store(store: Arc<dyn TaskStore>, policy: RetryPolicy) -> Self {
        Self {
            submission: SubmissionHandler::new(store, policy),
            _observer: None,
            _listener: None,
        }
    }

    pub fn submission(&self) -> &SubmissionHandler<Arc<dyn TaskStore>> {
        &self.submission
    }
}

pub async fn build_services(config: &AppConfig) -> anyhow::Result<AppServices> {
    match &config.storage {
        StorageConfig::InMemory => Ok(build_in_memory_services(config)),
        StorageConfig::Postgres(_) => build_postgres_services(config).await,
    }
}

fn build_in_memory_services(config: &AppConfig) -> AppServices {
    // In-memory wiring (dev/test): the store announces its own inserts.
    let (publisher, stream) = change_feed();
    let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::with_change_feed(publisher));
    let observer = spawn_observer(stream, Arc::new(ChangeObserver::tracing()));

    info!(storage = "in_memory", "services ready");
    AppServices {
        submission: SubmissionHandler::new(store, config.retry.clone()),
        _observer: Some(observer),
        _listener: None,
    }
}

async fn build_postgres_services(config: &AppConfig) -> anyhow::Result<AppServices> {
    let StorageConfig::Postgres(pg) = &config.storage else {
        anyhow::bail!("postgres services requested without postgres configuration");
    };

    let store = PostgresTaskStore::connect_lazy(
        pg.session_options(config.retry.attempt_timeout),
        pg.max_connections,
        config.retry.attempt_timeout,
    );
    store
        .ensure_schema(&config.feed_channel)
        .await
        .context("failed to prepare task schema")?;

    // Database notifications -> in-process feed -> observer task.
    let (publisher, stream) = change_feed();
    let observer = spawn_observer(stream, Arc::new(ChangeObserver::tracing()));
    let listener = PgChangeListener::start(store.clone(), config.feed_channel.clone(), publisher)
        .await
        .context("failed to start change listener")?;

    let store: Arc<dyn TaskStore> = Arc::new(store);
    info!(storage = "postgres", channel = %config.feed_channel, "services ready");
    Ok(AppServices {
        submission: SubmissionHandler::new(store, config.retry.clone()),
        _observer: Some(observer),
        _listener: Some(listener),
    })
}
