//! Process configuration.
//!
//! Loaded once at bootstrap from the environment and handed to the
//! components that need it; nothing reads the environment after that.
//!
//! | variable | meaning | default |
//! |----------|---------|---------|
//! | `SqlConnectionString` | ADO-style connection string, see `from_ado` | unset |
//! | `DATABASE_URL` | Postgres URL, used when `SqlConnectionString` is unset | unset |
//! | `TASKRELAY_BIND` | HTTP listen address | `0.0.0.0:8080` |
//! | `TASKRELAY_MAX_ATTEMPTS` | insert attempts per submission | `3` |
//! | `TASKRELAY_RETRY_STEP_MS` | linear backoff step | `500` |
//! | `TASKRELAY_ATTEMPT_TIMEOUT_SECS` | per-attempt and statement timeout, > 0 | `10` |
//! | `TASKRELAY_FEED_CHANNEL` | LISTEN/NOTIFY channel | `task_changes` |
//! | `TASKRELAY_MAX_CONNECTIONS` | pool size | `10` |
//!
//! With neither connection variable set the process runs on the in-memory store.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgSslMode};
use thiserror::Error;

use crate::retry::{Backoff, RetryPolicy};
use crate::schema;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Postgres connection settings.
///
/// `Debug` never prints the password.
#[derive(Clone)]
pub struct PgConnectionConfig {
    options: PgConnectOptions,
    pub max_connections: u32,
}

impl core::fmt::Debug for PgConnectionConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PgConnectionConfig")
            .field("host", &self.options.get_host())
            .field("port", &self.options.get_port())
            .field("database", &self.options.get_database())
            .field("username", &self.options.get_username())
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

impl PgConnectionConfig {
    const DEFAULT_PORT: u16 = 5432;
    const DEFAULT_MAX_CONNECTIONS: u32 = 10;

    /// Parse an ADO-style `key=value;...` connection string.
    ///
    /// Recognised keys (case-insensitive): `Server`/`Data Source`/`Host`
    /// (`tcp:host,port`, `host,port` or `host`), `Initial Catalog`/`Database`,
    /// `User ID`/`UID`/`User`, `Password`/`PWD`, `Encrypt`. Unknown keys are
    /// ignored. Server, database, user and password are required.
    pub fn from_ado(raw: &str) -> Result<Self, ConfigError> {
        let mut host = None;
        let mut port = None;
        let mut database = None;
        let mut user = None;
        let mut password = None;
        let mut encrypt = false;

        for part in raw.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part.split_once('=').ok_or_else(|| {
                ConfigError::InvalidConnectionString(format!("segment without '=': {part:?}"))
            })?;
            let value = value.trim();

            match key.trim().to_ascii_lowercase().as_str() {
                "server" | "data source" | "host" | "address" => {
                    let (h, p) = parse_server(value)?;
                    host = Some(h);
                    port = p;
                }
                "initial catalog" | "database" => database = Some(value.to_string()),
                "user id" | "uid" | "user" | "username" => user = Some(value.to_string()),
                "password" | "pwd" => password = Some(value.to_string()),
                "encrypt" => {
                    encrypt = matches!(
                        value.to_ascii_lowercase().as_str(),
                        "true" | "yes" | "mandatory"
                    )
                }
                _ => {}
            }
        }

        let missing =
            |field: &str| ConfigError::InvalidConnectionString(format!("missing {field}"));
        let host = host.ok_or_else(|| missing("server"))?;
        let database = database.ok_or_else(|| missing("initial catalog"))?;
        let user = user.ok_or_else(|| missing("user id"))?;
        let password = password.ok_or_else(|| missing("password"))?;

        let options = PgConnectOptions::new()
            .host(&host)
            .port(port.unwrap_or(Self::DEFAULT_PORT))
            .database(&database)
            .username(&user)
            .password(&password)
            .ssl_mode(if encrypt { PgSslMode::Require } else { PgSslMode::Prefer });

        Ok(Self {
            options,
            max_connections: Self::DEFAULT_MAX_CONNECTIONS,
        })
    }

    /// Parse a `postgres://` URL.
    pub fn from_url(url: &str) -> Result<Self, ConfigError> {
        let options = PgConnectOptions::from_str(url)
            .map_err(|e| ConfigError::InvalidConnectionString(e.to_string()))?;
        Ok(Self {
            options,
            max_connections: Self::DEFAULT_MAX_CONNECTIONS,
        })
    }

    pub fn connect_options(&self) -> PgConnectOptions {
        self.options.clone()
    }

    /// Connection options with a server-side `statement_timeout`.
    ///
    /// A statement cut off by the server is rolled back (SQLSTATE `57014`),
    /// so the attempt can be retried without leaving a row behind.
    pub fn session_options(&self, statement_timeout: Duration) -> PgConnectOptions {
        let millis = statement_timeout.as_millis().max(1);
        self.options
            .clone()
            .options([("statement_timeout", format!("{millis}ms"))])
    }
}

fn parse_server(value: &str) -> Result<(String, Option<u16>), ConfigError> {
    let value = value.strip_prefix("tcp:").unwrap_or(value);
    let (host, port) = match value.split_once(',') {
        Some((host, port)) => {
            let port = port
                .trim()
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidConnectionString(format!("bad port {port:?}")))?;
            (host.trim(), Some(port))
        }
        None => (value.trim(), None),
    };

    if host.is_empty() {
        return Err(ConfigError::InvalidConnectionString("empty server".to_string()));
    }
    Ok((host.to_string(), port))
}

#[derive(Debug, Clone)]
pub enum StorageConfig {
    /// Process-local store and feed (dev/test).
    InMemory,
    Postgres(PgConnectionConfig),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub storage: StorageConfig,
    pub retry: RetryPolicy,
    pub feed_channel: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            storage: StorageConfig::InMemory,
            retry: RetryPolicy::default(),
            feed_channel: schema::DEFAULT_CHANNEL.to_string(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment, or a map in tests).
    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let mut cfg = AppConfig::default();

        if let Some(bind) = lookup("TASKRELAY_BIND") {
            cfg.bind_addr = parse_value("TASKRELAY_BIND", &bind)?;
        }

        let mut pg = match (lookup("SqlConnectionString"), lookup("DATABASE_URL")) {
            (Some(ado), _) if !ado.trim().is_empty() => Some(PgConnectionConfig::from_ado(&ado)?),
            (_, Some(url)) if !url.trim().is_empty() => Some(PgConnectionConfig::from_url(&url)?),
            _ => None,
        };
        if let (Some(pg), Some(max)) = (pg.as_mut(), lookup("TASKRELAY_MAX_CONNECTIONS")) {
            pg.max_connections = parse_value("TASKRELAY_MAX_CONNECTIONS", &max)?;
        }
        if let Some(pg) = pg {
            cfg.storage = StorageConfig::Postgres(pg);
        }

        if let Some(v) = lookup("TASKRELAY_MAX_ATTEMPTS") {
            let attempts: u32 = parse_value("TASKRELAY_MAX_ATTEMPTS", &v)?;
            if attempts == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "TASKRELAY_MAX_ATTEMPTS",
                    value: v,
                });
            }
            cfg.retry.max_attempts = attempts;
        }
        if let Some(v) = lookup("TASKRELAY_RETRY_STEP_MS") {
            let step: u64 = parse_value("TASKRELAY_RETRY_STEP_MS", &v)?;
            cfg.retry.backoff = Backoff::Linear {
                step: Duration::from_millis(step),
            };
        }
        if let Some(v) = lookup("TASKRELAY_ATTEMPT_TIMEOUT_SECS") {
            let secs: u64 = parse_value("TASKRELAY_ATTEMPT_TIMEOUT_SECS", &v)?;
            if secs == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "TASKRELAY_ATTEMPT_TIMEOUT_SECS",
                    value: v,
                });
            }
            cfg.retry.attempt_timeout = Duration::from_secs(secs);
        }

        if let Some(channel) = lookup("TASKRELAY_FEED_CHANNEL") {
            if !schema::is_valid_channel(&channel) {
                return Err(ConfigError::InvalidValue {
                    key: "TASKRELAY_FEED_CHANNEL",
                    value: channel,
                });
            }
            cfg.feed_channel = channel;
        }

        Ok(cfg)
    }
}

fn parse_value<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
    })
}
