use crate::clock::Clock;
use crate::store::DEFAULT_LEASE_SECS;
use crate::store::MAX_REMINDERS;
use crate::store::StateMachine;
use crate::store::memory::MemEngine;
use chrono::Duration;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[cfg(feature = "sqlite")]
use crate::store::sqlite::SqlConfig;
#[cfg(feature = "sqlite")]
use crate::store::sqlite::SqlEngine;
#[cfg(feature = "sqlite")]
use crate::store::time_writer::writer_for;
#[cfg(feature = "sqlite")]
use crate::values::OpaqueValues;

/// Engine selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Memory,
    #[cfg(feature = "sqlite")]
    Sqlite,
}

/// How the relational engine stores times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeEncoding {
    /// Text computed by SQLite's own clock.
    Native,
    /// Integer microseconds resolved against the injected clock.
    #[default]
    Micros,
}

/// Choose backend using env `NOTIFY_STORE_BACKEND` if present: `sqlite` or `memory`.
/// Defaults to memory; if `sqlite` is requested but not compiled in, falls back to memory.
pub fn choose_backend_from_env() -> Backend {
    let v = std::env::var("NOTIFY_STORE_BACKEND").unwrap_or_default();
    match v.as_str() {
        #[cfg(feature = "sqlite")]
        "sqlite" | "SQLITE" => Backend::Sqlite,
        _ => Backend::Memory,
    }
}

fn time_encoding_from_env() -> TimeEncoding {
    let v = std::env::var("NOTIFY_STORE_TIME").unwrap_or_default();
    match v.as_str() {
        "native" | "NATIVE" => TimeEncoding::Native,
        _ => TimeEncoding::Micros,
    }
}

fn env_number(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: Backend,
    /// SQLite file. `None` opens a private in-memory database.
    pub db_path: Option<PathBuf>,
    pub time_encoding: TimeEncoding,
    pub lease_duration: Duration,
    pub busy_timeout: std::time::Duration,
    pub max_reminders: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            db_path: None,
            time_encoding: TimeEncoding::default(),
            lease_duration: Duration::seconds(DEFAULT_LEASE_SECS),
            busy_timeout: std::time::Duration::from_secs(5),
            max_reminders: MAX_REMINDERS,
        }
    }
}

impl StoreConfig {
    /// Defaults overridden by:
    /// - `NOTIFY_STORE_BACKEND`: `memory` or `sqlite`
    /// - `NOTIFY_STORE_DB`: SQLite file path
    /// - `NOTIFY_STORE_TIME`: `native` or `micros`
    /// - `NOTIFY_STORE_LEASE_SECS`
    /// - `NOTIFY_STORE_BUSY_TIMEOUT_MS`
    ///
    /// Unparseable values keep the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            backend: choose_backend_from_env(),
            db_path: std::env::var("NOTIFY_STORE_DB").ok().map(PathBuf::from),
            time_encoding: time_encoding_from_env(),
            lease_duration: env_number("NOTIFY_STORE_LEASE_SECS")
                .and_then(|s| i64::try_from(s).ok())
                .map_or(defaults.lease_duration, Duration::seconds),
            busy_timeout: env_number("NOTIFY_STORE_BUSY_TIMEOUT_MS")
                .map_or(defaults.busy_timeout, std::time::Duration::from_millis),
            max_reminders: defaults.max_reminders,
        }
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    pub fn with_time_encoding(mut self, encoding: TimeEncoding) -> Self {
        self.time_encoding = encoding;
        self
    }
}

/// Build the configured engine. For SQLite the database's parent directory
/// is created and the schema applied.
pub fn open_store(
    config: &StoreConfig,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<Box<dyn StateMachine>> {
    Ok(match config.backend {
        Backend::Memory => {
            info!("opening in-memory notification store");
            Box::new(MemEngine::new(clock))
        }
        #[cfg(feature = "sqlite")]
        Backend::Sqlite => {
            let values = Arc::new(OpaqueValues::new());
            let writer = writer_for(config.time_encoding);
            let sql_config = SqlConfig {
                lease_duration: config.lease_duration,
                busy_timeout: config.busy_timeout,
                max_reminders: config.max_reminders,
            };
            let engine = match &config.db_path {
                Some(path) => {
                    if let Some(dir) = path.parent() {
                        std::fs::create_dir_all(dir)?;
                    }
                    info!(path = %path.display(), encoding = ?config.time_encoding, "opening sqlite notification store");
                    SqlEngine::open(path, values, writer, clock, sql_config)?
                }
                None => {
                    let conn = rusqlite::Connection::open_in_memory()?;
                    SqlEngine::new(conn, values, writer, clock, sql_config)?
                }
            };
            Box::new(engine)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    #[test]
    fn default_config_opens_memory_engine() {
        let store = open_store(&StoreConfig::default(), Arc::new(SystemClock)).unwrap();
        assert!(store.is_ephemeral());
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn sqlite_config_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("notify.db");
        let config = StoreConfig::default()
            .with_backend(Backend::Sqlite)
            .with_db_path(&path);
        let store = open_store(&config, Arc::new(SystemClock)).unwrap();
        assert!(!store.is_ephemeral());
        assert!(path.exists());
    }
}
