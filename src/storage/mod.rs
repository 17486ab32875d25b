//! SQLite request store -- schema, pooled connections, lock-tolerant access.
//!
//! The database file is shared with the controller process, so every
//! operation goes through [`Store::with_retry`]: busy/locked errors and pool
//! checkout failures are retried with bounded exponential backoff before the
//! caller sees [`StoreError::Unavailable`].

pub mod journal;
pub mod requests;
pub mod schema;
pub mod status;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rand::Rng;
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::StoreConfig;

pub use self::journal::{LogEntry, LogLevel};
pub use self::requests::CancelOutcome;
pub use self::status::{Component, Heartbeat, StatusSnapshot};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable during {op} after {attempts} attempt(s): {last_error}")]
    Unavailable {
        op: &'static str,
        attempts: u32,
        last_error: String,
    },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("request {id} cannot move to {to}")]
    InvalidTransition { id: i64, to: String },

    #[error("failed to prepare database directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    /// Transient contention that the next tick may get past.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. })
    }
}

/// Bounded exponential backoff for lock contention.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(1_000),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), with up to 50% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let exp = self
            .base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay);
        let jitter_ms = exp.as_millis() as u64 / 2;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        exp + Duration::from_millis(jitter)
    }
}

/// Handle to the request store. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct Store {
    pool: Pool,
    retry: RetryPolicy,
}

impl Store {
    /// Open (or create) the store described by `config` and run migrations.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let retry = RetryPolicy {
            max_attempts: config.retry_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        };
        let pool = open_pool(&config.path, config)?;
        let store = Self { pool, retry };

        store.with_retry("migrate", |conn| schema::migrate(conn))?;
        Ok(store)
    }

    /// Run `f` on a pooled connection, retrying lock contention with backoff.
    pub(crate) fn with_retry<T, F>(&self, op: &'static str, mut f: F) -> Result<T, StoreError>
    where
        F: FnMut(&mut Connection) -> rusqlite::Result<T>,
    {
        let mut attempt = 1;
        loop {
            let last_error = match self.pool.get() {
                Ok(mut conn) => match f(&mut conn) {
                    Ok(value) => return Ok(value),
                    Err(e) if is_contention(&e) => e.to_string(),
                    Err(e) => return Err(StoreError::Sqlite(e)),
                },
                Err(e) => e.to_string(),
            };

            if attempt >= self.retry.max_attempts {
                warn!(%op, attempts = attempt, error = %last_error, "store retry budget exhausted");
                return Err(StoreError::Unavailable {
                    op,
                    attempts: attempt,
                    last_error,
                });
            }

            let delay = self.retry.delay_for(attempt);
            debug!(%op, attempt, ?delay, error = %last_error, "store contended, backing off");
            std::thread::sleep(delay);
            attempt += 1;
        }
    }
}

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path, config: &StoreConfig) -> Result<Pool, StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Directory {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }

    let busy_timeout = Duration::from_millis(config.busy_timeout_ms);
    let manager = SqliteConnectionManager::file(path).with_init(move |c| {
        let _mode: String = c.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        // synchronous = NORMAL, temp_store = MEMORY
        c.pragma_update(None, "synchronous", 1)?;
        c.pragma_update(None, "temp_store", 2)?;
        c.pragma_update(None, "foreign_keys", true)?;
        c.busy_timeout(busy_timeout)
    });

    let pool = R2D2Pool::builder()
        .max_size(config.pool_size.max(1))
        .connection_timeout(Duration::from_millis(config.connection_timeout_ms))
        .build(manager)
        .map_err(|e| StoreError::Unavailable {
            op: "open",
            attempts: 1,
            last_error: e.to_string(),
        })?;

    Ok(pool)
}

fn is_contention(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        }
        _ => false,
    }
}

/// Current time in the fixed-width form stored in every timestamp column.
/// Fixed width keeps lexical order equal to chronological order.
pub(crate) fn now_ts() -> String {
    to_ts(Utc::now())
}

pub(crate) fn to_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(idx, s)).transpose()
}

/// Parse a TEXT column into one of the model enums.
pub(crate) fn parse_column<T>(idx: usize, raw: String) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
        };
        let first = policy.delay_for(1);
        assert!(first >= Duration::from_millis(10) && first <= Duration::from_millis(15));
        let third = policy.delay_for(3);
        assert!(third >= Duration::from_millis(40) && third <= Duration::from_millis(60));
        // capped: never more than max + 50% jitter
        assert!(policy.delay_for(12) <= Duration::from_millis(60));
    }

    #[test]
    fn test_timestamps_sort_chronologically() {
        let a = to_ts(DateTime::parse_from_rfc3339("2024-01-01T09:00:00Z").unwrap().with_timezone(&Utc));
        let b = to_ts(DateTime::parse_from_rfc3339("2024-01-01T10:00:00.5Z").unwrap().with_timezone(&Utc));
        assert!(a < b);
        assert_eq!(a.len(), b.len());
        assert_eq!(parse_ts(0, b.clone()).unwrap().timestamp_subsec_millis(), 500);
    }
}
