//! Append-only execution log used for postmortem debugging.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;

use super::{now_ts, parse_column, parse_ts, Store, StoreError};
use crate::request::ParseEnumError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARNING" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            other => Err(ParseEnumError {
                field: "log level",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub id: i64,
    pub request_id: Option<i64>,
    pub level: LogLevel,
    pub source: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Store {
    pub fn append_log(
        &self,
        request_id: Option<i64>,
        level: LogLevel,
        source: &str,
        message: &str,
    ) -> Result<(), StoreError> {
        self.with_retry("append_log", |conn| {
            conn.execute(
                "INSERT INTO execution_log (request_id, level, source, message, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![request_id, level.as_str(), source, message, now_ts()],
            )?;
            Ok(())
        })
    }

    /// Most recent entries first, optionally restricted to one request.
    pub fn recent_log(
        &self,
        request_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<LogEntry>, StoreError> {
        self.with_retry("recent_log", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, request_id, level, source, message, created_at FROM execution_log
                 WHERE (?1 IS NULL OR request_id = ?1)
                 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![request_id, limit as i64], |row| {
                Ok(LogEntry {
                    id: row.get(0)?,
                    request_id: row.get(1)?,
                    level: parse_column(2, row.get(2)?)?,
                    source: row.get(3)?,
                    message: row.get(4)?,
                    created_at: parse_ts(5, row.get(5)?)?,
                })
            })?;
            rows.collect()
        })
    }
}
