//! Component heartbeats, persisted operator settings, and the status snapshot.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use super::{now_ts, parse_column, parse_ts, Store, StoreError};
use crate::request::ParseEnumError;

const BACKGROUND_POLLING_KEY: &str = "background_polling";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Controller,
    Host,
    Store,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Controller => "controller",
            Component::Host => "host",
            Component::Store => "store",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Component {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "controller" => Ok(Component::Controller),
            "host" => Ok(Component::Host),
            "store" => Ok(Component::Store),
            other => Err(ParseEnumError {
                field: "component",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Heartbeat {
    pub component: Component,
    pub status: String,
    pub message: Option<String>,
    pub last_seen: DateTime<Utc>,
}

impl Heartbeat {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_seen
    }
}

/// Liveness display for operators. Not used for correctness.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub pending: u32,
    pub running: u32,
    pub background_polling: Option<bool>,
    pub heartbeats: Vec<Heartbeat>,
}

impl Store {
    /// Upsert the liveness row for `component`.
    pub fn heartbeat(
        &self,
        component: Component,
        status: &str,
        message: Option<&str>,
    ) -> Result<(), StoreError> {
        self.with_retry("heartbeat", |conn| {
            conn.execute(
                "INSERT INTO component_heartbeats (component, status, message, last_seen)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(component) DO UPDATE SET
                     status = excluded.status,
                     message = excluded.message,
                     last_seen = excluded.last_seen",
                params![component.as_str(), status, message, now_ts()],
            )?;
            Ok(())
        })
    }

    pub fn status(&self) -> Result<StatusSnapshot, StoreError> {
        let (pending, running) = self.with_retry("status", |conn| {
            conn.query_row(
                "SELECT
                     COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0),
                     COALESCE(SUM(CASE WHEN status = 'running' THEN 1 ELSE 0 END), 0)
                 FROM requests",
                [],
                |row| Ok((row.get::<_, u32>(0)?, row.get::<_, u32>(1)?)),
            )
        })?;

        let heartbeats = self.with_retry("status", |conn| {
            let mut stmt = conn.prepare(
                "SELECT component, status, message, last_seen FROM component_heartbeats
                 ORDER BY component",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(Heartbeat {
                    component: parse_column(0, row.get(0)?)?,
                    status: row.get(1)?,
                    message: row.get(2)?,
                    last_seen: parse_ts(3, row.get(3)?)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;

        Ok(StatusSnapshot {
            pending,
            running,
            background_polling: self.background_polling()?,
            heartbeats,
        })
    }

    /// Persisted background-polling flag; `None` if never set.
    pub fn background_polling(&self) -> Result<Option<bool>, StoreError> {
        let value = self.with_retry("background_polling", |conn| {
            conn.query_row(
                "SELECT value FROM settings WHERE key = ?1",
                [BACKGROUND_POLLING_KEY],
                |row| row.get::<_, String>(0),
            )
            .optional()
        })?;
        Ok(value.map(|v| v == "true"))
    }

    pub fn set_background_polling(&self, enabled: bool) -> Result<(), StoreError> {
        self.with_retry("set_background_polling", |conn| {
            conn.execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![BACKGROUND_POLLING_KEY, enabled.to_string(), now_ts()],
            )?;
            Ok(())
        })
    }
}
