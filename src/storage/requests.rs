//! Request queue operations: enqueue, atomic claim, terminal transition, cancel.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, Transaction, TransactionBehavior};

use super::{now_ts, parse_column, parse_opt_ts, parse_ts, to_ts, Store, StoreError};
use crate::request::{
    ErrorKind, NewRequest, NewResultItem, Request, RequestStatus, ResultItem, Summary,
    TerminalRecord,
};

const REQUEST_COLUMNS: &str = "id, kind, filter, target_mode, status, priority, created_at, \
     started_at, completed_at, error_kind, error_message, total_count, passed_count, \
     failed_count, skipped_count, duration_secs";

/// Result of a cancel attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled { was: RequestStatus },
    NotCancellable(RequestStatus),
    NotFound,
}

fn request_from_row(row: &Row<'_>) -> rusqlite::Result<Request> {
    let error_kind: Option<String> = row.get(9)?;
    Ok(Request {
        id: row.get(0)?,
        kind: parse_column(1, row.get(1)?)?,
        filter: row.get(2)?,
        target_mode: parse_column(3, row.get(3)?)?,
        status: parse_column(4, row.get(4)?)?,
        priority: row.get(5)?,
        created_at: parse_ts(6, row.get(6)?)?,
        started_at: parse_opt_ts(7, row.get(7)?)?,
        completed_at: parse_opt_ts(8, row.get(8)?)?,
        error_kind: error_kind.map(|k| parse_column::<ErrorKind>(9, k)).transpose()?,
        error_message: row.get(10)?,
        summary: Summary {
            total: row.get(11)?,
            passed: row.get(12)?,
            failed: row.get(13)?,
            skipped: row.get(14)?,
            duration_secs: row.get(15)?,
        },
    })
}

fn result_item_from_row(row: &Row<'_>) -> rusqlite::Result<ResultItem> {
    Ok(ResultItem {
        id: row.get(0)?,
        request_id: row.get(1)?,
        name: row.get(2)?,
        outcome: parse_column(3, row.get(3)?)?,
        duration_secs: row.get(4)?,
        message: row.get(5)?,
        stack_trace: row.get(6)?,
        created_at: parse_ts(7, row.get(7)?)?,
    })
}

impl Store {
    /// Insert a pending request and return its id.
    pub fn enqueue(&self, request: &NewRequest) -> Result<i64, StoreError> {
        self.with_retry("enqueue", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = now_ts();
            tx.execute(
                "INSERT INTO requests (kind, filter, target_mode, priority, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    request.kind.as_str(),
                    request.filter,
                    request.target_mode.as_str(),
                    request.priority,
                    now
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO execution_log (request_id, level, source, message, created_at)
                 VALUES (?1, 'INFO', 'controller', ?2, ?3)",
                params![
                    id,
                    format!(
                        "request submitted: {} on {} (priority {})",
                        request.kind, request.target_mode, request.priority
                    ),
                    now
                ],
            )?;
            tx.commit()?;
            Ok(id)
        })
    }

    /// Atomically move the best pending request to `running` and return it.
    ///
    /// Best means highest priority, then oldest. The select and the update are
    /// a single statement, so two pollers racing on the same file can never
    /// both receive the same row.
    pub fn claim_next_pending(&self) -> Result<Option<Request>, StoreError> {
        let sql = format!(
            "UPDATE requests SET status = 'running', started_at = ?1
             WHERE id = (
                 SELECT id FROM requests WHERE status = 'pending'
                 ORDER BY priority DESC, created_at ASC, id ASC
                 LIMIT 1
             ) AND status = 'pending'
             RETURNING {REQUEST_COLUMNS}"
        );
        self.with_retry("claim_next_pending", |conn| {
            conn.query_row(&sql, params![now_ts()], request_from_row)
                .optional()
        })
    }

    /// Write result items and flip a running request to `completed`/`failed`,
    /// all in one transaction.
    ///
    /// Returns `false` (and writes nothing) when the request is no longer
    /// running, e.g. because it was cancelled while the host was busy.
    pub fn finish_request(&self, id: i64, record: &TerminalRecord) -> Result<bool, StoreError> {
        if !RequestStatus::Running.can_transition_to(record.status)
            || record.status == RequestStatus::Cancelled
        {
            return Err(StoreError::InvalidTransition {
                id,
                to: record.status.to_string(),
            });
        }

        self.with_retry("finish_request", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = now_ts();

            append_result_items(&tx, id, &record.items, &now)?;

            let (error_kind, error_message) = match &record.failure {
                Some(f) => (Some(f.kind.as_str()), Some(f.message.as_str())),
                None => (None, None),
            };
            let changed = tx.execute(
                "UPDATE requests SET status = ?2, completed_at = ?3, error_kind = ?4,
                     error_message = ?5, total_count = ?6, passed_count = ?7,
                     failed_count = ?8, skipped_count = ?9, duration_secs = ?10
                 WHERE id = ?1 AND status = 'running'",
                params![
                    id,
                    record.status.as_str(),
                    now,
                    error_kind,
                    error_message,
                    record.summary.total,
                    record.summary.passed,
                    record.summary.failed,
                    record.summary.skipped,
                    record.summary.duration_secs
                ],
            )?;

            if changed == 0 {
                tx.rollback()?;
                return Ok(false);
            }
            tx.commit()?;
            Ok(true)
        })
    }

    /// Cancel a pending or running request.
    ///
    /// A running request keeps executing in the host; its eventual result is
    /// discarded by [`Store::finish_request`].
    pub fn cancel(&self, id: i64) -> Result<CancelOutcome, StoreError> {
        self.with_retry("cancel", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current: Option<String> = tx
                .query_row("SELECT status FROM requests WHERE id = ?1", [id], |row| {
                    row.get(0)
                })
                .optional()?;

            let Some(current) = current else {
                return Ok(CancelOutcome::NotFound);
            };
            let was: RequestStatus = parse_column(0, current)?;
            if !was.can_transition_to(RequestStatus::Cancelled) {
                return Ok(CancelOutcome::NotCancellable(was));
            }

            let now = now_ts();
            tx.execute(
                "UPDATE requests SET status = 'cancelled', completed_at = ?2,
                     error_kind = 'cancelled', error_message = 'Cancelled by user'
                 WHERE id = ?1 AND status = ?3",
                params![id, now, was.as_str()],
            )?;
            tx.execute(
                "INSERT INTO execution_log (request_id, level, source, message, created_at)
                 VALUES (?1, 'INFO', 'controller', ?2, ?3)",
                params![id, format!("request cancelled while {was}"), now],
            )?;
            tx.commit()?;
            Ok(CancelOutcome::Cancelled { was })
        })
    }

    /// Fail running requests claimed before `cutoff`.
    ///
    /// Used when no executor owns a run, so any `running` row older than the
    /// executor timeout was orphaned by a host that went away.
    pub fn fail_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<i64>, StoreError> {
        self.with_retry("fail_stale", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = now_ts();
            let ids = {
                let mut stmt = tx.prepare(
                    "UPDATE requests SET status = 'failed', completed_at = ?1,
                         error_kind = 'timeout',
                         error_message = 'stale: claimed but never completed'
                     WHERE status = 'running' AND started_at < ?2
                     RETURNING id",
                )?;
                let rows = stmt.query_map(params![now, to_ts(cutoff)], |row| row.get::<_, i64>(0))?;
                let ids = rows.collect::<rusqlite::Result<Vec<_>>>()?;
                ids
            };
            for id in &ids {
                tx.execute(
                    "INSERT INTO execution_log (request_id, level, source, message, created_at)
                     VALUES (?1, 'WARNING', 'dispatcher', 'stale running request failed', ?2)",
                    params![id, now],
                )?;
            }
            tx.commit()?;
            Ok(ids)
        })
    }

    pub fn get(&self, id: i64) -> Result<Option<Request>, StoreError> {
        let sql = format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE id = ?1");
        self.with_retry("get", |conn| {
            conn.query_row(&sql, [id], request_from_row).optional()
        })
    }

    /// All requests in `status`, in claim order.
    pub fn list_by_status(&self, status: RequestStatus) -> Result<Vec<Request>, StoreError> {
        let sql = format!(
            "SELECT {REQUEST_COLUMNS} FROM requests WHERE status = ?1
             ORDER BY priority DESC, created_at ASC, id ASC"
        );
        self.with_retry("list_by_status", |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([status.as_str()], request_from_row)?;
            rows.collect()
        })
    }

    pub fn result_items(&self, request_id: i64) -> Result<Vec<ResultItem>, StoreError> {
        self.with_retry("result_items", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, request_id, name, outcome, duration_secs, message, stack_trace, created_at
                 FROM result_items WHERE request_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map([request_id], result_item_from_row)?;
            rows.collect()
        })
    }
}

fn append_result_items(
    tx: &Transaction<'_>,
    request_id: i64,
    items: &[NewResultItem],
    now: &str,
) -> rusqlite::Result<()> {
    let mut stmt = tx.prepare(
        "INSERT INTO result_items (request_id, name, outcome, duration_secs, message, stack_trace, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    for item in items {
        stmt.execute(params![
            request_id,
            item.name,
            item.outcome.as_str(),
            item.duration_secs,
            item.message,
            item.stack_trace,
            now
        ])?;
    }
    Ok(())
}
