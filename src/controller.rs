//! Controller side of the queue: submit work, inspect it, cancel it.
//!
//! Controllers share nothing with the host but the store file.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::request::{NewRequest, Request, RequestKind, RequestStatus, ResultItem, TargetMode};
use crate::storage::{CancelOutcome, Component, LogEntry, StatusSnapshot, Store, StoreError};

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("request {0} not found")]
    NotFound(i64),

    #[error("request {id} still {status} after {timeout:?}")]
    TimedOut {
        id: i64,
        timeout: Duration,
        status: RequestStatus,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct Controller {
    store: Store,
}

impl Controller {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    fn beat(&self) {
        if let Err(e) = self.store.heartbeat(Component::Controller, "online", None) {
            debug!(error = %e, "controller heartbeat failed");
        }
    }

    pub fn submit(&self, request: NewRequest) -> Result<i64, StoreError> {
        self.beat();
        let id = self.store.enqueue(&request)?;
        info!(
            request_id = id,
            kind = %request.kind,
            mode = %request.target_mode,
            priority = request.priority,
            "request submitted"
        );
        Ok(id)
    }

    /// Submit an asset refresh; no paths means a full refresh.
    pub fn submit_refresh(&self, paths: &[String], priority: i64) -> Result<i64, StoreError> {
        let request = if paths.is_empty() {
            NewRequest::new(RequestKind::RefreshFull, TargetMode::EditorMode)
        } else {
            // paths may contain commas; the JSON array form is unambiguous
            let filter = serde_json::to_string(paths).unwrap_or_default();
            NewRequest::new(RequestKind::RefreshPaths, TargetMode::EditorMode).with_filter(filter)
        };
        self.submit(request.with_priority(priority))
    }

    pub fn request(&self, id: i64) -> Result<Option<Request>, StoreError> {
        self.beat();
        self.store.get(id)
    }

    pub fn results(&self, id: i64) -> Result<Vec<ResultItem>, StoreError> {
        self.beat();
        self.store.result_items(id)
    }

    pub fn list(&self, status: RequestStatus) -> Result<Vec<Request>, StoreError> {
        self.beat();
        self.store.list_by_status(status)
    }

    pub fn cancel(&self, id: i64) -> Result<CancelOutcome, StoreError> {
        self.beat();
        let outcome = self.store.cancel(id)?;
        info!(request_id = id, ?outcome, "cancel requested");
        Ok(outcome)
    }

    pub fn status(&self) -> Result<StatusSnapshot, StoreError> {
        self.beat();
        self.store.status()
    }

    pub fn log(&self, request_id: Option<i64>, limit: usize) -> Result<Vec<LogEntry>, StoreError> {
        self.beat();
        self.store.recent_log(request_id, limit)
    }

    pub fn set_background_polling(&self, enabled: bool) -> Result<(), StoreError> {
        self.beat();
        self.store.set_background_polling(enabled)
    }

    /// Poll the store until `id` reaches a terminal state.
    pub async fn wait_for_completion(
        &self,
        id: i64,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Request, WaitError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut last_status = None;

        loop {
            let request = self.store.get(id)?.ok_or(WaitError::NotFound(id))?;
            if last_status != Some(request.status) {
                info!(request_id = id, status = %request.status, "request status");
                last_status = Some(request.status);
            }
            if request.status.is_terminal() {
                return Ok(request);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WaitError::TimedOut {
                    id,
                    timeout,
                    status: request.status,
                });
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}
