//! Claims pending work for the executor.
//!
//! Three triggers share this path: the host's idle tick, the background
//! poller, and an explicit force-claim. All of them run on the host loop.

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, trace, warn};

use crate::executor::Executor;
use crate::storage::{LogLevel, Store, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollTrigger {
    IdleLoop,
    Background,
    Manual,
}

impl fmt::Display for PollTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            PollTrigger::IdleLoop => "idle-loop",
            PollTrigger::Background => "background",
            PollTrigger::Manual => "manual",
        })
    }
}

pub struct Dispatcher {
    store: Store,
    /// Running rows older than this with no local owner are orphans.
    stale_after: Duration,
}

impl Dispatcher {
    pub fn new(store: Store, stale_after: Duration) -> Self {
        Self { store, stale_after }
    }

    /// Claim and start the next request if the executor is free.
    ///
    /// Returns the claimed id. Store errors are logged and treated as "nothing
    /// claimed"; the next trigger tries again.
    pub fn poll(&self, executor: &mut Executor, trigger: PollTrigger) -> Option<i64> {
        match self.try_poll(executor, trigger, Instant::now()) {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!(%trigger, error = %e, "dispatch poll failed");
                None
            }
        }
    }

    pub fn try_poll(
        &self,
        executor: &mut Executor,
        trigger: PollTrigger,
        now: Instant,
    ) -> Result<Option<i64>, StoreError> {
        if let Some(active) = executor.active_request_id() {
            trace!(%trigger, active, "executor busy; skipping poll");
            return Ok(None);
        }

        self.recover_stale()?;

        let Some(request) = self.store.claim_next_pending()? else {
            trace!(%trigger, "nothing to claim");
            return Ok(None);
        };

        let id = request.id;
        info!(
            request_id = id,
            kind = %request.kind,
            mode = %request.target_mode,
            priority = request.priority,
            %trigger,
            "claimed request"
        );
        if let Err(e) = self.store.append_log(
            Some(id),
            LogLevel::Info,
            "dispatcher",
            &format!("claimed by {trigger} poll"),
        ) {
            debug!(request_id = id, error = %e, "execution log write failed");
        }

        executor.start(request, now);
        Ok(Some(id))
    }

    /// Fail running rows that no executor can still own.
    ///
    /// Only valid while the local executor is idle.
    pub fn recover_stale(&self) -> Result<Vec<i64>, StoreError> {
        let cutoff = chrono::Duration::from_std(self.stale_after)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let ids = self.store.fail_stale(cutoff)?;
        for id in &ids {
            warn!(request_id = id, "stale running request failed");
        }
        Ok(ids)
    }
}
