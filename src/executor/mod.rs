//! Runs one claimed request at a time against the host capability and writes
//! exactly one terminal record for it.
//!
//! Two independent paths can finish a run:
//!
//! - **callback**: the capability's `RunFinished` event, delivered through the
//!   mailbox;
//! - **fallback**: a new result artifact appearing in the results directory,
//!   checked from the idle tick. This is the path that still works when a
//!   runtime mode switch drops the capability's callbacks.
//!
//! A [`CompletionLatch`] lets only the first path through. The whole state
//! machine is driven from the host loop with an explicit `now`, so tests can
//! step it deterministically.

pub mod artifact;
pub mod latch;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use self::artifact::{newest_artifact, parse_artifacts, ArtifactError, ArtifactSet, ArtifactStamp};
use crate::capability::{CapabilityEvent, EventSink, HostCapability};
use crate::config::ExecutorConfig;
use crate::host::mailbox::Mailbox;
use crate::request::{
    ErrorKind, ExecutionFilter, Failure, FilterError, NewResultItem, Request, Summary,
    TerminalRecord,
};
use crate::storage::{LogLevel, Store};

pub use self::latch::{CompletionLatch, CompletionSource};

const LOG_SOURCE: &str = "executor";

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("capability could not be started: {0}")]
    Invocation(String),

    #[error("invalid request filter: {0}")]
    Filter(#[from] FilterError),

    #[error("no completion signal within {secs}s")]
    Timeout { secs: u64 },

    #[error("result artifact unusable: {0}")]
    Parse(#[from] ArtifactError),
}

impl ExecutionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutionError::Invocation(_) | ExecutionError::Filter(_) => ErrorKind::InvocationError,
            ExecutionError::Timeout { .. } => ErrorKind::Timeout,
            ExecutionError::Parse(_) => ErrorKind::ParseError,
        }
    }

    pub fn into_failure(self) -> Failure {
        Failure {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

struct ActiveRun {
    request: Request,
    latch: CompletionLatch,
    claimed_at: Instant,
    next_check: Instant,
    baseline: Option<ArtifactStamp>,
    /// Artifact found on the previous check, parsed on this one.
    staged: Option<PathBuf>,
    partial: Summary,
    partial_items: Vec<NewResultItem>,
    /// A completed record whose store write hit contention.
    unsaved: Option<TerminalRecord>,
}

impl ActiveRun {
    fn next_step(
        &mut self,
        now: Instant,
        results_dir: &Path,
        timeout: Duration,
        check_interval: Duration,
    ) -> Step {
        let id = self.request.id;

        if let Some(record) = self.unsaved.take() {
            return Step::Persist(record);
        }
        if self.latch.is_complete() {
            return Step::Idle;
        }

        if let Some(path) = self.staged.take() {
            let record = match ArtifactSet::for_path(&path)
                .ok_or_else(|| ArtifactError::Missing {
                    stem: path.display().to_string(),
                })
                .and_then(|set| parse_artifacts(&set))
            {
                Ok(parsed) => TerminalRecord::completed(parsed.summary, parsed.items),
                Err(e) => {
                    warn!(request_id = id, error = %e, "result artifact could not be used");
                    failed(e.into(), self.partial, self.partial_items.clone())
                }
            };
            return Step::Complete(CompletionSource::Fallback, record);
        }

        if now.saturating_duration_since(self.claimed_at) >= timeout {
            warn!(request_id = id, timeout_secs = timeout.as_secs(), "run timed out");
            let record = failed(
                ExecutionError::Timeout {
                    secs: timeout.as_secs(),
                },
                self.partial,
                std::mem::take(&mut self.partial_items),
            );
            return Step::Complete(CompletionSource::Timeout, record);
        }

        if now < self.next_check {
            return Step::Idle;
        }
        self.next_check = now + check_interval;

        match newest_artifact(results_dir) {
            Ok(Some(stamp)) if Some(&stamp) != self.baseline.as_ref() => {
                info!(request_id = id, artifact = %stamp.path.display(), "new result artifact; parsing next tick");
                self.staged = Some(stamp.path);
            }
            Ok(_) => {}
            Err(e) => debug!(request_id = id, error = %e, "results directory scan failed"),
        }
        Step::Idle
    }
}

enum Step {
    Idle,
    Persist(TerminalRecord),
    Complete(CompletionSource, TerminalRecord),
}

pub struct Executor {
    store: Store,
    capability: Arc<dyn HostCapability>,
    mailbox: Mailbox,
    results_dir: PathBuf,
    timeout: Duration,
    check_interval: Duration,
    active: Option<ActiveRun>,
}

impl Executor {
    pub fn new(
        store: Store,
        capability: Arc<dyn HostCapability>,
        mailbox: Mailbox,
        config: &ExecutorConfig,
    ) -> Self {
        Self {
            store,
            capability,
            mailbox,
            results_dir: config.results_dir.clone(),
            timeout: config.timeout(),
            check_interval: config.check_interval(),
            active: None,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_request_id(&self) -> Option<i64> {
        self.active.as_ref().map(|run| run.request.id)
    }

    /// Take ownership of a freshly claimed request and invoke the capability.
    pub fn start(&mut self, request: Request, now: Instant) {
        if let Some(current) = self.active_request_id() {
            // Nothing else owns this row; fail it rather than orphan it.
            error!(request_id = request.id, current, "executor busy; rejecting claimed request");
            let failure = ExecutionError::Invocation(format!("executor busy with request {current}"))
                .into_failure();
            if let Err(e) = self.store.finish_request(
                request.id,
                &TerminalRecord::failed(failure, Summary::default(), Vec::new()),
            ) {
                warn!(request_id = request.id, error = %e, "could not fail rejected request");
            }
            return;
        }

        let id = request.id;
        let filter = ExecutionFilter::from_request(&request);
        let baseline = match newest_artifact(&self.results_dir) {
            Ok(stamp) => stamp,
            Err(e) => {
                warn!(request_id = id, dir = %self.results_dir.display(), error = %e, "cannot scan results directory");
                None
            }
        };

        self.active = Some(ActiveRun {
            request,
            latch: CompletionLatch::new(),
            claimed_at: now,
            next_check: now + self.check_interval,
            baseline,
            staged: None,
            partial: Summary::default(),
            partial_items: Vec::new(),
            unsaved: None,
        });

        let filter = match filter {
            Ok(filter) => filter,
            Err(e) => {
                warn!(request_id = id, error = %e, "rejecting request with invalid filter");
                let record = failed(ExecutionError::from(e), Summary::default(), Vec::new());
                self.complete(CompletionSource::Invocation, record);
                return;
            }
        };

        self.journal(id, LogLevel::Info, &format!("invoking capability: {filter:?}"));
        let sink = EventSink::new(id, self.mailbox.clone());
        match self.capability.start(id, &filter, sink) {
            Ok(()) => info!(request_id = id, "capability started"),
            Err(e) if !filter.callbacks_reliable() => {
                // A mode switch can tear down the call after the run began.
                warn!(request_id = id, error = %e, "capability start failed; relying on result artifact");
                self.journal(
                    id,
                    LogLevel::Warning,
                    &format!("capability start reported {e}; waiting for result artifact"),
                );
            }
            Err(e) => {
                error!(request_id = id, error = %e, "capability start failed");
                let record = failed(
                    ExecutionError::Invocation(e.to_string()),
                    Summary::default(),
                    Vec::new(),
                );
                self.complete(CompletionSource::Invocation, record);
            }
        }
    }

    /// Handle an event marshalled from the capability.
    pub fn on_event(&mut self, request_id: i64, event: CapabilityEvent) {
        let Some(run) = self.active.as_mut() else {
            debug!(request_id, "event with no active run discarded");
            return;
        };
        if run.request.id != request_id {
            debug!(request_id, active = run.request.id, "event for another request discarded");
            return;
        }

        match event {
            CapabilityEvent::RunStarted => {
                debug!(request_id, "run started");
            }
            CapabilityEvent::ItemFinished(node) => {
                for item in node.to_items() {
                    run.partial.record(item.outcome, item.duration_secs);
                    run.partial_items.push(item);
                }
            }
            CapabilityEvent::RunFinished(Some(tree)) => {
                let record = TerminalRecord::completed(tree.summary(), tree.to_items());
                self.complete(CompletionSource::Callback, record);
            }
            CapabilityEvent::RunFinished(None) => {
                warn!(request_id, "finish callback carried no result; waiting for result artifact");
                self.journal(
                    request_id,
                    LogLevel::Warning,
                    "finish callback carried no result; waiting for result artifact",
                );
            }
        }
    }

    /// Drive the fallback path, the timeout and pending store writes.
    pub fn tick(&mut self, now: Instant) {
        let step = match self.active.as_mut() {
            None => Step::Idle,
            Some(run) => run.next_step(now, &self.results_dir, self.timeout, self.check_interval),
        };
        match step {
            Step::Idle => {}
            Step::Persist(record) => self.persist(record),
            Step::Complete(source, record) => self.complete(source, record),
        }
    }

    fn complete(&mut self, source: CompletionSource, record: TerminalRecord) {
        let Some(run) = self.active.as_ref() else {
            return;
        };
        if !run.latch.try_complete(source) {
            debug!(
                request_id = run.request.id,
                %source,
                winner = ?run.latch.winner(),
                "late completion discarded"
            );
            return;
        }
        info!(request_id = run.request.id, %source, status = %record.status, "run complete");
        self.persist(record);
    }

    fn persist(&mut self, record: TerminalRecord) {
        let Some(id) = self.active_request_id() else {
            return;
        };
        match self.store.finish_request(id, &record) {
            Ok(true) => {
                let message = match &record.failure {
                    Some(f) => format!("request {}: {} ({})", record.status, f.kind, f.message),
                    None => format!(
                        "request {}: {}/{} passed, {} failed, {} skipped in {:.2}s",
                        record.status,
                        record.summary.passed,
                        record.summary.total,
                        record.summary.failed,
                        record.summary.skipped,
                        record.summary.duration_secs
                    ),
                };
                let level = if record.failure.is_some() {
                    LogLevel::Error
                } else {
                    LogLevel::Info
                };
                self.journal(id, level, &message);
                self.active = None;
            }
            Ok(false) => {
                info!(request_id = id, "request no longer running; result discarded");
                self.journal(id, LogLevel::Info, "result discarded: request no longer running");
                self.active = None;
            }
            Err(e) if e.is_unavailable() => {
                warn!(request_id = id, error = %e, "terminal write deferred to next tick");
                if let Some(run) = self.active.as_mut() {
                    run.unsaved = Some(record);
                }
            }
            Err(e) => {
                error!(request_id = id, error = %e, "terminal write failed; run abandoned");
                self.active = None;
            }
        }
    }

    fn journal(&self, request_id: i64, level: LogLevel, message: &str) {
        if let Err(e) = self
            .store
            .append_log(Some(request_id), level, LOG_SOURCE, message)
        {
            debug!(request_id, error = %e, "execution log write failed");
        }
    }
}

fn failed(err: ExecutionError, partial: Summary, items: Vec<NewResultItem>) -> TerminalRecord {
    TerminalRecord::failed(err.into_failure(), partial, items)
}
