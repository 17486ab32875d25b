//! The host process's main context.
//!
//! One task owns the executor and serializes everything that touches it:
//! idle ticks, background polls, forced claims and capability events. Other
//! tasks and threads reach it only through the [`mailbox`].

pub mod mailbox;
pub mod poller;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use self::mailbox::{HostMessage, Inbox, Mailbox, PostOutcome};
use self::poller::BackgroundPoller;
use crate::capability::HostCapability;
use crate::config::JobrelayConfig;
use crate::dispatch::{Dispatcher, PollTrigger};
use crate::executor::Executor;
use crate::storage::{Component, Store, StoreError};

/// Extra age past the executor timeout before a running row counts as stale.
const STALE_GRACE: Duration = Duration::from_secs(60);

pub struct HostLoop {
    store: Store,
    capability: Arc<dyn HostCapability>,
    dispatcher: Dispatcher,
    executor: Executor,
    poller: BackgroundPoller,
    inbox: Inbox,
    idle_interval: Duration,
    polling_default: bool,
    suspended: Arc<AtomicBool>,
    shutdown: CancellationToken,
    session: Uuid,
}

/// Control surface for a running [`HostLoop`]. Cheap to clone.
#[derive(Clone)]
pub struct HostHandle {
    mailbox: Mailbox,
    store: Store,
    suspended: Arc<AtomicBool>,
    shutdown: CancellationToken,
    session: Uuid,
}

impl HostLoop {
    pub fn new(
        store: Store,
        capability: Arc<dyn HostCapability>,
        config: &JobrelayConfig,
    ) -> (Self, HostHandle) {
        let (mailbox, inbox) = mailbox::channel(config.host.mailbox_capacity);
        let executor = Executor::new(
            store.clone(),
            capability.clone(),
            mailbox.clone(),
            &config.executor,
        );
        let dispatcher = Dispatcher::new(store.clone(), config.executor.timeout() + STALE_GRACE);
        let poller = BackgroundPoller::new(mailbox.clone(), config.poller.interval());
        let suspended = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();
        let session = Uuid::new_v4();

        let handle = HostHandle {
            mailbox,
            store: store.clone(),
            suspended: suspended.clone(),
            shutdown: shutdown.clone(),
            session,
        };
        let host = Self {
            store,
            capability,
            dispatcher,
            executor,
            poller,
            inbox,
            idle_interval: config.host.idle_interval(),
            polling_default: config.poller.enabled_by_default,
            suspended,
            shutdown,
            session,
        };
        (host, handle)
    }

    /// Run until [`HostHandle::shutdown`] is called.
    pub async fn run(self) {
        let span = info_span!("host", session = %self.session);
        self.run_inner().instrument(span).await
    }

    async fn run_inner(mut self) {
        info!("host loop started");
        off_worker(|| {
            self.beat_component(Component::Store, "online");
            self.beat("online");
            if let Err(e) = self.dispatcher.recover_stale() {
                debug!(error = %e, "startup stale recovery failed");
            }
            self.reconcile_polling();
        });

        let mut idle = tokio::time::interval(self.idle_interval);
        idle.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                msg = self.inbox.recv() => match msg {
                    Some(msg) => off_worker(|| self.handle(msg)),
                    None => break,
                },
                _ = idle.tick() => {
                    if !self.suspended.load(Ordering::Acquire) {
                        off_worker(|| self.on_idle_tick());
                    }
                }
            }
        }

        self.poller.disable();
        off_worker(|| self.beat("offline"));
        info!("host loop stopped");
    }

    fn handle(&mut self, msg: HostMessage) {
        match msg {
            HostMessage::PollNow(PollTrigger::Background) => {
                self.reconcile_polling();
                if !self.poller.is_enabled() {
                    debug!("background poll arrived after polling was disabled");
                    return;
                }
                self.capability.request_host_refresh();
                self.executor.tick(Instant::now());
                self.dispatcher.poll(&mut self.executor, PollTrigger::Background);
            }
            HostMessage::PollNow(trigger) => {
                self.dispatcher.poll(&mut self.executor, trigger);
            }
            HostMessage::Capability { request_id, event } => {
                self.executor.on_event(request_id, event);
            }
            HostMessage::SetBackgroundPolling(enabled) => self.apply_polling(enabled),
        }
    }

    fn on_idle_tick(&mut self) {
        self.reconcile_polling();
        self.executor.tick(Instant::now());
        self.dispatcher.poll(&mut self.executor, PollTrigger::IdleLoop);
        let status = if self.executor.is_busy() { "busy" } else { "idle" };
        self.beat(status);
    }

    fn reconcile_polling(&mut self) {
        let wanted = match self.store.background_polling() {
            Ok(Some(enabled)) => enabled,
            Ok(None) => self.polling_default,
            Err(e) => {
                debug!(error = %e, "could not read background polling setting");
                return;
            }
        };
        if wanted != self.poller.is_enabled() {
            self.apply_polling(wanted);
        }
    }

    fn apply_polling(&mut self, enabled: bool) {
        if enabled {
            self.poller.enable();
        } else {
            self.poller.disable();
        }
    }

    fn beat(&self, status: &str) {
        self.beat_component(Component::Host, status);
    }

    fn beat_component(&self, component: Component, status: &str) {
        let message = format!("session {}", self.session);
        if let Err(e) = self.store.heartbeat(component, status, Some(&message)) {
            debug!(%component, error = %e, "heartbeat failed");
        }
    }
}

/// Run blocking store work without stalling other tasks on this worker.
/// A current-thread runtime has no other worker to hand off to, so `f` runs
/// inline there.
fn off_worker<R>(f: impl FnOnce() -> R) -> R {
    match Handle::try_current().map(|h| h.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(f),
        _ => f(),
    }
}

impl HostHandle {
    pub fn session_id(&self) -> Uuid {
        self.session
    }

    /// Ask the host to claim the next pending request now.
    pub fn dispatch_now(&self) -> PostOutcome {
        self.mailbox.post(HostMessage::PollNow(PollTrigger::Manual))
    }

    /// Stop idle ticks, as when the host application loses focus. Mailbox
    /// messages, including background polls, are still handled.
    pub fn suspend_idle_loop(&self) {
        self.suspended.store(true, Ordering::Release);
    }

    pub fn resume_idle_loop(&self) {
        self.suspended.store(false, Ordering::Release);
    }

    pub fn is_idle_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Persist the background-polling choice and apply it to the live host.
    pub fn set_background_polling(&self, enabled: bool) -> Result<(), StoreError> {
        self.store.set_background_polling(enabled)?;
        self.mailbox.post(HostMessage::SetBackgroundPolling(enabled));
        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
