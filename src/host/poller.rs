//! Background poll timer.
//!
//! Keeps dispatching alive while the host's idle loop is suspended. The timer
//! only posts to the mailbox; the actual claim runs on the host loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::mailbox::{Mailbox, PostOutcome};

struct PollTimer {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PollTimer {
    fn dispose(self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

// Decrements the live-timer count however the task ends, including abort
// before its first poll.
struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct BackgroundPoller {
    mailbox: Mailbox,
    interval: Duration,
    timer: Option<PollTimer>,
    live_timers: Arc<AtomicUsize>,
}

impl BackgroundPoller {
    pub fn new(mailbox: Mailbox, interval: Duration) -> Self {
        Self {
            mailbox,
            interval,
            timer: None,
            live_timers: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.timer.is_some()
    }

    /// Start the timer. An existing timer is disposed first, so repeated
    /// enables never stack.
    pub fn enable(&mut self) {
        if let Some(old) = self.timer.take() {
            old.dispose();
        }
        self.timer = Some(self.spawn_timer());
        info!(interval_ms = self.interval.as_millis() as u64, "background polling enabled");
    }

    pub fn disable(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.dispose();
            info!("background polling disabled");
        }
    }

    /// Timer tasks that have not yet been torn down.
    pub fn live_timers(&self) -> usize {
        self.live_timers.load(Ordering::Acquire)
    }

    fn spawn_timer(&self) -> PollTimer {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let mailbox = self.mailbox.clone();
        let period = self.interval;

        self.live_timers.fetch_add(1, Ordering::AcqRel);
        let guard = LiveGuard(self.live_timers.clone());

        let task = tokio::spawn(async move {
            let _guard = guard;
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => match mailbox.post_background_poll() {
                        PostOutcome::Delivered | PostOutcome::Coalesced => {}
                        PostOutcome::Full => debug!("host mailbox full; poll tick dropped"),
                        PostOutcome::Closed => trace!("host gone; poll tick dropped"),
                    },
                }
            }
        });

        PollTimer { cancel, task }
    }
}

impl Drop for BackgroundPoller {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.dispose();
        }
    }
}
