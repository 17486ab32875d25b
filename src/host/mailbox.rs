//! The host main context's mailbox.
//!
//! Every store write and capability call happens on the host loop. Timers and
//! capability threads only ever post here.
//!
//! Two lanes feed the host. Control messages (polls, setting changes) go
//! through a bounded queue and may be refused when it is full. Capability
//! events go through an unbounded lane and are never dropped while the host
//! is alive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::capability::CapabilityEvent;
use crate::dispatch::PollTrigger;

#[derive(Debug)]
pub enum HostMessage {
    PollNow(PollTrigger),
    Capability {
        request_id: i64,
        event: CapabilityEvent,
    },
    SetBackgroundPolling(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOutcome {
    Delivered,
    /// A background poll was already queued.
    Coalesced,
    Full,
    Closed,
}

/// Sending half; cheap to clone.
#[derive(Clone)]
pub struct Mailbox {
    tx: mpsc::Sender<HostMessage>,
    events: mpsc::UnboundedSender<HostMessage>,
    poll_queued: Arc<AtomicBool>,
}

/// Receiving half, owned by the host loop.
pub struct Inbox {
    rx: mpsc::Receiver<HostMessage>,
    events: mpsc::UnboundedReceiver<HostMessage>,
    poll_queued: Arc<AtomicBool>,
}

/// `capacity` bounds the control lane only.
pub fn channel(capacity: usize) -> (Mailbox, Inbox) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let poll_queued = Arc::new(AtomicBool::new(false));
    (
        Mailbox {
            tx,
            events: events_tx,
            poll_queued: poll_queued.clone(),
        },
        Inbox {
            rx,
            events: events_rx,
            poll_queued,
        },
    )
}

impl Mailbox {
    /// Never blocks. Control messages are refused with `Full` when the
    /// bounded lane is saturated; capability events only fail once the host
    /// is gone.
    pub fn post(&self, msg: HostMessage) -> PostOutcome {
        if let HostMessage::Capability { .. } = msg {
            return match self.events.send(msg) {
                Ok(()) => PostOutcome::Delivered,
                Err(_) => PostOutcome::Closed,
            };
        }
        match self.tx.try_send(msg) {
            Ok(()) => PostOutcome::Delivered,
            Err(TrySendError::Full(_)) => PostOutcome::Full,
            Err(TrySendError::Closed(_)) => PostOutcome::Closed,
        }
    }

    /// Queue a background poll unless one is already waiting.
    pub fn post_background_poll(&self) -> PostOutcome {
        if self.poll_queued.swap(true, Ordering::AcqRel) {
            return PostOutcome::Coalesced;
        }
        let outcome = self.post(HostMessage::PollNow(PollTrigger::Background));
        if outcome != PostOutcome::Delivered {
            self.poll_queued.store(false, Ordering::Release);
        }
        outcome
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Inbox {
    /// Next message, capability events first. `None` once every sender is
    /// gone and both lanes are drained.
    pub async fn recv(&mut self) -> Option<HostMessage> {
        let msg = tokio::select! {
            biased;
            Some(msg) = self.events.recv() => Some(msg),
            msg = self.rx.recv() => match msg {
                Some(msg) => Some(msg),
                None => self.events.recv().await,
            },
        };
        self.observe(msg.as_ref());
        msg
    }

    pub fn try_recv(&mut self) -> Option<HostMessage> {
        let msg = self
            .events
            .try_recv()
            .ok()
            .or_else(|| self.rx.try_recv().ok());
        self.observe(msg.as_ref());
        msg
    }

    fn observe(&self, msg: Option<&HostMessage>) {
        if let Some(HostMessage::PollNow(PollTrigger::Background)) = msg {
            self.poll_queued.store(false, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_polls_coalesce_until_received() {
        let (mailbox, mut inbox) = channel(8);
        assert_eq!(mailbox.post_background_poll(), PostOutcome::Delivered);
        assert_eq!(mailbox.post_background_poll(), PostOutcome::Coalesced);

        assert!(matches!(
            inbox.try_recv(),
            Some(HostMessage::PollNow(PollTrigger::Background))
        ));
        assert!(inbox.try_recv().is_none());

        assert_eq!(mailbox.post_background_poll(), PostOutcome::Delivered);
    }

    #[test]
    fn test_manual_polls_are_not_coalesced() {
        let (mailbox, mut inbox) = channel(8);
        mailbox.post(HostMessage::PollNow(PollTrigger::Manual));
        mailbox.post(HostMessage::PollNow(PollTrigger::Manual));
        assert!(inbox.try_recv().is_some());
        assert!(inbox.try_recv().is_some());
    }

    #[test]
    fn test_full_mailbox_does_not_wedge_coalescing() {
        let (mailbox, mut inbox) = channel(1);
        mailbox.post(HostMessage::SetBackgroundPolling(true));
        assert_eq!(mailbox.post_background_poll(), PostOutcome::Full);

        inbox.try_recv();
        assert_eq!(mailbox.post_background_poll(), PostOutcome::Delivered);
    }

    fn event(request_id: i64) -> HostMessage {
        HostMessage::Capability {
            request_id,
            event: CapabilityEvent::RunStarted,
        }
    }

    #[test]
    fn test_capability_events_bypass_the_bound() {
        let (mailbox, mut inbox) = channel(2);
        mailbox.post(HostMessage::PollNow(PollTrigger::Manual));
        mailbox.post(HostMessage::PollNow(PollTrigger::Manual));
        assert_eq!(
            mailbox.post(HostMessage::PollNow(PollTrigger::Manual)),
            PostOutcome::Full
        );
        for id in 0..10 {
            assert_eq!(mailbox.post(event(id)), PostOutcome::Delivered);
        }

        let mut seen = Vec::new();
        while let Some(msg) = inbox.try_recv() {
            if let HostMessage::Capability { request_id, .. } = msg {
                seen.push(request_id);
            }
        }
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_recv_drains_events_after_senders_drop() {
        let (mailbox, mut inbox) = channel(2);
        mailbox.post(event(1));
        mailbox.post(HostMessage::SetBackgroundPolling(true));
        drop(mailbox);

        assert!(matches!(
            inbox.recv().await,
            Some(HostMessage::Capability { request_id: 1, .. })
        ));
        assert!(matches!(
            inbox.recv().await,
            Some(HostMessage::SetBackgroundPolling(true))
        ));
        assert!(inbox.recv().await.is_none());
    }

    #[test]
    fn test_closed_after_inbox_dropped() {
        let (mailbox, inbox) = channel(4);
        drop(inbox);
        assert!(mailbox.is_closed());
        assert_eq!(mailbox.post_background_poll(), PostOutcome::Closed);
        assert_eq!(mailbox.post(event(1)), PostOutcome::Closed);
    }
}
