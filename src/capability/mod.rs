//! Host capability boundary -- the execution engine that actually runs tests
//! or refreshes assets, and the events it reports back.
//!
//! Capabilities never touch the store. They report through an [`EventSink`],
//! which marshals every event into the host's main context via the mailbox.

pub mod command;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::host::mailbox::{HostMessage, Mailbox, PostOutcome};
use crate::request::{ExecutionFilter, ItemOutcome, NewResultItem, Summary};

pub use self::command::CommandCapability;

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("capability rejected the request: {0}")]
    Rejected(String),
}

/// One node of the result tree reported by the capability.
/// Leaves are executed items; inner nodes are suites/fixtures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultNode {
    pub name: String,
    pub outcome: ItemOutcome,
    #[serde(default)]
    pub duration_secs: f64,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub stack_trace: Option<String>,
    #[serde(default)]
    pub children: Vec<ResultNode>,
}

impl ResultNode {
    pub fn leaf(name: impl Into<String>, outcome: ItemOutcome, duration_secs: f64) -> Self {
        Self {
            name: name.into(),
            outcome,
            duration_secs,
            message: None,
            stack_trace: None,
            children: Vec::new(),
        }
    }

    /// A suite node; its outcome is `failed` if any child failed.
    pub fn suite(name: impl Into<String>, children: Vec<ResultNode>) -> Self {
        let failed = children.iter().any(|c| c.outcome == ItemOutcome::Failed);
        Self {
            name: name.into(),
            outcome: if failed {
                ItemOutcome::Failed
            } else {
                ItemOutcome::Passed
            },
            duration_secs: children.iter().map(|c| c.duration_secs).sum(),
            message: None,
            stack_trace: None,
            children,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Depth-first leaves. A node without children is its own leaf.
    pub fn leaves(&self) -> Vec<&ResultNode> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if node.children.is_empty() {
                out.push(node);
            } else {
                stack.extend(node.children.iter().rev());
            }
        }
        out
    }

    /// Counters from the leaves; duration from the root when it reports one.
    pub fn summary(&self) -> Summary {
        let mut summary = Summary::default();
        for leaf in self.leaves() {
            summary.record(leaf.outcome, leaf.duration_secs);
        }
        if self.duration_secs > 0.0 {
            summary.duration_secs = self.duration_secs;
        }
        summary
    }

    pub fn to_items(&self) -> Vec<NewResultItem> {
        self.leaves().into_iter().map(ResultNode::to_item).collect()
    }

    fn to_item(&self) -> NewResultItem {
        NewResultItem {
            name: self.name.clone(),
            outcome: self.outcome,
            duration_secs: self.duration_secs,
            message: self.message.clone(),
            stack_trace: self.stack_trace.clone(),
        }
    }
}

/// Completion-callback events, in the order the capability raises them.
#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityEvent {
    RunStarted,
    ItemFinished(ResultNode),
    /// `None` when the capability finished without a usable result tree.
    RunFinished(Option<ResultNode>),
}

/// Where a capability reports events for one request.
#[derive(Clone)]
pub struct EventSink {
    request_id: i64,
    mailbox: Mailbox,
}

impl EventSink {
    pub fn new(request_id: i64, mailbox: Mailbox) -> Self {
        Self {
            request_id,
            mailbox,
        }
    }

    pub fn request_id(&self) -> i64 {
        self.request_id
    }

    /// Post an event to the host. Events are not subject to the mailbox bound;
    /// this only returns false once the host loop has gone away.
    pub fn emit(&self, event: CapabilityEvent) -> bool {
        let outcome = self.mailbox.post(HostMessage::Capability {
            request_id: self.request_id,
            event,
        });
        if outcome != PostOutcome::Delivered {
            warn!(request_id = self.request_id, ?outcome, "capability event not delivered");
            return false;
        }
        true
    }

    pub fn run_started(&self) -> bool {
        self.emit(CapabilityEvent::RunStarted)
    }

    pub fn item_finished(&self, node: ResultNode) -> bool {
        self.emit(CapabilityEvent::ItemFinished(node))
    }

    pub fn run_finished(&self, result: Option<ResultNode>) -> bool {
        self.emit(CapabilityEvent::RunFinished(result))
    }
}

/// The host's execution engine.
///
/// `start` must return quickly: long work happens elsewhere and is reported
/// through `events`. Implementations may be called from the host main context
/// only, but may emit events from any thread.
pub trait HostCapability: Send + Sync {
    fn start(
        &self,
        request_id: i64,
        filter: &ExecutionFilter,
        events: EventSink,
    ) -> Result<(), CapabilityError>;

    /// Hint that the host should recompile/refresh itself. Called from the
    /// background poll path; a stale host image can accept work and never
    /// progress.
    fn request_host_refresh(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> ResultNode {
        ResultNode::suite(
            "Game.Tests",
            vec![
                ResultNode::suite(
                    "PlayerTests",
                    vec![
                        ResultNode::leaf("PlayerTests.Jumps", ItemOutcome::Passed, 0.5),
                        ResultNode::leaf("PlayerTests.Dies", ItemOutcome::Failed, 1.0)
                            .with_message("Expected 0 but was 3"),
                    ],
                ),
                ResultNode::leaf("InventoryTests.Stacks", ItemOutcome::Skipped, 0.0),
                ResultNode::leaf("InventoryTests.Flaky", ItemOutcome::Inconclusive, 0.25),
            ],
        )
    }

    #[test]
    fn test_summary_walks_leaves() {
        let summary = sample_tree().summary();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert!((summary.duration_secs - 1.75).abs() < 1e-9);
    }

    #[test]
    fn test_items_keep_leaf_order_and_messages() {
        let items = sample_tree().to_items();
        let names: Vec<_> = items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "PlayerTests.Jumps",
                "PlayerTests.Dies",
                "InventoryTests.Stacks",
                "InventoryTests.Flaky"
            ]
        );
        assert_eq!(items[1].message.as_deref(), Some("Expected 0 but was 3"));
    }

    #[test]
    fn test_childless_root_counts_as_one_item() {
        let node = ResultNode::leaf("refresh", ItemOutcome::Passed, 2.0);
        let summary = node.summary();
        assert_eq!(summary.total, 1);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.duration_secs, 2.0);
    }

    #[test]
    fn test_sink_outlasts_a_saturated_mailbox() {
        let (mailbox, mut inbox) = crate::host::mailbox::channel(4);
        for _ in 0..4 {
            mailbox.post(HostMessage::SetBackgroundPolling(true));
        }
        let sink = EventSink::new(9, mailbox);
        assert_eq!(sink.request_id(), 9);

        for n in 0..300 {
            let leaf = ResultNode::leaf(format!("Case{n}"), ItemOutcome::Passed, 0.0);
            assert!(sink.item_finished(leaf));
        }
        assert!(sink.run_finished(Some(sample_tree())));

        let mut events = 0;
        let mut last = None;
        while let Some(msg) = inbox.try_recv() {
            if let HostMessage::Capability { request_id, event } = msg {
                assert_eq!(request_id, 9);
                events += 1;
                last = Some(event);
            }
        }
        assert_eq!(events, 301);
        assert!(matches!(last, Some(CapabilityEvent::RunFinished(Some(_)))));
    }
}
