//! End-to-end host loop: controller submits, host claims and completes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use jobrelay::capability::{CapabilityError, EventSink, HostCapability, ResultNode};
use jobrelay::config::{JobrelayConfig, StoreConfig};
use jobrelay::controller::Controller;
use jobrelay::host::mailbox::PostOutcome;
use jobrelay::host::{HostHandle, HostLoop};
use jobrelay::request::{
    ExecutionFilter, ItemOutcome, NewRequest, RequestKind, RequestStatus, TargetMode,
};
use jobrelay::storage::{Component, Store};
use tempfile::TempDir;
use tokio::task::JoinHandle;

/// Finishes every run immediately with one passing item.
#[derive(Default)]
struct InstantCapability {
    starts: AtomicUsize,
    refreshes: AtomicUsize,
}

impl HostCapability for InstantCapability {
    fn start(
        &self,
        _request_id: i64,
        _filter: &ExecutionFilter,
        events: EventSink,
    ) -> Result<(), CapabilityError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        events.run_started();
        events.run_finished(Some(ResultNode::leaf("Only.Case", ItemOutcome::Passed, 0.01)));
        Ok(())
    }

    fn request_host_refresh(&self) {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
    }
}

struct Running {
    _dir: TempDir,
    controller: Controller,
    capability: Arc<InstantCapability>,
    handle: HostHandle,
    task: JoinHandle<()>,
}

fn config(dir: &TempDir) -> JobrelayConfig {
    let mut config = JobrelayConfig::default();
    config.store = StoreConfig::at(dir.path().join("queue.db"));
    config.host.idle_interval_ms = 20;
    config.poller.interval_ms = 20;
    config.executor.results_dir = dir.path().join("results");
    config.executor.check_interval_ms = 20;
    config.executor.timeout_secs = 5;
    config
}

/// Start a host; `prepare` runs against the store and handle before the
/// loop is spawned.
fn start_host(prepare: impl FnOnce(&Store, &HostHandle)) -> Running {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let store = Store::open(&config.store).unwrap();
    let capability = Arc::new(InstantCapability::default());

    let (host, handle) = HostLoop::new(store.clone(), capability.clone(), &config);
    prepare(&store, &handle);
    let task = tokio::spawn(host.run());

    Running {
        _dir: dir,
        controller: Controller::new(store),
        capability,
        handle,
        task,
    }
}

async fn wait_done(controller: &Controller, id: i64) -> jobrelay::request::Request {
    controller
        .wait_for_completion(id, Duration::from_secs(10), Duration::from_millis(10))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_idle_loop_claims_and_completes() {
    let host = start_host(|_, _| {});
    let id = host
        .controller
        .submit(NewRequest::new(RequestKind::RunAll, TargetMode::EditorMode))
        .unwrap();

    let request = wait_done(&host.controller, id).await;
    assert_eq!(request.status, RequestStatus::Completed);
    assert_eq!(request.summary.passed, 1);
    assert_eq!(host.controller.results(id).unwrap()[0].name, "Only.Case");

    host.handle.shutdown();
    host.task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_multi_thread_runtime_completes_requests() {
    let host = start_host(|_, _| {});
    let ids: Vec<i64> = (0..3)
        .map(|_| {
            host.controller
                .submit(NewRequest::new(RequestKind::RunAll, TargetMode::EditorMode))
                .unwrap()
        })
        .collect();

    for id in ids {
        assert_eq!(wait_done(&host.controller, id).await.status, RequestStatus::Completed);
    }
    assert_eq!(host.capability.starts.load(Ordering::SeqCst), 3);

    host.handle.shutdown();
    host.task.await.unwrap();
}

#[tokio::test]
async fn test_priority_order_across_the_loop() {
    let host = start_host(|store, handle| {
        // queue everything before the loop can claim
        handle.suspend_idle_loop();
        store.set_background_polling(false).unwrap();
    });
    let ids: Vec<i64> = [1, 5, 3]
        .into_iter()
        .map(|p| {
            host.controller
                .submit(NewRequest::new(RequestKind::RunAll, TargetMode::EditorMode).with_priority(p))
                .unwrap()
        })
        .collect();
    host.handle.resume_idle_loop();
    assert!(!host.handle.is_idle_suspended());

    let mut finished: Vec<(i64, chrono::DateTime<chrono::Utc>)> = Vec::new();
    for id in &ids {
        let request = wait_done(&host.controller, *id).await;
        finished.push((request.priority, request.started_at.unwrap()));
    }
    finished.sort_by_key(|(_, started)| *started);
    let priorities: Vec<i64> = finished.into_iter().map(|(p, _)| p).collect();
    assert_eq!(priorities, [5, 3, 1]);

    host.handle.shutdown();
    host.task.await.unwrap();
}

#[tokio::test]
async fn test_suspended_host_with_polling_disabled_does_not_claim() {
    let host = start_host(|store, handle| {
        handle.suspend_idle_loop();
        store.set_background_polling(false).unwrap();
    });
    let id = host
        .controller
        .submit(NewRequest::new(RequestKind::RunAll, TargetMode::EditorMode))
        .unwrap();

    assert!(host.handle.is_idle_suspended());
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        host.controller.request(id).unwrap().unwrap().status,
        RequestStatus::Pending
    );
    assert_eq!(host.capability.starts.load(Ordering::SeqCst), 0);

    // background polling keeps a suspended host dispatching
    host.handle.set_background_polling(true).unwrap();
    let request = wait_done(&host.controller, id).await;
    assert_eq!(request.status, RequestStatus::Completed);
    assert!(host.capability.refreshes.load(Ordering::SeqCst) >= 1);

    host.handle.shutdown();
    host.task.await.unwrap();
}

#[tokio::test]
async fn test_dispatch_now_claims_while_suspended() {
    let host = start_host(|store, handle| {
        handle.suspend_idle_loop();
        store.set_background_polling(false).unwrap();
    });
    let id = host
        .controller
        .submit(NewRequest::new(RequestKind::RefreshFull, TargetMode::EditorMode))
        .unwrap();

    assert_eq!(host.handle.dispatch_now(), PostOutcome::Delivered);
    let request = wait_done(&host.controller, id).await;
    assert_eq!(request.status, RequestStatus::Completed);

    host.handle.shutdown();
    host.task.await.unwrap();
}

#[tokio::test]
async fn test_shutdown_marks_host_offline() {
    let host = start_host(|_, _| {});
    tokio::time::sleep(Duration::from_millis(100)).await;

    host.handle.shutdown();
    tokio::time::timeout(Duration::from_secs(5), host.task)
        .await
        .expect("host loop did not stop")
        .unwrap();

    let snapshot = host.controller.status().unwrap();
    let hb = snapshot
        .heartbeats
        .iter()
        .find(|hb| hb.component == Component::Host)
        .expect("host heartbeat recorded");
    assert_eq!(hb.status, "offline");
    assert!(hb
        .message
        .as_deref()
        .unwrap()
        .contains(&host.handle.session_id().to_string()));
}
