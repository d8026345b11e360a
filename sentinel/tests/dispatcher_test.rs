//! Integration tests for the event dispatcher.
//!
//! These tests wire the dispatcher the way the binary does: file events in,
//! run requests out, runner events back in, and subscribers watching the
//! tree. They cover debounced triggering, reruns of packages that changed
//! mid-run, notification coalescing for slow subscribers, and concurrent
//! producers.

use std::time::Duration;

use sentinel::dispatcher::{DispatcherConfig, EventDispatcher, Notification};
use sentinel::tree::{NodePath, Outcome};
use sentinel::types::{
    ErrorEvent, FileEvent, FileOperation, RunRequest, RunnerEvent, SentinelEvent, TestResult,
    TriggerReason,
};
use sentinel::watcher::{FileWatcher, WatchFilter};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

// =============================================================================
// Test Helpers
// =============================================================================

fn dispatcher_with(config: DispatcherConfig) -> (EventDispatcher, mpsc::Receiver<RunRequest>) {
    let (tx, rx) = mpsc::channel(32);
    (EventDispatcher::new(config, tx), rx)
}

fn fast_dispatcher() -> (EventDispatcher, mpsc::Receiver<RunRequest>) {
    dispatcher_with(DispatcherConfig {
        debounce: Duration::from_millis(30),
        ..DispatcherConfig::default()
    })
}

async fn next_run(runs: &mut mpsc::Receiver<RunRequest>) -> RunRequest {
    timeout(Duration::from_secs(2), runs.recv())
        .await
        .expect("a run should be requested")
        .expect("run channel open")
}

async fn assert_no_run(runs: &mut mpsc::Receiver<RunRequest>, wait_ms: u64) {
    let extra = timeout(Duration::from_millis(wait_ms), runs.recv()).await;
    assert!(extra.is_err(), "unexpected run request: {extra:?}");
}

fn package_outcome(dispatcher: &EventDispatcher, package: &str) -> Option<Outcome> {
    dispatcher.with_tree(|tree| {
        let id = tree.find(&NodePath::package(package))?;
        tree.get(id).map(|node| node.passed())
    })
}

// =============================================================================
// Run Triggering
// =============================================================================

#[tokio::test]
async fn burst_of_saves_triggers_single_run_per_package() {
    let (dispatcher, mut runs) = fast_dispatcher();

    for _ in 0..25 {
        dispatcher.publish(FileEvent::new("pkgA/a.go", FileOperation::Written));
        dispatcher.publish(FileEvent::new("pkgA/a_test.go", FileOperation::Written));
    }
    dispatcher.publish(FileEvent::new("pkgB/b.go", FileOperation::Created));

    let mut packages = vec![next_run(&mut runs).await.package, next_run(&mut runs).await.package];
    packages.sort();
    assert_eq!(packages, vec!["pkgA".to_string(), "pkgB".to_string()]);

    assert_no_run(&mut runs, 150).await;
}

#[tokio::test]
async fn root_files_map_to_root_package() {
    let (dispatcher, mut runs) = fast_dispatcher();

    dispatcher.publish(FileEvent::new("main.go", FileOperation::Written));

    assert_eq!(next_run(&mut runs).await.package, ".");
}

#[tokio::test]
async fn full_cycle_from_change_to_result() {
    let (dispatcher, mut runs) = fast_dispatcher();
    let mut sub = dispatcher.subscribe();

    dispatcher.publish(FileEvent::new("pkgA/a.go", FileOperation::Written));
    let request = next_run(&mut runs).await;
    assert_eq!(request.reason, TriggerReason::FileChanged);

    dispatcher.publish(RunnerEvent::started(&request.package));
    dispatcher.publish(RunnerEvent::completed(
        &request.package,
        vec![TestResult::pass("pkgA", "TestX", 0.01)],
    ));

    let mut saw_trigger = false;
    let mut last_revision = 0;
    while let Some(notification) = sub.try_recv() {
        match notification {
            Notification::RunTriggered { package } => {
                assert_eq!(package, "pkgA");
                saw_trigger = true;
            }
            Notification::TreeChanged { revision } => last_revision = revision,
            other => panic!("unexpected notification: {other:?}"),
        }
    }
    assert!(saw_trigger);
    assert_eq!(last_revision, dispatcher.revision());
    assert_eq!(package_outcome(&dispatcher, "pkgA"), Some(Outcome::Passed));
}

#[tokio::test]
async fn change_during_run_is_rerun_once() {
    let (dispatcher, mut runs) = fast_dispatcher();

    dispatcher.publish(FileEvent::new("pkgA/a.go", FileOperation::Written));
    next_run(&mut runs).await;
    dispatcher.publish(RunnerEvent::started("pkgA"));

    // Two separate bursts while the run is in flight.
    dispatcher.publish(FileEvent::new("pkgA/a.go", FileOperation::Written));
    sleep(Duration::from_millis(80)).await;
    dispatcher.publish(FileEvent::new("pkgA/a.go", FileOperation::Written));
    assert_no_run(&mut runs, 120).await;

    dispatcher.publish(RunnerEvent::completed(
        "pkgA",
        vec![TestResult::pass("pkgA", "TestX", 0.01)],
    ));

    let rerun = next_run(&mut runs).await;
    assert_eq!(rerun.package, "pkgA");
    assert_eq!(rerun.reason, TriggerReason::Rerun);

    dispatcher.publish(RunnerEvent::completed("pkgA", Vec::new()));
    assert_no_run(&mut runs, 100).await;
}

#[tokio::test]
async fn removed_file_prunes_then_reruns_package() {
    let (dispatcher, mut runs) = fast_dispatcher();
    dispatcher.publish(TestResult::pass("pkgA", "TestOld", 0.01));

    dispatcher.publish(FileEvent::new("pkgA/old_test.go", FileOperation::Removed));

    assert_eq!(package_outcome(&dispatcher, "pkgA"), None);
    let request = next_run(&mut runs).await;
    assert_eq!(request.package, "pkgA");
}

#[tokio::test]
async fn removed_directory_cancels_pending_trigger() {
    let (dispatcher, mut runs) = dispatcher_with(DispatcherConfig {
        debounce: Duration::from_millis(80),
        ..DispatcherConfig::default()
    });
    dispatcher.publish(TestResult::pass("pkgA", "TestX", 0.01));

    dispatcher.publish(FileEvent::new("pkgA/a.go", FileOperation::Written));
    dispatcher.publish(FileEvent::new("pkgA", FileOperation::Removed));

    assert_eq!(package_outcome(&dispatcher, "pkgA"), None);
    assert_no_run(&mut runs, 250).await;
}

#[tokio::test]
async fn removed_directory_drops_nested_and_dotted_packages() {
    let (dispatcher, mut runs) = fast_dispatcher();
    for package in ["internal", "internal/api", "internal/api/v1.2", "pkgA"] {
        dispatcher.publish(TestResult::pass(package, "TestX", 0.01));
    }

    dispatcher.publish(FileEvent::new("internal/api/v1.2", FileOperation::Removed));
    assert_eq!(package_outcome(&dispatcher, "internal/api"), Some(Outcome::Passed));
    assert_eq!(package_outcome(&dispatcher, "internal/api/v1.2"), None);

    dispatcher.publish(FileEvent::new("internal", FileOperation::Removed));
    assert_eq!(package_outcome(&dispatcher, "internal"), None);
    assert_eq!(package_outcome(&dispatcher, "internal/api"), None);
    assert_eq!(package_outcome(&dispatcher, "pkgA"), Some(Outcome::Passed));

    assert_no_run(&mut runs, 150).await;
}

#[tokio::test]
async fn completed_run_clears_earlier_failure() {
    let (dispatcher, mut runs) = fast_dispatcher();

    dispatcher.request_run("pkgA");
    next_run(&mut runs).await;
    dispatcher.publish(ErrorEvent::runner_failure("pkgA", "build failed"));
    assert_eq!(package_outcome(&dispatcher, "pkgA"), Some(Outcome::Failed));

    dispatcher.publish(RunnerEvent::completed(
        "pkgA",
        vec![TestResult::pass("pkgA", "TestX", 0.01)],
    ));
    assert_eq!(package_outcome(&dispatcher, "pkgA"), Some(Outcome::Passed));
}

#[tokio::test]
async fn runner_failure_resolves_pending_and_frees_package() {
    let (dispatcher, mut runs) = fast_dispatcher();

    dispatcher.request_run("pkgA");
    next_run(&mut runs).await;
    dispatcher.publish(RunnerEvent::started("pkgA"));
    dispatcher.publish(RunnerEvent::running("pkgA").with_test("TestX"));
    dispatcher.publish(TestResult::pass("pkgB", "TestY", 0.01));

    dispatcher.publish(ErrorEvent::runner_failure("pkgA", "build failed"));

    assert_eq!(package_outcome(&dispatcher, "pkgA"), Some(Outcome::Failed));
    assert_eq!(package_outcome(&dispatcher, "pkgB"), Some(Outcome::Passed));

    dispatcher.request_run("pkgA");
    assert_eq!(next_run(&mut runs).await.reason, TriggerReason::Manual);
}

// =============================================================================
// Notifications
// =============================================================================

#[tokio::test]
async fn slow_subscriber_sees_coalesced_latest_revision() {
    let (dispatcher, _runs) = dispatcher_with(DispatcherConfig {
        notify_capacity: 8,
        ..DispatcherConfig::default()
    });
    let mut fast = dispatcher.subscribe();
    let mut slow = dispatcher.subscribe();

    let mut fast_seen = 0;
    for i in 0..100 {
        dispatcher.publish(TestResult::pass("pkgA", format!("Test{i}"), 0.01));
        if fast.try_recv().is_some() {
            fast_seen += 1;
        }
    }

    assert_eq!(fast_seen, 100);
    assert_eq!(fast.dropped(), 0);

    assert_eq!(
        slow.recv().await,
        Some(Notification::TreeChanged { revision: 100 })
    );
    assert!(slow.dropped() >= 92);
    assert!(slow.try_recv().is_none());
}

#[tokio::test]
async fn malformed_input_is_reported_and_ignored() {
    let (dispatcher, _runs) = fast_dispatcher();
    let mut sub = dispatcher.subscribe();

    dispatcher.publish(RunnerEvent::completed("pkgA", Vec::new()).with_coverage(140.0));
    dispatcher.publish(TestResult::pass("pkgA", "", 0.01));

    for _ in 0..2 {
        match sub.try_recv() {
            Some(Notification::Error(error)) => {
                assert_eq!(error.kind, sentinel::types::ErrorKind::MalformedInput);
            }
            other => panic!("expected error notification, got {other:?}"),
        }
    }
    assert_eq!(dispatcher.revision(), 0);
    assert!(dispatcher.snapshot().nodes.is_empty());
}

#[tokio::test]
async fn subscriber_ends_when_dispatcher_dropped() {
    let (dispatcher, _runs) = fast_dispatcher();
    let mut sub = dispatcher.subscribe();
    dispatcher.publish(TestResult::pass("pkgA", "TestX", 0.01));
    drop(dispatcher);

    assert_eq!(sub.recv().await, Some(Notification::TreeChanged { revision: 1 }));
    let end = timeout(Duration::from_secs(1), sub.recv())
        .await
        .expect("subscription should close");
    assert_eq!(end, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_and_readers_stay_consistent() {
    let (dispatcher, _runs) = fast_dispatcher();

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                for t in 0..50 {
                    let package = format!("pkg{p}");
                    let result = if t % 7 == 0 {
                        TestResult::fail(&package, format!("Test{t}"), 0.01, "boom")
                    } else {
                        TestResult::pass(&package, format!("Test{t}"), 0.01)
                    };
                    dispatcher.publish(result);
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    let reader = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                let snapshot = dispatcher.snapshot();
                for package in &snapshot.nodes {
                    let sum: f64 = package.children.iter().map(|c| c.duration).sum();
                    assert!((package.duration - sum).abs() < 1e-9);
                }
                tokio::task::yield_now().await;
            }
        })
    };

    for producer in producers {
        producer.await.unwrap();
    }
    reader.await.unwrap();

    let snapshot = dispatcher.snapshot();
    assert_eq!(snapshot.summary.packages, 4);
    assert_eq!(snapshot.summary.tests, 200);
    assert_eq!(snapshot.summary.failed, 4 * 8);
    assert_eq!(snapshot.revision, 200);
}

// =============================================================================
// Watcher Wiring
// =============================================================================

#[tokio::test]
async fn watcher_changes_trigger_runs() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    std::fs::create_dir(temp_dir.path().join("pkgA")).unwrap();

    let (dispatcher, mut runs) = fast_dispatcher();
    let (events_tx, mut events_rx) = mpsc::channel::<SentinelEvent>(64);
    let _watcher = FileWatcher::new(
        temp_dir.path().to_path_buf(),
        WatchFilter::new(["go"], [".git"]),
        events_tx,
    )
    .expect("Should create watcher");

    let forward = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                dispatcher.publish(event);
            }
        })
    };

    std::fs::write(temp_dir.path().join("pkgA/a_test.go"), "package a").unwrap();
    std::fs::write(temp_dir.path().join("pkgA/notes.txt"), "ignored").unwrap();

    let request = timeout(Duration::from_secs(5), runs.recv())
        .await
        .expect("write should trigger a run")
        .unwrap();
    assert_eq!(request.package, "pkgA");

    forward.abort();
}
