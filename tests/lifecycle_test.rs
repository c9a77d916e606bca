//! Tests for companion process start, version reconciliation, and stop.

mod common;

use std::time::Duration;

use common::{eventually, Companion, Harness, RootMode, COMPANION_PID};
use rootlink::audit::AuditEventType;
use rootlink::error::DeploymentError;
use rootlink::ipc::PROTOCOL_VERSION;
use rootlink::lifecycle::ProcessLifecycleState;
use rootlink::LinkError;

fn failure(harness: &Harness) -> (LinkError, String) {
    match harness.runtime.lifecycle.state() {
        ProcessLifecycleState::Failed {
            cause, diagnostic, ..
        } => (cause, diagnostic),
        other => panic!("expected Failed, got {other:?}"),
    }
}

#[tokio::test]
async fn start_deploys_and_launches_when_absent() {
    let harness = Harness::build(Companion::new(), PROTOCOL_VERSION, false, |_| {});
    let lifecycle = &harness.runtime.lifecycle;

    lifecycle.start_daemon().await.unwrap();

    assert_eq!(
        lifecycle.state(),
        ProcessLifecycleState::Running {
            pid: Some(COMPANION_PID)
        }
    );
    assert!(harness.companion.is_running());
    assert_eq!(harness.runner.count_matching("cp "), 1);
    assert_eq!(harness.runner.count_matching("--daemon"), 1);
    assert!(harness
        .runtime
        .audit
        .recent()
        .iter()
        .any(|e| e.event_type == AuditEventType::DaemonStarted));
}

#[tokio::test]
async fn discoverable_companion_is_only_version_checked() {
    let harness = Harness::running();

    harness.runtime.lifecycle.start_daemon().await.unwrap();

    assert!(matches!(
        harness.runtime.lifecycle.state(),
        ProcessLifecycleState::Running { .. }
    ));
    assert_eq!(harness.runner.count_matching("--daemon"), 0);
    assert_eq!(harness.runner.count_matching("cp "), 0);
}

#[tokio::test]
async fn stale_companion_is_redeployed_once() {
    let harness = Harness::build(Companion::running(2), PROTOCOL_VERSION, true, |_| {});

    harness.runtime.lifecycle.start_daemon().await.unwrap();

    assert_eq!(harness.companion.version(), PROTOCOL_VERSION);
    assert!(matches!(
        harness.runtime.lifecycle.state(),
        ProcessLifecycleState::Running { .. }
    ));
    assert_eq!(harness.runner.count_matching("cp "), 1);
    assert!(harness
        .runtime
        .audit
        .recent()
        .iter()
        .any(|e| e.event_type == AuditEventType::VersionMismatch));
}

#[tokio::test]
async fn persistent_mismatch_fails_with_diagnostic() {
    // The bundled binary itself speaks the old protocol.
    let harness = Harness::build(Companion::running(2), 2, true, |_| {});

    let result = harness.runtime.lifecycle.start_daemon().await;

    let expected = LinkError::Deployment(DeploymentError::VersionMismatch {
        expected: PROTOCOL_VERSION,
        actual: 2,
    });
    assert_eq!(result, Err(expected.clone()));
    let (cause, diagnostic) = failure(&harness);
    assert_eq!(cause, expected);
    assert!(diagnostic.contains("after a forced redeploy"));
    assert!(diagnostic.contains("[verifying version]"));
    assert_eq!(harness.runner.count_matching("cp "), 1);
    assert!(!harness.runtime.transport.is_connected());
}

#[tokio::test]
async fn missing_root_and_policy_denial_are_distinguished() {
    let harness = Harness::build(Companion::new(), PROTOCOL_VERSION, false, |_| {});
    harness.runner.set_root(RootMode::Unavailable);
    let result = harness.runtime.lifecycle.start_daemon().await;
    assert!(matches!(
        result,
        Err(LinkError::Deployment(DeploymentError::RootUnavailable(_)))
    ));
    assert!(failure(&harness).1.contains("Grant superuser access"));

    let harness = Harness::build(Companion::new(), PROTOCOL_VERSION, false, |_| {});
    harness.runner.set_root(RootMode::PolicyDenied);
    let result = harness.runtime.lifecycle.start_daemon().await;
    assert!(matches!(
        result,
        Err(LinkError::Deployment(DeploymentError::PolicyDenied(_)))
    ));
    assert!(failure(&harness).1.contains("security policy"));
    assert!(!harness.companion.is_running());
}

#[tokio::test]
async fn stop_terminates_gracefully() {
    let harness = Harness::running();
    let lifecycle = &harness.runtime.lifecycle;
    lifecycle.start_daemon().await.unwrap();

    lifecycle.stop_daemon().await.unwrap();

    assert_eq!(lifecycle.state(), ProcessLifecycleState::Stopped);
    assert!(!harness.companion.is_running());
    assert_eq!(
        harness
            .runner
            .count_matching(&format!("kill -TERM {COMPANION_PID}")),
        1
    );
    assert_eq!(harness.runner.count_matching("-KILL"), 0);
    assert!(!harness.runtime.transport.is_connected());
}

#[tokio::test]
async fn stop_escalates_when_term_is_ignored() {
    let harness = Harness::running();
    let lifecycle = &harness.runtime.lifecycle;
    lifecycle.start_daemon().await.unwrap();
    harness.runner.set_ignore_term(true);

    lifecycle.stop_daemon().await.unwrap();

    assert!(!harness.companion.is_running());
    assert_eq!(
        harness
            .runner
            .count_matching(&format!("kill -KILL {COMPANION_PID}")),
        1
    );
    assert_eq!(lifecycle.state(), ProcessLifecycleState::Stopped);
}

#[tokio::test]
async fn stop_without_root_reports_failure() {
    let harness = Harness::running();
    let lifecycle = &harness.runtime.lifecycle;
    lifecycle.start_daemon().await.unwrap();
    harness.runner.set_root(RootMode::Unavailable);

    let result = lifecycle.stop_daemon().await;

    assert!(matches!(
        result,
        Err(LinkError::Deployment(DeploymentError::RootUnavailable(_)))
    ));
    assert!(harness.companion.is_running());
    let (cause, _) = failure(&harness);
    assert_eq!(cause.code(), 400);
    let entries = harness.runtime.audit.recent();
    assert!(entries
        .iter()
        .any(|e| e.event_type == AuditEventType::DaemonStopFailed));
    assert!(!entries
        .iter()
        .any(|e| e.event_type == AuditEventType::DaemonStopped));
}

#[tokio::test]
async fn stop_under_policy_denial_is_classified_as_policy() {
    let harness = Harness::running();
    let lifecycle = &harness.runtime.lifecycle;
    lifecycle.start_daemon().await.unwrap();
    harness.runner.set_root(RootMode::PolicyDenied);

    let result = lifecycle.stop_daemon().await;

    assert!(matches!(
        result,
        Err(LinkError::Deployment(DeploymentError::PolicyDenied(_)))
    ));
    assert!(harness.companion.is_running());
}

#[tokio::test]
async fn companion_surviving_kill_leaves_lifecycle_failed() {
    let harness = Harness::running();
    let lifecycle = &harness.runtime.lifecycle;
    lifecycle.start_daemon().await.unwrap();
    harness.runner.set_ignore_term(true);
    harness.runner.set_ignore_kill(true);

    let result = lifecycle.stop_daemon().await;

    assert!(matches!(
        result,
        Err(LinkError::Deployment(DeploymentError::StopFailed(_)))
    ));
    assert_eq!(
        harness
            .runner
            .count_matching(&format!("kill -KILL {COMPANION_PID}")),
        1
    );
    let (cause, _) = failure(&harness);
    assert_eq!(cause.code(), 407);
}

#[tokio::test]
async fn keep_alive_stops_idle_companion() {
    let harness = Harness::running();
    let lifecycle = &harness.runtime.lifecycle;
    lifecycle.start_daemon().await.unwrap();

    lifecycle.arm_keep_alive(Duration::from_millis(50));

    eventually("keep-alive stop", || !harness.companion.is_running()).await;
    eventually("lifecycle stopped", || {
        lifecycle.state() == ProcessLifecycleState::Stopped
    })
    .await;
}

#[tokio::test]
async fn cancelled_keep_alive_leaves_companion_running() {
    let harness = Harness::running();
    let lifecycle = &harness.runtime.lifecycle;
    lifecycle.start_daemon().await.unwrap();

    lifecycle.arm_keep_alive(Duration::from_millis(50));
    lifecycle.cancel_keep_alive();
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(harness.companion.is_running());
    assert!(matches!(lifecycle.state(), ProcessLifecycleState::Running { .. }));
}

#[tokio::test]
async fn externally_started_companion_is_observed() {
    let harness = Harness::running();
    assert_eq!(harness.runtime.lifecycle.state(), ProcessLifecycleState::Stopped);

    harness.runtime.transport.connect().await;

    eventually("lifecycle to observe companion", || {
        harness.runtime.lifecycle.state()
            == ProcessLifecycleState::Running {
                pid: Some(COMPANION_PID),
            }
    })
    .await;
}
