//! Tests for request correlation: resolution, idempotence, timeouts, sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use rootlink::error::ConnectionError;
use rootlink::ipc::{CorrelatorConfig, RequestCorrelator, Response};
use rootlink::LinkError;

fn correlator() -> Arc<RequestCorrelator> {
    Arc::new(RequestCorrelator::new(CorrelatorConfig::default()))
}

#[tokio::test]
async fn resolved_call_returns_transformed_reply() {
    let correlator = correlator();
    let resolver = Arc::clone(&correlator);

    let result = correlator
        .issue(
            Duration::from_secs(5),
            |id| async move {
                resolver.resolve(id, Response::Version { version: 3 });
                Ok(())
            },
            |response| match response {
                Response::Version { version } => Ok(version),
                other => Err(LinkError::Protocol(format!("{other:?}"))),
            },
        )
        .await;

    assert_eq!(result, Ok(3));
    assert_eq!(correlator.pending_count(), 0);
}

#[tokio::test]
async fn dispatch_failure_leaves_nothing_pending() {
    let correlator = correlator();
    let result: Result<Response, _> = correlator
        .issue(
            Duration::from_secs(5),
            |_| async { Err(LinkError::Io("write failed".into())) },
            Ok,
        )
        .await;

    assert_eq!(result, Err(LinkError::Io("write failed".into())));
    assert_eq!(correlator.pending_count(), 0);
}

#[tokio::test]
async fn each_id_settles_exactly_once() {
    let correlator = correlator();
    let (id, rx) = correlator.register(Duration::from_secs(5)).unwrap();

    assert!(correlator.cancel(id, LinkError::Cancelled));
    assert!(!correlator.resolve(id, Response::Pong));
    assert!(!correlator.cancel(id, LinkError::Closed));

    assert_eq!(rx.await.unwrap(), Err(LinkError::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn unanswered_call_times_out_within_grace() {
    let correlator = correlator();
    let mut timeouts = correlator.subscribe_timeouts();
    let _sweeper = correlator.spawn_sweeper();

    let started = Instant::now();
    let result: Result<Response, _> = correlator
        .issue(Duration::from_millis(30_000), |_| async { Ok(()) }, Ok)
        .await;
    let elapsed = started.elapsed();

    assert_eq!(
        result,
        Err(LinkError::Connection(ConnectionError::Timeout(Duration::from_millis(30_000))))
    );
    assert!(elapsed >= Duration::from_millis(30_000));
    assert!(elapsed < Duration::from_millis(35_000));
    assert_eq!(correlator.pending_count(), 0);

    let event = timeouts.recv().await.unwrap();
    assert_eq!(event.timeout, Duration::from_millis(30_000));
    assert!(!event.swept);
}

#[tokio::test(start_paused = true)]
async fn sweeper_reclaims_abandoned_registration() {
    let correlator = correlator();
    let mut timeouts = correlator.subscribe_timeouts();
    let _sweeper = correlator.spawn_sweeper();

    // Registered but never awaited through issue(), so only the sweep can
    // reclaim it.
    let (id, rx) = correlator.register(Duration::from_secs(1)).unwrap();
    tokio::time::sleep(Duration::from_secs(8)).await;

    assert_eq!(correlator.pending_count(), 0);
    assert!(matches!(
        rx.await.unwrap(),
        Err(LinkError::Connection(ConnectionError::Timeout(_)))
    ));
    let event = timeouts.recv().await.unwrap();
    assert_eq!(event.id, id);
    assert!(event.swept);
}

#[tokio::test]
async fn cancel_all_fails_every_pending_call_with_same_error() {
    let correlator = correlator();
    let receivers: Vec<_> = (0..8)
        .map(|_| correlator.register(Duration::from_secs(30)).unwrap().1)
        .collect();

    let error = LinkError::Connection(ConnectionError::PeerDied);
    assert_eq!(correlator.cancel_all(error.clone()), 8);
    assert_eq!(correlator.pending_count(), 0);

    for rx in receivers {
        assert_eq!(rx.await.unwrap(), Err(error.clone()));
    }
}

#[tokio::test]
async fn close_fails_pending_with_closed_and_refuses_new_calls() {
    let correlator = correlator();
    let (_, rx) = correlator.register(Duration::from_secs(30)).unwrap();

    correlator.close();

    assert_eq!(rx.await.unwrap(), Err(LinkError::Closed));
    assert!(correlator.is_closed());
    let result: Result<Response, _> = correlator
        .issue(Duration::from_secs(1), |_| async { Ok(()) }, Ok)
        .await;
    assert_eq!(result, Err(LinkError::Closed));
}

#[tokio::test]
async fn concurrent_calls_get_distinct_ids() {
    let correlator = correlator();
    let mut handles = Vec::new();
    for _ in 0..16 {
        let correlator = Arc::clone(&correlator);
        handles.push(tokio::spawn(async move {
            let (id, _rx) = correlator.register(Duration::from_secs(5)).unwrap();
            id
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 16);
}
