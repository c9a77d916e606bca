//! Tests for the shared-buffer pool and memory-pressure shedding against a
//! live companion connection.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{eventually, Harness};
use rootlink::buffer::{PressureEvent, PressureLevel, PressureSignal, ReleaseReason};
use rootlink::ipc::{Push, Request, TransportEvent};
use rootlink::session::BufferReleaseRequest;

fn released_ids(harness: &Harness) -> Vec<u64> {
    harness
        .companion
        .calls()
        .into_iter()
        .filter_map(|r| match r {
            Request::ReleaseScreenshot { buffer_id } => Some(buffer_id),
            _ => None,
        })
        .collect()
}

async fn next_pool_event(
    events: &mut tokio::sync::broadcast::Receiver<PressureEvent>,
) -> PressureEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("pool event")
        .expect("pool stream open")
}

#[tokio::test]
async fn capacity_is_never_exceeded() {
    let harness = Harness::running();
    let session = &harness.runtime.session;
    let pool = &harness.runtime.pool;

    for _ in 0..5 {
        session.get_screenshot().await.unwrap();
        assert!(pool.len() <= 3);
    }

    // Buffers 1 and 2 were the oldest non-write buffers when 4 and 5 arrived.
    assert_eq!(released_ids(&harness), vec![1, 2]);
    assert_eq!(pool.write_buffer(), Some(5));
    assert_eq!(pool.read_buffer(), Some(4));
    assert!(pool.get(3).is_some());
}

#[tokio::test]
async fn second_acquire_promotes_write_to_read() {
    let harness = Harness::running();
    let session = &harness.runtime.session;

    let first = session.get_screenshot().await.unwrap();
    let second = session.get_screenshot().await.unwrap();

    assert_eq!((first.width, first.height), (1080, 2400));
    assert_eq!(second.handle, 0x1000 + second.id);
    assert_eq!(harness.runtime.pool.write_buffer(), Some(second.id));
    assert_eq!(harness.runtime.pool.read_buffer(), Some(first.id));
}

#[tokio::test]
async fn explicit_release_reaches_companion_once() {
    let harness = Harness::running();
    let session = &harness.runtime.session;
    let buffer = session.get_screenshot().await.unwrap();

    assert!(session.release_screenshot(buffer.id).await.unwrap());
    assert!(!session.release_screenshot(buffer.id).await.unwrap());

    assert_eq!(released_ids(&harness), vec![buffer.id]);
    assert!(harness.runtime.pool.is_empty());
}

#[tokio::test]
async fn companion_release_request_is_honored() {
    let harness = Harness::running();
    let session = &harness.runtime.session;
    let mut requests = session.subscribe_release_requests();
    let mut pool_events = harness.runtime.pool.subscribe();
    let buffer = session.get_screenshot().await.unwrap();

    harness.companion.push(Push::BufferReleaseRequest {
        buffer_id: buffer.id,
        timeout_ms: 500,
    });

    let request = tokio::time::timeout(Duration::from_secs(5), requests.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        request,
        BufferReleaseRequest {
            buffer_id: buffer.id,
            timeout_ms: 500
        }
    );
    assert_eq!(
        next_pool_event(&mut pool_events).await,
        PressureEvent::ReleaseRequested {
            buffer_id: buffer.id,
            timeout_ms: 500
        }
    );
    assert_eq!(
        next_pool_event(&mut pool_events).await,
        PressureEvent::Released {
            buffer_id: buffer.id,
            reason: ReleaseReason::FlowControl
        }
    );
    assert!(harness.runtime.pool.is_empty());
    assert_eq!(released_ids(&harness), vec![buffer.id]);
}

#[tokio::test]
async fn flow_control_release_is_bounded() {
    let harness = Harness::running();
    let session = &harness.runtime.session;
    let buffer = session.get_screenshot().await.unwrap();
    harness.companion.hang("release_screenshot");

    let started = tokio::time::Instant::now();
    harness
        .runtime
        .pool
        .handle_memory_pressure(buffer.id, 100)
        .await;

    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(harness.runtime.pool.is_empty());
}

#[tokio::test]
async fn pressure_sheds_all_but_the_write_buffer() {
    let harness = Harness::running();
    let session = &harness.runtime.session;
    for _ in 0..3 {
        session.get_screenshot().await.unwrap();
    }
    let multipliers = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let seen = Arc::clone(&multipliers);
    harness
        .runtime
        .pressure
        .register_frequency_callback(move |m| seen.lock().push(m));

    let level = harness
        .runtime
        .pressure
        .on_signal(PressureSignal::AvailableRatio(0.10))
        .await;

    assert_eq!(level, PressureLevel::Medium);
    assert_eq!(*multipliers.lock(), vec![2.0]);
    assert_eq!(harness.runtime.pool.len(), 1);
    assert_eq!(harness.runtime.pool.write_buffer(), Some(3));
    assert_eq!(released_ids(&harness), vec![1, 2]);
}

#[tokio::test]
async fn sustained_critical_pressure_warns() {
    let harness = Harness::running();
    let pressure = &harness.runtime.pressure;
    let mut warnings = pressure.subscribe_warnings();
    let callbacks = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&callbacks);
    pressure.register_frequency_callback(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    pressure.on_signal(PressureSignal::Stall(80.0)).await;
    assert!(warnings.try_recv().is_err());
    pressure.on_signal(PressureSignal::Stall(90.0)).await;

    let warning = warnings.try_recv().unwrap();
    assert_eq!(warning.level, PressureLevel::Critical);
    assert_eq!(warning.consecutive, 2);
    assert_eq!(callbacks.load(Ordering::SeqCst), 1);
    assert_eq!(pressure.level(), PressureLevel::Critical);
}

#[tokio::test]
async fn peer_death_drops_local_bookkeeping() {
    let harness = Harness::running();
    let session = &harness.runtime.session;
    let mut events = harness.runtime.transport.subscribe_events();
    for _ in 0..2 {
        session.get_screenshot().await.unwrap();
    }
    let mut pool_events = harness.runtime.pool.subscribe();
    harness.companion.clear_calls();

    harness.companion.crash();

    assert_eq!(
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap(),
        TransportEvent::PeerDied
    );
    eventually("pool to clear", || harness.runtime.pool.is_empty()).await;
    assert_eq!(
        next_pool_event(&mut pool_events).await,
        PressureEvent::Cleared { count: 2 }
    );
    // Nothing was sent back over the dead connection.
    assert!(released_ids(&harness).is_empty());
}
