//! Accessory Event Bus Integration Tests
//!
//! # Test Scenarios
//! - Attach/detach hot streams (fan-out, no replay, absent handles ignored)
//! - Accessory scanning and permission passthrough
//! - Single-flight permission requests and result mapping
//! - Concurrent notification delivery
//! - Lifecycle-driven subscription
//!
//! Run with: `cargo test -p bus --test bus_tests`

use bus::{AccessoryEventBus, EventBus};
use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, MockPlatform, create_mock_handle, create_mock_handle_list, with_timeout,
};
use common::{AccessoryError, BusSettings, LifecycleState, PlatformNotification};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::watch;

fn started_bus() -> (EventBus, Arc<MockPlatform>) {
    let platform = Arc::new(MockPlatform::new());
    let bus = EventBus::new(
        platform.clone(),
        BusSettings::default(),
        LifecycleState::Started,
    )
    .expect("Failed to create event bus");
    (bus, platform)
}

fn granted(handle: Option<common::AccessoryHandle>) -> PlatformNotification {
    PlatformNotification::PermissionResult {
        handle,
        granted: true,
    }
}

fn denied(handle: Option<common::AccessoryHandle>) -> PlatformNotification {
    PlatformNotification::PermissionResult {
        handle,
        granted: false,
    }
}

// ============================================================================
// Attach / Detach Stream Tests
// ============================================================================

#[tokio::test]
async fn test_attached_stream_delivers_to_all_subscribers() {
    let (bus, platform) = started_bus();
    let mut a = bus.listen_attached();
    let mut b = bus.listen_attached();
    let handle = create_mock_handle(1);

    platform.emit(PlatformNotification::Attached(Some(handle.clone())));

    assert_eq!(a.recv().await.unwrap(), handle);
    assert_eq!(b.recv().await.unwrap(), handle);
}

#[tokio::test]
async fn test_detached_stream_delivers_handle() {
    let (bus, platform) = started_bus();
    let mut detached = bus.listen_detached();
    let mut attached = bus.listen_attached();
    let handle = create_mock_handle(2);

    platform.emit(PlatformNotification::Detached(Some(handle.clone())));

    assert_eq!(detached.recv().await.unwrap(), handle);
    assert!(matches!(attached.try_recv(), Err(TryRecvError::Empty)));
}

#[test]
fn test_streams_do_not_replay_history() {
    let (bus, platform) = started_bus();
    let _keep_alive = bus.listen_attached();
    platform.emit(PlatformNotification::Attached(Some(create_mock_handle(1))));

    let mut late = bus.listen_attached();
    assert!(matches!(late.try_recv(), Err(TryRecvError::Empty)));

    platform.emit(PlatformNotification::Attached(Some(create_mock_handle(2))));
    assert_eq!(late.try_recv().unwrap().id, 2);
}

#[test]
fn test_absent_handles_are_ignored() {
    let (bus, platform) = started_bus();
    let mut attached = bus.listen_attached();
    let mut detached = bus.listen_detached();

    platform.emit(PlatformNotification::Attached(None));
    platform.emit(PlatformNotification::Detached(None));

    assert!(matches!(attached.try_recv(), Err(TryRecvError::Empty)));
    assert!(matches!(detached.try_recv(), Err(TryRecvError::Empty)));
}

#[test]
fn test_concurrent_attach_and_detach_delivered_once_each() {
    let (bus, platform) = started_bus();
    let mut attached = bus.listen_attached();
    let mut detached = bus.listen_detached();

    let workers: Vec<_> = (1..=16u32)
        .map(|i| {
            let platform = platform.clone();
            thread::spawn(move || {
                if i % 2 == 0 {
                    platform.emit(PlatformNotification::Detached(Some(create_mock_handle(i))));
                    platform.emit(PlatformNotification::Attached(Some(create_mock_handle(i + 100))));
                } else {
                    platform.emit(PlatformNotification::Attached(Some(create_mock_handle(i + 100))));
                    platform.emit(PlatformNotification::Detached(Some(create_mock_handle(i))));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("emitter panicked");
    }

    let mut attached_ids = Vec::new();
    while let Ok(handle) = attached.try_recv() {
        attached_ids.push(handle.id);
    }
    let mut detached_ids = Vec::new();
    while let Ok(handle) = detached.try_recv() {
        detached_ids.push(handle.id);
    }

    attached_ids.sort_unstable();
    detached_ids.sort_unstable();
    assert_eq!(attached_ids, (101..=116).collect::<Vec<u32>>());
    assert_eq!(detached_ids, (1..=16).collect::<Vec<u32>>());
}

// ============================================================================
// Scan and Permission Query Tests
// ============================================================================

#[test]
fn test_scan_deduplicates_preserving_order() {
    let (bus, platform) = started_bus();
    let handles = create_mock_handle_list(3);
    platform.set_attached(vec![
        handles[1].clone(),
        handles[0].clone(),
        handles[1].clone(),
        handles[2].clone(),
        handles[0].clone(),
    ]);

    let scanned = bus.scan_attached_accessories();
    assert_eq!(
        scanned,
        vec![handles[1].clone(), handles[0].clone(), handles[2].clone()]
    );
}

#[test]
fn test_scan_empty_platform_returns_empty_list() {
    let (bus, _platform) = started_bus();
    assert!(bus.scan_attached_accessories().is_empty());
}

#[test]
fn test_has_permission_is_not_cached() {
    let (bus, platform) = started_bus();
    let handle = create_mock_handle(1);

    assert!(!bus.has_permission(&handle));
    platform.grant(&handle);
    assert!(bus.has_permission(&handle));
    platform.revoke(&handle);
    assert!(!bus.has_permission(&handle));
}

// ============================================================================
// Permission Request Tests
// ============================================================================

#[test]
fn test_concurrent_requests_dispatch_once() {
    let (bus, platform) = started_bus();
    let handle = create_mock_handle(1);

    assert!(bus.request_permission(&handle).is_ok());
    assert!(bus.request_permission(&handle).is_ok());

    assert_eq!(platform.request_count(), 1);
    assert!(bus.is_permission_pending());
}

#[test]
fn test_requests_from_many_threads_dispatch_once() {
    let (bus, platform) = started_bus();

    let workers: Vec<_> = (1..=8u32)
        .map(|i| {
            let bus = bus.clone();
            thread::spawn(move || bus.request_permission(&create_mock_handle(i)))
        })
        .collect();
    for worker in workers {
        assert!(worker.join().expect("requester panicked").is_ok());
    }

    assert_eq!(platform.request_count(), 1);
}

#[tokio::test]
async fn test_granted_with_handle_emits_handle() {
    let (bus, platform) = started_bus();
    let handle = create_mock_handle(1);

    bus.request_permission(&handle).unwrap();
    let mut results = bus.listen_granted_permission();
    platform.emit(granted(Some(handle.clone())));

    assert_eq!(results.recv().await.unwrap().unwrap(), handle);
    assert!(!bus.is_permission_pending());

    bus.request_permission(&handle).unwrap();
    assert_eq!(platform.request_count(), 2);
}

#[tokio::test]
async fn test_granted_without_handle_emits_missing_accessory() {
    let (bus, platform) = started_bus();

    bus.request_permission(&create_mock_handle(1)).unwrap();
    let mut results = bus.listen_granted_permission();
    platform.emit(granted(None));

    assert!(matches!(
        results.recv().await.unwrap(),
        Err(AccessoryError::MissingAccessoryHandle)
    ));
    assert!(!bus.is_permission_pending());

    bus.request_permission(&create_mock_handle(1)).unwrap();
    assert_eq!(platform.request_count(), 2);
}

#[tokio::test]
async fn test_denied_emits_permission_denied_with_handle() {
    let (bus, platform) = started_bus();
    let handle = create_mock_handle(4);

    bus.request_permission(&handle).unwrap();
    let mut results = bus.listen_granted_permission();
    platform.emit(denied(Some(handle.clone())));

    match results.recv().await.unwrap() {
        Err(AccessoryError::PermissionDenied { handle: denied }) => {
            assert_eq!(denied, Some(handle.clone()))
        }
        other => panic!("expected PermissionDenied, got {:?}", other),
    }
    assert!(!bus.is_permission_pending());

    bus.request_permission(&handle).unwrap();
    assert_eq!(platform.request_count(), 2);
}

#[tokio::test]
async fn test_denied_without_handle_carries_none() {
    let (bus, platform) = started_bus();

    bus.request_permission(&create_mock_handle(1)).unwrap();
    let mut results = bus.listen_granted_permission();
    platform.emit(denied(None));

    assert!(matches!(
        results.recv().await.unwrap(),
        Err(AccessoryError::PermissionDenied { handle: None })
    ));
    assert!(!bus.is_permission_pending());
}

#[test]
fn test_result_stream_persists_across_requests() {
    let (bus, platform) = started_bus();
    let handle = create_mock_handle(1);

    let mut early = bus.listen_granted_permission();
    bus.request_permission(&handle).unwrap();
    platform.emit(granted(Some(handle.clone())));
    bus.request_permission(&handle).unwrap();
    platform.emit(denied(Some(handle.clone())));

    assert_eq!(early.try_recv().unwrap().unwrap(), handle);
    assert!(matches!(
        early.try_recv().unwrap(),
        Err(AccessoryError::PermissionDenied { .. })
    ));
    assert_eq!(platform.request_count(), 2);
}

#[test]
fn test_answer_during_dispatch_is_observable() {
    let (bus, platform) = started_bus();
    platform.set_answer_inline(Some(true));
    let handle = create_mock_handle(3);

    let mut before = bus.listen_granted_permission();
    bus.request_permission(&handle).unwrap();

    assert_eq!(before.try_recv().unwrap().unwrap(), handle);
    assert!(!bus.is_permission_pending());

    let mut after = bus.listen_granted_permission();
    bus.request_permission(&handle).unwrap();
    assert_eq!(after.try_recv().unwrap().unwrap(), handle);
    assert_eq!(platform.request_count(), 2);
}

#[test]
fn test_denial_during_dispatch_is_observable() {
    let (bus, platform) = started_bus();
    platform.set_answer_inline(Some(false));
    let handle = create_mock_handle(5);

    let mut results = bus.listen_granted_permission();
    bus.request_permission(&handle).unwrap();

    match results.try_recv().unwrap() {
        Err(AccessoryError::PermissionDenied { handle: denied }) => {
            assert_eq!(denied, Some(handle))
        }
        other => panic!("expected PermissionDenied, got {:?}", other),
    }
}

#[test]
fn test_pending_request_keeps_result_stream() {
    let (bus, platform) = started_bus();
    let handle = create_mock_handle(1);

    bus.request_permission(&handle).unwrap();
    let mut results = bus.listen_granted_permission();
    bus.request_permission(&handle).unwrap();

    platform.emit(granted(Some(handle.clone())));
    assert_eq!(results.try_recv().unwrap().unwrap(), handle);
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[test]
fn test_notifications_while_stopped_are_lost() {
    let (bus, platform) = started_bus();
    let mut attached = bus.listen_attached();

    bus.stop();
    assert!(!platform.emit(PlatformNotification::Attached(Some(create_mock_handle(1)))));

    bus.start().unwrap();
    platform.emit(PlatformNotification::Attached(Some(create_mock_handle(2))));

    assert_eq!(attached.try_recv().unwrap().id, 2);
    assert!(matches!(attached.try_recv(), Err(TryRecvError::Empty)));
}

#[test]
fn test_stop_abandons_pending_request() {
    let (bus, platform) = started_bus();
    let handle = create_mock_handle(1);

    bus.request_permission(&handle).unwrap();
    assert!(bus.is_permission_pending());

    bus.stop();
    assert!(!bus.is_permission_pending());

    bus.start().unwrap();
    bus.request_permission(&handle).unwrap();
    assert_eq!(platform.request_count(), 2);
}

#[test]
fn test_created_bus_receives_nothing_until_started() {
    let platform = Arc::new(MockPlatform::new());
    let bus = EventBus::new(
        platform.clone(),
        BusSettings::default(),
        LifecycleState::Created,
    )
    .unwrap();
    let mut attached = bus.listen_attached();

    assert!(!platform.emit(PlatformNotification::Attached(Some(create_mock_handle(1)))));

    bus.start().unwrap();
    platform.emit(PlatformNotification::Attached(Some(create_mock_handle(2))));
    assert_eq!(attached.try_recv().unwrap().id, 2);
}

#[tokio::test]
async fn test_follow_lifecycle_drives_registration() {
    let platform = Arc::new(MockPlatform::new());
    let bus = EventBus::new(
        platform.clone(),
        BusSettings::default(),
        LifecycleState::Created,
    )
    .unwrap();

    let (lifecycle_tx, lifecycle_rx) = watch::channel(LifecycleState::Created);
    let task = bus.follow_lifecycle(lifecycle_rx);

    lifecycle_tx.send(LifecycleState::Started).unwrap();
    with_timeout(DEFAULT_TEST_TIMEOUT, async {
        while !platform.is_registered() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("bus never started");

    lifecycle_tx.send(LifecycleState::Stopped).unwrap();
    with_timeout(DEFAULT_TEST_TIMEOUT, async {
        while platform.is_registered() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("bus never stopped");

    lifecycle_tx.send(LifecycleState::Started).unwrap();
    drop(lifecycle_tx);
    with_timeout(DEFAULT_TEST_TIMEOUT, task)
        .await
        .expect("lifecycle task did not exit")
        .unwrap();

    assert!(!platform.is_registered());
    assert_eq!(bus.lifecycle(), LifecycleState::Stopped);
    assert_eq!(platform.registration_count(), 2);
}
