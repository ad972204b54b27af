//! Event bus tests.
//!
//! Tests include:
//! - Fan-out to multiple subscribers
//! - Filtering by event name and device
//! - Status sync events carrying diff cache snapshots

use printfleet_core::{
    ConnectionState, DiffCache, EventBus, FleetEvent, LifecycleKind, PrinterStatus,
    SharedEventBus,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn lifecycle(device_id: &str, kind: LifecycleKind) -> FleetEvent {
    FleetEvent::Lifecycle {
        device_id: device_id.to_string(),
        kind,
        reason: "test".to_string(),
        timestamp: 0,
    }
}

#[tokio::test]
async fn test_event_bus_multiple_subscribers() {
    let bus = EventBus::new();
    let mut rx1 = bus.subscribe();
    let mut rx2 = bus.subscribe();

    bus.publish(lifecycle("p1", LifecycleKind::TransportLost));

    let event1 = rx1.recv().await.unwrap();
    let event2 = rx2.recv().await.unwrap();
    assert_eq!(event1.0.type_name(), "Lifecycle");
    assert_eq!(event2.0, event1.0);
    // Each delivery shares the same metadata
    assert_eq!(event1.1.event_id, event2.1.event_id);
}

#[tokio::test]
async fn test_event_type_filter_skips_other_events() {
    let bus = EventBus::new();
    let mut rx = bus.filter().event_type("Lifecycle");

    bus.publish(FleetEvent::ConnectionStateChanged {
        device_id: "p1".to_string(),
        previous: ConnectionState::Connected,
        state: ConnectionState::Reconnecting,
        timestamp: 0,
    });
    bus.publish(lifecycle("p1", LifecycleKind::HeartbeatFailed));

    let (event, _) = timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        event,
        FleetEvent::Lifecycle {
            kind: LifecycleKind::HeartbeatFailed,
            ..
        }
    ));
}

#[tokio::test]
async fn test_shared_bus_across_tasks() {
    let bus: SharedEventBus = Arc::new(EventBus::new());
    let mut rx = bus.filter().device("printer-7");

    let publisher = bus.clone();
    tokio::spawn(async move {
        publisher.publish_with_source(
            lifecycle("printer-7", LifecycleKind::Closed),
            "adapter:printer-7",
        );
    });

    let (event, meta) = timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.device_id(), Some("printer-7"));
    assert_eq!(meta.source, "adapter:printer-7");
}

#[tokio::test]
async fn test_status_sync_event_from_flush() {
    let cache = DiffCache::new();
    cache.set_value("p1", PrinterStatus::new("Printing"));
    cache.set_value("p2", PrinterStatus::new("Operational"));
    cache.delete_value("p2");

    let snapshot = cache.flush();
    let event = FleetEvent::StatusSync {
        updated: snapshot.updated_values,
        deleted: snapshot.deleted_keys.into_iter().collect(),
        timestamp: 0,
    };

    let value = serde_json::to_value(&event).unwrap();
    assert_eq!(value["type"], "statusSync");
    assert_eq!(value["updated"]["p1"]["stateText"], "Printing");
    assert_eq!(value["deleted"][0], "p2");
    assert!(value["updated"].get("p2").is_none());
}
