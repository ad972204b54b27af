//! Printer registry tests.
//!
//! Adapters are built over the in-memory transport so the registry's
//! create/update/delete rules can be checked without any printer.

use printfleet_core::{
    ConnectionState, EventBus, FleetEvent, FleetSettings, LoginDto, PrinterProtocol,
    PrinterRecord, SharedEventBus, SharedSettings,
};
use printfleet_devices::adapters::{AdapterDeps, AdapterFactory, create_adapter};
use printfleet_devices::mock::MockConnector;
use printfleet_devices::{
    AdapterResult, BambuAdapter, MoonrakerAdapter, PrinterAdapter, PrinterRegistry,
    RegistryOutcome,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Builds Bambu and Moonraker adapters over one mock connector.
struct MockFactory {
    connector: Arc<MockConnector>,
}

impl AdapterFactory for MockFactory {
    fn create(
        &self,
        record: &PrinterRecord,
        deps: &AdapterDeps,
    ) -> AdapterResult<Arc<dyn PrinterAdapter>> {
        let id = record.id.clone();
        let bus = deps.bus.clone();
        let settings = deps.settings.clone();
        let connector = self.connector.clone();
        match record.protocol() {
            PrinterProtocol::Bambu => Ok(Arc::new(BambuAdapter::with_connector(
                id, bus, settings, connector,
            )?)),
            PrinterProtocol::Moonraker => Ok(Arc::new(MoonrakerAdapter::with_connector(
                id, bus, settings, connector,
            )?)),
            _ => create_adapter(record, deps),
        }
    }
}

fn respond(method: &str, _params: &Value) -> Value {
    match method {
        "printer.objects.subscribe" => json!({ "status": { "webhooks": { "state": "ready" } } }),
        _ => json!({}),
    }
}

struct Harness {
    bus: SharedEventBus,
    connector: Arc<MockConnector>,
    registry: PrinterRegistry,
}

fn harness(settings: FleetSettings) -> Harness {
    let bus: SharedEventBus = Arc::new(EventBus::new());
    let connector = MockConnector::new();

    // Bambu peers never send ids, so the RPC responder just drains them
    let peers = connector.clone();
    tokio::spawn(async move {
        while let Some(peer) = peers.next_peer().await {
            let _ = peer.spawn_jsonrpc_responder(respond);
        }
    });

    let registry = PrinterRegistry::with_factory(
        bus.clone(),
        SharedSettings::new(settings),
        Arc::new(MockFactory {
            connector: connector.clone(),
        }),
    );
    Harness {
        bus,
        connector,
        registry,
    }
}

fn bambu(id: &str) -> PrinterRecord {
    PrinterRecord::new(
        id,
        LoginDto::new(PrinterProtocol::Bambu, "192.168.1.50").with_device_secret("01S00A", "12345678"),
    )
}

fn moonraker(id: &str) -> PrinterRecord {
    PrinterRecord::new(
        id,
        LoginDto::new(PrinterProtocol::Moonraker, "http://192.168.1.51:7125"),
    )
}

fn drain_for(rx: &mut printfleet_core::EventBusReceiver, device_id: &str) -> Vec<FleetEvent> {
    let mut events = Vec::new();
    while let Some((event, _)) = rx.try_recv() {
        if event.device_id() == Some(device_id) {
            events.push(event);
        }
    }
    events
}

#[tokio::test(start_paused = true)]
async fn test_created_printer_connects() {
    let h = harness(FleetSettings::default());

    let outcome = h.registry.on_created(bambu("b1")).await.unwrap();
    assert_eq!(outcome, RegistryOutcome::Created);

    let adapter = h.registry.get("b1").await.unwrap();
    assert_eq!(adapter.protocol(), PrinterProtocol::Bambu);
    assert_eq!(adapter.connection_state(), ConnectionState::Connected);
    assert_eq!(h.connector.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disabled_printer_goes_silent() {
    let h = harness(FleetSettings::default());
    h.registry.on_created(bambu("b1")).await.unwrap();
    let mut rx = h.bus.subscribe();

    let mut disabled = bambu("b1");
    disabled.enabled = false;
    let outcome = h.registry.on_updated(disabled).await.unwrap();
    assert_eq!(outcome, RegistryOutcome::Skipped);
    assert!(h.registry.get("b1").await.is_none());

    tokio::time::sleep(Duration::from_secs(30)).await;

    // Only the removal is announced; the closing session stays silent
    let events = drain_for(&mut rx, "b1");
    assert_eq!(events.len(), 1, "events: {:?}", events);
    assert!(matches!(events[0], FleetEvent::PrinterRemoved { .. }));
    assert_eq!(h.connector.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_update_same_protocol_keeps_adapter() {
    let h = harness(FleetSettings::default());
    h.registry.on_created(bambu("b1")).await.unwrap();
    let before = h.registry.get("b1").await.unwrap();

    let mut rotated = bambu("b1");
    rotated.name = "Workshop X1C".to_string();
    rotated.login.access_code = Some("87654321".to_string());
    let outcome = h.registry.on_updated(rotated).await.unwrap();
    assert_eq!(outcome, RegistryOutcome::Updated);

    let after = h.registry.get("b1").await.unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(after.connection_state(), ConnectionState::Connected);

    // New credentials mean a new session
    assert_eq!(h.connector.open_count(), 2);
    let record = h.registry.record("b1").await.unwrap();
    assert_eq!(record.name, "Workshop X1C");
    assert_eq!(record.login.access_code.as_deref(), Some("87654321"));
}

#[tokio::test(start_paused = true)]
async fn test_protocol_change_replaces_adapter() {
    let h = harness(FleetSettings::default());
    h.registry.on_created(bambu("p1")).await.unwrap();
    let mut rx = h.bus.subscribe();

    let outcome = h.registry.on_updated(moonraker("p1")).await.unwrap();
    assert_eq!(outcome, RegistryOutcome::Replaced);

    let adapter = h.registry.get("p1").await.unwrap();
    assert_eq!(adapter.protocol(), PrinterProtocol::Moonraker);
    assert_eq!(adapter.connection_state(), ConnectionState::Connected);

    // A replacement is not a removal
    let events = drain_for(&mut rx, "p1");
    assert!(events
        .iter()
        .all(|event| !matches!(event, FleetEvent::PrinterRemoved { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_disabled_protocol_is_not_connected() {
    let h = harness(FleetSettings {
        bambu_enabled: false,
        ..FleetSettings::default()
    });

    let outcome = h.registry.on_created(bambu("b1")).await.unwrap();
    assert_eq!(outcome, RegistryOutcome::Skipped);
    assert_eq!(h.connector.attempt_count(), 0);
    assert!(h.registry.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_batch_and_fleet_reload() {
    let h = harness(FleetSettings::default());

    let results = h
        .registry
        .on_batch_created(vec![bambu("b1"), bambu("b2"), moonraker("m1")])
        .await;
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|(_, result)| result.is_ok()));
    assert_eq!(h.registry.list_ids().await, vec!["b1", "b2", "m1"]);

    let results = h.registry.load_fleet(vec![bambu("b2"), moonraker("m1")]).await;
    assert_eq!(results.len(), 2);
    assert_eq!(h.registry.list_ids().await, vec!["b2", "m1"]);

    let overview = h.registry.connection_overview().await;
    assert_eq!(overview.len(), 2);
    assert_eq!(overview[0].device_id, "b2");
    assert_eq!(overview[0].protocol, PrinterProtocol::Bambu);
    assert_eq!(overview[1].state, ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_delete_and_shutdown() {
    let h = harness(FleetSettings::default());
    h.registry.on_batch_created(vec![bambu("b1"), bambu("b2")]).await;
    let mut removed = h.bus.filter().event_type("PrinterRemoved");

    h.registry.on_deleted("b1").await.unwrap();
    let (event, meta) = tokio::time::timeout(Duration::from_secs(1), removed.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.device_id(), Some("b1"));
    assert_eq!(meta.source, "registry");

    h.registry.shutdown().await;
    assert!(h.registry.is_empty().await);
    // Shutdown tears down without announcing removals
    assert!(removed.try_recv().is_none());
}
