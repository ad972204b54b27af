//! End-to-end session tests over the in-memory transport.
//!
//! A scripted Moonraker peer answers JSON-RPC so the full path runs:
//! connect -> handshake -> live status -> session loss -> reconnect.

use printfleet_core::{
    ConnectionState, EventBus, FilteredReceiver, FleetEvent, LifecycleKind, LoginDto,
    PrinterProtocol, SharedSettings,
};
use printfleet_devices::mock::{MockConnector, MockOutcome, MockPeerSender};
use printfleet_devices::{MoonrakerAdapter, PrinterAdapter};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn respond(method: &str, _params: &Value) -> Value {
    match method {
        "server.connection.identify" => json!({ "connection_id": 7 }),
        "printer.objects.subscribe" => json!({
            "eventtime": 1.0,
            "status": {
                "webhooks": { "state": "ready" },
                "print_stats": { "state": "standby", "filename": "" },
                "extruder": { "temperature": 24.5, "target": 0.0 },
            }
        }),
        "server.info" => json!({ "moonraker_version": "v0.9.3" }),
        _ => json!("ok"),
    }
}

/// Answer every session the connector accepts; hand back one sender per
/// session so the test can push notifications or drop the link.
fn serve(connector: Arc<MockConnector>) -> mpsc::UnboundedReceiver<MockPeerSender> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(peer) = connector.next_peer().await {
            let (sender, _task) = peer.spawn_jsonrpc_responder(respond);
            if tx.send(sender).is_err() {
                break;
            }
        }
    });
    rx
}

fn login() -> LoginDto {
    LoginDto::new(PrinterProtocol::Moonraker, "http://10.0.0.5:7125")
}

async fn wait_for_state(adapter: &MoonrakerAdapter, state: ConnectionState) {
    tokio::time::timeout(Duration::from_secs(60), async {
        while adapter.connection_state() != state {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never reached {:?}", state));
}

fn lifecycle_kinds(
    rx: &mut FilteredReceiver<fn(&FleetEvent) -> bool>,
) -> Vec<LifecycleKind> {
    let mut kinds = Vec::new();
    while let Some((event, _)) = rx.try_recv() {
        if let FleetEvent::Lifecycle { kind, .. } = event {
            kinds.push(kind);
        }
    }
    kinds
}

#[tokio::test(start_paused = true)]
async fn test_connect_handshake_and_status() {
    let bus = Arc::new(EventBus::new());
    let connector = MockConnector::new();
    let mut sessions = serve(connector.clone());
    let mut status_rx = bus.filter().event_type("CurrentStatus");

    let adapter = MoonrakerAdapter::with_connector(
        "m1",
        bus.clone(),
        SharedSettings::default(),
        connector.clone(),
    )
    .unwrap();

    adapter.connect(login()).await.unwrap();
    assert_eq!(adapter.connection_state(), ConnectionState::Connected);
    assert_eq!(adapter.get_version().await.unwrap(), "v0.9.3");

    // Status from the subscribe answer
    let (event, _) = tokio::time::timeout(Duration::from_secs(5), status_rx.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        FleetEvent::CurrentStatus { device_id, status } => {
            assert_eq!(device_id, "m1");
            assert_eq!(status.state_text, "Standby");
            assert!(status.flags.ready);
        }
        other => panic!("unexpected event {:?}", other),
    }

    // A partial update is merged over the cached objects
    let peer = sessions.recv().await.unwrap();
    peer.send_json(&json!({
        "jsonrpc": "2.0",
        "method": "notify_status_update",
        "params": [{ "print_stats": { "state": "printing", "filename": "benchy.gcode" } }, 2.0]
    }));
    let (event, _) = tokio::time::timeout(Duration::from_secs(5), status_rx.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        FleetEvent::CurrentStatus { status, .. } => {
            assert!(status.flags.printing);
            assert_eq!(status.job_file(), Some("benchy.gcode"));
            assert!(status.temperature("tool0").is_some());
        }
        other => panic!("unexpected event {:?}", other),
    }

    adapter.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_peer_close_reconnects_once() {
    let bus = Arc::new(EventBus::new());
    let connector = MockConnector::new();
    let mut sessions = serve(connector.clone());
    let mut lifecycle = bus.filter().lifecycle_events();

    let adapter = MoonrakerAdapter::with_connector(
        "m1",
        bus.clone(),
        SharedSettings::default(),
        connector.clone(),
    )
    .unwrap();
    adapter.connect(login()).await.unwrap();
    let first = sessions.recv().await.unwrap();

    first.close();
    wait_for_state(&adapter, ConnectionState::Reconnecting).await;
    wait_for_state(&adapter, ConnectionState::Connected).await;

    assert_eq!(connector.open_count(), 2);
    assert_eq!(adapter.get_version().await.unwrap(), "v0.9.3");

    let kinds = lifecycle_kinds(&mut lifecycle);
    let lost = kinds
        .iter()
        .filter(|kind| **kind == LifecycleKind::TransportLost)
        .count();
    assert_eq!(lost, 1, "lifecycle events: {:?}", kinds);
    // The close ends liveness once; the stopped monitor adds nothing
    let heartbeat_failures = kinds
        .iter()
        .filter(|kind| **kind == LifecycleKind::HeartbeatFailed)
        .count();
    assert_eq!(heartbeat_failures, 1, "lifecycle events: {:?}", kinds);

    adapter.disconnect().await.unwrap();
}

fn state_path(rx: &mut FilteredReceiver<impl Fn(&FleetEvent) -> bool + Send>) -> Vec<ConnectionState> {
    let mut path = Vec::new();
    while let Some((event, _)) = rx.try_recv() {
        if let FleetEvent::ConnectionStateChanged { state, .. } = event {
            path.push(state);
        }
    }
    path
}

#[tokio::test(start_paused = true)]
async fn test_silent_peer_fails_heartbeat() {
    let bus = Arc::new(EventBus::new());
    let connector = MockConnector::new();
    // Only the first session ignores pings
    connector.set_auto_pong(false);
    let mut sessions = serve(connector.clone());
    let mut lifecycle = bus.filter().lifecycle_events();
    let mut states = bus.filter().event_type("ConnectionStateChanged");

    let adapter = MoonrakerAdapter::with_connector(
        "m1",
        bus.clone(),
        SharedSettings::default(),
        connector.clone(),
    )
    .unwrap();
    adapter.connect(login()).await.unwrap();
    let first = sessions.recv().await.unwrap();
    connector.set_auto_pong(true);

    wait_for_state(&adapter, ConnectionState::Reconnecting).await;
    assert!(first.is_closed());
    wait_for_state(&adapter, ConnectionState::Connected).await;
    assert_eq!(connector.open_count(), 2);

    // The new session answers probes and stays up
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(adapter.connection_state(), ConnectionState::Connected);
    assert_eq!(connector.open_count(), 2);

    assert_eq!(
        lifecycle_kinds(&mut lifecycle),
        vec![LifecycleKind::HeartbeatFailed]
    );
    assert_eq!(
        state_path(&mut states),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Reconnecting,
            ConnectionState::Connected,
        ]
    );

    adapter.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_hung_handshake_times_out_and_retries() {
    let bus = Arc::new(EventBus::new());
    let connector = MockConnector::with_script(vec![MockOutcome::Hang]);
    let _sessions = serve(connector.clone());
    let mut lifecycle = bus.filter().lifecycle_events();

    let adapter = MoonrakerAdapter::with_connector(
        "m1",
        bus.clone(),
        SharedSettings::default(),
        connector.clone(),
    )
    .unwrap();

    let started = tokio::time::Instant::now();
    adapter.connect(login()).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(5000));
    assert_eq!(adapter.connection_state(), ConnectionState::Reconnecting);
    assert_eq!(connector.attempt_count(), 1);
    assert_eq!(connector.open_count(), 0);

    match lifecycle.try_recv().unwrap().0 {
        FleetEvent::Lifecycle { kind, reason, .. } => {
            assert_eq!(kind, LifecycleKind::HandshakeFailed);
            assert!(reason.contains("5000ms"), "reason: {}", reason);
        }
        other => panic!("unexpected event {:?}", other),
    }

    wait_for_state(&adapter, ConnectionState::Connected).await;
    assert_eq!(connector.attempt_count(), 2);
    assert_eq!(connector.open_count(), 1);
    assert!(lifecycle.try_recv().is_none());

    adapter.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_refused_handshake_retries_on_interval() {
    let bus = Arc::new(EventBus::new());
    let connector = MockConnector::with_script(vec![MockOutcome::Refuse("no route".into())]);
    let _sessions = serve(connector.clone());
    let mut lifecycle = bus.filter().lifecycle_events();

    let adapter = MoonrakerAdapter::with_connector(
        "m1",
        bus.clone(),
        SharedSettings::default(),
        connector.clone(),
    )
    .unwrap();

    // A failed handshake is not an error for the caller
    adapter.connect(login()).await.unwrap();
    assert_eq!(adapter.connection_state(), ConnectionState::Reconnecting);

    wait_for_state(&adapter, ConnectionState::Connected).await;
    assert_eq!(connector.attempt_count(), 2);
    assert_eq!(
        lifecycle_kinds(&mut lifecycle),
        vec![LifecycleKind::HandshakeFailed]
    );

    adapter.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_everything() {
    let bus = Arc::new(EventBus::new());
    let connector = MockConnector::new();
    let mut sessions = serve(connector.clone());
    let mut lifecycle = bus.filter().lifecycle_events();

    let adapter = MoonrakerAdapter::with_connector(
        "m1",
        bus.clone(),
        SharedSettings::default(),
        connector.clone(),
    )
    .unwrap();
    adapter.connect(login()).await.unwrap();
    let peer = sessions.recv().await.unwrap();

    adapter.disconnect().await.unwrap();
    assert_eq!(adapter.connection_state(), ConnectionState::Disconnected);
    assert!(peer.is_closed());

    // No timer survives the disconnect
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.attempt_count(), 1);
    assert_eq!(adapter.connection_state(), ConnectionState::Disconnected);
    assert_eq!(lifecycle_kinds(&mut lifecycle), vec![LifecycleKind::Closed]);

    // Disconnecting twice is a no-op
    adapter.disconnect().await.unwrap();
    assert!(adapter.get_version().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_second_connect_is_rejected() {
    let bus = Arc::new(EventBus::new());
    let connector = MockConnector::new();
    let _sessions = serve(connector.clone());

    let adapter = MoonrakerAdapter::with_connector(
        "m1",
        bus,
        SharedSettings::default(),
        connector.clone(),
    )
    .unwrap();
    adapter.connect(login()).await.unwrap();

    let err = adapter.connect(login()).await.unwrap_err();
    assert!(err.to_string().contains("already exists"));
    assert_eq!(connector.attempt_count(), 1);

    adapter.disconnect().await.unwrap();
}
