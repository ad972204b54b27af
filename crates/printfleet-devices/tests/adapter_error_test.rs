//! Adapter Error Handling Tests
//!
//! Tests error handling in printer adapters including:
//! - Error display and classification
//! - Invalid logins rejected before any connection attempt
//! - Operations that need a live session
//! - Operations a protocol does not support

use printfleet_core::{
    ApiState, ConnectionState, CoreError, EventBus, LoginDto, PrinterProtocol, PrinterRecord,
    SharedSettings,
};
use printfleet_devices::adapters::{
    create_adapter, AdapterDeps, BambuAdapter, OctoprintAdapter, PrusaLinkAdapter,
};
use printfleet_devices::mock::MockConnector;
use printfleet_devices::{AdapterError, Axis, JogCommand, PrinterAdapter};
use std::sync::Arc;

fn deps() -> AdapterDeps {
    AdapterDeps {
        bus: Arc::new(EventBus::new()),
        settings: SharedSettings::default(),
    }
}

#[tokio::test]
async fn test_error_display_configuration() {
    let error = AdapterError::Configuration("missing api key".to_string());
    assert!(format!("{}", error).contains("Configuration error: missing api key"));
}

#[tokio::test]
async fn test_error_display_timeouts() {
    let error = AdapterError::RequestTimeout(3000);
    assert_eq!(format!("{}", error), "Request timeout after 3000ms");

    let error = AdapterError::HandshakeTimeout(5000);
    assert!(format!("{}", error).contains("5000ms"));
}

#[tokio::test]
async fn test_error_display_already_connected() {
    let error = AdapterError::AlreadyConnected(ConnectionState::Reconnecting);
    let error_msg = format!("{}", error);
    assert!(error_msg.contains("already exists"));
}

#[tokio::test]
async fn test_error_from_core() {
    let core = CoreError::InvalidLogin {
        protocol: "bambu".to_string(),
        reason: "serial and access code are required".to_string(),
    };
    let error: AdapterError = core.into();
    assert!(matches!(error, AdapterError::Configuration(_)));
}

#[tokio::test]
async fn test_error_from_anyhow() {
    let error = AdapterError::Other(anyhow::anyhow!("disk full"));
    assert!(format!("{:?}", error).contains("disk full"));
}

#[test]
fn test_error_classification() {
    assert!(AdapterError::Closed("bye".into()).is_closed());
    assert!(AdapterError::NotImplemented("jog").is_not_implemented());

    assert!(AdapterError::Connection("refused".into()).is_retryable());
    assert!(AdapterError::RequestTimeout(3000).is_retryable());
    assert!(!AdapterError::Configuration("bad".into()).is_retryable());
    assert!(!AdapterError::Protocol("bad".into()).is_retryable());

    assert!(!AdapterError::NotConnected.is_auth_failure());
    assert_eq!(AdapterError::NotConnected.api_state(), ApiState::NoResponse);
}

#[tokio::test]
async fn test_invalid_login_never_connects() {
    let connector = MockConnector::new();
    let adapter = BambuAdapter::with_connector(
        "b1",
        Arc::new(EventBus::new()),
        SharedSettings::default(),
        connector.clone(),
    )
    .unwrap();

    // No access code
    let login = LoginDto::new(PrinterProtocol::Bambu, "192.168.1.50");
    let result = adapter.connect(login).await;
    assert!(matches!(result, Err(AdapterError::Configuration(_))));
    assert_eq!(connector.attempt_count(), 0);
    assert_eq!(adapter.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_unparseable_address_is_rejected() {
    let adapter = OctoprintAdapter::new("op1", Arc::new(EventBus::new()), SharedSettings::default())
        .unwrap();
    let login = LoginDto::new(PrinterProtocol::Octoprint, "ftp://octopi.local").with_api_key("key");
    let result = adapter.connect(login).await;
    assert!(matches!(result, Err(AdapterError::Configuration(_))));
    assert_eq!(adapter.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_operations_need_a_session() {
    for protocol in PrinterProtocol::ALL {
        let record = PrinterRecord::new("p1", LoginDto::new(protocol, "192.168.1.10"));
        let adapter = create_adapter(&record, &deps()).unwrap();

        let result = adapter.pause_print().await;
        assert!(
            matches!(result, Err(AdapterError::NotConnected)),
            "{} returned {:?}",
            protocol,
            result
        );
    }
}

#[tokio::test]
async fn test_disconnect_when_idle_is_noop() {
    for protocol in PrinterProtocol::ALL {
        let record = PrinterRecord::new("p1", LoginDto::new(protocol, "192.168.1.10"));
        let adapter = create_adapter(&record, &deps()).unwrap();
        adapter.disconnect().await.unwrap();
        assert_eq!(adapter.connection_state(), ConnectionState::Disconnected);
    }
}

#[tokio::test]
async fn test_prusa_link_has_no_motion_control() {
    let adapter =
        PrusaLinkAdapter::new("pl1", Arc::new(EventBus::new()), SharedSettings::default())
            .unwrap();

    let jog = JogCommand {
        x: 10.0,
        y: 0.0,
        z: 0.0,
        speed: None,
    };
    assert!(adapter.jog(jog).await.unwrap_err().is_not_implemented());
    assert!(adapter.home(&[Axis::X]).await.unwrap_err().is_not_implemented());
    assert!(adapter
        .send_gcode(&["M105".to_string()])
        .await
        .unwrap_err()
        .is_not_implemented());
    assert!(adapter.restart_host().await.unwrap_err().is_not_implemented());
}
