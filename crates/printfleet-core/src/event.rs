//! Fleet event model.
//!
//! These are the only messages the connectivity layer sends downstream.
//! Every per-device event carries the device id so subscribers can filter
//! by event name plus device.

use crate::printer::{ApiState, ConnectionState, PrinterProtocol, SocketState};
use crate::status::PrinterStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Discriminates lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleKind {
    /// Liveness probe went unanswered
    HeartbeatFailed,
    /// Transport closed or failed underneath a live session
    TransportLost,
    /// Session closed on purpose (disconnect, teardown)
    Closed,
    /// A handshake attempt failed
    HandshakeFailed,
    /// Protocol-level problem worth surfacing (auth rejected, device shutdown)
    Error,
}

impl LifecycleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HeartbeatFailed => "heartbeatFailed",
            Self::TransportLost => "transportLost",
            Self::Closed => "closed",
            Self::HandshakeFailed => "handshakeFailed",
            Self::Error => "error",
        }
    }
}

/// Event published on the fleet event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FleetEvent {
    /// Connection state machine moved
    #[serde(rename_all = "camelCase")]
    ConnectionStateChanged {
        device_id: String,
        previous: ConnectionState,
        state: ConnectionState,
        timestamp: i64,
    },

    /// Socket or API sub-state changed
    #[serde(rename_all = "camelCase")]
    PrinterStateChanged {
        device_id: String,
        protocol: PrinterProtocol,
        socket_state: SocketState,
        api_state: ApiState,
        timestamp: i64,
    },

    /// Live status update from a device
    #[serde(rename_all = "camelCase")]
    CurrentStatus {
        device_id: String,
        status: PrinterStatus,
    },

    /// Heartbeat, close and error notifications
    #[serde(rename_all = "camelCase")]
    Lifecycle {
        device_id: String,
        kind: LifecycleKind,
        reason: String,
        timestamp: i64,
    },

    /// A device left the fleet
    #[serde(rename_all = "camelCase")]
    PrinterRemoved { device_id: String, timestamp: i64 },

    /// Incremental status push produced by a diff cache flush
    #[serde(rename_all = "camelCase")]
    StatusSync {
        updated: BTreeMap<String, PrinterStatus>,
        deleted: Vec<String>,
        timestamp: i64,
    },
}

impl FleetEvent {
    /// Event name used for filtering.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::ConnectionStateChanged { .. } => "ConnectionStateChanged",
            Self::PrinterStateChanged { .. } => "PrinterStateChanged",
            Self::CurrentStatus { .. } => "CurrentStatus",
            Self::Lifecycle { .. } => "Lifecycle",
            Self::PrinterRemoved { .. } => "PrinterRemoved",
            Self::StatusSync { .. } => "StatusSync",
        }
    }

    /// Device this event belongs to, if it is per-device.
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::ConnectionStateChanged { device_id, .. }
            | Self::PrinterStateChanged { device_id, .. }
            | Self::CurrentStatus { device_id, .. }
            | Self::Lifecycle { device_id, .. }
            | Self::PrinterRemoved { device_id, .. } => Some(device_id),
            Self::StatusSync { .. } => None,
        }
    }

    /// Whether this event concerns a single device.
    pub fn is_device_event(&self) -> bool {
        self.device_id().is_some()
    }

    /// Whether this is a lifecycle notification.
    pub fn is_lifecycle_event(&self) -> bool {
        matches!(self, Self::Lifecycle { .. })
    }

    /// Whether this is a state change (connection or sub-state).
    pub fn is_state_event(&self) -> bool {
        matches!(
            self,
            Self::ConnectionStateChanged { .. } | Self::PrinterStateChanged { .. }
        )
    }
}

/// Metadata attached to every published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub event_id: uuid::Uuid,
    /// Unix millis
    pub timestamp: i64,
    /// Publisher, e.g. `adapter:printer-1`
    pub source: String,
}

impl EventMetadata {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            source: source.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id() {
        let event = FleetEvent::PrinterRemoved {
            device_id: "p1".to_string(),
            timestamp: 0,
        };
        assert_eq!(event.device_id(), Some("p1"));
        assert_eq!(event.type_name(), "PrinterRemoved");

        let sync = FleetEvent::StatusSync {
            updated: BTreeMap::new(),
            deleted: vec![],
            timestamp: 0,
        };
        assert!(!sync.is_device_event());
    }

    #[test]
    fn test_serialized_tag() {
        let event = FleetEvent::Lifecycle {
            device_id: "p1".to_string(),
            kind: LifecycleKind::HeartbeatFailed,
            reason: "no pong".to_string(),
            timestamp: 1,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "lifecycle");
        assert_eq!(value["kind"], "heartbeatFailed");
        assert_eq!(value["deviceId"], "p1");
    }
}
