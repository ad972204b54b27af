//! Per-printer shared state: connection state machine, sub-state tracking,
//! credentials and gated event emission.
//!
//! Every adapter owns one `PrinterContext` behind an `Arc` and hands clones
//! to its background tasks.

use crate::adapter::{AdapterError, AdapterResult};
use parking_lot::{Mutex, RwLock};
use printfleet_core::{
    ApiState, ConnectionState, FleetEvent, LifecycleKind, LoginDto, PrinterProtocol,
    PrinterStatus, SharedEventBus, SharedSettings, SocketState, SubState,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Publishes events for one printer, unless emission has been switched off.
#[derive(Clone)]
pub struct EventEmitter {
    device_id: String,
    source: String,
    bus: SharedEventBus,
    enabled: Arc<AtomicBool>,
}

impl EventEmitter {
    pub fn new(device_id: impl Into<String>, bus: SharedEventBus) -> Self {
        let device_id = device_id.into();
        Self {
            source: format!("adapter:{}", device_id),
            device_id,
            bus,
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Publish `event` if emission is allowed.
    pub fn emit(&self, event: FleetEvent) {
        if !self.is_enabled() {
            debug!(device_id = %self.device_id, event = event.type_name(), "Event suppressed");
            return;
        }
        self.bus.publish_with_source(event, self.source.clone());
    }

    pub fn lifecycle(&self, kind: LifecycleKind, reason: impl Into<String>) {
        self.emit(FleetEvent::Lifecycle {
            device_id: self.device_id.clone(),
            kind,
            reason: reason.into(),
            timestamp: now_millis(),
        });
    }
}

/// Connection state machine for one printer.
///
/// Only the edges allowed by [`ConnectionState::can_transition_to`] are
/// taken. Every transition publishes `ConnectionStateChanged` and wakes
/// `watch` subscribers.
pub struct ConnectionStateMachine {
    device_id: String,
    state: Mutex<ConnectionState>,
    tx: watch::Sender<ConnectionState>,
    emitter: EventEmitter,
}

impl ConnectionStateMachine {
    pub fn new(device_id: impl Into<String>, emitter: EventEmitter) -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            device_id: device_id.into(),
            state: Mutex::new(ConnectionState::Disconnected),
            tx,
            emitter,
        }
    }

    pub fn current(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Watch state changes.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Move to `next`. Fails if the edge is not allowed.
    pub fn transition(&self, next: ConnectionState) -> AdapterResult<ConnectionState> {
        let mut state = self.state.lock();
        self.apply(&mut state, next)
    }

    /// Move to `next` only when currently in `expected`.
    ///
    /// Returns whether the transition happened.
    pub fn transition_from(&self, expected: ConnectionState, next: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if *state != expected {
            return false;
        }
        self.apply(&mut state, next).is_ok()
    }

    // Emits while the lock is held so events leave in transition order
    fn apply(
        &self,
        state: &mut ConnectionState,
        next: ConnectionState,
    ) -> AdapterResult<ConnectionState> {
        let previous = *state;
        if !previous.can_transition_to(next) {
            return Err(AdapterError::Protocol(format!(
                "illegal connection state transition {} -> {}",
                previous, next
            )));
        }
        *state = next;
        self.tx.send_replace(next);
        debug!(device_id = %self.device_id, %previous, %next, "Connection state changed");
        self.emitter.emit(FleetEvent::ConnectionStateChanged {
            device_id: self.device_id.clone(),
            previous,
            state: next,
            timestamp: now_millis(),
        });
        Ok(previous)
    }

    /// Move to `next` if the edge is allowed; otherwise leave the state alone.
    pub fn try_transition(&self, next: ConnectionState) -> bool {
        match self.transition(next) {
            Ok(_) => true,
            Err(e) => {
                debug!(device_id = %self.device_id, "{}", e);
                false
            }
        }
    }
}

/// State shared by an adapter and its background tasks.
pub struct PrinterContext {
    pub device_id: String,
    pub protocol: PrinterProtocol,
    pub settings: SharedSettings,
    pub emitter: EventEmitter,
    pub state: ConnectionStateMachine,
    sub_state: Mutex<SubState>,
    login: RwLock<Option<LoginDto>>,
    last_status: Mutex<Option<PrinterStatus>>,
}

impl PrinterContext {
    pub fn new(
        device_id: impl Into<String>,
        protocol: PrinterProtocol,
        bus: SharedEventBus,
        settings: SharedSettings,
    ) -> Arc<Self> {
        let device_id = device_id.into();
        let emitter = EventEmitter::new(device_id.clone(), bus);
        Arc::new(Self {
            state: ConnectionStateMachine::new(device_id.clone(), emitter.clone()),
            device_id,
            protocol,
            settings,
            emitter,
            sub_state: Mutex::new(SubState::default()),
            login: RwLock::new(None),
            last_status: Mutex::new(None),
        })
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.current()
    }

    pub fn sub_state(&self) -> SubState {
        *self.sub_state.lock()
    }

    pub fn set_socket_state(&self, socket_state: SocketState) {
        self.update_sub_state(|s| {
            if s.socket_state == socket_state {
                return false;
            }
            s.socket_state = socket_state;
            s.socket_changed_at = now_millis();
            true
        });
    }

    pub fn set_api_state(&self, api_state: ApiState) {
        self.update_sub_state(|s| {
            if s.api_state == api_state {
                return false;
            }
            s.api_state = api_state;
            s.api_changed_at = now_millis();
            true
        });
    }

    /// Put socket and API state back to `Unopened` / `Unset`.
    pub fn reset_sub_state(&self) {
        self.update_sub_state(|s| {
            let fresh = SubState::default();
            let changed =
                s.socket_state != fresh.socket_state || s.api_state != fresh.api_state;
            *s = fresh;
            changed
        });
    }

    fn update_sub_state(&self, f: impl FnOnce(&mut SubState) -> bool) {
        let snapshot = {
            let mut sub = self.sub_state.lock();
            if !f(&mut sub) {
                return;
            }
            *sub
        };
        self.emitter.emit(FleetEvent::PrinterStateChanged {
            device_id: self.device_id.clone(),
            protocol: self.protocol,
            socket_state: snapshot.socket_state,
            api_state: snapshot.api_state,
            timestamp: now_millis(),
        });
    }

    pub fn store_login(&self, login: LoginDto) {
        *self.login.write() = Some(login);
    }

    /// Current credentials, or `NotConnected` if none were ever supplied.
    pub fn login(&self) -> AdapterResult<LoginDto> {
        self.login.read().clone().ok_or(AdapterError::NotConnected)
    }

    /// Publish a status update and remember it.
    pub fn publish_status(&self, status: PrinterStatus) {
        *self.last_status.lock() = Some(status.clone());
        self.emitter.emit(FleetEvent::CurrentStatus {
            device_id: self.device_id.clone(),
            status,
        });
    }

    /// Latest status published by this printer.
    pub fn last_status(&self) -> Option<PrinterStatus> {
        self.last_status.lock().clone()
    }

    pub fn clear_status(&self) {
        *self.last_status.lock() = None;
    }

    /// Fail unless the session is `Connected`.
    pub fn require_connected(&self) -> AdapterResult<()> {
        match self.connection_state() {
            ConnectionState::Connected => Ok(()),
            state => {
                warn!(device_id = %self.device_id, %state, "Operation requires a connected printer");
                Err(AdapterError::NotConnected)
            }
        }
    }
}
