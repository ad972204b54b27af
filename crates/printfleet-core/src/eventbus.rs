//! Fleet event bus.
//!
//! Adapters publish lifecycle, state and status events; the sync service,
//! the CLI logger and any gateway subscribe. A subscription may be narrowed
//! by event name, by device id, or both.
//!
//! Delivery is a tokio broadcast channel: every subscriber sees events from
//! one publisher in publish order. A subscriber that falls more than the
//! channel capacity behind skips the oldest events instead of failing.

use crate::event::{EventMetadata, FleetEvent};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

/// Events buffered per subscriber before the oldest are skipped.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

type Envelope = (FleetEvent, EventMetadata);

/// Shared event bus handle.
pub type SharedEventBus = Arc<EventBus>;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Envelope>,
    name: String,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            tx: broadcast::channel(capacity).0,
            name: "fleet".to_string(),
        }
    }

    /// Named bus; the name only shows up in logs.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::new()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish from the generic `system` source.
    ///
    /// Returns whether anybody was listening.
    pub fn publish(&self, event: FleetEvent) -> bool {
        self.publish_with_source(event, "system")
    }

    pub fn publish_with_source(&self, event: FleetEvent, source: impl Into<String>) -> bool {
        let metadata = EventMetadata::new(source);
        self.tx.send((event, metadata)).is_ok()
    }

    /// Every event, from now on.
    pub fn subscribe(&self) -> EventBusReceiver {
        EventBusReceiver {
            rx: self.tx.subscribe(),
        }
    }

    /// Narrowed subscriptions.
    pub fn filter(&self) -> FilterBuilder {
        FilterBuilder {
            tx: self.tx.clone(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

async fn recv_matching(
    rx: &mut broadcast::Receiver<Envelope>,
    accept: impl Fn(&FleetEvent) -> bool,
) -> Option<Envelope> {
    loop {
        match rx.recv().await {
            Ok(envelope) if accept(&envelope.0) => return Some(envelope),
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event subscriber lagged behind");
            }
            Err(RecvError::Closed) => return None,
        }
    }
}

fn try_recv_matching(
    rx: &mut broadcast::Receiver<Envelope>,
    accept: impl Fn(&FleetEvent) -> bool,
) -> Option<Envelope> {
    loop {
        match rx.try_recv() {
            Ok(envelope) if accept(&envelope.0) => return Some(envelope),
            Ok(_) | Err(TryRecvError::Lagged(_)) => {}
            Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
        }
    }
}

/// Unfiltered subscription.
pub struct EventBusReceiver {
    rx: broadcast::Receiver<Envelope>,
}

impl EventBusReceiver {
    /// Next event, or `None` once every publisher is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        recv_matching(&mut self.rx, |_| true).await
    }

    /// Next already-buffered event, if any.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        try_recv_matching(&mut self.rx, |_| true)
    }
}

/// Subscription that only yields events accepted by `F`.
pub struct FilteredReceiver<F>
where
    F: Fn(&FleetEvent) -> bool + Send,
{
    rx: broadcast::Receiver<Envelope>,
    accept: F,
}

impl<F> FilteredReceiver<F>
where
    F: Fn(&FleetEvent) -> bool + Send,
{
    pub async fn recv(&mut self) -> Option<Envelope> {
        recv_matching(&mut self.rx, &self.accept).await
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        try_recv_matching(&mut self.rx, &self.accept)
    }
}

/// Builds [`FilteredReceiver`]s; see [`EventBus::filter`].
pub struct FilterBuilder {
    tx: broadcast::Sender<Envelope>,
}

impl FilterBuilder {
    fn with<F>(&self, accept: F) -> FilteredReceiver<F>
    where
        F: Fn(&FleetEvent) -> bool + Send,
    {
        FilteredReceiver {
            rx: self.tx.subscribe(),
            accept,
        }
    }

    /// Heartbeat, close and error notifications only.
    pub fn lifecycle_events(&self) -> FilteredReceiver<fn(&FleetEvent) -> bool> {
        self.with(FleetEvent::is_lifecycle_event as fn(&FleetEvent) -> bool)
    }

    /// Connection and sub-state changes only.
    pub fn state_events(&self) -> FilteredReceiver<fn(&FleetEvent) -> bool> {
        self.with(FleetEvent::is_state_event as fn(&FleetEvent) -> bool)
    }

    /// Everything concerning one printer.
    pub fn device(
        &self,
        device_id: impl Into<String>,
    ) -> FilteredReceiver<impl Fn(&FleetEvent) -> bool + Send + 'static> {
        let device_id = device_id.into();
        self.with(move |event: &FleetEvent| event.device_id() == Some(device_id.as_str()))
    }

    /// One event name (see [`FleetEvent::type_name`]) across the fleet.
    pub fn event_type(
        &self,
        type_name: &'static str,
    ) -> FilteredReceiver<impl Fn(&FleetEvent) -> bool + Send + 'static> {
        self.with(move |event: &FleetEvent| event.type_name() == type_name)
    }

    /// One event name for one printer.
    pub fn device_event(
        &self,
        device_id: impl Into<String>,
        type_name: &'static str,
    ) -> FilteredReceiver<impl Fn(&FleetEvent) -> bool + Send + 'static> {
        let device_id = device_id.into();
        self.with(move |event: &FleetEvent| {
            event.type_name() == type_name && event.device_id() == Some(device_id.as_str())
        })
    }

    pub fn custom<F>(&self, accept: F) -> FilteredReceiver<F>
    where
        F: Fn(&FleetEvent) -> bool + Send + 'static,
    {
        self.with(accept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::printer::ConnectionState;

    fn connecting(device_id: &str) -> FleetEvent {
        FleetEvent::ConnectionStateChanged {
            device_id: device_id.to_string(),
            previous: ConnectionState::Disconnected,
            state: ConnectionState::Connecting,
            timestamp: 0,
        }
    }

    fn removed(device_id: &str, timestamp: i64) -> FleetEvent {
        FleetEvent::PrinterRemoved {
            device_id: device_id.to_string(),
            timestamp,
        }
    }

    #[tokio::test]
    async fn test_default_source_is_system() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        assert!(bus.publish(connecting("p1")));

        let (event, meta) = rx.recv().await.unwrap();
        assert_eq!(event.type_name(), "ConnectionStateChanged");
        assert_eq!(meta.source, "system");
    }

    #[test]
    fn test_nobody_listening() {
        let bus = EventBus::with_name("idle");
        assert_eq!(bus.name(), "idle");
        assert!(!bus.publish(connecting("p1")));
    }

    #[tokio::test]
    async fn test_device_filter() {
        let bus = EventBus::new();
        let mut rx = bus.filter().device("p2");

        bus.publish(connecting("p1"));
        bus.publish(connecting("p2"));

        let (event, _) = rx.recv().await.unwrap();
        assert_eq!(event.device_id(), Some("p2"));
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_device_event_filter() {
        let bus = EventBus::new();
        let mut rx = bus.filter().device_event("p1", "PrinterRemoved");

        bus.publish(removed("p2", 1));
        bus.publish(connecting("p1"));
        bus.publish(removed("p1", 5));

        match rx.recv().await.unwrap().0 {
            FleetEvent::PrinterRemoved { device_id, timestamp } => {
                assert_eq!(device_id, "p1");
                assert_eq!(timestamp, 5);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_state_filter_skips_status() {
        let bus = EventBus::new();
        let mut rx = bus.filter().state_events();

        bus.publish(removed("p1", 0));
        bus.publish(connecting("p1"));

        assert_eq!(rx.try_recv().unwrap().0, connecting("p1"));
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_publish_order_is_kept() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        for i in 0..10 {
            bus.publish(removed("p1", i));
        }
        for i in 0..10 {
            assert_eq!(rx.recv().await.unwrap().0, removed("p1", i));
        }
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_oldest() {
        let bus = EventBus::with_capacity(2);
        let mut rx = bus.subscribe();
        for i in 0..5 {
            bus.publish(removed("p1", i));
        }
        assert_eq!(rx.recv().await.unwrap().0, removed("p1", 3));
        assert_eq!(rx.try_recv().unwrap().0, removed("p1", 4));
    }
}
