//! Incremental status sync.
//!
//! Collects `CurrentStatus` updates in a [`DiffCache`] and periodically
//! publishes what changed as one `StatusSync` event. Removed printers are
//! reported as deleted keys.

use parking_lot::Mutex;
use printfleet_core::{DiffCache, FleetEvent, PrinterStatus, SharedEventBus, SharedSettings};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace};

/// Batches live status into periodic diffs.
pub struct StatusSync {
    bus: SharedEventBus,
    settings: SharedSettings,
    cache: Arc<DiffCache<PrinterStatus>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StatusSync {
    pub fn new(bus: SharedEventBus, settings: SharedSettings) -> Self {
        Self {
            bus,
            settings,
            cache: Arc::new(DiffCache::new()),
            task: Mutex::new(None),
        }
    }

    /// Latest status of every printer seen so far.
    pub fn cache(&self) -> &Arc<DiffCache<PrinterStatus>> {
        &self.cache
    }

    /// Publish pending changes now. Returns whether anything was sent.
    pub fn flush(&self) -> bool {
        flush(&self.cache, &self.bus)
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Subscribe and start the flush loop. No-op if already running.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        // Subscribe before spawning so nothing published after `start` is lost
        let mut rx = self.bus.filter().custom(|event: &FleetEvent| {
            matches!(
                event,
                FleetEvent::CurrentStatus { .. } | FleetEvent::PrinterRemoved { .. }
            )
        });
        let cache = self.cache.clone();
        let bus = self.bus.clone();
        let settings = self.settings.clone();

        *task = Some(tokio::spawn(async move {
            info!("Status sync started");
            let mut next_flush = Instant::now() + settings.read(|s| s.flush_interval());
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some((FleetEvent::CurrentStatus { device_id, status }, _)) => {
                            trace!(device_id = %device_id, "Status cached");
                            cache.set_value(device_id, status);
                        }
                        Some((FleetEvent::PrinterRemoved { device_id, .. }, _)) => {
                            cache.delete_value(&device_id);
                        }
                        Some(_) => {}
                        None => break,
                    },
                    _ = tokio::time::sleep_until(next_flush) => {
                        flush(&cache, &bus);
                        next_flush = Instant::now() + settings.read(|s| s.flush_interval());
                    }
                }
            }
            debug!("Status sync stopped: event bus closed");
        }));
    }

    /// Stop the flush loop, publishing whatever is still pending.
    pub async fn stop(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
            self.flush();
        }
    }
}

fn flush(cache: &DiffCache<PrinterStatus>, bus: &SharedEventBus) -> bool {
    let snapshot = cache.flush();
    if snapshot.is_empty() {
        return false;
    }
    debug!(
        updated = snapshot.updated_keys.len(),
        deleted = snapshot.deleted_keys.len(),
        "Publishing status diff"
    );
    bus.publish_with_source(
        FleetEvent::StatusSync {
            updated: snapshot.updated_values,
            deleted: snapshot.deleted_keys.into_iter().collect(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        },
        "status-sync",
    );
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use printfleet_core::EventBus;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_flushes_diff_on_interval() {
        let bus = Arc::new(EventBus::new());
        let sync = StatusSync::new(bus.clone(), SharedSettings::default());
        let mut out = bus.filter().event_type("StatusSync");
        sync.start();

        bus.publish(FleetEvent::CurrentStatus {
            device_id: "p1".into(),
            status: PrinterStatus::new("Printing"),
        });
        bus.publish(FleetEvent::CurrentStatus {
            device_id: "p2".into(),
            status: PrinterStatus::new("Operational"),
        });
        bus.publish(FleetEvent::PrinterRemoved {
            device_id: "p2".into(),
            timestamp: 0,
        });

        let (event, meta) = tokio::time::timeout(Duration::from_secs(5), out.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta.source, "status-sync");
        match event {
            FleetEvent::StatusSync { updated, deleted, .. } => {
                assert_eq!(updated.len(), 1);
                assert_eq!(updated["p1"].state_text, "Printing");
                assert_eq!(deleted, vec!["p2".to_string()]);
            }
            other => panic!("unexpected event {:?}", other),
        }

        // Nothing changed since: the next interval publishes nothing
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(out.try_recv().is_none());
        assert_eq!(sync.cache().len(), 1);

        sync.stop().await;
        assert!(!sync.is_running());
    }

    #[test]
    fn test_manual_flush_of_empty_cache() {
        let sync = StatusSync::new(Arc::new(EventBus::new()), SharedSettings::default());
        assert!(!sync.flush());
    }
}
