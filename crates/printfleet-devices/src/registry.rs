//! Printer registry.
//!
//! Keeps exactly one adapter per enabled printer and applies configuration
//! changes to it. Operations on the same printer are serialized; different
//! printers proceed in parallel.

use crate::adapter::{AdapterResult, PrinterAdapter};
use crate::adapters::{AdapterDeps, AdapterFactory, DefaultAdapterFactory};
use futures::future::join_all;
use printfleet_core::{
    ConnectionState, FleetEvent, PrinterProtocol, PrinterRecord, SharedEventBus,
    SharedSettings, SubState,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Connection summary for one printer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConnection {
    pub device_id: String,
    pub name: String,
    pub protocol: PrinterProtocol,
    pub state: ConnectionState,
    pub sub_state: SubState,
}

struct RegistryEntry {
    record: PrinterRecord,
    adapter: Arc<dyn PrinterAdapter>,
}

/// What a created/updated notification led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryOutcome {
    /// A new adapter was created and connected
    Created,
    /// The existing adapter took the new record
    Updated,
    /// The adapter was replaced because the protocol changed
    Replaced,
    /// The printer is disabled (or its protocol is) and has no adapter
    Skipped,
}

/// Owns every printer adapter.
pub struct PrinterRegistry {
    deps: AdapterDeps,
    factory: Arc<dyn AdapterFactory>,
    entries: RwLock<HashMap<String, RegistryEntry>>,
    device_locks: parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PrinterRegistry {
    pub fn new(bus: SharedEventBus, settings: SharedSettings) -> Self {
        Self::with_factory(bus, settings, Arc::new(DefaultAdapterFactory))
    }

    pub fn with_factory(
        bus: SharedEventBus,
        settings: SharedSettings,
        factory: Arc<dyn AdapterFactory>,
    ) -> Self {
        Self {
            deps: AdapterDeps { bus, settings },
            factory,
            entries: RwLock::new(HashMap::new()),
            device_locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &SharedSettings {
        &self.deps.settings
    }

    fn device_lock(&self, device_id: &str) -> Arc<Mutex<()>> {
        self.device_locks
            .lock()
            .entry(device_id.to_string())
            .or_default()
            .clone()
    }

    /// Forget the lock of a printer that no longer has an adapter, unless
    /// another call is already queued on it.
    fn release_lock(&self, device_id: &str, lock: &Arc<Mutex<()>>) {
        let mut locks = self.device_locks.lock();
        // The map and the caller
        if Arc::strong_count(lock) == 2 {
            locks.remove(device_id);
        }
    }

    fn should_run(&self, record: &PrinterRecord) -> bool {
        record.enabled
            && self
                .deps
                .settings
                .read(|s| s.is_protocol_enabled(record.protocol()))
    }

    /// A printer was added to the configuration.
    pub async fn on_created(&self, record: PrinterRecord) -> AdapterResult<RegistryOutcome> {
        self.apply(record).await
    }

    /// A printer's configuration changed.
    pub async fn on_updated(&self, record: PrinterRecord) -> AdapterResult<RegistryOutcome> {
        self.apply(record).await
    }

    /// A printer was removed from the configuration.
    pub async fn on_deleted(&self, device_id: &str) -> AdapterResult<()> {
        let lock = self.device_lock(device_id);
        let result = {
            let _guard = lock.lock().await;
            self.teardown(device_id, true).await
        };
        self.release_lock(device_id, &lock);
        result
    }

    /// Apply many created notifications concurrently.
    pub async fn on_batch_created(
        &self,
        records: Vec<PrinterRecord>,
    ) -> Vec<(String, AdapterResult<RegistryOutcome>)> {
        let work = records.into_iter().map(|record| async move {
            let id = record.id.clone();
            (id, self.on_created(record).await)
        });
        join_all(work).await
    }

    /// Bring the registry in line with a full fleet listing.
    ///
    /// Printers missing from `records` are torn down.
    pub async fn load_fleet(
        &self,
        records: Vec<PrinterRecord>,
    ) -> Vec<(String, AdapterResult<RegistryOutcome>)> {
        let wanted: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
        for id in self.list_ids().await {
            if !wanted.contains(&id) {
                if let Err(e) = self.on_deleted(&id).await {
                    warn!(device_id = %id, "Failed to remove printer: {}", e);
                }
            }
        }
        self.on_batch_created(records).await
    }

    async fn apply(&self, record: PrinterRecord) -> AdapterResult<RegistryOutcome> {
        let id = record.id.clone();
        let lock = self.device_lock(&id);
        let result = {
            let _guard = lock.lock().await;
            self.apply_locked(record).await
        };
        if !self.entries.read().await.contains_key(&id) {
            self.release_lock(&id, &lock);
        }
        result
    }

    async fn apply_locked(&self, record: PrinterRecord) -> AdapterResult<RegistryOutcome> {
        if !self.should_run(&record) {
            debug!(device_id = %record.id, protocol = %record.protocol(), "Printer disabled");
            self.teardown(&record.id, true).await?;
            return Ok(RegistryOutcome::Skipped);
        }

        let existing = self
            .entries
            .read()
            .await
            .get(&record.id)
            .map(|entry| entry.adapter.clone());

        match existing {
            Some(adapter) if adapter.protocol() == record.protocol() => {
                self.update_existing(adapter, record).await?;
                Ok(RegistryOutcome::Updated)
            }
            Some(_) => {
                info!(device_id = %record.id, protocol = %record.protocol(), "Protocol changed, replacing adapter");
                self.teardown(&record.id, false).await?;
                self.create(record).await?;
                Ok(RegistryOutcome::Replaced)
            }
            None => {
                self.create(record).await?;
                Ok(RegistryOutcome::Created)
            }
        }
    }

    async fn create(&self, record: PrinterRecord) -> AdapterResult<()> {
        let adapter = self.factory.create(&record, &self.deps)?;
        let login = record.login.clone();
        let id = record.id.clone();
        info!(device_id = %id, protocol = %record.protocol(), "Adding printer");

        self.entries.write().await.insert(
            id.clone(),
            RegistryEntry {
                record,
                adapter: adapter.clone(),
            },
        );

        if let Err(e) = adapter.connect(login).await {
            warn!(device_id = %id, "Connect rejected: {}", e);
            adapter.allow_events(false);
            self.entries.write().await.remove(&id);
            return Err(e);
        }
        Ok(())
    }

    async fn update_existing(
        &self,
        adapter: Arc<dyn PrinterAdapter>,
        record: PrinterRecord,
    ) -> AdapterResult<()> {
        let login = record.login.clone();
        info!(device_id = %record.id, "Updating printer");
        adapter.reset_sub_state();
        if adapter.connection_state() == ConnectionState::Disconnected {
            adapter.connect(login).await?;
        } else {
            adapter.update_login(login).await?;
        }
        if let Some(entry) = self.entries.write().await.get_mut(&record.id) {
            entry.record = record;
        }
        Ok(())
    }

    /// Silence, disconnect and drop the adapter, in that order.
    async fn teardown(&self, device_id: &str, announce: bool) -> AdapterResult<()> {
        let adapter = self
            .entries
            .read()
            .await
            .get(device_id)
            .map(|entry| entry.adapter.clone());
        let Some(adapter) = adapter else {
            return Ok(());
        };

        adapter.allow_events(false);
        let result = adapter.disconnect().await;
        if let Err(e) = &result {
            warn!(device_id, "Disconnect during teardown failed: {}", e);
        }
        self.entries.write().await.remove(device_id);
        info!(device_id, "Printer removed");

        if announce {
            self.deps.bus.publish_with_source(
                FleetEvent::PrinterRemoved {
                    device_id: device_id.to_string(),
                    timestamp: chrono::Utc::now().timestamp_millis(),
                },
                "registry",
            );
        }
        result
    }

    pub async fn get(&self, device_id: &str) -> Option<Arc<dyn PrinterAdapter>> {
        self.entries
            .read()
            .await
            .get(device_id)
            .map(|entry| entry.adapter.clone())
    }

    pub async fn record(&self, device_id: &str) -> Option<PrinterRecord> {
        self.entries
            .read()
            .await
            .get(device_id)
            .map(|entry| entry.record.clone())
    }

    /// Ids of all managed printers, sorted.
    pub async fn list_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Connection state of every printer, sorted by id.
    pub async fn connection_overview(&self) -> Vec<DeviceConnection> {
        let mut overview: Vec<DeviceConnection> = self
            .entries
            .read()
            .await
            .iter()
            .map(|(id, entry)| DeviceConnection {
                device_id: id.clone(),
                name: entry.record.name.clone(),
                protocol: entry.adapter.protocol(),
                state: entry.adapter.connection_state(),
                sub_state: entry.adapter.sub_state(),
            })
            .collect();
        overview.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        overview
    }

    /// Tear down every adapter.
    pub async fn shutdown(&self) {
        let ids = self.list_ids().await;
        info!(count = ids.len(), "Shutting down printer registry");
        for id in ids {
            let lock = self.device_lock(&id);
            {
                let _guard = lock.lock().await;
                if let Err(e) = self.teardown(&id, false).await {
                    warn!(device_id = %id, "Shutdown teardown failed: {}", e);
                }
            }
            self.release_lock(&id, &lock);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use printfleet_core::{EventBus, FleetSettings, LoginDto};

    fn record(id: &str, protocol: PrinterProtocol) -> PrinterRecord {
        let login = match protocol {
            PrinterProtocol::Octoprint => LoginDto::new(protocol, "127.0.0.1:9").with_api_key("k"),
            PrinterProtocol::PrusaLink => {
                LoginDto::new(protocol, "127.0.0.1:9").with_credentials("maker", "pw")
            }
            PrinterProtocol::Bambu => {
                LoginDto::new(protocol, "127.0.0.1").with_device_secret("S1", "0000")
            }
            PrinterProtocol::Moonraker => LoginDto::new(protocol, "127.0.0.1:9"),
        };
        PrinterRecord::new(id, login)
    }

    #[tokio::test]
    async fn test_disabled_protocol_is_skipped() {
        let settings = SharedSettings::new(FleetSettings {
            octoprint_enabled: false,
            ..FleetSettings::default()
        });
        let registry = PrinterRegistry::new(Arc::new(EventBus::new()), settings);
        let outcome = registry
            .on_created(record("op1", PrinterProtocol::Octoprint))
            .await
            .unwrap();
        assert_eq!(outcome, RegistryOutcome::Skipped);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_invalid_login_is_not_kept() {
        let registry =
            PrinterRegistry::new(Arc::new(EventBus::new()), SharedSettings::default());
        let mut bad = record("op1", PrinterProtocol::Octoprint);
        bad.login.api_key = None;
        assert!(registry.on_created(bad).await.is_err());
        assert!(registry.get("op1").await.is_none());
    }

    #[tokio::test]
    async fn test_delete_unknown_is_noop() {
        let registry =
            PrinterRegistry::new(Arc::new(EventBus::new()), SharedSettings::default());
        assert!(registry.on_deleted("missing").await.is_ok());
        assert!(registry.device_locks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_locks_do_not_outlive_printers() {
        let registry =
            PrinterRegistry::new(Arc::new(EventBus::new()), SharedSettings::default());
        for i in 0..5 {
            let id = format!("m{}", i);
            registry
                .on_created(record(&id, PrinterProtocol::Moonraker))
                .await
                .unwrap();
        }
        assert_eq!(registry.device_locks.lock().len(), 5);

        registry.on_deleted("m0").await.unwrap();
        assert_eq!(registry.device_locks.lock().len(), 4);
        assert!(!registry.device_locks.lock().contains_key("m0"));

        // Disabling drops the adapter and its lock too
        let mut disabled = record("m1", PrinterProtocol::Moonraker);
        disabled.enabled = false;
        registry.on_updated(disabled).await.unwrap();
        assert_eq!(registry.device_locks.lock().len(), 3);

        registry.shutdown().await;
        assert!(registry.device_locks.lock().is_empty());
    }
}
