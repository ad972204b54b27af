//! Protocol adapters and the factory that picks one per printer.

pub mod bambu;
pub mod ftp;
pub mod moonraker;
pub mod octoprint;
pub mod prusa_link;
pub mod rest;

pub use bambu::BambuAdapter;
pub use ftp::BambuFtp;
pub use moonraker::MoonrakerAdapter;
pub use octoprint::OctoprintAdapter;
pub use prusa_link::PrusaLinkAdapter;

use crate::adapter::{AdapterResult, PrinterAdapter};
use printfleet_core::{PrinterProtocol, PrinterRecord, SharedEventBus, SharedSettings};
use std::sync::Arc;

/// Shared handles every adapter receives.
#[derive(Clone)]
pub struct AdapterDeps {
    pub bus: SharedEventBus,
    pub settings: SharedSettings,
}

/// Create the adapter matching `record`'s protocol.
pub fn create_adapter(
    record: &PrinterRecord,
    deps: &AdapterDeps,
) -> AdapterResult<Arc<dyn PrinterAdapter>> {
    let id = record.id.clone();
    let bus = deps.bus.clone();
    let settings = deps.settings.clone();
    let adapter: Arc<dyn PrinterAdapter> = match record.protocol() {
        PrinterProtocol::Octoprint => Arc::new(OctoprintAdapter::new(id, bus, settings)?),
        PrinterProtocol::Moonraker => Arc::new(MoonrakerAdapter::new(id, bus, settings)?),
        PrinterProtocol::PrusaLink => Arc::new(PrusaLinkAdapter::new(id, bus, settings)?),
        PrinterProtocol::Bambu => Arc::new(BambuAdapter::new(id, bus, settings)?),
    };
    Ok(adapter)
}

/// Protocols currently enabled in settings.
pub fn available_protocols(settings: &SharedSettings) -> Vec<PrinterProtocol> {
    settings.read(|s| {
        PrinterProtocol::ALL
            .into_iter()
            .filter(|protocol| s.is_protocol_enabled(*protocol))
            .collect()
    })
}

/// Builds adapters for the registry.
pub trait AdapterFactory: Send + Sync {
    fn create(
        &self,
        record: &PrinterRecord,
        deps: &AdapterDeps,
    ) -> AdapterResult<Arc<dyn PrinterAdapter>>;
}

/// Factory backed by the real network adapters.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultAdapterFactory;

impl AdapterFactory for DefaultAdapterFactory {
    fn create(
        &self,
        record: &PrinterRecord,
        deps: &AdapterDeps,
    ) -> AdapterResult<Arc<dyn PrinterAdapter>> {
        create_adapter(record, deps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use printfleet_core::{EventBus, FleetSettings, LoginDto};

    fn deps(settings: FleetSettings) -> AdapterDeps {
        AdapterDeps {
            bus: Arc::new(EventBus::new()),
            settings: SharedSettings::new(settings),
        }
    }

    #[tokio::test]
    async fn test_factory_matches_protocol() {
        let deps = deps(FleetSettings::default());
        for protocol in PrinterProtocol::ALL {
            let record = PrinterRecord::new("p1", LoginDto::new(protocol, "192.168.1.10"));
            let adapter = create_adapter(&record, &deps).unwrap();
            assert_eq!(adapter.protocol(), protocol);
            assert_eq!(adapter.device_id(), "p1");
        }
    }

    #[test]
    fn test_available_protocols_follow_flags() {
        let settings = FleetSettings {
            bambu_enabled: false,
            ..FleetSettings::default()
        };
        let protocols = available_protocols(&SharedSettings::new(settings));
        assert_eq!(protocols.len(), 3);
        assert!(!protocols.contains(&PrinterProtocol::Bambu));
    }
}
