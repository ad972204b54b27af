//! Printer Connectivity Crate
//!
//! This crate keeps one live session per configured 3D printer and exposes
//! every printer through the same capability interface.
//!
//! ## Protocols
//!
//! | Protocol | Transport | Status |
//! |----------|-----------|--------|
//! | OctoPrint | REST + WebSocket push | pushed |
//! | Moonraker | JSON-RPC over WebSocket | pushed, merged |
//! | PrusaLink | HTTP digest | polled |
//! | Bambu Lab | MQTT + FTPS | pushed, merged |
//!
//! ## Architecture
//!
//! - **PrinterAdapter**: capability trait implemented once per protocol
//! - **TransportLink**: session driver with connection state machine,
//!   reconnection manager and heartbeat monitor
//! - **RequestCorrelator**: JSON-RPC request/response matching
//! - **PrinterRegistry**: one adapter per enabled printer
//! - **StatusSync**: batches live status into incremental diffs
//!
//! Events leave through the shared `EventBus` from `printfleet-core`.

pub mod adapter;
pub mod adapters;
pub mod context;
pub mod correlator;
pub mod digest;
pub mod heartbeat;
pub mod link;
pub mod poller;
pub mod reconnect;
pub mod registry;
pub mod sync;
pub mod tls;
pub mod transport;

// In-memory transports for connection tests
pub mod mock;

pub use adapter::{
    AdapterError, AdapterResult, Axis, FileEntry, FileUpload, JogCommand, PrinterAdapter,
    ReprintReadiness, ReprintState, UploadSource,
};
pub use adapters::{
    AdapterDeps, AdapterFactory, BambuAdapter, DefaultAdapterFactory, MoonrakerAdapter,
    OctoprintAdapter, PrusaLinkAdapter, available_protocols, create_adapter,
};
pub use context::{ConnectionStateMachine, EventEmitter, PrinterContext};
pub use correlator::RequestCorrelator;
pub use heartbeat::HeartbeatMonitor;
pub use link::{FrameHandler, LinkOptions, SessionHandle, TransportLink};
pub use reconnect::ReconnectionManager;
pub use registry::{DeviceConnection, PrinterRegistry, RegistryOutcome};
pub use sync::StatusSync;
pub use transport::{Transport, TransportConnector};
