//! Core types for PrintFleet.
//!
//! This crate defines the vocabulary shared by the connectivity layer and
//! its consumers: printer identity and credentials, connection states, the
//! normalized status payload, the fleet event model and the event bus that
//! carries it, the diff cache used for incremental sync, and runtime settings.

pub mod config;
pub mod diff_cache;
pub mod error;
pub mod event;
pub mod eventbus;
pub mod printer;
pub mod status;

pub use config::{FleetSettings, SharedSettings};
pub use diff_cache::{DiffCache, DiffSnapshot};
pub use error::{CoreError, Result};
pub use event::{EventMetadata, FleetEvent, LifecycleKind};
pub use eventbus::{
    DEFAULT_CHANNEL_CAPACITY, EventBus, EventBusReceiver, FilterBuilder, FilteredReceiver,
    SharedEventBus,
};
pub use printer::{
    ApiState, ConnectionState, LoginDto, PrinterProtocol, PrinterRecord, SocketState, SubState,
};
pub use status::{JobProgress, PrinterStatus, StatusFlags, TemperatureReading};

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::config::{FleetSettings, SharedSettings};
    pub use crate::error::{CoreError, Result};
    pub use crate::event::{EventMetadata, FleetEvent, LifecycleKind};
    pub use crate::eventbus::{EventBus, SharedEventBus};
    pub use crate::printer::{ConnectionState, LoginDto, PrinterProtocol, PrinterRecord};
    pub use crate::status::PrinterStatus;
}
