//! Error type shared by the core crate.

use thiserror::Error;

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised while building core values (records, settings).
#[derive(Debug, Error)]
pub enum CoreError {
    /// A printer record or login is missing something its protocol needs
    #[error("Invalid login for {protocol}: {reason}")]
    InvalidLogin { protocol: String, reason: String },

    /// A setting could not be parsed or is out of range
    #[error("Invalid setting {key}: {reason}")]
    InvalidSetting { key: String, reason: String },

    /// Unknown protocol identifier
    #[error("Unknown printer protocol: {0}")]
    UnknownProtocol(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
