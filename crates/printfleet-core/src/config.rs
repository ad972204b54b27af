//! Runtime settings for the connectivity layer.
//!
//! Values come from defaults, then an optional `[settings]` table in the
//! fleet file, then `PRINTFLEET_*` environment variables. The resulting
//! `FleetSettings` is wrapped in a `SharedSettings` handle; adapters read it
//! on every use so changes apply without reconnecting.

use crate::error::{CoreError, Result};
use crate::printer::PrinterProtocol;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Hard cap applied to every correlated request, whatever the caller asks for.
pub const REQUEST_TIMEOUT_CEILING_MS: u64 = 3000;

/// Default values.
pub mod defaults {
    pub const POLL_INTERVAL_MS: u64 = 2000;
    pub const HEARTBEAT_INTERVAL_MS: u64 = 10_000;
    pub const HEARTBEAT_TIMEOUT_MS: u64 = 5000;
    pub const HANDSHAKE_TIMEOUT_MS: u64 = 5000;
    pub const RECONNECT_INTERVAL_MS: u64 = 5000;
    pub const REQUEST_TIMEOUT_MS: u64 = 3000;
    pub const CLOSE_TIMEOUT_MS: u64 = 2000;
    pub const FLUSH_INTERVAL_MS: u64 = 1000;
}

/// Environment variable names.
pub mod env_vars {
    pub const OCTOPRINT_ENABLED: &str = "PRINTFLEET_OCTOPRINT_ENABLED";
    pub const MOONRAKER_ENABLED: &str = "PRINTFLEET_MOONRAKER_ENABLED";
    pub const PRUSA_LINK_ENABLED: &str = "PRINTFLEET_PRUSA_LINK_ENABLED";
    pub const BAMBU_ENABLED: &str = "PRINTFLEET_BAMBU_ENABLED";
    pub const POLL_INTERVAL_MS: &str = "PRINTFLEET_POLL_INTERVAL_MS";
    pub const HEARTBEAT_INTERVAL_MS: &str = "PRINTFLEET_HEARTBEAT_INTERVAL_MS";
    pub const HEARTBEAT_TIMEOUT_MS: &str = "PRINTFLEET_HEARTBEAT_TIMEOUT_MS";
    pub const HANDSHAKE_TIMEOUT_MS: &str = "PRINTFLEET_HANDSHAKE_TIMEOUT_MS";
    pub const RECONNECT_INTERVAL_MS: &str = "PRINTFLEET_RECONNECT_INTERVAL_MS";
    pub const REQUEST_TIMEOUT_MS: &str = "PRINTFLEET_REQUEST_TIMEOUT_MS";
    pub const CLOSE_TIMEOUT_MS: &str = "PRINTFLEET_CLOSE_TIMEOUT_MS";
    pub const FLUSH_INTERVAL_MS: &str = "PRINTFLEET_FLUSH_INTERVAL_MS";
}

fn default_true() -> bool {
    true
}
fn default_poll_interval() -> u64 {
    defaults::POLL_INTERVAL_MS
}
fn default_heartbeat_interval() -> u64 {
    defaults::HEARTBEAT_INTERVAL_MS
}
fn default_heartbeat_timeout() -> u64 {
    defaults::HEARTBEAT_TIMEOUT_MS
}
fn default_handshake_timeout() -> u64 {
    defaults::HANDSHAKE_TIMEOUT_MS
}
fn default_reconnect_interval() -> u64 {
    defaults::RECONNECT_INTERVAL_MS
}
fn default_request_timeout() -> u64 {
    defaults::REQUEST_TIMEOUT_MS
}
fn default_close_timeout() -> u64 {
    defaults::CLOSE_TIMEOUT_MS
}
fn default_flush_interval() -> u64 {
    defaults::FLUSH_INTERVAL_MS
}

/// Fleet-wide connectivity settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FleetSettings {
    #[serde(default = "default_true")]
    pub octoprint_enabled: bool,
    #[serde(default = "default_true")]
    pub moonraker_enabled: bool,
    #[serde(default = "default_true")]
    pub prusa_link_enabled: bool,
    #[serde(default = "default_true")]
    pub bambu_enabled: bool,

    /// Status poll interval for polled protocols
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// How long a heartbeat probe may stay unanswered
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_ms: u64,
    /// Per-request timeout, capped at `REQUEST_TIMEOUT_CEILING_MS`
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Grace period for a graceful transport close
    #[serde(default = "default_close_timeout")]
    pub close_timeout_ms: u64,
    /// Interval between status sync flushes
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            octoprint_enabled: true,
            moonraker_enabled: true,
            prusa_link_enabled: true,
            bambu_enabled: true,
            poll_interval_ms: defaults::POLL_INTERVAL_MS,
            heartbeat_interval_ms: defaults::HEARTBEAT_INTERVAL_MS,
            heartbeat_timeout_ms: defaults::HEARTBEAT_TIMEOUT_MS,
            handshake_timeout_ms: defaults::HANDSHAKE_TIMEOUT_MS,
            reconnect_interval_ms: defaults::RECONNECT_INTERVAL_MS,
            request_timeout_ms: defaults::REQUEST_TIMEOUT_MS,
            close_timeout_ms: defaults::CLOSE_TIMEOUT_MS,
            flush_interval_ms: defaults::FLUSH_INTERVAL_MS,
        }
    }
}

impl FleetSettings {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut settings = Self::default();
        settings.apply_env()?;
        Ok(settings)
    }

    /// Override fields from `PRINTFLEET_*` variables that are set.
    ///
    /// A variable that is set but unparseable is an error rather than
    /// silently falling back to the default.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_with(|key| std::env::var(key).ok())
    }

    fn apply_with(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let flags: [(&str, &mut bool); 4] = [
            (env_vars::OCTOPRINT_ENABLED, &mut self.octoprint_enabled),
            (env_vars::MOONRAKER_ENABLED, &mut self.moonraker_enabled),
            (env_vars::PRUSA_LINK_ENABLED, &mut self.prusa_link_enabled),
            (env_vars::BAMBU_ENABLED, &mut self.bambu_enabled),
        ];
        for (key, slot) in flags {
            if let Some(raw) = lookup(key) {
                *slot = parse_bool(key, &raw)?;
            }
        }

        let durations: [(&str, &mut u64); 8] = [
            (env_vars::POLL_INTERVAL_MS, &mut self.poll_interval_ms),
            (env_vars::HEARTBEAT_INTERVAL_MS, &mut self.heartbeat_interval_ms),
            (env_vars::HEARTBEAT_TIMEOUT_MS, &mut self.heartbeat_timeout_ms),
            (env_vars::HANDSHAKE_TIMEOUT_MS, &mut self.handshake_timeout_ms),
            (env_vars::RECONNECT_INTERVAL_MS, &mut self.reconnect_interval_ms),
            (env_vars::REQUEST_TIMEOUT_MS, &mut self.request_timeout_ms),
            (env_vars::CLOSE_TIMEOUT_MS, &mut self.close_timeout_ms),
            (env_vars::FLUSH_INTERVAL_MS, &mut self.flush_interval_ms),
        ];
        for (key, slot) in durations {
            if let Some(raw) = lookup(key) {
                *slot = raw.trim().parse().map_err(|_| CoreError::InvalidSetting {
                    key: key.to_string(),
                    reason: format!("expected milliseconds, got {:?}", raw),
                })?;
            }
        }
        Ok(())
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("poll_interval_ms", self.poll_interval_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("heartbeat_timeout_ms", self.heartbeat_timeout_ms),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("reconnect_interval_ms", self.reconnect_interval_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("flush_interval_ms", self.flush_interval_ms),
        ];
        for (key, value) in non_zero {
            if value == 0 {
                return Err(CoreError::InvalidSetting {
                    key: key.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.heartbeat_timeout_ms >= self.heartbeat_interval_ms {
            return Err(CoreError::InvalidSetting {
                key: "heartbeat_timeout_ms".to_string(),
                reason: "must be shorter than heartbeat_interval_ms".to_string(),
            });
        }
        Ok(())
    }

    /// Whether adapters of this protocol may be created.
    pub fn is_protocol_enabled(&self, protocol: PrinterProtocol) -> bool {
        match protocol {
            PrinterProtocol::Octoprint => self.octoprint_enabled,
            PrinterProtocol::Moonraker => self.moonraker_enabled,
            PrinterProtocol::PrusaLink => self.prusa_link_enabled,
            PrinterProtocol::Bambu => self.bambu_enabled,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// Request timeout after the ceiling is applied.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.min(REQUEST_TIMEOUT_CEILING_MS))
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(CoreError::InvalidSetting {
            key: key.to_string(),
            reason: format!("expected a boolean, got {:?}", raw),
        }),
    }
}

/// Shared, runtime-overridable settings handle.
#[derive(Debug, Clone, Default)]
pub struct SharedSettings {
    inner: Arc<RwLock<FleetSettings>>,
}

impl SharedSettings {
    pub fn new(settings: FleetSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    /// Snapshot of the current settings.
    pub fn get(&self) -> FleetSettings {
        self.inner.read().clone()
    }

    /// Read one value without cloning the whole struct.
    pub fn read<R>(&self, f: impl FnOnce(&FleetSettings) -> R) -> R {
        f(&self.inner.read())
    }

    /// Mutate settings in place.
    pub fn update(&self, f: impl FnOnce(&mut FleetSettings)) {
        f(&mut self.inner.write());
    }

    /// Swap in a whole new settings value.
    pub fn replace(&self, settings: FleetSettings) {
        *self.inner.write() = settings;
    }
}
