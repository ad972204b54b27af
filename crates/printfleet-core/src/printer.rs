//! Printer identity, credentials and connection states.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The closed set of device protocols the fleet can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrinterProtocol {
    /// REST + WebSocket (OctoPrint)
    Octoprint,
    /// JSON-RPC over WebSocket (Moonraker / Klipper)
    Moonraker,
    /// HTTP with digest authentication, polled (PrusaLink)
    #[serde(rename = "prusaLink", alias = "prusalink")]
    PrusaLink,
    /// MQTT + FTPS (Bambu Lab LAN mode)
    Bambu,
}

impl PrinterProtocol {
    /// All protocol variants.
    pub const ALL: [PrinterProtocol; 4] = [
        PrinterProtocol::Octoprint,
        PrinterProtocol::Moonraker,
        PrinterProtocol::PrusaLink,
        PrinterProtocol::Bambu,
    ];

    /// Stable identifier used in events and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Octoprint => "octoprint",
            Self::Moonraker => "moonraker",
            Self::PrusaLink => "prusaLink",
            Self::Bambu => "bambu",
        }
    }

    /// Whether the protocol keeps a persistent transport open.
    pub fn is_stateful(&self) -> bool {
        !matches!(self, Self::PrusaLink)
    }
}

impl fmt::Display for PrinterProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrinterProtocol {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "octoprint" => Ok(Self::Octoprint),
            "moonraker" | "klipper" => Ok(Self::Moonraker),
            "prusalink" => Ok(Self::PrusaLink),
            "bambu" => Ok(Self::Bambu),
            other => Err(CoreError::UnknownProtocol(other.to_string())),
        }
    }
}

/// Connection state of a single device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is an allowed edge.
    ///
    /// Same-state moves are never allowed.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Reconnecting)
                | (Connecting, Disconnected)
                | (Connected, Reconnecting)
                | (Connected, Disconnected)
                | (Reconnecting, Connected)
                | (Reconnecting, Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Transport-level sub-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketState {
    #[default]
    Unopened,
    Opening,
    Authenticating,
    Authenticated,
    Opened,
    Aborted,
    Error,
    Closed,
}

/// Whether the device API is actually answering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApiState {
    #[default]
    Unset,
    NoResponse,
    AuthFail,
    Responding,
    Error,
}

/// Socket and API sub-state with the time each last changed (unix millis).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubState {
    pub socket_state: SocketState,
    pub socket_changed_at: i64,
    pub api_state: ApiState,
    pub api_changed_at: i64,
}

impl Default for SubState {
    fn default() -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            socket_state: SocketState::Unopened,
            socket_changed_at: now,
            api_state: ApiState::Unset,
            api_changed_at: now,
        }
    }
}

/// Credentials and address for one printer.
///
/// Owned by the configuration side; adapters receive it by value on every
/// connect so rotated credentials always win.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginDto {
    pub protocol: PrinterProtocol,
    /// Base URL (`http://host:port`) or, for Bambu, the printer host
    pub printer_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_code: Option<String>,
}

impl LoginDto {
    /// Create a login with only an address set.
    pub fn new(protocol: PrinterProtocol, printer_url: impl Into<String>) -> Self {
        Self {
            protocol,
            printer_url: printer_url.into(),
            api_key: None,
            username: None,
            password: None,
            serial: None,
            access_code: None,
        }
    }

    /// Set the API key.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set username and password.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set the device serial and LAN access code.
    pub fn with_device_secret(
        mut self,
        serial: impl Into<String>,
        access_code: impl Into<String>,
    ) -> Self {
        self.serial = Some(serial.into());
        self.access_code = Some(access_code.into());
        self
    }

    /// Check that every credential the protocol mandates is present.
    pub fn validate(&self) -> Result<()> {
        if self.printer_url.trim().is_empty() {
            return Err(self.invalid("printer address is empty"));
        }
        match self.protocol {
            PrinterProtocol::Octoprint => {
                if is_blank(&self.api_key) {
                    return Err(self.invalid("api key is required"));
                }
            }
            PrinterProtocol::Moonraker => {}
            PrinterProtocol::PrusaLink => {
                if is_blank(&self.username) || is_blank(&self.password) {
                    return Err(self.invalid("username and password are required"));
                }
            }
            PrinterProtocol::Bambu => {
                if is_blank(&self.serial) || is_blank(&self.access_code) {
                    return Err(self.invalid("serial and access code are required"));
                }
            }
        }
        Ok(())
    }

    fn invalid(&self, reason: &str) -> CoreError {
        CoreError::InvalidLogin {
            protocol: self.protocol.to_string(),
            reason: reason.to_string(),
        }
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map(str::trim).unwrap_or_default().is_empty()
}

fn redact(value: &Option<String>) -> Option<&'static str> {
    value.as_ref().map(|_| "***")
}

impl fmt::Debug for LoginDto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginDto")
            .field("protocol", &self.protocol)
            .field("printer_url", &self.printer_url)
            .field("api_key", &redact(&self.api_key))
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .field("serial", &self.serial)
            .field("access_code", &redact(&self.access_code))
            .finish()
    }
}

/// The slice of a configured printer the connectivity layer needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrinterRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub login: LoginDto,
}

fn default_enabled() -> bool {
    true
}

impl PrinterRecord {
    /// Create an enabled record.
    pub fn new(id: impl Into<String>, login: LoginDto) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            enabled: true,
            login,
        }
    }

    /// Protocol of this printer.
    pub fn protocol(&self) -> PrinterProtocol {
        self.login.protocol
    }
}
