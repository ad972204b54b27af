//! Printer adapter interface.
//!
//! Every supported protocol implements [`PrinterAdapter`], one instance per
//! configured printer. The registry only talks to adapters through this
//! trait; protocol differences stay behind it.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use printfleet_core::{ApiState, ConnectionState, CoreError, LoginDto, PrinterProtocol, SubState};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for adapter operations.
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Error type for printer adapter operations.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Missing credential, unparseable address or similar
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// `connect` called while a session already exists
    #[error("Connection already exists (state: {0})")]
    AlreadyConnected(ConnectionState),

    /// Operation requires a live session
    #[error("Printer is not connected")]
    NotConnected,

    /// Transport could not be opened or failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// Handshake did not finish in time
    #[error("Handshake timeout after {0}ms")]
    HandshakeTimeout(u64),

    /// Session was closed while the operation was pending
    #[error("Connection closed: {0}")]
    Closed(String),

    /// Correlated request was not answered in time
    #[error("Request timeout after {0}ms")]
    RequestTimeout(u64),

    /// The device answered with an error or an unexpected payload
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The protocol has no equivalent for this operation
    #[error("Operation not implemented: {0}")]
    NotImplemented(&'static str),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error
    #[error("Adapter error: {0}")]
    Other(#[from] anyhow::Error),
}

impl AdapterError {
    /// Whether the error comes from a session being torn down.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }

    pub fn is_not_implemented(&self) -> bool {
        matches!(self, Self::NotImplemented(_))
    }

    /// Whether the device rejected the credentials (HTTP 401/403).
    pub fn is_auth_failure(&self) -> bool {
        match self {
            Self::Http(e) => matches!(
                e.status(),
                Some(reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN)
            ),
            _ => false,
        }
    }

    /// Sub-state the API should report after this error.
    pub fn api_state(&self) -> ApiState {
        if self.is_auth_failure() {
            ApiState::AuthFail
        } else {
            ApiState::NoResponse
        }
    }

    /// Whether retrying the same call later could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_)
            | Self::HandshakeTimeout(_)
            | Self::RequestTimeout(_)
            | Self::NotConnected
            | Self::Io(_) => true,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

impl From<CoreError> for AdapterError {
    fn from(err: CoreError) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl From<serde_json::Error> for AdapterError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("invalid JSON: {}", err))
    }
}

/// A file stored on the printer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the printer's storage root
    pub path: String,
    pub size: Option<u64>,
    /// Modification time, unix seconds
    pub date: Option<i64>,
}

/// Upload payload.
pub enum UploadSource {
    /// Whole file already in memory
    Buffer(Bytes),
    /// Streamed body with a known length
    Stream {
        stream: BoxStream<'static, std::io::Result<Bytes>>,
        length: u64,
    },
}

impl UploadSource {
    /// Byte length of the payload.
    pub fn len(&self) -> u64 {
        match self {
            Self::Buffer(bytes) => bytes.len() as u64,
            Self::Stream { length, .. } => *length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Collect the payload into memory.
    ///
    /// Used by transports that cannot stream (FTP runs on a blocking thread).
    pub async fn into_bytes(self) -> AdapterResult<Bytes> {
        match self {
            Self::Buffer(bytes) => Ok(bytes),
            Self::Stream { mut stream, length } => {
                use futures::StreamExt;
                let mut buf = Vec::with_capacity(length as usize);
                while let Some(chunk) = stream.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(Bytes::from(buf))
            }
        }
    }

    /// Turn the payload into a streaming HTTP body.
    pub fn into_body(self) -> reqwest::Body {
        match self {
            Self::Buffer(bytes) => reqwest::Body::from(bytes),
            Self::Stream { stream, .. } => reqwest::Body::wrap_stream(stream),
        }
    }
}

impl fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffer(bytes) => write!(f, "Buffer({} bytes)", bytes.len()),
            Self::Stream { length, .. } => write!(f, "Stream({} bytes)", length),
        }
    }
}

/// File upload request.
#[derive(Debug)]
pub struct FileUpload {
    pub file_name: String,
    pub source: UploadSource,
    /// Start printing once the upload finishes
    pub start_print: bool,
}

impl FileUpload {
    pub fn from_bytes(file_name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            file_name: file_name.into(),
            source: UploadSource::Buffer(bytes.into()),
            start_print: false,
        }
    }

    pub fn from_stream(
        file_name: impl Into<String>,
        stream: BoxStream<'static, std::io::Result<Bytes>>,
        length: u64,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            source: UploadSource::Stream { stream, length },
            start_print: false,
        }
    }

    pub fn with_start_print(mut self, start_print: bool) -> Self {
        self.start_print = start_print;
        self
    }
}

/// Whether the last job can be printed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReprintReadiness {
    PrinterNotAvailable,
    NoLastPrint,
    LastPrintReady,
}

/// Answer to a reprint query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReprintState {
    pub readiness: ReprintReadiness,
    /// Resolved file reference when ready
    pub file: Option<FileEntry>,
    pub connection_state: ConnectionState,
}

impl ReprintState {
    pub fn not_available(connection_state: ConnectionState) -> Self {
        Self {
            readiness: ReprintReadiness::PrinterNotAvailable,
            file: None,
            connection_state,
        }
    }

    pub fn no_last_print(connection_state: ConnectionState) -> Self {
        Self {
            readiness: ReprintReadiness::NoLastPrint,
            file: None,
            connection_state,
        }
    }

    pub fn ready(file: FileEntry, connection_state: ConnectionState) -> Self {
        Self {
            readiness: ReprintReadiness::LastPrintReady,
            file: Some(file),
            connection_state,
        }
    }
}

/// Relative print head move in millimetres.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct JogCommand {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// Feed rate in mm/min
    pub speed: Option<f64>,
}

impl JogCommand {
    /// G-code lines for this move, wrapped in relative mode.
    pub fn to_gcode(&self) -> Vec<String> {
        let mut axes = String::new();
        for (name, value) in [("X", self.x), ("Y", self.y), ("Z", self.z)] {
            if value != 0.0 {
                axes.push_str(&format!(" {}{}", name, value));
            }
        }
        if let Some(speed) = self.speed {
            axes.push_str(&format!(" F{}", speed));
        }
        vec!["G91".to_string(), format!("G1{}", axes), "G90".to_string()]
    }
}

/// Axis selector for homing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::X => "x",
            Self::Y => "y",
            Self::Z => "z",
        }
    }
}

/// `G28` for the given axes (all axes when empty).
pub fn home_gcode(axes: &[Axis]) -> String {
    let mut line = "G28".to_string();
    for axis in axes {
        line.push(' ');
        line.push_str(&axis.as_str().to_ascii_uppercase());
    }
    line
}

/// Printer adapter trait.
///
/// One adapter instance manages one printer session. Connect, disconnect and
/// reconnect are serialized per instance; the other operations can run
/// concurrently and fail with [`AdapterError::NotConnected`] when the
/// protocol needs a live session that is not there.
///
/// Operations a protocol cannot express return
/// [`AdapterError::NotImplemented`].
#[async_trait]
pub trait PrinterAdapter: Send + Sync {
    /// Protocol this adapter speaks.
    fn protocol(&self) -> PrinterProtocol;

    /// Printer this adapter is bound to.
    fn device_id(&self) -> &str;

    fn connection_state(&self) -> ConnectionState;

    fn sub_state(&self) -> SubState;

    /// Gate all further event emission. Set to `false` before teardown.
    fn allow_events(&self, allowed: bool);

    /// Open the session.
    ///
    /// Validates `login` first and fails fast on missing credentials. A
    /// failed handshake is not an error for the caller: the adapter moves to
    /// `Reconnecting` and retries on its own.
    async fn connect(&self, login: LoginDto) -> AdapterResult<()>;

    /// Close the current session (if any) and connect with `login`.
    async fn reconnect(&self, login: LoginDto) -> AdapterResult<()>;

    /// Close the session and cancel every timer. Idempotent.
    async fn disconnect(&self) -> AdapterResult<()>;

    /// Replace the credentials on a live adapter.
    ///
    /// Polled protocols swap them in place; session-based protocols
    /// reconnect with them unless currently disconnected.
    async fn update_login(&self, login: LoginDto) -> AdapterResult<()>;

    /// Reset socket and API sub-state to their initial values.
    fn reset_sub_state(&self);

    async fn get_version(&self) -> AdapterResult<String>;

    async fn restart_server(&self) -> AdapterResult<()>;

    async fn restart_host(&self) -> AdapterResult<()>;

    async fn restart_firmware(&self) -> AdapterResult<()>;

    /// Start printing a stored file.
    async fn start_print(&self, path: &str) -> AdapterResult<()>;

    async fn pause_print(&self) -> AdapterResult<()>;

    async fn resume_print(&self) -> AdapterResult<()>;

    async fn cancel_print(&self) -> AdapterResult<()>;

    /// Send raw G-code lines.
    async fn send_gcode(&self, lines: &[String]) -> AdapterResult<()>;

    async fn jog(&self, command: JogCommand) -> AdapterResult<()>;

    async fn home(&self, axes: &[Axis]) -> AdapterResult<()>;

    async fn list_files(&self) -> AdapterResult<Vec<FileEntry>>;

    async fn get_file(&self, path: &str) -> AdapterResult<FileEntry>;

    async fn upload_file(&self, upload: FileUpload) -> AdapterResult<()>;

    async fn download_file(&self, path: &str) -> AdapterResult<Bytes>;

    async fn delete_file(&self, path: &str) -> AdapterResult<()>;

    async fn create_folder(&self, path: &str) -> AdapterResult<()>;

    async fn delete_folder(&self, path: &str) -> AdapterResult<()>;

    /// Raw device settings document.
    async fn get_settings(&self) -> AdapterResult<serde_json::Value>;

    /// Whether the last job can be printed again.
    async fn reprint_state(&self) -> AdapterResult<ReprintState>;
}
