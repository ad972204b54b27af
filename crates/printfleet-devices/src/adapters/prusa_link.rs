//! PrusaLink adapter.
//!
//! PrusaLink has no push channel: status is polled from `/api/v1/status` on
//! the configured interval and published like any other live update. Every
//! request carries HTTP digest authentication. A failing poll moves the
//! printer to `Reconnecting`; the next successful one brings it back, so the
//! poll loop doubles as the retry loop.

use super::rest::{encode_path, http_client, json_body, normalize_base};
use crate::adapter::{
    AdapterError, AdapterResult, Axis, FileEntry, FileUpload, JogCommand, PrinterAdapter,
    ReprintState, UploadSource,
};
use crate::context::PrinterContext;
use crate::digest::DigestClient;
use crate::poller::StatusPoller;
use crate::reconnect::handshake;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use printfleet_core::{
    ApiState, ConnectionState, JobProgress, LifecycleKind, LoginDto, PrinterProtocol,
    PrinterStatus, SharedEventBus, SharedSettings, SocketState, StatusFlags, SubState,
};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Client, Method, Response, StatusCode};
use serde_json::Value;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Storage every file operation targets.
const STORAGE: &str = "usb";

/// Shared between the adapter and its poll task.
struct PrusaLinkInner {
    ctx: Arc<PrinterContext>,
    http: Client,
    digest: RwLock<Option<Arc<DigestClient>>>,
}

impl PrusaLinkInner {
    fn install_login(&self, login: LoginDto) {
        let client = DigestClient::new(
            self.http.clone(),
            login.username.clone().unwrap_or_default(),
            login.password.clone().unwrap_or_default(),
        );
        *self.digest.write() = Some(Arc::new(client));
        self.ctx.store_login(login);
    }

    fn digest(&self) -> AdapterResult<Arc<DigestClient>> {
        self.digest.read().clone().ok_or(AdapterError::NotConnected)
    }

    fn url(&self, path: &str) -> AdapterResult<String> {
        Ok(format!("{}{}", normalize_base(&self.ctx.login()?.printer_url)?, path))
    }

    /// Authenticated request bounded by the request timeout.
    async fn send(&self, method: Method, path: &str) -> AdapterResult<Response> {
        let url = self.url(path)?;
        let timeout = self.ctx.settings.read(|s| s.request_timeout());
        let response = self
            .digest()?
            .send(method, &url, |request| request.timeout(timeout))
            .await?;
        Ok(response.error_for_status()?)
    }

    async fn get_json(&self, path: &str) -> AdapterResult<Value> {
        json_body(self.send(Method::GET, path).await?).await
    }

    async fn fetch_status(&self) -> AdapterResult<PrinterStatus> {
        let status = self.get_json("/api/v1/status").await?;
        Ok(normalize_status(&status))
    }

    fn record_success(&self, status: PrinterStatus) {
        self.ctx.set_socket_state(SocketState::Authenticated);
        self.ctx.set_api_state(ApiState::Responding);
        self.ctx.publish_status(status);
    }

    fn record_failure(&self, error: &AdapterError) {
        self.ctx.set_socket_state(SocketState::Error);
        self.ctx.set_api_state(error.api_state());
    }

    /// One tick of the poll loop.
    async fn poll(&self) {
        match self.fetch_status().await {
            Ok(status) => {
                self.record_success(status);
                if self
                    .ctx
                    .state
                    .transition_from(ConnectionState::Reconnecting, ConnectionState::Connected)
                {
                    info!(device_id = %self.ctx.device_id, "Reconnected");
                }
            }
            Err(e) => {
                debug!(device_id = %self.ctx.device_id, "Poll failed: {}", e);
                self.record_failure(&e);
                if self
                    .ctx
                    .state
                    .transition_from(ConnectionState::Connected, ConnectionState::Reconnecting)
                {
                    warn!(device_id = %self.ctx.device_id, "Printer stopped answering: {}", e);
                    self.ctx
                        .emitter
                        .lifecycle(LifecycleKind::TransportLost, e.to_string());
                }
            }
        }
    }

    /// Id of the active job.
    async fn job_id(&self) -> AdapterResult<u64> {
        let job = self.get_json("/api/v1/job").await?;
        job["id"]
            .as_u64()
            .ok_or_else(|| AdapterError::Protocol("no active job".into()))
    }
}

/// PrusaLink printer adapter.
pub struct PrusaLinkAdapter {
    inner: Arc<PrusaLinkInner>,
    op_lock: tokio::sync::Mutex<()>,
    poller: StatusPoller,
}

impl PrusaLinkAdapter {
    pub fn new(
        device_id: impl Into<String>,
        bus: SharedEventBus,
        settings: SharedSettings,
    ) -> AdapterResult<Self> {
        let ctx = PrinterContext::new(device_id, PrinterProtocol::PrusaLink, bus, settings);
        let http = http_client(&ctx)?;
        Ok(Self {
            poller: StatusPoller::new(ctx.device_id.clone()),
            inner: Arc::new(PrusaLinkInner {
                ctx,
                http,
                digest: RwLock::new(None),
            }),
            op_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn ctx(&self) -> &PrinterContext {
        &self.inner.ctx
    }

    pub fn is_polling(&self) -> bool {
        self.poller.is_running()
    }

    fn start_poller(&self) {
        let settings = self.inner.ctx.settings.clone();
        let inner: Weak<PrusaLinkInner> = Arc::downgrade(&self.inner);
        self.poller.start(
            move || settings.read(|s| s.poll_interval()),
            move || {
                let inner = inner.clone();
                async move {
                    if let Some(inner) = inner.upgrade() {
                        inner.poll().await;
                    }
                }
            },
        );
    }

    async fn require_job(&self) -> AdapterResult<u64> {
        self.ctx().require_connected()?;
        self.inner.job_id().await
    }

    fn file_path(path: &str) -> String {
        format!("/api/v1/files/{}/{}", STORAGE, encode_path(path))
    }
}

/// Fold `/api/v1/status` into a status.
pub fn normalize_status(payload: &Value) -> PrinterStatus {
    let printer = &payload["printer"];
    let state = printer["state"].as_str().unwrap_or("UNKNOWN");
    let printing = matches!(state, "PRINTING" | "BUSY");
    let paused = state == "PAUSED";
    let error = matches!(state, "ERROR" | "ATTENTION");

    let mut status = PrinterStatus::new(state);
    status.flags = StatusFlags {
        connected: true,
        operational: !error,
        printing,
        paused,
        error,
        ready: matches!(state, "IDLE" | "READY" | "FINISHED" | "STOPPED"),
    };
    status = status
        .with_temperature(
            "tool0",
            printer["temp_nozzle"].as_f64(),
            printer["target_nozzle"].as_f64(),
        )
        .with_temperature(
            "bed",
            printer["temp_bed"].as_f64(),
            printer["target_bed"].as_f64(),
        );

    let job = &payload["job"];
    if job.is_object() {
        status.progress = Some(JobProgress {
            file_name: None,
            completion: job["progress"].as_f64(),
            print_time: job["time_printing"].as_u64(),
            print_time_left: job["time_remaining"].as_u64(),
        });
    }
    status
}

/// Strip the storage prefix from a PrusaLink path (`/usb/a/b.gcode`).
fn storage_relative(path: &str) -> &str {
    let trimmed = path.trim_start_matches('/');
    trimmed
        .strip_prefix(STORAGE)
        .map(|rest| rest.trim_start_matches('/'))
        .unwrap_or(trimmed)
}

fn file_entry(folder: &str, value: &Value) -> Option<FileEntry> {
    let name = value["name"].as_str()?;
    let path = if folder.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", folder, name)
    };
    Some(FileEntry {
        path,
        size: value["size"].as_u64(),
        date: value["m_timestamp"].as_i64(),
    })
}

#[async_trait]
impl PrinterAdapter for PrusaLinkAdapter {
    fn protocol(&self) -> PrinterProtocol {
        PrinterProtocol::PrusaLink
    }

    fn device_id(&self) -> &str {
        &self.inner.ctx.device_id
    }

    fn connection_state(&self) -> ConnectionState {
        self.ctx().connection_state()
    }

    fn sub_state(&self) -> SubState {
        self.ctx().sub_state()
    }

    fn allow_events(&self, allowed: bool) {
        self.ctx().emitter.set_enabled(allowed);
    }

    async fn connect(&self, login: LoginDto) -> AdapterResult<()> {
        login.validate()?;
        normalize_base(&login.printer_url)?;

        let _guard = self.op_lock.lock().await;
        let ctx = self.ctx();
        let state = ctx.connection_state();
        if state != ConnectionState::Disconnected {
            return Err(AdapterError::AlreadyConnected(state));
        }

        self.inner.install_login(login);
        ctx.state.transition(ConnectionState::Connecting)?;
        ctx.set_socket_state(SocketState::Opening);

        let timeout = ctx.settings.read(|s| s.handshake_timeout());
        match handshake(timeout, self.inner.fetch_status()).await {
            Ok(status) => {
                self.inner.record_success(status);
                ctx.state.transition(ConnectionState::Connected)?;
                info!(device_id = %ctx.device_id, "Connected");
            }
            Err(e) => {
                warn!(device_id = %ctx.device_id, "Handshake failed: {}", e);
                self.inner.record_failure(&e);
                ctx.emitter
                    .lifecycle(LifecycleKind::HandshakeFailed, e.to_string());
                ctx.state.transition(ConnectionState::Reconnecting)?;
            }
        }
        self.start_poller();
        Ok(())
    }

    async fn reconnect(&self, login: LoginDto) -> AdapterResult<()> {
        if let Err(e) = self.disconnect().await {
            debug!(device_id = %self.device_id(), "Disconnect before reconnect failed: {}", e);
        }
        self.connect(login).await
    }

    async fn disconnect(&self) -> AdapterResult<()> {
        let _guard = self.op_lock.lock().await;
        self.poller.stop().await;

        let ctx = self.ctx();
        if ctx.connection_state() != ConnectionState::Disconnected {
            ctx.state.try_transition(ConnectionState::Disconnected);
            ctx.set_socket_state(SocketState::Closed);
            ctx.emitter
                .lifecycle(LifecycleKind::Closed, "disconnect requested");
            info!(device_id = %ctx.device_id, "Disconnected");
        }
        if let Ok(digest) = self.inner.digest() {
            digest.reset();
        }
        Ok(())
    }

    async fn update_login(&self, login: LoginDto) -> AdapterResult<()> {
        login.validate()?;
        normalize_base(&login.printer_url)?;
        let _guard = self.op_lock.lock().await;
        self.inner.install_login(login);
        Ok(())
    }

    fn reset_sub_state(&self) {
        self.ctx().reset_sub_state();
    }

    async fn get_version(&self) -> AdapterResult<String> {
        let version = self.inner.get_json("/api/version").await?;
        version["server"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| AdapterError::Protocol("version response carries no server field".into()))
    }

    async fn restart_server(&self) -> AdapterResult<()> {
        Err(AdapterError::NotImplemented("restart_server"))
    }

    async fn restart_host(&self) -> AdapterResult<()> {
        Err(AdapterError::NotImplemented("restart_host"))
    }

    async fn restart_firmware(&self) -> AdapterResult<()> {
        Err(AdapterError::NotImplemented("restart_firmware"))
    }

    async fn start_print(&self, path: &str) -> AdapterResult<()> {
        self.ctx().require_connected()?;
        self.inner
            .send(Method::POST, &Self::file_path(path))
            .await?;
        Ok(())
    }

    async fn pause_print(&self) -> AdapterResult<()> {
        let id = self.require_job().await?;
        self.inner
            .send(Method::PUT, &format!("/api/v1/job/{}/pause", id))
            .await?;
        Ok(())
    }

    async fn resume_print(&self) -> AdapterResult<()> {
        let id = self.require_job().await?;
        self.inner
            .send(Method::PUT, &format!("/api/v1/job/{}/resume", id))
            .await?;
        Ok(())
    }

    async fn cancel_print(&self) -> AdapterResult<()> {
        let id = self.require_job().await?;
        self.inner
            .send(Method::DELETE, &format!("/api/v1/job/{}", id))
            .await?;
        Ok(())
    }

    async fn send_gcode(&self, _lines: &[String]) -> AdapterResult<()> {
        Err(AdapterError::NotImplemented("send_gcode"))
    }

    async fn jog(&self, _command: JogCommand) -> AdapterResult<()> {
        Err(AdapterError::NotImplemented("jog"))
    }

    async fn home(&self, _axes: &[Axis]) -> AdapterResult<()> {
        Err(AdapterError::NotImplemented("home"))
    }

    async fn list_files(&self) -> AdapterResult<Vec<FileEntry>> {
        let mut files = Vec::new();
        let mut folders = vec![String::new()];
        while let Some(folder) = folders.pop() {
            let path = if folder.is_empty() {
                format!("/api/v1/files/{}/", STORAGE)
            } else {
                format!("{}/", Self::file_path(&folder))
            };
            let listing = self.inner.get_json(&path).await?;
            let Some(children) = listing["children"].as_array() else {
                continue;
            };
            for child in children {
                if child["type"] == "FOLDER" {
                    if let Some(name) = child["name"].as_str() {
                        folders.push(if folder.is_empty() {
                            name.to_string()
                        } else {
                            format!("{}/{}", folder, name)
                        });
                    }
                } else if let Some(entry) = file_entry(&folder, child) {
                    files.push(entry);
                }
            }
        }
        Ok(files)
    }

    async fn get_file(&self, path: &str) -> AdapterResult<FileEntry> {
        let info = self.inner.get_json(&Self::file_path(path)).await?;
        let mut entry = file_entry("", &info)
            .ok_or_else(|| AdapterError::Protocol(format!("no file information for {}", path)))?;
        entry.path = path.trim_matches('/').to_string();
        Ok(entry)
    }

    async fn upload_file(&self, upload: FileUpload) -> AdapterResult<()> {
        let url = self.inner.url(&Self::file_path(&upload.file_name))?;
        let digest = self.inner.digest()?;
        let print_after = if upload.start_print { "?1" } else { "?0" };
        let length = upload.source.len();

        let response = match upload.source {
            UploadSource::Buffer(bytes) => {
                digest
                    .send(Method::PUT, &url, |request| {
                        request
                            .header(CONTENT_TYPE, "application/octet-stream")
                            .header("Print-After-Upload", print_after)
                            .header("Overwrite", "?1")
                            .body(bytes.clone())
                    })
                    .await?
            }
            source @ UploadSource::Stream { .. } => {
                // A stream can be sent once, so a challenge must be cached first
                digest.prime(&self.inner.url("/api/version")?).await?;
                let request = digest
                    .request(Method::PUT, &url)
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .header(CONTENT_LENGTH, length)
                    .header("Print-After-Upload", print_after)
                    .header("Overwrite", "?1")
                    .body(source.into_body());
                digest.send_single(Method::PUT, &url, request).await?
            }
        };
        response.error_for_status()?;
        Ok(())
    }

    async fn download_file(&self, path: &str) -> AdapterResult<Bytes> {
        let info = self.inner.get_json(&Self::file_path(path)).await?;
        let download = info["refs"]["download"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| format!("/{}/{}", STORAGE, encode_path(path)));
        let url = self.inner.url(&download)?;
        let response = self.inner.digest()?.send(Method::GET, &url, |r| r).await?;
        Ok(response.error_for_status()?.bytes().await?)
    }

    async fn delete_file(&self, path: &str) -> AdapterResult<()> {
        self.inner
            .send(Method::DELETE, &Self::file_path(path))
            .await?;
        Ok(())
    }

    async fn create_folder(&self, _path: &str) -> AdapterResult<()> {
        Err(AdapterError::NotImplemented("create_folder"))
    }

    async fn delete_folder(&self, path: &str) -> AdapterResult<()> {
        self.delete_file(path).await
    }

    async fn get_settings(&self) -> AdapterResult<Value> {
        self.inner.get_json("/api/v1/info").await
    }

    async fn reprint_state(&self) -> AdapterResult<ReprintState> {
        let state = self.ctx().connection_state();
        if state != ConnectionState::Connected {
            return Ok(ReprintState::not_available(state));
        }
        let response = self.inner.send(Method::GET, "/api/v1/job").await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(ReprintState::no_last_print(state));
        }
        let job = json_body(response).await?;
        let file = &job["file"];
        let folder = storage_relative(file["path"].as_str().unwrap_or_default());
        match file_entry(folder, file) {
            Some(entry) => Ok(ReprintState::ready(entry, state)),
            None => Ok(ReprintState::no_last_print(state)),
        }
    }
}
