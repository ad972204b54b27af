//! Bambu Lab adapter (LAN mode).
//!
//! Commands and reports travel over the printer's MQTT broker. Reports are
//! partial `print` documents merged into a cached copy before normalizing.
//! Files live on the printer's storage and go through [`BambuFtp`], which
//! keeps its own sessions and does not need MQTT to be up.

use super::ftp::BambuFtp;
use crate::adapter::{
    home_gcode, AdapterError, AdapterResult, Axis, FileEntry, FileUpload, JogCommand,
    PrinterAdapter, ReprintState,
};
use crate::context::PrinterContext;
use crate::link::{FrameHandler, LinkOptions, SessionHandle, TransportLink};
use crate::transport::{MqttConnector, TransportConnector};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use printfleet_core::{
    ApiState, ConnectionState, JobProgress, LoginDto, PrinterProtocol, PrinterStatus,
    SharedEventBus, SharedSettings, StatusFlags, SubState,
};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Builds request payloads with increasing sequence ids.
#[derive(Default)]
pub struct CommandBuilder {
    sequence: AtomicU64,
}

impl CommandBuilder {
    fn next_sequence(&self) -> String {
        self.sequence.fetch_add(1, Ordering::SeqCst).to_string()
    }

    /// `{section: {sequence_id, command, ..extra}}`
    pub fn build(&self, section: &str, command: &str, extra: Value) -> Value {
        let mut body = json!({
            "sequence_id": self.next_sequence(),
            "command": command,
        });
        if let (Some(body), Value::Object(extra)) = (body.as_object_mut(), extra) {
            body.extend(extra);
        }
        let mut wrapped = Map::new();
        wrapped.insert(section.to_string(), body);
        Value::Object(wrapped)
    }

    pub fn push_all(&self) -> Value {
        self.build("pushing", "pushall", json!({}))
    }

    pub fn get_version(&self) -> Value {
        self.build("info", "get_version", json!({}))
    }

    pub fn print(&self, command: &str) -> Value {
        self.build("print", command, json!({}))
    }

    pub fn gcode_line(&self, gcode: &str) -> Value {
        self.build("print", "gcode_line", json!({ "param": format!("{}\n", gcode) }))
    }

    /// Start a file from storage. `.3mf` projects print their first plate.
    pub fn start_file(&self, path: &str) -> Value {
        let path = path.trim_start_matches('/');
        if path.to_ascii_lowercase().ends_with(".3mf") {
            let name = path.rsplit('/').next().unwrap_or(path);
            self.build(
                "print",
                "project_file",
                json!({
                    "param": "Metadata/plate_1.gcode",
                    "subtask_name": name,
                    "url": format!("ftp:///{}", path),
                    "bed_type": "auto",
                    "timelapse": false,
                    "bed_leveling": true,
                    "flow_cali": false,
                    "vibration_cali": false,
                    "layer_inspect": false,
                    "use_ams": false,
                    "profile_id": "0",
                    "project_id": "0",
                    "subtask_id": "0",
                    "task_id": "0",
                }),
            )
        } else {
            self.build("print", "gcode_file", json!({ "param": format!("/sdcard/{}", path) }))
        }
    }
}

/// Bambu Lab printer adapter.
pub struct BambuAdapter {
    ctx: Arc<PrinterContext>,
    link: Arc<TransportLink>,
    shared: Arc<BambuShared>,
}

/// State shared with the MQTT frame handler.
struct BambuShared {
    commands: CommandBuilder,
    report: Mutex<Map<String, Value>>,
    version: watch::Sender<Option<String>>,
    ftp: RwLock<Option<BambuFtp>>,
}

impl BambuAdapter {
    pub fn new(
        device_id: impl Into<String>,
        bus: SharedEventBus,
        settings: SharedSettings,
    ) -> AdapterResult<Self> {
        Self::with_connector(device_id, bus, settings, Arc::new(MqttConnector::new()))
    }

    /// Use a custom connector for the MQTT channel.
    pub fn with_connector(
        device_id: impl Into<String>,
        bus: SharedEventBus,
        settings: SharedSettings,
        connector: Arc<dyn TransportConnector>,
    ) -> AdapterResult<Self> {
        let ctx = PrinterContext::new(device_id, PrinterProtocol::Bambu, bus, settings);
        let (version, _) = watch::channel(None);
        let shared = Arc::new(BambuShared {
            commands: CommandBuilder::default(),
            report: Mutex::new(Map::new()),
            version,
            ftp: RwLock::new(None),
        });
        let handler = Arc::new(BambuHandler {
            ctx: ctx.clone(),
            shared: shared.clone(),
        });
        // MQTT keep-alive already detects dead brokers
        let link = TransportLink::new(
            ctx.clone(),
            connector,
            handler,
            LinkOptions { heartbeat: false },
        );
        Ok(Self { ctx, link, shared })
    }

    fn publish(&self, payload: &Value) -> AdapterResult<()> {
        self.link.require_session()?.send_json(payload)
    }

    fn ftp(&self) -> AdapterResult<BambuFtp> {
        if let Some(ftp) = self.shared.ftp.read().clone() {
            return Ok(ftp);
        }
        BambuFtp::from_login(&self.ctx.login()?)
    }

    fn install_ftp(&self, login: &LoginDto) {
        *self.shared.ftp.write() = BambuFtp::from_login(login).ok();
    }

    fn gcode(&self, script: &str) -> AdapterResult<()> {
        self.publish(&self.shared.commands.gcode_line(script))
    }
}

struct BambuHandler {
    ctx: Arc<PrinterContext>,
    shared: Arc<BambuShared>,
}

impl BambuHandler {
    fn on_report(&self, report: &Value) {
        let status = {
            let mut cached = self.shared.report.lock();
            merge_report(&mut cached, report);
            normalize_report(&cached)
        };
        self.ctx.publish_status(status);
    }

    fn on_info(&self, info: &Value) {
        if info["command"] != "get_version" {
            return;
        }
        if let Some(version) = firmware_version(info) {
            debug!(device_id = %self.ctx.device_id, %version, "Firmware version");
            self.shared.version.send_replace(Some(version));
        }
    }
}

#[async_trait]
impl FrameHandler for BambuHandler {
    async fn on_open(&self, session: &SessionHandle) -> AdapterResult<()> {
        self.shared.report.lock().clear();
        session.send_json(&self.shared.commands.push_all())?;
        session.send_json(&self.shared.commands.get_version())?;
        self.ctx.set_api_state(ApiState::Responding);
        Ok(())
    }

    async fn on_text(&self, _session: &SessionHandle, text: String) {
        let message: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(e) => {
                debug!(device_id = %self.ctx.device_id, "Dropping malformed report: {}", e);
                return;
            }
        };
        if let Some(print) = message.get("print") {
            self.on_report(print);
        }
        if let Some(info) = message.get("info") {
            self.on_info(info);
        }
        if message.get("print").is_none() && message.get("info").is_none() {
            trace!(device_id = %self.ctx.device_id, "Unhandled report");
        }
    }

    fn on_closed(&self, _reason: &str) {
        self.shared.report.lock().clear();
    }
}

/// Merge a partial `print` report into the cached one.
pub fn merge_report(cached: &mut Map<String, Value>, report: &Value) {
    if let Some(fields) = report.as_object() {
        for (key, value) in fields {
            cached.insert(key.clone(), value.clone());
        }
    }
}

/// Firmware version from a `get_version` reply (the `ota` module).
pub fn firmware_version(info: &Value) -> Option<String> {
    info["module"]
        .as_array()?
        .iter()
        .find(|module| module["name"] == "ota")
        .and_then(|module| module["sw_ver"].as_str())
        .map(str::to_string)
}

/// Fold the cached `print` report into a status.
pub fn normalize_report(report: &Map<String, Value>) -> PrinterStatus {
    let empty = Value::Null;
    let field = |name: &str| report.get(name).unwrap_or(&empty);
    let state = field("gcode_state").as_str().unwrap_or("UNKNOWN");
    let print_error = field("print_error").as_u64().unwrap_or(0);

    let printing = matches!(state, "RUNNING" | "PREPARE" | "SLICING");
    let paused = state == "PAUSE";
    let error = state == "FAILED" || print_error != 0;

    let mut status = PrinterStatus::new(state);
    status.flags = StatusFlags {
        connected: true,
        operational: state != "UNKNOWN",
        printing,
        paused,
        error,
        ready: matches!(state, "IDLE" | "FINISH"),
    };
    status = status
        .with_temperature(
            "tool0",
            field("nozzle_temper").as_f64(),
            field("nozzle_target_temper").as_f64(),
        )
        .with_temperature(
            "bed",
            field("bed_temper").as_f64(),
            field("bed_target_temper").as_f64(),
        )
        .with_temperature("chamber", field("chamber_temper").as_f64(), None);

    let file_name = field("gcode_file")
        .as_str()
        .or_else(|| field("subtask_name").as_str())
        .filter(|name| !name.is_empty())
        .map(str::to_string);
    let completion = field("mc_percent").as_f64();
    if file_name.is_some() || completion.is_some() {
        status.progress = Some(JobProgress {
            file_name,
            completion,
            print_time: None,
            // Reported in minutes
            print_time_left: field("mc_remaining_time").as_u64().map(|m| m * 60),
        });
    }
    status
}

#[async_trait]
impl PrinterAdapter for BambuAdapter {
    fn protocol(&self) -> PrinterProtocol {
        PrinterProtocol::Bambu
    }

    fn device_id(&self) -> &str {
        &self.ctx.device_id
    }

    fn connection_state(&self) -> ConnectionState {
        self.ctx.connection_state()
    }

    fn sub_state(&self) -> SubState {
        self.ctx.sub_state()
    }

    fn allow_events(&self, allowed: bool) {
        self.ctx.emitter.set_enabled(allowed);
    }

    async fn connect(&self, login: LoginDto) -> AdapterResult<()> {
        self.link.connect(login.clone()).await?;
        self.install_ftp(&login);
        Ok(())
    }

    async fn reconnect(&self, login: LoginDto) -> AdapterResult<()> {
        self.link.reconnect(login.clone()).await?;
        self.install_ftp(&login);
        Ok(())
    }

    async fn disconnect(&self) -> AdapterResult<()> {
        self.link.disconnect().await?;
        self.shared.version.send_replace(None);
        Ok(())
    }

    async fn update_login(&self, login: LoginDto) -> AdapterResult<()> {
        self.link.update_login(login.clone()).await?;
        self.install_ftp(&login);
        Ok(())
    }

    fn reset_sub_state(&self) {
        self.ctx.reset_sub_state();
    }

    async fn get_version(&self) -> AdapterResult<String> {
        let mut version = self.shared.version.subscribe();
        let known = version.borrow().clone();
        if let Some(known) = known {
            return Ok(known);
        }
        self.publish(&self.shared.commands.get_version())?;

        let timeout = self.ctx.settings.read(|s| s.request_timeout());
        let wait = version.wait_for(Option::is_some);
        // Bound so the borrowed reply is released before `version` drops
        let result = match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(reply)) => reply
                .clone()
                .ok_or_else(|| AdapterError::Protocol("empty version reply".into())),
            Ok(Err(_)) => Err(AdapterError::Closed("adapter dropped".into())),
            Err(_) => Err(AdapterError::RequestTimeout(timeout.as_millis() as u64)),
        };
        result
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
        self.publish(&self.shared.commands.start_file(path))
    }

    async fn pause_print(&self) -> AdapterResult<()> {
        self.publish(&self.shared.commands.print("pause"))
    }

    async fn resume_print(&self) -> AdapterResult<()> {
        self.publish(&self.shared.commands.print("resume"))
    }

    async fn cancel_print(&self) -> AdapterResult<()> {
        self.publish(&self.shared.commands.print("stop"))
    }

    async fn send_gcode(&self, lines: &[String]) -> AdapterResult<()> {
        self.gcode(&lines.join("\n"))
    }

    async fn jog(&self, command: JogCommand) -> AdapterResult<()> {
        self.gcode(&command.to_gcode().join("\n"))
    }

    async fn home(&self, axes: &[Axis]) -> AdapterResult<()> {
        self.gcode(&home_gcode(axes))
    }

    async fn list_files(&self) -> AdapterResult<Vec<FileEntry>> {
        self.ftp()?.list().await
    }

    async fn get_file(&self, path: &str) -> AdapterResult<FileEntry> {
        self.ftp()?.stat(path).await
    }

    async fn upload_file(&self, upload: FileUpload) -> AdapterResult<()> {
        let ftp = self.ftp()?;
        let path = upload.file_name.clone();
        let data = upload.source.into_bytes().await?;
        ftp.upload(&path, data).await?;
        if upload.start_print {
            self.start_print(&path).await?;
        }
        Ok(())
    }

    async fn download_file(&self, path: &str) -> AdapterResult<Bytes> {
        self.ftp()?.download(path).await
    }

    async fn delete_file(&self, path: &str) -> AdapterResult<()> {
        self.ftp()?.delete(path).await
    }

    async fn create_folder(&self, path: &str) -> AdapterResult<()> {
        self.ftp()?.mkdir(path).await
    }

    async fn delete_folder(&self, path: &str) -> AdapterResult<()> {
        self.ftp()?.rmdir(path).await
    }

    async fn get_settings(&self) -> AdapterResult<Value> {
        self.ctx.require_connected()?;
        Ok(Value::Object(self.shared.report.lock().clone()))
    }

    async fn reprint_state(&self) -> AdapterResult<ReprintState> {
        let state = self.ctx.connection_state();
        if state != ConnectionState::Connected {
            return Ok(ReprintState::not_available(state));
        }
        let last = self
            .ctx
            .last_status()
            .and_then(|status| status.job_file().map(str::to_string));
        let Some(last) = last else {
            return Ok(ReprintState::no_last_print(state));
        };
        match self.ftp()?.stat(&last).await {
            Ok(entry) => Ok(ReprintState::ready(entry, state)),
            // The file was deleted since it was printed
            Err(AdapterError::Protocol(_)) => Ok(ReprintState::no_last_print(state)),
            Err(e) => Err(e),
        }
    }
}
