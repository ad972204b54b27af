//! Moonraker (Klipper) adapter.
//!
//! Everything except file transfer goes over JSON-RPC on `/websocket`.
//! After the socket opens the adapter identifies itself and subscribes to the
//! printer objects it normalizes; `notify_status_update` then delivers partial
//! documents that are merged into a cached copy before publishing.

use super::rest::{encode_path, split_parent, RestClient};
use crate::adapter::{
    home_gcode, AdapterError, AdapterResult, Axis, FileEntry, FileUpload, JogCommand,
    PrinterAdapter, ReprintState,
};
use crate::context::PrinterContext;
use crate::correlator::RequestCorrelator;
use crate::link::{FrameHandler, LinkOptions, SessionHandle, TransportLink};
use crate::transport::{TransportConnector, WsConnector};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use printfleet_core::{
    ApiState, ConnectionState, JobProgress, LoginDto, PrinterProtocol, PrinterStatus,
    SharedEventBus, SharedSettings, StatusFlags, SubState,
};
use reqwest::multipart::{Form, Part};
use reqwest::Method;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// JSON-RPC socket path.
pub const SOCKET_PATH: &str = "/websocket";

/// Root every G-code path lives under.
const GCODE_ROOT: &str = "gcodes";

/// Objects subscribed to after identification.
fn subscription() -> Value {
    json!({
        "objects": {
            "webhooks": ["state", "state_message"],
            "print_stats": ["state", "filename", "print_duration", "message"],
            "virtual_sdcard": ["progress"],
            "extruder": ["temperature", "target"],
            "heater_bed": ["temperature", "target"]
        }
    })
}

async fn call(
    ctx: &PrinterContext,
    correlator: &RequestCorrelator,
    session: &SessionHandle,
    method: &str,
    params: Option<Value>,
) -> AdapterResult<Value> {
    let timeout = ctx.settings.read(|s| s.request_timeout());
    correlator
        .send_request(method, params, timeout, |text| async move {
            session.send_text(text)
        })
        .await
}

/// Moonraker printer adapter.
pub struct MoonrakerAdapter {
    ctx: Arc<PrinterContext>,
    link: Arc<TransportLink>,
    rest: RestClient,
    correlator: Arc<RequestCorrelator>,
}

impl MoonrakerAdapter {
    pub fn new(
        device_id: impl Into<String>,
        bus: SharedEventBus,
        settings: SharedSettings,
    ) -> AdapterResult<Self> {
        Self::with_connector(
            device_id,
            bus,
            settings,
            Arc::new(WsConnector::new(SOCKET_PATH).with_api_key_header()),
        )
    }

    /// Use a custom connector for the RPC socket.
    pub fn with_connector(
        device_id: impl Into<String>,
        bus: SharedEventBus,
        settings: SharedSettings,
        connector: Arc<dyn TransportConnector>,
    ) -> AdapterResult<Self> {
        let ctx = PrinterContext::new(device_id, PrinterProtocol::Moonraker, bus, settings);
        let correlator = Arc::new(RequestCorrelator::new(ctx.device_id.clone()));
        let handler = Arc::new(MoonrakerHandler {
            ctx: ctx.clone(),
            correlator: correlator.clone(),
            objects: Mutex::new(Map::new()),
        });
        let link = TransportLink::new(
            ctx.clone(),
            connector,
            handler,
            LinkOptions { heartbeat: true },
        );
        let rest = RestClient::new(ctx.clone())?;
        Ok(Self {
            ctx,
            link,
            rest,
            correlator,
        })
    }

    /// Number of RPC requests waiting for an answer.
    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_count()
    }

    async fn rpc(&self, method: &str, params: Option<Value>) -> AdapterResult<Value> {
        let session = self.link.require_session()?;
        call(&self.ctx, &self.correlator, &session, method, params).await
    }

    async fn rpc_ok(&self, method: &str, params: Option<Value>) -> AdapterResult<()> {
        self.rpc(method, params).await?;
        Ok(())
    }

    async fn script(&self, script: String) -> AdapterResult<()> {
        self.rpc_ok("printer.gcode.script", Some(json!({ "script": script })))
            .await
    }
}

struct MoonrakerHandler {
    ctx: Arc<PrinterContext>,
    correlator: Arc<RequestCorrelator>,
    /// Last known state of every subscribed object
    objects: Mutex<Map<String, Value>>,
}

impl MoonrakerHandler {
    fn apply_update(&self, update: &Value) {
        let status = {
            let mut objects = self.objects.lock();
            merge_objects(&mut objects, update);
            normalize_status(&objects)
        };
        self.ctx.publish_status(status);
    }

    fn on_notification(&self, notification: Value) {
        let method = notification["method"].as_str().unwrap_or_default();
        match method {
            "notify_status_update" => {
                if let Some(update) = notification["params"].get(0) {
                    self.apply_update(update);
                }
            }
            "notify_klippy_ready" => {
                info!(device_id = %self.ctx.device_id, "Klippy ready");
                self.ctx.set_api_state(ApiState::Responding);
            }
            "notify_klippy_shutdown" | "notify_klippy_disconnected" => {
                info!(device_id = %self.ctx.device_id, method, "Klippy unavailable");
                self.ctx.set_api_state(ApiState::Error);
            }
            _ => debug!(device_id = %self.ctx.device_id, method, "Ignoring notification"),
        }
    }
}

#[async_trait]
impl FrameHandler for MoonrakerHandler {
    async fn on_open(&self, session: &SessionHandle) -> AdapterResult<()> {
        let login = self.ctx.login()?;
        let mut identify = json!({
            "client_name": "printfleet",
            "version": env!("CARGO_PKG_VERSION"),
            "type": "agent",
            "url": "https://github.com/printfleet/printfleet",
        });
        if let Some(key) = login.api_key {
            identify["api_key"] = json!(key);
        }
        let identity = call(
            &self.ctx,
            &self.correlator,
            session,
            "server.connection.identify",
            Some(identify),
        )
        .await?;
        debug!(device_id = %self.ctx.device_id, connection_id = %identity["connection_id"], "Identified");

        let subscribed = call(
            &self.ctx,
            &self.correlator,
            session,
            "printer.objects.subscribe",
            Some(subscription()),
        )
        .await?;
        self.objects.lock().clear();
        self.apply_update(&subscribed["status"]);
        self.ctx.set_api_state(ApiState::Responding);
        Ok(())
    }

    async fn on_text(&self, _session: &SessionHandle, text: String) {
        let message: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(e) => {
                debug!(device_id = %self.ctx.device_id, "Dropping malformed frame: {}", e);
                return;
            }
        };
        if let Some(notification) = self.correlator.handle_message(message) {
            self.on_notification(notification);
        }
    }

    fn on_closed(&self, reason: &str) {
        self.correlator.reject_all(reason);
        self.objects.lock().clear();
    }
}

/// Merge a partial `{object: {field: value}}` document into `objects`.
pub fn merge_objects(objects: &mut Map<String, Value>, update: &Value) {
    let Some(update) = update.as_object() else {
        return;
    };
    for (name, fields) in update {
        match (objects.get_mut(name), fields.as_object()) {
            (Some(Value::Object(current)), Some(fields)) => {
                for (field, value) in fields {
                    current.insert(field.clone(), value.clone());
                }
            }
            _ => {
                objects.insert(name.clone(), fields.clone());
            }
        }
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Fold the cached printer objects into a status.
pub fn normalize_status(objects: &Map<String, Value>) -> PrinterStatus {
    let empty = Value::Null;
    let object = |name: &str| objects.get(name).unwrap_or(&empty);
    let webhooks = object("webhooks")["state"].as_str().unwrap_or("ready");
    let job_state = object("print_stats")["state"].as_str().unwrap_or("standby");

    let klippy_ready = webhooks == "ready";
    let printing = job_state == "printing";
    let paused = job_state == "paused";
    let error = job_state == "error" || matches!(webhooks, "error" | "shutdown");

    let state_text = if klippy_ready {
        capitalize(job_state)
    } else {
        capitalize(webhooks)
    };
    let mut status = PrinterStatus::new(state_text);
    status.flags = StatusFlags {
        connected: true,
        operational: klippy_ready,
        printing,
        paused,
        error,
        ready: klippy_ready && !printing && !paused,
    };

    for (object_name, heater) in [("extruder", "tool0"), ("heater_bed", "bed")] {
        let reading = object(object_name);
        status = status.with_temperature(
            heater,
            reading["temperature"].as_f64(),
            reading["target"].as_f64(),
        );
    }

    let stats = object("print_stats");
    let file_name = stats["filename"]
        .as_str()
        .filter(|name| !name.is_empty())
        .map(str::to_string);
    let progress = object("virtual_sdcard")["progress"].as_f64();
    if file_name.is_some() || progress.is_some_and(|p| p > 0.0) {
        let duration = stats["print_duration"].as_f64();
        let time_left = match (duration, progress) {
            (Some(d), Some(p)) if p > 0.0 && p < 1.0 => Some((d / p - d).round() as u64),
            _ => None,
        };
        status.progress = Some(JobProgress {
            file_name,
            completion: progress.map(|p| p * 100.0),
            print_time: duration.map(|d| d.round() as u64),
            print_time_left: time_left,
        });
    }
    status
}

fn file_entry(value: &Value) -> Option<FileEntry> {
    let path = value["path"]
        .as_str()
        .or_else(|| value["filename"].as_str())?;
    Some(FileEntry {
        path: path.to_string(),
        size: value["size"].as_u64(),
        date: value["modified"].as_f64().map(|secs| secs as i64),
    })
}

fn rooted(path: &str) -> String {
    format!("{}/{}", GCODE_ROOT, path.trim_matches('/'))
}

#[async_trait]
impl PrinterAdapter for MoonrakerAdapter {
    fn protocol(&self) -> PrinterProtocol {
        PrinterProtocol::Moonraker
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
        self.link.connect(login).await
    }

    async fn reconnect(&self, login: LoginDto) -> AdapterResult<()> {
        self.link.reconnect(login).await
    }

    async fn disconnect(&self) -> AdapterResult<()> {
        self.link.disconnect().await
    }

    async fn update_login(&self, login: LoginDto) -> AdapterResult<()> {
        self.link.update_login(login).await
    }

    fn reset_sub_state(&self) {
        self.ctx.reset_sub_state();
    }

    async fn get_version(&self) -> AdapterResult<String> {
        let info = self.rpc("server.info", None).await?;
        info["moonraker_version"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| AdapterError::Protocol("server.info carries no version".into()))
    }

    async fn restart_server(&self) -> AdapterResult<()> {
        self.rpc_ok("server.restart", None).await
    }

    async fn restart_host(&self) -> AdapterResult<()> {
        self.rpc_ok("machine.reboot", None).await
    }

    async fn restart_firmware(&self) -> AdapterResult<()> {
        self.rpc_ok("printer.firmware_restart", None).await
    }

    async fn start_print(&self, path: &str) -> AdapterResult<()> {
        self.rpc_ok(
            "printer.print.start",
            Some(json!({ "filename": path.trim_matches('/') })),
        )
        .await
    }

    async fn pause_print(&self) -> AdapterResult<()> {
        self.rpc_ok("printer.print.pause", None).await
    }

    async fn resume_print(&self) -> AdapterResult<()> {
        self.rpc_ok("printer.print.resume", None).await
    }

    async fn cancel_print(&self) -> AdapterResult<()> {
        self.rpc_ok("printer.print.cancel", None).await
    }

    async fn send_gcode(&self, lines: &[String]) -> AdapterResult<()> {
        self.script(lines.join("\n")).await
    }

    async fn jog(&self, command: JogCommand) -> AdapterResult<()> {
        self.script(command.to_gcode().join("\n")).await
    }

    async fn home(&self, axes: &[Axis]) -> AdapterResult<()> {
        self.script(home_gcode(axes)).await
    }

    async fn list_files(&self) -> AdapterResult<Vec<FileEntry>> {
        let listing = self
            .rpc("server.files.list", Some(json!({ "root": GCODE_ROOT })))
            .await?;
        Ok(listing
            .as_array()
            .map(|items| items.iter().filter_map(file_entry).collect())
            .unwrap_or_default())
    }

    async fn get_file(&self, path: &str) -> AdapterResult<FileEntry> {
        let metadata = self
            .rpc(
                "server.files.metadata",
                Some(json!({ "filename": path.trim_matches('/') })),
            )
            .await?;
        let mut entry = file_entry(&metadata)
            .ok_or_else(|| AdapterError::Protocol(format!("no metadata for {}", path)))?;
        entry.path = path.trim_matches('/').to_string();
        Ok(entry)
    }

    async fn upload_file(&self, upload: FileUpload) -> AdapterResult<()> {
        let (folder, name) = split_parent(&upload.file_name);
        let length = upload.source.len();
        let part = Part::stream_with_length(upload.source.into_body(), length)
            .file_name(name.to_string());
        let mut form = Form::new().text("root", GCODE_ROOT).part("file", part);
        if !folder.is_empty() {
            form = form.text("path", folder.to_string());
        }
        if upload.start_print {
            form = form.text("print", "true");
        }
        let builder = self
            .rest
            .transfer(Method::POST, "/server/files/upload")?
            .multipart(form);
        self.rest.send(builder).await?;
        Ok(())
    }

    async fn download_file(&self, path: &str) -> AdapterResult<Bytes> {
        let builder = self.rest.transfer(
            Method::GET,
            &format!("/server/files/{}/{}", GCODE_ROOT, encode_path(path)),
        )?;
        Ok(self.rest.send(builder).await?.bytes().await?)
    }

    async fn delete_file(&self, path: &str) -> AdapterResult<()> {
        self.rpc_ok("server.files.delete_file", Some(json!({ "path": rooted(path) })))
            .await
    }

    async fn create_folder(&self, path: &str) -> AdapterResult<()> {
        self.rpc_ok("server.files.post_directory", Some(json!({ "path": rooted(path) })))
            .await
    }

    async fn delete_folder(&self, path: &str) -> AdapterResult<()> {
        self.rpc_ok(
            "server.files.delete_directory",
            Some(json!({ "path": rooted(path), "force": false })),
        )
        .await
    }

    async fn get_settings(&self) -> AdapterResult<Value> {
        let result = self
            .rpc(
                "printer.objects.query",
                Some(json!({ "objects": { "configfile": ["settings"] } })),
            )
            .await?;
        Ok(result["status"]["configfile"]["settings"].clone())
    }

    async fn reprint_state(&self) -> AdapterResult<ReprintState> {
        let state = self.ctx.connection_state();
        if state != ConnectionState::Connected {
            return Ok(ReprintState::not_available(state));
        }
        let history = self
            .rpc(
                "server.history.list",
                Some(json!({ "limit": 1, "order": "desc" })),
            )
            .await?;
        let Some(last) = history["jobs"]
            .get(0)
            .and_then(|job| job["filename"].as_str())
            .filter(|name| !name.is_empty())
        else {
            return Ok(ReprintState::no_last_print(state));
        };
        match self.get_file(last).await {
            Ok(entry) => Ok(ReprintState::ready(entry, state)),
            // The file was deleted since it was printed
            Err(AdapterError::Protocol(_)) => Ok(ReprintState::no_last_print(state)),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn objects(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_merge_keeps_untouched_fields() {
        let mut cached = objects(json!({
            "extruder": {"temperature": 200.0, "target": 215.0},
            "print_stats": {"state": "printing", "filename": "cube.gcode"}
        }));
        merge_objects(&mut cached, &json!({"extruder": {"temperature": 214.5}}));

        assert_eq!(cached["extruder"]["temperature"], 214.5);
        assert_eq!(cached["extruder"]["target"], 215.0);
        assert_eq!(cached["print_stats"]["filename"], "cube.gcode");
    }

    #[test]
    fn test_normalize_printing() {
        let cached = objects(json!({
            "webhooks": {"state": "ready"},
            "print_stats": {"state": "printing", "filename": "cube.gcode", "print_duration": 300.0},
            "virtual_sdcard": {"progress": 0.25},
            "extruder": {"temperature": 214.5, "target": 215.0},
            "heater_bed": {"temperature": 59.8, "target": 60.0}
        }));
        let status = normalize_status(&cached);

        assert_eq!(status.state_text, "Printing");
        assert!(status.flags.printing && status.flags.operational);
        assert!(!status.flags.ready);
        assert_eq!(status.temperature("tool0").unwrap().actual, Some(214.5));
        assert_eq!(status.temperature("bed").unwrap().target, Some(60.0));

        let progress = status.progress.unwrap();
        assert_eq!(progress.completion, Some(25.0));
        assert_eq!(progress.print_time, Some(300));
        assert_eq!(progress.print_time_left, Some(900));
    }

    #[test]
    fn test_normalize_shutdown() {
        let cached = objects(json!({
            "webhooks": {"state": "shutdown"},
            "print_stats": {"state": "standby", "filename": ""}
        }));
        let status = normalize_status(&cached);

        assert_eq!(status.state_text, "Shutdown");
        assert!(status.flags.error);
        assert!(!status.flags.operational);
        assert!(status.progress.is_none());
    }

    #[test]
    fn test_file_entry_accepts_legacy_filename() {
        let entry = file_entry(&json!({"filename": "a.gcode", "size": 12, "modified": 1700000000.5}))
            .unwrap();
        assert_eq!(entry.path, "a.gcode");
        assert_eq!(entry.date, Some(1700000000));
        assert_eq!(rooted("/parts/a.gcode"), "gcodes/parts/a.gcode");
    }
}
