//! OctoPrint adapter.
//!
//! Commands go over the REST API with `X-Api-Key`. Live status arrives on
//! the push socket at `/sockjs/websocket`, which is authenticated with a
//! passive login session right after it opens.

use super::rest::{encode_path, json_body, split_parent, RestClient};
use crate::adapter::{
    AdapterError, AdapterResult, Axis, FileEntry, FileUpload, JogCommand, PrinterAdapter,
    ReprintState,
};
use crate::context::PrinterContext;
use crate::link::{FrameHandler, LinkOptions, SessionHandle, TransportLink};
use crate::transport::{TransportConnector, WsConnector};
use async_trait::async_trait;
use bytes::Bytes;
use printfleet_core::{
    ApiState, ConnectionState, JobProgress, LoginDto, PrinterProtocol, PrinterStatus,
    SharedEventBus, SharedSettings, StatusFlags, SubState,
};
use reqwest::multipart::{Form, Part};
use reqwest::Method;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, trace};

/// Push socket path.
pub const SOCKET_PATH: &str = "/sockjs/websocket";

/// OctoPrint printer adapter.
pub struct OctoprintAdapter {
    ctx: Arc<PrinterContext>,
    link: Arc<TransportLink>,
    rest: Arc<RestClient>,
}

impl OctoprintAdapter {
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

    /// Use a custom connector for the push socket.
    pub fn with_connector(
        device_id: impl Into<String>,
        bus: SharedEventBus,
        settings: SharedSettings,
        connector: Arc<dyn TransportConnector>,
    ) -> AdapterResult<Self> {
        let ctx = PrinterContext::new(device_id, PrinterProtocol::Octoprint, bus, settings);
        let rest = Arc::new(RestClient::new(ctx.clone())?);
        let handler = Arc::new(OctoprintHandler {
            ctx: ctx.clone(),
            rest: rest.clone(),
        });
        let link = TransportLink::new(
            ctx.clone(),
            connector,
            handler,
            LinkOptions { heartbeat: true },
        );
        Ok(Self { ctx, link, rest })
    }

    async fn job_command(&self, body: Value) -> AdapterResult<()> {
        self.ctx.require_connected()?;
        self.rest.post_json("/api/job", &body).await?;
        Ok(())
    }

    async fn printhead(&self, body: Value) -> AdapterResult<()> {
        self.ctx.require_connected()?;
        self.rest.post_json("/api/printer/printhead", &body).await?;
        Ok(())
    }
}

struct OctoprintHandler {
    ctx: Arc<PrinterContext>,
    rest: Arc<RestClient>,
}

#[async_trait]
impl FrameHandler for OctoprintHandler {
    async fn on_open(&self, session: &SessionHandle) -> AdapterResult<()> {
        let login = self
            .rest
            .post_json("/api/login", &json!({ "passive": true }))
            .await?;
        let name = login["name"].as_str().unwrap_or_default();
        let token = login["session"]
            .as_str()
            .ok_or_else(|| AdapterError::Protocol("login response carries no session".into()))?;
        session.send_json(&json!({ "auth": format!("{}:{}", name, token) }))?;
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
        let Some(object) = message.as_object() else {
            return;
        };
        for (kind, payload) in object {
            match kind.as_str() {
                "current" | "history" => {
                    if let Some(status) = normalize_current(payload) {
                        self.ctx.publish_status(status);
                    }
                }
                "event" => {
                    trace!(device_id = %self.ctx.device_id, event = %payload["type"], "Printer event");
                }
                "connected" => {
                    debug!(device_id = %self.ctx.device_id, version = %payload["version"], "Push socket ready");
                }
                _ => {}
            }
        }
    }

    fn on_closed(&self, _reason: &str) {}
}

/// Fold a `current` / `history` push message into a status.
pub fn normalize_current(payload: &Value) -> Option<PrinterStatus> {
    let state = payload.get("state")?;
    let flags = &state["flags"];
    let flag = |name: &str| flags[name].as_bool().unwrap_or(false);

    let mut status = PrinterStatus::new(state["text"].as_str().unwrap_or("Unknown"));
    status.flags = StatusFlags {
        connected: !flag("closedOrError"),
        operational: flag("operational"),
        printing: flag("printing"),
        paused: flag("paused") || flag("pausing"),
        error: flag("error"),
        ready: flag("ready"),
    };

    // `temps` holds a history; the newest sample is last
    if let Some(sample) = payload["temps"].as_array().and_then(|temps| temps.last()) {
        if let Some(heaters) = sample.as_object() {
            for (name, reading) in heaters {
                if name == "time" {
                    continue;
                }
                status = status.with_temperature(
                    name.clone(),
                    reading["actual"].as_f64(),
                    reading["target"].as_f64(),
                );
            }
        }
    }

    let progress = &payload["progress"];
    let file = &payload["job"]["file"];
    if progress.is_object() || file.is_object() {
        status.progress = Some(JobProgress {
            file_name: file["path"]
                .as_str()
                .or_else(|| file["name"].as_str())
                .map(str::to_string),
            completion: progress["completion"].as_f64(),
            print_time: progress["printTime"].as_u64(),
            print_time_left: progress["printTimeLeft"].as_u64(),
        });
    }
    Some(status)
}

fn file_entry(value: &Value) -> Option<FileEntry> {
    Some(FileEntry {
        path: value["path"].as_str().or_else(|| value["name"].as_str())?.to_string(),
        size: value["size"].as_u64(),
        date: value["date"].as_i64(),
    })
}

/// Flatten a recursive file listing, skipping folders.
pub fn flatten_files(files: &[Value], out: &mut Vec<FileEntry>) {
    for item in files {
        if item["type"] == "folder" {
            if let Some(children) = item["children"].as_array() {
                flatten_files(children, out);
            }
        } else if let Some(entry) = file_entry(item) {
            out.push(entry);
        }
    }
}

#[async_trait]
impl PrinterAdapter for OctoprintAdapter {
    fn protocol(&self) -> PrinterProtocol {
        PrinterProtocol::Octoprint
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
        let version = self.rest.get_json("/api/version").await?;
        version["server"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| AdapterError::Protocol("version response carries no server field".into()))
    }

    async fn restart_server(&self) -> AdapterResult<()> {
        self.rest
            .post_empty("/api/system/commands/core/restart")
            .await
    }

    async fn restart_host(&self) -> AdapterResult<()> {
        self.rest.post_empty("/api/system/commands/core/reboot").await
    }

    async fn restart_firmware(&self) -> AdapterResult<()> {
        Err(AdapterError::NotImplemented("restart_firmware"))
    }

    async fn start_print(&self, path: &str) -> AdapterResult<()> {
        self.ctx.require_connected()?;
        self.rest
            .post_json(
                &format!("/api/files/local/{}", encode_path(path)),
                &json!({ "command": "select", "print": true }),
            )
            .await?;
        Ok(())
    }

    async fn pause_print(&self) -> AdapterResult<()> {
        self.job_command(json!({ "command": "pause", "action": "pause" }))
            .await
    }

    async fn resume_print(&self) -> AdapterResult<()> {
        self.job_command(json!({ "command": "pause", "action": "resume" }))
            .await
    }

    async fn cancel_print(&self) -> AdapterResult<()> {
        self.job_command(json!({ "command": "cancel" })).await
    }

    async fn send_gcode(&self, lines: &[String]) -> AdapterResult<()> {
        self.ctx.require_connected()?;
        self.rest
            .post_json("/api/printer/command", &json!({ "commands": lines }))
            .await?;
        Ok(())
    }

    async fn jog(&self, command: JogCommand) -> AdapterResult<()> {
        let mut body = json!({
            "command": "jog",
            "x": command.x,
            "y": command.y,
            "z": command.z,
        });
        if let Some(speed) = command.speed {
            body["speed"] = json!(speed);
        }
        self.printhead(body).await
    }

    async fn home(&self, axes: &[Axis]) -> AdapterResult<()> {
        let axes: Vec<&str> = if axes.is_empty() {
            vec!["x", "y", "z"]
        } else {
            axes.iter().map(Axis::as_str).collect()
        };
        self.printhead(json!({ "command": "home", "axes": axes })).await
    }

    async fn list_files(&self) -> AdapterResult<Vec<FileEntry>> {
        let listing = self.rest.get_json("/api/files/local?recursive=true").await?;
        let mut files = Vec::new();
        if let Some(items) = listing["files"].as_array() {
            flatten_files(items, &mut files);
        }
        Ok(files)
    }

    async fn get_file(&self, path: &str) -> AdapterResult<FileEntry> {
        let value = self
            .rest
            .get_json(&format!("/api/files/local/{}", encode_path(path)))
            .await?;
        file_entry(&value)
            .ok_or_else(|| AdapterError::Protocol(format!("no file information for {}", path)))
    }

    async fn upload_file(&self, upload: FileUpload) -> AdapterResult<()> {
        let (folder, name) = split_parent(&upload.file_name);
        let length = upload.source.len();
        let part = Part::stream_with_length(upload.source.into_body(), length)
            .file_name(name.to_string());
        let mut form = Form::new().part("file", part);
        if !folder.is_empty() {
            form = form.text("path", folder.to_string());
        }
        if upload.start_print {
            form = form.text("select", "true").text("print", "true");
        }
        let builder = self
            .rest
            .transfer(Method::POST, "/api/files/local")?
            .multipart(form);
        self.rest.send(builder).await?;
        Ok(())
    }

    async fn download_file(&self, path: &str) -> AdapterResult<Bytes> {
        let builder = self.rest.transfer(
            Method::GET,
            &format!("/downloads/files/local/{}", encode_path(path)),
        )?;
        Ok(self.rest.send(builder).await?.bytes().await?)
    }

    async fn delete_file(&self, path: &str) -> AdapterResult<()> {
        self.rest
            .delete(&format!("/api/files/local/{}", encode_path(path)))
            .await
    }

    async fn create_folder(&self, path: &str) -> AdapterResult<()> {
        let (parent, name) = split_parent(path);
        let mut form = Form::new().text("foldername", name.to_string());
        if !parent.is_empty() {
            form = form.text("path", parent.to_string());
        }
        let builder = self
            .rest
            .request(Method::POST, "/api/files/local")?
            .multipart(form);
        json_body(self.rest.send(builder).await?).await?;
        Ok(())
    }

    async fn delete_folder(&self, path: &str) -> AdapterResult<()> {
        self.delete_file(path).await
    }

    async fn get_settings(&self) -> AdapterResult<Value> {
        self.rest.get_json("/api/settings").await
    }

    async fn reprint_state(&self) -> AdapterResult<ReprintState> {
        let state = self.ctx.connection_state();
        if state != ConnectionState::Connected {
            return Ok(ReprintState::not_available(state));
        }
        let job = self.rest.get_json("/api/job").await?;
        let file = &job["job"]["file"];
        match file_entry(file) {
            Some(entry) => Ok(ReprintState::ready(entry, state)),
            None => Ok(ReprintState::no_last_print(state)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_current() {
        let payload = json!({
            "state": {
                "text": "Printing",
                "flags": {"operational": true, "printing": true, "paused": false, "ready": false, "closedOrError": false}
            },
            "job": {"file": {"name": "benchy.gcode", "path": "parts/benchy.gcode"}},
            "progress": {"completion": 42.5, "printTime": 600, "printTimeLeft": 800},
            "temps": [
                {"time": 1, "tool0": {"actual": 180.0, "target": 215.0}},
                {"time": 2, "tool0": {"actual": 214.8, "target": 215.0}, "bed": {"actual": 60.1, "target": 60.0}}
            ]
        });
        let status = normalize_current(&payload).unwrap();
        assert_eq!(status.state_text, "Printing");
        assert!(status.flags.printing && status.flags.connected);
        assert_eq!(status.temperature("tool0").unwrap().actual, Some(214.8));
        assert_eq!(status.temperature("bed").unwrap().target, Some(60.0));
        assert_eq!(status.job_file(), Some("parts/benchy.gcode"));
        assert_eq!(status.progress.unwrap().print_time_left, Some(800));
    }

    #[test]
    fn test_normalize_without_state_is_none() {
        assert!(normalize_current(&json!({"logs": []})).is_none());
    }

    #[test]
    fn test_flatten_files() {
        let files = vec![
            json!({"name": "a.gcode", "path": "a.gcode", "type": "machinecode", "size": 10, "date": 1700000000}),
            json!({"name": "parts", "path": "parts", "type": "folder", "children": [
                {"name": "b.gcode", "path": "parts/b.gcode", "type": "machinecode", "size": 5}
            ]}),
        ];
        let mut out = Vec::new();
        flatten_files(&files, &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].path, "parts/b.gcode");
        assert_eq!(out[1].date, None);
    }
}
