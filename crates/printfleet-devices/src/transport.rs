//! Stateful transports (WebSocket and MQTT) behind one small interface.
//!
//! A [`TransportConnector`] opens a [`Transport`] for a login; the link layer
//! owns the transport exclusively and drives it from a single task. Tests
//! substitute the connector (see [`crate::mock`]).

use crate::adapter::{AdapterError, AdapterResult};
use crate::tls::lan_client_config;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use printfleet_core::LoginDto;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport as MqttWire};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Frame received from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    /// Transport-level pong carrying the probe payload
    Pong(Vec<u8>),
}

/// Frame sent to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    /// Transport-level ping carrying a heartbeat sequence number
    Ping(Vec<u8>),
}

/// An open, bidirectional device session.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: OutboundFrame) -> AdapterResult<()>;

    /// Next frame. `None` once the peer has closed the session.
    ///
    /// Must be cancel safe: the link drops pending calls in `select!`.
    async fn recv(&mut self) -> Option<AdapterResult<InboundFrame>>;

    /// Graceful close.
    async fn close(&mut self) -> AdapterResult<()>;
}

/// Opens transports for a login.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Reject logins this connector could never open, before any attempt.
    fn validate(&self, _login: &LoginDto) -> AdapterResult<()> {
        Ok(())
    }

    async fn open(&self, login: &LoginDto) -> AdapterResult<Box<dyn Transport>>;
}

/// Encode a heartbeat sequence number as a ping payload.
pub fn encode_seq(seq: u64) -> Vec<u8> {
    seq.to_string().into_bytes()
}

/// Decode a pong payload back into a sequence number.
pub fn decode_seq(payload: &[u8]) -> Option<u64> {
    std::str::from_utf8(payload).ok()?.trim().parse().ok()
}

/// Turn an `http(s)://` base URL into the `ws(s)://` URL for `path`.
pub fn ws_url(base: &str, path: &str) -> AdapterResult<String> {
    let base = base.trim().trim_end_matches('/');
    let rest = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else if base.contains("://") {
        return Err(AdapterError::Configuration(format!(
            "unsupported URL scheme: {}",
            base
        )));
    } else {
        format!("ws://{}", base)
    };
    Ok(format!("{}{}", rest, path))
}

// ============================================================================
// WebSocket
// ============================================================================

/// Opens WebSocket sessions at a fixed path below the printer URL.
pub struct WsConnector {
    path: &'static str,
    send_api_key: bool,
}

impl WsConnector {
    pub fn new(path: &'static str) -> Self {
        Self {
            path,
            send_api_key: false,
        }
    }

    /// Send the login's API key as `X-Api-Key` during the upgrade.
    pub fn with_api_key_header(mut self) -> Self {
        self.send_api_key = true;
        self
    }
}

#[async_trait]
impl TransportConnector for WsConnector {
    fn validate(&self, login: &LoginDto) -> AdapterResult<()> {
        ws_url(&login.printer_url, self.path).map(|_| ())
    }

    async fn open(&self, login: &LoginDto) -> AdapterResult<Box<dyn Transport>> {
        let url = ws_url(&login.printer_url, self.path)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| AdapterError::Configuration(format!("invalid URL {}: {}", url, e)))?;
        if self.send_api_key {
            if let Some(key) = login.api_key.as_deref() {
                let value = HeaderValue::from_str(key)
                    .map_err(|_| AdapterError::Configuration("api key is not a valid header".into()))?;
                request.headers_mut().insert("X-Api-Key", value);
            }
        }

        debug!("Opening WebSocket {}", url);
        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| AdapterError::Connection(format!("WebSocket connect failed: {}", e)))?;
        Ok(Box::new(WsTransport { stream }))
    }
}

struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, frame: OutboundFrame) -> AdapterResult<()> {
        let message = match frame {
            OutboundFrame::Text(text) => Message::Text(text),
            OutboundFrame::Ping(payload) => Message::Ping(payload),
        };
        self.stream
            .send(message)
            .await
            .map_err(|e| AdapterError::Connection(format!("WebSocket send failed: {}", e)))
    }

    async fn recv(&mut self) -> Option<AdapterResult<InboundFrame>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(InboundFrame::Text(text))),
                Ok(Message::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => return Some(Ok(InboundFrame::Text(text))),
                    Err(_) => debug!("Dropping non-UTF-8 binary frame"),
                },
                Ok(Message::Pong(payload)) => return Some(Ok(InboundFrame::Pong(payload))),
                // tungstenite queues the pong reply itself
                Ok(Message::Ping(_)) | Ok(Message::Frame(_)) => continue,
                Ok(Message::Close(frame)) => {
                    debug!("WebSocket closed by peer: {:?}", frame);
                    return None;
                }
                Err(e) => {
                    return Some(Err(AdapterError::Connection(format!(
                        "WebSocket error: {}",
                        e
                    ))))
                }
            }
        }
    }

    async fn close(&mut self) -> AdapterResult<()> {
        self.stream
            .close(None)
            .await
            .map_err(|e| AdapterError::Connection(format!("WebSocket close failed: {}", e)))
    }
}

// ============================================================================
// MQTT
// ============================================================================

/// TLS port of the Bambu LAN broker.
pub const BAMBU_MQTT_PORT: u16 = 8883;
/// Fixed LAN-mode user name.
pub const BAMBU_USER: &str = "bblp";

/// Opens MQTT sessions to a Bambu printer's LAN broker.
///
/// Text frames sent through the transport are published to
/// `device/{serial}/request`; reports from `device/{serial}/report` arrive
/// as text frames.
pub struct MqttConnector {
    keep_alive: Duration,
    port: u16,
}

impl MqttConnector {
    pub fn new() -> Self {
        Self {
            keep_alive: Duration::from_secs(30),
            port: BAMBU_MQTT_PORT,
        }
    }

    /// Broker port other than [`BAMBU_MQTT_PORT`].
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

impl Default for MqttConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportConnector for MqttConnector {
    async fn open(&self, login: &LoginDto) -> AdapterResult<Box<dyn Transport>> {
        let serial = login
            .serial
            .clone()
            .ok_or_else(|| AdapterError::Configuration("serial is required".into()))?;
        let access_code = login
            .access_code
            .clone()
            .ok_or_else(|| AdapterError::Configuration("access code is required".into()))?;
        let host = bambu_host(&login.printer_url);

        let client_id = format!("printfleet_{}", rand::random::<u32>());
        let mut options = MqttOptions::new(client_id, host, self.port);
        options.set_credentials(BAMBU_USER, access_code);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        options.set_transport(MqttWire::tls_with_config(TlsConfiguration::Rustls(
            lan_client_config(),
        )));

        let (client, mut event_loop) = AsyncClient::new(options, 100);

        // Wait for the broker to accept the session
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => break,
                Ok(_) => continue,
                Err(e) => {
                    return Err(AdapterError::Connection(format!(
                        "MQTT connect failed: {}",
                        e
                    )))
                }
            }
        }

        let report_topic = format!("device/{}/report", serial);
        client
            .subscribe(&report_topic, QoS::AtMostOnce)
            .await
            .map_err(|e| AdapterError::Connection(format!("MQTT subscribe failed: {}", e)))?;

        // The event loop must be polled continuously; a pump task forwards
        // reports into a channel so `recv` stays cancel safe.
        let (tx, rx) = mpsc::channel(64);
        let pump = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if publish.topic != report_topic {
                            continue;
                        }
                        let frame = match String::from_utf8(publish.payload.to_vec()) {
                            Ok(text) => Ok(InboundFrame::Text(text)),
                            Err(_) => {
                                debug!("Dropping non-UTF-8 MQTT payload");
                                continue;
                            }
                        };
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        let _ = tx
                            .send(Err(AdapterError::Connection(format!("MQTT error: {}", e))))
                            .await;
                        break;
                    }
                }
            }
        });

        Ok(Box::new(MqttTransport {
            client,
            request_topic: format!("device/{}/request", serial),
            rx,
            pump,
        }))
    }
}

/// Host part of a Bambu printer address (`host`, `host:port` or a URL).
pub fn bambu_host(printer_url: &str) -> String {
    let trimmed = printer_url.trim();
    let without_scheme = trimmed
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(trimmed);
    let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
    authority
        .rsplit_once(':')
        .filter(|(_, port)| port.chars().all(|c| c.is_ascii_digit()))
        .map(|(host, _)| host)
        .unwrap_or(authority)
        .to_string()
}

struct MqttTransport {
    client: AsyncClient,
    request_topic: String,
    rx: mpsc::Receiver<AdapterResult<InboundFrame>>,
    pump: JoinHandle<()>,
}

#[async_trait]
impl Transport for MqttTransport {
    async fn send(&mut self, frame: OutboundFrame) -> AdapterResult<()> {
        match frame {
            OutboundFrame::Text(payload) => self
                .client
                .publish(&self.request_topic, QoS::AtMostOnce, false, payload)
                .await
                .map_err(|e| AdapterError::Connection(format!("MQTT publish failed: {}", e))),
            // MQTT keep-alive covers liveness
            OutboundFrame::Ping(_) => Ok(()),
        }
    }

    async fn recv(&mut self) -> Option<AdapterResult<InboundFrame>> {
        self.rx.recv().await
    }

    async fn close(&mut self) -> AdapterResult<()> {
        let result = self.client.disconnect().await;
        self.pump.abort();
        if let Err(e) = result {
            warn!("MQTT disconnect failed: {}", e);
        }
        Ok(())
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_url() {
        assert_eq!(
            ws_url("http://octopi.local/", "/sockjs/websocket").unwrap(),
            "ws://octopi.local/sockjs/websocket"
        );
        assert_eq!(
            ws_url("https://voron:7125", "/websocket").unwrap(),
            "wss://voron:7125/websocket"
        );
        assert_eq!(ws_url("10.0.0.5", "/websocket").unwrap(), "ws://10.0.0.5/websocket");
        assert!(ws_url("ftp://x", "/").is_err());
    }

    #[test]
    fn test_seq_payload() {
        assert_eq!(decode_seq(&encode_seq(999_999)), Some(999_999));
        assert_eq!(decode_seq(b"nope"), None);
    }

    #[test]
    fn test_bambu_host() {
        assert_eq!(bambu_host("192.168.1.40"), "192.168.1.40");
        assert_eq!(bambu_host("mqtts://x1c.lan:8883"), "x1c.lan");
        assert_eq!(bambu_host("http://x1c.lan/"), "x1c.lan");
    }
}
