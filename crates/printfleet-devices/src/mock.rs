//! In-memory transports for tests.
//!
//! `MockConnector` stands in for a real connector. Every accepted open
//! yields a `MockPeer`, the device side of the session, which tests use to
//! push frames, observe what the adapter sent and drop the connection.

use crate::adapter::{AdapterError, AdapterResult};
use crate::transport::{InboundFrame, OutboundFrame, Transport, TransportConnector};
use async_trait::async_trait;
use parking_lot::Mutex;
use printfleet_core::LoginDto;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What the next `open` call does.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Accept,
    /// Fail with a connection error
    Refuse(String),
    /// Never complete; only the handshake timeout ends it
    Hang,
}

enum PeerEvent {
    Frame(InboundFrame),
    Close,
    Fail(String),
}

/// Scripted connector.
pub struct MockConnector {
    script: Mutex<VecDeque<MockOutcome>>,
    auto_pong: AtomicBool,
    opened: AtomicUsize,
    attempts: AtomicUsize,
    peers_tx: mpsc::UnboundedSender<MockPeer>,
    peers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockPeer>>,
}

impl MockConnector {
    /// Connector that accepts every open and answers pings.
    pub fn new() -> Arc<Self> {
        Self::with_script(Vec::new())
    }

    /// Connector that plays `script` first, then accepts.
    pub fn with_script(script: Vec<MockOutcome>) -> Arc<Self> {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            script: Mutex::new(script.into()),
            auto_pong: AtomicBool::new(true),
            opened: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
            peers_tx,
            peers_rx: tokio::sync::Mutex::new(peers_rx),
        })
    }

    /// Queue an outcome for a later open.
    pub fn push(&self, outcome: MockOutcome) {
        self.script.lock().push_back(outcome);
    }

    /// Whether new transports echo pings as pongs.
    pub fn set_auto_pong(&self, enabled: bool) {
        self.auto_pong.store(enabled, Ordering::SeqCst);
    }

    /// Successful opens so far.
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Open attempts so far, including refused ones.
    pub fn attempt_count(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Wait for the device side of the next accepted session.
    pub async fn next_peer(&self) -> Option<MockPeer> {
        self.peers_rx.lock().await.recv().await
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    async fn open(&self, _login: &LoginDto) -> AdapterResult<Box<dyn Transport>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .script
            .lock()
            .pop_front()
            .unwrap_or(MockOutcome::Accept);
        match outcome {
            MockOutcome::Accept => {}
            MockOutcome::Refuse(reason) => return Err(AdapterError::Connection(reason)),
            MockOutcome::Hang => std::future::pending::<()>().await,
        }

        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let transport = MockTransport {
            inbound,
            outbound,
            pongs: VecDeque::new(),
            auto_pong: self.auto_pong.load(Ordering::SeqCst),
            closed: closed.clone(),
        };
        let peer = MockPeer {
            to_client,
            from_client,
            closed,
        };

        self.opened.fetch_add(1, Ordering::SeqCst);
        let _ = self.peers_tx.send(peer);
        Ok(Box::new(transport))
    }
}

/// Client side of a mock session.
pub struct MockTransport {
    inbound: mpsc::UnboundedReceiver<PeerEvent>,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    pongs: VecDeque<Vec<u8>>,
    auto_pong: bool,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, frame: OutboundFrame) -> AdapterResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AdapterError::Connection("mock transport closed".into()));
        }
        if let (true, OutboundFrame::Ping(payload)) = (self.auto_pong, &frame) {
            self.pongs.push_back(payload.clone());
        }
        // The peer may have been dropped by the test
        let _ = self.outbound.send(frame);
        Ok(())
    }

    async fn recv(&mut self) -> Option<AdapterResult<InboundFrame>> {
        if let Some(payload) = self.pongs.pop_front() {
            return Some(Ok(InboundFrame::Pong(payload)));
        }
        match self.inbound.recv().await {
            Some(PeerEvent::Frame(frame)) => Some(Ok(frame)),
            Some(PeerEvent::Fail(reason)) => Some(Err(AdapterError::Connection(reason))),
            Some(PeerEvent::Close) | None => None,
        }
    }

    async fn close(&mut self) -> AdapterResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Device side of a mock session.
pub struct MockPeer {
    to_client: mpsc::UnboundedSender<PeerEvent>,
    from_client: mpsc::UnboundedReceiver<OutboundFrame>,
    closed: Arc<AtomicBool>,
}

impl MockPeer {
    /// Push a text frame to the adapter.
    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self
            .to_client
            .send(PeerEvent::Frame(InboundFrame::Text(text.into())));
    }

    pub fn send_json(&self, value: &Value) {
        self.send_text(value.to_string());
    }

    /// Push a pong frame to the adapter.
    pub fn send_pong(&self, payload: Vec<u8>) {
        let _ = self
            .to_client
            .send(PeerEvent::Frame(InboundFrame::Pong(payload)));
    }

    /// Close the session from the device side.
    pub fn close(&self) {
        let _ = self.to_client.send(PeerEvent::Close);
    }

    /// Fail the session with a transport error.
    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.to_client.send(PeerEvent::Fail(reason.into()));
    }

    /// Whether the adapter closed the session gracefully.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Next frame sent by the adapter.
    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        self.from_client.recv().await
    }

    /// Next text frame sent by the adapter, skipping pings.
    pub async fn recv_text(&mut self) -> Option<String> {
        loop {
            match self.from_client.recv().await? {
                OutboundFrame::Text(text) => return Some(text),
                OutboundFrame::Ping(_) => continue,
            }
        }
    }

    /// Next JSON message sent by the adapter, skipping pings.
    pub async fn recv_json(&mut self) -> Option<Value> {
        let text = self.recv_text().await?;
        serde_json::from_str(&text).ok()
    }

    /// Answer every JSON-RPC request with `respond(method, params)`.
    ///
    /// The peer moves into the task; the returned handle stops it on abort.
    /// A second sender is handed back so the test can still push frames or
    /// close the session.
    pub fn spawn_jsonrpc_responder<F>(mut self, respond: F) -> (MockPeerSender, JoinHandle<()>)
    where
        F: Fn(&str, &Value) -> Value + Send + 'static,
    {
        let sender = MockPeerSender {
            to_client: self.to_client.clone(),
            closed: self.closed.clone(),
        };
        let handle = tokio::spawn(async move {
            while let Some(request) = self.recv_json().await {
                let (Some(id), Some(method)) = (request.get("id"), request["method"].as_str())
                else {
                    continue;
                };
                let params = request.get("params").cloned().unwrap_or(Value::Null);
                let result = respond(method, &params);
                self.send_json(&json!({"jsonrpc": "2.0", "id": id, "result": result}));
            }
        });
        (sender, handle)
    }
}

/// Write-only view of a peer whose reader moved into a responder task.
#[derive(Clone)]
pub struct MockPeerSender {
    to_client: mpsc::UnboundedSender<PeerEvent>,
    closed: Arc<AtomicBool>,
}

impl MockPeerSender {
    pub fn send_json(&self, value: &Value) {
        let _ = self
            .to_client
            .send(PeerEvent::Frame(InboundFrame::Text(value.to_string())));
    }

    pub fn close(&self) {
        let _ = self.to_client.send(PeerEvent::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
