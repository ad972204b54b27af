//! Session driver for stateful protocols.
//!
//! `TransportLink` ties a [`TransportConnector`] to the connection state
//! machine, the reconnection manager and the heartbeat monitor. Protocol
//! specifics plug in through [`FrameHandler`].
//!
//! Connect, disconnect and every loss/retry path take the same operation
//! lock, so transitions for one printer never interleave. Each session gets
//! an epoch; late notifications from an older session are ignored.

use crate::adapter::{AdapterError, AdapterResult};
use crate::context::PrinterContext;
use crate::heartbeat::HeartbeatMonitor;
use crate::reconnect::{handshake, ReconnectionManager};
use crate::transport::{decode_seq, encode_seq, InboundFrame, OutboundFrame, Transport, TransportConnector};
use async_trait::async_trait;
use printfleet_core::{ApiState, ConnectionState, LifecycleKind, LoginDto, SocketState};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Protocol hooks invoked by the link.
#[async_trait]
pub trait FrameHandler: Send + Sync + 'static {
    /// Runs right after the transport opens, inside the handshake timeout.
    ///
    /// Authentication and subscriptions go here. An error fails the
    /// handshake.
    async fn on_open(&self, session: &SessionHandle) -> AdapterResult<()>;

    /// Text frame from the device.
    ///
    /// Runs on the session task: it may send through `session` but must not
    /// wait for a reply.
    async fn on_text(&self, session: &SessionHandle, text: String);

    /// The session ended, on purpose or not.
    fn on_closed(&self, reason: &str);
}

enum Command {
    Frame(OutboundFrame),
    Close(oneshot::Sender<()>),
}

/// Cheap handle for writing to the current session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    epoch: u64,
}

impl SessionHandle {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn send(&self, frame: OutboundFrame) -> AdapterResult<()> {
        self.commands
            .send(Command::Frame(frame))
            .map_err(|_| AdapterError::NotConnected)
    }

    pub fn send_text(&self, text: impl Into<String>) -> AdapterResult<()> {
        self.send(OutboundFrame::Text(text.into()))
    }

    pub fn send_json(&self, value: &serde_json::Value) -> AdapterResult<()> {
        self.send_text(value.to_string())
    }

    /// Whether the session task is still alive.
    pub fn is_open(&self) -> bool {
        !self.commands.is_closed()
    }
}

struct Session {
    handle: SessionHandle,
    task: JoinHandle<()>,
}

/// Link options per protocol.
#[derive(Debug, Clone, Copy)]
pub struct LinkOptions {
    /// Probe liveness with transport pings
    pub heartbeat: bool,
}

/// Drives one printer's transport session.
pub struct TransportLink {
    ctx: Arc<PrinterContext>,
    connector: Arc<dyn TransportConnector>,
    handler: Arc<dyn FrameHandler>,
    options: LinkOptions,
    op_lock: tokio::sync::Mutex<()>,
    session: parking_lot::Mutex<Option<Session>>,
    epoch: AtomicU64,
    reconnect: ReconnectionManager,
    heartbeat: HeartbeatMonitor,
}

impl TransportLink {
    pub fn new(
        ctx: Arc<PrinterContext>,
        connector: Arc<dyn TransportConnector>,
        handler: Arc<dyn FrameHandler>,
        options: LinkOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            reconnect: ReconnectionManager::new(ctx.device_id.clone()),
            heartbeat: HeartbeatMonitor::new(ctx.device_id.clone()),
            ctx,
            connector,
            handler,
            options,
            op_lock: tokio::sync::Mutex::new(()),
            session: parking_lot::Mutex::new(None),
            epoch: AtomicU64::new(0),
        })
    }

    pub fn context(&self) -> &Arc<PrinterContext> {
        &self.ctx
    }

    /// Handle to the live session, if any.
    pub fn session(&self) -> Option<SessionHandle> {
        self.session.lock().as_ref().map(|s| s.handle.clone())
    }

    /// Handle to the live session, or `NotConnected`.
    pub fn require_session(&self) -> AdapterResult<SessionHandle> {
        self.ctx.require_connected()?;
        self.session().ok_or(AdapterError::NotConnected)
    }

    pub fn is_retrying(&self) -> bool {
        self.reconnect.is_retrying()
    }

    /// Open a session with `login`.
    ///
    /// Missing credentials and unusable addresses fail here. A failed
    /// handshake moves to `Reconnecting` and returns `Ok`.
    pub async fn connect(self: &Arc<Self>, login: LoginDto) -> AdapterResult<()> {
        login.validate()?;
        self.connector.validate(&login)?;

        let _guard = self.op_lock.lock().await;
        let state = self.ctx.connection_state();
        if state != ConnectionState::Disconnected {
            return Err(AdapterError::AlreadyConnected(state));
        }

        self.ctx.store_login(login);
        self.ctx.state.transition(ConnectionState::Connecting)?;

        match self.establish().await {
            Ok(()) => {
                self.ctx.state.transition(ConnectionState::Connected)?;
                self.start_heartbeat();
                info!(device_id = %self.ctx.device_id, "Connected");
            }
            Err(e) => {
                warn!(device_id = %self.ctx.device_id, "Handshake failed: {}", e);
                self.ctx
                    .emitter
                    .lifecycle(LifecycleKind::HandshakeFailed, e.to_string());
                self.ctx.state.transition(ConnectionState::Reconnecting)?;
                self.schedule_reconnect();
            }
        }
        Ok(())
    }

    /// Close the session and cancel every timer. No-op when disconnected.
    pub async fn disconnect(&self) -> AdapterResult<()> {
        let _guard = self.op_lock.lock().await;
        self.reconnect.clear();
        self.heartbeat.stop();

        let session = self.take_session(None);
        let had_session = session.is_some();
        if let Some(session) = session {
            self.close_session(session).await;
            self.handler.on_closed("disconnect requested");
            self.ctx.set_socket_state(SocketState::Closed);
        }

        if self.ctx.connection_state() != ConnectionState::Disconnected {
            self.ctx.state.try_transition(ConnectionState::Disconnected);
            if had_session {
                self.ctx
                    .emitter
                    .lifecycle(LifecycleKind::Closed, "disconnect requested");
            }
            info!(device_id = %self.ctx.device_id, "Disconnected");
        }
        Ok(())
    }

    /// Close any session and connect again with `login`.
    pub async fn reconnect(self: &Arc<Self>, login: LoginDto) -> AdapterResult<()> {
        if let Err(e) = self.disconnect().await {
            debug!(device_id = %self.ctx.device_id, "Disconnect before reconnect failed: {}", e);
        }
        self.connect(login).await
    }

    /// Swap credentials. A live or retrying session is rebuilt with them.
    pub async fn update_login(self: &Arc<Self>, login: LoginDto) -> AdapterResult<()> {
        login.validate()?;
        if self.ctx.connection_state() == ConnectionState::Disconnected {
            self.ctx.store_login(login);
            return Ok(());
        }
        self.reconnect(login).await
    }

    /// Open the transport, start the session task and run the handler's
    /// opening exchange, all bounded by the handshake timeout.
    async fn establish(self: &Arc<Self>) -> AdapterResult<()> {
        let login = self.ctx.login()?;
        let timeout = self.ctx.settings.read(|s| s.handshake_timeout());
        self.ctx.set_socket_state(SocketState::Opening);

        let result = handshake(timeout, async {
            let transport = self.connector.open(&login).await?;
            let session = self.install_session(transport);
            self.ctx.set_socket_state(SocketState::Authenticating);
            self.handler.on_open(&session).await
        })
        .await;

        match result {
            Ok(()) => {
                self.ctx.set_socket_state(SocketState::Opened);
                Ok(())
            }
            Err(e) => {
                if let Some(session) = self.take_session(None) {
                    session.task.abort();
                    self.handler.on_closed(&e.to_string());
                }
                self.ctx.set_socket_state(SocketState::Error);
                self.ctx.set_api_state(e.api_state());
                Err(e)
            }
        }
    }

    fn install_session(self: &Arc<Self>, mut transport: Box<dyn Transport>) -> SessionHandle {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            commands: tx,
            epoch,
        };

        let link = Arc::downgrade(self);
        let handler = self.handler.clone();
        let task_handle = handle.clone();
        let device_id = self.ctx.device_id.clone();

        let task = tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    command = rx.recv() => match command {
                        Some(Command::Frame(frame)) => {
                            if let Err(e) = transport.send(frame).await {
                                break e.to_string();
                            }
                        }
                        Some(Command::Close(ack)) => {
                            if let Err(e) = transport.close().await {
                                debug!(device_id = %device_id, "Close failed: {}", e);
                            }
                            let _ = ack.send(());
                            return;
                        }
                        None => {
                            let _ = transport.close().await;
                            return;
                        }
                    },
                    frame = transport.recv() => match frame {
                        Some(Ok(InboundFrame::Text(text))) => {
                            handler.on_text(&task_handle, text).await;
                        }
                        Some(Ok(InboundFrame::Pong(payload))) => {
                            match (decode_seq(&payload), link.upgrade()) {
                                (Some(seq), Some(link)) => link.heartbeat.on_pong(seq),
                                (None, _) => debug!(device_id = %device_id, "Pong without sequence"),
                                _ => {}
                            }
                        }
                        Some(Err(e)) => break e.to_string(),
                        None => break "closed by peer".to_string(),
                    },
                }
            };
            debug!(device_id = %device_id, epoch, "Session ended: {}", reason);
            if let Some(link) = link.upgrade() {
                link.spawn_loss(epoch, LifecycleKind::TransportLost, reason);
            }
        });

        *self.session.lock() = Some(Session {
            handle: handle.clone(),
            task,
        });
        handle
    }

    /// Take the current session, optionally only if it has `epoch`.
    fn take_session(&self, epoch: Option<u64>) -> Option<Session> {
        let mut guard = self.session.lock();
        match (guard.as_ref(), epoch) {
            (Some(s), Some(epoch)) if s.handle.epoch != epoch => None,
            _ => guard.take(),
        }
    }

    /// Ask the session task to close gracefully; abort it after the close
    /// timeout.
    async fn close_session(&self, session: Session) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if session.handle.commands.send(Command::Close(ack_tx)).is_ok() {
            let timeout = self.ctx.settings.read(|s| s.close_timeout());
            if tokio::time::timeout(timeout, ack_rx).await.is_err() {
                warn!(device_id = %self.ctx.device_id, "Graceful close timed out, aborting session");
            }
        }
        session.task.abort();
    }

    fn spawn_loss(self: &Arc<Self>, epoch: u64, kind: LifecycleKind, reason: String) {
        let link = self.clone();
        tokio::spawn(async move {
            let _guard = link.op_lock.lock().await;
            link.handle_loss(epoch, kind, reason).await;
        });
    }

    /// Runs once per lost session, under the operation lock.
    async fn handle_loss(self: &Arc<Self>, epoch: u64, kind: LifecycleKind, reason: String) {
        let Some(session) = self.take_session(Some(epoch)) else {
            debug!(device_id = %self.ctx.device_id, epoch, "Stale loss notification");
            return;
        };

        warn!(device_id = %self.ctx.device_id, kind = kind.as_str(), "Session lost: {}", reason);
        let monitored = self.heartbeat.is_running();
        self.heartbeat.stop();
        self.close_session(session).await;
        self.handler.on_closed(&reason);
        self.ctx.set_socket_state(SocketState::Closed);
        self.ctx.set_api_state(ApiState::NoResponse);
        // A dropped session also ends liveness: one heartbeat failure per
        // session, whether the probe timed out or the peer went away
        if monitored && kind != LifecycleKind::HeartbeatFailed {
            self.ctx.emitter.lifecycle(kind, reason.clone());
            self.ctx.emitter.lifecycle(LifecycleKind::HeartbeatFailed, reason);
        } else {
            self.ctx.emitter.lifecycle(kind, reason);
        }

        if self
            .ctx
            .state
            .transition_from(ConnectionState::Connected, ConnectionState::Reconnecting)
        {
            self.schedule_reconnect();
        }
    }

    fn start_heartbeat(self: &Arc<Self>) {
        if !self.options.heartbeat {
            return;
        }
        let Some(session) = self.session() else {
            return;
        };
        let (interval, timeout) = self
            .ctx
            .settings
            .read(|s| (s.heartbeat_interval(), s.heartbeat_timeout()));

        let probe_handle = session.clone();
        let epoch = session.epoch;
        let link = Arc::downgrade(self);
        let started = self.heartbeat.start(
            interval,
            timeout,
            move |seq| {
                if probe_handle.send(OutboundFrame::Ping(encode_seq(seq))).is_err() {
                    debug!("Heartbeat probe dropped, session closed");
                }
            },
            move |reason| {
                if let Some(link) = link.upgrade() {
                    link.spawn_loss(epoch, LifecycleKind::HeartbeatFailed, reason);
                }
            },
        );
        if let Err(e) = started {
            warn!(device_id = %self.ctx.device_id, "{}", e);
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let settings = self.ctx.settings.clone();
        let link: Weak<Self> = Arc::downgrade(self);
        self.reconnect.schedule(
            move || settings.read(|s| s.reconnect_interval()),
            move || {
                let link = link.clone();
                async move {
                    match link.upgrade() {
                        Some(link) => link.retry_once().await,
                        None => true,
                    }
                }
            },
        );
    }

    /// One retry attempt. Returns `true` when the loop should stop.
    async fn retry_once(self: &Arc<Self>) -> bool {
        let _guard = self.op_lock.lock().await;
        if self.ctx.connection_state() != ConnectionState::Reconnecting {
            return true;
        }
        match self.establish().await {
            Ok(()) => {
                self.reconnect.finish();
                self.ctx.state.try_transition(ConnectionState::Connected);
                self.start_heartbeat();
                info!(device_id = %self.ctx.device_id, "Reconnected");
                true
            }
            Err(e) => {
                debug!(device_id = %self.ctx.device_id, "Reconnect attempt failed: {}", e);
                false
            }
        }
    }
}

impl Drop for TransportLink {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.task.abort();
        }
    }
}
