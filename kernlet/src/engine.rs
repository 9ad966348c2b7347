//! Connection engine: the single task that owns a client's connection.
//!
//! Every mutation of connection state happens here, in the order events are
//! posted to the engine's queue. Client calls, socket events, timers and
//! liveness probes all arrive as [`EngineEvent`]s, so no engine state is ever
//! touched from two places at once.
//!
//! # Close handling
//!
//! Each websocket gets a generation number. Events from an older generation
//! are dropped. For the first `probe_window` after a socket is started, an
//! unclean close triggers a liveness probe against the control plane: a live
//! kernel means the socket merely dropped and a reconnect is scheduled, a
//! failed probe means the kernel is gone. After the window, unclean closes
//! schedule a reconnect directly. Clean closes never reconnect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use reqwest::Url;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::config::{KernelConfig, ReconnectPolicy};
use crate::control::{ControlPlane, KernelId};
use crate::error::KernelError;
use crate::future::KernelFuture;
use crate::log::KernelLog;
use crate::state::{ConnectionState, StatusObservers};
use crate::urls;
use crate::wire::codec::{self, Payload};
use crate::wire::message::{Channel, Header, KERNEL_INFO_REQUEST, ProtocolMessage, STATUS};
use crate::wire::transport::{SocketHandle, TransportEvent};

#[derive(Debug, Clone, Default)]
pub(crate) struct Identity {
    pub id: Option<String>,
    pub name: String,
}

/// State shared between the engine task and the client handle.
///
/// The engine is the only writer of everything except `identity.name`.
pub(crate) struct Shared {
    pub status: watch::Sender<ConnectionState>,
    pub observers: Arc<StatusObservers>,
    pub identity: RwLock<Identity>,
    pub info_reply: RwLock<Option<Map<String, Value>>>,
    pub connected: AtomicBool,
    pub fully_disconnected: AtomicBool,
    pub session_id: String,
    pub username: String,
    pub ws_base: Url,
    pub token: Option<String>,
    pub log: Arc<dyn KernelLog>,
}

impl Shared {
    pub fn identity(&self) -> Identity {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_identity(&self, kernel: &KernelId) {
        let mut identity = self.identity.write().unwrap_or_else(PoisonError::into_inner);
        identity.id = Some(kernel.id.clone());
        identity.name = kernel.name.clone();
    }

    pub fn set_name(&self, name: &str) {
        self.identity
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .name = name.to_string();
    }

    pub fn info_reply(&self) -> Option<Map<String, Value>> {
        self.info_reply
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Websocket url for the current kernel id, if one is assigned.
    pub fn ws_url(&self) -> Result<Option<Url>, KernelError> {
        let Some(id) = self.identity().id else {
            return Ok(None);
        };
        Ok(Some(urls::channels_url(
            &self.ws_base,
            &id,
            &self.session_id,
            self.token.as_deref(),
        )?))
    }
}

/// Result of a send: the request id and, for shell requests, its correlator.
pub(crate) struct Sent {
    pub msg_id: String,
    pub future: Option<KernelFuture>,
}

pub(crate) struct Outgoing {
    pub channel: Channel,
    pub msg_type: String,
    pub content: Map<String, Value>,
    pub metadata: Map<String, Value>,
    pub buffers: Vec<Bytes>,
}

pub(crate) enum EngineEvent {
    Connect {
        identity: Option<KernelId>,
        reply: oneshot::Sender<Result<(), KernelError>>,
    },
    /// `scheduled` carries the backoff sequence for timer-driven reconnects.
    Reconnect { scheduled: Option<u64> },
    Disconnect,
    Send {
        request: Outgoing,
        reply: oneshot::Sender<Result<Sent, KernelError>>,
    },
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    ProbeWindowElapsed { generation: u64 },
    ProbeResult { generation: u64, alive: bool },
    KernelInfoReply(Map<String, Value>),
    Detach(String),
    SetStatus(ConnectionState),
    Stats(oneshot::Sender<EngineStats>),
}

/// Point-in-time counters of the engine, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub pending_requests: usize,
    pub reconnect_attempt: u32,
    pub autorestart_attempt: u32,
    /// Number of websockets started so far.
    pub connections: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseMode {
    /// Unclean closes are probed before reconnecting.
    Early,
    Late,
}

struct Socket {
    generation: u64,
    handle: SocketHandle,
    /// Url without its query, for logs.
    url: String,
    open: bool,
    announced: bool,
    closing: bool,
    close_handled: bool,
    close_mode: CloseMode,
}

pub(crate) struct Engine {
    shared: Arc<Shared>,
    control: Arc<dyn ControlPlane>,
    reconnect: ReconnectPolicy,
    probe_window: Duration,
    events: mpsc::UnboundedSender<EngineEvent>,
    cancel: CancellationToken,
    socket: Option<Socket>,
    generation: u64,
    pending: HashMap<String, KernelFuture>,
    reconnect_attempt: u32,
    autorestart_attempt: u32,
    reconnect_seq: u64,
    reconnect_scheduled: Option<u64>,
}

impl Engine {
    pub fn new(
        config: &KernelConfig,
        shared: Arc<Shared>,
        control: Arc<dyn ControlPlane>,
        events: mpsc::UnboundedSender<EngineEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared,
            control,
            reconnect: config.reconnect_policy(),
            probe_window: config.probe_window,
            events,
            cancel,
            socket: None,
            generation: 0,
            pending: HashMap::new(),
            reconnect_attempt: 0,
            autorestart_attempt: 0,
            reconnect_seq: 0,
            reconnect_scheduled: None,
        }
    }

    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<EngineEvent>) {
        tracing::debug!(session_id = %self.shared.session_id, "Kernel engine started");
        let cancel = self.cancel.clone();
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                event = rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
            }
        }

        self.socket = None;
        self.shared.connected.store(false, Ordering::SeqCst);
        self.dispose_pending();
        tracing::debug!(session_id = %self.shared.session_id, "Kernel engine stopped");
    }

    fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Connect { identity, reply } => {
                let _ = reply.send(self.connect(identity));
            }
            EngineEvent::Reconnect { scheduled } => {
                // a timer only fires if it is still the armed one; any reconnect disarms it
                if scheduled.is_some() && scheduled != self.reconnect_scheduled {
                    return;
                }
                self.reconnect_scheduled = None;
                self.reconnect();
            }
            EngineEvent::Disconnect => {
                self.reconnect_scheduled = None;
                self.disconnect();
            }
            EngineEvent::Send { request, reply } => {
                let _ = reply.send(self.send_request(request));
            }
            EngineEvent::Transport { generation, event } => {
                if self.socket.as_ref().map(|s| s.generation) != Some(generation) {
                    tracing::trace!(generation, "Dropping event from stale socket");
                    return;
                }
                self.handle_transport(event);
            }
            EngineEvent::ProbeWindowElapsed { generation } => {
                if let Some(socket) = self.socket.as_mut()
                    && socket.generation == generation
                {
                    socket.close_mode = CloseMode::Late;
                }
            }
            EngineEvent::ProbeResult { generation, alive } => {
                if self.socket.as_ref().map(|s| s.generation) != Some(generation) {
                    return;
                }
                if alive {
                    self.ws_closed(false);
                } else {
                    self.log(Level::WARN, "Kernel is unreachable after websocket close");
                    self.kernel_dead();
                }
            }
            EngineEvent::KernelInfoReply(content) => {
                *self
                    .shared
                    .info_reply
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = Some(content);
                self.set_status(ConnectionState::Ready);
                self.autorestart_attempt = 0;
            }
            EngineEvent::Detach(msg_id) => {
                if self.pending.get(&msg_id).is_some_and(KernelFuture::is_disposed) {
                    self.pending.remove(&msg_id);
                }
            }
            EngineEvent::SetStatus(state) => self.set_status(state),
            EngineEvent::Stats(reply) => {
                let _ = reply.send(EngineStats {
                    pending_requests: self.pending.len(),
                    reconnect_attempt: self.reconnect_attempt,
                    autorestart_attempt: self.autorestart_attempt,
                    connections: self.generation,
                });
            }
        }
    }

    fn log(&self, level: Level, message: &str) {
        self.shared.log.log(level, message);
    }

    fn kernel_label(&self) -> String {
        self.shared.identity().id.unwrap_or_default()
    }

    fn set_status(&mut self, state: ConnectionState) {
        self.shared.status.send_replace(state);
        self.shared.observers.notify(state);

        let message = format!("Kernel: {} ({})", state, self.kernel_label());
        let level = if state.is_chatty() {
            Level::DEBUG
        } else {
            Level::INFO
        };
        self.log(level, &message);

        if state.is_terminal() {
            self.dispose_pending();
        }
    }

    fn dispose_pending(&mut self) {
        for (_, future) in self.pending.drain() {
            future.dispose();
        }
    }

    fn post_after(&self, delay: Duration, event: EngineEvent) {
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = events.send(event);
                }
            }
        });
    }

    fn connect(&mut self, identity: Option<KernelId>) -> Result<(), KernelError> {
        if let Some(kernel) = identity {
            self.shared.set_identity(&kernel);
        }
        if self.shared.identity().id.is_none() {
            return Err(KernelError::Configuration(
                "kernel id must be set before connecting".to_string(),
            ));
        }
        self.reconnect_scheduled = None;
        self.start_channels()?;
        self.set_status(ConnectionState::Created);
        Ok(())
    }

    fn reconnect(&mut self) {
        if self.socket.as_ref().is_some_and(|s| s.open) {
            return;
        }
        self.reconnect_attempt += 1;
        self.set_status(ConnectionState::Reconnecting);
        if let Err(e) = self.start_channels() {
            self.log(Level::ERROR, &format!("Failed to start websocket: {e}"));
        }
    }

    /// Close an open socket (cleared once its close completes) or clear a
    /// socket that is not open. No-op without a socket.
    fn disconnect(&mut self) {
        match self.socket.as_mut() {
            None => {}
            Some(socket) if socket.open => {
                tracing::debug!(url = %socket.url, "Closing kernel websocket");
                socket.closing = true;
                socket.handle.close();
            }
            Some(_) => self.clear_socket(),
        }
    }

    fn clear_socket(&mut self) {
        self.socket = None;
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.fully_disconnected.store(true, Ordering::SeqCst);
        self.set_status(ConnectionState::Disconnected);
    }

    fn start_channels(&mut self) -> Result<(), KernelError> {
        let Some(url) = self.shared.ws_url()? else {
            return Err(KernelError::Configuration(
                "kernel id must be set before connecting".to_string(),
            ));
        };
        // A replaced socket closes when its handle drops; its events are stale.
        self.socket = None;
        self.shared.connected.store(false, Ordering::SeqCst);

        self.generation += 1;
        let generation = self.generation;
        let mut shown = url.clone();
        shown.set_query(None);
        self.log(Level::INFO, &format!("Starting WebSockets: {shown}"));

        let events = self.events.clone();
        let handle = SocketHandle::open(url.to_string(), move |event| {
            let _ = events.send(EngineEvent::Transport { generation, event });
        });
        self.post_after(
            self.probe_window,
            EngineEvent::ProbeWindowElapsed { generation },
        );

        self.socket = Some(Socket {
            generation,
            handle,
            url: shown.to_string(),
            open: false,
            announced: false,
            closing: false,
            close_handled: false,
            close_mode: CloseMode::Early,
        });
        self.shared.fully_disconnected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        let Some(socket) = self.socket.as_mut() else {
            return;
        };
        match event {
            TransportEvent::Opened => {
                socket.open = true;
                self.shared.connected.store(true, Ordering::SeqCst);
                if !socket.announced {
                    socket.announced = true;
                    self.kernel_connected();
                }
            }
            TransportEvent::Frame(payload) => self.handle_frame(payload),
            TransportEvent::Failed(error) => {
                socket.open = false;
                self.shared.connected.store(false, Ordering::SeqCst);
                if socket.closing {
                    self.clear_socket();
                    return;
                }
                if std::mem::replace(&mut socket.close_handled, true) {
                    return;
                }
                tracing::debug!(url = %socket.url, %error, "Kernel websocket failed");
                self.ws_closed(true);
            }
            TransportEvent::Closed { clean } => {
                socket.open = false;
                self.shared.connected.store(false, Ordering::SeqCst);
                if socket.closing {
                    self.clear_socket();
                    return;
                }
                if std::mem::replace(&mut socket.close_handled, true) {
                    return;
                }
                match (socket.close_mode, clean) {
                    (_, true) => {
                        tracing::debug!(url = %socket.url, "Kernel websocket closed cleanly");
                    }
                    (CloseMode::Early, false) => {
                        let generation = socket.generation;
                        self.probe(generation);
                    }
                    (CloseMode::Late, false) => self.ws_closed(false),
                }
            }
        }
    }

    fn probe(&self, generation: u64) {
        let Some(id) = self.shared.identity().id else {
            return;
        };
        tracing::debug!(kernel_id = %id, "Probing kernel after early websocket close");
        let control = Arc::clone(&self.control);
        let events = self.events.clone();
        tokio::spawn(async move {
            let alive = match control.kernel_info(&id).await {
                Ok(_) => true,
                Err(e) => {
                    tracing::debug!(kernel_id = %id, error = %e, "Kernel liveness probe failed");
                    false
                }
            };
            let _ = events.send(EngineEvent::ProbeResult { generation, alive });
        });
    }

    fn ws_closed(&mut self, error: bool) {
        let url = self.socket.as_ref().map(|s| s.url.clone()).unwrap_or_default();
        self.clear_socket();
        if error {
            self.log(Level::ERROR, &format!("WebSocket connection failed: {url}"));
            self.set_status(ConnectionState::ConnectionFailed);
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        match self.reconnect.delay(self.reconnect_attempt) {
            Some(delay) => {
                self.log(
                    Level::ERROR,
                    &format!(
                        "Connection lost, reconnecting in {} seconds.",
                        delay.as_secs_f64()
                    ),
                );
                self.reconnect_seq += 1;
                self.reconnect_scheduled = Some(self.reconnect_seq);
                self.post_after(
                    delay,
                    EngineEvent::Reconnect {
                        scheduled: Some(self.reconnect_seq),
                    },
                );
            }
            None => {
                self.reconnect_scheduled = None;
                self.set_status(ConnectionState::ConnectionDead);
                self.log(Level::ERROR, "Failed to reconnect, giving up.");
            }
        }
    }

    fn kernel_connected(&mut self) {
        self.set_status(ConnectionState::Connected);
        self.reconnect_attempt = 0;
        self.request_kernel_info();
    }

    fn kernel_dead(&mut self) {
        self.set_status(ConnectionState::Dead);
        self.disconnect();
    }

    fn request_kernel_info(&mut self) {
        let request = Outgoing {
            channel: Channel::Shell,
            msg_type: KERNEL_INFO_REQUEST.to_string(),
            content: Map::new(),
            metadata: Map::new(),
            buffers: Vec::new(),
        };
        match self.send_request(request) {
            Ok(Sent {
                future: Some(future),
                ..
            }) => {
                let events = self.events.clone();
                future.set_auto_dispose(true).on_reply(move |reply| {
                    let _ = events.send(EngineEvent::KernelInfoReply(reply.content.clone()));
                });
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to request kernel info"),
        }
    }

    fn handle_status_message(&mut self, msg: &ProtocolMessage) {
        let Some(execution_state) = msg.execution_state() else {
            return;
        };
        if execution_state == "dead" {
            self.kernel_dead();
            return;
        }

        let state = ConnectionState::parse(execution_state).unwrap_or_else(|| {
            tracing::warn!(execution_state, "Unknown kernel execution state");
            ConnectionState::Unknown
        });
        self.set_status(state);

        match state {
            ConnectionState::Starting => self.request_kernel_info(),
            ConnectionState::Restarting => {
                // the server is restarting a kernel that died on its own
                self.autorestart_attempt += 1;
                self.set_status(ConnectionState::Autorestarting);
            }
            _ => {}
        }
    }

    fn handle_frame(&mut self, payload: Payload) {
        let msg = match codec::decode(payload) {
            Ok(msg) => Arc::new(msg),
            Err(e) => {
                self.log(Level::ERROR, &format!("Dropping kernel message: {e}"));
                return;
            }
        };
        tracing::trace!(
            channel = %msg.channel,
            msg_type = msg.msg_type(),
            parent = msg.parent_msg_id().unwrap_or(""),
            "Kernel message received"
        );

        if msg.channel == Channel::Iopub && msg.msg_type() == STATUS {
            self.handle_status_message(&msg);
        }

        if let Some(parent) = msg.parent_msg_id()
            && let Some(future) = self.pending.get(parent).cloned()
        {
            future.handle_message(&msg);
            if future.is_disposed() {
                self.pending.remove(parent);
            }
        }
    }

    fn not_open_error(&self) -> KernelError {
        if *self.shared.status.borrow() == ConnectionState::ConnectionDead {
            KernelError::ConnectionDead {
                attempts: self.reconnect_attempt,
            }
        } else if self.reconnect_scheduled.is_some() || self.reconnect_attempt > 0 {
            KernelError::ConnectionLost {
                attempt: self.reconnect_attempt,
            }
        } else {
            KernelError::TransportNotOpen
        }
    }

    fn send_request(&mut self, request: Outgoing) -> Result<Sent, KernelError> {
        let Some(socket) = self.socket.as_ref().filter(|s| s.open) else {
            return Err(self.not_open_error());
        };

        let header = Header::new(
            request.msg_type,
            &self.shared.username,
            &self.shared.session_id,
        );
        let msg = ProtocolMessage::new(request.channel, header, request.content)
            .with_metadata(request.metadata)
            .with_buffers(request.buffers);
        let payload = codec::encode(&msg)?;
        if !socket.handle.send(payload) {
            return Err(KernelError::TransportNotOpen);
        }

        let msg_id = msg.header.msg_id;
        tracing::trace!(%msg_id, channel = %request.channel, msg_type = %msg.header.msg_type, "Kernel message sent");

        let future = (request.channel == Channel::Shell).then(|| {
            let events = self.events.clone();
            let future = KernelFuture::new(msg_id.clone(), move |id| {
                let _ = events.send(EngineEvent::Detach(id.to_string()));
            });
            self.pending.insert(msg_id.clone(), future.clone());
            future
        });
        Ok(Sent { msg_id, future })
    }
}
