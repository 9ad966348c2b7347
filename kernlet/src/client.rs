//! Public kernel client.
//!
//! A [`KernelClient`] is a cheap handle onto an engine task. Requests are
//! posted to the engine and return a [`KernelFuture`] for the reply; state
//! changes are observable through [`KernelClient::subscribe`] or
//! [`KernelClient::status_watch`]. Dropping the client stops the engine and
//! closes the websocket.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::config::KernelConfig;
use crate::control::{ControlError, ControlPlane, KernelId, RestControlPlane};
use crate::engine::{Engine, EngineEvent, EngineStats, Identity, Outgoing, Sent, Shared};
use crate::error::KernelError;
use crate::future::KernelFuture;
use crate::state::{ConnectionState, StatusObservers, Subscription};
use crate::urls;
use crate::wire::message::{
    COMPLETE_REQUEST, Channel, EXECUTE_REQUEST, INPUT_REPLY, INSPECT_REQUEST,
    KERNEL_INFO_REQUEST, into_object,
};

/// Options for `execute_request`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecuteOptions {
    pub silent: bool,
    pub store_history: bool,
    pub user_expressions: Map<String, Value>,
    pub allow_stdin: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            silent: true,
            store_history: false,
            user_expressions: Map::new(),
            allow_stdin: false,
        }
    }
}

impl ExecuteOptions {
    pub fn with_silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    pub fn with_store_history(mut self, store_history: bool) -> Self {
        self.store_history = store_history;
        self
    }

    pub fn with_user_expression(mut self, name: impl Into<String>, expr: impl Into<String>) -> Self {
        self.user_expressions
            .insert(name.into(), Value::String(expr.into()));
        self
    }

    pub fn with_allow_stdin(mut self, allow_stdin: bool) -> Self {
        self.allow_stdin = allow_stdin;
        self
    }

    fn into_content(self, code: &str) -> Map<String, Value> {
        let mut content = Map::new();
        content.insert("code".to_string(), Value::String(code.to_string()));
        content.insert("silent".to_string(), Value::Bool(self.silent));
        content.insert("store_history".to_string(), Value::Bool(self.store_history));
        content.insert(
            "user_expressions".to_string(),
            Value::Object(self.user_expressions),
        );
        content.insert("allow_stdin".to_string(), Value::Bool(self.allow_stdin));
        content
    }
}

fn control_for(config: &KernelConfig) -> Result<Arc<dyn ControlPlane>, KernelError> {
    if let Some(control) = &config.control {
        return Ok(Arc::clone(control));
    }
    let rest = RestControlPlane::new(
        &config.base_url,
        config.token.as_deref(),
        config.http_timeout,
    )?;
    Ok(Arc::new(rest))
}

/// Client for one kernel's websocket channels.
pub struct KernelClient {
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<EngineEvent>,
    control: Arc<dyn ControlPlane>,
    cancel: CancellationToken,
}

impl KernelClient {
    /// Create a client and spawn its engine. Must be called within a tokio runtime.
    pub fn new(config: KernelConfig) -> Result<Self, KernelError> {
        let base = urls::parse(&config.base_url)?;
        let ws_base = match &config.ws_url {
            Some(ws_url) => urls::parse(ws_url)?,
            None => urls::ws_base(&base)?,
        };
        let control = control_for(&config)?;

        let (status, _) = watch::channel(ConnectionState::Unknown);
        let shared = Arc::new(Shared {
            status,
            observers: StatusObservers::new(),
            identity: std::sync::RwLock::new(Identity::default()),
            info_reply: std::sync::RwLock::new(None),
            connected: AtomicBool::new(false),
            fully_disconnected: AtomicBool::new(true),
            session_id: uuid::Uuid::new_v4().to_string(),
            username: config.username.clone(),
            ws_base,
            token: config.token.clone(),
            log: Arc::clone(&config.log),
        });

        let (events, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let engine = Engine::new(
            &config,
            Arc::clone(&shared),
            Arc::clone(&control),
            events.clone(),
            cancel.clone(),
        );
        tokio::spawn(engine.run(rx));

        Ok(Self {
            shared,
            events,
            control,
            cancel,
        })
    }

    /// List running kernels on the server `config` points at.
    pub async fn list(config: &KernelConfig) -> Result<Vec<KernelId>, KernelError> {
        let control = control_for(config)?;
        control.list_kernels().await.map_err(|e| {
            config
                .log
                .log(Level::ERROR, &format!("API request failed: {e}"));
            KernelError::from(e)
        })
    }

    fn post(&self, event: EngineEvent) -> Result<(), KernelError> {
        self.events
            .send(event)
            .map_err(|_| KernelError::EngineStopped)
    }

    async fn ask<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> EngineEvent,
    ) -> Result<T, KernelError> {
        let (tx, rx) = oneshot::channel();
        self.post(make(tx))?;
        rx.await.map_err(|_| KernelError::EngineStopped)
    }

    fn require_id(&self) -> Result<String, KernelError> {
        self.shared.identity().id.ok_or_else(|| {
            KernelError::Configuration("kernel id must be set first".to_string())
        })
    }

    fn control_failed(&self, error: ControlError) -> KernelError {
        self.shared
            .log
            .log(Level::ERROR, &format!("API request failed: {error}"));
        KernelError::Control(error)
    }

    // --- connection -------------------------------------------------------

    /// Open the websocket to the kernel (`created`). `identity` replaces the
    /// stored kernel id and name when given.
    pub async fn connect(&self, identity: Option<KernelId>) -> Result<(), KernelError> {
        self.ask(|reply| EngineEvent::Connect { identity, reply })
            .await?
    }

    /// Reopen a lost connection. No-op while connected.
    pub fn reconnect(&self) -> Result<(), KernelError> {
        self.post(EngineEvent::Reconnect { scheduled: None })
    }

    /// Close the websocket. `disconnected` is reported once the close completes.
    pub fn disconnect(&self) -> Result<(), KernelError> {
        self.post(EngineEvent::Disconnect)
    }

    // --- requests ---------------------------------------------------------

    async fn send(&self, request: Outgoing) -> Result<Sent, KernelError> {
        self.ask(|reply| EngineEvent::Send { request, reply }).await?
    }

    /// Send an arbitrary shell request. Non-object `content`/`metadata` are
    /// wrapped as `{"value": ...}`.
    pub async fn send_shell_message(
        &self,
        msg_type: &str,
        content: Value,
        metadata: Value,
        buffers: Vec<Bytes>,
    ) -> Result<KernelFuture, KernelError> {
        let sent = self
            .send(Outgoing {
                channel: Channel::Shell,
                msg_type: msg_type.to_string(),
                content: into_object(content),
                metadata: into_object(metadata),
                buffers,
            })
            .await?;
        sent.future.ok_or(KernelError::TransportNotOpen)
    }

    pub async fn kernel_info(&self) -> Result<KernelFuture, KernelError> {
        self.send_shell_message(KERNEL_INFO_REQUEST, json!({}), Value::Null, Vec::new())
            .await
    }

    pub async fn inspect(&self, code: &str, cursor_pos: usize) -> Result<KernelFuture, KernelError> {
        let content = json!({
            "code": code,
            "cursor_pos": cursor_pos,
            "detail_level": 0,
        });
        self.send_shell_message(INSPECT_REQUEST, content, Value::Null, Vec::new())
            .await
    }

    pub async fn execute(
        &self,
        code: &str,
        options: ExecuteOptions,
    ) -> Result<KernelFuture, KernelError> {
        let content = Value::Object(options.into_content(code));
        self.send_shell_message(EXECUTE_REQUEST, content, Value::Null, Vec::new())
            .await
    }

    pub async fn complete(&self, code: &str, cursor_pos: usize) -> Result<KernelFuture, KernelError> {
        let content = json!({
            "code": code,
            "cursor_pos": cursor_pos,
        });
        self.send_shell_message(COMPLETE_REQUEST, content, Value::Null, Vec::new())
            .await
    }

    /// Answer an `input_request` on the stdin channel. Returns the message id.
    pub async fn send_input_reply(&self, reply: Value) -> Result<String, KernelError> {
        let sent = self
            .send(Outgoing {
                channel: Channel::Stdin,
                msg_type: INPUT_REPLY.to_string(),
                content: into_object(reply),
                metadata: Map::new(),
                buffers: Vec::new(),
            })
            .await?;
        Ok(sent.msg_id)
    }

    // --- observation ------------------------------------------------------

    pub fn status(&self) -> ConnectionState {
        *self.shared.status.borrow()
    }

    /// Register a status observer. Observers run on the engine task, in
    /// registration order, and must not block.
    pub fn subscribe(
        &self,
        observer: impl FnMut(ConnectionState) + Send + 'static,
    ) -> Subscription {
        self.shared.observers.subscribe(observer)
    }

    pub fn status_watch(&self) -> watch::Receiver<ConnectionState> {
        self.shared.status.subscribe()
    }

    /// Content of the last `kernel_info_reply` received on connect.
    pub fn info_reply(&self) -> Option<Map<String, Value>> {
        self.shared.info_reply()
    }

    /// True while the websocket is open.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// True when no websocket exists at all.
    pub fn is_fully_disconnected(&self) -> bool {
        self.shared.fully_disconnected.load(Ordering::SeqCst)
    }

    pub async fn pending_requests(&self) -> Result<usize, KernelError> {
        Ok(self.stats().await?.pending_requests)
    }

    pub async fn stats(&self) -> Result<EngineStats, KernelError> {
        self.ask(EngineEvent::Stats).await
    }

    // --- identity ---------------------------------------------------------

    pub fn id(&self) -> Option<String> {
        self.shared.identity().id
    }

    pub fn name(&self) -> String {
        self.shared.identity().name
    }

    pub fn set_name(&self, name: &str) {
        self.shared.set_name(name);
    }

    /// Client session id, fixed for the lifetime of the client.
    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn username(&self) -> &str {
        &self.shared.username
    }

    /// Channels url for the current kernel, once an id is known.
    pub fn ws_url(&self) -> Result<Option<String>, KernelError> {
        Ok(self.shared.ws_url()?.map(String::from))
    }

    // --- control plane ----------------------------------------------------

    /// Start a new kernel and connect to it. The kernel name comes from
    /// `identity`, else from [`KernelClient::name`]; an empty name lets the
    /// server pick its default.
    pub async fn start(&self, identity: Option<KernelId>) -> Result<KernelId, KernelError> {
        if let Some(kernel) = &identity {
            self.shared.set_identity(kernel);
        }
        let name = self.name();
        self.post(EngineEvent::SetStatus(ConnectionState::Starting))?;

        let requested = (!name.is_empty()).then_some(name.as_str());
        let kernel = self
            .control
            .create_kernel(requested)
            .await
            .map_err(|e| self.control_failed(e))?;
        self.connect(Some(kernel.clone())).await?;
        Ok(kernel)
    }

    pub async fn get_info(&self) -> Result<KernelId, KernelError> {
        let id = self.require_id()?;
        self.control
            .kernel_info(&id)
            .await
            .map_err(|e| self.control_failed(e))
    }

    pub async fn interrupt(&self) -> Result<(), KernelError> {
        let id = self.require_id()?;
        self.post(EngineEvent::SetStatus(ConnectionState::Interrupting))?;
        self.control
            .interrupt_kernel(&id)
            .await
            .map_err(|e| self.control_failed(e))
    }

    /// Restart the kernel server-side, then reconnect to it.
    pub async fn restart(&self) -> Result<KernelId, KernelError> {
        let id = self.require_id()?;
        self.post(EngineEvent::SetStatus(ConnectionState::Restarting))?;
        self.disconnect()?;
        let kernel = self
            .control
            .restart_kernel(&id)
            .await
            .map_err(|e| self.control_failed(e))?;
        self.connect(Some(kernel.clone())).await?;
        Ok(kernel)
    }

    pub async fn shutdown(&self) -> Result<(), KernelError> {
        let id = self.require_id()?;
        self.post(EngineEvent::SetStatus(ConnectionState::Shutdown))?;
        self.disconnect()?;
        self.control
            .shutdown_kernel(&id)
            .await
            .map_err(|e| self.control_failed(e))
    }
}

impl Drop for KernelClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for KernelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelClient")
            .field("id", &self.id())
            .field("session_id", &self.shared.session_id)
            .field("status", &self.status())
            .finish()
    }
}
