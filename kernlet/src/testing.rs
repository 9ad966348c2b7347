//! Test doubles: a scripted kernel websocket server and a fake control plane.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

use crate::client::KernelClient;
use crate::control::{ControlError, ControlPlane, KernelId};
use crate::state::ConnectionState;
use crate::wire::codec::{self, Payload};
use crate::wire::message::{Channel, Header, ProtocolMessage, STATUS};

const STEP: Duration = Duration::from_secs(5);

/// Control plane whose liveness is switchable; records every call.
pub(crate) struct FakeControl {
    alive: AtomicBool,
    kernel: KernelId,
    calls: Mutex<Vec<String>>,
}

impl FakeControl {
    pub fn alive() -> Arc<Self> {
        Arc::new(Self {
            alive: AtomicBool::new(true),
            kernel: KernelId::new("k1", "python3"),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn dead() -> Arc<Self> {
        let control = Self::alive();
        control.alive.store(false, Ordering::SeqCst);
        control
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, operation: &'static str, call: String) -> Result<(), ControlError> {
        self.calls.lock().unwrap().push(call);
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ControlError::UnexpectedStatus {
                operation,
                status: 404,
            })
        }
    }
}

#[async_trait]
impl ControlPlane for FakeControl {
    async fn list_kernels(&self) -> Result<Vec<KernelId>, ControlError> {
        self.record("list kernels", "list".to_string())?;
        Ok(vec![self.kernel.clone()])
    }

    async fn create_kernel(&self, name: Option<&str>) -> Result<KernelId, ControlError> {
        self.record("start kernel", format!("create {}", name.unwrap_or("default")))?;
        Ok(self.kernel.clone())
    }

    async fn kernel_info(&self, id: &str) -> Result<KernelId, ControlError> {
        self.record("get kernel info", format!("info {id}"))?;
        Ok(self.kernel.clone())
    }

    async fn interrupt_kernel(&self, id: &str) -> Result<(), ControlError> {
        self.record("interrupt kernel", format!("interrupt {id}"))
    }

    async fn restart_kernel(&self, id: &str) -> Result<KernelId, ControlError> {
        self.record("restart kernel", format!("restart {id}"))?;
        Ok(self.kernel.clone())
    }

    async fn shutdown_kernel(&self, id: &str) -> Result<(), ControlError> {
        self.record("shutdown kernel", format!("shutdown {id}"))
    }
}

/// Local websocket server standing in for a kernel's channels endpoint.
pub(crate) struct FakeKernel {
    addr: SocketAddr,
    connections: mpsc::UnboundedReceiver<FakeConnection>,
}

impl FakeKernel {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, connections) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut uri = String::new();
                    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                        uri = req.uri().to_string();
                        Ok(resp)
                    };
                    let accepted = tokio_tungstenite::accept_hdr_async(tcp, callback).await;
                    if let Ok(ws) = accepted {
                        let _ = tx.send(FakeConnection { ws, uri });
                    }
                });
            }
        });
        Self { addr, connections }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn accept(&mut self) -> FakeConnection {
        tokio::time::timeout(STEP, self.connections.recv())
            .await
            .expect("no websocket connection")
            .expect("fake kernel stopped")
    }
}

/// Server side of one websocket connection.
pub(crate) struct FakeConnection {
    ws: WebSocketStream<TcpStream>,
    pub uri: String,
}

impl FakeConnection {
    /// Next protocol message from the client.
    pub async fn recv(&mut self) -> ProtocolMessage {
        loop {
            let frame = tokio::time::timeout(STEP, self.ws.next())
                .await
                .expect("no message from client")
                .expect("client closed the socket")
                .expect("websocket error");
            let payload = match frame {
                WsMessage::Text(text) => Payload::Text(text.to_string()),
                WsMessage::Binary(bytes) => Payload::Binary(bytes),
                _ => continue,
            };
            return codec::decode(payload).unwrap();
        }
    }

    pub async fn send(&mut self, msg: &ProtocolMessage) {
        let frame = match codec::encode(msg).unwrap() {
            Payload::Text(text) => WsMessage::Text(text.into()),
            Payload::Binary(bytes) => WsMessage::Binary(bytes),
        };
        self.ws.send(frame).await.unwrap();
    }

    pub async fn send_raw(&mut self, frame: WsMessage) {
        self.ws.send(frame).await.unwrap();
    }

    /// Send a message whose parent header is `request`'s header.
    pub async fn reply(
        &mut self,
        request: &ProtocolMessage,
        channel: Channel,
        msg_type: &str,
        content: Value,
    ) {
        let msg = kernel_message(channel, msg_type, content).with_parent(request.header.clone());
        self.send(&msg).await;
    }

    /// Publish an iopub status, optionally attributed to `parent`.
    pub async fn status(&mut self, parent: Option<&ProtocolMessage>, state: &str) {
        let mut msg = kernel_message(Channel::Iopub, STATUS, json!({ "execution_state": state }));
        if let Some(parent) = parent {
            msg = msg.with_parent(parent.header.clone());
        }
        self.send(&msg).await;
    }

    /// Answer the next request, which must be a kernel_info_request.
    pub async fn answer_kernel_info(&mut self) -> ProtocolMessage {
        let request = self.recv().await;
        assert_eq!(request.msg_type(), "kernel_info_request");
        self.status(Some(&request), "busy").await;
        self.reply(
            &request,
            Channel::Shell,
            "kernel_info_reply",
            json!({ "status": "ok", "protocol_version": "5.3", "implementation": "fake" }),
        )
        .await;
        self.status(Some(&request), "idle").await;
        request
    }

    /// Close with a close frame and wait for the client's answer.
    pub async fn close(mut self) {
        self.ws.close(None).await.unwrap();
        self.drain().await;
    }

    /// Wait for the client to close the connection.
    pub async fn expect_close(mut self) {
        self.drain().await;
    }

    async fn drain(&mut self) {
        tokio::time::timeout(STEP, async {
            while let Some(Ok(_)) = self.ws.next().await {}
        })
        .await
        .expect("client did not close the socket");
    }

    /// Drop the TCP stream without a close handshake.
    pub fn drop_abruptly(self) {
        drop(self.ws);
    }
}

pub(crate) fn kernel_message(channel: Channel, msg_type: &str, content: Value) -> ProtocolMessage {
    let content = match content {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    ProtocolMessage::new(channel, Header::new(msg_type, "kernel", "kernel-session"), content)
}

/// Ordered record of a client's state transitions.
pub(crate) struct StateLog {
    rx: mpsc::UnboundedReceiver<ConnectionState>,
    seen: Vec<ConnectionState>,
}

impl StateLog {
    pub fn attach(client: &KernelClient) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let _subscription = client.subscribe(move |state| {
            let _ = tx.send(state);
        });
        Self {
            rx,
            seen: Vec::new(),
        }
    }

    /// Consume transitions until `state` is seen.
    pub async fn until(&mut self, state: ConnectionState) {
        tokio::time::timeout(STEP, async {
            while let Some(next) = self.rx.recv().await {
                self.seen.push(next);
                if next == state {
                    return;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("never reached {state}; saw {:?}", self.seen));
    }

    /// Consume everything already delivered.
    pub fn drain(&mut self) -> &[ConnectionState] {
        while let Ok(next) = self.rx.try_recv() {
            self.seen.push(next);
        }
        &self.seen
    }

    pub fn count(&mut self, state: ConnectionState) -> usize {
        self.drain().iter().filter(|s| **s == state).count()
    }
}
