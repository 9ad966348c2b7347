//! Websocket transport to the kernel's channels endpoint.
//!
//! Each connection attempt runs in its own socket task that owns the stream.
//! Outgoing frames arrive over an unbounded channel so senders never block;
//! everything the socket observes is reported through the `post` callback,
//! which the engine wires to its event queue.

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::codec::Payload;

/// What a socket task reports back to its owner.
#[derive(Debug)]
pub enum TransportEvent {
    /// Websocket handshake completed.
    Opened,
    /// A text or binary data frame arrived.
    Frame(Payload),
    /// The connection could not be established.
    Failed(String),
    /// The connection ended. `clean` is true when a close frame was exchanged.
    Closed { clean: bool },
}

enum Outgoing {
    Frame(Payload),
    Close,
}

type Post = Box<dyn Fn(TransportEvent) + Send + Sync>;

/// Owner's end of one socket task.
///
/// Dropping the handle closes the socket gracefully.
pub struct SocketHandle {
    outgoing: mpsc::UnboundedSender<Outgoing>,
}

impl SocketHandle {
    /// Start connecting to `url` in a background task.
    pub fn open(url: String, post: impl Fn(TransportEvent) + Send + Sync + 'static) -> Self {
        let (outgoing, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_socket(url, rx, Box::new(post)));
        Self { outgoing }
    }

    /// Queue a frame. Returns false if the socket task has exited.
    pub fn send(&self, payload: Payload) -> bool {
        self.outgoing.send(Outgoing::Frame(payload)).is_ok()
    }

    /// Start the close handshake. `Closed` is reported once it completes.
    pub fn close(&self) {
        let _ = self.outgoing.send(Outgoing::Close);
    }
}

fn into_ws(payload: Payload) -> WsMessage {
    match payload {
        Payload::Text(text) => WsMessage::Text(text.into()),
        Payload::Binary(bytes) => WsMessage::Binary(bytes),
    }
}

/// `url` without its query, which can carry the server token.
fn loggable(url: &str) -> &str {
    url.split_once('?').map_or(url, |(base, _)| base)
}

async fn run_socket(url: String, mut outgoing: mpsc::UnboundedReceiver<Outgoing>, post: Post) {
    let shown = loggable(&url);
    tracing::debug!(url = %shown, "Opening kernel websocket");
    let stream = match connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            tracing::debug!(url = %shown, error = %e, "Kernel websocket connect failed");
            post(TransportEvent::Failed(e.to_string()));
            return;
        }
    };
    post(TransportEvent::Opened);

    let (mut sink, mut source) = stream.split();
    let mut closing = false;

    let clean = loop {
        tokio::select! {
            out = outgoing.recv(), if !closing => match out {
                Some(Outgoing::Frame(payload)) => {
                    if let Err(e) = sink.send(into_ws(payload)).await {
                        tracing::warn!(error = %e, "Kernel websocket send failed");
                    }
                }
                Some(Outgoing::Close) | None => {
                    closing = true;
                    if let Err(e) = sink.send(WsMessage::Close(None)).await {
                        tracing::debug!(error = %e, "Failed to send close frame");
                        break false;
                    }
                }
            },
            incoming = source.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    post(TransportEvent::Frame(Payload::Text(text.to_string())));
                }
                Some(Ok(WsMessage::Binary(bytes))) => {
                    post(TransportEvent::Frame(Payload::Binary(bytes)));
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    tracing::debug!(?frame, "Kernel websocket close frame received");
                    break true;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "Kernel websocket read failed");
                    break false;
                }
                None => break closing,
            }
        }
    };

    // Flushes the close reply queued by tungstenite; errors only mean it is already gone.
    let _ = sink.close().await;
    tracing::debug!(url = %shown, clean, "Kernel websocket closed");
    post(TransportEvent::Closed { clean });
}
