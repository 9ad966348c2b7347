//! Wire layer between the engine and a kernel's websocket.
//!
//! # Architecture
//!
//! - **message**: Message types (ProtocolMessage, Header, Channel)
//! - **codec**: Text and binary multipart framing
//! - **transport**: Socket task owning one websocket connection

pub mod codec;
pub mod message;
pub mod transport;
