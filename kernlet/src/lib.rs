//! kernlet: client for the Jupyter kernel websocket protocol.
//!
//! A [`KernelClient`] owns one connection to a running kernel. It frames and
//! unframes protocol messages, correlates replies and output with the request
//! that caused them ([`KernelFuture`]), tracks the kernel's execution state
//! and reconnects with exponential backoff when the websocket drops.
//! [`NotebookSession`] wraps a client in the server's session API.

mod client;
mod config;
mod control;
mod engine;
mod error;
mod future;
mod log;
mod session;
mod state;
mod version;

pub mod urls;
pub mod wire;

#[cfg(test)]
mod testing;

pub use client::{ExecuteOptions, KernelClient};
pub use config::{DEFAULT_RECONNECT_LIMIT, KernelConfig, ReconnectPolicy};
pub use control::{ControlError, ControlPlane, KernelId, RestControlPlane};
pub use engine::EngineStats;
pub use error::KernelError;
pub use future::{Completion, FutureFlags, KernelFuture};
pub use log::{KernelLog, TracingLog};
pub use session::{
    NotebookId, NotebookSession, SessionError, SessionModel, SessionOptions, SessionStatus,
};
pub use state::{ConnectionState, StatusObservers, Subscription};
pub use version::{KERNLET_VERSION, PROTOCOL_VERSION, user_agent};
