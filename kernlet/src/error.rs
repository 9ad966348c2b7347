//! Errors surfaced by the kernel client.

use crate::control::ControlError;
use crate::urls::UrlError;
use crate::wire::codec::CodecError;

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("kernel transport is not open")]
    TransportNotOpen,

    #[error("connection to kernel lost (reconnect attempt {attempt} pending)")]
    ConnectionLost { attempt: u32 },

    #[error("connection to kernel is dead after {attempts} reconnect attempts")]
    ConnectionDead { attempts: u32 },

    #[error("protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("control plane error: {0}")]
    Control(#[from] ControlError),

    #[error("kernel engine has stopped")]
    EngineStopped,

    #[error(transparent)]
    InvalidUrl(#[from] UrlError),
}

impl KernelError {
    /// True for conditions a later reconnect may clear.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransportNotOpen | Self::ConnectionLost { .. })
    }
}
