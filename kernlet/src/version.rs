//! Version information for kernlet.

/// Kernlet version from Cargo.toml
pub const KERNLET_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Kernel messaging protocol version stamped on every outgoing header.
pub const PROTOCOL_VERSION: &str = "5.0";

/// User-Agent sent with control-plane requests.
pub fn user_agent() -> String {
    format!("kernlet/{}", KERNLET_VERSION)
}
