//! Client configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::control::ControlPlane;
use crate::log::{KernelLog, TracingLog};

/// Default reconnect budget before a connection is declared dead.
pub const DEFAULT_RECONNECT_LIMIT: u32 = 7;

pub struct KernelConfig {
    /// Server base url, e.g. `http://localhost:8888/`.
    pub base_url: String,
    /// Websocket base; derived from `base_url` when unset.
    pub ws_url: Option<String>,
    pub username: String,
    /// Server token, sent as `Authorization: token ...` and as a ws query param.
    pub token: Option<String>,
    pub reconnect_limit: u32,
    pub reconnect_base: Duration,
    /// Closes within this window of opening are treated as early closes.
    pub probe_window: Duration,
    pub http_timeout: Duration,
    /// Control plane override; defaults to REST against `base_url`.
    pub control: Option<Arc<dyn ControlPlane>>,
    pub log: Arc<dyn KernelLog>,
}

impl KernelConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ws_url: None,
            username: String::new(),
            token: None,
            reconnect_limit: std::env::var("KERNLET_RECONNECT_LIMIT")
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
                .unwrap_or(DEFAULT_RECONNECT_LIMIT),
            reconnect_base: Duration::from_secs(1),
            probe_window: Duration::from_secs(1),
            http_timeout: Duration::from_secs(30),
            control: None,
            log: Arc::new(TracingLog),
        }
    }

    pub fn with_ws_url(mut self, ws_url: impl Into<String>) -> Self {
        self.ws_url = Some(ws_url.into());
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_reconnect_limit(mut self, limit: u32) -> Self {
        self.reconnect_limit = limit;
        self
    }

    pub fn with_reconnect_base(mut self, base: Duration) -> Self {
        self.reconnect_base = base;
        self
    }

    pub fn with_probe_window(mut self, window: Duration) -> Self {
        self.probe_window = window;
        self
    }

    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    pub fn with_control(mut self, control: Arc<dyn ControlPlane>) -> Self {
        self.control = Some(control);
        self
    }

    pub fn with_log(mut self, log: Arc<dyn KernelLog>) -> Self {
        self.log = log;
        self
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            limit: self.reconnect_limit,
            base: self.reconnect_base,
        }
    }
}

/// Exponential reconnect backoff: `base * 2^attempt` while `attempt < limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub limit: u32,
    pub base: Duration,
}

impl ReconnectPolicy {
    /// Delay before reconnect `attempt` (0-based), or `None` once the budget is spent.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.limit {
            return None;
        }
        Some(self.base.saturating_mul(1u32 << attempt.min(31)))
    }
}

impl std::fmt::Debug for KernelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelConfig")
            .field("base_url", &self.base_url)
            .field("ws_url", &self.ws_url)
            .field("username", &self.username)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("reconnect_limit", &self.reconnect_limit)
            .field("reconnect_base", &self.reconnect_base)
            .field("probe_window", &self.probe_window)
            .field("http_timeout", &self.http_timeout)
            .finish_non_exhaustive()
    }
}
