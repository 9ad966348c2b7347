//! Connection state and status observers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::{Deserialize, Serialize};

/// Combined transport and kernel execution state of one client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    #[default]
    Unknown,
    Created,
    Connecting,
    Connected,
    Starting,
    Ready,
    Busy,
    Idle,
    Restarting,
    Autorestarting,
    Reconnecting,
    Dead,
    Disconnected,
    ConnectionFailed,
    ConnectionDead,
    Interrupting,
    Shutdown,
}

impl ConnectionState {
    pub const ALL: [ConnectionState; 17] = [
        Self::Unknown,
        Self::Created,
        Self::Connecting,
        Self::Connected,
        Self::Starting,
        Self::Ready,
        Self::Busy,
        Self::Idle,
        Self::Restarting,
        Self::Autorestarting,
        Self::Reconnecting,
        Self::Dead,
        Self::Disconnected,
        Self::ConnectionFailed,
        Self::ConnectionDead,
        Self::Interrupting,
        Self::Shutdown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Created => "created",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Idle => "idle",
            Self::Restarting => "restarting",
            Self::Autorestarting => "autorestarting",
            Self::Reconnecting => "reconnecting",
            Self::Dead => "dead",
            Self::Disconnected => "disconnected",
            Self::ConnectionFailed => "connectionFailed",
            Self::ConnectionDead => "connectionDead",
            Self::Interrupting => "interrupting",
            Self::Shutdown => "shutdown",
        }
    }

    /// Parse a wire name, e.g. an iopub `execution_state`.
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }

    /// States after which no further traffic is expected.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Dead | Self::ConnectionDead)
    }

    /// High-frequency execution states, logged at debug.
    pub fn is_chatty(&self) -> bool {
        matches!(self, Self::Idle | Self::Busy)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

type Observer = Box<dyn FnMut(ConnectionState) + Send>;

struct Entry {
    id: u64,
    callback: Observer,
}

#[derive(Default)]
struct Registry {
    entries: Vec<Entry>,
    // unsubscribed while their entry was out for notification
    removed: Vec<u64>,
}

/// Status observers, notified synchronously in registration order.
#[derive(Default)]
pub struct StatusObservers {
    next_id: AtomicU64,
    registry: Mutex<Registry>,
}

impl StatusObservers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl FnMut(ConnectionState) + Send + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().entries.push(Entry {
            id,
            callback: Box::new(callback),
        });
        Subscription {
            id,
            observers: Arc::downgrade(self),
        }
    }

    fn unsubscribe(&self, id: u64) {
        let mut registry = self.lock();
        let before = registry.entries.len();
        registry.entries.retain(|e| e.id != id);
        if registry.entries.len() == before {
            registry.removed.push(id);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every observer with `state`.
    ///
    /// Observers run without the registry lock held, so they may subscribe or
    /// unsubscribe. Observers added during a notification first see the next one.
    pub fn notify(&self, state: ConnectionState) {
        let mut current = std::mem::take(&mut self.lock().entries);
        for entry in current.iter_mut() {
            let removed = self.lock().removed.contains(&entry.id);
            if !removed {
                (entry.callback)(state);
            }
        }

        let mut registry = self.lock();
        let removed = std::mem::take(&mut registry.removed);
        current.retain(|e| !removed.contains(&e.id));
        let added = std::mem::replace(&mut registry.entries, current);
        registry.entries.extend(added);
    }
}

/// Registration handle returned by `subscribe`.
///
/// Dropping the handle keeps the observer registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    observers: Weak<StatusObservers>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(self) {
        if let Some(observers) = self.observers.upgrade() {
            observers.unsubscribe(self.id);
        }
    }
}
