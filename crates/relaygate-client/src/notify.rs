//! Consumer-facing notifications and the bus that delivers them.
//!
//! Every notification belongs to exactly one [`NotificationKind`]; hosts
//! subscribe by kind. The bus keeps a bounded history so notifications raised
//! before anyone subscribed (for example configuration warnings during
//! construction) can still be inspected.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

/// Notification catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Errors,
    Warnings,
    Info,
    TunnelStatus,
    SocketBytes,
    ConnectionPoints,
    ConnectionPointUnreachable,
    IpAssigned,
    Gateway,
    IdAssigned,
    Channel,
}

impl NotificationKind {
    pub const ALL: [NotificationKind; 11] = [
        Self::Errors,
        Self::Warnings,
        Self::Info,
        Self::TunnelStatus,
        Self::SocketBytes,
        Self::ConnectionPoints,
        Self::ConnectionPointUnreachable,
        Self::IpAssigned,
        Self::Gateway,
        Self::IdAssigned,
        Self::Channel,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Errors => "errors",
            Self::Warnings => "warnings",
            Self::Info => "info",
            Self::TunnelStatus => "tunnel_status",
            Self::SocketBytes => "socket_bytes",
            Self::ConnectionPoints => "connection_points",
            Self::ConnectionPointUnreachable => "connection_point_unreachable",
            Self::IpAssigned => "ip_assigned",
            Self::Gateway => "gateway",
            Self::IdAssigned => "id_assigned",
            Self::Channel => "channel",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tunnel session status changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    Ready,
    PeerBroken,
    PeerClosed,
    PeerDown,
    ServerBroken,
    ServerClosed,
    ServerConnected,
    ServerDown,
}

impl TunnelStatus {
    pub fn message(self) -> &'static str {
        match self {
            Self::Ready => "tunnel ready",
            Self::PeerBroken => "peer tunnel broken",
            Self::PeerClosed => "tunnel closed by peer",
            Self::PeerDown => "peer down",
            Self::ServerBroken => "server tunnel broken",
            Self::ServerClosed => "tunnel closed by server",
            Self::ServerConnected => "connected with server",
            Self::ServerDown => "server down",
        }
    }
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// An error or warning report: where it happened and what went wrong.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Report {
    pub source: String,
    pub message: String,
}

impl Report {
    pub fn new(source: impl Into<String>, message: impl fmt::Display) -> Self {
        Self {
            source: source.into(),
            message: message.to_string(),
        }
    }
}

/// Byte counters of a closed local connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SocketBytes {
    pub connection_id: String,
    pub read: u64,
    pub written: u64,
}

/// Where local clients should connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayAddress {
    pub host: String,
    pub port: u16,
}

/// A notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Notification {
    Error(Report),
    Warning(Report),
    Info(String),
    TunnelStatus(TunnelStatus),
    SocketBytes(SocketBytes),
    ConnectionPoints(serde_json::Value),
    ConnectionPointUnreachable(serde_json::Value),
    IpAssigned(serde_json::Value),
    Gateway(GatewayAddress),
    IdAssigned(String),
    Channel(serde_json::Value),
}

impl Notification {
    pub fn kind(&self) -> NotificationKind {
        match self {
            Self::Error(_) => NotificationKind::Errors,
            Self::Warning(_) => NotificationKind::Warnings,
            Self::Info(_) => NotificationKind::Info,
            Self::TunnelStatus(_) => NotificationKind::TunnelStatus,
            Self::SocketBytes(_) => NotificationKind::SocketBytes,
            Self::ConnectionPoints(_) => NotificationKind::ConnectionPoints,
            Self::ConnectionPointUnreachable(_) => NotificationKind::ConnectionPointUnreachable,
            Self::IpAssigned(_) => NotificationKind::IpAssigned,
            Self::Gateway(_) => NotificationKind::Gateway,
            Self::IdAssigned(_) => NotificationKind::IdAssigned,
            Self::Channel(_) => NotificationKind::Channel,
        }
    }
}

/// Subscription handle returned by [`NotificationBus::subscribe`].
pub type SubscriptionId = u64;

/// Subscriber callback.
pub type Handler = Arc<dyn Fn(&Notification) + Send + Sync>;

struct BusState {
    subscriptions: HashMap<NotificationKind, Vec<(SubscriptionId, Handler)>>,
    history: VecDeque<Notification>,
    history_limit: usize,
    next_sub_id: SubscriptionId,
    closed: bool,
}

/// A shared, cloneable notification bus.
///
/// Handlers run on the emitting task, outside the bus lock, so a handler may
/// subscribe or unsubscribe without deadlocking.
#[derive(Clone)]
pub struct NotificationBus {
    state: Arc<Mutex<BusState>>,
}

impl NotificationBus {
    pub fn new(history_limit: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                subscriptions: HashMap::new(),
                history: VecDeque::new(),
                history_limit,
                next_sub_id: 1,
                closed: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        // A panicking handler never runs under the lock, so poisoning only
        // means a panic elsewhere; the state itself is still consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribe one handler to several kinds under a single id.
    pub fn subscribe(&self, kinds: &[NotificationKind], handler: Handler) -> SubscriptionId {
        let mut state = self.lock();
        let id = state.next_sub_id;
        state.next_sub_id += 1;
        if state.closed {
            return id;
        }
        for kind in kinds {
            state
                .subscriptions
                .entry(*kind)
                .or_default()
                .push((id, handler.clone()));
        }
        id
    }

    /// Remove a subscription everywhere. Returns true if it existed.
    pub fn unsubscribe(&self, sub_id: SubscriptionId) -> bool {
        let mut state = self.lock();
        let mut found = false;
        for subs in state.subscriptions.values_mut() {
            let before = subs.len();
            subs.retain(|(id, _)| *id != sub_id);
            found |= subs.len() < before;
        }
        found
    }

    /// Remove every subscriber of the given kinds.
    pub fn unsubscribe_kinds(&self, kinds: &[NotificationKind]) {
        let mut state = self.lock();
        for kind in kinds {
            state.subscriptions.remove(kind);
        }
    }

    /// Deliver a notification to the subscribers of its kind.
    pub fn emit(&self, notification: Notification) {
        let handlers: Vec<Handler> = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            let handlers = state
                .subscriptions
                .get(&notification.kind())
                .map(|subs| subs.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default();
            state.history.push_back(notification.clone());
            while state.history.len() > state.history_limit {
                state.history.pop_front();
            }
            handlers
        };

        for handler in handlers {
            handler(&notification);
        }
    }

    /// Past notifications, optionally filtered by kind.
    pub fn history(&self, kind: Option<NotificationKind>) -> Vec<Notification> {
        let state = self.lock();
        state
            .history
            .iter()
            .filter(|n| kind.map_or(true, |k| n.kind() == k))
            .cloned()
            .collect()
    }

    pub fn subscriber_count(&self, kind: NotificationKind) -> usize {
        self.lock()
            .subscriptions
            .get(&kind)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Drop every subscriber and silence the bus for good.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.subscriptions.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    // Convenience emitters used throughout the engine.

    pub fn error(&self, source: &str, message: impl fmt::Display) {
        tracing::error!(source, error = %message, "gateway error");
        self.emit(Notification::Error(Report::new(source, message)));
    }

    pub fn warning(&self, source: &str, message: impl fmt::Display) {
        tracing::warn!(source, warning = %message, "gateway warning");
        self.emit(Notification::Warning(Report::new(source, message)));
    }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{}", message);
        self.emit(Notification::Info(message));
    }

    pub fn tunnel_status(&self, status: TunnelStatus) {
        tracing::info!(status = %status, "tunnel status");
        self.emit(Notification::TunnelStatus(status));
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(256)
    }
}
