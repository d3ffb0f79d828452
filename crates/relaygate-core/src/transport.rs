//! Abstract event-channel capability.
//!
//! Both the long-lived control channel and every per-connection broker
//! channel are named-event duplex channels: connect, disconnect, emit a named
//! event with arguments, receive named events, carry mutable query
//! parameters, and optionally reconnect on their own. Any message-oriented
//! transport that can frame named messages satisfies [`EventChannel`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use ciborium::Value;
use serde::{Deserialize, Serialize};

/// Why a channel disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The remote service closed the session on purpose.
    ServerInitiated,
    /// We called [`EventChannel::disconnect`].
    ClientInitiated,
    /// The underlying stream ended without a close handshake.
    TransportClose,
    /// The underlying stream failed.
    TransportError,
    /// Nothing was heard from the remote within the keep-alive window.
    PingTimeout,
}

impl DisconnectReason {
    /// Reasons after which the transport would try to reconnect by itself.
    pub fn is_transport_failure(self) -> bool {
        matches!(
            self,
            Self::TransportClose | Self::TransportError | Self::PingTimeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ServerInitiated => "io server disconnect",
            Self::ClientInitiated => "io client disconnect",
            Self::TransportClose => "transport close",
            Self::TransportError => "transport error",
            Self::PingTimeout => "ping timeout",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a channel reports to its listener.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    ConnectError(String),
    Disconnected(DisconnectReason),
    Error(String),
    Message { event: String, args: Vec<Value> },
}

/// Receives every event of one channel. Dropped on
/// [`EventChannel::release_listeners`].
pub type ChannelListener = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

/// Outgoing query parameters attached to every (re)connect attempt.
pub type Query = BTreeMap<String, String>;

/// A named-event duplex channel.
///
/// All methods are non-blocking; results of `connect`/`disconnect` arrive as
/// [`ChannelEvent`]s through the listener.
pub trait EventChannel: Send {
    /// Start connecting if not already connected or connecting.
    fn connect(&mut self);

    /// Close the session. Reports `Disconnected(ClientInitiated)` if it was
    /// connected.
    fn disconnect(&mut self);

    /// Queue a named event for sending.
    fn emit(&mut self, event: &str, args: Vec<Value>);

    /// Whether the session is currently established.
    fn is_connected(&self) -> bool;

    /// Set a query parameter used from the next connect attempt on.
    fn set_query_param(&mut self, key: &str, value: &str);

    /// Current outgoing query parameters.
    fn query(&self) -> Query;

    /// Enable or disable the channel's own reconnection.
    fn set_auto_reconnect(&mut self, enabled: bool);

    /// Detach the listener; no further events are delivered.
    fn release_listeners(&mut self);
}

/// Opens event channels. The connector decides the concrete transport.
pub trait ChannelConnector: Send + Sync {
    /// Create a channel to `url` and start connecting it.
    fn open(
        &self,
        url: &str,
        options: &ChannelOptions,
        listener: ChannelListener,
    ) -> Box<dyn EventChannel>;
}

/// Options for one event channel. Passed through to the transport as a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelOptions {
    /// Query parameters appended to the channel URL.
    pub query: Query,
    /// Extra request headers for the connection handshake.
    pub headers: BTreeMap<String, String>,
    /// Whether the channel reconnects by itself after transport failures.
    pub reconnection: bool,
    pub reconnection_delay_ms: u64,
    pub reconnection_delay_max_ms: u64,
    pub ping_interval_ms: u64,
    pub ping_timeout_ms: u64,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            query: Query::new(),
            headers: BTreeMap::new(),
            reconnection: true,
            reconnection_delay_ms: 1000,
            reconnection_delay_max_ms: 5000,
            ping_interval_ms: 25_000,
            ping_timeout_ms: 20_000,
        }
    }
}
