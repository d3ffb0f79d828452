//! Wire vocabulary shared with the tunneling and connection-broker services.
//!
//! The control channel speaks named events (see [`events`]); every
//! per-connection broker channel speaks a single `tcp_data` event whose
//! payload is a map tagged by an `event` field, modelled here as [`TcpData`].

use ciborium::Value;

use crate::error::{GatewayError, GatewayResult};

/// Named events exchanged with the remote services. Bit-exact.
pub mod events {
    pub const TUNNELING_READY: &str = "tunneling_ready";
    pub const ROOM_LIST: &str = "room_list";
    pub const CONNECT_TO_ROOM_FAILED: &str = "connect_to_room_failed";
    pub const TUNNELING_REQUEST: &str = "tunneling_request";
    pub const CONTRACT: &str = "contract";
    pub const CONNECTION_ADDRESS: &str = "connection_address";
    pub const USER_ID: &str = "user_id";
    pub const USER_CHANNEL_CONF: &str = "user_channel_conf";
    pub const TUNNEL_READY_FOR_SEND_DATA: &str = "tunnel_ready_for_send_data";
    pub const TCP_DATA: &str = "tcp_data";
}

/// Query parameter names attached to outgoing channel connections.
pub mod query {
    pub const USER_ID: &str = "userID";
    pub const CONNECTION_ID: &str = "connectionID";
    pub const CONTRACT: &str = "contract";
    pub const COUNTRY: &str = "country";
    pub const USER: &str = "user";
    pub const PASS: &str = "pass";
}

/// Acknowledgement written to a local client once the broker reports the
/// destination reachable for a CONNECT request.
pub const CONNECT_ACK: &[u8] = b"HTTP/1.1 200 OK \r\n\r\n";

/// Destination announced to the broker in a `new_connection` sub-event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConnection {
    pub host: String,
    pub port: u16,
    pub contract: Option<String>,
    pub country: String,
}

/// A `tcp_data` sub-event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcpData {
    /// Destination reached; the bridge switches to raw relay mode.
    Connect,
    /// Broker is ready to receive the tunneled payload.
    Ready,
    /// Stop reading; `connection_id` is attached when the gateway sends it.
    Pause { connection_id: Option<String> },
    /// Resume reading.
    Drain,
    Close,
    NewConnection(NewConnection),
    Data(Vec<u8>),
}

impl TcpData {
    /// The sub-event tag as it appears on the wire.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Ready => "ready",
            Self::Pause { .. } => "pause",
            Self::Drain => "drain",
            Self::Close => "close",
            Self::NewConnection(_) => "new_connection",
            Self::Data(_) => "data",
        }
    }

    /// Encode into the map carried by a `tcp_data` event.
    pub fn to_value(&self) -> Value {
        let mut map = vec![(text("event"), text(self.tag()))];
        match self {
            Self::Pause {
                connection_id: Some(id),
            } => map.push((text(query::CONNECTION_ID), text(id))),
            Self::NewConnection(conn) => {
                let contract = match &conn.contract {
                    Some(c) => text(c),
                    None => Value::Null,
                };
                let data = vec![
                    (text("host"), text(&conn.host)),
                    (text("port"), Value::Integer(conn.port.into())),
                    (text("contract"), contract),
                    (text("country"), text(&conn.country)),
                ];
                map.push((text("data"), Value::Map(data)));
            }
            Self::Data(bytes) => map.push((text("pakg"), Value::Bytes(bytes.clone()))),
            _ => {}
        }
        Value::Map(map)
    }

    /// Decode the map carried by a `tcp_data` event.
    ///
    /// Unknown tags carrying a `pakg` are treated as data, matching the
    /// broker's fallthrough behaviour.
    pub fn from_value(value: &Value) -> GatewayResult<Self> {
        let map = value
            .as_map()
            .ok_or_else(|| GatewayError::InvalidMessage("tcp_data payload is not a map".into()))?;
        let tag = lookup(map, "event").and_then(Value::as_text).unwrap_or("");

        let parsed = match tag {
            "connect" => Self::Connect,
            "ready" => Self::Ready,
            "pause" => Self::Pause {
                connection_id: lookup(map, query::CONNECTION_ID)
                    .and_then(Value::as_text)
                    .map(str::to_string),
            },
            "drain" => Self::Drain,
            "close" => Self::Close,
            "new_connection" => {
                let data = lookup(map, "data").and_then(Value::as_map).ok_or_else(|| {
                    GatewayError::InvalidMessage("new_connection without data".into())
                })?;
                let host = lookup(data, "host")
                    .and_then(Value::as_text)
                    .ok_or_else(|| GatewayError::InvalidMessage("new_connection without host".into()))?;
                let port = lookup(data, "port")
                    .and_then(Value::as_integer)
                    .and_then(|i| u16::try_from(i).ok())
                    .ok_or_else(|| GatewayError::InvalidMessage("new_connection without port".into()))?;
                Self::NewConnection(NewConnection {
                    host: host.to_string(),
                    port,
                    contract: lookup(data, "contract")
                        .and_then(Value::as_text)
                        .map(str::to_string),
                    country: lookup(data, "country")
                        .and_then(Value::as_text)
                        .unwrap_or_default()
                        .to_string(),
                })
            }
            other => match lookup(map, "pakg") {
                Some(Value::Bytes(b)) => Self::Data(b.clone()),
                Some(Value::Text(t)) => Self::Data(t.as_bytes().to_vec()),
                _ => {
                    return Err(GatewayError::InvalidMessage(format!(
                        "tcp_data '{other}' without pakg"
                    )))
                }
            },
        };
        Ok(parsed)
    }
}

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

/// Look up a text key in a CBOR map.
pub fn lookup<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| k.as_text() == Some(key))
        .map(|(_, v)| v)
}
