//! Gateway configuration: typed defaults plus a schema-checked overlay merge.
//!
//! Hosts either build a [`GatewayConfig`] directly or merge an untyped JSON
//! document (for example a parsed TOML file) into the defaults with
//! [`GatewayConfig::merge`]. The merge never fails: every rejected key is
//! reported as a [`ConfigWarning`] and leaves the current value untouched.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use relaygate_core::ChannelOptions;

/// Blocks that are replaced as a unit instead of merged key by key.
const PASS_THROUGH_BLOCKS: [&str; 3] = ["tcpServer", "controlChannel", "connectionChannel"];

/// Top-level gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    pub settings: Settings,
    /// Local acceptor options.
    pub tcp_server: ServerOptions,
    /// Options for the long-lived control channel.
    pub control_channel: ChannelOptions,
    /// Options for every per-connection broker channel.
    pub connection_channel: ChannelOptions,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            tcp_server: ServerOptions::default(),
            control_channel: ChannelOptions::default(),
            connection_channel: ChannelOptions::default(),
        }
    }
}

/// `settings` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Control channel endpoint.
    #[serde(rename = "tunnelingURL")]
    pub tunneling_url: String,
    /// Broker endpoint for per-connection channels.
    #[serde(rename = "connManagerURL")]
    pub conn_manager_url: String,
    /// Destination ports refused by the request validator.
    pub port_block_list: Vec<u16>,
    /// Reconnect-wait window, in seconds.
    pub timeout: f64,
    /// Per-connection handshake window, in seconds.
    pub req_timeout: f64,
    /// Only accept local clients connecting from a loopback address.
    pub only_local_conn: bool,
    /// Maximum concurrent local connections.
    pub tcp_conn_allowed: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tunneling_url: "https://localhost:49153/tunnelingRequest".to_string(),
            conn_manager_url: "https://localhost:49153/tcpClientConn".to_string(),
            port_block_list: Vec::new(),
            timeout: 60.0,
            req_timeout: 30.0,
            only_local_conn: true,
            tcp_conn_allowed: 100,
        }
    }
}

impl Settings {
    pub fn reconnect_window(&self) -> Duration {
        seconds(self.timeout)
    }

    pub fn request_window(&self) -> Duration {
        seconds(self.req_timeout)
    }
}

/// Wildcard that accepts IPv6 and IPv4-mapped peers alike, so clients that
/// resolve `localhost` to `::1` first are served too.
pub const DUAL_STACK_ANY: &str = "::";

/// `tcpServer` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerOptions {
    /// Interface the local acceptor binds to.
    pub bind_address: String,
    /// First port probed when searching for a free one. `0` lets the OS pick.
    pub base_port: u16,
    /// Set `TCP_NODELAY` on accepted sockets.
    pub no_delay: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind_address: DUAL_STACK_ANY.to_string(),
            base_port: 8000,
            no_delay: true,
        }
    }
}

/// A rejected configuration key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    /// Dotted path of the offending key (`settings.timeout`).
    pub key: String,
    pub message: String,
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key, self.message)
    }
}

impl GatewayConfig {
    /// Defaults overlaid with `overlay`.
    pub fn merged(overlay: &Value) -> (Self, Vec<ConfigWarning>) {
        let mut config = Self::default();
        let warnings = config.merge(overlay);
        (config, warnings)
    }

    /// Overlay an untyped document onto this configuration.
    ///
    /// Unknown keys and JSON type mismatches are rejected. Arrays and the
    /// pass-through blocks are replaced wholesale; other objects merge
    /// recursively. Every leaf is applied and type-checked on its own, so a
    /// bad value only leaves its own key unchanged.
    pub fn merge(&mut self, overlay: &Value) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        let Some(entries) = overlay.as_object() else {
            warnings.push(ConfigWarning {
                key: String::new(),
                message: format!("not valid options: {overlay}"),
            });
            return warnings;
        };

        let mut current = match serde_json::to_value(&*self) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                warnings.push(ConfigWarning {
                    key: String::new(),
                    message: "current configuration is not serializable".into(),
                });
                return warnings;
            }
        };

        let mut leaves = Vec::new();
        collect_leaves(&current, entries, &[], &mut leaves, &mut warnings);

        for (path, value) in leaves {
            let mut candidate = current.clone();
            if let Some(slot) = slot_mut(&mut candidate, &path) {
                *slot = value.clone();
            }
            match serde_json::from_value::<GatewayConfig>(Value::Object(candidate.clone())) {
                Ok(updated) => {
                    *self = updated;
                    current = candidate;
                }
                Err(e) => warnings.push(ConfigWarning {
                    key: path.join("."),
                    message: format!("rejected value: {e}"),
                }),
            }
        }

        warnings
    }
}

/// Walk `overlay` against the current document, collecting the values to
/// apply and reporting keys that do not fit the schema.
fn collect_leaves<'a>(
    current: &Map<String, Value>,
    overlay: &'a Map<String, Value>,
    prefix: &[String],
    leaves: &mut Vec<(Vec<String>, &'a Value)>,
    warnings: &mut Vec<ConfigWarning>,
) {
    for (key, value) in overlay {
        let mut path = prefix.to_vec();
        path.push(key.clone());

        let Some(existing) = current.get(key) else {
            warnings.push(ConfigWarning {
                key: path.join("."),
                message: "not a valid option".into(),
            });
            continue;
        };

        if kind_of(existing) != kind_of(value) {
            warnings.push(ConfigWarning {
                key: path.join("."),
                message: format!("expected {}, got {}", kind_of(existing), kind_of(value)),
            });
            continue;
        }

        let pass_through = prefix.is_empty() && PASS_THROUGH_BLOCKS.contains(&key.as_str());
        match (existing, value) {
            (Value::Object(cur), Value::Object(new)) if !pass_through => {
                collect_leaves(cur, new, &path, leaves, warnings)
            }
            _ => leaves.push((path, value)),
        }
    }
}

fn slot_mut<'m>(map: &'m mut Map<String, Value>, path: &[String]) -> Option<&'m mut Value> {
    let (last, parents) = path.split_last()?;
    let mut map = map;
    for key in parents {
        map = map.get_mut(key)?.as_object_mut()?;
    }
    map.get_mut(last)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn seconds(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
}
