//! Initial-request parsing for newly accepted local connections.
//!
//! A local client either opens with an HTTP `CONNECT host:port HTTP/1.1`
//! request (the payload follows after the handshake) or sends a plain
//! proxied request whose `Host:` header names the destination (the request
//! itself is the payload).

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

/// Upper bound on bytes buffered while waiting for a complete request head.
pub const MAX_REQUEST_HEAD: usize = 16 * 1024;

/// Port used when the request names a host without a port.
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("Bad Request")]
    BadRequest,
    #[error("Invalid Port")]
    InvalidPort,
}

/// A validated destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub host: String,
    pub port: u16,
    /// The original bytes when the request was not a CONNECT; forwarded once
    /// the broker is ready.
    pub payload: Option<Vec<u8>>,
}

/// Destination-port policy: the valid range minus a block list.
#[derive(Debug, Clone, Default)]
pub struct PortPolicy {
    blocked: HashSet<u16>,
}

impl PortPolicy {
    pub fn new(block_list: &[u16]) -> Self {
        Self {
            blocked: block_list.iter().copied().collect(),
        }
    }

    /// A port is valid iff it lies in `0..=65535` and is not blocked.
    pub fn is_allowed(&self, port: u64) -> bool {
        match u16::try_from(port) {
            Ok(p) => !self.blocked.contains(&p),
            Err(_) => false,
        }
    }
}

fn connect_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)CONNECT (.+(:[0-9]+)?) HTTP").expect("static CONNECT pattern")
    })
}

fn host_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)Host: (.+(:[0-9]+)?)\r\n").expect("static Host pattern")
    })
}

/// Whether `buf` holds a complete request head or enough bytes to give up
/// waiting for one.
pub fn head_complete(buf: &[u8]) -> bool {
    buf.len() >= MAX_REQUEST_HEAD || head_end(buf).is_some()
}

/// Offset just past the blank line ending the request head, if present.
pub fn head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|at| at + 4)
}

/// Parse and validate the first bytes sent by a local client.
pub fn validate_request(data: &[u8], policy: &PortPolicy) -> Result<Destination, Rejection> {
    let text = String::from_utf8_lossy(data);

    let (address, is_connect) = if let Some(caps) = connect_pattern().captures(&text) {
        (caps[1].to_string(), true)
    } else if let Some(caps) = host_pattern().captures(&text) {
        (caps[1].to_string(), false)
    } else {
        return Err(Rejection::BadRequest);
    };

    let mut parts = address.split(':');
    let host = parts.next().unwrap_or_default().to_string();
    let port = match parts.next() {
        None => u64::from(DEFAULT_HTTP_PORT),
        Some(raw) => parse_leading_int(raw).ok_or(Rejection::InvalidPort)?,
    };

    if !policy.is_allowed(port) {
        return Err(Rejection::InvalidPort);
    }
    let port = u16::try_from(port).map_err(|_| Rejection::InvalidPort)?;

    Ok(Destination {
        host,
        port,
        payload: (!is_connect).then(|| data.to_vec()),
    })
}

/// Parse the leading decimal digits of `raw` (`"443abc"` → 443).
fn parse_leading_int(raw: &str) -> Option<u64> {
    let digits: String = raw
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}
