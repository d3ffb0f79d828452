//! Concrete event-channel transports.
//!
//! The engine only talks to [`relaygate_core::EventChannel`]; the default
//! connector opens WebSocket channels.

pub mod websocket;

#[cfg(test)]
pub(crate) mod mock;

pub use websocket::{WebSocketChannel, WebSocketConnector};
