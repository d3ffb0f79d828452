//! relaygate-core: shared protocol library for the relaygate tunneling gateway.
//!
//! Provides the error type, the event names and `tcp_data` sub-events spoken
//! with the tunneling and broker services, CBOR event framing, the
//! initial-request validator, and the abstract event-channel traits.

pub mod codec;
pub mod error;
pub mod messages;
pub mod request;
pub mod transport;

// Re-export commonly used items at crate root.
pub use codec::{cbor_to_json, cbor_to_string, decode_event, encode_event, EventFrame};
pub use error::{GatewayError, GatewayResult};
pub use messages::{events, NewConnection, TcpData, CONNECT_ACK};
pub use request::{validate_request, Destination, PortPolicy, Rejection};
pub use transport::{
    ChannelConnector, ChannelEvent, ChannelListener, ChannelOptions, DisconnectReason,
    EventChannel, Query,
};
