//! relaygate-client: the client-side tunneling gateway.
//!
//! A [`Gateway`] keeps a control channel open to the tunneling service,
//! joins a room on request, and once the tunnel is ready serves a local TCP
//! port that behaves like an HTTP CONNECT proxy. Every accepted connection is
//! relayed through its own broker channel with pause/drain backpressure.
//!
//! # Quick Start
//!
//! ```no_run
//! use relaygate_client::{Gateway, GatewayConfig, Notification, NotificationKind};
//!
//! # async fn example() -> relaygate_core::GatewayResult<()> {
//! let gateway = Gateway::new(GatewayConfig::default());
//! gateway.add_event(&[NotificationKind::Gateway], |n: &Notification| {
//!     if let Notification::Gateway(addr) = n {
//!         println!("proxy listening on {}:{}", addr.host, addr.port);
//!     }
//! });
//! gateway.connect_to("eu")?;
//!
//! // ... later
//! gateway.close().await;
//! # Ok(())
//! # }
//! ```

pub mod acceptor;
pub mod config;
pub mod gateway;
pub mod local;
pub mod notify;
pub mod timer;
pub mod transport;

mod bridge;
mod engine;
mod session;

// Re-export primary public types.
pub use config::{ConfigWarning, GatewayConfig, ServerOptions, Settings};
pub use gateway::Gateway;
pub use notify::{
    GatewayAddress, Handler, Notification, NotificationBus, NotificationKind, Report,
    SocketBytes, SubscriptionId, TunnelStatus,
};
pub use session::{Credentials, DEFAULT_ROOM};
pub use transport::{WebSocketChannel, WebSocketConnector};

// Re-export relaygate-core error types for convenience.
pub use relaygate_core::{GatewayError, GatewayResult};
