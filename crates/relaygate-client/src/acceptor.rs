//! Local TCP acceptor.
//!
//! Binds the first free port at or above the configured base port and runs an
//! accept loop that hands every accepted stream to a listener. Connection
//! accounting lives with the caller, which owns the connection map; the
//! acceptor only carries the current cap.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ServerOptions, DUAL_STACK_ANY};

/// What the accept loop reports.
#[derive(Debug)]
pub enum AcceptEvent {
    Accepted(TcpStream, SocketAddr),
    Error(String),
}

pub type AcceptListener = Arc<dyn Fn(AcceptEvent) + Send + Sync>;

pub struct LocalAcceptor {
    port: u16,
    /// Hard cap on concurrent local connections.
    pub max_connections: usize,
    no_delay: bool,
    task: JoinHandle<()>,
}

impl LocalAcceptor {
    /// Bind and start accepting.
    pub async fn bind(
        options: &ServerOptions,
        max_connections: usize,
        listener: AcceptListener,
    ) -> io::Result<Self> {
        let tcp = match bind_first_free(&options.bind_address, options.base_port).await {
            // Hosts without IPv6 cannot bind the dual-stack wildcard.
            Err(e) if options.bind_address == DUAL_STACK_ANY => {
                warn!(error = %e, "dual-stack bind failed, falling back to IPv4");
                bind_first_free("0.0.0.0", options.base_port).await?
            }
            bound => bound?,
        };
        let port = tcp.local_addr()?.port();
        info!(addr = %options.bind_address, port, "local acceptor listening");

        let task = tokio::spawn(accept_loop(tcp, listener));
        Ok(Self {
            port,
            max_connections,
            no_delay: options.no_delay,
            task,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Apply per-socket options to a freshly accepted stream.
    pub fn prepare(&self, stream: &TcpStream) {
        if self.no_delay {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(error = %e, "set_nodelay failed");
            }
        }
    }

    /// Stop accepting. Already accepted sockets are unaffected.
    pub fn close(&self) {
        self.task.abort();
    }
}

impl Drop for LocalAcceptor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(tcp: TcpListener, listener: AcceptListener) {
    loop {
        match tcp.accept().await {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "local connection accepted");
                listener(AcceptEvent::Accepted(stream, peer));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                listener(AcceptEvent::Error(e.to_string()));
                // Transient errors (EMFILE and friends) would spin otherwise.
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

/// Bind the first port in `base..=65535` that is not in use. A base of `0`
/// lets the OS choose.
pub async fn bind_first_free(addr: &str, base: u16) -> io::Result<TcpListener> {
    if base == 0 {
        return TcpListener::bind((addr, 0)).await;
    }

    let mut last_err = None;
    for port in base..=u16::MAX {
        match TcpListener::bind((addr, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => last_err = Some(e),
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrInUse, "no free port")))
}

/// Loopback check covering IPv4, IPv6, and IPv4-mapped IPv6 peers.
pub fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.to_ipv4_mapped().map_or(false, |v4| v4.is_loopback())
        }
    }
}
