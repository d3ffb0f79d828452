//! The gateway engine: one task owning all gateway state.
//!
//! Channel listeners, socket tasks, the accept loop and timers only post
//! [`EngineEvent`]s; the engine applies them one at a time. A handler that
//! fails is reported as an error notification and the loop carries on.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};
use uuid::Uuid;

use relaygate_core::request::PortPolicy;
use relaygate_core::transport::{ChannelConnector, ChannelEvent};
use relaygate_core::GatewayResult;

use crate::acceptor::{is_loopback, AcceptEvent, LocalAcceptor};
use crate::bridge::{BridgeEnv, BrokerTarget, ConnectionBridge, ConnectionId, Flow};
use crate::config::GatewayConfig;
use crate::local::LocalEvent;
use crate::notify::{GatewayAddress, Notification, NotificationBus};
use crate::session::{Credentials, SessionOutcome, TunnelSession};

/// Requests from the [`crate::Gateway`] façade.
#[derive(Debug)]
pub enum Command {
    ConnectTo(String),
    CheckConnectionPoints,
    ChangeCredentials(Credentials),
    Close(oneshot::Sender<()>),
}

#[derive(Debug)]
pub enum EngineEvent {
    Command(Command),
    Control(ChannelEvent),
    ReconnectExpired(u64),
    Accept(AcceptEvent),
    Local(ConnectionId, LocalEvent),
    Broker(ConnectionId, ChannelEvent),
    RequestExpired(ConnectionId),
}

pub type EngineTx = mpsc::UnboundedSender<EngineEvent>;

pub struct Engine {
    config: GatewayConfig,
    connector: Arc<dyn ChannelConnector>,
    bus: NotificationBus,
    policy: PortPolicy,
    session: TunnelSession,
    acceptor: Option<LocalAcceptor>,
    connections: HashMap<ConnectionId, ConnectionBridge>,
    tx: EngineTx,
}

impl Engine {
    /// Open the control channel; events start flowing into `tx`.
    pub fn new(
        config: GatewayConfig,
        connector: Arc<dyn ChannelConnector>,
        bus: NotificationBus,
        tx: EngineTx,
    ) -> Self {
        let session = TunnelSession::open(connector.as_ref(), &config, tx.clone());
        Self {
            policy: PortPolicy::new(&config.settings.port_block_list),
            config,
            connector,
            bus,
            session,
            acceptor: None,
            connections: HashMap::new(),
            tx,
        }
    }

    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<EngineEvent>) {
        while let Some(event) = rx.recv().await {
            if let EngineEvent::Command(Command::Close(ack)) = event {
                self.shutdown();
                let _ = ack.send(());
                break;
            }
            if let Err(e) = self.handle(event).await {
                self.bus.error("gateway", e);
            }
        }
        debug!("gateway engine stopped");
    }

    async fn handle(&mut self, event: EngineEvent) -> GatewayResult<()> {
        match event {
            EngineEvent::Command(command) => self.on_command(command),
            EngineEvent::Control(event) => {
                if self.session.on_event(event, &self.bus)? == SessionOutcome::TunnelReady {
                    if let Err(e) = self.ensure_acceptor().await {
                        self.bus.error("local acceptor", e);
                    }
                }
            }
            EngineEvent::ReconnectExpired(gen) => self.session.on_reconnect_expired(gen, &self.bus),
            EngineEvent::Accept(AcceptEvent::Accepted(stream, peer)) => self.on_accept(stream, peer),
            EngineEvent::Accept(AcceptEvent::Error(e)) => self.bus.error("local acceptor", e),
            EngineEvent::Local(id, event) => {
                let env = BridgeEnv {
                    bus: &self.bus,
                    policy: &self.policy,
                };
                if let Some(bridge) = self.connections.get_mut(&id) {
                    if bridge.on_local(event, &env)? == Flow::Remove {
                        self.connections.remove(&id);
                    }
                }
            }
            EngineEvent::Broker(id, event) => {
                let env = BridgeEnv {
                    bus: &self.bus,
                    policy: &self.policy,
                };
                if let Some(bridge) = self.connections.get_mut(&id) {
                    bridge.on_broker(event, &env)?;
                }
            }
            EngineEvent::RequestExpired(id) => {
                if let Some(bridge) = self.connections.get_mut(&id) {
                    bridge.expire();
                }
            }
        }
        Ok(())
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::ConnectTo(room) => self.session.connect_to(&room),
            Command::CheckConnectionPoints => self.session.check_connection_points(),
            Command::ChangeCredentials(credentials) => {
                self.session.change_credentials(&credentials)
            }
            // Handled by the run loop.
            Command::Close(_) => {}
        }
    }

    /// Start the acceptor on first readiness; afterwards lift a throttled cap
    /// once no connections are left.
    async fn ensure_acceptor(&mut self) -> GatewayResult<()> {
        let allowed = self.config.settings.tcp_conn_allowed;
        if let Some(acceptor) = &mut self.acceptor {
            if self.connections.is_empty() {
                acceptor.max_connections = allowed;
            }
            return Ok(());
        }

        let listener = {
            let tx = self.tx.clone();
            Arc::new(move |event| {
                let _ = tx.send(EngineEvent::Accept(event));
            })
        };
        let acceptor = LocalAcceptor::bind(&self.config.tcp_server, allowed, listener).await?;
        let port = acceptor.port();
        self.acceptor = Some(acceptor);
        self.bus.emit(Notification::Gateway(GatewayAddress {
            host: "localhost".to_string(),
            port,
        }));
        self.bus.info(format!("tcp server listening on port {port}"));
        Ok(())
    }

    fn on_accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        let Some(acceptor) = &self.acceptor else {
            return;
        };
        if self.config.settings.only_local_conn && !is_loopback(peer.ip()) {
            debug!(peer = %peer, "refusing non-local connection");
            return;
        }
        if self.connections.len() >= acceptor.max_connections {
            debug!(peer = %peer, limit = acceptor.max_connections, "connection limit reached");
            return;
        }
        acceptor.prepare(&stream);

        let id = Uuid::new_v4().to_string();
        let mut options = self.config.connection_channel.clone();
        options.query = self.session.query();
        options.query.extend(self.config.connection_channel.query.clone());

        let target = BrokerTarget {
            connector: self.connector.clone(),
            url: self.config.settings.conn_manager_url.clone(),
            options,
            contract: self.session.contract().map(str::to_string),
            country: self.session.room().to_string(),
        };
        debug!(
            connection = %id,
            peer = %peer,
            user = ?self.session.user_id(),
            ready = self.session.is_ready(),
            "local connection accepted"
        );
        let bridge = ConnectionBridge::accept(
            id.clone(),
            stream,
            target,
            self.config.settings.request_window(),
            self.tx.clone(),
        );
        self.connections.insert(id, bridge);
    }

    fn shutdown(&mut self) {
        if let Some(acceptor) = self.acceptor.take() {
            acceptor.close();
        }
        self.session.shutdown();
        for (_, mut bridge) in self.connections.drain() {
            bridge.shutdown();
        }
        info!("gateway closed");
    }
}
