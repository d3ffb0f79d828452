//! Per-connection bridge between a local socket and a broker channel.
//!
//! A bridge starts in negotiation mode: it accumulates the client's request
//! head, validates it, opens the broker channel and announces the destination
//! with `new_connection`. Once the broker reports `connect` it relays raw
//! bytes in both directions with stop-and-wait flow control:
//!
//! - local → broker: the first chunk passes, every later chunk pauses local
//!   reads until the broker sends `drain`.
//! - broker → local: each write answers `drain` when it was absorbed, or
//!   `pause` (with the connection id) when the local backlog is full; the
//!   local socket's own drain is forwarded when the backlog empties.

use std::mem;
use std::sync::Arc;
use std::time::Duration;

use ciborium::Value;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use relaygate_core::messages::{events, query, NewConnection, TcpData, CONNECT_ACK};
use relaygate_core::request::{head_complete, head_end, validate_request, PortPolicy};
use relaygate_core::transport::{ChannelConnector, ChannelEvent, ChannelOptions, EventChannel};
use relaygate_core::GatewayResult;

use crate::engine::{EngineEvent, EngineTx};
use crate::local::{LocalEvent, LocalSocket};
use crate::notify::{Notification, NotificationBus, SocketBytes};
use crate::timer::Timer;

pub type ConnectionId = String;

/// Everything needed to open the broker channel once the request is valid.
pub struct BrokerTarget {
    pub connector: Arc<dyn ChannelConnector>,
    pub url: String,
    /// Connection-channel options with the per-connection query filled in.
    pub options: ChannelOptions,
    pub contract: Option<String>,
    pub country: String,
}

/// Whether the engine keeps the bridge after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Keep,
    Remove,
}

/// Engine state the bridge needs while handling an event.
pub struct BridgeEnv<'a> {
    pub bus: &'a NotificationBus,
    pub policy: &'a PortPolicy,
}

pub struct ConnectionBridge {
    id: ConnectionId,
    local: LocalSocket,
    target: BrokerTarget,
    broker: Option<Box<dyn EventChannel>>,
    tx: EngineTx,
    /// Destination reached; raw relay mode.
    connected: bool,
    /// Request validated and announced.
    requested: bool,
    /// Broker sent `ready`.
    acknowledged: bool,
    /// Local → broker latch.
    read_gate: bool,
    head: Vec<u8>,
    /// Host-header requests: the request itself, sent on `ready`.
    payload: Option<Vec<u8>>,
    /// CONNECT requests: bytes the client sent before the tunnel was up.
    early: Vec<u8>,
    expiration: Option<Timer>,
}

impl ConnectionBridge {
    /// Wrap an accepted stream and start the request window.
    pub fn accept(
        id: ConnectionId,
        stream: TcpStream,
        mut target: BrokerTarget,
        request_window: Duration,
        tx: EngineTx,
    ) -> Self {
        target.options.query.insert(query::CONNECTION_ID.into(), id.clone());
        target.options.query.insert(query::COUNTRY.into(), target.country.clone());
        if let Some(contract) = &target.contract {
            target.options.query.insert(query::CONTRACT.into(), contract.clone());
        }
        target.options.reconnection = false;

        let local = {
            let tx = tx.clone();
            let id = id.clone();
            LocalSocket::new(
                stream,
                Arc::new(move |event| {
                    let _ = tx.send(EngineEvent::Local(id.clone(), event));
                }),
            )
        };

        let expiration = {
            let tx = tx.clone();
            let id = id.clone();
            Timer::start(request_window, move || {
                let _ = tx.send(EngineEvent::RequestExpired(id));
            })
        };

        Self {
            id,
            local,
            target,
            broker: None,
            tx,
            connected: false,
            requested: false,
            acknowledged: false,
            read_gate: true,
            head: Vec::new(),
            payload: None,
            early: Vec::new(),
            expiration: Some(expiration),
        }
    }

    fn send(&mut self, data: TcpData) {
        if let Some(broker) = &mut self.broker {
            broker.emit(events::TCP_DATA, vec![data.to_value()]);
        }
    }

    fn open_broker(&mut self) {
        let listener = {
            let tx = self.tx.clone();
            let id = self.id.clone();
            Arc::new(move |event| {
                let _ = tx.send(EngineEvent::Broker(id.clone(), event));
            })
        };
        let mut broker = self
            .target
            .connector
            .open(&self.target.url, &self.target.options, listener);
        broker.set_auto_reconnect(false);
        self.broker = Some(broker);
    }

    fn release_broker(&mut self) {
        if let Some(mut broker) = self.broker.take() {
            broker.disconnect();
            broker.release_listeners();
        }
    }

    pub fn on_local(&mut self, event: LocalEvent, env: &BridgeEnv<'_>) -> GatewayResult<Flow> {
        match event {
            LocalEvent::Data(chunk) => {
                if let Some(chunk) = self.local.admit(chunk) {
                    self.on_local_data(chunk, env);
                    self.local.read_done();
                }
            }
            LocalEvent::Drain => self.send(TcpData::Drain),
            LocalEvent::End => self.local.end(),
            LocalEvent::Error(e) => env.bus.error("local socket", e),
            LocalEvent::Closed => {
                self.send(TcpData::Close);
                self.release_broker();
                if let Some(timer) = self.expiration.take() {
                    timer.cancel();
                }
                env.bus.emit(Notification::SocketBytes(SocketBytes {
                    connection_id: self.id.clone(),
                    read: self.local.bytes_read(),
                    written: self.local.bytes_written(),
                }));
                debug!(connection = %self.id, "local connection closed");
                return Ok(Flow::Remove);
            }
        }
        Ok(Flow::Keep)
    }

    fn on_local_data(&mut self, chunk: Vec<u8>, env: &BridgeEnv<'_>) {
        if self.connected {
            self.send(TcpData::Data(chunk));
            if self.read_gate {
                self.read_gate = false;
            } else {
                self.local.pause();
            }
            return;
        }

        if self.requested {
            // Request already announced; keep what the client sends meanwhile.
            match &mut self.payload {
                Some(payload) if !self.acknowledged => payload.extend_from_slice(&chunk),
                _ => {
                    self.early.extend_from_slice(&chunk);
                    self.flush_early();
                }
            }
            return;
        }

        self.head.extend_from_slice(&chunk);
        if !head_complete(&self.head) {
            return;
        }
        let mut head = mem::take(&mut self.head);
        let end = head_end(&head).unwrap_or(head.len());

        match validate_request(&head[..end], env.policy) {
            Err(rejection) => {
                env.bus.warning("local socket", rejection);
                self.local.destroy();
            }
            Ok(destination) => {
                debug!(
                    connection = %self.id,
                    host = %destination.host,
                    port = destination.port,
                    "new connection requested"
                );
                if destination.payload.is_some() {
                    // Proxied requests travel whole, including anything pipelined.
                    self.payload = Some(head);
                } else {
                    // CONNECT: bytes past the head wait for the acknowledgement.
                    self.early = head.split_off(end);
                }
                self.requested = true;
                self.open_broker();
                let announce = TcpData::NewConnection(NewConnection {
                    host: destination.host,
                    port: destination.port,
                    contract: self.target.contract.clone(),
                    country: self.target.country.clone(),
                });
                self.send(announce);
            }
        }
    }

    /// Forward bytes held back during a CONNECT handshake once it is done.
    fn flush_early(&mut self) {
        if self.acknowledged && !self.early.is_empty() {
            let early = mem::take(&mut self.early);
            self.send(TcpData::Data(early));
        }
    }

    pub fn on_broker(&mut self, event: ChannelEvent, env: &BridgeEnv<'_>) -> GatewayResult<()> {
        match event {
            ChannelEvent::Connected => debug!(connection = %self.id, "broker channel connected"),
            ChannelEvent::ConnectError(e) => {
                warn!(connection = %self.id, error = %e, "broker channel connect error");
                self.local.destroy();
                self.release_broker();
            }
            ChannelEvent::Disconnected(reason) => {
                debug!(connection = %self.id, reason = %reason, "broker channel disconnected");
                self.local.destroy();
                if let Some(mut broker) = self.broker.take() {
                    if reason.is_transport_failure() {
                        broker.disconnect();
                    }
                    broker.release_listeners();
                }
            }
            ChannelEvent::Error(e) => env.bus.error("broker channel", e),
            ChannelEvent::Message { event, args } => {
                if event != events::TCP_DATA {
                    debug!(connection = %self.id, event = %event, "ignoring broker event");
                    return Ok(());
                }
                let data = TcpData::from_value(args.first().unwrap_or(&Value::Null))?;
                self.on_tcp_data(data, env);
            }
        }
        Ok(())
    }

    fn on_tcp_data(&mut self, data: TcpData, env: &BridgeEnv<'_>) {
        match data {
            TcpData::Connect => {
                self.connected = true;
                self.flush_early();
            }
            TcpData::Ready => {
                if let Some(timer) = self.expiration.take() {
                    timer.cancel();
                }
                self.acknowledged = true;
                match self.payload.take() {
                    Some(payload) => self.send(TcpData::Data(payload)),
                    None => {
                        self.local.write(CONNECT_ACK);
                        self.flush_early();
                    }
                }
            }
            TcpData::Pause { .. } => self.local.pause(),
            TcpData::Drain => {
                self.read_gate = true;
                if let Some(held) = self.local.resume() {
                    self.on_local_data(held, env);
                    self.local.read_done();
                }
            }
            TcpData::Close => self.local.destroy(),
            TcpData::Data(bytes) => {
                if !self.local.is_open() {
                    return;
                }
                if self.local.write(&bytes) {
                    self.send(TcpData::Drain);
                } else {
                    self.send(TcpData::Pause {
                        connection_id: Some(self.id.clone()),
                    });
                }
            }
            TcpData::NewConnection(_) => {
                debug!(connection = %self.id, "ignoring new_connection from broker");
            }
        }
    }

    /// The request window elapsed without `ready`.
    pub fn expire(&mut self) {
        if self.expiration.take().is_none() {
            return;
        }
        debug!(connection = %self.id, "request window expired");
        if let Some(broker) = &mut self.broker {
            broker.disconnect();
        }
        self.local.destroy();
    }

    /// Tear everything down without reporting.
    pub fn shutdown(&mut self) {
        if let Some(timer) = self.expiration.take() {
            timer.cancel();
        }
        self.local.destroy();
        self.release_broker();
    }
}
