//! Control-channel session with the tunneling service.
//!
//! Tracks who we are (user id, contract), which room we asked for and which
//! one we are in, and whether the tunnel is ready. Unsolicited breakage
//! starts a reconnect window; if the tunnel is not ready again when it
//! elapses, the session reports the peer or the server as down.

use std::time::Duration;

use ciborium::Value;
use tracing::debug;

use relaygate_core::codec::{cbor_to_json, cbor_to_string};
use relaygate_core::messages::{events, query};
use relaygate_core::transport::{
    ChannelConnector, ChannelEvent, DisconnectReason, EventChannel, Query,
};
use relaygate_core::GatewayResult;

use crate::config::GatewayConfig;
use crate::engine::{EngineEvent, EngineTx};
use crate::notify::{Notification, NotificationBus, TunnelStatus};
use crate::timer::Timer;

pub const DEFAULT_ROOM: &str = "AR";

/// What the engine must do after a control event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Idle,
    /// The tunnel became ready; make sure the local acceptor runs.
    TunnelReady,
}

/// `user` / `pass` attached to the control channel's next connect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub pass: String,
}

pub struct TunnelSession {
    channel: Box<dyn EventChannel>,
    auto_reconnect: bool,
    room: String,
    requested_room: Option<String>,
    contract: Option<String>,
    user_id: Option<String>,
    ready: bool,
    active_device: bool,
    conn_closed: bool,
    reconnect_window: Duration,
    reconnect_timer: Option<Timer>,
    reconnect_gen: u64,
    tx: EngineTx,
}

impl TunnelSession {
    /// Open the control channel.
    pub fn open(connector: &dyn ChannelConnector, config: &GatewayConfig, tx: EngineTx) -> Self {
        let listener = {
            let tx = tx.clone();
            std::sync::Arc::new(move |event| {
                let _ = tx.send(EngineEvent::Control(event));
            })
        };
        let channel = connector.open(
            &config.settings.tunneling_url,
            &config.control_channel,
            listener,
        );

        Self {
            channel,
            auto_reconnect: config.control_channel.reconnection,
            room: DEFAULT_ROOM.to_string(),
            requested_room: None,
            contract: None,
            user_id: None,
            ready: false,
            active_device: false,
            conn_closed: false,
            reconnect_window: config.settings.reconnect_window(),
            reconnect_timer: None,
            reconnect_gen: 0,
            tx,
        }
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn contract(&self) -> Option<&str> {
        self.contract.as_deref()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Query of the control channel; per-connection channels start from it.
    pub fn query(&self) -> Query {
        self.channel.query()
    }

    pub fn on_event(
        &mut self,
        event: ChannelEvent,
        bus: &NotificationBus,
    ) -> GatewayResult<SessionOutcome> {
        match event {
            ChannelEvent::Connected => bus.tunnel_status(TunnelStatus::ServerConnected),
            ChannelEvent::ConnectError(e) => {
                bus.error("control channel", format!("connection error: {e}"))
            }
            ChannelEvent::Error(e) => bus.error("control channel", e),
            ChannelEvent::Disconnected(reason) => self.on_disconnect(reason, bus),
            ChannelEvent::Message { event, args } => return self.on_message(&event, args, bus),
        }
        Ok(SessionOutcome::Idle)
    }

    fn on_disconnect(&mut self, reason: DisconnectReason, bus: &NotificationBus) {
        match reason {
            DisconnectReason::ServerInitiated => {
                self.conn_closed = true;
                bus.tunnel_status(TunnelStatus::ServerClosed);
            }
            DisconnectReason::ClientInitiated => {}
            _ => {
                bus.tunnel_status(TunnelStatus::ServerBroken);
                if self.active_device {
                    self.start_reconnect_timer();
                }
            }
        }
        self.ready = false;
        bus.info("tunnel disconnect");
    }

    fn on_message(
        &mut self,
        event: &str,
        args: Vec<Value>,
        bus: &NotificationBus,
    ) -> GatewayResult<SessionOutcome> {
        let first = args.first().cloned().unwrap_or(Value::Null);

        match event {
            events::USER_ID => {
                let id = cbor_to_string(&first);
                self.channel.set_query_param(query::USER_ID, &id);
                self.user_id = Some(id.clone());
                bus.emit(Notification::IdAssigned(id));
            }
            events::USER_CHANNEL_CONF => bus.emit(Notification::Channel(cbor_to_json(&first))),
            events::CONTRACT => {
                let contract = cbor_to_string(&first);
                self.channel.set_query_param(query::CONTRACT, &contract);
                self.contract = Some(contract);
            }
            events::CONNECTION_ADDRESS => bus.emit(Notification::IpAssigned(cbor_to_json(&first))),
            events::ROOM_LIST => bus.emit(Notification::ConnectionPoints(cbor_to_json(&first))),
            events::CONNECT_TO_ROOM_FAILED => {
                bus.emit(Notification::ConnectionPointUnreachable(cbor_to_json(&first)))
            }
            events::TUNNELING_READY => {
                let ready = truthy(&first);
                let peer_closed = args.get(1).map_or(false, truthy);
                return Ok(self.on_tunnel_ready(ready, peer_closed, bus));
            }
            events::TUNNEL_READY_FOR_SEND_DATA => {
                if self.conn_closed {
                    if let Some(room) = &self.requested_room {
                        self.channel
                            .emit(events::TUNNELING_REQUEST, vec![Value::Text(room.clone())]);
                    }
                }
                self.conn_closed = false;
            }
            other => debug!(event = other, "ignoring control event"),
        }
        Ok(SessionOutcome::Idle)
    }

    fn on_tunnel_ready(
        &mut self,
        ready: bool,
        peer_closed: bool,
        bus: &NotificationBus,
    ) -> SessionOutcome {
        self.ready = ready;
        if ready {
            self.cancel_reconnect_timer();
            self.active_device = true;
            if let Some(room) = &self.requested_room {
                self.room = room.clone();
            }
            bus.tunnel_status(TunnelStatus::Ready);
            return SessionOutcome::TunnelReady;
        }

        if peer_closed {
            bus.tunnel_status(TunnelStatus::PeerClosed);
        } else {
            self.start_reconnect_timer();
            bus.tunnel_status(TunnelStatus::PeerBroken);
        }
        SessionOutcome::Idle
    }

    /// Start the reconnect window, replacing a running one.
    fn start_reconnect_timer(&mut self) {
        self.reconnect_gen += 1;
        let gen = self.reconnect_gen;
        let tx = self.tx.clone();
        self.reconnect_timer = Some(Timer::start(self.reconnect_window, move || {
            let _ = tx.send(EngineEvent::ReconnectExpired(gen));
        }));
    }

    fn cancel_reconnect_timer(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.cancel();
        }
        // Invalidate an expiry that is already queued.
        self.reconnect_gen += 1;
    }

    pub fn on_reconnect_expired(&mut self, gen: u64, bus: &NotificationBus) {
        if gen != self.reconnect_gen || self.reconnect_timer.take().is_none() {
            return;
        }

        if self.channel.is_connected() {
            if self.active_device {
                bus.tunnel_status(TunnelStatus::PeerDown);
            }
        } else {
            self.conn_closed = true;
            bus.tunnel_status(TunnelStatus::ServerDown);
            self.channel.set_auto_reconnect(false);
            self.channel.disconnect();
        }
    }

    fn reconnect(&mut self) {
        self.channel.set_auto_reconnect(self.auto_reconnect);
        self.channel.connect();
    }

    pub fn connect_to(&mut self, room: &str) {
        self.cancel_reconnect_timer();
        let room = room.to_uppercase();
        self.requested_room = Some(room.clone());
        if self.conn_closed {
            self.reconnect();
        } else {
            self.channel
                .emit(events::TUNNELING_REQUEST, vec![Value::Text(room)]);
        }
    }

    pub fn check_connection_points(&mut self) {
        if self.conn_closed {
            self.reconnect();
        }
        self.channel.emit(events::ROOM_LIST, Vec::new());
    }

    pub fn change_credentials(&mut self, credentials: &Credentials) {
        self.channel.set_query_param(query::USER, &credentials.user);
        self.channel.set_query_param(query::PASS, &credentials.pass);
    }

    /// Stop the reconnect window and close the control channel for good.
    pub fn shutdown(&mut self) {
        self.cancel_reconnect_timer();
        self.channel.set_auto_reconnect(false);
        self.channel.disconnect();
        self.channel.release_listeners();
    }
}

/// JavaScript-style truthiness of an event argument.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Integer(i) => i128::from(*i) != 0,
        Value::Float(f) => *f != 0.0 && !f.is_nan(),
        Value::Text(s) => !s.is_empty(),
        _ => true,
    }
}
