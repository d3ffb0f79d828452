//! Public entry point.
//!
//! [`Gateway`] spawns the engine task, forwards commands to it, and exposes
//! the notification bus. It must be created inside a Tokio runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use relaygate_core::messages::query;
use relaygate_core::transport::ChannelConnector;
use relaygate_core::{GatewayError, GatewayResult};

use crate::config::GatewayConfig;
use crate::engine::{Command, Engine, EngineEvent, EngineTx};
use crate::notify::{Notification, NotificationBus, NotificationKind, SubscriptionId};
use crate::session::Credentials;
use crate::transport::WebSocketConnector;

pub struct Gateway {
    tx: EngineTx,
    bus: NotificationBus,
    config: Mutex<GatewayConfig>,
    closed: AtomicBool,
    engine: JoinHandle<()>,
}

impl Gateway {
    /// Start a gateway talking WebSocket to the configured services.
    pub fn new(config: GatewayConfig) -> Self {
        Self::with_connector(config, Arc::new(WebSocketConnector))
    }

    /// Start a gateway on top of any event-channel transport.
    pub fn with_connector(config: GatewayConfig, connector: Arc<dyn ChannelConnector>) -> Self {
        Self::start(config, connector, NotificationBus::default())
    }

    /// Start from an untyped overlay on the default configuration. Rejected
    /// keys are reported as warnings, kept in the notification history.
    pub fn from_overlay(
        overlay: &serde_json::Value,
        connector: Arc<dyn ChannelConnector>,
    ) -> Self {
        let (config, warnings) = GatewayConfig::merged(overlay);
        let bus = NotificationBus::default();
        for warning in warnings {
            bus.warning("config", warning);
        }
        Self::start(config, connector, bus)
    }

    fn start(
        config: GatewayConfig,
        connector: Arc<dyn ChannelConnector>,
        bus: NotificationBus,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Engine::new(config.clone(), connector, bus.clone(), tx.clone());
        let engine = tokio::spawn(engine.run(rx));

        tracing::info!(url = %config.settings.tunneling_url, "gateway started");
        Self {
            tx,
            bus,
            config: Mutex::new(config),
            closed: AtomicBool::new(false),
            engine,
        }
    }

    fn command(&self, command: Command) -> GatewayResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::Channel("gateway is closed".into()));
        }
        self.tx
            .send(EngineEvent::Command(command))
            .map_err(|_| GatewayError::Channel("gateway engine stopped".into()))
    }

    /// Ask to join `room` (case-insensitive).
    pub fn connect_to(&self, room: &str) -> GatewayResult<()> {
        self.command(Command::ConnectTo(room.to_string()))
    }

    /// Request the room list; it arrives as a `connection_points` notification.
    pub fn check_connection_points(&self) -> GatewayResult<()> {
        self.command(Command::CheckConnectionPoints)
    }

    /// Use new credentials from the control channel's next connect attempt on.
    pub fn change_credentials(&self, credentials: Credentials) -> GatewayResult<()> {
        {
            let mut config = self.config.lock().unwrap_or_else(|e| e.into_inner());
            let params = &mut config.control_channel.query;
            params.insert(query::USER.into(), credentials.user.clone());
            params.insert(query::PASS.into(), credentials.pass.clone());
        }
        self.command(Command::ChangeCredentials(credentials))
    }

    pub fn events_list(&self) -> &'static [NotificationKind] {
        &NotificationKind::ALL
    }

    pub fn add_event<F>(&self, kinds: &[NotificationKind], handler: F) -> SubscriptionId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.bus.subscribe(kinds, Arc::new(handler))
    }

    /// Drop every subscriber of the given kinds.
    pub fn remove_event(&self, kinds: &[NotificationKind]) {
        self.bus.unsubscribe_kinds(kinds);
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    pub fn history(&self, kind: Option<NotificationKind>) -> Vec<Notification> {
        self.bus.history(kind)
    }

    pub fn config(&self) -> GatewayConfig {
        self.config.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Tear everything down. No notification is delivered once this starts;
    /// later calls return immediately.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.bus.close();

        let (ack, done) = oneshot::channel();
        if self
            .tx
            .send(EngineEvent::Command(Command::Close(ack)))
            .is_ok()
        {
            let _ = done.await;
        }
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.bus.close();
        self.engine.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use ciborium::Value;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::{sleep, timeout};

    use relaygate_core::messages::{events, NewConnection, TcpData, CONNECT_ACK};
    use relaygate_core::transport::{ChannelEvent, DisconnectReason};

    use crate::acceptor::AcceptEvent;
    use crate::notify::{GatewayAddress, TunnelStatus};
    use crate::transport::mock::{MockConnector, MockHandle};

    fn test_config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.settings.timeout = 0.2;
        config.settings.req_timeout = 0.3;
        config.tcp_server.bind_address = "127.0.0.1".into();
        config.tcp_server.base_port = 0;
        config
    }

    async fn eventually(what: &str, cond: impl Fn() -> bool) {
        for _ in 0..300 {
            if cond() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    fn statuses(gateway: &Gateway) -> Vec<TunnelStatus> {
        gateway
            .history(Some(NotificationKind::TunnelStatus))
            .into_iter()
            .filter_map(|n| match n {
                Notification::TunnelStatus(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    struct Harness {
        gateway: Gateway,
        connector: MockConnector,
        control: MockHandle,
        port: u16,
    }

    /// Gateway with user id `u1`, joined to room `EU`, tunnel ready.
    async fn ready_gateway(config: GatewayConfig) -> Harness {
        let connector = MockConnector::new();
        let gateway = Gateway::with_connector(config, Arc::new(connector.clone()));
        let control = connector.channel(0).await;

        control.inject_message(events::USER_ID, vec![Value::Text("u1".into())]);
        gateway.connect_to("eu").unwrap();
        control.inject_message(events::TUNNELING_READY, vec![Value::Bool(true)]);

        eventually("gateway address", || {
            !gateway.history(Some(NotificationKind::Gateway)).is_empty()
        })
        .await;
        let port = match &gateway.history(Some(NotificationKind::Gateway))[0] {
            Notification::Gateway(GatewayAddress { host, port }) => {
                assert_eq!(host, "localhost");
                *port
            }
            other => panic!("unexpected {other:?}"),
        };

        Harness {
            gateway,
            connector,
            control,
            port,
        }
    }

    /// Connect a local client and complete the CONNECT handshake.
    async fn tunnel(h: &Harness, broker_index: usize) -> (TcpStream, MockHandle) {
        let mut client = TcpStream::connect(("127.0.0.1", h.port)).await.unwrap();
        client
            .write_all(b"CONNECT host:1 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let broker = h.connector.channel(broker_index).await;
        eventually("new_connection", || !broker.emitted_tcp().is_empty()).await;

        broker.inject_tcp(TcpData::Ready);
        let mut ack = vec![0u8; CONNECT_ACK.len()];
        timeout(Duration::from_secs(5), client.read_exact(&mut ack))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ack, CONNECT_ACK);
        broker.inject_tcp(TcpData::Connect);
        (client, broker)
    }

    async fn expect_eof(client: &mut TcpStream) {
        let mut buf = [0u8; 64];
        let read = timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("socket closed in time");
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    fn data_sent(broker: &MockHandle) -> Vec<Vec<u8>> {
        broker
            .emitted_tcp()
            .into_iter()
            .filter_map(|d| match d {
                TcpData::Data(bytes) => Some(bytes),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn connect_request_end_to_end() {
        let h = ready_gateway(test_config()).await;

        assert_eq!(h.control.query()["userID"], "u1");
        assert!(h
            .control
            .emitted()
            .contains(&(events::TUNNELING_REQUEST.to_string(), vec![Value::Text("EU".into())])));
        assert_eq!(
            h.gateway.history(Some(NotificationKind::IdAssigned)),
            vec![Notification::IdAssigned("u1".into())]
        );
        assert_eq!(
            statuses(&h.gateway),
            vec![TunnelStatus::ServerConnected, TunnelStatus::Ready]
        );

        let mut client = TcpStream::connect(("127.0.0.1", h.port)).await.unwrap();
        client
            .write_all(b"CONNECT host:1 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        let broker = h.connector.channel(1).await;
        eventually("new_connection", || !broker.emitted_tcp().is_empty()).await;
        assert_eq!(
            broker.emitted_tcp()[0],
            TcpData::NewConnection(NewConnection {
                host: "host".into(),
                port: 1,
                contract: None,
                country: "EU".into(),
            })
        );
        let query = broker.query();
        assert_eq!(query["userID"], "u1");
        assert_eq!(query["country"], "EU");
        assert!(!query["connectionID"].is_empty());
        assert!(!broker.auto_reconnect());
        assert_eq!(broker.url, GatewayConfig::default().settings.conn_manager_url);

        broker.inject_tcp(TcpData::Ready);
        let mut ack = vec![0u8; CONNECT_ACK.len()];
        client.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack, b"HTTP/1.1 200 OK \r\n\r\n");

        sleep(Duration::from_millis(50)).await;
        assert!(data_sent(&broker).is_empty());
        assert_eq!(broker.emitted_tcp().len(), 1);
    }

    #[tokio::test]
    async fn pipelined_connect_bytes_follow_the_ack() {
        let h = ready_gateway(test_config()).await;
        let mut client = TcpStream::connect(("127.0.0.1", h.port)).await.unwrap();
        client
            .write_all(b"CONNECT host:1 HTTP/1.1\r\n\r\nEARLY")
            .await
            .unwrap();

        let broker = h.connector.channel(1).await;
        eventually("new_connection", || !broker.emitted_tcp().is_empty()).await;
        assert!(data_sent(&broker).is_empty());

        broker.inject_tcp(TcpData::Ready);
        let mut ack = vec![0u8; CONNECT_ACK.len()];
        timeout(Duration::from_secs(5), client.read_exact(&mut ack))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ack, CONNECT_ACK);
        broker.inject_tcp(TcpData::Connect);

        eventually("early bytes", || !data_sent(&broker).is_empty()).await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(data_sent(&broker), vec![b"EARLY".to_vec()]);
    }

    #[tokio::test]
    async fn contract_travels_with_new_connections() {
        let connector = MockConnector::new();
        let gateway = Gateway::with_connector(test_config(), Arc::new(connector.clone()));
        let control = connector.channel(0).await;
        control.inject_message(events::CONTRACT, vec![Value::Text("c-9".into())]);
        control.inject_message(events::TUNNELING_READY, vec![Value::Bool(true)]);
        eventually("gateway address", || {
            !gateway.history(Some(NotificationKind::Gateway)).is_empty()
        })
        .await;
        assert_eq!(control.query()["contract"], "c-9");

        let port = match &gateway.history(Some(NotificationKind::Gateway))[0] {
            Notification::Gateway(addr) => addr.port,
            _ => unreachable!(),
        };
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let broker = connector.channel(1).await;
        eventually("new_connection", || !broker.emitted_tcp().is_empty()).await;
        assert_eq!(
            broker.emitted_tcp()[0],
            TcpData::NewConnection(NewConnection {
                host: "example.com".into(),
                port: 443,
                contract: Some("c-9".into()),
                country: "AR".into(),
            })
        );
        assert_eq!(broker.query()["contract"], "c-9");
    }

    #[tokio::test]
    async fn host_header_request_forwards_payload_on_ready() {
        let h = ready_gateway(test_config()).await;
        let request = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let mut client = TcpStream::connect(("127.0.0.1", h.port)).await.unwrap();
        client.write_all(request).await.unwrap();

        let broker = h.connector.channel(1).await;
        eventually("new_connection", || !broker.emitted_tcp().is_empty()).await;
        match &broker.emitted_tcp()[0] {
            TcpData::NewConnection(conn) => {
                assert_eq!(conn.host, "example.com");
                assert_eq!(conn.port, 80);
            }
            other => panic!("unexpected {other:?}"),
        }

        broker.inject_tcp(TcpData::Ready);
        eventually("payload", || !data_sent(&broker).is_empty()).await;
        assert_eq!(data_sent(&broker), vec![request.to_vec()]);

        // No CONNECT acknowledgement for proxied requests.
        let mut buf = [0u8; 8];
        assert!(timeout(Duration::from_millis(100), client.read(&mut buf))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn invalid_requests_are_dropped() {
        let mut config = test_config();
        config.settings.port_block_list = vec![22];
        let h = ready_gateway(config).await;

        let mut bad = TcpStream::connect(("127.0.0.1", h.port)).await.unwrap();
        bad.write_all(b"HELLO\r\n\r\n").await.unwrap();
        expect_eof(&mut bad).await;

        let mut blocked = TcpStream::connect(("127.0.0.1", h.port)).await.unwrap();
        blocked
            .write_all(b"CONNECT host:22 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        expect_eof(&mut blocked).await;

        eventually("warnings", || {
            h.gateway.history(Some(NotificationKind::Warnings)).len() == 2
        })
        .await;
        let messages: Vec<String> = h
            .gateway
            .history(Some(NotificationKind::Warnings))
            .into_iter()
            .filter_map(|n| match n {
                Notification::Warning(r) => Some(r.message),
                _ => None,
            })
            .collect();
        assert_eq!(messages, vec!["Bad Request", "Invalid Port"]);
        // Only the control channel was ever opened.
        assert_eq!(h.connector.channels().len(), 1);
    }

    #[tokio::test]
    async fn relays_data_both_ways() {
        let h = ready_gateway(test_config()).await;
        let (mut client, broker) = tunnel(&h, 1).await;

        client.write_all(b"ping").await.unwrap();
        eventually("upstream data", || data_sent(&broker) == vec![b"ping".to_vec()]).await;

        broker.inject_tcp(TcpData::Data(b"pong".to_vec()));
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
        eventually("drain answer", || {
            broker.emitted_tcp().last() == Some(&TcpData::Drain)
        })
        .await;
    }

    #[tokio::test]
    async fn unflushed_write_answers_pause_then_drain() {
        let h = ready_gateway(test_config()).await;
        let (mut client, broker) = tunnel(&h, 1).await;
        let id = broker.query()["connectionID"].clone();

        broker.inject_tcp(TcpData::Data(vec![9u8; 64 * 1024]));
        eventually("pause", || {
            broker.emitted_tcp().contains(&TcpData::Pause {
                connection_id: Some(id.clone()),
            })
        })
        .await;
        let sent = broker.emitted_tcp();
        let pause_at = sent
            .iter()
            .position(|d| matches!(d, TcpData::Pause { .. }))
            .unwrap();
        assert!(!sent[..pause_at].contains(&TcpData::Drain));

        let mut buf = vec![0u8; 64 * 1024];
        client.read_exact(&mut buf).await.unwrap();
        eventually("drain", || broker.emitted_tcp().last() == Some(&TcpData::Drain)).await;
    }

    #[tokio::test]
    async fn read_gate_is_stop_and_wait() {
        let h = ready_gateway(test_config()).await;
        let (mut client, broker) = tunnel(&h, 1).await;

        client.write_all(b"a").await.unwrap();
        eventually("first chunk", || data_sent(&broker).len() == 1).await;
        client.write_all(b"b").await.unwrap();
        eventually("second chunk", || data_sent(&broker).len() == 2).await;

        // Second chunk closed the gate; nothing more until the broker drains.
        client.write_all(b"c").await.unwrap();
        sleep(Duration::from_millis(150)).await;
        assert_eq!(data_sent(&broker).len(), 2);

        broker.inject_tcp(TcpData::Drain);
        eventually("third chunk", || data_sent(&broker).len() == 3).await;
        assert_eq!(data_sent(&broker)[2], b"c".to_vec());
    }

    #[tokio::test]
    async fn local_close_tears_down_the_bridge() {
        let h = ready_gateway(test_config()).await;
        let (client, broker) = tunnel(&h, 1).await;
        let id = broker.query()["connectionID"].clone();
        drop(client);

        eventually("socket bytes", || {
            !h.gateway.history(Some(NotificationKind::SocketBytes)).is_empty()
        })
        .await;
        match &h.gateway.history(Some(NotificationKind::SocketBytes))[0] {
            Notification::SocketBytes(bytes) => {
                assert_eq!(bytes.connection_id, id);
                assert_eq!(bytes.read, b"CONNECT host:1 HTTP/1.1\r\n\r\n".len() as u64);
                assert_eq!(bytes.written, CONNECT_ACK.len() as u64);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(broker.emitted_tcp().contains(&TcpData::Close));
        assert!(!broker.is_connected());
        assert!(!broker.has_listener());
    }

    #[tokio::test]
    async fn broker_close_and_disconnect_drop_the_socket() {
        let h = ready_gateway(test_config()).await;

        let (mut first, broker) = tunnel(&h, 1).await;
        broker.inject_tcp(TcpData::Close);
        expect_eof(&mut first).await;

        let (mut second, broker) = tunnel(&h, 2).await;
        broker.inject(ChannelEvent::Disconnected(DisconnectReason::TransportError));
        expect_eof(&mut second).await;
        eventually("listener released", || !broker.has_listener()).await;
        assert!(broker.disconnects() >= 1);
    }

    #[tokio::test]
    async fn request_window_expires() {
        let h = ready_gateway(test_config()).await;
        let mut client = TcpStream::connect(("127.0.0.1", h.port)).await.unwrap();
        client
            .write_all(b"CONNECT host:1 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let broker = h.connector.channel(1).await;

        // No `ready` within the window.
        expect_eof(&mut client).await;
        assert!(!broker.is_connected());
        eventually("socket bytes", || {
            !h.gateway.history(Some(NotificationKind::SocketBytes)).is_empty()
        })
        .await;
    }

    #[tokio::test]
    async fn connection_cap_refuses_extra_sockets() {
        let mut config = test_config();
        config.settings.tcp_conn_allowed = 1;
        let h = ready_gateway(config).await;

        let (_first, _broker) = tunnel(&h, 1).await;
        let mut second = TcpStream::connect(("127.0.0.1", h.port)).await.unwrap();
        expect_eof(&mut second).await;
        assert_eq!(h.connector.channels().len(), 2);
    }

    #[tokio::test]
    async fn readiness_cancels_reconnect_timer() {
        let h = ready_gateway(test_config()).await;

        h.control
            .inject(ChannelEvent::Disconnected(DisconnectReason::TransportClose));
        h.control.inject(ChannelEvent::Connected);
        h.control
            .inject_message(events::TUNNELING_READY, vec![Value::Bool(true)]);

        sleep(Duration::from_millis(400)).await;
        let seen = statuses(&h.gateway);
        assert!(seen.contains(&TunnelStatus::ServerBroken));
        assert!(!seen.contains(&TunnelStatus::PeerDown));
        assert!(!seen.contains(&TunnelStatus::ServerDown));
        // The acceptor is reused.
        assert_eq!(h.gateway.history(Some(NotificationKind::Gateway)).len(), 1);
    }

    #[tokio::test]
    async fn silent_server_is_reported_down() {
        let h = ready_gateway(test_config()).await;
        h.control
            .inject(ChannelEvent::Disconnected(DisconnectReason::TransportError));

        eventually("server down", || {
            statuses(&h.gateway).contains(&TunnelStatus::ServerDown)
        })
        .await;
        assert!(!h.control.auto_reconnect());
        assert!(h.control.disconnects() >= 1);
        let info = h.gateway.history(Some(NotificationKind::Info));
        assert!(info.contains(&Notification::Info("tunnel disconnect".into())));

        // Rejoining reconnects, and the room request follows on send-ready.
        h.gateway.connect_to("us").unwrap();
        eventually("reconnect", || h.control.is_connected()).await;
        assert!(h.control.auto_reconnect());
        h.control
            .inject_message(events::TUNNEL_READY_FOR_SEND_DATA, vec![]);
        eventually("room request", || {
            h.control
                .emitted()
                .contains(&(events::TUNNELING_REQUEST.to_string(), vec![Value::Text("US".into())]))
        })
        .await;
    }

    #[tokio::test]
    async fn broken_peer_is_reported_down() {
        let h = ready_gateway(test_config()).await;
        h.control.inject_message(
            events::TUNNELING_READY,
            vec![Value::Bool(false), Value::Bool(false)],
        );
        eventually("peer down", || {
            statuses(&h.gateway).contains(&TunnelStatus::PeerDown)
        })
        .await;
        assert!(statuses(&h.gateway).contains(&TunnelStatus::PeerBroken));
        assert!(h.control.is_connected());
    }

    #[tokio::test]
    async fn peer_close_does_not_wait_for_reconnect() {
        let h = ready_gateway(test_config()).await;
        h.control.inject_message(
            events::TUNNELING_READY,
            vec![Value::Bool(false), Value::Bool(true)],
        );
        sleep(Duration::from_millis(400)).await;
        let seen = statuses(&h.gateway);
        assert!(seen.contains(&TunnelStatus::PeerClosed));
        assert!(!seen.contains(&TunnelStatus::PeerDown));
    }

    #[tokio::test]
    async fn server_close_reconnects_on_demand() {
        let h = ready_gateway(test_config()).await;
        h.control
            .inject(ChannelEvent::Disconnected(DisconnectReason::ServerInitiated));
        eventually("server closed", || {
            statuses(&h.gateway).contains(&TunnelStatus::ServerClosed)
        })
        .await;

        h.gateway.check_connection_points().unwrap();
        eventually("room list request", || {
            h.control
                .emitted()
                .iter()
                .any(|(name, _)| name == events::ROOM_LIST)
        })
        .await;
        assert!(h.control.is_connected());
        assert_eq!(h.control.connects(), 2);
    }

    #[tokio::test]
    async fn control_events_become_notifications() {
        let connector = MockConnector::new();
        let gateway = Gateway::with_connector(test_config(), Arc::new(connector.clone()));
        let control = connector.channel(0).await;

        let rooms = Arc::new(AtomicUsize::new(0));
        let counter = rooms.clone();
        gateway.add_event(&[NotificationKind::ConnectionPoints], move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        control.inject_message(
            events::ROOM_LIST,
            vec![Value::Array(vec![Value::Text("EU".into())])],
        );
        control.inject_message(events::CONNECT_TO_ROOM_FAILED, vec![Value::Text("full".into())]);
        control.inject_message(events::CONNECTION_ADDRESS, vec![Value::Text("10.0.0.9".into())]);
        control.inject_message(events::USER_CHANNEL_CONF, vec![Value::Text("conf".into())]);
        control.inject(ChannelEvent::Error("boom".into()));

        eventually("notifications", || {
            !gateway.history(Some(NotificationKind::Errors)).is_empty()
        })
        .await;
        assert_eq!(rooms.load(Ordering::SeqCst), 1);
        assert_eq!(
            gateway.history(Some(NotificationKind::ConnectionPoints)),
            vec![Notification::ConnectionPoints(serde_json::json!(["EU"]))]
        );
        assert_eq!(
            gateway.history(Some(NotificationKind::ConnectionPointUnreachable)),
            vec![Notification::ConnectionPointUnreachable(serde_json::json!("full"))]
        );
        assert_eq!(
            gateway.history(Some(NotificationKind::IpAssigned)),
            vec![Notification::IpAssigned(serde_json::json!("10.0.0.9"))]
        );
        assert_eq!(
            gateway.history(Some(NotificationKind::Channel)),
            vec![Notification::Channel(serde_json::json!("conf"))]
        );

        gateway.remove_event(&[NotificationKind::ConnectionPoints]);
        control.inject_message(events::ROOM_LIST, vec![Value::Array(vec![])]);
        eventually("second room list", || {
            gateway.history(Some(NotificationKind::ConnectionPoints)).len() == 2
        })
        .await;
        assert_eq!(rooms.load(Ordering::SeqCst), 1);
        assert_eq!(gateway.events_list().len(), 11);
    }

    #[tokio::test]
    async fn credentials_apply_to_the_next_connect() {
        let connector = MockConnector::new();
        let gateway = Gateway::with_connector(test_config(), Arc::new(connector.clone()));
        let control = connector.channel(0).await;

        gateway
            .change_credentials(Credentials {
                user: "bob".into(),
                pass: "secret".into(),
            })
            .unwrap();
        eventually("query update", || control.query().contains_key("user")).await;
        assert_eq!(control.query()["pass"], "secret");
        assert_eq!(control.connects(), 1);
        assert_eq!(gateway.config().control_channel.query["user"], "bob");
    }

    #[tokio::test]
    async fn overlay_warnings_are_kept_in_history() {
        let gateway = Gateway::from_overlay(
            &serde_json::json!({"settings": {"timeout": "soon"}, "bogus": 1}),
            Arc::new(MockConnector::new()),
        );
        assert_eq!(gateway.history(Some(NotificationKind::Warnings)).len(), 2);
        assert_eq!(gateway.config().settings.timeout, 60.0);
    }

    #[tokio::test]
    async fn close_is_silent_and_idempotent() {
        let h = ready_gateway(test_config()).await;
        let (mut client, broker) = tunnel(&h, 1).await;

        // Leave a reconnect window pending across close.
        h.control.inject_message(
            events::TUNNELING_READY,
            vec![Value::Bool(false), Value::Bool(false)],
        );

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        h.gateway.add_event(&NotificationKind::ALL, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        h.gateway.close().await;
        let after_close = seen.load(Ordering::SeqCst);

        expect_eof(&mut client).await;
        sleep(Duration::from_millis(400)).await;
        assert_eq!(seen.load(Ordering::SeqCst), after_close);

        assert!(!h.control.is_connected());
        assert!(!h.control.has_listener());
        assert!(!broker.has_listener());
        assert!(TcpStream::connect(("127.0.0.1", h.port)).await.is_err());

        h.gateway.close().await;
        assert!(h.gateway.is_closed());
        assert!(h.gateway.connect_to("eu").is_err());
    }

    async fn accepted_pair() -> (TcpStream, TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn remote_peer() -> SocketAddr {
        "203.0.113.7:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn remote_peers_are_refused_when_local_only() {
        let h = ready_gateway(test_config()).await;
        let (mut client, server) = accepted_pair().await;
        h.gateway
            .tx
            .send(EngineEvent::Accept(AcceptEvent::Accepted(server, remote_peer())))
            .unwrap();

        expect_eof(&mut client).await;
        assert_eq!(h.connector.channels().len(), 1);
    }

    #[tokio::test]
    async fn remote_peers_are_served_when_local_only_is_off() {
        let mut config = test_config();
        config.settings.only_local_conn = false;
        let h = ready_gateway(config).await;
        let (mut client, server) = accepted_pair().await;
        h.gateway
            .tx
            .send(EngineEvent::Accept(AcceptEvent::Accepted(server, remote_peer())))
            .unwrap();

        client
            .write_all(b"CONNECT host:1 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let broker = h.connector.channel(1).await;
        eventually("new_connection", || !broker.emitted_tcp().is_empty()).await;
    }

    #[tokio::test]
    async fn broker_connect_error_drops_the_socket() {
        let h = ready_gateway(test_config()).await;
        let mut client = TcpStream::connect(("127.0.0.1", h.port)).await.unwrap();
        client
            .write_all(b"CONNECT host:1 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let broker = h.connector.channel(1).await;
        eventually("new_connection", || !broker.emitted_tcp().is_empty()).await;

        broker.inject(ChannelEvent::ConnectError("connection refused".into()));
        expect_eof(&mut client).await;
        eventually("listener released", || !broker.has_listener()).await;
        assert!(broker.disconnects() >= 1);
        assert!(!broker.is_connected());
    }

    #[tokio::test]
    async fn client_initiated_disconnect_is_quiet() {
        let h = ready_gateway(test_config()).await;
        h.control
            .inject(ChannelEvent::Disconnected(DisconnectReason::ClientInitiated));

        eventually("disconnect info", || {
            h.gateway
                .history(Some(NotificationKind::Info))
                .contains(&Notification::Info("tunnel disconnect".into()))
        })
        .await;
        sleep(Duration::from_millis(400)).await;
        assert_eq!(
            statuses(&h.gateway),
            vec![TunnelStatus::ServerConnected, TunnelStatus::Ready]
        );
    }

    #[tokio::test]
    async fn acceptor_bind_failure_is_reported() {
        let mut config = test_config();
        // TEST-NET-1: never assigned to a local interface.
        config.tcp_server.bind_address = "192.0.2.1".into();
        let connector = MockConnector::new();
        let gateway = Gateway::with_connector(config, Arc::new(connector.clone()));
        let control = connector.channel(0).await;
        control.inject_message(events::TUNNELING_READY, vec![Value::Bool(true)]);

        eventually("acceptor error", || {
            !gateway.history(Some(NotificationKind::Errors)).is_empty()
        })
        .await;
        match &gateway.history(Some(NotificationKind::Errors))[0] {
            Notification::Error(report) => {
                assert_eq!(report.source, "local acceptor");
                assert!(report.message.starts_with("io error"), "{}", report.message);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(gateway.history(Some(NotificationKind::Gateway)).is_empty());
    }
}
