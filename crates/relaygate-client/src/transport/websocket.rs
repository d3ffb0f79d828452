//! WebSocket event channel.
//!
//! One WebSocket per channel; every named event travels as a single binary
//! message holding a CBOR `[name, args...]` array. A driver task owns the
//! socket, reconnects with exponential backoff after transport failures, and
//! reports everything to the channel's listener.
//!
//! Disconnect reasons map as follows:
//! - close frame from the server → `ServerInitiated`
//! - stream ended without a close frame → `TransportClose`
//! - read/write failure → `TransportError`
//! - nothing heard for `ping_interval + ping_timeout` → `PingTimeout`

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ciborium::Value;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use relaygate_core::codec::{decode_event, encode_event, EventFrame};
use relaygate_core::error::{GatewayError, GatewayResult};
use relaygate_core::transport::{
    ChannelConnector, ChannelEvent, ChannelListener, ChannelOptions, DisconnectReason,
    EventChannel, Query,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens [`WebSocketChannel`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl ChannelConnector for WebSocketConnector {
    fn open(
        &self,
        url: &str,
        options: &ChannelOptions,
        listener: ChannelListener,
    ) -> Box<dyn EventChannel> {
        let mut channel = WebSocketChannel::new(url, options.clone(), listener);
        channel.connect();
        Box::new(channel)
    }
}

/// Driver-side instruction.
enum Outgoing {
    Frame(Vec<u8>),
    Close,
}

/// State shared between the channel handle and its driver task.
struct Shared {
    listener: Mutex<Option<ChannelListener>>,
    query: Mutex<Query>,
    connected: AtomicBool,
    auto_reconnect: AtomicBool,
}

impl Shared {
    fn notify(&self, stopped: &AtomicBool, event: ChannelEvent) {
        if stopped.load(Ordering::SeqCst) {
            return;
        }
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(listener) = listener {
            listener(event);
        }
    }

    fn query_snapshot(&self) -> Query {
        self.query.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// A running driver task.
struct Driver {
    tx: mpsc::UnboundedSender<Outgoing>,
    stopped: Arc<AtomicBool>,
    handle: tokio::task::JoinHandle<()>,
}

/// A named-event channel over WebSocket.
pub struct WebSocketChannel {
    url: String,
    options: ChannelOptions,
    shared: Arc<Shared>,
    driver: Option<Driver>,
    /// Frames emitted while no driver runs; flushed on the next connect.
    pending: Vec<Vec<u8>>,
}

impl WebSocketChannel {
    pub fn new(url: &str, options: ChannelOptions, listener: ChannelListener) -> Self {
        let shared = Arc::new(Shared {
            listener: Mutex::new(Some(listener)),
            query: Mutex::new(options.query.clone()),
            connected: AtomicBool::new(false),
            auto_reconnect: AtomicBool::new(options.reconnection),
        });
        Self {
            url: url.to_string(),
            options,
            shared,
            driver: None,
            pending: Vec::new(),
        }
    }

    fn stop_driver(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.stopped.store(true, Ordering::SeqCst);
            let _ = driver.tx.send(Outgoing::Close);
        }
    }
}

impl EventChannel for WebSocketChannel {
    fn connect(&mut self) {
        if let Some(driver) = &self.driver {
            if !driver.handle.is_finished() {
                return;
            }
        }
        self.driver = None;

        let (tx, rx) = mpsc::unbounded_channel();
        for frame in self.pending.drain(..) {
            let _ = tx.send(Outgoing::Frame(frame));
        }
        let stopped = Arc::new(AtomicBool::new(false));

        let handle = {
            let url = self.url.clone();
            let options = self.options.clone();
            let shared = self.shared.clone();
            let stopped = stopped.clone();
            tokio::spawn(async move {
                drive(url, options, shared, stopped, rx).await;
            })
        };

        self.driver = Some(Driver {
            tx,
            stopped,
            handle,
        });
    }

    fn disconnect(&mut self) {
        self.stop_driver();
        if self.shared.connected.swap(false, Ordering::SeqCst) {
            let listener = self
                .shared
                .listener
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            if let Some(listener) = listener {
                listener(ChannelEvent::Disconnected(DisconnectReason::ClientInitiated));
            }
        }
    }

    fn emit(&mut self, event: &str, args: Vec<Value>) {
        let frame = match encode_event(&EventFrame::new(event, args)) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(event, error = %e, "failed to encode event");
                return;
            }
        };
        let unsent = match &self.driver {
            Some(driver) => match driver.tx.send(Outgoing::Frame(frame)) {
                Ok(()) => None,
                Err(mpsc::error::SendError(Outgoing::Frame(frame))) => Some(frame),
                Err(_) => None,
            },
            None => Some(frame),
        };
        // Keep frames for the next connect when no driver is running.
        if let Some(frame) = unsent {
            self.pending.push(frame);
        }
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn set_query_param(&mut self, key: &str, value: &str) {
        self.shared
            .query
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
    }

    fn query(&self) -> Query {
        self.shared.query_snapshot()
    }

    fn set_auto_reconnect(&mut self, enabled: bool) {
        self.shared.auto_reconnect.store(enabled, Ordering::SeqCst);
    }

    fn release_listeners(&mut self) {
        self.shared
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.stopped.store(true, Ordering::SeqCst);
            driver.handle.abort();
        }
    }
}

/// Connect / run / reconnect until stopped or told not to reconnect.
async fn drive(
    url: String,
    options: ChannelOptions,
    shared: Arc<Shared>,
    stopped: Arc<AtomicBool>,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
) {
    let mut attempt: u32 = 0;

    loop {
        if stopped.load(Ordering::SeqCst) {
            return;
        }

        let request = match build_request(&url, &shared.query_snapshot(), &options) {
            Ok(request) => request,
            Err(e) => {
                shared.notify(&stopped, ChannelEvent::ConnectError(e.to_string()));
                return;
            }
        };

        match connect_async(request).await {
            Ok((ws, _response)) => {
                attempt = 0;
                tracing::debug!(url = %url, "event channel connected");
                shared.connected.store(true, Ordering::SeqCst);
                shared.notify(&stopped, ChannelEvent::Connected);

                let reason = run_session(ws, &mut rx, &options, &shared, &stopped).await;
                shared.connected.store(false, Ordering::SeqCst);
                if stopped.load(Ordering::SeqCst) || reason == DisconnectReason::ClientInitiated {
                    return;
                }

                tracing::debug!(url = %url, reason = %reason, "event channel disconnected");
                shared.notify(&stopped, ChannelEvent::Disconnected(reason));
                if !reason.is_transport_failure() {
                    return;
                }
            }
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "event channel connect failed");
                shared.notify(&stopped, ChannelEvent::ConnectError(e.to_string()));
            }
        }

        if !shared.auto_reconnect.load(Ordering::SeqCst) {
            return;
        }
        time::sleep(backoff(&options, attempt)).await;
        attempt = attempt.saturating_add(1);
    }
}

/// Pump one established WebSocket until it ends; returns why it ended.
async fn run_session(
    ws: WsStream,
    rx: &mut mpsc::UnboundedReceiver<Outgoing>,
    options: &ChannelOptions,
    shared: &Shared,
    stopped: &AtomicBool,
) -> DisconnectReason {
    let (mut sink, mut stream) = ws.split();

    let interval = Duration::from_millis(options.ping_interval_ms.max(1));
    let deadline = interval + Duration::from_millis(options.ping_timeout_ms);
    let mut ticker = time::interval(interval);
    ticker.tick().await; // skip first immediate tick
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            out = rx.recv() => match out {
                Some(Outgoing::Frame(frame)) => {
                    if let Err(e) = sink.send(Message::Binary(frame)).await {
                        shared.notify(stopped, ChannelEvent::Error(e.to_string()));
                        return DisconnectReason::TransportError;
                    }
                }
                Some(Outgoing::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return DisconnectReason::ClientInitiated;
                }
            },
            msg = stream.next() => {
                last_seen = Instant::now();
                let data = match msg {
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Text(text))) => text.into_bytes(),
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                        continue;
                    }
                    Some(Ok(Message::Close(_))) => return DisconnectReason::ServerInitiated,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        shared.notify(stopped, ChannelEvent::Error(e.to_string()));
                        return DisconnectReason::TransportError;
                    }
                    None => return DisconnectReason::TransportClose,
                };

                match decode_event(&data) {
                    Ok(frame) => shared.notify(
                        stopped,
                        ChannelEvent::Message { event: frame.event, args: frame.args },
                    ),
                    Err(e) => tracing::warn!(error = %e, "invalid event frame"),
                }
            }
            _ = ticker.tick() => {
                if last_seen.elapsed() > deadline {
                    return DisconnectReason::PingTimeout;
                }
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    return DisconnectReason::TransportError;
                }
            }
        }
    }
}

/// Build the handshake request: `http(s)` becomes `ws(s)`, the query is
/// appended, configured headers are attached.
fn build_request(url: &str, query: &Query, options: &ChannelOptions) -> GatewayResult<Request> {
    let mut url = Url::parse(url).map_err(|e| GatewayError::Transport(format!("{url}: {e}")))?;

    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(GatewayError::Transport(format!(
                "unsupported URL scheme: {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| GatewayError::Transport(format!("cannot use scheme {scheme}")))?;

    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in query {
            pairs.append_pair(key, value);
        }
    }

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| GatewayError::Transport(e.to_string()))?;
    for (name, value) in &options.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| GatewayError::Transport(format!("header {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| GatewayError::Transport(format!("header value: {e}")))?;
        request.headers_mut().insert(name, value);
    }
    Ok(request)
}

/// Exponential reconnect delay, capped at `reconnection_delay_max_ms`.
fn backoff(options: &ChannelOptions, attempt: u32) -> Duration {
    let base = options.reconnection_delay_ms.max(1);
    let factor = 1u64 << attempt.min(16);
    let delay = base.saturating_mul(factor);
    Duration::from_millis(delay.min(options.reconnection_delay_max_ms.max(base)))
}
