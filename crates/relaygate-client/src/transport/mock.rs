//! In-memory event channels for engine tests.
//!
//! [`MockConnector`] records every channel it opens. Tests inspect what the
//! engine emitted and inject inbound events through [`MockHandle`].

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ciborium::Value;

use relaygate_core::transport::{
    ChannelConnector, ChannelEvent, ChannelListener, ChannelOptions, DisconnectReason,
    EventChannel, Query,
};
use relaygate_core::TcpData;

#[derive(Default)]
struct MockState {
    query: Query,
    connected: bool,
    auto_reconnect: bool,
    connects: usize,
    disconnects: usize,
    emitted: Vec<(String, Vec<Value>)>,
    listener: Option<ChannelListener>,
}

/// Test-side view of one opened channel.
#[derive(Clone)]
pub struct MockHandle {
    pub url: String,
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Deliver an inbound event, as the remote service would.
    pub fn inject(&self, event: ChannelEvent) {
        {
            let mut state = self.lock();
            match &event {
                ChannelEvent::Connected => state.connected = true,
                ChannelEvent::Disconnected(_) => state.connected = false,
                _ => {}
            }
        }
        let listener = self.lock().listener.clone();
        if let Some(listener) = listener {
            listener(event);
        }
    }

    pub fn inject_message(&self, event: &str, args: Vec<Value>) {
        self.inject(ChannelEvent::Message {
            event: event.to_string(),
            args,
        });
    }

    pub fn inject_tcp(&self, data: TcpData) {
        self.inject_message(relaygate_core::events::TCP_DATA, vec![data.to_value()]);
    }

    pub fn emitted(&self) -> Vec<(String, Vec<Value>)> {
        self.lock().emitted.clone()
    }

    /// Decoded `tcp_data` sub-events emitted so far.
    pub fn emitted_tcp(&self) -> Vec<TcpData> {
        self.emitted()
            .iter()
            .filter(|(name, _)| name == relaygate_core::events::TCP_DATA)
            .filter_map(|(_, args)| args.first())
            .filter_map(|v| TcpData::from_value(v).ok())
            .collect()
    }

    pub fn query(&self) -> Query {
        self.lock().query.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn auto_reconnect(&self) -> bool {
        self.lock().auto_reconnect
    }

    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn disconnects(&self) -> usize {
        self.lock().disconnects
    }

    pub fn has_listener(&self) -> bool {
        self.lock().listener.is_some()
    }
}

struct MockChannel {
    handle: MockHandle,
}

impl EventChannel for MockChannel {
    fn connect(&mut self) {
        let listener = {
            let mut state = self.handle.lock();
            state.connects += 1;
            if state.connected {
                return;
            }
            state.connected = true;
            state.listener.clone()
        };
        if let Some(listener) = listener {
            listener(ChannelEvent::Connected);
        }
    }

    fn disconnect(&mut self) {
        let listener = {
            let mut state = self.handle.lock();
            state.disconnects += 1;
            if !state.connected {
                return;
            }
            state.connected = false;
            state.listener.clone()
        };
        if let Some(listener) = listener {
            listener(ChannelEvent::Disconnected(DisconnectReason::ClientInitiated));
        }
    }

    fn emit(&mut self, event: &str, args: Vec<Value>) {
        self.handle.lock().emitted.push((event.to_string(), args));
    }

    fn is_connected(&self) -> bool {
        self.handle.lock().connected
    }

    fn set_query_param(&mut self, key: &str, value: &str) {
        self.handle
            .lock()
            .query
            .insert(key.to_string(), value.to_string());
    }

    fn query(&self) -> Query {
        self.handle.lock().query.clone()
    }

    fn set_auto_reconnect(&mut self, enabled: bool) {
        self.handle.lock().auto_reconnect = enabled;
    }

    fn release_listeners(&mut self) {
        self.handle.lock().listener = None;
    }
}

/// Records opened channels; every channel connects immediately.
#[derive(Clone, Default)]
pub struct MockConnector {
    opened: Arc<Mutex<Vec<MockHandle>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channels(&self) -> Vec<MockHandle> {
        self.opened.lock().unwrap().clone()
    }

    /// Wait until at least `n + 1` channels were opened and return the `n`th.
    pub async fn channel(&self, n: usize) -> MockHandle {
        for _ in 0..200 {
            if let Some(handle) = self.channels().get(n) {
                return handle.clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("channel {n} was never opened");
    }
}

impl ChannelConnector for MockConnector {
    fn open(
        &self,
        url: &str,
        options: &ChannelOptions,
        listener: ChannelListener,
    ) -> Box<dyn EventChannel> {
        let handle = MockHandle {
            url: url.to_string(),
            state: Arc::new(Mutex::new(MockState {
                query: options.query.clone(),
                auto_reconnect: options.reconnection,
                listener: Some(listener),
                ..Default::default()
            })),
        };
        self.opened.lock().unwrap().push(handle.clone());
        let mut channel = MockChannel { handle };
        channel.connect();
        Box::new(channel)
    }
}
