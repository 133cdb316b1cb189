//! Outbound tier connection.
//!
//! ## Design
//! - One [`ClientConnection`] per remote address, owned by the sync manager.
//! - Authenticates with `{control: auth, identity, token}` as its first frame.
//! - Messages sent while disconnected are buffered (unbounded) and flushed,
//!   in order, right after authentication.
//! - Retries are bounded: three attempts, refilled only once a connection has
//!   stayed up for a minute. When the budget runs out the connection reports
//!   [`ClientEvent::Failed`] with whatever it still had buffered and the owner
//!   schedules the next try.

use crate::sync::protocol::{control_of, Envelope, Frame, SERVER_CONTROLS};
use crate::sync::tier::TierAddress;
use crate::transport::socket::{RawSocket, SocketEvent, SocketSink, SocketStream};
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Attempts per retry budget.
pub const MAX_RETRY_ATTEMPTS: u32 = 3;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Uptime after which a lost connection refills the retry budget.
const STABLE_CONNECTION: Duration = Duration::from_secs(60);

/// Dials a websocket URL.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<RawSocket>;
}

/// tokio-tungstenite dialer. `http(s)` URLs are dialed as `ws(s)`.
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<RawSocket> {
        let url = websocket_url(url);
        let (ws, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .with_context(|| format!("Failed to connect to {url}"))?;
        Ok(RawSocket::from_tungstenite(ws))
    }
}

fn websocket_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else {
        url.to_string()
    }
}

#[derive(Debug)]
pub enum ClientEvent {
    Message {
        remote: TierAddress,
        connection: u64,
        envelope: Envelope,
    },
    /// Gave up; `lost` holds messages that were never written.
    Failed {
        remote: TierAddress,
        connection: u64,
        lost: Vec<Envelope>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

enum Link {
    Disconnected,
    Connecting,
    Connected { sink: SocketSink, generation: u64 },
}

struct ClientState {
    link: Link,
    outgoing: Vec<Envelope>,
    retry_attempts: u32,
    ratelimit: Option<Instant>,
    close_ok: bool,
    generation: u64,
}

struct ClientInner {
    id: u64,
    remote: TierAddress,
    url: String,
    identity: String,
    auth_token: Option<String>,
    connector: Arc<dyn Connector>,
    events: mpsc::UnboundedSender<ClientEvent>,
    state: Mutex<ClientState>,
}

#[derive(Clone)]
pub struct ClientConnection {
    inner: Arc<ClientInner>,
}

impl ClientConnection {
    pub fn new(
        id: u64,
        remote: TierAddress,
        url: impl Into<String>,
        identity: impl Into<String>,
        auth_token: Option<String>,
        connector: Arc<dyn Connector>,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                id,
                remote,
                url: url.into(),
                identity: identity.into(),
                auth_token,
                connector,
                events,
                state: Mutex::new(ClientState {
                    link: Link::Disconnected,
                    outgoing: Vec::new(),
                    retry_attempts: MAX_RETRY_ATTEMPTS,
                    ratelimit: None,
                    close_ok: false,
                    generation: 0,
                }),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn remote(&self) -> &TierAddress {
        &self.inner.remote
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn state(&self) -> ConnectionState {
        match self.inner.state.lock().link {
            Link::Disconnected => ConnectionState::Disconnected,
            Link::Connecting => ConnectionState::Connecting,
            Link::Connected { .. } => ConnectionState::Connected,
        }
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.inner.state.lock().retry_attempts
    }

    pub fn buffered(&self) -> usize {
        self.inner.state.lock().outgoing.len()
    }

    /// Connect, retrying within the current budget. Returns whether the
    /// connection came up; on `false` a `Failed` event has been emitted.
    pub async fn open(&self) -> bool {
        self.inner.state.lock().close_ok = false;
        match self.inner.connect_with_retry().await {
            Some((stream, generation)) => {
                tokio::spawn(Arc::clone(&self.inner).supervise(stream, generation));
                true
            }
            None => false,
        }
    }

    /// Close on purpose. No reconnect and no `Failed` follows.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn send(&self, envelope: Envelope) {
        let mut st = self.inner.state.lock();
        if let Link::Connected { sink, .. } = &st.link {
            match envelope.to_data_frame() {
                Ok(text) => match sink.send_text(text) {
                    Ok(()) => return,
                    Err(e) => tracing::warn!(remote = %self.inner.remote, "Failed to send message on websocket: {e}"),
                },
                Err(e) => {
                    tracing::error!(remote = %self.inner.remote, "Dropping unencodable message: {e}");
                    return;
                }
            }
        }
        st.outgoing.push(envelope);
    }
}

enum PumpExit {
    /// Socket went away without us asking.
    Lost,
    /// Closed on purpose or replaced; stop supervising.
    Stop,
}

impl ClientInner {
    async fn connect_with_retry(&self) -> Option<(SocketStream, u64)> {
        loop {
            let attempt = {
                let mut st = self.state.lock();
                st.retry_attempts = st.retry_attempts.saturating_sub(1);
                st.link = Link::Connecting;
                MAX_RETRY_ATTEMPTS - st.retry_attempts
            };
            tracing::debug!(remote = %self.remote, url = %self.url, attempt, "Connecting");

            match tokio::time::timeout(CONNECT_TIMEOUT, self.connector.connect(&self.url)).await {
                Ok(Ok(socket)) => return self.on_connected(socket),
                Ok(Err(e)) => {
                    tracing::warn!(remote = %self.remote, attempt, "Failed to connect: {e:#}");
                }
                Err(_) => {
                    tracing::warn!(remote = %self.remote, attempt, "Connection attempt timed out");
                }
            }

            let lost = {
                let mut st = self.state.lock();
                if st.close_ok {
                    st.link = Link::Disconnected;
                    return None;
                }
                if st.retry_attempts > 0 {
                    continue;
                }
                st.link = Link::Disconnected;
                std::mem::take(&mut st.outgoing)
            };
            self.emit_failed(lost);
            return None;
        }
    }

    fn on_connected(&self, socket: RawSocket) -> Option<(SocketStream, u64)> {
        let (sink, stream) = socket.split();
        let mut st = self.state.lock();
        if st.close_ok {
            sink.close();
            st.link = Link::Disconnected;
            return None;
        }

        if let Some(token) = &self.auth_token {
            let auth = Frame::Auth {
                identity: self.identity.clone(),
                token: Some(token.clone()),
            };
            match auth.to_text() {
                Ok(text) => {
                    let _ = sink.send_text(text);
                }
                Err(e) => tracing::error!("Failed to encode auth frame: {e}"),
            }
        }

        let pending = std::mem::take(&mut st.outgoing);
        let mut unsent = Vec::new();
        for envelope in pending {
            if !unsent.is_empty() {
                unsent.push(envelope);
                continue;
            }
            match envelope.to_data_frame() {
                Ok(text) => {
                    if sink.send_text(text).is_err() {
                        unsent.push(envelope);
                    }
                }
                Err(e) => tracing::error!(remote = %self.remote, "Dropping unencodable message: {e}"),
            }
        }
        st.outgoing = unsent;

        st.generation += 1;
        let generation = st.generation;
        st.link = Link::Connected { sink, generation };
        st.ratelimit = Some(Instant::now());
        tracing::info!(remote = %self.remote, url = %self.url, "Connected");
        Some((stream, generation))
    }

    async fn supervise(self: Arc<Self>, mut stream: SocketStream, mut generation: u64) {
        loop {
            if let PumpExit::Stop = self.pump(&mut stream, generation).await {
                return;
            }

            let retry = {
                let mut st = self.state.lock();
                if st.close_ok || st.generation != generation {
                    return;
                }
                st.link = Link::Disconnected;
                let uptime = st.ratelimit.map(|t| t.elapsed()).unwrap_or_default();
                if uptime >= STABLE_CONNECTION {
                    tracing::info!(remote = %self.remote, "Connection was stable, resetting retry limit");
                    st.retry_attempts = MAX_RETRY_ATTEMPTS;
                }
                st.retry_attempts > 0
            };

            if !retry {
                tracing::warn!(remote = %self.remote, "Lost connection, retry budget exhausted");
                let lost = std::mem::take(&mut self.state.lock().outgoing);
                self.emit_failed(lost);
                return;
            }

            tracing::warn!(remote = %self.remote, "Lost connection, reconnecting");
            match self.connect_with_retry().await {
                Some((next_stream, next_generation)) => {
                    stream = next_stream;
                    generation = next_generation;
                }
                None => return,
            }
        }
    }

    async fn pump(&self, stream: &mut SocketStream, generation: u64) -> PumpExit {
        loop {
            match stream.next().await {
                SocketEvent::Closed => return PumpExit::Lost,
                SocketEvent::Ping(payload) => {
                    if let Some(sink) = self.current_sink(generation) {
                        sink.pong(payload);
                    }
                }
                SocketEvent::Text(text) => {
                    if self.current_sink(generation).is_none() {
                        return PumpExit::Stop;
                    }
                    if self.handle_text(&text) {
                        self.close();
                        let lost = std::mem::take(&mut self.state.lock().outgoing);
                        self.emit_failed(lost);
                        return PumpExit::Stop;
                    }
                }
            }
        }
    }

    /// Returns true when the server asked us to close.
    fn handle_text(&self, text: &str) -> bool {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(remote = %self.remote, "Invalid message from server: {e}");
                return false;
            }
        };
        match control_of(&value) {
            Some(control) if SERVER_CONTROLS.contains(&control) => {}
            other => {
                tracing::error!(remote = %self.remote, control = ?other, "Invalid control message from server");
                return false;
            }
        }
        match serde_json::from_value::<Frame>(value) {
            Ok(Frame::Data(envelope)) => {
                let _ = self.events.send(ClientEvent::Message {
                    remote: self.remote.clone(),
                    connection: self.id,
                    envelope,
                });
                false
            }
            Ok(Frame::Close) => true,
            Ok(Frame::AuthTokenOk) => {
                tracing::debug!(remote = %self.remote, "Server accepted auth token");
                false
            }
            Ok(Frame::AuthTokenError) => {
                tracing::warn!(remote = %self.remote, "Server rejected auth token");
                false
            }
            Ok(Frame::Auth { .. }) => false,
            Err(e) => {
                tracing::error!(remote = %self.remote, "Malformed frame from server: {e}");
                false
            }
        }
    }

    fn current_sink(&self, generation: u64) -> Option<SocketSink> {
        match &self.state.lock().link {
            Link::Connected {
                sink,
                generation: current,
            } if *current == generation => Some(sink.clone()),
            _ => None,
        }
    }

    fn close(&self) {
        let mut st = self.state.lock();
        st.close_ok = true;
        if let Link::Connected { sink, .. } = std::mem::replace(&mut st.link, Link::Disconnected) {
            sink.close();
        }
    }

    fn emit_failed(&self, lost: Vec<Envelope>) {
        let _ = self.events.send(ClientEvent::Failed {
            remote: self.remote.clone(),
            connection: self.id,
            lost,
        });
    }
}
