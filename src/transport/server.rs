//! Inbound tier connections.
//!
//! ## Design
//! - Sockets arrive from the platform's websocket acceptor.
//! - The first frame must authenticate against the platform auth token.
//!   Anything else terminates the socket.
//! - One record per identity. A newer authenticated socket supersedes the
//!   old one: the old socket is terminated, its ping timer cancelled, and its
//!   unsent messages move to the new socket.
//! - Messages for an identity whose socket is down are buffered until it
//!   authenticates again.

use crate::error::SyncError;
use crate::platform::Platform;
use crate::sync::protocol::{control_of, Envelope, Frame};
use crate::sync::tier::TierAddress;
use crate::transport::socket::{RawSocket, SocketEvent, SocketSink};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const PING_INTERVAL: Duration = Duration::from_secs(1800);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum ServerEvent {
    Connected(TierAddress),
    Disconnected(TierAddress),
    Message {
        from: TierAddress,
        envelope: Envelope,
    },
}

struct ConnectionRecord {
    sink: Option<SocketSink>,
    socket_id: u64,
    data_ok: bool,
    close_ok: bool,
    close_waiter: Option<oneshot::Sender<()>>,
    ping_task: Option<JoinHandle<()>>,
    outgoing: Vec<Envelope>,
}

impl ConnectionRecord {
    fn deliver(&mut self, identity: &TierAddress, envelope: Envelope) {
        if self.data_ok {
            if let Some(sink) = &self.sink {
                match envelope.to_data_frame() {
                    Ok(text) => match sink.send_text(text) {
                        Ok(()) => return,
                        Err(e) => tracing::warn!(%identity, "Failed to send message: {e}"),
                    },
                    Err(e) => {
                        tracing::error!(%identity, "Dropping unencodable message: {e}");
                        return;
                    }
                }
            }
        }
        self.outgoing.push(envelope);
    }

    fn shut_down(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.terminate();
        }
        if let Some(task) = self.ping_task.take() {
            task.abort();
        }
        self.data_ok = false;
    }
}

struct ServerInner {
    platform: Arc<dyn Platform>,
    events: mpsc::UnboundedSender<ServerEvent>,
    connections: Mutex<HashMap<TierAddress, ConnectionRecord>>,
    next_socket_id: AtomicU64,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct ServerConnection {
    inner: Arc<ServerInner>,
}

impl ServerConnection {
    pub fn new(platform: Arc<dyn Platform>, events: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                platform,
                events,
                connections: Mutex::new(HashMap::new()),
                next_socket_id: AtomicU64::new(1),
                accept_task: Mutex::new(None),
            }),
        }
    }

    /// Start accepting. False when the platform cannot accept websockets.
    pub fn open(&self) -> bool {
        let Some(mut acceptor) = self.inner.platform.websocket_acceptor() else {
            return false;
        };
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            while let Some(socket) = acceptor.recv().await {
                tokio::spawn(Arc::clone(&inner).handle_socket(socket));
            }
            tracing::debug!("Websocket acceptor closed");
        });
        *self.inner.accept_task.lock() = Some(task);
        true
    }

    pub fn is_connected(&self, identity: &TierAddress) -> bool {
        self.inner
            .connections
            .lock()
            .get(identity)
            .is_some_and(|r| r.data_ok && r.sink.is_some())
    }

    pub fn identities(&self) -> Vec<TierAddress> {
        self.inner.connections.lock().keys().cloned().collect()
    }

    pub fn buffered(&self, identity: &TierAddress) -> usize {
        self.inner
            .connections
            .lock()
            .get(identity)
            .map_or(0, |r| r.outgoing.len())
    }

    /// Send to one identity, or broadcast with `to = None`.
    pub fn send(&self, envelope: Envelope, to: Option<&TierAddress>) -> Result<(), SyncError> {
        let mut connections = self.inner.connections.lock();
        match to {
            Some(identity) => {
                let record = connections
                    .get_mut(identity)
                    .ok_or_else(|| SyncError::UnknownDestination(identity.to_string()))?;
                record.deliver(identity, envelope);
            }
            None => {
                for (identity, record) in connections.iter_mut() {
                    record.deliver(identity, envelope.clone());
                }
            }
        }
        Ok(())
    }

    /// Ask one client to close, terminating it if it does not within 10 s.
    pub async fn close_one(&self, identity: &TierAddress) {
        let waiter = {
            let mut connections = self.inner.connections.lock();
            let Some(record) = connections.get_mut(identity) else {
                return;
            };
            match &record.sink {
                Some(sink) => {
                    if let Ok(text) = Frame::Close.to_text() {
                        let _ = sink.send_text(text);
                    }
                    let (tx, rx) = oneshot::channel();
                    record.close_ok = true;
                    record.close_waiter = Some(tx);
                    rx
                }
                None => {
                    record.close_ok = false;
                    record.close_waiter = None;
                    return;
                }
            }
        };

        if tokio::time::timeout(CLOSE_TIMEOUT, waiter).await.is_err() {
            tracing::warn!(%identity, "Client did not close within 10 seconds, terminating");
            let mut connections = self.inner.connections.lock();
            if let Some(record) = connections.get_mut(identity) {
                if record.close_ok {
                    record.shut_down();
                    record.close_waiter = None;
                }
            }
        }
    }

    /// Stop accepting and close every client.
    pub async fn close(&self) {
        if let Some(task) = self.inner.accept_task.lock().take() {
            task.abort();
        }
        let identities = self.identities();
        futures_util::future::join_all(identities.iter().map(|id| self.close_one(id))).await;
    }
}

impl ServerInner {
    async fn handle_socket(self: Arc<Self>, socket: RawSocket) {
        let socket_id = self.next_socket_id.fetch_add(1, Ordering::Relaxed);
        let (sink, mut stream) = socket.split();
        let mut identity: Option<TierAddress> = None;

        loop {
            match stream.next().await {
                SocketEvent::Closed => {
                    if let Some(identity) = &identity {
                        self.on_closed(identity, socket_id);
                    }
                    return;
                }
                SocketEvent::Ping(payload) => sink.pong(payload),
                SocketEvent::Text(text) => {
                    let value: Value = match serde_json::from_str(&text) {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::warn!("Error parsing client message: {e}");
                            if identity.is_none() {
                                sink.terminate();
                                return;
                            }
                            continue;
                        }
                    };
                    match &identity {
                        None => match self.authenticate(value) {
                            Some(address) => {
                                self.register(address.clone(), socket_id, sink.clone());
                                identity = Some(address);
                            }
                            None => {
                                tracing::warn!("Invalid authentication message");
                                sink.terminate();
                                return;
                            }
                        },
                        Some(from) => self.on_frame(from, socket_id, value),
                    }
                }
            }
        }
    }

    fn authenticate(&self, value: Value) -> Option<TierAddress> {
        let expected = self.platform.auth_token()?;
        match serde_json::from_value::<Frame>(value) {
            Ok(Frame::Auth {
                identity,
                token: Some(token),
            }) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => {
                match identity.parse() {
                    Ok(address) => Some(address),
                    Err(e) => {
                        tracing::warn!("Rejecting client with bad identity: {e}");
                        None
                    }
                }
            }
            _ => None,
        }
    }

    fn register(&self, identity: TierAddress, socket_id: u64, sink: SocketSink) {
        let ping_sink = sink.clone();
        let ping_task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + PING_INTERVAL;
            let mut interval = tokio::time::interval_at(start, PING_INTERVAL);
            loop {
                interval.tick().await;
                if ping_sink.ping().is_err() {
                    break;
                }
            }
        });

        let mut connections = self.connections.lock();
        let mut record = ConnectionRecord {
            sink: Some(sink),
            socket_id,
            data_ok: true,
            close_ok: false,
            close_waiter: None,
            ping_task: Some(ping_task),
            outgoing: Vec::new(),
        };
        if let Some(mut previous) = connections.remove(&identity) {
            if previous.sink.is_some() {
                tracing::info!(%identity, "New connection supersedes existing one");
            }
            previous.shut_down();
            if let Some(waiter) = previous.close_waiter.take() {
                let _ = waiter.send(());
            }
            for envelope in std::mem::take(&mut previous.outgoing) {
                record.deliver(&identity, envelope);
            }
        }
        connections.insert(identity.clone(), record);
        drop(connections);

        tracing::info!(%identity, "Client authenticated");
        let _ = self.events.send(ServerEvent::Connected(identity));
    }

    fn on_frame(&self, from: &TierAddress, socket_id: u64, value: Value) {
        if !self.is_current(from, socket_id) {
            return;
        }
        if control_of(&value) != Some("data") {
            tracing::warn!(identity = %from, control = ?control_of(&value), "Invalid control message from client");
            return;
        }
        match serde_json::from_value::<Frame>(value) {
            Ok(Frame::Data(envelope)) => {
                let _ = self.events.send(ServerEvent::Message {
                    from: from.clone(),
                    envelope,
                });
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(identity = %from, "Malformed data frame: {e}"),
        }
    }

    fn is_current(&self, identity: &TierAddress, socket_id: u64) -> bool {
        self.connections
            .lock()
            .get(identity)
            .is_some_and(|r| r.socket_id == socket_id)
    }

    fn on_closed(&self, identity: &TierAddress, socket_id: u64) {
        {
            let mut connections = self.connections.lock();
            let Some(record) = connections.get_mut(identity) else {
                return;
            };
            if record.socket_id != socket_id {
                return;
            }
            if let Some(task) = record.ping_task.take() {
                task.abort();
            }
            record.sink = None;
            record.data_ok = false;
            if record.close_ok {
                record.close_ok = false;
                if let Some(waiter) = record.close_waiter.take() {
                    let _ = waiter.send(());
                }
            } else {
                tracing::warn!(%identity, "Lost connection from client");
            }
        }
        let _ = self.events.send(ServerEvent::Disconnected(identity.clone()));
    }
}

/// Constant-time byte comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
