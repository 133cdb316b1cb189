//! Tier topology, reconnection, and message routing.
//!
//! ## Design
//! - One manager per process. It owns the outbound [`ClientConnection`]s
//!   (keyed by remote address), the optional inbound [`ServerConnection`],
//!   and the registry of message handlers keyed by `target`.
//! - Inbound messages from every connection funnel through channels into
//!   event loops and are dispatched to handlers one at a time.
//! - A client connection that gives up is dropped and retried later with a
//!   per-address exponential backoff that is never reset.
//!
//! Topology by tier:
//!
//! | tier           | dials out to             | accepts inbound |
//! |----------------|--------------------------|-----------------|
//! | phone, desktop | cloud + paired servers   | no              |
//! | server         | cloud                    | yes             |
//! | cloud          | nothing                  | yes             |

use crate::error::SyncError;
use crate::platform::prefs::SharedPreferences;
use crate::platform::{Platform, CLOUD_ID_PREF};
use crate::sync::protocol::Envelope;
use crate::sync::tier::{generate_identity, Tier, TierAddress, IDENTITY_PREF};
use crate::transport::client::{ClientConnection, ClientEvent, Connector, WsConnector};
use crate::transport::server::{ServerConnection, ServerEvent};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// First reconnection delay after a client connection gives up (~4.4 min).
pub const INITIAL_RECONNECTION_BACKOFF_MS: u64 = 262_144;
/// Reconnection delays stop growing here (~21 h).
pub const MAX_RECONNECTION_BACKOFF_MS: u64 = 76_527_504;

/// Preference key of the paired server map (`identity -> ClientConfig`).
pub const SERVERS_PREF: &str = "servers";

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TierEvent {
    Connected(TierAddress),
    Disconnected(TierAddress),
}

/// Where to dial a remote tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub url: String,
}

// ── Handlers ────────────────────────────────────────────────────

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, from: &TierAddress, envelope: Envelope);
}

/// One handler per message target.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
}

impl HandlerRegistry {
    pub fn register(&self, target: &str, handler: Arc<dyn MessageHandler>) -> Result<(), SyncError> {
        let mut handlers = self.handlers.write();
        if handlers.contains_key(target) {
            return Err(SyncError::DuplicateHandler(target.to_string()));
        }
        handlers.insert(target.to_string(), handler);
        Ok(())
    }

    pub fn get(&self, target: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.read().get(target).cloned()
    }

    pub async fn dispatch(&self, from: &TierAddress, envelope: Envelope) {
        match self.get(&envelope.target) {
            Some(handler) => handler.handle_message(from, envelope).await,
            None => {
                tracing::error!(handler = %envelope.target, %from, "Message target not recognized");
            }
        }
    }
}

/// What a table sync needs from the tier layer.
pub trait SyncTransport: Send + Sync {
    fn own_tier(&self) -> Tier;
    fn own_address(&self) -> TierAddress;
    fn register_handler(&self, target: &str, handler: Arc<dyn MessageHandler>) -> Result<(), SyncError>;
    fn is_client_tier(&self, address: &TierAddress) -> bool;
    fn client_connections(&self) -> Vec<TierAddress>;
    fn subscribe(&self) -> broadcast::Receiver<TierEvent>;
    fn send_to(&self, address: &TierAddress, envelope: Envelope);
    fn send_to_all(&self, envelope: Envelope);
}

// ── Backoff ─────────────────────────────────────────────────────

/// Per-address reconnection delays: ×1.5 each time, capped.
#[derive(Debug, Default)]
pub struct ReconnectBackoff {
    next: HashMap<TierAddress, u64>,
}

impl ReconnectBackoff {
    pub fn next_delay(&mut self, address: &TierAddress) -> Duration {
        let slot = self
            .next
            .entry(address.clone())
            .or_insert(INITIAL_RECONNECTION_BACKOFF_MS);
        let delay = *slot;
        *slot = (delay * 3 / 2).min(MAX_RECONNECTION_BACKOFF_MS);
        Duration::from_millis(delay)
    }
}

// ── Manager ─────────────────────────────────────────────────────

#[derive(Default)]
struct Topology {
    configs: HashMap<TierAddress, ClientConfig>,
    sockets: HashMap<TierAddress, ClientConnection>,
    backoff: ReconnectBackoff,
    reconnects: HashMap<TierAddress, JoinHandle<()>>,
}

struct ManagerInner {
    platform: Arc<dyn Platform>,
    prefs: Arc<dyn SharedPreferences>,
    cloud_url: String,
    own: TierAddress,
    connector: Arc<dyn Connector>,
    handlers: HandlerRegistry,
    topology: Mutex<Topology>,
    server: Mutex<Option<ServerConnection>>,
    events: broadcast::Sender<TierEvent>,
    client_events: mpsc::UnboundedSender<ClientEvent>,
    client_events_rx: Mutex<Option<mpsc::UnboundedReceiver<ClientEvent>>>,
    next_connection_id: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<ManagerInner>,
}

impl SyncManager {
    pub fn new(platform: Arc<dyn Platform>, cloud_url: impl Into<String>) -> Result<Self, SyncError> {
        Self::with_connector(platform, cloud_url, Arc::new(WsConnector))
    }

    pub fn with_connector(
        platform: Arc<dyn Platform>,
        cloud_url: impl Into<String>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, SyncError> {
        let prefs = platform.shared_preferences();
        let tier = platform.kind().tier();
        let identity = match tier {
            Tier::Cloud => String::new(),
            Tier::Global => return Err(SyncError::InvalidTier(tier.to_string())),
            _ => match prefs.get_as::<String>(IDENTITY_PREF) {
                Some(id) => id,
                None => {
                    let id = generate_identity();
                    prefs.set(IDENTITY_PREF, Value::String(id.clone()));
                    id
                }
            },
        };
        let own = TierAddress::new(tier, identity);
        tracing::info!(address = %own, "Sync manager created");

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (client_events, client_events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            inner: Arc::new(ManagerInner {
                platform,
                prefs,
                cloud_url: cloud_url.into().trim_end_matches('/').to_string(),
                own,
                connector,
                handlers: HandlerRegistry::default(),
                topology: Mutex::new(Topology::default()),
                server: Mutex::new(None),
                events,
                client_events,
                client_events_rx: Mutex::new(Some(client_events_rx)),
                next_connection_id: AtomicU64::new(1),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn own_tier(&self) -> Tier {
        self.inner.own.tier()
    }

    pub fn own_address(&self) -> TierAddress {
        self.inner.own.clone()
    }

    /// Configure the topology for our tier and dial every configured remote.
    pub async fn start(&self) -> Result<(), SyncError> {
        if let Some(rx) = self.inner.client_events_rx.lock().take() {
            let inner = Arc::clone(&self.inner);
            self.inner.tasks.lock().push(tokio::spawn(inner.run_client_events(rx)));
        }

        match self.own_tier() {
            Tier::Phone | Tier::Desktop => {
                self.add_cloud_config();
                self.add_all_server_configs();
            }
            Tier::Server => {
                self.add_cloud_config();
                self.inner.open_server();
            }
            Tier::Cloud => self.inner.open_server(),
            Tier::Global => return Err(SyncError::InvalidTier(Tier::Global.to_string())),
        }

        let targets: Vec<TierAddress> = self.inner.topology.lock().configs.keys().cloned().collect();
        futures_util::future::join_all(targets.iter().map(|addr| self.inner.try_open_client(addr))).await;
        Ok(())
    }

    /// Cancel reconnects, close every client, and close the server side.
    pub async fn stop(&self) {
        let clients: Vec<ClientConnection> = {
            let mut topology = self.inner.topology.lock();
            for (_, task) in topology.reconnects.drain() {
                task.abort();
            }
            topology.sockets.drain().map(|(_, conn)| conn).collect()
        };
        for conn in clients {
            conn.close();
        }
        let server = self.inner.server.lock().take();
        if let Some(server) = server {
            server.close().await;
        }
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::info!(address = %self.inner.own, "Sync manager stopped");
    }

    pub fn register_handler(&self, target: &str, handler: Arc<dyn MessageHandler>) -> Result<(), SyncError> {
        self.inner.handlers.register(target, handler)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TierEvent> {
        self.inner.events.subscribe()
    }

    /// Dial `address` now if we have a configuration and no connection.
    pub async fn try_connect(&self, address: &TierAddress) {
        if *address == self.inner.own {
            return;
        }
        {
            let mut topology = self.inner.topology.lock();
            if topology.sockets.contains_key(address) {
                return;
            }
            if let Some(task) = topology.reconnects.remove(address) {
                task.abort();
            }
        }
        self.inner.try_open_client(address).await;
    }

    pub fn is_client_tier(&self, address: &TierAddress) -> bool {
        self.inner.topology.lock().sockets.contains_key(address)
    }

    pub fn is_connected(&self, address: &TierAddress) -> bool {
        if self.is_client_tier(address) {
            return true;
        }
        self.inner
            .server
            .lock()
            .as_ref()
            .is_some_and(|server| server.is_connected(address))
    }

    pub fn client_connections(&self) -> Vec<TierAddress> {
        self.inner.topology.lock().sockets.keys().cloned().collect()
    }

    /// True while a reconnect timer is pending for `address`.
    pub fn reconnect_scheduled(&self, address: &TierAddress) -> bool {
        self.inner.topology.lock().reconnects.contains_key(address)
    }

    pub async fn close_connection(&self, address: &TierAddress) {
        let client = {
            let mut topology = self.inner.topology.lock();
            if let Some(task) = topology.reconnects.remove(address) {
                task.abort();
            }
            topology.sockets.remove(address)
        };
        if let Some(conn) = client {
            conn.close();
            let _ = self.inner.events.send(TierEvent::Disconnected(address.clone()));
            return;
        }
        let server = self.inner.server.lock().clone();
        if let Some(server) = server {
            server.close_one(address).await;
        }
    }

    pub fn send_to(&self, address: &TierAddress, envelope: Envelope) {
        self.inner.send_to(address, envelope);
    }

    pub fn send_to_all(&self, envelope: Envelope) {
        let server = self.inner.server.lock().clone();
        if let Some(server) = server {
            if let Err(e) = server.send(envelope.clone(), None) {
                tracing::warn!("Failed to broadcast to inbound tiers: {e}");
            }
        }
        let clients: Vec<ClientConnection> = self.inner.topology.lock().sockets.values().cloned().collect();
        for conn in clients {
            conn.send(envelope.clone());
        }
    }

    // ── Configuration ───────────────────────────────────────────

    pub fn add_cloud_config(&self) {
        let Some(cloud_id) = self.inner.platform.cloud_id() else {
            tracing::debug!("No cloud id configured, cloud tier unreachable");
            return;
        };
        let url = format!("{}/ws/{cloud_id}", self.inner.cloud_url);
        self.inner
            .topology
            .lock()
            .configs
            .insert(TierAddress::cloud(), ClientConfig { url });
    }

    pub fn remove_cloud_config(&self) {
        self.inner.prefs.remove(CLOUD_ID_PREF);
        self.inner.topology.lock().configs.remove(&TierAddress::cloud());
    }

    /// Remember a paired server and persist it.
    pub fn add_server_config(&self, identity: &str, config: ClientConfig) {
        let mut servers = self.stored_servers();
        servers.insert(identity.to_string(), config.clone());
        self.store_servers(&servers);
        self.inner
            .topology
            .lock()
            .configs
            .insert(TierAddress::new(Tier::Server, identity), config);
    }

    pub fn remove_server_config(&self, identity: &str) {
        let mut servers = self.stored_servers();
        if servers.remove(identity).is_some() {
            self.store_servers(&servers);
        }
        self.inner
            .topology
            .lock()
            .configs
            .remove(&TierAddress::new(Tier::Server, identity));
    }

    pub fn server_config(&self, identity: &str) -> Option<ClientConfig> {
        self.stored_servers().remove(identity)
    }

    fn add_all_server_configs(&self) {
        let servers = self.stored_servers();
        let mut topology = self.inner.topology.lock();
        for (identity, config) in servers {
            topology
                .configs
                .insert(TierAddress::new(Tier::Server, identity), config);
        }
    }

    fn stored_servers(&self) -> BTreeMap<String, ClientConfig> {
        self.inner.prefs.get_as(SERVERS_PREF).unwrap_or_default()
    }

    fn store_servers(&self, servers: &BTreeMap<String, ClientConfig>) {
        match serde_json::to_value(servers) {
            Ok(value) => self.inner.prefs.set(SERVERS_PREF, value),
            Err(e) => tracing::error!("Failed to encode server configs: {e}"),
        }
    }
}

impl ManagerInner {
    fn open_server(self: &Arc<Self>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let server = ServerConnection::new(Arc::clone(&self.platform), tx);
        if !server.open() {
            tracing::warn!(address = %self.own, "Platform cannot accept inbound connections");
            return;
        }
        *self.server.lock() = Some(server);
        let inner = Arc::clone(self);
        self.tasks.lock().push(tokio::spawn(inner.run_server_events(rx)));
    }

    async fn try_open_client(self: &Arc<Self>, address: &TierAddress) {
        let connection = {
            let mut topology = self.topology.lock();
            if topology.sockets.contains_key(address) {
                return;
            }
            let Some(config) = topology.configs.get(address).cloned() else {
                return;
            };
            let conn = ClientConnection::new(
                self.next_connection_id.fetch_add(1, Ordering::Relaxed),
                address.clone(),
                config.url,
                self.own.to_string(),
                self.platform.auth_token(),
                Arc::clone(&self.connector),
                self.client_events.clone(),
            );
            topology.sockets.insert(address.clone(), conn.clone());
            conn
        };

        if connection.open().await && self.is_current(address, connection.id()) {
            let _ = self.events.send(TierEvent::Connected(address.clone()));
        }
    }

    fn is_current(&self, address: &TierAddress, connection: u64) -> bool {
        self.topology
            .lock()
            .sockets
            .get(address)
            .is_some_and(|c| c.id() == connection)
    }

    async fn run_client_events(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<ClientEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                ClientEvent::Message {
                    remote,
                    connection,
                    envelope,
                } => {
                    if self.is_current(&remote, connection) {
                        self.handlers.dispatch(&remote, envelope).await;
                    }
                }
                ClientEvent::Failed {
                    remote,
                    connection,
                    lost,
                } => self.on_client_failed(remote, connection, lost),
            }
        }
    }

    async fn run_server_events(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<ServerEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                ServerEvent::Connected(address) => {
                    let _ = self.events.send(TierEvent::Connected(address));
                }
                ServerEvent::Disconnected(address) => {
                    let _ = self.events.send(TierEvent::Disconnected(address));
                }
                ServerEvent::Message { from, envelope } => {
                    self.handlers.dispatch(&from, envelope).await;
                }
            }
        }
    }

    fn on_client_failed(self: &Arc<Self>, remote: TierAddress, connection: u64, lost: Vec<Envelope>) {
        let delay = {
            let mut topology = self.topology.lock();
            if !topology
                .sockets
                .get(&remote)
                .is_some_and(|c| c.id() == connection)
            {
                return;
            }
            topology.sockets.remove(&remote);
            topology.backoff.next_delay(&remote)
        };

        if !lost.is_empty() {
            tracing::info!(
                %remote,
                count = lost.len(),
                "Dropping unsent messages, sync resumes from checkpoint on reconnect"
            );
        }
        tracing::info!(%remote, minutes = delay.as_secs() / 60, "Connection failed, trying again later");

        let inner = Arc::clone(self);
        let address = remote.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.topology.lock().reconnects.remove(&address);
            inner.try_open_client(&address).await;
        });
        if let Some(previous) = self.topology.lock().reconnects.insert(remote.clone(), task) {
            previous.abort();
        }
        let _ = self.events.send(TierEvent::Disconnected(remote));
    }

    fn send_to(&self, address: &TierAddress, envelope: Envelope) {
        let client = self.topology.lock().sockets.get(address).cloned();
        if let Some(conn) = client {
            conn.send(envelope);
            return;
        }
        let server = self.server.lock().clone();
        match server {
            Some(server) if server.is_connected(address) => {
                if let Err(e) = server.send(envelope, Some(address)) {
                    tracing::warn!(%address, "Failed to send: {e}");
                }
            }
            _ => tracing::debug!(%address, handler = %envelope.target, "Dropping message for unreachable tier"),
        }
    }
}

impl SyncTransport for SyncManager {
    fn own_tier(&self) -> Tier {
        SyncManager::own_tier(self)
    }

    fn own_address(&self) -> TierAddress {
        SyncManager::own_address(self)
    }

    fn register_handler(&self, target: &str, handler: Arc<dyn MessageHandler>) -> Result<(), SyncError> {
        SyncManager::register_handler(self, target, handler)
    }

    fn is_client_tier(&self, address: &TierAddress) -> bool {
        SyncManager::is_client_tier(self, address)
    }

    fn client_connections(&self) -> Vec<TierAddress> {
        SyncManager::client_connections(self)
    }

    fn subscribe(&self) -> broadcast::Receiver<TierEvent> {
        SyncManager::subscribe(self)
    }

    fn send_to(&self, address: &TierAddress, envelope: Envelope) {
        SyncManager::send_to(self, address, envelope);
    }

    fn send_to_all(&self, envelope: Envelope) {
        SyncManager::send_to_all(self, envelope);
    }
}
