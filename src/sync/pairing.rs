//! Keeps the tier topology in step with the engine records in the device
//! database. Pairing a server or a cloud account is just syncing its
//! thingengine device; this module turns those records into client
//! configurations and connections.

use crate::devices::thingengine::{ThingEngineDevice, ThingEngineState, THINGENGINE_KIND};
use crate::devices::{Device, DeviceDatabase, DeviceEvent};
use crate::platform::prefs::SharedPreferences;
use crate::platform::CLOUD_ID_PREF;
use crate::sync::manager::{ClientConfig, SyncManager};
use crate::sync::tier::{Tier, TierAddress};
use anyhow::Result;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

struct PairingInner {
    devices: DeviceDatabase,
    manager: SyncManager,
    prefs: Arc<dyn SharedPreferences>,
}

pub struct PairedEngineManager {
    inner: Arc<PairingInner>,
    own: ThingEngineState,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl PairedEngineManager {
    /// `own` describes this engine as other tiers should see it.
    pub fn new(
        devices: DeviceDatabase,
        manager: SyncManager,
        prefs: Arc<dyn SharedPreferences>,
        own: ThingEngineState,
    ) -> Self {
        Self {
            inner: Arc::new(PairingInner {
                devices,
                manager,
                prefs,
            }),
            own,
            listener: Mutex::new(None),
        }
    }

    /// Follow device changes, apply engine records already loaded, and
    /// publish our own record.
    pub async fn start(&self) -> Result<()> {
        let mut events = self.inner.devices.subscribe();
        let inner = Arc::clone(&self.inner);
        let listener = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(DeviceEvent::Added(device)) => inner.on_device_added(device.as_ref()).await,
                    Ok(DeviceEvent::Removed(device)) => inner.on_device_removed(device.as_ref()).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Pairing missed device events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Some(previous) = self.listener.lock().replace(listener) {
            previous.abort();
        }

        for device in self.inner.devices.devices_of_kind(THINGENGINE_KIND) {
            self.inner.on_device_added(device.as_ref()).await;
        }

        let own: Arc<dyn Device> = Arc::new(ThingEngineDevice::new(self.own.clone()));
        self.inner.devices.add_device(own).await?;
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
    }
}

fn engine_state(device: &dyn Device) -> Option<ThingEngineState> {
    if device.kind() != THINGENGINE_KIND {
        return None;
    }
    match serde_json::from_value(device.serialize()) {
        Ok(state) => Some(state),
        Err(e) => {
            tracing::warn!(unique_id = %device.unique_id(), "Malformed engine record: {e}");
            None
        }
    }
}

impl PairingInner {
    fn dials_servers(&self) -> bool {
        matches!(self.manager.own_tier(), Tier::Phone | Tier::Desktop)
    }

    async fn on_device_added(&self, device: &dyn Device) {
        let Some(state) = engine_state(device) else {
            return;
        };
        let address = state.address();
        if address == self.manager.own_address() {
            return;
        }

        match state.tier {
            Tier::Server if self.dials_servers() => {
                let Some(url) = state.sync_url() else {
                    tracing::warn!(remote = %address, "Server engine record without host and port");
                    return;
                };
                let previous = self.manager.server_config(&state.identity);
                if previous.as_ref().is_some_and(|c| c.url != url) {
                    tracing::info!(remote = %address, %url, "Server moved, reconnecting");
                    self.manager.close_connection(&address).await;
                }
                self.manager.add_server_config(&state.identity, ClientConfig { url });
            }
            Tier::Cloud if self.manager.own_tier() != Tier::Cloud => {
                let Some(cloud_id) = state.cloud_id.as_deref() else {
                    tracing::warn!("Cloud engine record without a cloud id");
                    return;
                };
                if let Some(stored) = self.prefs.get_as::<String>(CLOUD_ID_PREF) {
                    if stored != cloud_id {
                        tracing::error!(%stored, %cloud_id, "Cloud engine record changes the stored cloud id");
                    }
                }
                self.prefs.set(CLOUD_ID_PREF, Value::String(cloud_id.to_string()));
                self.manager.add_cloud_config();
            }
            _ => return,
        }

        if !self.manager.is_connected(&address) {
            self.manager.try_connect(&address).await;
        }
    }

    async fn on_device_removed(&self, device: &dyn Device) {
        let Some(state) = engine_state(device) else {
            return;
        };
        let address = state.address();
        match state.tier {
            Tier::Server => self.manager.remove_server_config(&state.identity),
            Tier::Cloud => self.manager.remove_cloud_config(),
            _ => return,
        }
        tracing::info!(remote = %address, "Engine unpaired");
        self.manager.close_connection(&address).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryTable, SyncDatabase};
    use crate::devices::thingengine::{own_unique_id, BuiltinDeviceFactory};
    use crate::platform::prefs::Preferences;
    use crate::platform::{LocalPlatform, Platform, PlatformKind};
    use crate::transport::client::Connector;
    use crate::transport::socket::{RawSocket, SocketPeer};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct PipeConnector {
        dialed: mpsc::UnboundedSender<(String, SocketPeer)>,
    }

    #[async_trait]
    impl Connector for PipeConnector {
        async fn connect(&self, url: &str) -> Result<RawSocket> {
            let (socket, peer) = RawSocket::pipe();
            let _ = self.dialed.send((url.to_string(), peer));
            Ok(socket)
        }
    }

    struct Fixture {
        manager: SyncManager,
        devices: DeviceDatabase,
        pairing: PairedEngineManager,
        prefs: Arc<dyn SharedPreferences>,
        dialed: mpsc::UnboundedReceiver<(String, SocketPeer)>,
        peers: Vec<SocketPeer>,
    }

    async fn fixture() -> Fixture {
        let prefs: Arc<dyn SharedPreferences> = Arc::new(Preferences::in_memory());
        let platform: Arc<dyn Platform> = Arc::new(LocalPlatform::new(PlatformKind::Android, prefs.clone()));
        let (tx, dialed) = mpsc::unbounded_channel();
        let manager = SyncManager::with_connector(
            platform,
            "https://cloud.example.org",
            Arc::new(PipeConnector { dialed: tx }),
        )
        .unwrap();
        manager.start().await.unwrap();

        let syncdb = SyncDatabase::new(
            prefs.clone(),
            Arc::new(MemoryTable::new("device")),
            Arc::new(manager.clone()),
        )
        .unwrap();
        let devices = DeviceDatabase::new(syncdb, Arc::new(BuiltinDeviceFactory::new()), manager.own_address());
        let pairing = PairedEngineManager::new(
            devices.clone(),
            manager.clone(),
            prefs.clone(),
            ThingEngineState::new(&manager.own_address()),
        );
        pairing.start().await.unwrap();
        devices.start().await.unwrap();
        Fixture {
            manager,
            devices,
            pairing,
            prefs,
            dialed,
            peers: Vec::new(),
        }
    }

    async fn next_dial(f: &mut Fixture) -> String {
        let (url, peer) = tokio::time::timeout(Duration::from_secs(5), f.dialed.recv())
            .await
            .unwrap()
            .unwrap();
        // Dropping the far end would look like a lost connection.
        f.peers.push(peer);
        url
    }

    fn server_device(identity: &str, host: &str, port: u16) -> Arc<dyn Device> {
        let mut state = ThingEngineState::new(&TierAddress::new(Tier::Server, identity));
        state.host = Some(host.into());
        state.port = Some(port);
        Arc::new(ThingEngineDevice::new(state))
    }

    #[tokio::test]
    async fn start_publishes_own_engine_record() {
        let f = fixture().await;
        let own = own_unique_id(&f.manager.own_address());
        assert!(f.devices.has_device(&own));
        f.pairing.stop();
    }

    #[tokio::test]
    async fn pairing_a_server_dials_it() {
        let mut f = fixture().await;
        let device = f.devices.add_device(server_device("s1", "10.0.0.5", 3000)).await.unwrap();

        assert_eq!(next_dial(&mut f).await, "http://10.0.0.5:3000/api/sync");
        let address = TierAddress::new(Tier::Server, "s1");
        assert_eq!(
            f.manager.server_config("s1"),
            Some(ClientConfig {
                url: "http://10.0.0.5:3000/api/sync".into()
            })
        );
        assert!(f.manager.is_client_tier(&address));

        f.devices.remove_device(&device).await.unwrap();
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(f.manager.server_config("s1"), None);
        assert!(!f.manager.is_client_tier(&address));
    }

    #[tokio::test]
    async fn moved_server_is_redialed() {
        let mut f = fixture().await;
        f.devices.add_device(server_device("s1", "10.0.0.5", 3000)).await.unwrap();
        next_dial(&mut f).await;

        f.devices.add_device(server_device("s1", "fe80::2", 3001)).await.unwrap();
        // Merged into the existing record: no new Added event, so re-apply it.
        let device = f.devices.get_device(&own_unique_id(&TierAddress::new(Tier::Server, "s1"))).unwrap();
        f.pairing.inner.on_device_added(device.as_ref()).await;

        assert_eq!(next_dial(&mut f).await, "http://[fe80::2]:3001/api/sync");
        assert_eq!(f.manager.server_config("s1").unwrap().url, "http://[fe80::2]:3001/api/sync");
    }

    #[tokio::test]
    async fn pairing_the_cloud_stores_cloud_id() {
        let mut f = fixture().await;
        let mut state = ThingEngineState::new(&TierAddress::cloud());
        state.cloud_id = Some("acct-7".into());
        f.devices
            .add_device(Arc::new(ThingEngineDevice::new(state)))
            .await
            .unwrap();

        assert_eq!(next_dial(&mut f).await, "https://cloud.example.org/ws/acct-7");
        assert_eq!(f.prefs.get_as::<String>(CLOUD_ID_PREF).as_deref(), Some("acct-7"));
        assert!(f.manager.is_client_tier(&TierAddress::cloud()));
    }
}
