//! Device database: keeps live device objects in step with the synced
//! `device` table.
//!
//! ## Design
//! - Rows look like `{"state": <serialized device>}`; the serialized state
//!   carries the device `kind` the factory dispatches on.
//! - Remote additions update an existing device in place or load a new one;
//!   remote deletions drop it. Neither is written back to the table.
//! - A device is started and stopped only on the tier that owns it (its
//!   `owner_tier` is our address or `global`).
//! - Every few hours the device classes in use are checked for updates and
//!   devices of changed classes are reloaded.

pub mod thingengine;

use crate::db::{ObjectEvent, Row, SyncDatabase};
use crate::sync::tier::{Tier, TierAddress};
use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// How often device classes are checked for updates.
pub const UPDATE_FREQUENCY: Duration = Duration::from_secs(3 * 3600);

const EVENT_CAPACITY: usize = 64;

#[async_trait]
pub trait Device: Send + Sync {
    fn unique_id(&self) -> &str;

    fn kind(&self) -> &str;

    /// The tier that runs this device, or `global` for every tier.
    fn owner_tier(&self) -> TierAddress;

    /// Transient devices are never written to the table.
    fn is_transient(&self) -> bool {
        false
    }

    fn class_version(&self) -> u32 {
        0
    }

    fn serialize(&self) -> Value;

    fn update_state(&self, state: Value);

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait DeviceFactory: Send + Sync {
    async fn load_serialized(&self, unique_id: &str, state: Value) -> Result<Arc<dyn Device>>;

    async fn device_class_version(&self, kind: &str) -> Result<u32>;

    /// Fetch the newest implementation of `kind`, if the factory can.
    async fn update_device_class(&self, kind: &str) -> Result<()>;
}

#[derive(Clone)]
pub enum DeviceEvent {
    Added(Arc<dyn Device>),
    Removed(Arc<dyn Device>),
}

impl fmt::Debug for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added(d) => f.debug_tuple("Added").field(&d.unique_id()).finish(),
            Self::Removed(d) => f.debug_tuple("Removed").field(&d.unique_id()).finish(),
        }
    }
}

struct DeviceDbInner {
    syncdb: SyncDatabase,
    factory: Arc<dyn DeviceFactory>,
    own_address: TierAddress,
    devices: RwLock<BTreeMap<String, Arc<dyn Device>>>,
    events: broadcast::Sender<DeviceEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct DeviceDatabase {
    inner: Arc<DeviceDbInner>,
}

impl DeviceDatabase {
    pub fn new(syncdb: SyncDatabase, factory: Arc<dyn DeviceFactory>, own_address: TierAddress) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(DeviceDbInner {
                syncdb,
                factory,
                own_address,
                devices: RwLock::new(BTreeMap::new()),
                events,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.inner.events.subscribe()
    }

    pub fn own_address(&self) -> &TierAddress {
        &self.inner.own_address
    }

    /// Follow the table, open it, load stored devices, start update checks.
    pub async fn start(&self) -> Result<()> {
        let mut objects = self.inner.syncdb.subscribe();
        let inner = Arc::clone(&self.inner);
        let follower = tokio::spawn(async move {
            loop {
                match objects.recv().await {
                    Ok(ObjectEvent::Added { unique_id, row }) => inner.on_object_added(&unique_id, &row).await,
                    Ok(ObjectEvent::Deleted { unique_id }) => inner.on_object_deleted(&unique_id).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Device database fell behind the device table");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.inner.syncdb.open().await;

        let rows = self.inner.syncdb.get_all().await?;
        tracing::info!(count = rows.len(), "Loading stored devices");
        for (unique_id, row) in rows {
            match state_of(&row) {
                Some(state) => self.inner.load_one_device(&unique_id, state).await,
                None => tracing::warn!(%unique_id, "Device row without state"),
            }
        }

        let inner = Arc::clone(&self.inner);
        let updater = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + UPDATE_FREQUENCY, UPDATE_FREQUENCY);
            loop {
                interval.tick().await;
                inner.check_for_updates().await;
            }
        });

        self.inner.tasks.lock().extend([follower, updater]);
        Ok(())
    }

    /// Stop following the table and stop every device we run.
    pub async fn stop(&self) {
        self.inner.syncdb.close();
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        let devices: Vec<Arc<dyn Device>> = self.inner.devices.read().values().cloned().collect();
        for device in devices {
            if self.inner.is_owned(device.as_ref()) {
                if let Err(e) = device.stop().await {
                    tracing::warn!(unique_id = %device.unique_id(), "Failed to stop device: {e:#}");
                }
            }
        }
    }

    pub fn values(&self) -> Vec<Arc<dyn Device>> {
        self.inner.devices.read().values().cloned().collect()
    }

    pub fn has_device(&self, unique_id: &str) -> bool {
        self.inner.devices.read().contains_key(unique_id)
    }

    pub fn get_device(&self, unique_id: &str) -> Option<Arc<dyn Device>> {
        self.inner.devices.read().get(unique_id).cloned()
    }

    pub fn devices_of_kind(&self, kind: &str) -> Vec<Arc<dyn Device>> {
        self.inner
            .devices
            .read()
            .values()
            .filter(|d| d.kind() == kind)
            .cloned()
            .collect()
    }

    /// Add (or merge into an existing device with the same id) and save.
    pub async fn add_device(&self, device: Arc<dyn Device>) -> Result<Arc<dyn Device>> {
        self.inner.add_internal(device, true).await
    }

    /// Load a device from its serialized state and add it.
    pub async fn add_serialized(&self, state: Value) -> Result<Arc<dyn Device>> {
        let Some(kind) = state.get("kind").and_then(Value::as_str) else {
            bail!("Serialized device has no kind");
        };
        let unique_id = match state.get("uniqueId").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => format!("{kind}-{}", uuid::Uuid::new_v4()),
        };
        let device = self.inner.factory.load_serialized(&unique_id, state).await?;
        self.add_device(device).await
    }

    pub async fn save_device(&self, device: &dyn Device) -> Result<()> {
        self.inner.save_device(device).await
    }

    pub async fn remove_device(&self, device: &Arc<dyn Device>) -> Result<()> {
        let removed = self.inner.devices.write().remove(device.unique_id());
        if !device.is_transient() {
            self.inner.syncdb.delete_one(device.unique_id()).await?;
        }
        if let Some(removed) = removed {
            self.inner.notify_removed(removed).await;
        }
        Ok(())
    }

    /// Reload a device from its own serialized state.
    pub async fn reload_device(&self, device: &Arc<dyn Device>) {
        self.inner.reload(Arc::clone(device)).await;
    }

    pub async fn update_devices_of_kind(&self, kind: &str) -> Result<()> {
        self.inner.factory.update_device_class(kind).await?;
        for device in self.devices_of_kind(kind) {
            self.inner.reload(device).await;
        }
        Ok(())
    }
}

fn state_of(row: &Row) -> Option<Value> {
    match row.get("state")? {
        // Older rows keep the state as a JSON string.
        Value::String(s) => serde_json::from_str(s).ok(),
        other => Some(other.clone()),
    }
}

impl DeviceDbInner {
    fn is_owned(&self, device: &dyn Device) -> bool {
        let owner = device.owner_tier();
        owner == self.own_address || owner.tier() == Tier::Global
    }

    async fn notify_added(&self, device: Arc<dyn Device>) {
        if self.is_owned(device.as_ref()) {
            if let Err(e) = device.start().await {
                tracing::warn!(unique_id = %device.unique_id(), "Failed to start device: {e:#}");
            }
        }
        let _ = self.events.send(DeviceEvent::Added(device));
    }

    async fn notify_removed(&self, device: Arc<dyn Device>) {
        if self.is_owned(device.as_ref()) {
            if let Err(e) = device.stop().await {
                tracing::warn!(unique_id = %device.unique_id(), "Failed to stop device: {e:#}");
            }
        }
        let _ = self.events.send(DeviceEvent::Removed(device));
    }

    async fn save_device(&self, device: &dyn Device) -> Result<()> {
        if device.is_transient() {
            return Ok(());
        }
        let mut row = Row::new();
        row.insert("state".into(), device.serialize());
        self.syncdb.insert_one(device.unique_id(), row).await?;
        Ok(())
    }

    async fn add_internal(&self, device: Arc<dyn Device>, save: bool) -> Result<Arc<dyn Device>> {
        let existing = self.devices.read().get(device.unique_id()).cloned();
        if let Some(existing) = existing {
            if Arc::ptr_eq(&existing, &device) {
                return Ok(existing);
            }
            existing.update_state(device.serialize());
            if save {
                self.save_device(existing.as_ref()).await?;
            }
            return Ok(existing);
        }

        self.devices
            .write()
            .insert(device.unique_id().to_string(), Arc::clone(&device));
        if save {
            self.save_device(device.as_ref()).await?;
        }
        self.notify_added(Arc::clone(&device)).await;
        Ok(device)
    }

    /// Load without saving; a state the factory rejects is purged.
    async fn load_one_device(&self, unique_id: &str, state: Value) {
        match self.factory.load_serialized(unique_id, state).await {
            Ok(device) => {
                if let Err(e) = self.add_internal(device, false).await {
                    tracing::error!(%unique_id, "Failed to add device: {e:#}");
                }
            }
            Err(e) => {
                tracing::error!(%unique_id, "Failed to load device, removing it: {e:#}");
                if let Err(e) = self.syncdb.delete_one(unique_id).await {
                    tracing::warn!(%unique_id, "Failed to remove unloadable device: {e:#}");
                }
            }
        }
    }

    async fn on_object_added(&self, unique_id: &str, row: &Row) {
        let Some(state) = state_of(row) else {
            tracing::warn!(%unique_id, "Synced device row without state");
            return;
        };
        let existing = self.devices.read().get(unique_id).cloned();
        match existing {
            Some(device) => device.update_state(state),
            None => self.load_one_device(unique_id, state).await,
        }
    }

    async fn on_object_deleted(&self, unique_id: &str) {
        let removed = self.devices.write().remove(unique_id);
        if let Some(device) = removed {
            self.notify_removed(device).await;
        }
    }

    async fn reload(&self, device: Arc<dyn Device>) {
        let unique_id = device.unique_id().to_string();
        let state = device.serialize();
        let removed = self.devices.write().remove(&unique_id);
        if let Some(removed) = removed {
            self.notify_removed(removed).await;
        }
        self.load_one_device(&unique_id, state).await;
    }

    async fn check_for_updates(&self) {
        let kinds: BTreeSet<String> = self
            .devices
            .read()
            .values()
            .map(|d| d.kind().to_string())
            .filter(|k| !k.starts_with("org.thingpedia.builtin"))
            .collect();

        for kind in kinds {
            if let Err(e) = self.factory.update_device_class(&kind).await {
                tracing::warn!(%kind, "Failed to update device class: {e:#}");
                continue;
            }
            let latest = match self.factory.device_class_version(&kind).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(%kind, "Failed to read device class version: {e:#}");
                    continue;
                }
            };
            let stale: Vec<Arc<dyn Device>> = self
                .devices
                .read()
                .values()
                .filter(|d| d.kind() == kind && d.class_version() != latest)
                .cloned()
                .collect();
            if !stale.is_empty() {
                tracing::info!(%kind, latest, count = stale.len(), "Reloading devices after class update");
            }
            for device in stale {
                self.reload(device).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::thingengine::{own_unique_id, BuiltinDeviceFactory, ThingEngineDevice, ThingEngineState};
    use super::*;
    use crate::db::{MemoryTable, SyncTable};
    use crate::error::SyncError;
    use crate::platform::prefs::{Preferences, SharedPreferences};
    use crate::sync::manager::{HandlerRegistry, MessageHandler, SyncTransport, TierEvent};
    use crate::sync::protocol::{Envelope, SyncMessage};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    struct LoopbackTransport {
        own: TierAddress,
        handlers: HandlerRegistry,
        events: broadcast::Sender<TierEvent>,
    }

    impl SyncTransport for LoopbackTransport {
        fn own_tier(&self) -> Tier {
            self.own.tier()
        }
        fn own_address(&self) -> TierAddress {
            self.own.clone()
        }
        fn register_handler(&self, target: &str, handler: Arc<dyn MessageHandler>) -> Result<(), SyncError> {
            self.handlers.register(target, handler)
        }
        fn is_client_tier(&self, _: &TierAddress) -> bool {
            false
        }
        fn client_connections(&self) -> Vec<TierAddress> {
            Vec::new()
        }
        fn subscribe(&self) -> broadcast::Receiver<TierEvent> {
            self.events.subscribe()
        }
        fn send_to(&self, _: &TierAddress, _: Envelope) {}
        fn send_to_all(&self, _: Envelope) {}
    }

    /// Test device; counts start/stop calls.
    struct Lamp {
        id: String,
        owner: TierAddress,
        version: u32,
        state: RwLock<Value>,
        started: AtomicUsize,
        stopped: AtomicUsize,
    }

    #[async_trait]
    impl Device for Lamp {
        fn unique_id(&self) -> &str {
            &self.id
        }
        fn kind(&self) -> &str {
            "com.example.lamp"
        }
        fn owner_tier(&self) -> TierAddress {
            self.owner.clone()
        }
        fn class_version(&self) -> u32 {
            self.version
        }
        fn serialize(&self) -> Value {
            self.state.read().clone()
        }
        fn update_state(&self, state: Value) {
            *self.state.write() = state;
        }
        async fn start(&self) -> Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct LampFactory {
        version: AtomicU32,
        loaded: Mutex<Vec<Arc<Lamp>>>,
    }

    #[async_trait]
    impl DeviceFactory for LampFactory {
        async fn load_serialized(&self, unique_id: &str, state: Value) -> Result<Arc<dyn Device>> {
            let owner = state
                .get("owner")
                .and_then(Value::as_str)
                .unwrap_or("global")
                .parse()?;
            let lamp = Arc::new(Lamp {
                id: unique_id.to_string(),
                owner,
                version: self.version.load(Ordering::SeqCst),
                state: RwLock::new(state),
                started: AtomicUsize::new(0),
                stopped: AtomicUsize::new(0),
            });
            self.loaded.lock().push(Arc::clone(&lamp));
            Ok(lamp)
        }
        async fn device_class_version(&self, _kind: &str) -> Result<u32> {
            Ok(self.version.load(Ordering::SeqCst))
        }
        async fn update_device_class(&self, _kind: &str) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        devices: DeviceDatabase,
        table: Arc<MemoryTable>,
        transport: Arc<LoopbackTransport>,
        factory: Arc<LampFactory>,
    }

    fn fixture() -> Fixture {
        let own: TierAddress = "phone:aa".parse().unwrap();
        let transport = Arc::new(LoopbackTransport {
            own: own.clone(),
            handlers: HandlerRegistry::default(),
            events: broadcast::channel(8).0,
        });
        let prefs: Arc<dyn SharedPreferences> = Arc::new(Preferences::in_memory());
        let table = Arc::new(MemoryTable::new("device"));
        let syncdb = SyncDatabase::new(prefs, table.clone(), transport.clone()).unwrap();
        let factory = Arc::new(LampFactory {
            version: AtomicU32::new(1),
            loaded: Mutex::new(Vec::new()),
        });
        let devices = DeviceDatabase::new(
            syncdb,
            Arc::new(BuiltinDeviceFactory::new().with_fallback(factory.clone())),
            own,
        );
        Fixture {
            devices,
            table,
            transport,
            factory,
        }
    }

    async fn deliver_change(f: &Fixture, id: &str, ts: i64, row: Option<Value>) {
        let message = SyncMessage::Change {
            unique_id: id.into(),
            last_modified: ts,
            row: row.map(|v| v.as_object().cloned().unwrap()),
        };
        let envelope = Envelope::new("syncdb-device", &message).unwrap();
        f.transport
            .handlers
            .dispatch(&TierAddress::cloud(), envelope)
            .await;
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn start_loads_stored_devices_and_purges_unloadable() {
        let f = fixture();
        f.table
            .insert_one("lamp-1", json!({"state": {"kind": "com.example.lamp"}}).as_object().cloned().unwrap())
            .await
            .unwrap();
        f.table
            .insert_one(
                "lamp-2",
                json!({"state": "{\"kind\":\"com.example.lamp\",\"owner\":\"phone:aa\"}"})
                    .as_object()
                    .cloned()
                    .unwrap(),
            )
            .await
            .unwrap();
        f.table
            .insert_one("bad", json!({"state": {"kind": "org.thingpedia.builtin.thingengine"}}).as_object().cloned().unwrap())
            .await
            .unwrap();

        f.devices.start().await.unwrap();
        assert!(f.devices.has_device("lamp-1"));
        assert!(f.devices.has_device("lamp-2"));
        assert!(!f.devices.has_device("bad"));
        assert!(f.table.get_one("bad").await.unwrap().is_none());

        // Both lamps are owned here (global, and our own address).
        let loaded = f.factory.loaded.lock().clone();
        assert!(loaded.iter().all(|l| l.started.load(Ordering::SeqCst) == 1));
        f.devices.stop().await;
        assert!(loaded.iter().all(|l| l.stopped.load(Ordering::SeqCst) == 1));
    }

    #[tokio::test]
    async fn synced_rows_drive_device_lifecycle() {
        let f = fixture();
        f.devices.start().await.unwrap();
        let mut events = f.devices.subscribe();

        deliver_change(&f, "lamp-9", 100, Some(json!({"state": {"kind": "com.example.lamp", "owner": "server:zz"}}))).await;
        settle().await;
        let lamp = f.devices.get_device("lamp-9").unwrap();
        assert!(matches!(events.try_recv(), Ok(DeviceEvent::Added(_))));
        // Owned elsewhere: not started here.
        assert_eq!(f.factory.loaded.lock()[0].started.load(Ordering::SeqCst), 0);

        deliver_change(&f, "lamp-9", 200, Some(json!({"state": {"kind": "com.example.lamp", "owner": "server:zz", "on": true}}))).await;
        settle().await;
        assert_eq!(lamp.serialize()["on"], true);
        assert_eq!(f.factory.loaded.lock().len(), 1);

        deliver_change(&f, "lamp-9", 300, None).await;
        settle().await;
        assert!(!f.devices.has_device("lamp-9"));
        assert!(matches!(events.try_recv(), Ok(DeviceEvent::Removed(_))));
    }

    #[tokio::test]
    async fn add_and_remove_write_through_the_table() {
        let f = fixture();
        f.devices.start().await.unwrap();

        let device = f
            .devices
            .add_serialized(json!({"kind": "com.example.lamp", "uniqueId": "lamp-5"}))
            .await
            .unwrap();
        let stored = f.table.get_one("lamp-5").await.unwrap().unwrap();
        assert_eq!(stored["state"]["kind"], "com.example.lamp");

        let generated = f.devices.add_serialized(json!({"kind": "com.example.lamp"})).await.unwrap();
        assert!(generated.unique_id().starts_with("com.example.lamp-"));

        f.devices.remove_device(&device).await.unwrap();
        assert!(!f.devices.has_device("lamp-5"));
        assert!(f.table.get_one("lamp-5").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn adding_known_id_merges_state() {
        let f = fixture();
        let address: TierAddress = "server:bb".parse().unwrap();
        let first: Arc<dyn Device> = Arc::new(ThingEngineDevice::new(ThingEngineState::new(&address)));
        f.devices.add_device(first.clone()).await.unwrap();

        let mut state = ThingEngineState::new(&address);
        state.port = Some(3000);
        let second: Arc<dyn Device> = Arc::new(ThingEngineDevice::new(state));
        let kept = f.devices.add_device(second).await.unwrap();

        assert!(Arc::ptr_eq(&kept, &first));
        assert_eq!(first.serialize()["port"], 3000);
        assert_eq!(f.devices.values().len(), 1);
        assert!(f.devices.has_device(&own_unique_id(&address)));
    }

    #[tokio::test]
    async fn class_update_reloads_stale_devices() {
        let f = fixture();
        f.devices.start().await.unwrap();
        f.devices
            .add_serialized(json!({"kind": "com.example.lamp", "uniqueId": "lamp-1"}))
            .await
            .unwrap();

        f.factory.version.store(2, Ordering::SeqCst);
        f.devices.inner.check_for_updates().await;

        let lamp = f.devices.get_device("lamp-1").unwrap();
        assert_eq!(lamp.class_version(), 2);
        assert_eq!(f.factory.loaded.lock().len(), 2);
        assert_eq!(f.factory.loaded.lock()[0].stopped.load(Ordering::SeqCst), 1);
    }
}
