//! Per-table synchronization protocol.
//!
//! ## Design
//! - One [`SyncDatabase`] per table, registered with the tier layer under
//!   `syncdb-<table>`.
//! - Local writes go to the backing table first and are then broadcast as
//!   `change` messages to every connected tier.
//! - When a client-side tier connects we pull: `sync-request` carries our
//!   changes since the checkpoint, `sync-reply` carries theirs plus a new
//!   checkpoint, persisted before the batch is applied.
//! - A failure while applying a `change` or `sync-reply` triggers a full resync:
//!   non-cloud tiers ask the cloud with `force-sync`; the cloud instead
//!   tells the peer to ask it (`do-force-sync`). Only the cloud is treated
//!   as the authority.

use super::{now_ms, Row, SyncRecord, SyncTable};
use crate::error::SyncError;
use crate::platform::prefs::SharedPreferences;
use crate::sync::manager::{MessageHandler, SyncTransport, TierEvent};
use crate::sync::protocol::{Envelope, SyncMessage};
use crate::sync::tier::{Tier, TierAddress};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const EVENT_CAPACITY: usize = 256;

/// Row-level notifications for consumers of a synced table.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectEvent {
    Added { unique_id: String, row: Row },
    Deleted { unique_id: String },
}

struct SyncDbInner {
    table: Arc<dyn SyncTable>,
    transport: Arc<dyn SyncTransport>,
    prefs: Arc<dyn SharedPreferences>,
    target: String,
    events: broadcast::Sender<ObjectEvent>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct SyncDatabase {
    inner: Arc<SyncDbInner>,
}

impl SyncDatabase {
    /// Wrap `table` and register its message handler.
    pub fn new(
        prefs: Arc<dyn SharedPreferences>,
        table: Arc<dyn SyncTable>,
        transport: Arc<dyn SyncTransport>,
    ) -> Result<Self, SyncError> {
        let target = format!("syncdb-{}", table.name());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(SyncDbInner {
            table,
            transport,
            prefs,
            target,
            events,
            listener: Mutex::new(None),
        });
        inner
            .transport
            .register_handler(&inner.target, Arc::clone(&inner) as Arc<dyn MessageHandler>)?;
        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        self.inner.table.name()
    }

    pub fn target(&self) -> &str {
        &self.inner.target
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ObjectEvent> {
        self.inner.events.subscribe()
    }

    /// Sync with every connected client tier now and whenever one connects.
    pub async fn open(&self) {
        let mut tier_events = self.inner.transport.subscribe();
        let inner = Arc::clone(&self.inner);
        let listener = tokio::spawn(async move {
            loop {
                match tier_events.recv().await {
                    Ok(TierEvent::Connected(address)) => {
                        if inner.transport.is_client_tier(&address) {
                            inner.sync(&address).await;
                        }
                    }
                    Ok(TierEvent::Disconnected(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(table = %inner.table.name(), skipped, "Missed tier events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Some(previous) = self.inner.listener.lock().replace(listener) {
            previous.abort();
        }

        for address in self.inner.transport.client_connections() {
            self.inner.sync(&address).await;
        }
    }

    /// Stop reacting to new connections.
    pub fn close(&self) {
        if let Some(listener) = self.inner.listener.lock().take() {
            listener.abort();
        }
    }

    /// Send a `sync-request` to `remote` from our persisted checkpoint.
    pub async fn sync(&self, remote: &TierAddress) {
        self.inner.sync(remote).await;
    }

    pub async fn get_all(&self) -> Result<Vec<(String, Row)>> {
        self.inner.table.get_all().await
    }

    pub async fn get_one(&self, unique_id: &str) -> Result<Option<Row>> {
        self.inner.table.get_one(unique_id).await
    }

    pub async fn insert_one(&self, unique_id: &str, row: Row) -> Result<i64> {
        let last_modified = self.inner.table.insert_one(unique_id, row.clone()).await?;
        self.inner.broadcast(SyncMessage::Change {
            unique_id: unique_id.to_string(),
            last_modified,
            row: Some(row),
        });
        Ok(last_modified)
    }

    pub async fn delete_one(&self, unique_id: &str) -> Result<i64> {
        let last_modified = self.inner.table.delete_one(unique_id).await?;
        self.inner.broadcast(SyncMessage::Change {
            unique_id: unique_id.to_string(),
            last_modified,
            row: None,
        });
        Ok(last_modified)
    }

    /// Persisted checkpoint for `remote`.
    pub fn last_sync_time(&self, remote: &TierAddress) -> i64 {
        self.inner.last_sync_time(remote)
    }
}

impl SyncDbInner {
    fn checkpoint_key(&self, remote: &TierAddress) -> String {
        format!("syncdb-time-{}-{}", self.table.name(), remote)
    }

    fn last_sync_time(&self, remote: &TierAddress) -> i64 {
        self.prefs
            .get_as::<i64>(&self.checkpoint_key(remote))
            .unwrap_or(0)
    }

    fn set_last_sync_time(&self, remote: &TierAddress, time: i64) {
        self.prefs
            .set(&self.checkpoint_key(remote), Value::from(time));
    }

    fn envelope(&self, message: &SyncMessage) -> Option<Envelope> {
        match Envelope::new(self.target.clone(), message) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                tracing::error!(table = %self.table.name(), op = message.op(), "Failed to encode message: {e}");
                None
            }
        }
    }

    fn send(&self, to: &TierAddress, message: SyncMessage) {
        if let Some(envelope) = self.envelope(&message) {
            self.transport.send_to(to, envelope);
        }
    }

    fn broadcast(&self, message: SyncMessage) {
        if let Some(envelope) = self.envelope(&message) {
            self.transport.send_to_all(envelope);
        }
    }

    fn emit(&self, event: ObjectEvent) {
        let _ = self.events.send(event);
    }

    fn emit_change(&self, record: SyncRecord) {
        match record.row {
            Some(row) => self.emit(ObjectEvent::Added {
                unique_id: record.unique_id,
                row,
            }),
            None => self.emit(ObjectEvent::Deleted {
                unique_id: record.unique_id,
            }),
        }
    }

    async fn sync(&self, remote: &TierAddress) {
        let last_sync_time = self.last_sync_time(remote);
        match self.table.get_changes_after(last_sync_time).await {
            Ok(values) => {
                tracing::debug!(table = %self.table.name(), %remote, last_sync_time, count = values.len(), "Requesting sync");
                self.send(
                    remote,
                    SyncMessage::SyncRequest {
                        last_sync_time,
                        values,
                    },
                );
            }
            Err(e) => {
                tracing::warn!(table = %self.table.name(), %remote, "Failed to read local changes: {e:#}");
            }
        }
    }

    /// Ask for a full copy from whoever is authoritative for this pair.
    fn handle_conflict(&self, from: &TierAddress) {
        if self.transport.own_tier() == Tier::Cloud {
            tracing::warn!(table = %self.table.name(), %from, "Peer out of sync, asking it to resynchronize");
            self.send(from, SyncMessage::DoForceSync);
        } else {
            tracing::warn!(table = %self.table.name(), "Local table out of sync, requesting full copy from cloud");
            self.send(&TierAddress::cloud(), SyncMessage::ForceSync);
        }
    }

    fn is_own_device(&self, unique_id: &str) -> bool {
        unique_id == format!("thingengine-own-{}", self.transport.own_address())
    }

    async fn handle_change(
        &self,
        from: &TierAddress,
        unique_id: String,
        last_modified: i64,
        row: Option<Row>,
    ) -> Result<()> {
        if self.is_own_device(&unique_id) {
            tracing::debug!(table = %self.table.name(), %from, %unique_id, "Ignoring remote change to own engine record");
            return Ok(());
        }
        let accepted = match &row {
            Some(row) => {
                self.table
                    .insert_if_recent(&unique_id, last_modified, row.clone())
                    .await?
            }
            None => self.table.delete_if_recent(&unique_id, last_modified).await?,
        };
        if accepted {
            self.emit_change(SyncRecord {
                unique_id,
                last_modified,
                row,
            });
        } else {
            tracing::debug!(table = %self.table.name(), %from, %unique_id, last_modified, "Ignored stale change");
        }
        Ok(())
    }

    async fn report_changes(&self, changes: Vec<SyncRecord>) -> Result<()> {
        let done = self.table.handle_changes(&changes).await?;
        for (record, accepted) in changes.into_iter().zip(done) {
            if accepted {
                self.emit_change(record);
            }
        }
        Ok(())
    }

    async fn handle_sync_reply(&self, from: &TierAddress, last_modified: i64, values: Vec<SyncRecord>) -> Result<()> {
        self.set_last_sync_time(from, last_modified);
        tracing::debug!(table = %self.table.name(), %from, last_modified, count = values.len(), "Applying sync reply");
        self.report_changes(values).await
    }

    async fn handle_sync_request(&self, from: &TierAddress, last_sync_time: i64, values: Vec<SyncRecord>) -> Result<()> {
        let reply = self.table.sync_at(last_sync_time, &values).await?;
        for (record, accepted) in values.into_iter().zip(reply.done) {
            if accepted {
                self.emit_change(record);
            }
        }
        self.send(
            from,
            SyncMessage::SyncReply {
                last_modified: reply.last_modified,
                values: reply.our_changes,
            },
        );
        Ok(())
    }

    async fn handle_force_sync(&self, from: &TierAddress) -> Result<()> {
        let values = self.table.get_raw().await?;
        self.send(from, SyncMessage::ForceSyncData { values });
        Ok(())
    }

    async fn handle_force_sync_data(&self, from: &TierAddress, values: Vec<SyncRecord>) -> Result<()> {
        self.set_last_sync_time(from, now_ms());
        let before: BTreeSet<String> = self
            .table
            .get_all()
            .await?
            .into_iter()
            .map(|(id, _)| id)
            .collect();

        tracing::info!(table = %self.table.name(), %from, count = values.len(), "Replacing table with full copy");
        self.table.replace_all(values).await?;

        let after = self.table.get_all().await?;
        let present: BTreeSet<&str> = after.iter().map(|(id, _)| id.as_str()).collect();
        for gone in before.iter().filter(|id| !present.contains(id.as_str())) {
            self.emit(ObjectEvent::Deleted {
                unique_id: gone.clone(),
            });
        }
        for (unique_id, row) in after {
            self.emit(ObjectEvent::Added { unique_id, row });
        }
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for SyncDbInner {
    async fn handle_message(&self, from: &TierAddress, envelope: Envelope) {
        let message = match envelope.decode::<SyncMessage>() {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(table = %self.table.name(), %from, "Dropping malformed sync message: {e}");
                return;
            }
        };
        let op = message.op();

        let result = match message {
            SyncMessage::Change {
                unique_id,
                last_modified,
                row,
            } => self.handle_change(from, unique_id, last_modified, row).await,
            SyncMessage::SyncRequest {
                last_sync_time,
                values,
            } => self.handle_sync_request(from, last_sync_time, values).await,
            SyncMessage::SyncReply {
                last_modified,
                values,
            } => self.handle_sync_reply(from, last_modified, values).await,
            SyncMessage::ForceSync => self.handle_force_sync(from).await,
            SyncMessage::ForceSyncData { values } => self.handle_force_sync_data(from, values).await,
            SyncMessage::DoForceSync => {
                self.send(from, SyncMessage::ForceSync);
                Ok(())
            }
        };

        if let Err(e) = result {
            tracing::error!(table = %self.table.name(), %from, op, "Failed to apply sync message: {e:#}");
            // A failed sync-request is only logged.
            if matches!(op, "change" | "sync-reply") {
                self.handle_conflict(from);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryTable;
    use crate::platform::prefs::Preferences;
    use crate::sync::manager::HandlerRegistry;
    use anyhow::bail;
    use serde_json::json;

    /// Records outgoing messages and delivers inbound ones straight to handlers.
    struct RecordingTransport {
        own: TierAddress,
        clients: Mutex<Vec<TierAddress>>,
        sent: Mutex<Vec<(Option<TierAddress>, SyncMessage)>>,
        handlers: HandlerRegistry,
        events: broadcast::Sender<TierEvent>,
    }

    impl RecordingTransport {
        fn new(own: &str) -> Arc<Self> {
            Arc::new(Self {
                own: own.parse().unwrap(),
                clients: Mutex::new(Vec::new()),
                sent: Mutex::new(Vec::new()),
                handlers: HandlerRegistry::default(),
                events: broadcast::channel(16).0,
            })
        }

        async fn deliver(&self, from: &str, message: SyncMessage) {
            let envelope = Envelope::new("syncdb-device", &message).unwrap();
            self.handlers.dispatch(&from.parse().unwrap(), envelope).await;
        }

        fn take_sent(&self) -> Vec<(Option<TierAddress>, SyncMessage)> {
            std::mem::take(&mut *self.sent.lock())
        }
    }

    impl SyncTransport for RecordingTransport {
        fn own_tier(&self) -> Tier {
            self.own.tier()
        }
        fn own_address(&self) -> TierAddress {
            self.own.clone()
        }
        fn register_handler(&self, target: &str, handler: Arc<dyn MessageHandler>) -> Result<(), SyncError> {
            self.handlers.register(target, handler)
        }
        fn is_client_tier(&self, address: &TierAddress) -> bool {
            self.clients.lock().contains(address)
        }
        fn client_connections(&self) -> Vec<TierAddress> {
            self.clients.lock().clone()
        }
        fn subscribe(&self) -> broadcast::Receiver<TierEvent> {
            self.events.subscribe()
        }
        fn send_to(&self, address: &TierAddress, envelope: Envelope) {
            self.sent
                .lock()
                .push((Some(address.clone()), envelope.decode().unwrap()));
        }
        fn send_to_all(&self, envelope: Envelope) {
            self.sent.lock().push((None, envelope.decode().unwrap()));
        }
    }

    /// A table whose conditional writes always fail.
    struct BrokenTable(MemoryTable);

    #[async_trait]
    impl SyncTable for BrokenTable {
        fn name(&self) -> &str {
            self.0.name()
        }
        async fn get_all(&self) -> Result<Vec<(String, Row)>> {
            self.0.get_all().await
        }
        async fn get_one(&self, unique_id: &str) -> Result<Option<Row>> {
            self.0.get_one(unique_id).await
        }
        async fn get_raw(&self) -> Result<Vec<SyncRecord>> {
            self.0.get_raw().await
        }
        async fn get_changes_after(&self, last_modified: i64) -> Result<Vec<SyncRecord>> {
            self.0.get_changes_after(last_modified).await
        }
        async fn last_modified(&self) -> Result<i64> {
            self.0.last_modified().await
        }
        async fn insert_one(&self, unique_id: &str, row: Row) -> Result<i64> {
            self.0.insert_one(unique_id, row).await
        }
        async fn delete_one(&self, unique_id: &str) -> Result<i64> {
            self.0.delete_one(unique_id).await
        }
        async fn insert_if_recent(&self, _: &str, _: i64, _: Row) -> Result<bool> {
            bail!("disk image is malformed")
        }
        async fn delete_if_recent(&self, _: &str, _: i64) -> Result<bool> {
            bail!("disk image is malformed")
        }
        async fn replace_all(&self, records: Vec<SyncRecord>) -> Result<()> {
            self.0.replace_all(records).await
        }
    }

    struct Fixture {
        db: SyncDatabase,
        table: Arc<dyn SyncTable>,
        transport: Arc<RecordingTransport>,
        prefs: Arc<dyn SharedPreferences>,
        events: broadcast::Receiver<ObjectEvent>,
    }

    fn fixture_with(own: &str, table: Arc<dyn SyncTable>) -> Fixture {
        let transport = RecordingTransport::new(own);
        let prefs: Arc<dyn SharedPreferences> = Arc::new(Preferences::in_memory());
        let db = SyncDatabase::new(prefs.clone(), table.clone(), transport.clone()).unwrap();
        let events = db.subscribe();
        Fixture {
            db,
            table,
            transport,
            prefs,
            events,
        }
    }

    fn fixture(own: &str) -> Fixture {
        fixture_with(own, Arc::new(MemoryTable::new("device")))
    }

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    fn drain(events: &mut broadcast::Receiver<ObjectEvent>) -> Vec<ObjectEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    fn change(id: &str, ts: i64, row: Option<Row>) -> SyncMessage {
        SyncMessage::Change {
            unique_id: id.into(),
            last_modified: ts,
            row,
        }
    }

    #[tokio::test]
    async fn registers_under_syncdb_target() {
        let f = fixture("phone:aa");
        assert_eq!(f.db.target(), "syncdb-device");
        let err = SyncDatabase::new(f.prefs.clone(), f.table.clone(), f.transport.clone())
            .err()
            .unwrap();
        assert!(matches!(err, SyncError::DuplicateHandler(_)));
    }

    #[tokio::test]
    async fn duplicate_change_is_applied_once() {
        let mut f = fixture("phone:aa");
        let msg = change("d1", 100, Some(row(json!({"v": 1}))));
        f.transport.deliver("cloud", msg.clone()).await;
        f.transport.deliver("cloud", msg).await;

        let events = drain(&mut f.events);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ObjectEvent::Added { unique_id, .. } if unique_id == "d1"));
        assert_eq!(f.table.get_one("d1").await.unwrap(), Some(row(json!({"v": 1}))));
    }

    #[tokio::test]
    async fn older_change_never_overwrites_newer() {
        let mut f = fixture("phone:aa");
        f.transport.deliver("cloud", change("d1", 200, Some(row(json!({"v": "B"}))))).await;
        f.transport.deliver("cloud", change("d1", 100, Some(row(json!({"v": "A"}))))).await;
        f.transport.deliver("cloud", change("d1", 150, None)).await;

        assert_eq!(f.table.get_one("d1").await.unwrap(), Some(row(json!({"v": "B"}))));
        assert_eq!(drain(&mut f.events).len(), 1);
    }

    #[tokio::test]
    async fn own_engine_record_is_protected() {
        let mut f = fixture("phone:aa");
        f.transport
            .deliver("cloud", change("thingengine-own-phone:aa", 500, None))
            .await;
        f.transport
            .deliver("cloud", change("thingengine-own-phone:aa", 600, Some(row(json!({"evil": true})))))
            .await;
        assert!(drain(&mut f.events).is_empty());
        assert!(f.table.get_raw().await.unwrap().is_empty());

        // Other engines' records are ordinary rows.
        f.transport
            .deliver("cloud", change("thingengine-own-server:bb", 600, Some(row(json!({})))))
            .await;
        assert_eq!(drain(&mut f.events).len(), 1);
    }

    #[tokio::test]
    async fn fresh_sync_sends_everything() {
        let f = fixture("phone:aa");
        for i in 0..5 {
            f.db.insert_one(&format!("d{i}"), row(json!({"i": i}))).await.unwrap();
        }
        let broadcasts = f.transport.take_sent();
        assert_eq!(broadcasts.len(), 5);
        assert!(broadcasts.iter().all(|(to, m)| to.is_none() && m.op() == "change"));

        let cloud = TierAddress::cloud();
        f.db.sync(&cloud).await;
        let sent = f.transport.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.as_ref(), Some(&cloud));
        match &sent[0].1 {
            SyncMessage::SyncRequest {
                last_sync_time,
                values,
            } => {
                assert_eq!(*last_sync_time, 0);
                assert_eq!(values.len(), 5);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn reply_checkpoint_is_used_for_next_request() {
        let f = fixture("phone:aa");
        f.transport
            .deliver(
                "cloud",
                SyncMessage::SyncReply {
                    last_modified: 1234,
                    values: vec![],
                },
            )
            .await;
        assert_eq!(f.prefs.get_as::<i64>("syncdb-time-device-cloud"), Some(1234));
        assert_eq!(f.db.last_sync_time(&TierAddress::cloud()), 1234);

        f.db.sync(&TierAddress::cloud()).await;
        match &f.transport.take_sent()[0].1 {
            SyncMessage::SyncRequest { last_sync_time, .. } => assert_eq!(*last_sync_time, 1234),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn partial_batch_reports_only_accepted_records() {
        let mut f = fixture("phone:aa");
        f.table.insert_if_recent("a", 100, row(json!({"v": 1}))).await.unwrap();

        f.transport
            .deliver(
                "cloud",
                SyncMessage::SyncReply {
                    last_modified: 999,
                    values: vec![
                        SyncRecord {
                            unique_id: "a".into(),
                            last_modified: 50,
                            row: Some(row(json!({"v": 0}))),
                        },
                        SyncRecord {
                            unique_id: "b".into(),
                            last_modified: 200,
                            row: Some(row(json!({"v": 2}))),
                        },
                        SyncRecord {
                            unique_id: "c".into(),
                            last_modified: 300,
                            row: None,
                        },
                    ],
                },
            )
            .await;

        let events = drain(&mut f.events);
        assert_eq!(
            events,
            vec![
                ObjectEvent::Added {
                    unique_id: "b".into(),
                    row: row(json!({"v": 2}))
                },
                ObjectEvent::Deleted {
                    unique_id: "c".into()
                },
            ]
        );
        assert_eq!(f.db.last_sync_time(&TierAddress::cloud()), 999);
    }

    #[tokio::test]
    async fn corruption_on_edge_tier_asks_cloud_once() {
        let f = fixture_with("desktop:aa", Arc::new(BrokenTable(MemoryTable::new("device"))));
        f.transport
            .deliver(
                "server:bb",
                SyncMessage::SyncReply {
                    last_modified: 10,
                    values: vec![SyncRecord {
                        unique_id: "x".into(),
                        last_modified: 5,
                        row: Some(row(json!({"v": 1}))),
                    }],
                },
            )
            .await;

        let sent = f.transport.take_sent();
        assert_eq!(sent, vec![(Some(TierAddress::cloud()), SyncMessage::ForceSync)]);
    }

    #[tokio::test]
    async fn corruption_seen_by_cloud_asks_peer_to_resync() {
        let f = fixture_with("cloud", Arc::new(BrokenTable(MemoryTable::new("device"))));
        f.transport
            .deliver("phone:cc", change("x", 5, Some(Row::new())))
            .await;

        let sent = f.transport.take_sent();
        assert_eq!(
            sent,
            vec![(Some("phone:cc".parse().unwrap()), SyncMessage::DoForceSync)]
        );
    }

    #[tokio::test]
    async fn failed_sync_request_is_not_escalated() {
        let f = fixture_with("cloud", Arc::new(BrokenTable(MemoryTable::new("device"))));
        f.transport
            .deliver(
                "phone:cc",
                SyncMessage::SyncRequest {
                    last_sync_time: 0,
                    values: vec![SyncRecord {
                        unique_id: "x".into(),
                        last_modified: 5,
                        row: Some(row(json!({"v": 1}))),
                    }],
                },
            )
            .await;

        assert!(f.transport.take_sent().is_empty());
    }

    #[tokio::test]
    async fn sync_request_is_answered_and_pushed_changes_applied() {
        let mut f = fixture("cloud");
        f.table.insert_if_recent("mine", 100, row(json!({"v": 1}))).await.unwrap();

        f.transport
            .deliver(
                "phone:cc",
                SyncMessage::SyncRequest {
                    last_sync_time: 0,
                    values: vec![SyncRecord {
                        unique_id: "theirs".into(),
                        last_modified: 50,
                        row: Some(row(json!({"v": 2}))),
                    }],
                },
            )
            .await;

        let sent = f.transport.take_sent();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            (Some(to), SyncMessage::SyncReply { last_modified, values }) => {
                assert_eq!(to.to_string(), "phone:cc");
                assert_eq!(*last_modified, 100);
                assert_eq!(values.len(), 1);
                assert_eq!(values[0].unique_id, "mine");
            }
            other => panic!("unexpected {other:?}"),
        }
        let events = drain(&mut f.events);
        assert!(matches!(&events[..], [ObjectEvent::Added { unique_id, .. }] if unique_id == "theirs"));
    }

    #[tokio::test]
    async fn force_sync_round_trip() {
        let mut f = fixture("phone:aa");
        f.table.insert_if_recent("stale", 10, row(json!({"v": 0}))).await.unwrap();

        f.transport.deliver("server:bb", SyncMessage::DoForceSync).await;
        assert_eq!(
            f.transport.take_sent(),
            vec![(Some("server:bb".parse().unwrap()), SyncMessage::ForceSync)]
        );

        f.transport.deliver("server:bb", SyncMessage::ForceSync).await;
        match &f.transport.take_sent()[0].1 {
            SyncMessage::ForceSyncData { values } => assert_eq!(values.len(), 1),
            other => panic!("unexpected {other:?}"),
        }

        let before = now_ms();
        f.transport
            .deliver(
                "cloud",
                SyncMessage::ForceSyncData {
                    values: vec![SyncRecord {
                        unique_id: "fresh".into(),
                        last_modified: 20,
                        row: Some(row(json!({"ok": true}))),
                    }],
                },
            )
            .await;
        assert!(f.db.last_sync_time(&TierAddress::cloud()) >= before);
        let all = f.db.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "fresh");

        let events = drain(&mut f.events);
        assert_eq!(
            events,
            vec![
                ObjectEvent::Deleted {
                    unique_id: "stale".into()
                },
                ObjectEvent::Added {
                    unique_id: "fresh".into(),
                    row: row(json!({"ok": true}))
                },
            ]
        );
    }

    #[tokio::test]
    async fn open_syncs_with_client_tiers() {
        let f = fixture("phone:aa");
        f.transport.clients.lock().push(TierAddress::cloud());
        f.db.open().await;
        let sent = f.transport.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.op(), "sync-request");

        // A client tier connecting later triggers another pull.
        let server: TierAddress = "server:bb".parse().unwrap();
        f.transport.clients.lock().push(server.clone());
        f.transport.events.send(TierEvent::Connected(server.clone())).unwrap();
        // Inbound tiers do not.
        f.transport
            .events
            .send(TierEvent::Connected("phone:zz".parse().unwrap()))
            .unwrap();
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        let sent = f.transport.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.as_ref(), Some(&server));

        f.db.close();
    }

    #[tokio::test]
    async fn local_delete_broadcasts_tombstone() {
        let f = fixture("phone:aa");
        let ts = f.db.delete_one("gone").await.unwrap();
        assert_eq!(f.transport.take_sent(), vec![(None, change("gone", ts, None))]);
    }

    #[tokio::test]
    async fn malformed_message_is_dropped() {
        let f = fixture("phone:aa");
        let envelope = Envelope::new("syncdb-device", &json!({"op": "nonsense"})).unwrap();
        f.transport
            .handlers
            .dispatch(&TierAddress::cloud(), envelope)
            .await;
        assert!(f.transport.take_sent().is_empty());
    }
}
