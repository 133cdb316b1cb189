//! Synchronized tables.
//!
//! A [`SyncTable`] is a keyed row store plus a change journal: every write
//! stamps the row's `uniqueId` with a `lastModified` time (epoch ms) and
//! deletions leave a tombstone in the journal. Remote changes are applied
//! with last-writer-wins: a change is accepted only if it is strictly newer
//! than what the journal already has, which also makes replays harmless.

pub mod memory;
pub mod sqlite;
pub mod syncdb;

pub use crate::sync::protocol::{Row, SyncRecord};
pub use memory::MemoryTable;
pub use sqlite::SqliteTable;
pub use syncdb::{ObjectEvent, SyncDatabase};

use anyhow::Result;
use async_trait::async_trait;

/// Answer to a `sync-request`, computed by [`SyncTable::sync_at`].
#[derive(Debug, Clone, PartialEq)]
pub struct SyncAtReply {
    /// Journal high-water mark before the pushed changes were applied.
    pub last_modified: i64,
    /// Our changes the requester has not seen.
    pub our_changes: Vec<SyncRecord>,
    /// Acceptance flag for each pushed change, in order.
    pub done: Vec<bool>,
}

#[async_trait]
pub trait SyncTable: Send + Sync {
    fn name(&self) -> &str;

    async fn get_all(&self) -> Result<Vec<(String, Row)>>;

    async fn get_one(&self, unique_id: &str) -> Result<Option<Row>>;

    /// Every journal entry joined with its row (tombstones included).
    async fn get_raw(&self) -> Result<Vec<SyncRecord>>;

    /// Journal entries strictly newer than `last_modified`.
    async fn get_changes_after(&self, last_modified: i64) -> Result<Vec<SyncRecord>>;

    /// Highest journaled `lastModified`, or 0 for an empty journal.
    async fn last_modified(&self) -> Result<i64>;

    /// Local write. Returns the `lastModified` it was stamped with.
    async fn insert_one(&self, unique_id: &str, row: Row) -> Result<i64>;

    /// Local delete. Returns the tombstone's `lastModified`.
    async fn delete_one(&self, unique_id: &str) -> Result<i64>;

    async fn insert_if_recent(&self, unique_id: &str, last_modified: i64, row: Row) -> Result<bool>;

    async fn delete_if_recent(&self, unique_id: &str, last_modified: i64) -> Result<bool>;

    /// Wipe the table and load `records`; tombstones are skipped.
    async fn replace_all(&self, records: Vec<SyncRecord>) -> Result<()>;

    /// Apply remote changes; one acceptance flag per record.
    async fn handle_changes(&self, changes: &[SyncRecord]) -> Result<Vec<bool>> {
        let mut done = Vec::with_capacity(changes.len());
        for change in changes {
            let accepted = match &change.row {
                Some(row) => {
                    self.insert_if_recent(&change.unique_id, change.last_modified, row.clone())
                        .await?
                }
                None => {
                    self.delete_if_recent(&change.unique_id, change.last_modified)
                        .await?
                }
            };
            done.push(accepted);
        }
        Ok(done)
    }

    /// Serve a pull from a peer whose checkpoint is `last_modified`, applying
    /// the changes it pushed along with the request.
    async fn sync_at(&self, last_modified: i64, pushed: &[SyncRecord]) -> Result<SyncAtReply> {
        let our_changes = self.get_changes_after(last_modified).await?;
        let high_water = self.last_modified().await?;
        let done = self.handle_changes(pushed).await?;
        Ok(SyncAtReply {
            last_modified: high_water,
            our_changes,
            done,
        })
    }
}

/// Current time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Stamp for a local write: now, but never at or before the previous stamp.
pub(crate) fn next_stamp(previous: Option<i64>) -> i64 {
    let now = now_ms();
    match previous {
        Some(prev) if prev >= now => prev + 1,
        _ => now,
    }
}
