//! In-memory [`SyncTable`], used by tests and by tables that need no
//! persistence across restarts.

use super::{next_stamp, Row, SyncRecord, SyncTable};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;

#[derive(Default)]
struct TableState {
    rows: BTreeMap<String, Row>,
    journal: BTreeMap<String, i64>,
}

impl TableState {
    fn record(&self, unique_id: &str, last_modified: i64) -> SyncRecord {
        SyncRecord {
            unique_id: unique_id.to_string(),
            last_modified,
            row: self.rows.get(unique_id).cloned(),
        }
    }

    fn is_recent(&self, unique_id: &str, last_modified: i64) -> bool {
        self.journal
            .get(unique_id)
            .is_none_or(|&stored| stored < last_modified)
    }
}

pub struct MemoryTable {
    name: String,
    state: Mutex<TableState>,
}

impl MemoryTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(TableState::default()),
        }
    }
}

#[async_trait]
impl SyncTable for MemoryTable {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_all(&self) -> Result<Vec<(String, Row)>> {
        let state = self.state.lock();
        Ok(state
            .rows
            .iter()
            .map(|(id, row)| (id.clone(), row.clone()))
            .collect())
    }

    async fn get_one(&self, unique_id: &str) -> Result<Option<Row>> {
        Ok(self.state.lock().rows.get(unique_id).cloned())
    }

    async fn get_raw(&self) -> Result<Vec<SyncRecord>> {
        let state = self.state.lock();
        Ok(state
            .journal
            .iter()
            .map(|(id, &ts)| state.record(id, ts))
            .collect())
    }

    async fn get_changes_after(&self, last_modified: i64) -> Result<Vec<SyncRecord>> {
        let state = self.state.lock();
        Ok(state
            .journal
            .iter()
            .filter(|(_, ts)| **ts > last_modified)
            .map(|(id, &ts)| state.record(id, ts))
            .collect())
    }

    async fn last_modified(&self) -> Result<i64> {
        Ok(self.state.lock().journal.values().copied().max().unwrap_or(0))
    }

    async fn insert_one(&self, unique_id: &str, row: Row) -> Result<i64> {
        let mut state = self.state.lock();
        let stamp = next_stamp(state.journal.get(unique_id).copied());
        state.rows.insert(unique_id.to_string(), row);
        state.journal.insert(unique_id.to_string(), stamp);
        Ok(stamp)
    }

    async fn delete_one(&self, unique_id: &str) -> Result<i64> {
        let mut state = self.state.lock();
        let stamp = next_stamp(state.journal.get(unique_id).copied());
        state.rows.remove(unique_id);
        state.journal.insert(unique_id.to_string(), stamp);
        Ok(stamp)
    }

    async fn insert_if_recent(&self, unique_id: &str, last_modified: i64, row: Row) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.is_recent(unique_id, last_modified) {
            return Ok(false);
        }
        state.rows.insert(unique_id.to_string(), row);
        state.journal.insert(unique_id.to_string(), last_modified);
        Ok(true)
    }

    async fn delete_if_recent(&self, unique_id: &str, last_modified: i64) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.is_recent(unique_id, last_modified) {
            return Ok(false);
        }
        state.rows.remove(unique_id);
        state.journal.insert(unique_id.to_string(), last_modified);
        Ok(true)
    }

    async fn replace_all(&self, records: Vec<SyncRecord>) -> Result<()> {
        let mut state = self.state.lock();
        state.rows.clear();
        state.journal.clear();
        for record in records {
            if let Some(row) = record.row {
                state.rows.insert(record.unique_id.clone(), row);
                state.journal.insert(record.unique_id, record.last_modified);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(v: serde_json::Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn conditional_writes_require_strictly_newer() {
        let table = MemoryTable::new("app");
        assert!(table.insert_if_recent("a", 10, row(json!({"v": 1}))).await.unwrap());
        assert!(!table.insert_if_recent("a", 10, row(json!({"v": 2}))).await.unwrap());
        assert!(!table.insert_if_recent("a", 9, row(json!({"v": 3}))).await.unwrap());
        assert!(!table.delete_if_recent("a", 5).await.unwrap());
        assert_eq!(table.get_one("a").await.unwrap(), Some(row(json!({"v": 1}))));

        assert!(table.delete_if_recent("a", 11).await.unwrap());
        assert!(table.get_one("a").await.unwrap().is_none());
        assert!(!table.insert_if_recent("a", 11, row(json!({"v": 4}))).await.unwrap());
    }

    #[tokio::test]
    async fn journal_keeps_tombstones() {
        let table = MemoryTable::new("app");
        table.insert_if_recent("a", 10, row(json!({}))).await.unwrap();
        table.insert_if_recent("b", 20, row(json!({}))).await.unwrap();
        table.delete_if_recent("a", 30).await.unwrap();

        let changes = table.get_changes_after(15).await.unwrap();
        assert_eq!(changes.len(), 2);
        let a = changes.iter().find(|c| c.unique_id == "a").unwrap();
        assert!(a.is_tombstone());
        assert_eq!(table.last_modified().await.unwrap(), 30);
        assert_eq!(table.get_changes_after(30).await.unwrap(), vec![]);
    }

    #[tokio::test]
    async fn local_writes_never_go_backwards() {
        let table = MemoryTable::new("app");
        let future = crate::db::now_ms() + 60_000;
        table.insert_if_recent("a", future, row(json!({}))).await.unwrap();
        let stamp = table.insert_one("a", row(json!({"v": 2}))).await.unwrap();
        assert_eq!(stamp, future + 1);
        let stamp = table.delete_one("a").await.unwrap();
        assert_eq!(stamp, future + 2);
    }

    #[tokio::test]
    async fn sync_at_reports_high_water_before_push() {
        let table = MemoryTable::new("app");
        table.insert_if_recent("a", 100, row(json!({}))).await.unwrap();
        table.insert_if_recent("b", 200, row(json!({}))).await.unwrap();

        let pushed = vec![
            SyncRecord {
                unique_id: "c".into(),
                last_modified: 500,
                row: Some(row(json!({"from": "peer"}))),
            },
            SyncRecord {
                unique_id: "b".into(),
                last_modified: 150,
                row: None,
            },
        ];
        let reply = table.sync_at(150, &pushed).await.unwrap();
        assert_eq!(reply.last_modified, 200);
        assert_eq!(reply.our_changes.len(), 1);
        assert_eq!(reply.our_changes[0].unique_id, "b");
        assert_eq!(reply.done, vec![true, false]);
        assert!(table.get_one("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn replace_all_skips_tombstones() {
        let table = MemoryTable::new("app");
        table.insert_one("old", row(json!({}))).await.unwrap();
        table
            .replace_all(vec![
                SyncRecord {
                    unique_id: "x".into(),
                    last_modified: 5,
                    row: Some(row(json!({"x": true}))),
                },
                SyncRecord {
                    unique_id: "gone".into(),
                    last_modified: 6,
                    row: None,
                },
            ])
            .await
            .unwrap();
        let all = table.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "x");
        assert_eq!(table.get_raw().await.unwrap().len(), 1);
    }
}
