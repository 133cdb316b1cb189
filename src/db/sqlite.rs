//! SQLite-backed [`SyncTable`].
//!
//! Tables (for a sync table named `device`):
//! - `device`: uniqueId, data (row as JSON text)
//! - `device_journal`: uniqueId, lastModified (kept for deleted rows too)

use super::{next_stamp, Row, SyncRecord, SyncTable};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

pub struct SqliteTable {
    name: String,
    conn: Mutex<Connection>,
}

impl SqliteTable {
    /// Open (or create) the table `name` in the database at `db_path`.
    pub fn open(db_path: &Path, name: &str) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open {}", db_path.display()))?;

        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        Self::with_connection(conn, name)
    }

    pub fn with_connection(conn: Connection, name: &str) -> Result<Self> {
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            bail!("Invalid sync table name '{name}'");
        }
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {name} (
                uniqueId TEXT PRIMARY KEY,
                data TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {name}_journal (
                uniqueId TEXT PRIMARY KEY,
                lastModified INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{name}_journal_modified
                ON {name}_journal(lastModified);"
        ))?;
        Ok(Self {
            name: name.to_string(),
            conn: Mutex::new(conn),
        })
    }

    fn journal_query(&self, filter: &str) -> String {
        format!(
            "SELECT j.uniqueId, j.lastModified, t.data
             FROM {name}_journal j LEFT JOIN {name} t ON t.uniqueId = j.uniqueId
             {filter}
             ORDER BY j.lastModified, j.uniqueId",
            name = self.name
        )
    }

    fn conditional_write(&self, unique_id: &str, last_modified: i64, row: Option<&Row>) -> Result<bool> {
        let data = row.map(serde_json::to_string).transpose()?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let stored = stored_stamp(&tx, &self.name, unique_id)?;
        if stored.is_some_and(|s| s >= last_modified) {
            return Ok(false);
        }
        write_row(&tx, &self.name, unique_id, data.as_deref(), last_modified)?;
        tx.commit()?;
        Ok(true)
    }

    fn local_write(&self, unique_id: &str, row: Option<&Row>) -> Result<i64> {
        let data = row.map(serde_json::to_string).transpose()?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let stamp = next_stamp(stored_stamp(&tx, &self.name, unique_id)?);
        write_row(&tx, &self.name, unique_id, data.as_deref(), stamp)?;
        tx.commit()?;
        Ok(stamp)
    }
}

fn stored_stamp(conn: &Connection, table: &str, unique_id: &str) -> Result<Option<i64>> {
    Ok(conn
        .query_row(
            &format!("SELECT lastModified FROM {table}_journal WHERE uniqueId = ?1"),
            params![unique_id],
            |r| r.get(0),
        )
        .optional()?)
}

fn write_row(conn: &Connection, table: &str, unique_id: &str, data: Option<&str>, stamp: i64) -> Result<()> {
    match data {
        Some(data) => conn.execute(
            &format!("INSERT OR REPLACE INTO {table} (uniqueId, data) VALUES (?1, ?2)"),
            params![unique_id, data],
        )?,
        None => conn.execute(
            &format!("DELETE FROM {table} WHERE uniqueId = ?1"),
            params![unique_id],
        )?,
    };
    conn.execute(
        &format!("INSERT OR REPLACE INTO {table}_journal (uniqueId, lastModified) VALUES (?1, ?2)"),
        params![unique_id, stamp],
    )?;
    Ok(())
}

fn parse_row(data: &str) -> Result<Row> {
    serde_json::from_str(data).context("Corrupt row data")
}

fn collect_records(conn: &Connection, sql: &str, args: impl rusqlite::Params) -> Result<Vec<SyncRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, i64>(1)?,
            r.get::<_, Option<String>>(2)?,
        ))
    })?;
    let mut records = Vec::new();
    for row in rows {
        let (unique_id, last_modified, data) = row?;
        records.push(SyncRecord {
            unique_id,
            last_modified,
            row: data.as_deref().map(parse_row).transpose()?,
        });
    }
    Ok(records)
}

#[async_trait]
impl SyncTable for SqliteTable {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_all(&self) -> Result<Vec<(String, Row)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT uniqueId, data FROM {} ORDER BY uniqueId",
            self.name
        ))?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            let (unique_id, data) = row?;
            out.push((unique_id, parse_row(&data)?));
        }
        Ok(out)
    }

    async fn get_one(&self, unique_id: &str) -> Result<Option<Row>> {
        let conn = self.conn.lock();
        let data: Option<String> = conn
            .query_row(
                &format!("SELECT data FROM {} WHERE uniqueId = ?1", self.name),
                params![unique_id],
                |r| r.get(0),
            )
            .optional()?;
        data.as_deref().map(parse_row).transpose()
    }

    async fn get_raw(&self) -> Result<Vec<SyncRecord>> {
        let conn = self.conn.lock();
        collect_records(&conn, &self.journal_query(""), [])
    }

    async fn get_changes_after(&self, last_modified: i64) -> Result<Vec<SyncRecord>> {
        let conn = self.conn.lock();
        collect_records(
            &conn,
            &self.journal_query("WHERE j.lastModified > ?1"),
            params![last_modified],
        )
    }

    async fn last_modified(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let max: Option<i64> = conn.query_row(
            &format!("SELECT MAX(lastModified) FROM {}_journal", self.name),
            [],
            |r| r.get(0),
        )?;
        Ok(max.unwrap_or(0))
    }

    async fn insert_one(&self, unique_id: &str, row: Row) -> Result<i64> {
        self.local_write(unique_id, Some(&row))
    }

    async fn delete_one(&self, unique_id: &str) -> Result<i64> {
        self.local_write(unique_id, None)
    }

    async fn insert_if_recent(&self, unique_id: &str, last_modified: i64, row: Row) -> Result<bool> {
        self.conditional_write(unique_id, last_modified, Some(&row))
    }

    async fn delete_if_recent(&self, unique_id: &str, last_modified: i64) -> Result<bool> {
        self.conditional_write(unique_id, last_modified, None)
    }

    async fn replace_all(&self, records: Vec<SyncRecord>) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(&format!("DELETE FROM {}", self.name), [])?;
        tx.execute(&format!("DELETE FROM {}_journal", self.name), [])?;
        for record in &records {
            if let Some(row) = &record.row {
                let data = serde_json::to_string(row)?;
                write_row(&tx, &self.name, &record.unique_id, Some(&data), record.last_modified)?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}
