//! Shared preferences: a small persistent key/value store.
//!
//! Values are arbitrary JSON. The file-backed store rewrites the whole file
//! on every `set`/`remove` (write to a temp file, then rename), which is fine
//! for the handful of keys the engine keeps here: identity, auth token,
//! cloud id, server configs, and one sync checkpoint per table and remote.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

pub trait SharedPreferences: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    /// Store `value` under `key`. Persistence failures are logged, not returned.
    fn set(&self, key: &str, value: Value);

    fn remove(&self, key: &str);

    fn keys(&self) -> Vec<String>;
}

impl dyn SharedPreferences + '_ {
    /// Typed read; a value of the wrong shape reads as absent.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key)?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(key, "Ignoring malformed preference: {e}");
                None
            }
        }
    }
}

/// JSON-file backed preferences, or purely in-memory when no path is given.
pub struct Preferences {
    path: Option<PathBuf>,
    values: RwLock<Map<String, Value>>,
}

impl Preferences {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            values: RwLock::new(Map::new()),
        }
    }

    /// Open (or lazily create) the preferences file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read preferences {}", path.display()))?;
            if raw.trim().is_empty() {
                Map::new()
            } else {
                serde_json::from_str(&raw)
                    .with_context(|| format!("Failed to parse preferences {}", path.display()))?
            }
        } else {
            Map::new()
        };
        Ok(Self {
            path: Some(path),
            values: RwLock::new(values),
        })
    }

    fn persist(&self, values: &Map<String, Value>) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = write_atomic(path, values) {
            tracing::warn!(path = %path.display(), "Failed to save preferences: {e:#}");
        }
    }
}

fn write_atomic(path: &Path, values: &Map<String, Value>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_string_pretty(values)?;
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

impl SharedPreferences for Preferences {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        let mut values = self.values.write();
        values.insert(key.to_string(), value);
        self.persist(&values);
    }

    fn remove(&self, key: &str) {
        let mut values = self.values.write();
        if values.remove(key).is_some() {
            self.persist(&values);
        }
    }

    fn keys(&self) -> Vec<String> {
        self.values.read().keys().cloned().collect()
    }
}
