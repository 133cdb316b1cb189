//! Wire message types for tier connections.
//!
//! Every websocket frame is a JSON object with a `control` tag:
//!
//! - `auth`: first frame from a client: `{identity, token}`
//! - `auth-token-ok` / `auth-token-error`: server acknowledgements
//! - `data`: an [`Envelope`]: `target` plus the handler's own fields
//! - `close`: server asks the client to go away
//!
//! Data envelopes addressed to a `syncdb-<table>` target carry a
//! [`SyncMessage`], tagged by `op`.

use serde::de::{self, DeserializeOwned};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// A stored row: a JSON object of column values.
pub type Row = Map<String, Value>;

/// Controls a client accepts from a server.
pub const SERVER_CONTROLS: &[&str] = &["auth-token-ok", "auth-token-error", "data", "close"];

// ── Frames ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "control", rename_all = "kebab-case")]
pub enum Frame {
    Auth {
        identity: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    AuthTokenOk,
    AuthTokenError,
    Data(Envelope),
    Close,
}

impl Frame {
    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Read the `control` tag of a raw frame, if it has a string one.
pub fn control_of(value: &Value) -> Option<&str> {
    value.get("control").and_then(Value::as_str)
}

/// An application message routed to the handler registered for `target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub target: String,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

#[derive(Serialize)]
struct DataFrameRef<'a> {
    control: &'static str,
    #[serde(flatten)]
    envelope: &'a Envelope,
}

impl Envelope {
    /// Build an envelope from a message that serializes to a JSON object.
    pub fn new<T: Serialize>(target: impl Into<String>, message: &T) -> serde_json::Result<Self> {
        let body = match serde_json::to_value(message)? {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".into(), other);
                map
            }
        };
        Ok(Self {
            target: target.into(),
            body,
        })
    }

    /// Decode the body into a typed message.
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(Value::Object(self.body.clone()))
    }

    /// Encode as a `control: data` frame without cloning the body.
    pub fn to_data_frame(&self) -> serde_json::Result<String> {
        serde_json::to_string(&DataFrameRef {
            control: "data",
            envelope: self,
        })
    }
}

// ── Table sync ──────────────────────────────────────────────────

/// One journaled change: a row, or a tombstone when `row` is `None`.
///
/// On the wire the row's columns sit beside `uniqueId` and `lastModified`
/// in a single flat object. A record with no columns, or whose columns are
/// all null, is a tombstone.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRecord {
    pub unique_id: String,
    pub last_modified: i64,
    pub row: Option<Row>,
}

const UNIQUE_ID: &str = "uniqueId";
const LAST_MODIFIED: &str = "lastModified";

impl SyncRecord {
    pub fn is_tombstone(&self) -> bool {
        self.row.is_none()
    }

    /// Split a flat wire object into its key fields and row columns.
    fn from_fields(mut fields: Row) -> Result<Self, String> {
        let unique_id = match fields.remove(UNIQUE_ID) {
            Some(Value::String(id)) => id,
            Some(other) => return Err(format!("uniqueId must be a string, got {other}")),
            None => return Err("missing field `uniqueId`".into()),
        };
        let last_modified = match fields.remove(LAST_MODIFIED) {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .ok_or_else(|| format!("lastModified out of range: {n}"))?,
            Some(other) => return Err(format!("lastModified must be a number, got {other}")),
            None => return Err("missing field `lastModified`".into()),
        };
        let row = if fields.values().all(Value::is_null) {
            None
        } else {
            Some(fields)
        };
        Ok(Self {
            unique_id,
            last_modified,
            row,
        })
    }
}

impl Serialize for SyncRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry(UNIQUE_ID, &self.unique_id)?;
        map.serialize_entry(LAST_MODIFIED, &self.last_modified)?;
        for (column, value) in self.row.iter().flatten() {
            if column != UNIQUE_ID && column != LAST_MODIFIED {
                map.serialize_entry(column, value)?;
            }
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for SyncRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let fields = Row::deserialize(deserializer)?;
        Self::from_fields(fields).map_err(de::Error::custom)
    }
}

/// Operations of the table sync protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SyncMessage {
    /// Single-record propagation after a local write.
    Change {
        unique_id: String,
        last_modified: i64,
        #[serde(default)]
        row: Option<Row>,
    },
    /// Pull everything after `last_sync_time`, pushing our own changes.
    SyncRequest {
        last_sync_time: i64,
        values: Vec<SyncRecord>,
    },
    SyncReply {
        last_modified: i64,
        values: Vec<SyncRecord>,
    },
    /// Ask for a full raw dump.
    ForceSync,
    ForceSyncData {
        values: Vec<SyncRecord>,
    },
    /// Ask the receiver to send us `force-sync`.
    DoForceSync,
}

impl SyncMessage {
    pub fn op(&self) -> &'static str {
        match self {
            Self::Change { .. } => "change",
            Self::SyncRequest { .. } => "sync-request",
            Self::SyncReply { .. } => "sync-reply",
            Self::ForceSync => "force-sync",
            Self::ForceSyncData { .. } => "force-sync-data",
            Self::DoForceSync => "do-force-sync",
        }
    }
}
