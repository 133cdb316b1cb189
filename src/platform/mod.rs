//! Platform contract consumed by the sync subsystem.
//!
//! A platform knows what kind of installation it is, owns the shared
//! preferences, and, on tiers that accept inbound connections, hands out
//! the stream of freshly upgraded websockets.

pub mod prefs;

use crate::sync::tier::Tier;
use crate::transport::socket::RawSocket;
use parking_lot::Mutex;
use prefs::SharedPreferences;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Preference key of the shared secret tiers authenticate with.
pub const AUTH_TOKEN_PREF: &str = "auth-token";
/// Preference key of the cloud account id.
pub const CLOUD_ID_PREF: &str = "cloud-id";

/// Stream of inbound websockets, already upgraded.
pub type WebSocketAcceptor = mpsc::UnboundedReceiver<RawSocket>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    Android,
    Ios,
    Server,
    Cloud,
    Desktop,
}

impl PlatformKind {
    pub fn tier(self) -> Tier {
        match self {
            Self::Android | Self::Ios => Tier::Phone,
            Self::Server => Tier::Server,
            Self::Cloud => Tier::Cloud,
            Self::Desktop => Tier::Desktop,
        }
    }
}

impl fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Android => "android",
            Self::Ios => "ios",
            Self::Server => "server",
            Self::Cloud => "cloud",
            Self::Desktop => "desktop",
        };
        f.write_str(name)
    }
}

pub trait Platform: Send + Sync {
    fn kind(&self) -> PlatformKind;

    fn shared_preferences(&self) -> Arc<dyn SharedPreferences>;

    /// Token inbound tiers must present. `None` rejects everyone.
    fn auth_token(&self) -> Option<String>;

    fn cloud_id(&self) -> Option<String>;

    /// Take the inbound websocket stream. Only the first call gets it.
    fn websocket_acceptor(&self) -> Option<WebSocketAcceptor>;
}

/// Platform backed by shared preferences and an optional acceptor channel.
pub struct LocalPlatform {
    kind: PlatformKind,
    prefs: Arc<dyn SharedPreferences>,
    acceptor: Mutex<Option<WebSocketAcceptor>>,
}

impl LocalPlatform {
    pub fn new(kind: PlatformKind, prefs: Arc<dyn SharedPreferences>) -> Self {
        Self {
            kind,
            prefs,
            acceptor: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_acceptor(self, acceptor: WebSocketAcceptor) -> Self {
        *self.acceptor.lock() = Some(acceptor);
        self
    }

    pub fn set_auth_token(&self, token: &str) {
        self.prefs.set(AUTH_TOKEN_PREF, Value::String(token.to_string()));
    }

    /// Return the auth token, generating and storing a random one if unset.
    pub fn ensure_auth_token(&self) -> String {
        if let Some(token) = self.auth_token() {
            return token;
        }
        let token = hex::encode(rand::random::<[u8; 32]>());
        self.set_auth_token(&token);
        token
    }

    pub fn set_cloud_id(&self, cloud_id: &str) {
        self.prefs.set(CLOUD_ID_PREF, Value::String(cloud_id.to_string()));
    }
}

impl Platform for LocalPlatform {
    fn kind(&self) -> PlatformKind {
        self.kind
    }

    fn shared_preferences(&self) -> Arc<dyn SharedPreferences> {
        Arc::clone(&self.prefs)
    }

    fn auth_token(&self) -> Option<String> {
        self.prefs.get_as(AUTH_TOKEN_PREF)
    }

    fn cloud_id(&self) -> Option<String> {
        self.prefs.get_as(CLOUD_ID_PREF)
    }

    fn websocket_acceptor(&self) -> Option<WebSocketAcceptor> {
        self.acceptor.lock().take()
    }
}
