//! The builtin "thingengine" device: one record per paired engine tier,
//! synced through the device table so every tier learns how to reach the
//! others.

use super::{Device, DeviceFactory};
use crate::sync::tier::{Tier, TierAddress};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

pub const THINGENGINE_KIND: &str = "org.thingpedia.builtin.thingengine";

/// Class version of every builtin kind.
const BUILTIN_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThingEngineState {
    pub kind: String,
    pub tier: Tier,
    #[serde(default)]
    pub identity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_id: Option<String>,
}

impl ThingEngineState {
    pub fn new(address: &TierAddress) -> Self {
        Self {
            kind: THINGENGINE_KIND.to_string(),
            tier: address.tier(),
            identity: address.identity().to_string(),
            host: None,
            port: None,
            cloud_id: None,
        }
    }

    pub fn address(&self) -> TierAddress {
        TierAddress::new(self.tier, self.identity.clone())
    }

    /// Where a server engine accepts sync connections.
    pub fn sync_url(&self) -> Option<String> {
        let host = self.host.as_deref()?;
        let port = self.port?;
        if host.contains(':') {
            Some(format!("http://[{host}]:{port}/api/sync"))
        } else {
            Some(format!("http://{host}:{port}/api/sync"))
        }
    }
}

pub struct ThingEngineDevice {
    unique_id: String,
    state: RwLock<ThingEngineState>,
}

impl ThingEngineDevice {
    pub fn new(state: ThingEngineState) -> Self {
        Self {
            unique_id: own_unique_id(&state.address()),
            state: RwLock::new(state),
        }
    }

    pub fn state(&self) -> ThingEngineState {
        self.state.read().clone()
    }
}

/// Unique id of the engine record describing `address`.
pub fn own_unique_id(address: &TierAddress) -> String {
    format!("thingengine-own-{address}")
}

#[async_trait]
impl Device for ThingEngineDevice {
    fn unique_id(&self) -> &str {
        &self.unique_id
    }

    fn kind(&self) -> &str {
        THINGENGINE_KIND
    }

    fn owner_tier(&self) -> TierAddress {
        TierAddress::global()
    }

    fn class_version(&self) -> u32 {
        BUILTIN_VERSION
    }

    fn serialize(&self) -> Value {
        serde_json::to_value(&*self.state.read()).unwrap_or(Value::Null)
    }

    fn update_state(&self, state: Value) {
        match serde_json::from_value::<ThingEngineState>(state) {
            Ok(state) => *self.state.write() = state,
            Err(e) => tracing::warn!(unique_id = %self.unique_id, "Ignoring malformed engine state: {e}"),
        }
    }
}

/// Loads builtin kinds and hands everything else to an optional fallback.
pub struct BuiltinDeviceFactory {
    fallback: Option<Arc<dyn DeviceFactory>>,
}

impl BuiltinDeviceFactory {
    pub fn new() -> Self {
        Self { fallback: None }
    }

    #[must_use]
    pub fn with_fallback(mut self, fallback: Arc<dyn DeviceFactory>) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

impl Default for BuiltinDeviceFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceFactory for BuiltinDeviceFactory {
    async fn load_serialized(&self, unique_id: &str, state: Value) -> Result<Arc<dyn Device>> {
        let kind = state.get("kind").and_then(Value::as_str).unwrap_or_default();
        if kind == THINGENGINE_KIND {
            let state: ThingEngineState =
                serde_json::from_value(state).context("Invalid thingengine device state")?;
            let device = ThingEngineDevice::new(state);
            if device.unique_id() != unique_id {
                bail!("Engine record {unique_id} does not match its address {}", device.unique_id());
            }
            return Ok(Arc::new(device));
        }
        match &self.fallback {
            Some(fallback) => fallback.load_serialized(unique_id, state).await,
            None => bail!("Unknown device kind '{kind}'"),
        }
    }

    async fn device_class_version(&self, kind: &str) -> Result<u32> {
        if kind.starts_with("org.thingpedia.builtin") {
            return Ok(BUILTIN_VERSION);
        }
        match &self.fallback {
            Some(fallback) => fallback.device_class_version(kind).await,
            None => bail!("Unknown device kind '{kind}'"),
        }
    }

    async fn update_device_class(&self, kind: &str) -> Result<()> {
        match &self.fallback {
            Some(fallback) if !kind.starts_with("org.thingpedia.builtin") => {
                fallback.update_device_class(kind).await
            }
            _ => Ok(()),
        }
    }
}
