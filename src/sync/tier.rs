//! Tier names and tier addresses.
//!
//! An address is `"<tier>[:<identity>]"`. The cloud tier has no identity,
//! so its address is simply `cloud`; every other tier carries the random
//! hex identity it generated on first run.

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Preference key holding this installation's random identity.
pub const IDENTITY_PREF: &str = "cloud-sync-device-id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Global,
    Phone,
    Server,
    Cloud,
    Desktop,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Phone => "phone",
            Self::Server => "server",
            Self::Cloud => "cloud",
            Self::Desktop => "desktop",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" => Ok(Self::Global),
            "phone" => Ok(Self::Phone),
            "server" => Ok(Self::Server),
            "cloud" => Ok(Self::Cloud),
            "desktop" => Ok(Self::Desktop),
            other => Err(SyncError::InvalidAddress(other.to_string())),
        }
    }
}

/// A routable tier endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TierAddress {
    tier: Tier,
    identity: String,
}

impl TierAddress {
    pub fn new(tier: Tier, identity: impl Into<String>) -> Self {
        Self {
            tier,
            identity: identity.into(),
        }
    }

    pub fn cloud() -> Self {
        Self::new(Tier::Cloud, "")
    }

    pub fn global() -> Self {
        Self::new(Tier::Global, "")
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// The identity without the `:` separator; empty for cloud.
    pub fn identity(&self) -> &str {
        &self.identity
    }
}

impl fmt::Display for TierAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.identity.is_empty() {
            write!(f, "{}", self.tier)
        } else {
            write!(f, "{}:{}", self.tier, self.identity)
        }
    }
}

impl FromStr for TierAddress {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tier, identity) = s.split_once(':').unwrap_or((s, ""));
        let tier = tier
            .parse::<Tier>()
            .map_err(|_| SyncError::InvalidAddress(s.to_string()))?;
        Ok(Self::new(tier, identity))
    }
}

impl Serialize for TierAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TierAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Generate a fresh 8-byte hex identity.
pub fn generate_identity() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}
