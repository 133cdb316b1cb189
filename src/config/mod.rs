//! TOML configuration, by default at `~/.tiersync/config.toml`.

use crate::platform::PlatformKind;
use anyhow::{bail, Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

const PREFERENCES_FILE: &str = "prefs.json";
const DATABASE_FILE: &str = "sync.db";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address the gateway binds to.
    pub host: String,
    pub port: u16,
    /// Host other tiers dial us on, when it differs from `host`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertised_host: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3000,
            advertised_host: None,
        }
    }
}

impl GatewayConfig {
    /// Host to publish in our engine record. A wildcard or loopback bind
    /// address is unreachable from other machines, so it is not published.
    pub fn advertised_host(&self) -> Option<String> {
        if let Some(host) = &self.advertised_host {
            return Some(host.clone());
        }
        let host = self.host.trim();
        let unreachable = host.eq_ignore_ascii_case("localhost")
            || host
                .trim_start_matches('[')
                .trim_end_matches(']')
                .parse::<IpAddr>()
                .is_ok_and(|ip| ip.is_unspecified() || ip.is_loopback());
        (!unreachable).then(|| host.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub platform: PlatformKind,
    /// Preferences and the sync database live here. `~` and `$VAR` expand.
    pub data_dir: String,
    pub cloud_url: String,
    pub gateway: GatewayConfig,
    /// Tracing filter directive used when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            platform: PlatformKind::Desktop,
            data_dir: "~/.tiersync/data".into(),
            cloud_url: "https://thingengine.stanford.edu".into(),
            gateway: GatewayConfig::default(),
            log_filter: "tiersync=info".into(),
        }
    }
}

impl Config {
    pub fn default_path() -> Result<PathBuf> {
        let home = UserDirs::new()
            .map(|u| u.home_dir().to_path_buf())
            .context("Could not find home directory")?;
        Ok(home.join(".tiersync").join("config.toml"))
    }

    /// Read `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config {}", path.display()))?
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_dir.trim().is_empty() {
            bail!("data_dir must not be empty");
        }
        if !self.cloud_url.starts_with("http://") && !self.cloud_url.starts_with("https://") {
            bail!("cloud_url must be an http(s) URL, got '{}'", self.cloud_url);
        }
        if self.gateway.host.trim().is_empty() {
            bail!("gateway.host must not be empty");
        }
        if self
            .gateway
            .advertised_host
            .as_ref()
            .is_some_and(|h| h.trim().is_empty())
        {
            bail!("gateway.advertised_host must not be empty when set");
        }
        if self.gateway.port == 0 {
            bail!("gateway.port must not be 0");
        }
        Ok(())
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        let expanded = shellexpand::full(&self.data_dir)
            .with_context(|| format!("Failed to expand data_dir '{}'", self.data_dir))?;
        Ok(PathBuf::from(expanded.as_ref()))
    }

    pub fn preferences_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join(PREFERENCES_FILE))
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join(DATABASE_FILE))
    }

    /// Whether this tier runs the inbound gateway.
    pub fn accepts_inbound(&self) -> bool {
        matches!(self.platform, PlatformKind::Server | PlatformKind::Cloud)
    }
}
