//! `tiersync`: run a sync tier, or manage its pairing state.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tiersync::config::Config;
use tiersync::db::{SqliteTable, SyncDatabase};
use tiersync::devices::thingengine::{BuiltinDeviceFactory, ThingEngineState};
use tiersync::devices::DeviceDatabase;
use tiersync::gateway::{run_gateway, GatewayState};
use tiersync::platform::prefs::{Preferences, SharedPreferences};
use tiersync::platform::{LocalPlatform, Platform, PlatformKind};
use tiersync::sync::manager::{ClientConfig, SyncManager};
use tiersync::sync::pairing::PairedEngineManager;
use tiersync::sync::tier::Tier;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Table holding the device records every tier shares.
const DEVICE_TABLE: &str = "device";

#[derive(Parser, Debug)]
#[command(name = "tiersync", version, about = "Multi-tier sync engine")]
struct Cli {
    /// Config file (default: ~/.tiersync/config.toml)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Override the configured platform
    #[arg(long, global = true, value_enum)]
    platform: Option<PlatformKind>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run this tier until interrupted
    Run,
    /// Print this tier's address
    Identity,
    /// Pair with a home server
    AddServer {
        /// Server identity (the part after `server:`)
        identity: String,
        /// Sync endpoint, e.g. http://192.168.1.10:3000/api/sync
        url: String,
    },
    /// Forget a paired home server
    RemoveServer { identity: String },
    /// Set the cloud account id
    SetCloud { cloud_id: String },
    /// Print the auth token, generating one if needed
    AuthToken {
        /// Store this token instead
        #[arg(long)]
        set: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => Config::default_path()?,
    };
    let mut config = Config::load(&config_path)?;
    if let Some(platform) = cli.platform {
        config.platform = platform;
    }
    init_tracing(&config.log_filter);

    let prefs: Arc<dyn SharedPreferences> = Arc::new(Preferences::open(config.preferences_path()?)?);

    match cli.command {
        Command::Run => run(config, prefs).await,
        Command::Identity => {
            let platform: Arc<dyn Platform> = Arc::new(LocalPlatform::new(config.platform, prefs));
            let manager = SyncManager::new(platform, &config.cloud_url)?;
            println!("{}", manager.own_address());
            Ok(())
        }
        Command::AddServer { identity, url } => {
            let platform: Arc<dyn Platform> = Arc::new(LocalPlatform::new(config.platform, prefs));
            let manager = SyncManager::new(platform, &config.cloud_url)?;
            manager.add_server_config(&identity, ClientConfig { url });
            println!("Paired with server:{identity}");
            Ok(())
        }
        Command::RemoveServer { identity } => {
            let platform: Arc<dyn Platform> = Arc::new(LocalPlatform::new(config.platform, prefs));
            let manager = SyncManager::new(platform, &config.cloud_url)?;
            manager.remove_server_config(&identity);
            println!("Removed server:{identity}");
            Ok(())
        }
        Command::SetCloud { cloud_id } => {
            LocalPlatform::new(config.platform, prefs).set_cloud_id(&cloud_id);
            println!("Cloud id set");
            Ok(())
        }
        Command::AuthToken { set } => {
            let platform = LocalPlatform::new(config.platform, prefs);
            match set {
                Some(token) => platform.set_auth_token(&token),
                None => println!("{}", platform.ensure_auth_token()),
            }
            Ok(())
        }
    }
}

async fn run(config: Config, prefs: Arc<dyn SharedPreferences>) -> Result<()> {
    tracing::info!(platform = %config.platform, "tiersync v{} starting", env!("CARGO_PKG_VERSION"));

    let (acceptor_tx, acceptor_rx) = mpsc::unbounded_channel();
    let mut platform = LocalPlatform::new(config.platform, Arc::clone(&prefs));
    if config.accepts_inbound() {
        platform = platform.with_acceptor(acceptor_rx);
        platform.ensure_auth_token();
    }
    let platform = Arc::new(platform);

    let manager = SyncManager::new(platform.clone(), &config.cloud_url)?;
    let own_address = manager.own_address();

    let table = Arc::new(
        SqliteTable::open(&config.database_path()?, DEVICE_TABLE).context("Failed to open device table")?,
    );
    let syncdb = SyncDatabase::new(Arc::clone(&prefs), table, Arc::new(manager.clone()))?;
    let devices = DeviceDatabase::new(syncdb, Arc::new(BuiltinDeviceFactory::new()), own_address.clone());

    let mut own = ThingEngineState::new(&own_address);
    match own_address.tier() {
        Tier::Server => {
            own.host = config.gateway.advertised_host();
            if own.host.is_none() {
                tracing::warn!(
                    bind = %config.gateway.host,
                    "Gateway binds a wildcard or loopback address; set gateway.advertised_host so phones can reach this server"
                );
            }
            own.port = Some(config.gateway.port);
        }
        Tier::Cloud => own.cloud_id = platform.cloud_id(),
        _ => {}
    }
    let pairing = PairedEngineManager::new(devices.clone(), manager.clone(), Arc::clone(&prefs), own);

    let gateway = if config.accepts_inbound() {
        let mut state = GatewayState::new(acceptor_tx, own_address.clone());
        if let Some(cloud_id) = platform.cloud_id() {
            state = state.with_cloud_id(cloud_id);
        }
        let host = config.gateway.host.clone();
        let port = config.gateway.port;
        Some(tokio::spawn(async move {
            if let Err(e) = run_gateway(&host, port, state).await {
                tracing::error!("Gateway stopped: {e:#}");
            }
        }))
    } else {
        None
    };

    manager.start().await?;
    pairing.start().await?;
    devices.start().await?;
    tracing::info!(address = %own_address, "Tier ready. Press Ctrl+C to stop.");

    shutdown_signal().await;
    tracing::info!("Shutdown signal received");

    pairing.stop();
    devices.stop().await;
    manager.stop().await;
    if let Some(gateway) = gateway {
        gateway.abort();
    }
    tracing::info!("Stopped");
    Ok(())
}

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            _ => tracing::warn!("Failed to install signal handlers, falling back to Ctrl+C"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {e}");
    }
}
