//! # Command Line Interface
//!
//! Argument parsing and command implementations for the `slynet` binary.
//!
//! ## Commands
//!
//! - `init` - Create the configuration and device keypair
//! - `id` - Display this device's id and key fingerprint
//! - `reset-key` - Replace the device keypair
//! - `trust` - Accept discovery announcements from a device without pairing mode
//! - `daemon` - Run the listener, discovery and progress tracking until Ctrl+C

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::config::{Config, ConfigFolder, LoadResult};
use crate::device::DeviceId;
use crate::discovery::{DiscoveryService, DiscoverySettings};
use crate::keys::{KeyConfig, DEFAULT_KEY_BITS};
use crate::listener::{ConnectionListener, ListenerSettings};
use crate::progress::{ProgressAggregator, ProgressUpdate};
use crate::registry::{ConnectionEvent, PeerRegistry};

#[derive(Parser)]
#[command(name = "slynet")]
#[command(about = "LAN peer discovery and encrypted transport")]
#[command(version = "1.0.0")]
pub struct Cli {
    /// Directory holding the configuration and key files
    #[arg(long, global = true, env = "SLYNET_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// RSA modulus size used when a new keypair is generated
    #[arg(long, global = true, env = "SLYNET_KEY_BITS", default_value_t = DEFAULT_KEY_BITS)]
    pub key_bits: usize,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn config_folder(&self) -> Result<ConfigFolder> {
        match &self.config_dir {
            Some(dir) => Ok(ConfigFolder::new(dir)),
            None => Ok(ConfigFolder::platform_default()?),
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the configuration and device keypair
    Init,

    /// Display this device's id and key fingerprint
    Id,

    /// Generate a new device keypair, replacing the stored one
    ResetKey,

    /// Trust a device so its announcements are accepted without pairing mode
    Trust {
        /// Device id as printed by `slynet id` on the other machine
        device_id: String,
    },

    /// Run the peer until interrupted
    Daemon {
        /// Connect to devices that are not trusted yet
        #[arg(long)]
        allow_pairing: bool,
    },
}

/// Loads the config and key, persisting whatever had to be created or
/// repaired.
fn load_state(folder: &ConfigFolder, key_bits: usize) -> Result<(Config, KeyConfig)> {
    let (config, config_result) = Config::load(folder);
    if config_result != LoadResult::Loaded {
        config.save().context("Failed to save configuration")?;
    }

    let mut keys = KeyConfig::new(folder, key_bits);
    let key_result = keys.load().context("Failed to prepare device key")?;
    if key_result != LoadResult::Loaded {
        keys.save().context("Failed to save device key")?;
    }

    Ok((config, keys))
}

pub async fn init(folder: &ConfigFolder, key_bits: usize) -> Result<()> {
    info!("Initializing SlyNet in {}", folder.root().display());

    let (config, keys) = load_state(folder, key_bits)?;
    info!("Configuration at {}", config.config_path().display());
    info!("Device key at {}", keys.path().display());

    println!("✅ SlyNet initialized successfully!");
    println!("Device ID: {}", config.device_id);
    if let Some(fingerprint) = keys.key_info().fingerprint() {
        println!("Key fingerprint: {}", fingerprint);
    }

    Ok(())
}

pub async fn show_id(folder: &ConfigFolder, key_bits: usize) -> Result<()> {
    let (config, keys) = load_state(folder, key_bits)?;

    println!("{}", config.device_id);
    if let Some(fingerprint) = keys.key_info().fingerprint() {
        println!("Key fingerprint: {}", fingerprint);
    }
    Ok(())
}

pub async fn reset_key(folder: &ConfigFolder, key_bits: usize) -> Result<()> {
    let mut keys = KeyConfig::new(folder, key_bits);
    keys.reset().context("Failed to generate device key")?;
    keys.save().context("Failed to save device key")?;

    println!("🔑 Device key replaced");
    if let Some(fingerprint) = keys.key_info().fingerprint() {
        println!("Key fingerprint: {}", fingerprint);
    }
    Ok(())
}

pub async fn trust_device(folder: &ConfigFolder, device_id: &str) -> Result<()> {
    let id: DeviceId = device_id
        .trim()
        .parse()
        .with_context(|| format!("Invalid device id: {device_id}"))?;

    let (mut config, _) = Config::load(folder);
    if id == config.device_id {
        anyhow::bail!("Refusing to trust this device's own id");
    }

    if config.trust_device(id) {
        config.save().context("Failed to save configuration")?;
        println!("✅ Trusted device {}", id);
    } else {
        println!("Device {} is already trusted", id);
    }
    Ok(())
}

pub async fn run_daemon(folder: &ConfigFolder, key_bits: usize, allow_pairing: bool) -> Result<()> {
    info!("Starting SlyNet daemon...");

    let (config, keys) = load_state(folder, key_bits)?;
    let registry = PeerRegistry::new(
        allow_pairing || config.allow_pairing,
        config.known_devices.iter().copied(),
    );

    let listener = ConnectionListener::start(
        ListenerSettings::from(&config),
        config.device_id,
        keys.key_info().clone(),
        registry.clone(),
    )
    .await;
    let endpoint = listener
        .advertised_endpoint()
        .context("Listener could not bind, nothing to announce")?;

    let discovery = DiscoveryService::start(
        DiscoverySettings::from(&config),
        config.device_id,
        endpoint,
        registry.clone(),
        listener.clone(),
    );
    if !discovery.is_active() {
        warn!("Discovery is inactive, only inbound connections will be accepted");
    }

    let mut progress = ProgressAggregator::start(
        registry.clone(),
        config.progress_interval(),
        config.progress_history,
    );

    println!("🚀 SlyNet daemon starting...");
    println!("Device ID: {}", config.device_id);
    println!("Listening on: {}", endpoint);
    if registry.allow_pairing() {
        println!("🤝 Pairing mode is on, any device on the LAN may connect");
    }
    println!("💚 SlyNet daemon is running. Press Ctrl+C to stop.");

    run_until_interrupted(&config, &registry, &discovery, &progress).await?;

    println!("\n🛑 SlyNet daemon stopping...");
    discovery.dispose();
    progress.stop().await;
    listener.shutdown().await;
    for connection in registry.connections() {
        connection.close().await;
    }

    Ok(())
}

async fn run_until_interrupted(
    config: &Config,
    registry: &Arc<PeerRegistry>,
    discovery: &DiscoveryService,
    progress: &ProgressAggregator,
) -> Result<()> {
    let mut announce = tokio::time::interval(config.discovery_interval());
    let mut events = registry.subscribe();
    let mut updates = progress.subscribe();

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = announce.tick() => {
                discovery.send_discovery_message().await;
            }
            event = events.recv() => {
                match event {
                    Ok(ConnectionEvent::Added(id)) => {
                        match registry.try_get_connection(&id).and_then(|c| c.remote_addr()) {
                            Some(addr) => println!("🔗 Connected to {} ({})", id, addr),
                            None => println!("🔗 Connected to {}", id),
                        }
                    }
                    Ok(ConnectionEvent::Removed(id)) => println!("✂️  Disconnected from {}", id),
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
            update = updates.recv() => {
                if let Ok(update) = update {
                    report_progress(&update);
                }
            }
            result = &mut shutdown => {
                result.context("Failed to listen for Ctrl+C")?;
                break;
            }
        }
    }

    Ok(())
}

fn report_progress(update: &ProgressUpdate) {
    for status in &update.statuses {
        if status.indeterminate {
            info!("{}: {}", status.connection_id.short(), format_speed(status.speed));
        } else {
            info!(
                "{}: {}/{} bytes, {}",
                status.connection_id.short(),
                status.current,
                status.maximum,
                format_speed(status.speed)
            );
        }
    }
}

// Helper function to format a transfer rate
fn format_speed(bytes_per_sec: f64) -> String {
    const UNITS: [&str; 4] = ["B/s", "KB/s", "MB/s", "GB/s"];

    let mut value = bytes_per_sec.max(0.0);
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{:.0} {}", value, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
