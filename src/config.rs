//! # Configuration Management
//!
//! This module handles SlyNet's configuration, including:
//! - The config folder every persisted file lives in
//! - Device identity and pairing settings
//! - Listener, discovery and progress tuning
//!
//! The config folder is always passed in explicitly. By default it is a
//! platform-appropriate directory (e.g. `~/.config/slynet/` on Linux), but
//! tests and the `--config-dir` flag point it anywhere.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::device::DeviceId;
use crate::error::{NetError, Result};
use crate::save;

pub const DEFAULT_DISCOVERY_PORT: u16 = 13957;
pub const DEFAULT_DISCOVERY_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_PROGRESS_HISTORY: usize = 10;

const CONFIG_FILE: &str = "slynet.toml";

/// Outcome of loading a persisted record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadResult {
    /// The file was read and used as-is.
    Loaded,
    /// The file was read but had to be repaired.
    Upgraded,
    /// The file was missing or unreadable; defaults were created.
    Created,
}

/// Directory holding every persisted file of one peer instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigFolder {
    root: PathBuf,
}

impl ConfigFolder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn platform_default() -> Result<Self> {
        let root = dirs::config_dir()
            .ok_or_else(|| NetError::config("could not determine config directory"))?
            .join("slynet");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn file_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    #[default]
    Ipv4,
    Ipv6,
}

/// Main configuration structure for a SlyNet peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub device_id: DeviceId,
    pub device_name: String,
    /// Accept discovery hits from devices not in `known_devices`.
    #[serde(default)]
    pub allow_pairing: bool,
    #[serde(default)]
    pub known_devices: Vec<DeviceId>,
    #[serde(default)]
    pub address_family: AddressFamily,
    /// Overrides LAN address detection for the listener.
    #[serde(default)]
    pub listener_address: Option<IpAddr>,
    #[serde(default)]
    pub discovery_port: u16,
    #[serde(default)]
    pub discovery_interval_secs: u64,
    #[serde(default)]
    pub progress_interval_ms: u64,
    #[serde(default)]
    pub progress_history: usize,

    #[serde(skip)]
    config_file_path: PathBuf,
}

impl Config {
    pub fn new(folder: &ConfigFolder) -> Self {
        Self {
            device_id: DeviceId::generate(),
            device_name: default_device_name(),
            allow_pairing: false,
            known_devices: Vec::new(),
            address_family: AddressFamily::Ipv4,
            listener_address: None,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            discovery_interval_secs: DEFAULT_DISCOVERY_INTERVAL_SECS,
            progress_interval_ms: DEFAULT_PROGRESS_INTERVAL_MS,
            progress_history: DEFAULT_PROGRESS_HISTORY,
            config_file_path: folder.file_path(CONFIG_FILE),
        }
    }

    /// Loads the config from `folder`, falling back to fresh defaults.
    pub fn load(folder: &ConfigFolder) -> (Self, LoadResult) {
        let path = folder.file_path(CONFIG_FILE);

        let mut config: Config = match save::load_toml(&path) {
            Ok(config) => config,
            Err(e) => {
                info!("Creating default configuration ({})", e);
                return (Self::new(folder), LoadResult::Created);
            }
        };
        config.config_file_path = path;

        let result = if config.repair() {
            warn!("Configuration at {} was incomplete and has been repaired", config.config_file_path.display());
            LoadResult::Upgraded
        } else {
            LoadResult::Loaded
        };

        (config, result)
    }

    /// Fills in values that older or hand-edited files leave empty.
    fn repair(&mut self) -> bool {
        let mut repaired = false;

        if self.device_id.is_nil() {
            self.device_id = DeviceId::generate();
            repaired = true;
        }
        if self.device_name.is_empty() {
            self.device_name = default_device_name();
            repaired = true;
        }
        if self.discovery_port == 0 {
            self.discovery_port = DEFAULT_DISCOVERY_PORT;
            repaired = true;
        }
        if self.discovery_interval_secs == 0 {
            self.discovery_interval_secs = DEFAULT_DISCOVERY_INTERVAL_SECS;
            repaired = true;
        }
        if self.progress_interval_ms == 0 {
            self.progress_interval_ms = DEFAULT_PROGRESS_INTERVAL_MS;
            repaired = true;
        }
        if self.progress_history < 2 {
            self.progress_history = DEFAULT_PROGRESS_HISTORY;
            repaired = true;
        }

        repaired
    }

    pub fn save(&self) -> Result<()> {
        save::save_toml(&self.config_file_path, self)
    }

    pub fn config_path(&self) -> &Path {
        &self.config_file_path
    }

    pub fn trust_device(&mut self, id: DeviceId) -> bool {
        if self.known_devices.contains(&id) {
            return false;
        }
        self.known_devices.push(id);
        true
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

fn default_device_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "slynet-peer".to_string())
}
