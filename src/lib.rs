//! # SlyNet
//!
//! LAN peer discovery and encrypted transport for peer-to-peer applications.
//!
//! A SlyNet peer announces its TCP listener with a UDP broadcast, dials every
//! trusted peer it hears from, secures each link with a short RSA-wrapped seed
//! exchange and keeps the resulting connections in a shared registry. A
//! progress aggregator samples the transfer state of every connection and
//! reports per-peer speeds.
//!
//! ## Core Modules
//!
//! - [`cli`] - Command-line interface and user interaction
//! - [`config`] - Configuration management and storage
//! - [`keys`] - Device keypair persistence
//! - [`handshake`] - Key exchange that turns a socket into an encrypted stream
//! - [`cipher`] - Keystream transform applied after the handshake
//! - [`listener`] - Inbound accept loop and outbound dialing
//! - [`discovery`] - UDP broadcast announcements and drop rules
//! - [`registry`] - Live connection set
//! - [`progress`] - Per-connection speed tracking
//!
//! ## Quick Start
//!
//! ```bash
//! # Create the config and device key
//! slynet init
//!
//! # Trust another device (id printed by `slynet id` over there)
//! slynet trust 3f2c9a0e-5d1b-4c7e-9a62-8b0f1e2d3c4b
//!
//! # Run the peer
//! slynet daemon
//! ```

pub mod cipher;
pub mod cli;
pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod handshake;
pub mod keys;
pub mod listener;
pub mod progress;
pub mod registry;
pub mod save;
pub mod wire;

pub use config::{Config, ConfigFolder};
pub use device::DeviceId;
pub use error::{NetError, Result};
