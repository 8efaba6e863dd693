//! # Error Types
//!
//! Error taxonomy for the transport and discovery layer.
//!
//! Errors fall into four groups, and callers are expected to treat them
//! differently:
//!
//! 1. **Per-connection failures** (`Io`, `Timeout`, `Handshake`, `Crypto`,
//!    `MalformedFrame`): the attempt is dropped and logged, loops keep running.
//! 2. **Protocol incompatibility**: never surfaces as an error, discovery simply
//!    drops the datagram (see [`crate::discovery::Verdict`]).
//! 3. **Startup resource failures** (`Bind`): logged, the owning component
//!    stays inactive.
//! 4. **Persistence failures** (`Persistence`, `Config`): returned to the caller,
//!    which decides whether to fall back to defaults.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, NetError>;

#[derive(Error, Debug)]
pub enum NetError {
    /// I/O error on a socket or stream.
    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// Bounded operation did not finish in time.
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// The peer violated the handshake sequence.
    #[error("Handshake failed: {reason}")]
    Handshake { reason: String },

    /// RSA key construction, encryption or decryption failed.
    #[error("Crypto error: {0}")]
    Crypto(#[from] rsa::Error),

    /// A length prefix or fixed-size field could not be decoded.
    #[error("Malformed frame: {reason}")]
    MalformedFrame { reason: String },

    /// Failed to bind a listening socket.
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Reading or writing a persisted file failed.
    #[error("Failed to persist {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A persisted file could not be encoded or decoded.
    #[error("Invalid configuration data: {reason}")]
    Config { reason: String },
}

impl NetError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    pub fn handshake(reason: impl Into<String>) -> Self {
        Self::Handshake {
            reason: reason.into(),
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedFrame {
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Returns `true` for failures scoped to a single connection attempt.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::Timeout { .. }
                | Self::Handshake { .. }
                | Self::Crypto(_)
                | Self::MalformedFrame { .. }
        )
    }
}

impl From<io::Error> for NetError {
    fn from(err: io::Error) -> Self {
        Self::io("performing stream I/O", err)
    }
}
