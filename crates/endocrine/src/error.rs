//! # Error Types
//!
//! Construction problems are returned to the caller. Problems with a single
//! inbound message never tear anything down: they are reported as events
//! and the message is dropped.

use es_bus::{BusError, ConfigurationError};
use es_crypto::{CryptoError, TrustError};
use es_protocol::ProtocolError;
use thiserror::Error;

/// Configuration could not be loaded.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// File could not be read.
    #[error("Failed to read {path}: {error}")]
    Io {
        /// Path of the file that failed to load
        path: String,
        /// Error message from the I/O operation
        error: String,
    },

    /// TOML is malformed or has unknown keys.
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// PEM material given neither inline nor by path.
    #[error("Missing {0}: set `{0}` or `{0}_path`")]
    MissingPem(&'static str),

    /// PEM material given both inline and by path.
    #[error("Both `{0}` and `{0}_path` are set")]
    AmbiguousPem(&'static str),
}

/// Failures of the system facade.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EsError {
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Own private key is unreadable.
    #[error("Unreadable private key: {0}")]
    Identity(CryptoError),

    /// Bootstrap validation failed.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// Connection manager failure.
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Failures of a gland operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GlandError {
    /// Invalid name, definition or sample.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Own certificate could not be inspected.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Publishing failed.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// `send` without a sample on a gland with fields.
    #[error("Cannot send without data: the definition has fields")]
    MissingSample,

    /// The gland has been shut down.
    #[error("Gland has been shut down")]
    ShutDown,
}

/// A definition or hormone was rejected, or a receptor operation failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReceptionError {
    /// Malformed, unsigned or mismatching payload.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Certificate not trusted, outside its validity window or rejected by
    /// the caller's check.
    #[error(transparent)]
    Trust(#[from] TrustError),

    /// Hormone for a stream without an accepted definition.
    #[error("Received unknown hormone {0:?}")]
    UnknownHormone(String),

    /// Subscribing or unsubscribing failed.
    #[error(transparent)]
    Bus(#[from] BusError),
}
