//! # Error Types
//!
//! Only discovery and the scheduled reconnect retry on their own; every
//! other failure surfaces once, to the caller of the failing operation.

use es_crypto::TrustError;
use thiserror::Error;

/// Failures of a single transport operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The broker refused or could not be reached.
    #[error("Connection to {0} refused")]
    ConnectionRefused(String),

    /// The transport is currently offline.
    #[error("Not connected")]
    NotConnected,

    /// The transport has been ended.
    #[error("Transport closed")]
    Closed,

    /// Broker rejected a subscribe or unsubscribe.
    #[error("Subscription to {topic} failed: {reason}")]
    SubscribeFailed {
        /// Topic filter
        topic: String,
        /// Broker supplied reason
        reason: String,
    },

    /// Broker rejected a publish.
    #[error("Publish to {topic} failed: {reason}")]
    PublishFailed {
        /// Topic
        topic: String,
        /// Broker supplied reason
        reason: String,
    },

    /// Anything else the transport reports.
    #[error("Transport error: {0}")]
    Other(String),
}

/// Fatal problems found while bootstrapping. Never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    /// Key, certificate or CA failed the identity check.
    #[error(transparent)]
    Trust(#[from] TrustError),

    /// Local clock deviates too much from the time source.
    #[error("The time drift is too large: {drift_ms} ms")]
    ExcessiveDrift {
        /// Measured drift in milliseconds
        drift_ms: i64,
    },

    /// Drift could not be measured.
    #[error("Time drift check failed: {0}")]
    Time(#[from] TimeError),

    /// No way to find a broker.
    #[error("No broker discovery method configured")]
    EmptyDiscovery,
}

/// Errors of the manager's public surface.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    /// Handle was never issued or has already been removed.
    #[error("Unknown subscription")]
    UnknownSubscription,

    /// Topic filter is malformed.
    #[error("Invalid topic filter {0:?}")]
    InvalidTopic(String),

    /// The manager has been shut down.
    #[error("Endocrine system has been shut down")]
    ShutDown,

    /// Bootstrap failed; the manager will never become ready.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// The transport rejected the operation.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A discovery method could not produce an address.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    /// Nothing found for the fingerprint.
    #[error("No broker found")]
    NotFound,

    /// Resolver failed.
    #[error("Discovery failed: {0}")]
    Failed(String),
}

/// Time source failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TimeError {
    /// Socket failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// No answer in time.
    #[error("Time server did not answer")]
    Timeout,

    /// Answer could not be interpreted.
    #[error("Invalid time server response: {0}")]
    InvalidResponse(String),
}

impl From<std::io::Error> for TimeError {
    fn from(e: std::io::Error) -> Self {
        TimeError::Io(e.to_string())
    }
}
