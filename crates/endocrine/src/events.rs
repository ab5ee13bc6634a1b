//! # Gland and Receptor Events
//!
//! Every event carries an environment describing the stream it concerns.
//! Events travel over `tokio::sync::broadcast`; constructors hand out the
//! first receiver so nothing emitted during construction is lost.

use crate::{GlandError, ReceptionError};
use es_crypto::CertInfo;
use es_protocol::{Definition, Field, Hormone, Sample};
use serde::Serialize;

/// Capacity of gland and receptor event channels.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Environment of definition-related events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionEnv {
    /// Stream name
    pub name: String,
    /// Stream description
    pub description: Option<String>,
    /// Seconds a hormone stays fresh
    pub freshness: Option<u64>,
    /// Check expression source
    pub check: Option<String>,
    /// Ordered fields
    pub data_format: Vec<Field>,
    /// Producer certificate
    pub origin: CertInfo,
}

impl DefinitionEnv {
    pub(crate) fn new(name: &str, definition: &Definition, origin: &CertInfo) -> Self {
        Self {
            name: name.to_string(),
            description: definition.description().map(str::to_string),
            freshness: definition.freshness(),
            check: definition.check().map(str::to_string),
            data_format: definition.data_format().to_vec(),
            origin: origin.clone(),
        }
    }
}

/// Environment of hormone-related events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HormoneEnv {
    /// Stream name
    pub name: String,
    /// Producer timestamp
    pub sent_at: u64,
    /// Values by field name
    pub values: Sample,
    /// Within the freshness window
    pub is_fresh: bool,
    /// Seconds left in the freshness window, negative once expired
    pub freshness: Option<i64>,
    /// Check result, 0 when fine
    pub error: i64,
    /// Producer certificate
    pub origin: CertInfo,
}

impl HormoneEnv {
    pub(crate) fn new(name: &str, hormone: &Hormone, is_fresh: bool, now: u64, origin: &CertInfo) -> Self {
        Self {
            name: name.to_string(),
            sent_at: hormone.timestamp(),
            values: hormone.sample(),
            is_fresh,
            freshness: hormone.freshness(now),
            error: hormone.error(),
            origin: origin.clone(),
        }
    }
}

/// Something that happened to a gland.
#[derive(Debug, Clone, PartialEq)]
pub enum GlandEvent {
    /// Definition published.
    NewGland(DefinitionEnv),
    /// Hormone published.
    Sent(HormoneEnv),
    /// Gland shut down and retained state cleared.
    RemovedGland(DefinitionEnv),
    /// A timer-driven publish failed.
    Error {
        /// Affected gland
        env: DefinitionEnv,
        /// What went wrong
        error: GlandError,
    },
}

/// Something that happened to a receptor.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceptorEvent {
    /// Definition subscription established.
    NewReceptor {
        /// Topic filter below `definition/`
        filter: String,
    },
    /// Receptor shut down.
    RemovedReceptor {
        /// Topic filter below `definition/`
        filter: String,
    },
    /// New stream accepted.
    Defined(DefinitionEnv),
    /// Known stream re-announced unchanged.
    Refreshed(DefinitionEnv),
    /// Stream withdrawn or replaced.
    Undefined(DefinitionEnv),
    /// Hormone received; emitted after any transition event.
    Hormone(HormoneEnv),
    /// Stream went from expired to fresh.
    HormoneRefresh(HormoneEnv),
    /// Stream expired.
    HormoneExpiration(HormoneEnv),
    /// Check error cleared.
    HormoneRecovery(HormoneEnv),
    /// Check error raised or changed.
    HormoneError(HormoneEnv),
    /// An inbound message was dropped.
    ReceptionError {
        /// Topic it arrived on
        topic: String,
        /// Stream name, when it could be derived
        name: Option<String>,
        /// Why it was dropped
        error: ReceptionError,
    },
    /// A receptor operation failed.
    Error {
        /// Topic filter below `definition/`
        filter: String,
        /// What went wrong
        error: ReceptionError,
    },
}
