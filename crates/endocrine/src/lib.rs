//! # Endocrine - Trust-Aware Telemetry over a Shared Broker
//!
//! Glands publish signed stream definitions and samples ("hormones");
//! receptors discover streams by topic filter, accept only definitions whose
//! certificate chains to the configured CA, and track each stream's
//! freshness and error state.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use endocrine::{EndocrineSystem, GlandSpec, SystemConfig};
//! use es_bus::InMemoryBroker;
//! use std::sync::Arc;
//!
//! let config = SystemConfig::from_file("endocrine.toml")?;
//! let (system, _events) = EndocrineSystem::start(config, Arc::new(InMemoryBroker::new()))?;
//! system.ready().await?;
//!
//! let (gland, _) = system.new_gland("roof/temp", GlandSpec::new().with_freshness(60)).await?;
//! let (receptor, mut events) = system.new_receptor("roof/", None).await?;
//! ```
//!
//! ## Ownership
//!
//! One [`EndocrineSystem`] owns the broker connection. Glands and receptors
//! keep it alive and are shut down with it; nothing is process-global.

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
#![warn(missing_docs)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod config;
pub mod error;
pub mod events;
pub mod gland;
pub mod receptor;
pub mod system;

// Re-export main types
pub use config::SystemConfig;
pub use error::{ConfigError, EsError, GlandError, ReceptionError};
pub use events::{DefinitionEnv, GlandEvent, HormoneEnv, ReceptorEvent};
pub use gland::{Gland, GlandSpec, DEFAULT_FRESHNESS};
pub use receptor::{CertCheck, HormoneView, Receptor};
pub use system::{EndocrineSystem, SystemBuilder};

pub use es_bus::{ConnectionState, DiscoveryMethod, SystemEvent};
pub use es_protocol::{Field, FieldType, FieldValue, Sample};
pub use es_telemetry::{init_logging, TelemetryConfig};
