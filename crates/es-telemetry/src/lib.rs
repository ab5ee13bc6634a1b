//! # ES Telemetry
//!
//! Logging setup shared by every Endocrine binary and test harness.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use es_telemetry::{init_logging, TelemetryConfig};
//!
//! let config = TelemetryConfig::from_env();
//! init_logging(&config)?;
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `ES_SERVICE_NAME` | `endocrine` | Service name in the startup line |
//! | `ES_LOG_LEVEL` / `RUST_LOG` | `info` | `EnvFilter` directives |
//! | `ES_JSON_LOGS` | `false` | JSON lines output |
//! | `NO_COLOR` | unset | Disable ANSI colours |

#![warn(missing_docs)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod config;
mod logging;

pub use config::TelemetryConfig;
pub use logging::init_logging;

use thiserror::Error;

/// Logging initialization errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TelemetryError {
    /// Filter directives could not be parsed.
    #[error("Invalid log filter: {0}")]
    Filter(String),

    /// A global subscriber is already installed.
    #[error("Logging already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Install logging from the environment, ignoring an already installed
/// subscriber. Convenient for tests and examples.
pub fn try_init_from_env() {
    if let Err(TelemetryError::Filter(e)) = init_logging(&TelemetryConfig::from_env()) {
        eprintln!("ignoring invalid log filter: {e}");
    }
}
