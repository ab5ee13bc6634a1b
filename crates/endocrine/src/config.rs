//! # System Configuration
//!
//! Built programmatically or loaded from TOML. PEM material is given inline
//! or by path; relative paths in a file resolve against the file's
//! directory.
//!
//! ```toml
//! cert_path = "gland-cert.pem"
//! key_path = "gland-key.pem"
//! ca_path = "ca.pem"
//! broker = "mqtts://broker.local:8883"
//! prefix = "site-a/"
//! definition_resend_interval_secs = 21600   # 0 disables republishing
//! reconnect_delay_secs = 10     # 0 disables the reconnect timer
//! discovery_retry_ms = 1000
//! ```

use crate::ConfigError;
use es_bus::IdentityMaterial;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default period of the unconditional definition republish (6 h).
pub const DEFAULT_DEFINITION_RESEND_INTERVAL: Duration = Duration::from_secs(21_600);

/// Default reconnect timer.
pub const DEFAULT_RECONNECT_DELAY: Duration = es_bus::DEFAULT_RECONNECT_DELAY;

/// Default pause after a fully failed discovery round.
pub const DEFAULT_DISCOVERY_RETRY: Duration = es_bus::DEFAULT_DISCOVERY_RETRY;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    cert: Option<String>,
    cert_path: Option<PathBuf>,
    key: Option<String>,
    key_path: Option<PathBuf>,
    ca: Option<String>,
    ca_path: Option<PathBuf>,
    broker: Option<String>,
    #[serde(default)]
    prefix: String,
    #[serde(default)]
    ignore_timedrift: bool,
    reject_unauthorized: Option<bool>,
    definition_resend_interval_secs: Option<u64>,
    reconnect_delay_secs: Option<u64>,
    discovery_retry_ms: Option<u64>,
}

/// Everything an [`EndocrineSystem`](crate::EndocrineSystem) needs besides
/// its collaborators.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// Own key, certificate and trust root
    pub identity: IdentityMaterial,
    /// Literal broker address, tried before any resolver
    pub broker: Option<String>,
    /// Prepended to every gland name
    pub prefix: String,
    /// Skip the clock drift check at bootstrap
    pub ignore_timedrift: bool,
    /// Reject brokers whose certificate does not chain to the CA
    pub reject_unauthorized: bool,
    /// Period of the unconditional definition republish; zero disables it
    pub definition_resend_interval: Duration,
    /// Reconnect timer; `None` relies on transport-level reconnects alone
    pub reconnect_delay: Option<Duration>,
    /// Pause after a fully failed discovery round
    pub discovery_retry: Duration,
}

impl SystemConfig {
    /// Create new configuration with defaults for everything but the identity.
    pub fn new(key: impl Into<String>, cert: impl Into<String>, ca: impl Into<String>) -> Self {
        Self {
            identity: IdentityMaterial {
                key: key.into(),
                cert: cert.into(),
                ca: ca.into(),
            },
            broker: None,
            prefix: String::new(),
            ignore_timedrift: false,
            reject_unauthorized: true,
            definition_resend_interval: DEFAULT_DEFINITION_RESEND_INTERVAL,
            reconnect_delay: Some(DEFAULT_RECONNECT_DELAY),
            discovery_retry: DEFAULT_DISCOVERY_RETRY,
        }
    }

    /// Use a literal broker address.
    #[must_use]
    pub fn with_broker(mut self, broker: impl Into<String>) -> Self {
        self.broker = Some(broker.into());
        self
    }

    /// Prefix every gland name.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Skip the clock drift check.
    #[must_use]
    pub fn ignore_timedrift(mut self, ignore: bool) -> Self {
        self.ignore_timedrift = ignore;
        self
    }

    /// Set the definition republish period; zero disables republishing.
    #[must_use]
    pub fn with_definition_resend_interval(mut self, interval: Duration) -> Self {
        self.definition_resend_interval = interval;
        self
    }

    /// Set or disable the reconnect timer.
    #[must_use]
    pub fn with_reconnect_delay(mut self, delay: Option<Duration>) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the pause after a fully failed discovery round.
    #[must_use]
    pub fn with_discovery_retry(mut self, retry: Duration) -> Self {
        self.discovery_retry = retry;
        self
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns error if the file or any referenced PEM file cannot be read,
    /// or the TOML cannot be parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = read(path)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&content, Some(base))
    }

    /// Parse configuration from a TOML string; relative PEM paths resolve
    /// against the working directory.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Self::parse(content, None)
    }

    fn parse(content: &str, base: Option<&Path>) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        let key = pem("key", file.key, file.key_path, base)?;
        let cert = pem("cert", file.cert, file.cert_path, base)?;
        let ca = pem("ca", file.ca, file.ca_path, base)?;

        let reconnect_delay = match file.reconnect_delay_secs {
            None => Some(DEFAULT_RECONNECT_DELAY),
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
        };

        Ok(Self {
            broker: file.broker,
            prefix: file.prefix,
            ignore_timedrift: file.ignore_timedrift,
            reject_unauthorized: file.reject_unauthorized.unwrap_or(true),
            definition_resend_interval: file
                .definition_resend_interval_secs
                .map_or(DEFAULT_DEFINITION_RESEND_INTERVAL, Duration::from_secs),
            reconnect_delay,
            discovery_retry: file
                .discovery_retry_ms
                .map_or(DEFAULT_DISCOVERY_RETRY, Duration::from_millis),
            ..Self::new(key, cert, ca)
        })
    }
}

fn read(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        error: e.to_string(),
    })
}

fn pem(
    field: &'static str,
    inline: Option<String>,
    path: Option<PathBuf>,
    base: Option<&Path>,
) -> Result<String, ConfigError> {
    match (inline, path) {
        (Some(_), Some(_)) => Err(ConfigError::AmbiguousPem(field)),
        (Some(inline), None) => Ok(inline),
        (None, Some(path)) => match base {
            Some(base) if path.is_relative() => read(&base.join(path)),
            _ => read(&path),
        },
        (None, None) => Err(ConfigError::MissingPem(field)),
    }
}
