//! Bootstrap validation of the local identity, run once before the first
//! discovery. Any failure here is final.

use crate::time::TimeSource;
use crate::ConfigurationError;
use es_crypto::CertificateValidator;
use std::fmt;
use tracing::{info, warn};

/// Largest tolerated clock drift, in milliseconds.
pub const MAX_DRIFT_MS: i64 = 10_000;

/// PEM material identifying this participant.
#[derive(Clone)]
pub struct IdentityMaterial {
    /// Private key
    pub key: String,
    /// Certificate for `key`
    pub cert: String,
    /// Trust root
    pub ca: String,
}

impl fmt::Debug for IdentityMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityMaterial")
            .field("key", &"<redacted>")
            .finish_non_exhaustive()
    }
}

/// Validate key, certificate, CA chain and clock drift.
///
/// Returns the CA fingerprint handed to discovery resolvers.
pub async fn bootstrap(
    material: &IdentityMaterial,
    validator: &CertificateValidator,
    time: &dyn TimeSource,
    ignore_timedrift: bool,
) -> Result<String, ConfigurationError> {
    validator
        .validate_identity(&material.key, &material.cert, &material.ca)
        .await?;

    if ignore_timedrift {
        warn!("clock drift check disabled");
    } else {
        let drift_ms = time.drift().await?;
        if drift_ms.unsigned_abs() > MAX_DRIFT_MS.unsigned_abs() {
            return Err(ConfigurationError::ExcessiveDrift { drift_ms });
        }
    }

    let fingerprint = validator.fingerprint(&material.ca).await?;
    info!(ca = %fingerprint, "identity validated");
    Ok(fingerprint)
}
