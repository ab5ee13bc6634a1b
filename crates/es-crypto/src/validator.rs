//! # Certificate Validator
//!
//! Composes [`Pki`] calls into the two trust checks of the system:
//!
//! - **identity** (once, at bootstrap): the private key belongs to the
//!   certificate and the certificate chains to the CA.
//! - **origin** (per definition): the certificate embedded in a definition
//!   chains to the CA and its validity window contains `now`.

use crate::pki::{CertInfo, Pki};
use crate::TrustError;
use std::sync::Arc;
use tracing::debug;

/// Trust checks against one configured CA.
#[derive(Clone)]
pub struct CertificateValidator {
    pki: Arc<dyn Pki>,
}

impl CertificateValidator {
    /// Create new validator.
    pub fn new(pki: Arc<dyn Pki>) -> Self {
        Self { pki }
    }

    /// Underlying PKI adapter.
    pub fn pki(&self) -> &Arc<dyn Pki> {
        &self.pki
    }

    /// Check that `key` and `cert` share a modulus and that `cert` is signed by `ca`.
    pub async fn validate_identity(&self, key: &str, cert: &str, ca: &str) -> Result<(), TrustError> {
        let key_modulus = self.pki.modulus(key).await?;
        let cert_modulus = self.pki.modulus(cert).await?;
        if key_modulus != cert_modulus {
            return Err(TrustError::KeyMismatch);
        }

        if !self.pki.verify_chain(cert, ca).await? {
            return Err(TrustError::UntrustedCertificate);
        }

        Ok(())
    }

    /// Check that `cert` is signed by `ca` and valid at `now`, returning its metadata.
    pub async fn validate_origin(&self, cert: &str, ca: &str, now: u64) -> Result<CertInfo, TrustError> {
        if !self.pki.verify_chain(cert, ca).await? {
            return Err(TrustError::UntrustedCertificate);
        }

        let info = self.pki.cert_info(cert).await?;
        let validity = info.validity;
        if validity.start > now {
            debug!(subject = %info.subject, start = validity.start, now, "certificate not yet valid");
            return Err(TrustError::NotYetValid {
                start: validity.start,
                now,
            });
        }
        if validity.end < now {
            debug!(subject = %info.subject, end = validity.end, now, "certificate expired");
            return Err(TrustError::Expired {
                end: validity.end,
                now,
            });
        }

        Ok(info)
    }

    /// Fingerprint of the trust root.
    pub async fn fingerprint(&self, ca: &str) -> Result<String, TrustError> {
        Ok(self.pki.fingerprint(ca).await?)
    }
}

impl std::fmt::Debug for CertificateValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateValidator").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::X509Pki;
    use crate::testing::*;

    fn validator() -> CertificateValidator {
        CertificateValidator::new(Arc::new(X509Pki::new()))
    }

    #[tokio::test]
    async fn test_identity_accepted() {
        assert!(validator()
            .validate_identity(GLAND_KEY, GLAND_CERT, CA_CERT)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_identity_key_mismatch() {
        let err = validator()
            .validate_identity(OTHER_KEY, GLAND_CERT, CA_CERT)
            .await
            .unwrap_err();
        assert_eq!(err, TrustError::KeyMismatch);
    }

    #[tokio::test]
    async fn test_identity_untrusted() {
        let err = validator()
            .validate_identity(ROGUE_KEY, ROGUE_CERT, CA_CERT)
            .await
            .unwrap_err();
        assert_eq!(err, TrustError::UntrustedCertificate);
    }

    #[tokio::test]
    async fn test_origin_window() {
        let v = validator();

        let info = v.validate_origin(GLAND_CERT, CA_CERT, FIXTURE_NOW).await.unwrap();
        assert!(info.subject.contains("Test Gland"));

        let early = FIXTURE_NOT_BEFORE - 1;
        assert_eq!(
            v.validate_origin(GLAND_CERT, CA_CERT, early).await.unwrap_err(),
            TrustError::NotYetValid {
                start: FIXTURE_NOT_BEFORE,
                now: early
            }
        );

        let late = info.validity.end + 1;
        assert!(matches!(
            v.validate_origin(GLAND_CERT, CA_CERT, late).await,
            Err(TrustError::Expired { .. })
        ));
    }

    #[tokio::test]
    async fn test_origin_untrusted() {
        assert_eq!(
            validator()
                .validate_origin(ROGUE_CERT, CA_CERT, FIXTURE_NOW)
                .await
                .unwrap_err(),
            TrustError::UntrustedCertificate
        );
    }
}
