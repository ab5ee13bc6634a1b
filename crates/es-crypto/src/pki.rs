//! # PKI Port
//!
//! The narrow certificate toolkit the rest of the system needs: modulus
//! extraction, chain verification against a single CA, certificate
//! metadata and trust-root fingerprints.
//!
//! [`X509Pki`] is the default adapter; tests substitute their own
//! implementation to exercise validity-window failures.

use crate::hashing::{colon_hex, sha256};
use crate::signatures::{certificate_public_key, modulus_hex, parse_certificate, SigningIdentity};
use crate::CryptoError;
use async_trait::async_trait;
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::signature::Verifier;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x509_cert::der::Encode;
use x509_cert::Certificate;

/// sha256WithRSAEncryption
const SHA256_WITH_RSA: &str = "1.2.840.113549.1.1.11";

/// Certificate validity window, unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validity {
    /// notBefore
    pub start: u64,
    /// notAfter
    pub end: u64,
}

/// Metadata of a certificate, attached to every accepted definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertInfo {
    /// Issuer distinguished name
    pub issuer: String,
    /// Subject distinguished name
    pub subject: String,
    /// Validity window
    pub validity: Validity,
}

/// Certificate operations required by bootstrap and definition validation.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; one instance is shared by the
/// connection manager and every receptor.
#[async_trait]
pub trait Pki: Send + Sync {
    /// Modulus of a PEM private key or certificate, as hex.
    async fn modulus(&self, pem: &str) -> Result<String, CryptoError>;

    /// Whether `cert` has been signed by `ca`.
    async fn verify_chain(&self, cert: &str, ca: &str) -> Result<bool, CryptoError>;

    /// Issuer, subject and validity of `cert`.
    async fn cert_info(&self, cert: &str) -> Result<CertInfo, CryptoError>;

    /// SHA-256 fingerprint of the trust root.
    async fn fingerprint(&self, ca: &str) -> Result<String, CryptoError>;
}

/// [`Pki`] over `x509-cert` and `rsa`.
///
/// Only RSA keys and sha256WithRSAEncryption signatures are supported.
#[derive(Debug, Clone, Copy, Default)]
pub struct X509Pki;

impl X509Pki {
    /// Create new adapter.
    pub fn new() -> Self {
        Self
    }

    fn chain_valid(cert: &Certificate, ca: &Certificate) -> Result<bool, CryptoError> {
        if cert.tbs_certificate.issuer != ca.tbs_certificate.subject {
            return Ok(false);
        }

        let algorithm = cert.signature_algorithm.oid.to_string();
        if algorithm != SHA256_WITH_RSA {
            return Err(CryptoError::UnsupportedAlgorithm(algorithm));
        }

        let tbs = cert
            .tbs_certificate
            .to_der()
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;
        let Some(raw) = cert.signature.as_bytes() else {
            return Ok(false);
        };
        let Ok(signature) = Signature::try_from(raw) else {
            return Ok(false);
        };

        let ca_key = VerifyingKey::<Sha256>::new(certificate_public_key(ca)?);
        Ok(ca_key.verify(&tbs, &signature).is_ok())
    }
}

#[async_trait]
impl Pki for X509Pki {
    async fn modulus(&self, pem: &str) -> Result<String, CryptoError> {
        match parse_certificate(pem) {
            Ok(cert) => Ok(modulus_hex(&certificate_public_key(&cert)?)),
            Err(CryptoError::NotPem) => {
                SigningIdentity::from_pem(pem).map(|identity| identity.modulus().to_string())
            }
            Err(e) => Err(e),
        }
    }

    async fn verify_chain(&self, cert: &str, ca: &str) -> Result<bool, CryptoError> {
        let cert = parse_certificate(cert)?;
        let ca = parse_certificate(ca)?;
        Self::chain_valid(&cert, &ca)
    }

    async fn cert_info(&self, cert: &str) -> Result<CertInfo, CryptoError> {
        let cert = parse_certificate(cert)?;
        let tbs = &cert.tbs_certificate;

        Ok(CertInfo {
            issuer: tbs.issuer.to_string(),
            subject: tbs.subject.to_string(),
            validity: Validity {
                start: tbs.validity.not_before.to_unix_duration().as_secs(),
                end: tbs.validity.not_after.to_unix_duration().as_secs(),
            },
        })
    }

    async fn fingerprint(&self, ca: &str) -> Result<String, CryptoError> {
        let der = parse_certificate(ca)?
            .to_der()
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;
        Ok(colon_hex(&sha256(&der)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;

    #[tokio::test]
    async fn test_key_and_certificate_share_modulus() {
        let pki = X509Pki::new();
        let key = pki.modulus(GLAND_KEY).await.unwrap();
        let cert = pki.modulus(GLAND_CERT).await.unwrap();
        assert_eq!(key, cert);

        let other = pki.modulus(OTHER_KEY).await.unwrap();
        assert_ne!(other, cert);
    }

    #[tokio::test]
    async fn test_chain_verification() {
        let pki = X509Pki::new();
        assert!(pki.verify_chain(GLAND_CERT, CA_CERT).await.unwrap());
        assert!(pki.verify_chain(CA_CERT, CA_CERT).await.unwrap());
        assert!(!pki.verify_chain(ROGUE_CERT, CA_CERT).await.unwrap());
        assert!(!pki.verify_chain(GLAND_CERT, ROGUE_CA_CERT).await.unwrap());
    }

    #[tokio::test]
    async fn test_cert_info() {
        let info = X509Pki::new().cert_info(GLAND_CERT).await.unwrap();
        assert!(info.subject.contains("CN=Test Gland"));
        assert!(info.issuer.contains("CN=Endocrine Test CA"));
        assert_eq!(info.validity.start, FIXTURE_NOT_BEFORE);
        assert!(info.validity.end > FIXTURE_NOW);
    }

    #[tokio::test]
    async fn test_fingerprint() {
        let fingerprint = X509Pki::new().fingerprint(CA_CERT).await.unwrap();
        assert_eq!(
            fingerprint,
            "34:f7:26:4d:e6:2e:1f:2a:03:c5:d2:f9:ca:37:1c:41:b9:dd:63:38:07:d5:34:48:22:ec:4c:ed:f0:4c:85:03"
        );
    }

    #[tokio::test]
    async fn test_garbage_input() {
        let pki = X509Pki::new();
        assert!(pki.modulus("garbage").await.is_err());
        assert_eq!(
            pki.verify_chain("garbage", CA_CERT).await,
            Err(CryptoError::NotPem)
        );
    }
}
