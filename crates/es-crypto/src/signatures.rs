//! # RSA-SHA256 Signatures
//!
//! PKCS#1 v1.5 signatures over SHA-256, encoded as standard base64.
//!
//! Producers sign with the private key that matches their certificate;
//! receivers verify against the public key embedded in the certificate that
//! travels inside the signed definition.

use crate::CryptoError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::fmt;
use x509_cert::der::{DecodePem, Encode};
use x509_cert::Certificate;

const PEM_CERTIFICATE_HEADER: &str = "-----BEGIN CERTIFICATE-----";

/// Returns true if `data` looks like a PEM encoded X.509 certificate.
pub fn is_pem_certificate(data: &str) -> bool {
    data.trim_start().starts_with(PEM_CERTIFICATE_HEADER)
}

/// Parse a PEM certificate.
pub(crate) fn parse_certificate(pem: &str) -> Result<Certificate, CryptoError> {
    if !is_pem_certificate(pem) {
        return Err(CryptoError::NotPem);
    }
    Certificate::from_pem(pem.as_bytes()).map_err(|e| CryptoError::InvalidCertificate(e.to_string()))
}

/// Extract the RSA public key from a parsed certificate.
pub(crate) fn certificate_public_key(cert: &Certificate) -> Result<RsaPublicKey, CryptoError> {
    let spki = cert
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| CryptoError::Encoding(e.to_string()))?;
    RsaPublicKey::from_public_key_der(&spki).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
}

/// Uppercase hex modulus, the representation `openssl -modulus` prints.
pub(crate) fn modulus_hex(key: &impl PublicKeyParts) -> String {
    hex::encode_upper(key.n().to_bytes_be())
}

/// The private half of a gland's identity.
///
/// Signing is deterministic (PKCS#1 v1.5), so no RNG is involved.
pub struct SigningIdentity {
    signing_key: SigningKey<Sha256>,
    modulus: String,
}

impl SigningIdentity {
    /// Load a private key from PEM (PKCS#8 `PRIVATE KEY` or PKCS#1 `RSA PRIVATE KEY`).
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;
        let modulus = modulus_hex(&private_key);

        Ok(Self {
            signing_key: SigningKey::<Sha256>::new(private_key),
            modulus,
        })
    }

    /// Sign `message` and return the base64 signature.
    pub fn sign(&self, message: &[u8]) -> String {
        let signature = self.signing_key.sign(message);
        BASE64.encode(signature.to_vec())
    }

    /// Hex modulus of the key pair.
    pub fn modulus(&self) -> &str {
        &self.modulus
    }
}

impl fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("modulus_len", &self.modulus.len())
            .finish_non_exhaustive()
    }
}

/// Public key extracted once from a PEM certificate.
#[derive(Clone)]
pub struct CertificateKey {
    verifying_key: VerifyingKey<Sha256>,
}

impl CertificateKey {
    /// Parse the certificate and keep its RSA public key.
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let cert = parse_certificate(pem)?;
        let public_key = certificate_public_key(&cert)?;
        Ok(Self {
            verifying_key: VerifyingKey::<Sha256>::new(public_key),
        })
    }

    /// Verify a base64 signature over `message`.
    pub fn verify(&self, message: &[u8], signature_b64: &str) -> Result<(), CryptoError> {
        let raw = BASE64
            .decode(signature_b64.trim_end())
            .map_err(|_| CryptoError::InvalidSignatureFormat)?;
        let signature =
            Signature::try_from(raw.as_slice()).map_err(|_| CryptoError::InvalidSignatureFormat)?;

        self.verifying_key
            .verify(message, &signature)
            .map_err(|_| CryptoError::SignatureVerificationFailed)
    }
}

impl fmt::Debug for CertificateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CertificateKey")
    }
}
