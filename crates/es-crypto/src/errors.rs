//! Crypto error types.

use thiserror::Error;

/// Cryptographic operation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// Private key could not be decoded (neither PKCS#8 nor PKCS#1 PEM)
    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    /// Certificate could not be decoded
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    /// Input is not a PEM encoded certificate
    #[error("Certificate is not PEM encoded")]
    NotPem,

    /// Public key inside a certificate is not an RSA key
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Signature is not valid base64 or has the wrong length
    #[error("Invalid signature format")]
    InvalidSignatureFormat,

    /// Signature verification failed
    #[error("Signature verification failed")]
    SignatureVerificationFailed,

    /// Certificate is signed with an algorithm other than sha256WithRSAEncryption
    #[error("Unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// DER re-encoding failed
    #[error("Encoding failed: {0}")]
    Encoding(String),
}

/// Errors from the two trust checks (identity bootstrap and definition origin).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TrustError {
    /// Private key and certificate carry different moduli
    #[error("Key and certificate do not match")]
    KeyMismatch,

    /// Certificate does not chain to the configured CA
    #[error("Certificate has not been signed by CA")]
    UntrustedCertificate,

    /// Certificate validity starts after `now`
    #[error("Certificate is valid in the future (not before {start}, now {now})")]
    NotYetValid {
        /// Start of the validity window (unix seconds)
        start: u64,
        /// Time of the check (unix seconds)
        now: u64,
    },

    /// Certificate validity ended before `now`
    #[error("Certificate has expired (not after {end}, now {now})")]
    Expired {
        /// End of the validity window (unix seconds)
        end: u64,
        /// Time of the check (unix seconds)
        now: u64,
    },

    /// Caller supplied predicate refused the origin
    #[error("Rejected by certificate check: {0}")]
    Rejected(String),

    /// PKI collaborator failed
    #[error("PKI failure: {0}")]
    Pki(#[from] CryptoError),
}
