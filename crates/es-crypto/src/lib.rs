//! # ES Crypto - Identity and Trust Primitives
//!
//! ## Components
//!
//! | Module | Algorithm | Use Case |
//! |--------|-----------|----------|
//! | `signatures` | RSA PKCS#1 v1.5 / SHA-256 | Definition and hormone signatures |
//! | `pki` | X.509 | Chain checks, certificate metadata |
//! | `validator` | - | Bootstrap identity and definition origin checks |
//! | `hashing` | SHA-256 | Trust-root fingerprints |
//!
//! ## Security Properties
//!
//! - **PKCS#1 v1.5**: deterministic, no RNG dependency at signing time
//! - **Single CA**: every accepted certificate must be issued directly by the configured root

#![warn(missing_docs)]
#![warn(clippy::all)]
#![cfg_attr(not(test), warn(clippy::unwrap_used))]

pub mod errors;
pub mod hashing;
pub mod pki;
pub mod signatures;
pub mod validator;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-exports
pub use errors::{CryptoError, TrustError};
pub use hashing::sha256;
pub use pki::{CertInfo, Pki, Validity, X509Pki};
pub use signatures::{is_pem_certificate, CertificateKey, SigningIdentity};
pub use validator::CertificateValidator;
