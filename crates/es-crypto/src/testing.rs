//! PEM fixtures shared by the workspace test suites.
//!
//! Every certificate is valid from [`FIXTURE_NOT_BEFORE`] for a hundred
//! years, so [`FIXTURE_NOW`] sits safely inside the window.

/// Self-signed trust root.
pub const CA_CERT: &str = include_str!("../fixtures/ca.pem");

/// Gland certificate issued by [`CA_CERT`].
pub const GLAND_CERT: &str = include_str!("../fixtures/gland-cert.pem");

/// PKCS#8 private key matching [`GLAND_CERT`].
pub const GLAND_KEY: &str = include_str!("../fixtures/gland-key.pem");

/// PKCS#1 private key that matches no certificate.
pub const OTHER_KEY: &str = include_str!("../fixtures/other-key.pem");

/// Unrelated self-signed root.
pub const ROGUE_CA_CERT: &str = include_str!("../fixtures/rogue-ca.pem");

/// Certificate issued by [`ROGUE_CA_CERT`].
pub const ROGUE_CERT: &str = include_str!("../fixtures/rogue-cert.pem");

/// Private key matching [`ROGUE_CERT`].
pub const ROGUE_KEY: &str = include_str!("../fixtures/rogue-key.pem");

/// notBefore of [`CA_CERT`] and [`GLAND_CERT`] (2026-10-19T00:34:08Z).
pub const FIXTURE_NOT_BEFORE: u64 = 1_792_370_048;

/// A clock reading inside every fixture's validity window.
pub const FIXTURE_NOW: u64 = 1_900_000_000;
