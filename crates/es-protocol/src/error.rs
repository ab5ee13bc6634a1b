//! # Error Types
//!
//! Codec and check-expression errors. A protocol error always concerns a
//! single message; the receiver drops that message and keeps its state.

use es_crypto::CryptoError;
use thiserror::Error;

/// Errors raised while building or decoding definitions and hormones.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Payload has no signature line.
    #[error("Payload is missing the signature line")]
    MissingSignature,

    /// Definition JSON spans more than one line.
    #[error("Definition must be a single JSON line")]
    MultilineDefinition,

    /// JSON could not be parsed or does not match the definition schema.
    #[error("Malformed definition: {0}")]
    MalformedJson(String),

    /// The `cert` property is not a PEM certificate.
    #[error("Definition certificate is not PEM encoded")]
    CertificateNotPem,

    /// Two fields share a name.
    #[error("Duplicate field name: {0}")]
    DuplicateField(String),

    /// Freshness must be at least one second.
    #[error("Freshness must be at least 1 second")]
    InvalidFreshness,

    /// Signature does not match the payload.
    #[error("Signature is invalid")]
    InvalidSignature,

    /// Number of value lines differs from the definition.
    #[error("Expected format does not match: expected {expected} values, got {actual}")]
    FormatMismatch {
        /// Fields declared by the definition
        expected: usize,
        /// Value lines found in the payload
        actual: usize,
    },

    /// Timestamp line is not an unsigned integer.
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// A declared field is missing from the sample.
    #[error("Missing value for field {0}")]
    MissingValue(String),

    /// The sample carries a field the definition does not declare.
    #[error("Unknown field {0}")]
    UnknownValue(String),

    /// A value does not match its declared type or cannot be encoded.
    #[error("Invalid value for field {field}: {reason}")]
    InvalidValue {
        /// Field name
        field: String,
        /// What is wrong with it
        reason: String,
    },

    /// Stream name violates the naming rules.
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// Topic is outside the definition/hormone namespace.
    #[error("Unexpected topic: {0}")]
    UnexpectedTopic(String),

    /// The check expression does not compile.
    #[error("Invalid check expression: {0}")]
    Check(#[from] CheckError),

    /// Certificate or key handling failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Errors raised while compiling a check expression.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CheckError {
    /// Source exceeds the length limit.
    #[error("expression longer than {0} bytes")]
    TooLong(usize),

    /// Expression nesting exceeds the depth limit.
    #[error("expression nested deeper than {0} levels")]
    TooDeep(usize),

    /// Lexing or parsing failed.
    #[error("syntax error at offset {offset}: {message}")]
    Syntax {
        /// Byte offset into the source
        offset: usize,
        /// Description
        message: String,
    },

    /// An identifier is read before anything binds it.
    #[error("unknown identifier `{0}`")]
    UnknownIdentifier(String),

    /// Field bindings are read-only.
    #[error("cannot assign to field `{0}`")]
    AssignToField(String),
}
