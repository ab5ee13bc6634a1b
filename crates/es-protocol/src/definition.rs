//! # Definitions
//!
//! A definition describes one stream: the producer certificate, an optional
//! description and check expression, the freshness window and the ordered
//! field list. On the wire it is a single JSON line followed by a base64
//! RSA-SHA256 signature over exactly that line:
//!
//! ```text
//! {"cert":"-----BEGIN CERTIFICATE-----\n...","freshness":60,"dataFormat":[...]}
//! <base64 signature>
//! ```

use crate::check::CheckProgram;
use crate::hormone::FieldValue;
use crate::ProtocolError;
use es_crypto::{is_pem_certificate, CertificateKey, CryptoError, SigningIdentity};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Type of a field in `dataFormat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// Decimal number
    Number,
    /// Single-line text
    String,
    /// `1` or `0` on the wire
    Boolean,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FieldType::Number => "number",
            FieldType::String => "string",
            FieldType::Boolean => "boolean",
        })
    }
}

/// One entry of `dataFormat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Field {
    /// Unique field name
    pub name: String,
    /// Value type
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Unit of measurement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Human readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Field {
    /// Create new field without unit or description.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            unit: None,
            description: None,
        }
    }

    /// Set the unit.
    #[must_use]
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// The signed JSON document. Field order here is the serialization order.
///
/// Equality is structural and drives receptor change detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct DefinitionData {
    /// PEM certificate of the producer
    pub cert: String,
    /// Stream description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Check expression source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<String>,
    /// Seconds a hormone stays fresh; `None` never expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freshness: Option<u64>,
    /// Ordered field list
    #[serde(default)]
    pub data_format: Vec<Field>,
}

impl DefinitionData {
    /// Create new definition data with no fields and no freshness.
    pub fn new(cert: impl Into<String>) -> Self {
        Self {
            cert: cert.into(),
            description: None,
            check: None,
            freshness: None,
            data_format: Vec::new(),
        }
    }

    fn field_names(&self) -> Vec<String> {
        self.data_format.iter().map(|f| f.name.clone()).collect()
    }

    /// Enforce the invariants JSON decoding alone cannot express and compile the check.
    fn validate(&self) -> Result<Option<CheckProgram>, ProtocolError> {
        if !is_pem_certificate(&self.cert) {
            return Err(ProtocolError::CertificateNotPem);
        }

        let mut seen = HashSet::new();
        if let Some(duplicate) = self.data_format.iter().find(|f| !seen.insert(f.name.as_str())) {
            return Err(ProtocolError::DuplicateField(duplicate.name.clone()));
        }

        if self.freshness == Some(0) {
            return Err(ProtocolError::InvalidFreshness);
        }

        self.check
            .as_deref()
            .map(|source| CheckProgram::compile(source, &self.field_names()))
            .transpose()
            .map_err(ProtocolError::from)
    }
}

/// A validated definition together with its wire payload.
///
/// Immutable once built; a changed stream gets a new `Definition`.
#[derive(Clone)]
pub struct Definition {
    data: DefinitionData,
    payload: String,
    check: Option<CheckProgram>,
    key: CertificateKey,
}

impl Definition {
    /// Validate `data`, serialize it and sign the JSON line.
    pub fn sign(data: DefinitionData, identity: &SigningIdentity) -> Result<Self, ProtocolError> {
        let check = data.validate()?;
        let key = CertificateKey::from_pem(&data.cert)?;

        let json = serde_json::to_string(&data).map_err(|e| ProtocolError::MalformedJson(e.to_string()))?;
        let signature = identity.sign(json.as_bytes());
        let payload = format!("{json}\n{signature}");

        Ok(Self {
            data,
            payload,
            check,
            key,
        })
    }

    /// Parse, validate and verify a received payload.
    pub fn decode(payload: &str) -> Result<Self, ProtocolError> {
        let (json, signature) = payload
            .rsplit_once('\n')
            .ok_or(ProtocolError::MissingSignature)?;
        if json.contains('\n') {
            return Err(ProtocolError::MultilineDefinition);
        }

        let data: DefinitionData =
            serde_json::from_str(json).map_err(|e| ProtocolError::MalformedJson(e.to_string()))?;
        let check = data.validate()?;
        let key = CertificateKey::from_pem(&data.cert)?;

        key.verify(json.as_bytes(), signature).map_err(|e| match e {
            CryptoError::SignatureVerificationFailed | CryptoError::InvalidSignatureFormat => {
                ProtocolError::InvalidSignature
            }
            other => ProtocolError::Crypto(other),
        })?;

        Ok(Self {
            data,
            payload: payload.to_string(),
            check,
            key,
        })
    }

    /// The signed document.
    pub fn data(&self) -> &DefinitionData {
        &self.data
    }

    /// Wire representation.
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Producer certificate.
    pub fn cert(&self) -> &str {
        &self.data.cert
    }

    /// Stream description.
    pub fn description(&self) -> Option<&str> {
        self.data.description.as_deref()
    }

    /// Check expression source.
    pub fn check(&self) -> Option<&str> {
        self.data.check.as_deref()
    }

    /// Freshness window in seconds.
    pub fn freshness(&self) -> Option<u64> {
        self.data.freshness
    }

    /// Ordered field list.
    pub fn data_format(&self) -> &[Field] {
        &self.data.data_format
    }

    /// Verify a signature made with the key of this definition's certificate.
    pub fn verify(&self, message: &[u8], signature: &str) -> Result<(), CryptoError> {
        self.key.verify(message, signature)
    }

    /// Error code for `values` (given in field order); 0 without a check.
    pub fn evaluate(&self, values: &[FieldValue]) -> i64 {
        self.check.as_ref().map_or(0, |program| program.evaluate(values))
    }
}

impl PartialEq for Definition {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl fmt::Debug for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Definition")
            .field("description", &self.data.description)
            .field("freshness", &self.data.freshness)
            .field("fields", &self.data.data_format.len())
            .finish_non_exhaustive()
    }
}
