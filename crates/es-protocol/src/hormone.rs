//! # Hormones
//!
//! A hormone is one signed sample of a stream:
//!
//! ```text
//! <timestamp>\n
//! <value 1>\n
//! ...
//! <value n>\n
//! <base64 signature over everything above>
//! ```
//!
//! Values follow the definition's `dataFormat` order. Numbers are decimal
//! text, booleans `1`/`0`, strings are written raw and must not contain a
//! line break.

use crate::definition::{Definition, FieldType};
use crate::ProtocolError;
use es_crypto::SigningIdentity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A single typed value of a sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// `number` field
    Number(f64),
    /// `string` field
    String(String),
    /// `boolean` field
    Boolean(bool),
}

impl FieldValue {
    fn matches(&self, field_type: FieldType) -> bool {
        matches!(
            (self, field_type),
            (FieldValue::Number(_), FieldType::Number)
                | (FieldValue::String(_), FieldType::String)
                | (FieldValue::Boolean(_), FieldType::Boolean)
        )
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Number(f64::from(value))
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Boolean(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

/// Caller-facing sample: field name to value.
pub type Sample = BTreeMap<String, FieldValue>;

/// A signed sample bound to the definition it was produced or verified under.
#[derive(Debug, Clone)]
pub struct Hormone {
    definition: Arc<Definition>,
    timestamp: u64,
    values: Vec<FieldValue>,
    payload: String,
    error: i64,
}

impl Hormone {
    /// Validate `sample` against the definition, then encode and sign it.
    pub fn sign(
        definition: Arc<Definition>,
        identity: &SigningIdentity,
        sample: &Sample,
        timestamp: u64,
    ) -> Result<Self, ProtocolError> {
        let format = definition.data_format();

        if let Some(unknown) = sample
            .keys()
            .find(|key| !format.iter().any(|field| field.name == **key))
        {
            return Err(ProtocolError::UnknownValue(unknown.clone()));
        }

        let mut body = format!("{timestamp}\n");
        let mut values = Vec::with_capacity(format.len());
        for field in format {
            let value = sample
                .get(&field.name)
                .ok_or_else(|| ProtocolError::MissingValue(field.name.clone()))?;
            if !value.matches(field.field_type) {
                return Err(invalid(&field.name, format!("expected {}", field.field_type)));
            }

            body.push_str(&encode_value(&field.name, value)?);
            body.push('\n');
            values.push(value.clone());
        }

        let signature = identity.sign(body.as_bytes());
        let error = definition.evaluate(&values);
        let payload = body + &signature;

        Ok(Self {
            definition,
            timestamp,
            values,
            payload,
            error,
        })
    }

    /// Verify and parse a payload received for `definition`.
    pub fn decode(definition: Arc<Definition>, payload: &str) -> Result<Self, ProtocolError> {
        let (body, signature) = payload
            .rsplit_once('\n')
            .ok_or(ProtocolError::MissingSignature)?;
        let signed = &payload[..=body.len()];
        definition
            .verify(signed.as_bytes(), signature)
            .map_err(|_| ProtocolError::InvalidSignature)?;

        let mut lines = body.split('\n');
        let timestamp_line = lines.next().unwrap_or_default();
        let timestamp = timestamp_line
            .parse::<u64>()
            .map_err(|_| ProtocolError::InvalidTimestamp(timestamp_line.to_string()))?;

        let lines: Vec<&str> = lines.collect();
        let format = definition.data_format();
        if lines.len() != format.len() {
            return Err(ProtocolError::FormatMismatch {
                expected: format.len(),
                actual: lines.len(),
            });
        }

        let values = format
            .iter()
            .zip(lines)
            .map(|(field, line)| decode_value(&field.name, field.field_type, line))
            .collect::<Result<Vec<_>, _>>()?;
        let error = definition.evaluate(&values);

        Ok(Self {
            definition,
            timestamp,
            values,
            payload: payload.to_string(),
            error,
        })
    }

    /// Definition this hormone belongs to.
    pub fn definition(&self) -> &Arc<Definition> {
        &self.definition
    }

    /// Unix seconds at which the sample was taken.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Values in field order.
    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    /// Values keyed by field name.
    pub fn sample(&self) -> Sample {
        self.definition
            .data_format()
            .iter()
            .zip(&self.values)
            .map(|(field, value)| (field.name.clone(), value.clone()))
            .collect()
    }

    /// Wire representation.
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Result of the definition's check expression (0 without one).
    pub fn error(&self) -> i64 {
        self.error
    }

    /// Seconds left until the sample goes stale, negative once it has.
    ///
    /// `None` when the definition never expires.
    pub fn freshness(&self, now: u64) -> Option<i64> {
        let window = self.definition.freshness()?;
        let expires = self.timestamp.saturating_add(window);
        Some(if expires >= now {
            i64::try_from(expires - now).unwrap_or(i64::MAX)
        } else {
            i64::try_from(now - expires).map_or(i64::MIN, |late| -late)
        })
    }

    /// `timestamp <= now <= timestamp + freshness`, or always without freshness.
    pub fn is_fresh(&self, now: u64) -> bool {
        self.freshness(now).map_or(true, |left| left >= 0)
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ProtocolError {
    ProtocolError::InvalidValue {
        field: field.to_string(),
        reason: reason.into(),
    }
}

fn encode_value(field: &str, value: &FieldValue) -> Result<String, ProtocolError> {
    match value {
        FieldValue::Number(n) if !n.is_finite() => Err(invalid(field, "number is not finite")),
        FieldValue::Number(n) => Ok(n.to_string()),
        FieldValue::String(s) if s.contains('\n') => Err(invalid(field, "string contains a line break")),
        FieldValue::String(s) => Ok(s.clone()),
        FieldValue::Boolean(b) => Ok(if *b { "1" } else { "0" }.to_string()),
    }
}

fn decode_value(field: &str, field_type: FieldType, line: &str) -> Result<FieldValue, ProtocolError> {
    match field_type {
        FieldType::Number => line
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|n| n.is_finite())
            .map(FieldValue::Number)
            .ok_or_else(|| invalid(field, format!("`{line}` is not a number"))),
        FieldType::String => Ok(FieldValue::String(line.to_string())),
        FieldType::Boolean => Ok(FieldValue::Boolean(line == "1")),
    }
}
