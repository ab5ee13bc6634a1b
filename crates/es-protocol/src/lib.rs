//! # ES Protocol - Signed Wire Formats
//!
//! Pure, synchronous codecs for the two message kinds exchanged over the
//! broker.
//!
//! | Message | Topic | Payload |
//! |---------|-------|---------|
//! | [`Definition`] | `definition/<name>` | JSON line + signature |
//! | [`Hormone`] | `hormone/<name>` | timestamp, one line per field, signature |
//!
//! Both are retained on the broker; an empty payload withdraws the stream.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod check;
pub mod definition;
pub mod error;
pub mod hormone;
pub mod topic;

pub use check::CheckProgram;
pub use definition::{Definition, DefinitionData, Field, FieldType};
pub use error::{CheckError, ProtocolError};
pub use hormone::{FieldValue, Hormone, Sample};
