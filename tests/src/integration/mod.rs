//! Cross-crate integration tests.

pub mod flows;
pub mod scenarios;

#[cfg(test)]
pub(crate) mod support;
