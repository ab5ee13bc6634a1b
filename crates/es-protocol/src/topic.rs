//! # Topic Namespace
//!
//! Every stream `<name>` owns two retained topics:
//! `definition/<name>` and `hormone/<name>`.

use crate::ProtocolError;

/// Prefix of definition topics.
pub const DEFINITION_PREFIX: &str = "definition/";

/// Prefix of hormone topics.
pub const HORMONE_PREFIX: &str = "hormone/";

/// Check a stream name: non-empty, no leading `/` or `$`, no trailing `/`,
/// no wildcard characters.
pub fn validate_name(name: &str) -> Result<(), ProtocolError> {
    let reason = if name.is_empty() {
        "must not be empty"
    } else if name.starts_with('/') || name.ends_with('/') {
        "must not start or end with '/'"
    } else if name.starts_with('$') {
        "must not start with '$'"
    } else if name.contains(['+', '#']) {
        "must not contain '+' or '#'"
    } else {
        return Ok(());
    };
    Err(ProtocolError::InvalidName(format!("{name:?} {reason}")))
}

/// `definition/<name>`
pub fn definition_topic(name: &str) -> String {
    format!("{DEFINITION_PREFIX}{name}")
}

/// `hormone/<name>`
pub fn hormone_topic(name: &str) -> String {
    format!("{HORMONE_PREFIX}{name}")
}

/// Normalize a receptor filter: non-empty, no leading `/`; a trailing `/`
/// selects everything below it.
pub fn receptor_filter(filter: &str) -> Result<String, ProtocolError> {
    if filter.is_empty() || filter.starts_with('/') {
        return Err(ProtocolError::InvalidName(format!(
            "{filter:?} is not a valid filter"
        )));
    }
    if filter.ends_with('/') {
        Ok(format!("{filter}#"))
    } else {
        Ok(filter.to_string())
    }
}

/// Stream name of a definition topic.
pub fn definition_name(topic: &str) -> Result<&str, ProtocolError> {
    topic
        .strip_prefix(DEFINITION_PREFIX)
        .ok_or_else(|| ProtocolError::UnexpectedTopic(topic.to_string()))
}

/// Stream name of a hormone topic.
pub fn hormone_name(topic: &str) -> Result<&str, ProtocolError> {
    topic
        .strip_prefix(HORMONE_PREFIX)
        .ok_or_else(|| ProtocolError::UnexpectedTopic(topic.to_string()))
}
