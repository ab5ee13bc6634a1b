//! # Topic Filters
//!
//! MQTT-style filters compiled once into segments: `+` matches exactly one
//! level, a trailing `#` matches the parent level and everything below it.

use crate::BusError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    SingleLevel,
    MultiLevel,
}

/// A compiled topic filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    source: String,
    segments: Vec<Segment>,
}

impl TopicFilter {
    /// Compile `filter`, rejecting misplaced wildcards.
    pub fn new(filter: &str) -> Result<Self, BusError> {
        if filter.is_empty() {
            return Err(BusError::InvalidTopic(filter.to_string()));
        }

        let levels: Vec<&str> = filter.split('/').collect();
        let last = levels.len() - 1;
        let mut segments = Vec::with_capacity(levels.len());

        for (i, level) in levels.into_iter().enumerate() {
            let segment = match level {
                "+" => Segment::SingleLevel,
                "#" if i == last => Segment::MultiLevel,
                _ if level.contains(['+', '#']) => {
                    return Err(BusError::InvalidTopic(filter.to_string()));
                }
                _ => Segment::Literal(level.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self {
            source: filter.to_string(),
            segments,
        })
    }

    /// Whether the concrete `topic` matches.
    pub fn matches(&self, topic: &str) -> bool {
        let mut levels = topic.split('/');

        for segment in &self.segments {
            match segment {
                Segment::MultiLevel => return true,
                Segment::SingleLevel => {
                    if levels.next().is_none() {
                        return false;
                    }
                }
                Segment::Literal(literal) => {
                    if levels.next() != Some(literal.as_str()) {
                        return false;
                    }
                }
            }
        }

        levels.next().is_none()
    }

    /// Filter text.
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(filter: &str, topic: &str) -> bool {
        TopicFilter::new(filter).unwrap().matches(topic)
    }

    #[test]
    fn test_literal() {
        assert!(matches("definition/a/b", "definition/a/b"));
        assert!(!matches("definition/a/b", "definition/a/bc"));
        assert!(!matches("definition/a/b", "definition/a"));
        assert!(!matches("definition/a", "definition/a/b"));
    }

    #[test]
    fn test_single_level() {
        assert!(matches("definition/+/temp", "definition/roof/temp"));
        assert!(matches("definition/+/temp", "definition//temp"));
        assert!(!matches("definition/+/temp", "definition/a/b/temp"));
        assert!(!matches("definition/+", "definition/a/b"));
    }

    #[test]
    fn test_multi_level() {
        assert!(matches("definition/#", "definition/a"));
        assert!(matches("definition/#", "definition/a/b/c"));
        assert!(matches("definition/#", "definition"));
        assert!(!matches("definition/#", "hormone/a"));
        assert!(matches("#", "anything/at/all"));
    }

    #[test]
    fn test_invalid_filters() {
        for filter in ["", "a/#/b", "a/b#", "a+/b", "#/a"] {
            assert!(TopicFilter::new(filter).is_err(), "{filter}");
        }
    }
}
