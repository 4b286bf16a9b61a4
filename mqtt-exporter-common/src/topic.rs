//! MQTT topic and topic-pattern primitives.
//!
//! Patterns use the MQTT filter syntax with one extension: a single-level
//! wildcard may carry a name, `+name`, which is bound to the matched level.
//!
//! ```
//! use mqtt_exporter_common::topic::{PatternSegment, parse_pattern, to_filter};
//!
//! let pattern = parse_pattern("bitlair/climate/+location/#").unwrap();
//! assert_eq!(pattern[2], PatternSegment::Single("location".to_string()));
//! assert_eq!(to_filter(&pattern), "bitlair/climate/+/#");
//! ```

use crate::error::{Error, Result};

/// Separator between topic levels.
pub const LEVEL_SEPARATOR: char = '/';

/// Single-level wildcard character.
pub const SINGLE_LEVEL: char = '+';

/// Multi-level wildcard character.
pub const MULTI_LEVEL: char = '#';

/// One level of a topic pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PatternSegment {
    /// Matches a topic level with exactly this text.
    Literal(String),
    /// `+name`: matches any single level and binds it to `name`.
    Single(String),
    /// `#`: matches zero or more trailing levels.
    Multi,
}

impl PatternSegment {
    /// Whether this segment is a wildcard.
    pub fn is_wildcard(&self) -> bool {
        !matches!(self, PatternSegment::Literal(_))
    }
}

/// Split a topic into its levels.
pub fn split_topic(topic: &str) -> Vec<&str> {
    topic.split(LEVEL_SEPARATOR).collect()
}

/// Parse a topic pattern into segments.
///
/// Fails when the pattern is empty, when a wildcard character appears inside a
/// level, when `+` carries no name, or when `#` is not the last level.
pub fn parse_pattern(pattern: &str) -> Result<Vec<PatternSegment>> {
    if pattern.is_empty() {
        return Err(Error::topic_filter(pattern, "pattern is empty"));
    }

    let levels = split_topic(pattern);
    let last = levels.len() - 1;
    let mut segments = Vec::with_capacity(levels.len());

    for (i, level) in levels.into_iter().enumerate() {
        let segment = if let Some(name) = level.strip_prefix(SINGLE_LEVEL) {
            if name.is_empty() {
                return Err(Error::topic_filter(
                    pattern,
                    format!("level {} uses '+' without a label name", i),
                ));
            }
            if name.contains([SINGLE_LEVEL, MULTI_LEVEL]) {
                return Err(Error::topic_filter(
                    pattern,
                    format!("level {} has a malformed label name '{}'", i, name),
                ));
            }
            PatternSegment::Single(name.to_string())
        } else if level == "#" {
            if i != last {
                return Err(Error::topic_filter(
                    pattern,
                    "'#' is only allowed as the last level",
                ));
            }
            PatternSegment::Multi
        } else {
            if level.contains([SINGLE_LEVEL, MULTI_LEVEL]) {
                return Err(Error::topic_filter(
                    pattern,
                    format!("level {} mixes wildcard characters into '{}'", i, level),
                ));
            }
            PatternSegment::Literal(level.to_string())
        };
        segments.push(segment);
    }

    Ok(segments)
}

/// Render a pattern as a plain MQTT subscription filter (label names dropped).
pub fn to_filter(segments: &[PatternSegment]) -> String {
    segments
        .iter()
        .map(|s| match s {
            PatternSegment::Literal(text) => text.as_str(),
            PatternSegment::Single(_) => "+",
            PatternSegment::Multi => "#",
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Whether a topic is a system topic (`$SYS/...` and friends).
///
/// Filters starting with a wildcard must not match these.
pub fn is_system_topic(topic: &str) -> bool {
    topic.starts_with('$')
}
