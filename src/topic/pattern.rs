//! Topic patterns
//!
//! Topics are `/`-separated levels. A subscription pattern may use:
//! - `*` as a whole level: matches exactly one level
//! - `abc*` as a level: matches one level starting with `abc`
//! - `>` as the last level: matches one or more remaining levels
//!
//! Published topics are always literal; wildcard characters in them carry no
//! meaning.

use std::fmt;
use std::str::FromStr;

use crate::utils::error::TopicError;

pub const MAX_TOPIC_LEN: usize = 250;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Level {
    Literal(String),
    Prefix(String),
    One,
    Rest,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPattern {
    raw: String,
    levels: Vec<Level>,
}

fn check_shape(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(TopicError::TooLong(topic.to_string()));
    }
    if topic.split('/').any(str::is_empty) {
        return Err(TopicError::EmptyLevel(topic.to_string()));
    }
    Ok(())
}

/// Validates a topic used as a publish destination.
pub fn validate_publish_topic(topic: &str) -> Result<(), TopicError> {
    check_shape(topic)
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Result<Self, TopicError> {
        check_shape(pattern)?;

        let parts: Vec<&str> = pattern.split('/').collect();
        let last = parts.len() - 1;
        let mut levels = Vec::with_capacity(parts.len());
        for (i, part) in parts.into_iter().enumerate() {
            let level = match part {
                ">" if i == last => Level::Rest,
                ">" => return Err(TopicError::MisplacedWildcard(pattern.to_string())),
                "*" => Level::One,
                p if p.ends_with('*') => Level::Prefix(p[..p.len() - 1].to_string()),
                p => Level::Literal(p.to_string()),
            };
            levels.push(level);
        }

        Ok(Self {
            raw: pattern.to_string(),
            levels,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_wildcard(&self) -> bool {
        self.levels
            .iter()
            .any(|l| !matches!(l, Level::Literal(_)))
    }

    /// Returns true when `topic` is matched by this pattern.
    pub fn matches(&self, topic: &str) -> bool {
        let mut parts = topic.split('/');
        for level in &self.levels {
            match level {
                Level::Rest => return parts.next().is_some(),
                Level::One => {
                    if parts.next().is_none() {
                        return false;
                    }
                }
                Level::Prefix(prefix) => match parts.next() {
                    Some(part) if part.starts_with(prefix.as_str()) => {}
                    _ => return false,
                },
                Level::Literal(literal) => match parts.next() {
                    Some(part) if part == literal => {}
                    _ => return false,
                },
            }
        }
        parts.next().is_none()
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for TopicPattern {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
