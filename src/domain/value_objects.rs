use std::fmt;

use super::errors::DomainError;

/// Default upper bound on topic name length, in characters.
pub const DEFAULT_MAX_TOPIC_NAME_LENGTH: usize = 255;

/// Represents a validated topic name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicName(String);

impl TopicName {
    /// Validate a topic name using the default length limit
    pub fn new(name: impl Into<String>) -> Result<Self, DomainError> {
        Self::with_max_length(name, DEFAULT_MAX_TOPIC_NAME_LENGTH)
    }

    /// Validate a topic name: non-empty, at most `max_length` characters,
    /// drawn only from `[A-Za-z0-9._-]`.
    pub fn with_max_length(name: impl Into<String>, max_length: usize) -> Result<Self, DomainError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DomainError::InvalidTopicName(
                "Topic name cannot be empty".to_string(),
            ));
        }
        if name.chars().count() > max_length {
            return Err(DomainError::InvalidTopicName(format!(
                "Topic name too long (max {} characters)",
                max_length
            )));
        }
        if let Some(bad) = name.chars().find(|c| !is_topic_char(*c)) {
            return Err(DomainError::InvalidTopicName(format!(
                "Topic name contains illegal character {:?}",
                bad
            )));
        }
        Ok(TopicName(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_topic_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for TopicName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for TopicName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Represents a message offset within a topic log
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Offset(pub u64);

impl Offset {
    pub fn new(value: u64) -> Self {
        Offset(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
