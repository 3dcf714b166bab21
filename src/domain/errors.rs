use thiserror::Error;

use super::value_objects::*;

pub type Result<T> = std::result::Result<T, DomainError>;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Topic '{0}' not found")]
    TopicNotFound(String),

    #[error("Invalid topic name: {0}")]
    InvalidTopicName(String),

    #[error("Topic '{0}' already exists")]
    TopicAlreadyExists(TopicName),

    #[error("Topic '{topic}' is full ({max_messages} messages)")]
    CapacityExceeded { topic: TopicName, max_messages: usize },

    #[error("Internal error: {0}")]
    Internal(String),
}
