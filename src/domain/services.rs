use bytes::Bytes;
use log::{debug, info};
use std::sync::Arc;

use super::{
    entities::*,
    errors::*,
    repositories::*,
    value_objects::*,
};

/// Limits applied to every topic the broker creates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicLimits {
    pub max_name_length: usize,
    pub max_messages: usize,
}

impl Default for TopicLimits {
    fn default() -> Self {
        Self {
            max_name_length: DEFAULT_MAX_TOPIC_NAME_LENGTH,
            max_messages: DEFAULT_MAX_MESSAGES_PER_TOPIC,
        }
    }
}

/// The broker registry: creates topics and routes produce/consume calls to
/// the addressed topic log.
///
/// One instance is built per process and shared by every connection.
pub struct Broker {
    topic_repo: Arc<dyn TopicRepository>,
    limits: TopicLimits,
}

impl Broker {
    pub fn new(topic_repo: Arc<dyn TopicRepository>, limits: TopicLimits) -> Self {
        info!(
            "Initializing broker (max {} messages per topic, names up to {} chars)",
            limits.max_messages, limits.max_name_length
        );
        Self { topic_repo, limits }
    }

    /// Create a new, empty topic
    pub fn create_topic(&self, name: &str) -> Result<()> {
        let topic_name = TopicName::with_max_length(name, self.limits.max_name_length)?;
        debug!("Attempting to create topic: {}", topic_name);

        let log = self
            .topic_repo
            .insert_if_absent(TopicLog::new(topic_name, self.limits.max_messages))?;

        info!(
            "Created new topic: {} (capacity {} messages)",
            log.name(),
            log.max_messages()
        );
        Ok(())
    }

    /// Append a message to a topic and return its offset
    pub fn produce(&self, topic: &str, payload: Bytes, timestamp: i64) -> Result<Offset> {
        let log = self.find(topic)?;
        let size = payload.len();
        let offset = log.produce(payload, timestamp)?;

        debug!(
            "Message of {} bytes stored at offset {} in topic {}",
            size, offset, topic
        );
        Ok(offset)
    }

    /// Read the message at `offset`; `Ok(None)` when nothing is stored there
    pub fn consume(&self, topic: &str, offset: i64) -> Result<Option<Arc<StoredMessage>>> {
        let log = self.find(topic)?;
        let message = log.consume(offset)?;

        match &message {
            Some(_) => debug!("Retrieved message from topic {} at offset {}", topic, offset),
            None => debug!("No message found in topic {} at offset {}", topic, offset),
        }
        Ok(message)
    }

    /// List all topic names
    pub fn topic_names(&self) -> Vec<TopicName> {
        self.topic_repo.list_names()
    }

    pub fn topic_count(&self) -> usize {
        self.topic_repo.count()
    }

    /// Number of messages currently held by a topic
    pub fn topic_len(&self, topic: &str) -> Result<usize> {
        self.find(topic)?.len()
    }

    fn find(&self, topic: &str) -> Result<Arc<TopicLog>> {
        self.topic_repo
            .find_by_name(topic)
            .ok_or_else(|| DomainError::TopicNotFound(topic.to_string()))
    }
}
