use bytes::Bytes;
use std::sync::{Arc, RwLock};

use super::errors::{DomainError, Result};
use super::value_objects::*;

/// Default maximum number of messages a single topic log may hold
pub const DEFAULT_MAX_MESSAGES_PER_TOPIC: usize = 1_000_000;

/// Upper bound on any topic's capacity. Offsets travel as int32, so a log
/// never hands out an offset above `i32::MAX - 1`.
pub const MAX_MESSAGES_PER_TOPIC: usize = i32::MAX as usize;

/// A message as stored in a topic log. Immutable once appended; its offset
/// is its position in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub topic: TopicName,
    pub payload: Bytes,
    /// Producer-supplied, carried through untouched.
    pub timestamp: i64,
}

impl StoredMessage {
    pub fn new(topic: TopicName, payload: Bytes, timestamp: i64) -> Self {
        Self {
            topic,
            payload,
            timestamp,
        }
    }
}

/// An append-only, offset-addressed sequence of messages for one topic.
///
/// Offsets are slot indices: appends happen under the write lock, so the
/// offset handed out is always the current length and no gaps can appear.
/// Readers only take the read lock and clone an `Arc` out of the slot, so a
/// consumer sees either a fully appended message or nothing.
#[derive(Debug)]
pub struct TopicLog {
    name: TopicName,
    messages: RwLock<Vec<Arc<StoredMessage>>>,
    max_messages: usize,
}

impl TopicLog {
    /// Create an empty log holding at most `max_messages` messages, capped
    /// at [`MAX_MESSAGES_PER_TOPIC`]
    pub fn new(name: TopicName, max_messages: usize) -> Self {
        Self {
            name,
            messages: RwLock::new(Vec::new()),
            max_messages: max_messages.min(MAX_MESSAGES_PER_TOPIC),
        }
    }

    pub fn name(&self) -> &TopicName {
        &self.name
    }

    pub fn max_messages(&self) -> usize {
        self.max_messages
    }

    /// Append a message and return the offset it was stored at
    pub fn produce(&self, payload: Bytes, timestamp: i64) -> Result<Offset> {
        let mut messages = self
            .messages
            .write()
            .map_err(|_| DomainError::Internal(format!("log for '{}' is poisoned", self.name)))?;

        if messages.len() >= self.max_messages {
            return Err(DomainError::CapacityExceeded {
                topic: self.name.clone(),
                max_messages: self.max_messages,
            });
        }

        let offset = Offset::new(messages.len() as u64);
        messages.push(Arc::new(StoredMessage::new(
            self.name.clone(),
            payload,
            timestamp,
        )));
        Ok(offset)
    }

    /// Look up the message stored at exactly `offset`.
    ///
    /// Returns `Ok(None)` for negative offsets and offsets at or past the end.
    pub fn consume(&self, offset: i64) -> Result<Option<Arc<StoredMessage>>> {
        let Ok(index) = usize::try_from(offset) else {
            return Ok(None);
        };
        let messages = self
            .messages
            .read()
            .map_err(|_| DomainError::Internal(format!("log for '{}' is poisoned", self.name)))?;
        Ok(messages.get(index).cloned())
    }

    /// Number of messages appended so far, which is also the next offset
    pub fn len(&self) -> Result<usize> {
        let messages = self
            .messages
            .read()
            .map_err(|_| DomainError::Internal(format!("log for '{}' is poisoned", self.name)))?;
        Ok(messages.len())
    }

    /// The offset the next successful produce will be assigned
    pub fn next_offset(&self) -> Result<Offset> {
        Ok(Offset::new(self.len()? as u64))
    }
}
