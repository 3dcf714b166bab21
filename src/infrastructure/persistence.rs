use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

use crate::domain::{
    entities::TopicLog,
    errors::{DomainError, Result},
    repositories::*,
    value_objects::*,
};

/// In-memory implementation of the TopicRepository.
///
/// Backed by a sharded map, so creating a topic only locks the shard that
/// holds its name; traffic on other topics keeps flowing.
pub struct InMemoryTopicRepository {
    topics: DashMap<TopicName, Arc<TopicLog>>,
}

impl InMemoryTopicRepository {
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
        }
    }
}

impl Default for InMemoryTopicRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicRepository for InMemoryTopicRepository {
    fn insert_if_absent(&self, log: TopicLog) -> Result<Arc<TopicLog>> {
        match self.topics.entry(log.name().clone()) {
            Entry::Occupied(entry) => Err(DomainError::TopicAlreadyExists(entry.key().clone())),
            Entry::Vacant(entry) => {
                let log = Arc::new(log);
                entry.insert(Arc::clone(&log));
                Ok(log)
            }
        }
    }

    fn find_by_name(&self, name: &str) -> Option<Arc<TopicLog>> {
        // Clone the Arc out so the shard guard is released before the caller
        // touches the log.
        self.topics.get(name).map(|entry| Arc::clone(entry.value()))
    }

    fn list_names(&self) -> Vec<TopicName> {
        self.topics.iter().map(|entry| entry.key().clone()).collect()
    }

    fn count(&self) -> usize {
        self.topics.len()
    }
}
