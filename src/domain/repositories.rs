use std::sync::Arc;

use super::{entities::TopicLog, errors::Result, value_objects::TopicName};

/// Storage for the topic directory.
///
/// Implementations must make `insert_if_absent` atomic per name: of any
/// number of concurrent inserts for one name, exactly one succeeds.
pub trait TopicRepository: Send + Sync {
    /// Register `log` under its name, failing with `TopicAlreadyExists` if the
    /// name is taken. The existing log is left untouched in that case.
    fn insert_if_absent(&self, log: TopicLog) -> Result<Arc<TopicLog>>;

    fn find_by_name(&self, name: &str) -> Option<Arc<TopicLog>>;

    fn list_names(&self) -> Vec<TopicName>;

    fn count(&self) -> usize;
}
