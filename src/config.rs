//! Broker configuration.
//!
//! Values come from defaults, optionally overlaid by a TOML file, and are
//! finally overridden by command-line flags in the binary.

use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::domain::{
    entities::{DEFAULT_MAX_MESSAGES_PER_TOPIC, MAX_MESSAGES_PER_TOPIC}, services::TopicLimits,
    value_objects::DEFAULT_MAX_TOPIC_NAME_LENGTH,
};
use crate::infrastructure::{protocol::DEFAULT_MAX_MESSAGE_BYTES, server::ConnectionSettings};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Maximum number of connections served at once.
    pub worker_pool_size: usize,
    pub idle_timeout_secs: u64,
    pub max_message_bytes: usize,
    pub max_messages_per_topic: usize,
    pub max_topic_name_length: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            worker_pool_size: 10,
            idle_timeout_secs: 30,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            max_messages_per_topic: DEFAULT_MAX_MESSAGES_PER_TOPIC,
            max_topic_name_length: DEFAULT_MAX_TOPIC_NAME_LENGTH,
        }
    }
}

impl BrokerConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Reject settings the broker cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_pool_size == 0 {
            return Err(ConfigError::Invalid(
                "worker_pool_size must be at least 1".to_string(),
            ));
        }
        if self.idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "idle_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.max_message_bytes == 0 || self.max_message_bytes > i32::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "max_message_bytes must be between 1 and {}",
                i32::MAX
            )));
        }
        if self.max_messages_per_topic == 0 || self.max_messages_per_topic > MAX_MESSAGES_PER_TOPIC {
            return Err(ConfigError::Invalid(format!(
                "max_messages_per_topic must be between 1 and {}",
                MAX_MESSAGES_PER_TOPIC
            )));
        }
        if self.max_topic_name_length == 0 {
            return Err(ConfigError::Invalid(
                "max_topic_name_length must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn topic_limits(&self) -> TopicLimits {
        TopicLimits {
            max_name_length: self.max_topic_name_length,
            max_messages: self.max_messages_per_topic,
        }
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            idle_timeout: self.idle_timeout(),
            max_message_bytes: self.max_message_bytes,
        }
    }
}
