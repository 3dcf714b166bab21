//! # mega-broker
//!
//! A minimal, in-memory message broker. Clients create named topics, append
//! messages to them and read them back by offset over a persistent TCP
//! connection speaking a small length-prefixed binary protocol.
//!
//! ## Architecture
//!
//! - **Domain Layer**: topic logs, the broker registry and their errors
//! - **Infrastructure Layer**: the wire codec, the connection engine and TCP
//!   server, the in-memory topic directory and a client
//!
//! ## Usage
//!
//! ```rust
//! use mega_broker::{Broker, InMemoryTopicRepository, TopicLimits};
//! use std::sync::Arc;
//!
//! let broker = Broker::new(Arc::new(InMemoryTopicRepository::new()), TopicLimits::default());
//! broker.create_topic("orders")?;
//!
//! let offset = broker.produce("orders", "hello".into(), 1000)?;
//! assert_eq!(offset.value(), 0);
//!
//! let message = broker.consume("orders", 0)?.expect("message at offset 0");
//! assert_eq!(&message.payload[..], b"hello");
//! assert!(broker.consume("orders", 1)?.is_none());
//! # Ok::<(), mega_broker::DomainError>(())
//! ```

pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types for convenience
pub use config::{BrokerConfig, ConfigError};
pub use domain::entities::{StoredMessage, TopicLog};
pub use domain::errors::DomainError;
pub use domain::services::{Broker, TopicLimits};
pub use domain::value_objects::{Offset, TopicName};
pub use infrastructure::client::{BrokerClient, ClientError};
pub use infrastructure::persistence::InMemoryTopicRepository;
pub use infrastructure::protocol::{ErrorCode, MessageType, RequestFrame, Response};
pub use infrastructure::server::{BrokerServer, ConnectionHandler, ConnectionSettings};
