// src/rabbitmq/mod.rs
// Connection supervision and message flow on top of a broker transport

pub mod errors;
pub mod connection;
pub mod consumer;
pub mod events;
pub mod in_flight;
pub mod publisher;
pub mod reconnect;

// Re-export specific items to simplify imports elsewhere
pub use connection::{Connection, ConnectionOptions};
pub use consumer::{Consumer, ConsumerOptions, ExceptionHandler};
pub use errors::{RabbitError, Result};
pub use events::{ConnectionEvent, EventKind, Listener, ListenerId};
pub use in_flight::DEFAULT_STOP_TIMEOUT;
pub use publisher::{Publisher, PublisherOptions};
pub use reconnect::{ExponentialBackoff, FixedDelay, ReconnectStrategy};
