//! Resilient RabbitMQ connection supervisor.
//!
//! [`Connection`] keeps one logical broker connection alive and reconnects it
//! when the link drops. [`Consumer`] and [`Publisher`] borrow channels from it,
//! rebind after every reconnect and drain in-flight work before they stop.
//!
//! The broker itself is reached through the [`transport`] traits; use
//! [`transport::LapinTransport`] against RabbitMQ and
//! [`transport::MemoryTransport`] in tests.

pub mod config;
pub mod env;
pub mod rabbitmq;
pub mod transport;

pub use rabbitmq::{
    Connection, ConnectionEvent, ConnectionOptions, Consumer, ConsumerOptions, EventKind,
    ExponentialBackoff, FixedDelay, ListenerId, Publisher, PublisherOptions, RabbitError,
    ReconnectStrategy, Result, DEFAULT_STOP_TIMEOUT,
};
pub use transport::Delivery;
