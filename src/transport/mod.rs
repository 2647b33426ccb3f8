// src/transport/mod.rs

//! Transport abstractions.
//!
//! The supervisor never speaks AMQP itself. It drives a broker through the
//! three traits in this module:
//!
//! - [`Transport`] opens a physical connection ([`Link`]) to a broker and hands
//!   back a receiver of low-level link notifications.
//! - [`Link`] yields confirm-mode channels and can be closed.
//! - [`TransportChannel`] performs prefetch, consume, publish, ack/nack, close.
//!
//! Two implementations ship with the crate: [`LapinTransport`] talks to a real
//! broker, [`MemoryTransport`] is an in-process fake used by tests.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::rabbitmq::errors::{RabbitError, Result};

mod amqp;
mod memory;

pub use amqp::LapinTransport;
pub use memory::{MemoryTransport, PublishedMessage, Settlement};

/// Low-level notification raised by a live link.
#[derive(Debug)]
pub enum LinkEvent {
    /// Non-fatal error reported by the link.
    Error(RabbitError),
    /// The link went away, requested or not.
    Closed,
}

/// Receiving side of a link's notifications. Dropping it detaches the handlers.
pub type LinkEvents = mpsc::UnboundedReceiver<LinkEvent>;

/// A raw message handed over by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub data: Vec<u8>,
}

/// Callback invoked for each delivery on a consumed queue.
///
/// `None` is a cancellation notification sent by the broker when the consumer
/// is cancelled. Calling the handler admits the delivery; the returned future
/// does the processing. Transports call it in delivery order and may run the
/// returned futures concurrently.
pub type DeliveryHandler = Arc<dyn Fn(Option<Delivery>) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Ask the broker to persist the message (delivery mode 2).
    pub persistent: bool,
}

/// Result of handing a message to a channel.
pub struct PublishReceipt {
    /// The channel accepted the write but its buffer is now full.
    pub buffer_full: bool,
    /// Settles once the broker confirms (or rejects) the message.
    pub confirmation: BoxFuture<'static, Result<()>>,
}

impl std::fmt::Debug for PublishReceipt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishReceipt")
            .field("buffer_full", &self.buffer_full)
            .finish_non_exhaustive()
    }
}

/// Opens physical connections to a broker.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<(Arc<dyn Link>, LinkEvents)>;
}

/// A live connection to the broker.
#[async_trait]
pub trait Link: Send + Sync {
    /// Open a new channel with publisher confirms enabled.
    async fn create_confirm_channel(&self) -> Result<Arc<dyn TransportChannel>>;

    async fn close(&self) -> Result<()>;
}

/// A virtual sub-connection over which messages flow.
#[async_trait]
pub trait TransportChannel: Send + Sync {
    /// Limit the number of unacknowledged deliveries held by this channel.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Start consuming `queue` with manual acknowledgement. Returns the consumer tag.
    async fn consume(&self, queue: &str, handler: DeliveryHandler) -> Result<String>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<PublishReceipt>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
