// src/transport/memory.rs

//! In-process broker used to exercise the supervisor without RabbitMQ.
//!
//! `MemoryTransport` is cheap to clone; every clone drives the same fake
//! broker. Besides the transport traits it exposes knobs to inject failures
//! (refused connects, dropped links, held or negative confirmations, full
//! write buffers) and accessors to inspect what the supervisor did (acks,
//! nacks, published messages, closed channels).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::{
    Delivery, DeliveryHandler, Link, LinkEvent, LinkEvents, PublishOptions, PublishReceipt,
    Transport, TransportChannel,
};
use crate::rabbitmq::errors::{RabbitError, Result};

/// How a consumed message was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack { delivery_tag: u64 },
    Nack { delivery_tag: u64, multiple: bool, requeue: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub persistent: bool,
    pub channel_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ConfirmMode {
    #[default]
    Ack,
    Nack,
    Hold,
}

struct LinkSlot {
    events: mpsc::UnboundedSender<LinkEvent>,
    alive: bool,
}

struct ChannelSlot {
    link_id: u64,
    open: bool,
}

struct ConsumerSlot {
    channel_id: u64,
    queue: String,
    handler: DeliveryHandler,
}

#[derive(Default)]
struct Broker {
    connect_attempts: usize,
    failing_connects: usize,
    refuse_connects: bool,
    connect_delay: Option<Duration>,
    fail_link_close: bool,
    link_closes: usize,
    next_link_id: u64,
    links: HashMap<u64, LinkSlot>,
    current_link: Option<u64>,
    next_channel_id: u64,
    channels: HashMap<u64, ChannelSlot>,
    channel_closes: usize,
    prefetch: Vec<u16>,
    consumers: Vec<ConsumerSlot>,
    next_delivery_tag: u64,
    settlements: Vec<Settlement>,
    published: Vec<PublishedMessage>,
    confirm_mode: ConfirmMode,
    buffer_full: bool,
    fail_publishes: bool,
    held_confirms: Vec<oneshot::Sender<Result<()>>>,
}

impl Broker {
    fn kill_link(&mut self, link_id: u64) {
        if let Some(slot) = self.links.get_mut(&link_id) {
            slot.alive = false;
        }
        let mut dead = Vec::new();
        for (id, channel) in self.channels.iter_mut() {
            if channel.link_id == link_id && channel.open {
                channel.open = false;
                dead.push(*id);
            }
        }
        self.consumers.retain(|c| !dead.contains(&c.channel_id));
        if self.current_link == Some(link_id) {
            self.current_link = self
                .links
                .iter()
                .filter(|(_, slot)| slot.alive)
                .map(|(id, _)| *id)
                .max();
        }
    }

    fn channel_open(&self, channel_id: u64) -> Result<()> {
        match self.channels.get(&channel_id) {
            Some(channel) if channel.open => Ok(()),
            _ => Err(RabbitError::ChannelError(format!(
                "channel {} is closed",
                channel_id
            ))),
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryTransport {
    broker: Arc<Mutex<Broker>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn broker(&self) -> MutexGuard<'_, Broker> {
        self.broker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refuse the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: usize) {
        self.broker().failing_connects = count;
    }

    /// Refuse every connection attempt until switched off again.
    pub fn refuse_connects(&self, refuse: bool) {
        self.broker().refuse_connects = refuse;
    }

    /// Make every connection attempt take `delay` before it completes.
    pub fn delay_connects(&self, delay: Duration) {
        self.broker().connect_delay = Some(delay);
    }

    pub fn connect_attempts(&self) -> usize {
        self.broker().connect_attempts
    }

    pub fn is_link_alive(&self) -> bool {
        self.broker().current_link.is_some()
    }

    /// Links opened and not yet closed or dropped.
    pub fn live_links(&self) -> usize {
        self.broker().links.values().filter(|l| l.alive).count()
    }

    /// Simulate the broker dropping the current link. Returns false if no link was live.
    pub fn drop_link(&self) -> bool {
        let mut broker = self.broker();
        let Some(link_id) = broker.current_link else {
            return false;
        };
        broker.kill_link(link_id);
        if let Some(slot) = broker.links.get(&link_id) {
            let _ = slot.events.send(LinkEvent::Closed);
        }
        debug!(link_id, "Memory broker dropped link");
        true
    }

    /// Raise a non-fatal error on the current link.
    pub fn raise_link_error(&self, message: &str) -> bool {
        let broker = self.broker();
        let Some(slot) = broker.current_link.and_then(|id| broker.links.get(&id)) else {
            return false;
        };
        slot.events
            .send(LinkEvent::Error(RabbitError::ConnectionError(message.to_string())))
            .is_ok()
    }

    pub fn fail_link_close(&self, fail: bool) {
        self.broker().fail_link_close = fail;
    }

    pub fn link_closes(&self) -> usize {
        self.broker().link_closes
    }

    pub fn open_channels(&self) -> usize {
        self.broker().channels.values().filter(|c| c.open).count()
    }

    pub fn channel_closes(&self) -> usize {
        self.broker().channel_closes
    }

    /// Prefetch values applied to channels, in order.
    pub fn prefetch_values(&self) -> Vec<u16> {
        self.broker().prefetch.clone()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.broker()
            .consumers
            .iter()
            .filter(|c| c.queue == queue)
            .count()
    }

    /// Push a message to the first live consumer of `queue` and wait for its
    /// handler to return. Returns the delivery tag, or `None` without a consumer.
    pub async fn deliver(&self, queue: &str, payload: impl Into<Vec<u8>>) -> Option<u64> {
        let (handler, delivery) = {
            let mut broker = self.broker();
            let handler = broker
                .consumers
                .iter()
                .find(|c| c.queue == queue)
                .map(|c| c.handler.clone())?;
            broker.next_delivery_tag += 1;
            let delivery = Delivery {
                delivery_tag: broker.next_delivery_tag,
                exchange: String::new(),
                routing_key: queue.to_string(),
                redelivered: false,
                content_type: Some("application/json".to_string()),
                message_id: None,
                data: payload.into(),
            };
            (handler, delivery)
        };

        let tag = delivery.delivery_tag;
        handler(Some(delivery)).await;
        Some(tag)
    }

    /// Cancel every consumer of `queue`, sending each a cancellation notification.
    pub async fn cancel_consumers(&self, queue: &str) -> usize {
        let handlers: Vec<DeliveryHandler> = {
            let mut broker = self.broker();
            let (cancelled, kept): (Vec<_>, Vec<_>) = broker
                .consumers
                .drain(..)
                .partition(|c| c.queue == queue);
            broker.consumers = kept;
            cancelled.into_iter().map(|c| c.handler).collect()
        };

        for handler in &handlers {
            handler(None).await;
        }
        handlers.len()
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.broker().settlements.clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.broker().published.clone()
    }

    /// Keep confirmations pending until [`release_confirms`](Self::release_confirms).
    pub fn hold_confirms(&self, hold: bool) {
        let mut broker = self.broker();
        broker.confirm_mode = if hold { ConfirmMode::Hold } else { ConfirmMode::Ack };
    }

    /// Make the broker reject every published message.
    pub fn nack_confirms(&self, nack: bool) {
        let mut broker = self.broker();
        broker.confirm_mode = if nack { ConfirmMode::Nack } else { ConfirmMode::Ack };
    }

    /// Confirm every held message. Returns how many were released.
    pub fn release_confirms(&self) -> usize {
        let held: Vec<_> = self.broker().held_confirms.drain(..).collect();
        let count = held.len();
        for tx in held {
            let _ = tx.send(Ok(()));
        }
        count
    }

    pub fn pending_confirms(&self) -> usize {
        self.broker().held_confirms.len()
    }

    pub fn set_buffer_full(&self, full: bool) {
        self.broker().buffer_full = full;
    }

    /// Make channel writes fail synchronously.
    pub fn fail_publishes(&self, fail: bool) {
        self.broker().fail_publishes = fail;
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, uri: &str) -> Result<(Arc<dyn Link>, LinkEvents)> {
        let delay = {
            let mut broker = self.broker();
            broker.connect_attempts += 1;
            broker.connect_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut broker = self.broker();

        if broker.refuse_connects || broker.failing_connects > 0 {
            broker.failing_connects = broker.failing_connects.saturating_sub(1);
            return Err(RabbitError::ConnectionError(format!(
                "connection refused: {}",
                uri
            )));
        }

        broker.next_link_id += 1;
        let link_id = broker.next_link_id;
        let (tx, rx) = mpsc::unbounded_channel();
        broker.links.insert(link_id, LinkSlot { events: tx, alive: true });
        broker.current_link = Some(link_id);

        let link = MemoryLink {
            id: link_id,
            transport: self.clone(),
        };
        Ok((Arc::new(link), rx))
    }
}

struct MemoryLink {
    id: u64,
    transport: MemoryTransport,
}

#[async_trait]
impl Link for MemoryLink {
    async fn create_confirm_channel(&self) -> Result<Arc<dyn TransportChannel>> {
        let mut broker = self.transport.broker();
        let alive = broker.links.get(&self.id).map_or(false, |l| l.alive);
        if !alive {
            return Err(RabbitError::ConnectionError("link is closed".to_string()));
        }

        broker.next_channel_id += 1;
        let id = broker.next_channel_id;
        broker.channels.insert(
            id,
            ChannelSlot {
                link_id: self.id,
                open: true,
            },
        );

        Ok(Arc::new(MemoryChannel {
            id,
            transport: self.transport.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        let mut broker = self.transport.broker();
        broker.link_closes += 1;
        if broker.fail_link_close {
            return Err(RabbitError::ConnectionError("close failed".to_string()));
        }

        broker.kill_link(self.id);
        if let Some(slot) = broker.links.get(&self.id) {
            let _ = slot.events.send(LinkEvent::Closed);
        }
        Ok(())
    }
}

struct MemoryChannel {
    id: u64,
    transport: MemoryTransport,
}

#[async_trait]
impl TransportChannel for MemoryChannel {
    async fn set_prefetch(&self, count: u16) -> Result<()> {
        let mut broker = self.transport.broker();
        broker.channel_open(self.id)?;
        broker.prefetch.push(count);
        Ok(())
    }

    async fn consume(&self, queue: &str, handler: DeliveryHandler) -> Result<String> {
        let mut broker = self.transport.broker();
        broker.channel_open(self.id)?;
        broker.consumers.push(ConsumerSlot {
            channel_id: self.id,
            queue: queue.to_string(),
            handler,
        });
        Ok(format!("memory-consumer-{}", self.id))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<PublishReceipt> {
        let mut broker = self.transport.broker();
        broker.channel_open(self.id)?;
        if broker.fail_publishes {
            return Err(RabbitError::PublishError("write failed".to_string()));
        }

        broker.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload,
            persistent: options.persistent,
            channel_id: self.id,
        });

        let buffer_full = broker.buffer_full;
        let confirmation: futures::future::BoxFuture<'static, Result<()>> = match broker.confirm_mode {
            ConfirmMode::Ack => Box::pin(async { Ok(()) }),
            ConfirmMode::Nack => Box::pin(async { Err(RabbitError::PublishNacked) }),
            ConfirmMode::Hold => {
                let (tx, rx) = oneshot::channel();
                broker.held_confirms.push(tx);
                Box::pin(async move {
                    rx.await.unwrap_or_else(|_| {
                        Err(RabbitError::ChannelError("confirmation dropped".to_string()))
                    })
                })
            }
        };

        Ok(PublishReceipt {
            buffer_full,
            confirmation,
        })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        let mut broker = self.transport.broker();
        broker.channel_open(self.id)?;
        broker.settlements.push(Settlement::Ack { delivery_tag });
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        let mut broker = self.transport.broker();
        broker.channel_open(self.id)?;
        broker.settlements.push(Settlement::Nack {
            delivery_tag,
            multiple,
            requeue,
        });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut broker = self.transport.broker();
        broker.channel_open(self.id)?;
        if let Some(channel) = broker.channels.get_mut(&self.id) {
            channel.open = false;
        }
        broker.channel_closes += 1;
        let id = self.id;
        broker.consumers.retain(|c| c.channel_id != id);
        Ok(())
    }
}
