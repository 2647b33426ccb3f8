// src/transport/amqp.rs

//! Broker transport backed by `lapin`.

use std::sync::Arc;

use async_trait::async_trait;
use futures_lite::StreamExt;
use lapin::{
    message::Delivery as LapinDelivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{
    Delivery, DeliveryHandler, Link, LinkEvent, LinkEvents, PublishOptions, PublishReceipt,
    Transport, TransportChannel,
};
use crate::rabbitmq::errors::{RabbitError, Result};

const REPLY_SUCCESS: u16 = 200;

/// Opens real broker connections with `lapin`.
#[derive(Debug, Clone, Default)]
pub struct LapinTransport;

impl LapinTransport {
    pub fn new() -> Self {
        LapinTransport
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn connect(&self, uri: &str) -> Result<(Arc<dyn Link>, LinkEvents)> {
        info!("Attempting to connect to RabbitMQ");
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| RabbitError::ConnectionError(format!("Failed to connect: {}", e)))?;

        let (tx, rx) = mpsc::unbounded_channel();

        // lapin reports a dead connection through its error callback only,
        // so each error is followed by a close notification.
        connection.on_error(move |err| {
            let _ = tx.send(LinkEvent::Error(RabbitError::from(err)));
            let _ = tx.send(LinkEvent::Closed);
        });

        info!("Successfully connected to RabbitMQ");
        Ok((Arc::new(LapinLink { connection }), rx))
    }
}

struct LapinLink {
    connection: Connection,
}

#[async_trait]
impl Link for LapinLink {
    async fn create_confirm_channel(&self) -> Result<Arc<dyn TransportChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| RabbitError::ChannelError(e.to_string()))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| {
                RabbitError::ChannelError(format!("Failed to enable confirm mode: {}", e))
            })?;

        debug!(channel_id = channel.id(), "Confirm channel created");
        Ok(Arc::new(LapinChannel { channel }))
    }

    async fn close(&self) -> Result<()> {
        info!("Closing RabbitMQ connection gracefully");
        self.connection
            .close(REPLY_SUCCESS, "Closing connection")
            .await?;
        Ok(())
    }
}

struct LapinChannel {
    channel: Channel,
}

fn to_delivery(delivery: LapinDelivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        content_type: delivery
            .properties
            .content_type()
            .as_ref()
            .map(|v| v.as_str().to_string()),
        message_id: delivery
            .properties
            .message_id()
            .as_ref()
            .map(|v| v.as_str().to_string()),
        data: delivery.data,
    }
}

#[async_trait]
impl TransportChannel for LapinChannel {
    async fn set_prefetch(&self, count: u16) -> Result<()> {
        debug!("Setting channel QoS to {}", count);
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| RabbitError::ChannelError(format!("Failed to set QoS: {}", e)))
    }

    async fn consume(&self, queue: &str, handler: DeliveryHandler) -> Result<String> {
        let consumer_tag = format!("consumer-{}", Uuid::new_v4());
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitError::ConsumeError(e.to_string()))?;

        info!(queue = %queue, consumer_tag = %consumer_tag, "Started consuming");

        let queue = queue.to_string();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        // Admitted here in stream order; processing runs in its own
                        // task and prefetch bounds the overlap
                        let processing = handler(Some(to_delivery(delivery)));
                        tokio::spawn(processing);
                    }
                    Err(e) => {
                        error!(queue = %queue, "Error receiving message: {}", e);
                        break;
                    }
                }
            }

            debug!(queue = %queue, "Consumer stream ended");
            handler(None).await;
        });

        Ok(consumer_tag)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<PublishReceipt> {
        let mut properties = BasicProperties::default()
            .with_message_id(Uuid::new_v4().to_string().into())
            .with_content_type("application/json".into())
            .with_timestamp(chrono::Utc::now().timestamp() as u64);
        if options.persistent {
            properties = properties.with_delivery_mode(2);
        }

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|e| RabbitError::PublishError(e.to_string()))?;

        Ok(PublishReceipt {
            // lapin buffers internally and never reports a full write buffer
            buffer_full: false,
            confirmation: Box::pin(async move {
                let confirmation = confirm
                    .await
                    .map_err(|e| RabbitError::PublishError(e.to_string()))?;
                if confirmation.is_nack() {
                    return Err(RabbitError::PublishNacked);
                }
                Ok(())
            }),
        })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| RabbitError::AckError(e.to_string()))
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(|e| RabbitError::AckError(e.to_string()))
    }

    async fn close(&self) -> Result<()> {
        self.channel
            .close(REPLY_SUCCESS, "Closing channel")
            .await
            .map_err(|e| RabbitError::ChannelError(e.to_string()))
    }
}
