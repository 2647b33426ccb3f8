use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rabbit_keeper::transport::LapinTransport;
use rabbit_keeper::{env, Connection, Consumer, Delivery, Publisher, RabbitError};

#[derive(Debug, Serialize, Deserialize)]
struct Heartbeat {
    sequence: u64,
    sent_at: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = env::load()?;
    info!(uri = %config.connection.uri, queue = %config.consumer.queue, "Starting rabbit-keeper");

    let connection = Connection::new(Arc::new(LapinTransport::new()), config.connection_options());
    connection.on_reconnected(|_connection| async {
        info!("Connection re-established");
    });
    connection.on_reconnect_exhausted(|| async {
        error!("Giving up on the broker connection");
    });

    let consumer: Consumer<Heartbeat> = Consumer::new(connection.clone(), config.consumer_options());
    consumer
        .consume(|heartbeat: Heartbeat, delivery: Delivery| async move {
            info!(
                sequence = heartbeat.sequence,
                sent_at = %heartbeat.sent_at,
                delivery_tag = delivery.delivery_tag,
                "Received heartbeat"
            );
            Ok(true)
        })
        .await?;

    let publisher: Publisher<Heartbeat> = Publisher::new(connection.clone(), config.publisher_options());
    // The queue name doubles as the routing key; bind it to the exchange beforehand
    let routing_key = config.consumer.queue.clone();
    let producer = publisher.clone();
    let publishing = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        let mut sequence = 0;
        loop {
            ticker.tick().await;
            sequence += 1;
            let heartbeat = Heartbeat {
                sequence,
                sent_at: Utc::now().to_rfc3339(),
            };
            match producer.publish(&routing_key, &heartbeat).await {
                Ok(()) => info!(sequence, "Published heartbeat"),
                Err(err @ (RabbitError::PublisherStopping | RabbitError::PublisherStopped)) => {
                    info!(error = %err, "Publisher stopping");
                    break;
                }
                Err(err) => warn!(sequence, error = %err, "Failed to publish heartbeat"),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    publisher.stop(false).await?;
    publishing.abort();
    consumer.stop(true).await?;

    info!("Stopped");
    Ok(())
}
