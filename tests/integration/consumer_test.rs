// Consumer processing, reconnect and graceful stop against the in-memory broker.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use serde::Deserialize;
use tokio::time::Instant;

use common::{memory_connection, wait_until};
use rabbit_keeper::transport::{MemoryTransport, Settlement};
use rabbit_keeper::{Consumer, ConsumerOptions, Delivery, RabbitError, DEFAULT_STOP_TIMEOUT};

const QUEUE: &str = "jobs";

#[derive(Debug, Deserialize)]
struct Job {
    outcome: String,
    #[serde(default)]
    work_ms: u64,
}

fn job(outcome: &str, work_ms: u64) -> Vec<u8> {
    format!(r#"{{"outcome":"{}","work_ms":{}}}"#, outcome, work_ms).into_bytes()
}

/// Ack, nack or fail according to the job, after sleeping `work_ms`.
/// `hang` never finishes.
async fn run_job(job: Job) -> anyhow::Result<bool> {
    if job.work_ms > 0 {
        tokio::time::sleep(Duration::from_millis(job.work_ms)).await;
    }
    match job.outcome.as_str() {
        "ack" => Ok(true),
        "nack" => Ok(false),
        "hang" => {
            futures::future::pending::<()>().await;
            Ok(true)
        }
        other => Err(anyhow!("job failed: {}", other)),
    }
}

fn start_delivery(transport: &MemoryTransport, payload: Vec<u8>) -> tokio::task::JoinHandle<Option<u64>> {
    let transport = transport.clone();
    tokio::spawn(async move { transport.deliver(QUEUE, payload).await })
}

#[tokio::test(start_paused = true)]
async fn test_outcomes_settle_each_message_once() {
    let transport = MemoryTransport::new();
    let connection = memory_connection(&transport, 3);

    let handled = Arc::new(AtomicUsize::new(0));
    let counter = handled.clone();
    let options = ConsumerOptions::new(QUEUE)
        .with_prefetch(1)
        .with_exception_handler(move |_delivery: Delivery, _err: anyhow::Error| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {}
        });
    let consumer: Consumer<Job> = Consumer::new(connection, options);
    consumer
        .consume(|job: Job, _delivery: Delivery| run_job(job))
        .await
        .unwrap();

    assert_eq!(transport.deliver(QUEUE, job("ack", 0)).await, Some(1));
    assert_eq!(transport.deliver(QUEUE, job("nack", 0)).await, Some(2));
    assert_eq!(transport.deliver(QUEUE, job("boom", 0)).await, Some(3));

    assert_eq!(transport.prefetch_values(), vec![1]);
    assert_eq!(
        transport.settlements(),
        vec![
            Settlement::Ack { delivery_tag: 1 },
            Settlement::Nack { delivery_tag: 2, multiple: false, requeue: false },
            Settlement::Nack { delivery_tag: 3, multiple: false, requeue: false },
        ]
    );
    assert_eq!(handled.load(Ordering::SeqCst), 1);
    assert_eq!(consumer.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_returns_to_zero_for_concurrent_work() {
    let transport = MemoryTransport::new();
    let consumer: Consumer<Job> =
        Consumer::new(memory_connection(&transport, 3), ConsumerOptions::new(QUEUE));
    consumer
        .consume(|job: Job, _delivery: Delivery| run_job(job))
        .await
        .unwrap();

    let deliveries = vec![
        start_delivery(&transport, job("ack", 300)),
        start_delivery(&transport, job("nack", 200)),
        start_delivery(&transport, job("boom", 100)),
    ];
    assert!(wait_until(|| consumer.in_flight() == 3).await);

    for delivery in deliveries {
        assert!(delivery.await.unwrap().is_some());
    }
    assert_eq!(consumer.in_flight(), 0);
    assert_eq!(transport.settlements().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_consumption_resumes_after_reconnect() {
    let transport = MemoryTransport::new();
    let consumer: Consumer<Job> =
        Consumer::new(memory_connection(&transport, 3), ConsumerOptions::new(QUEUE).with_prefetch(5));
    consumer
        .consume(|job: Job, _delivery: Delivery| run_job(job))
        .await
        .unwrap();
    assert!(consumer.is_consuming());

    assert!(transport.drop_link());
    assert_eq!(transport.consumer_count(QUEUE), 0);
    assert!(wait_until(|| consumer.is_consuming() && transport.consumer_count(QUEUE) == 1).await);

    assert!(transport.deliver(QUEUE, job("ack", 0)).await.is_some());
    assert_eq!(transport.settlements(), vec![Settlement::Ack { delivery_tag: 1 }]);
    assert_eq!(transport.prefetch_values(), vec![5, 5]);
}

#[tokio::test(start_paused = true)]
async fn test_stop_times_out_and_leaves_channel_open() {
    let transport = MemoryTransport::new();
    let consumer: Consumer<Job> =
        Consumer::new(memory_connection(&transport, 3), ConsumerOptions::new(QUEUE));
    consumer
        .consume(|job: Job, _delivery: Delivery| run_job(job))
        .await
        .unwrap();

    let _stuck = start_delivery(&transport, job("hang", 0));
    assert!(wait_until(|| consumer.in_flight() == 1).await);

    let started = Instant::now();
    let err = consumer.stop(false).await.unwrap_err();

    assert!(matches!(err, RabbitError::StopTimeout { component: "consumer", .. }));
    assert!(started.elapsed() >= DEFAULT_STOP_TIMEOUT);
    assert_eq!(transport.channel_closes(), 0);
    assert_eq!(transport.open_channels(), 1);
    assert!(consumer.is_stopping());
    assert_eq!(consumer.in_flight(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_waits_for_processing() {
    let transport = MemoryTransport::new();
    let consumer: Consumer<Job> =
        Consumer::new(memory_connection(&transport, 3), ConsumerOptions::new(QUEUE));
    consumer
        .consume(|job: Job, _delivery: Delivery| run_job(job))
        .await
        .unwrap();

    let delivery = start_delivery(&transport, job("ack", 200));
    assert!(wait_until(|| consumer.in_flight() == 1).await);

    let started = Instant::now();
    consumer.stop(false).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(delivery.await.unwrap(), Some(1));
    assert_eq!(transport.settlements(), vec![Settlement::Ack { delivery_tag: 1 }]);
    assert_eq!(transport.channel_closes(), 1);
    assert!(!consumer.is_stopping());

    // Stopped consumers can be started again
    consumer
        .consume(|job: Job, _delivery: Delivery| run_job(job))
        .await
        .unwrap();
    assert_eq!(transport.consumer_count(QUEUE), 1);
}

#[tokio::test(start_paused = true)]
async fn test_messages_during_stop_are_left_unacknowledged() {
    let transport = MemoryTransport::new();
    let consumer: Consumer<Job> =
        Consumer::new(memory_connection(&transport, 3), ConsumerOptions::new(QUEUE));

    let processed = Arc::new(AtomicUsize::new(0));
    let counter = processed.clone();
    consumer
        .consume(move |job: Job, _delivery: Delivery| {
            counter.fetch_add(1, Ordering::SeqCst);
            run_job(job)
        })
        .await
        .unwrap();

    let _first = start_delivery(&transport, job("ack", 1000));
    assert!(wait_until(|| consumer.in_flight() == 1).await);

    let stopping = consumer.clone();
    let stop = tokio::spawn(async move { stopping.stop(false).await });
    assert!(wait_until(|| consumer.is_stopping()).await);

    assert_eq!(transport.deliver(QUEUE, job("ack", 0)).await, Some(2));
    stop.await.unwrap().unwrap();

    assert_eq!(processed.load(Ordering::SeqCst), 1);
    assert_eq!(transport.settlements(), vec![Settlement::Ack { delivery_tag: 1 }]);
}

#[tokio::test]
async fn test_stop_can_close_connection() {
    let transport = MemoryTransport::new();
    let connection = memory_connection(&transport, 3);
    let consumer: Consumer<Job> = Consumer::new(connection.clone(), ConsumerOptions::new(QUEUE));
    consumer
        .consume(|job: Job, _delivery: Delivery| run_job(job))
        .await
        .unwrap();

    consumer.stop(true).await.unwrap();

    assert!(!connection.is_activated());
    assert_eq!(transport.link_closes(), 1);
    assert!(matches!(consumer.stop(false).await, Err(RabbitError::NotInitialized)));
}
