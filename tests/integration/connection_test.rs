// Connection lifecycle against the in-memory broker.
// Each file in the tests directory is treated as its own separate crate

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{memory_connection, wait_until, EventCounts, RETRY_DELAY};
use rabbit_keeper::transport::MemoryTransport;
use rabbit_keeper::RabbitError;

#[tokio::test(start_paused = true)]
async fn test_unexpected_close_reconnects() {
    let transport = MemoryTransport::new();
    let connection = memory_connection(&transport, 3);
    let events = EventCounts::attach(&connection);
    connection.connect().await.unwrap();

    let same = Arc::new(AtomicBool::new(false));
    let original = connection.clone();
    let seen = same.clone();
    connection.on_reconnected(move |reconnected| {
        seen.store(reconnected.same_as(&original), Ordering::SeqCst);
        async {}
    });

    assert!(transport.drop_link());
    assert!(wait_until(|| events.reconnected() == 1).await);

    assert_eq!(events.disconnected(), 1);
    assert_eq!(events.closed(), 0);
    assert!(connection.is_connected());
    assert!(same.load(Ordering::SeqCst));
    assert_eq!(transport.connect_attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_every_drop_gets_one_disconnect() {
    let transport = MemoryTransport::new();
    let connection = memory_connection(&transport, 2);
    let events = EventCounts::attach(&connection);
    connection.connect().await.unwrap();

    for round in 1..=3 {
        // Two failures per round only fit if the strategy resets after each success
        transport.fail_next_connects(1);
        assert!(transport.drop_link());
        assert!(wait_until(|| events.reconnected() == round).await);
        assert_eq!(events.disconnected(), round);
        assert_eq!(events.errors(), round);
    }

    assert_eq!(events.exhausted(), 0);
    assert!(connection.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_gives_up_after_strategy_limit() {
    let transport = MemoryTransport::new();
    let connection = memory_connection(&transport, 2);
    let events = EventCounts::attach(&connection);
    connection.connect().await.unwrap();

    transport.refuse_connects(true);
    assert!(transport.drop_link());
    assert!(wait_until(|| events.exhausted() == 1).await);

    assert!(connection.is_activated());
    assert!(!connection.is_connected());
    assert_eq!(events.disconnected(), 1);
    assert_eq!(events.errors(), 2);
    assert_eq!(events.reconnected(), 0);
    // initial connect plus two retries
    assert_eq!(transport.connect_attempts(), 3);

    let err = connection.create_channel().await.err().unwrap();
    assert!(matches!(err, RabbitError::NotConnected));
}

#[tokio::test(start_paused = true)]
async fn test_recovers_after_failed_attempts() {
    let transport = MemoryTransport::new();
    let connection = memory_connection(&transport, 5);
    let events = EventCounts::attach(&connection);
    connection.connect().await.unwrap();

    transport.fail_next_connects(2);
    assert!(transport.drop_link());
    assert!(wait_until(|| events.reconnected() == 1).await);

    assert_eq!(events.errors(), 2);
    assert!(connection.is_connected());
    assert!(connection.create_channel().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_connect_during_backoff_keeps_one_link() {
    let transport = MemoryTransport::new();
    let connection = memory_connection(&transport, 3);
    let events = EventCounts::attach(&connection);
    connection.connect().await.unwrap();

    assert!(transport.drop_link());
    assert!(wait_until(|| events.disconnected() == 1).await);
    // The retry loop is still sleeping out its first delay
    connection.connect().await.unwrap();
    tokio::time::sleep(RETRY_DELAY * 3).await;

    assert_eq!(transport.live_links(), 1);
    assert_eq!(transport.connect_attempts(), 2);
    assert_eq!(events.reconnected(), 1);
    assert_eq!(events.errors(), 0);
    assert!(connection.is_connected());

    // The adopted link is watched like any other
    assert!(transport.drop_link());
    assert!(wait_until(|| events.reconnected() == 2).await);
    assert_eq!(transport.live_links(), 1);

    connection.close().await.unwrap();
    assert_eq!(transport.live_links(), 0);
}

#[tokio::test]
async fn test_close_twice_shuts_down_once() {
    let transport = MemoryTransport::new();
    let connection = memory_connection(&transport, 3);
    let events = EventCounts::attach(&connection);
    connection.connect().await.unwrap();

    connection.close().await.unwrap();
    connection.close().await.unwrap();

    assert_eq!(transport.link_closes(), 1);
    assert_eq!(events.closed(), 1);
    assert_eq!(events.disconnected(), 0);
    assert!(!connection.is_activated());
    assert!(!connection.is_connected());
    assert_eq!(connection.listener_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_requested_close_does_not_reconnect() {
    let transport = MemoryTransport::new();
    let connection = memory_connection(&transport, 3);
    connection.connect().await.unwrap();

    connection.close().await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(transport.connect_attempts(), 1);
    assert!(!transport.is_link_alive());
}

#[tokio::test(start_paused = true)]
async fn test_close_during_reconnect_abandons_loop() {
    let transport = MemoryTransport::new();
    let connection = memory_connection(&transport, 10);
    let events = EventCounts::attach(&connection);
    connection.connect().await.unwrap();

    transport.refuse_connects(true);
    assert!(transport.drop_link());
    assert!(wait_until(|| events.errors() >= 1).await);

    connection.close().await.unwrap();
    let attempts = transport.connect_attempts();
    transport.refuse_connects(false);
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(transport.connect_attempts(), attempts);
    assert!(!connection.is_connected());
    assert!(!connection.is_activated());
    assert_eq!(events.reconnected(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_link_error_is_informational() {
    let transport = MemoryTransport::new();
    let connection = memory_connection(&transport, 3);
    connection.connect().await.unwrap();

    let messages = Arc::new(Mutex::new(Vec::new()));
    let sink = messages.clone();
    connection.on_error(move |err| {
        sink.lock().unwrap().push(err.to_string());
        async {}
    });

    assert!(transport.raise_link_error("heartbeat missed"));
    assert!(wait_until(|| !messages.lock().unwrap().is_empty()).await);

    assert!(messages.lock().unwrap()[0].contains("heartbeat missed"));
    assert!(connection.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_removed_listener_is_not_called() {
    let transport = MemoryTransport::new();
    let connection = memory_connection(&transport, 3);
    let events = EventCounts::attach(&connection);
    connection.connect().await.unwrap();

    let called = Arc::new(AtomicBool::new(false));
    let flag = called.clone();
    let id = connection.on_disconnected(move || {
        flag.store(true, Ordering::SeqCst);
        async {}
    });
    assert!(connection.remove_listener(id));
    assert!(!connection.remove_listener(id));

    assert!(transport.drop_link());
    assert!(wait_until(|| events.reconnected() == 1).await);
    assert!(!called.load(Ordering::SeqCst));
}
