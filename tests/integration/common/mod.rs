// Shared by the integration test binaries
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rabbit_keeper::transport::MemoryTransport;
use rabbit_keeper::{Connection, ConnectionOptions, FixedDelay};

pub const RETRY_DELAY: Duration = Duration::from_millis(100);

pub fn memory_connection(transport: &MemoryTransport, max_attempts: u32) -> Connection {
    Connection::new(
        Arc::new(transport.clone()),
        ConnectionOptions::new("amqp://memory").with_reconnect(FixedDelay::new(RETRY_DELAY, max_attempts)),
    )
}

/// Poll `condition` on the (usually paused) tokio clock.
pub async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..1000 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

/// Counts every connection event received by subscribers.
#[derive(Clone)]
pub struct EventCounts {
    reconnected: Arc<AtomicUsize>,
    disconnected: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    errors: Arc<AtomicUsize>,
    exhausted: Arc<AtomicUsize>,
}

impl EventCounts {
    pub fn attach(connection: &Connection) -> Self {
        let counts = Self {
            reconnected: counter(),
            disconnected: counter(),
            closed: counter(),
            errors: counter(),
            exhausted: counter(),
        };

        let c = counts.reconnected.clone();
        connection.on_reconnected(move |_connection| {
            c.fetch_add(1, Ordering::SeqCst);
            async {}
        });
        let c = counts.disconnected.clone();
        connection.on_disconnected(move || {
            c.fetch_add(1, Ordering::SeqCst);
            async {}
        });
        let c = counts.closed.clone();
        connection.on_closed(move || {
            c.fetch_add(1, Ordering::SeqCst);
            async {}
        });
        let c = counts.errors.clone();
        connection.on_error(move |_err| {
            c.fetch_add(1, Ordering::SeqCst);
            async {}
        });
        let c = counts.exhausted.clone();
        connection.on_reconnect_exhausted(move || {
            c.fetch_add(1, Ordering::SeqCst);
            async {}
        });

        counts
    }

    pub fn reconnected(&self) -> usize {
        self.reconnected.load(Ordering::SeqCst)
    }

    pub fn disconnected(&self) -> usize {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> usize {
        self.errors.load(Ordering::SeqCst)
    }

    pub fn exhausted(&self) -> usize {
        self.exhausted.load(Ordering::SeqCst)
    }
}
