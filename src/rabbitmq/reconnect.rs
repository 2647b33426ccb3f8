// src/rabbitmq/reconnect.rs

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, info};

/// Decides whether a dropped connection should be re-established.
///
/// The strategy owns its own delay and attempt counting: `should_reconnect`
/// waits out the backoff and then answers. The connection calls `reset` once a
/// reconnection succeeded.
#[async_trait]
pub trait ReconnectStrategy: Send + Sync {
    async fn should_reconnect(&mut self) -> bool;

    fn reset(&mut self) {}
}

/// Fixed delay between attempts, bounded attempt count.
#[derive(Debug, Clone)]
pub struct FixedDelay {
    delay: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl Default for FixedDelay {
    /// 1 second between attempts, 10 attempts.
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 10)
    }
}

impl FixedDelay {
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[async_trait]
impl ReconnectStrategy for FixedDelay {
    async fn should_reconnect(&mut self) -> bool {
        self.attempts += 1;
        sleep(self.delay).await;

        let retry = self.attempts <= self.max_attempts;
        if !retry {
            info!("Max reconnection attempts reached. Giving up.");
        }
        retry
    }

    fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Exponential backoff with jitter, capped delay.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    attempts: u32,
    delay: Duration,
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay,
            max_delay: Duration::from_secs(30),
            max_attempts,
            attempts: 0,
            delay: initial_delay,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Next sleep with +/-15% jitter applied.
    fn jittered(&self) -> Duration {
        let delay_ms = self.delay.as_millis() as f64;
        let jitter = (rand::random::<f64>() * 0.3 - 0.15) * delay_ms;
        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }
}

#[async_trait]
impl ReconnectStrategy for ExponentialBackoff {
    async fn should_reconnect(&mut self) -> bool {
        self.attempts += 1;
        if self.attempts > self.max_attempts {
            info!("Max reconnection attempts reached. Giving up.");
            return false;
        }

        let sleep_time = self.jittered();
        debug!(
            "Waiting {}ms before reconnect attempt {}/{}",
            sleep_time.as_millis(),
            self.attempts,
            self.max_attempts
        );
        sleep(sleep_time).await;

        // Increase delay for next attempt
        self.delay = std::cmp::min(self.delay * 2, self.max_delay);
        true
    }

    fn reset(&mut self) {
        self.attempts = 0;
        self.delay = self.initial_delay;
    }
}
