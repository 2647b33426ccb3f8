// src/rabbitmq/in_flight.rs

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;

/// Interval of the cooperative drain wait.
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Maximum number of drain intervals before giving up.
pub const DRAIN_MAX_POLLS: u32 = 100;

/// Total drain budget: 100 x 50ms.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_millis(50 * 100);

/// Counts units of work currently in progress.
///
/// Work is registered with [`InFlight::start`]; the returned guard releases it
/// on drop, so every exit path (success, rejection, error) decrements once.
#[derive(Clone, Debug)]
pub struct InFlight {
    count: Arc<watch::Sender<usize>>,
}

impl Default for InFlight {
    fn default() -> Self {
        Self::new()
    }
}

impl InFlight {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            count: Arc::new(tx),
        }
    }

    pub fn start(&self) -> InFlightGuard {
        self.count.send_modify(|n| *n += 1);
        InFlightGuard {
            count: self.count.clone(),
        }
    }

    pub fn current(&self) -> usize {
        *self.count.borrow()
    }

    /// Wait until no work is in progress. Returns false if `budget` elapsed first.
    pub async fn drain(&self, budget: Duration) -> bool {
        let mut rx = self.count.subscribe();
        let drained = matches!(timeout(budget, rx.wait_for(|n| *n == 0)).await, Ok(Ok(_)));
        drained
    }
}

#[derive(Debug)]
pub struct InFlightGuard {
    count: Arc<watch::Sender<usize>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.count.send_modify(|n| *n = n.saturating_sub(1));
    }
}
