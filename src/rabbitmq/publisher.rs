// src/rabbitmq/publisher.rs

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use super::connection::Connection;
use super::errors::{RabbitError, Result};
use super::events::ListenerId;
use super::in_flight::{InFlight, DEFAULT_STOP_TIMEOUT};
use crate::transport::{PublishOptions, TransportChannel};

pub struct PublisherOptions {
    pub exchange: String,
    pub stop_timeout: Duration,
}

impl PublisherOptions {
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }
}

#[derive(Default)]
struct PublisherState {
    initialized: bool,
    // Set once stop() completed; the publisher never opens a channel again
    stopped: bool,
    channel: Option<Arc<dyn TransportChannel>>,
    reconnected_listener: Option<ListenerId>,
}

struct PublisherInner<T> {
    connection: Connection,
    exchange: String,
    stop_timeout: Duration,
    // Serialises initialize() so concurrent first publishes share one channel
    init_lock: AsyncMutex<()>,
    state: Mutex<PublisherState>,
    stopping: AtomicBool,
    in_flight: InFlight,
    _content: PhantomData<fn(T)>,
}

impl<T> PublisherInner<T> {
    fn state(&self) -> MutexGuard<'_, PublisherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn establish_new_channel(&self) -> Result<()> {
        let channel = self.connection.create_channel().await?;
        debug!(exchange = %self.exchange, "Publisher channel established");
        self.state().channel = Some(channel);
        Ok(())
    }

    fn rejection(&self, state: &PublisherState) -> Option<RabbitError> {
        if state.stopped {
            Some(RabbitError::PublisherStopped)
        } else if self.stopping.load(Ordering::SeqCst) {
            Some(RabbitError::PublisherStopping)
        } else {
            None
        }
    }

    fn ensure_running(&self) -> Result<()> {
        match self.rejection(&self.state()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn channel(&self) -> Result<Arc<dyn TransportChannel>> {
        self.state()
            .channel
            .clone()
            .ok_or(RabbitError::ChannelUnavailable)
    }
}

/// Publishes JSON messages to one exchange with broker confirmation.
pub struct Publisher<T> {
    inner: Arc<PublisherInner<T>>,
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Publisher<T>
where
    T: Serialize + Send + Sync + 'static,
{
    pub fn new(connection: Connection, options: PublisherOptions) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                connection,
                exchange: options.exchange,
                stop_timeout: options.stop_timeout,
                init_lock: AsyncMutex::new(()),
                state: Mutex::new(PublisherState::default()),
                stopping: AtomicBool::new(false),
                in_flight: InFlight::new(),
                _content: PhantomData,
            }),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.inner.exchange
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.state().initialized
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.state().stopped
    }

    /// Sends waiting for their broker confirmation.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.current()
    }

    /// Open the publishing channel, activating the connection if needed.
    pub async fn initialize(&self) -> Result<()> {
        let _init = self.inner.init_lock.lock().await;
        {
            let mut state = self.inner.state();
            if let Some(err) = self.inner.rejection(&state) {
                return Err(err);
            }
            if state.initialized {
                return Ok(());
            }
            state.initialized = true;
        }

        if let Err(err) = self.open().await {
            self.inner.state().initialized = false;
            return Err(err);
        }

        // Publishing on a channel from before the reconnect is never valid
        let weak = Arc::downgrade(&self.inner);
        let listener = self.inner.connection.on_reconnected(move |_connection| {
            let weak = weak.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if let Err(err) = inner.establish_new_channel().await {
                    error!(exchange = %inner.exchange, error = %err, "Failed to re-open publisher channel");
                }
            }
        });

        let rejected = {
            let mut state = self.inner.state();
            match self.inner.rejection(&state) {
                None => {
                    state.reconnected_listener = Some(listener);
                    None
                }
                Some(err) => {
                    state.initialized = false;
                    Some((err, state.channel.take()))
                }
            }
        };

        if let Some((err, channel)) = rejected {
            // stop() ran while the channel was being opened
            self.inner.connection.remove_listener(listener);
            if let Some(channel) = channel {
                if let Err(close_err) = channel.close().await {
                    warn!(exchange = %self.inner.exchange, error = %close_err, "Failed to close publisher channel");
                }
            }
            return Err(err);
        }

        info!(exchange = %self.inner.exchange, "Publisher initialized");
        Ok(())
    }

    async fn open(&self) -> Result<()> {
        if !self.inner.connection.is_activated() {
            self.inner.connection.connect().await?;
        }
        self.inner.establish_new_channel().await
    }

    /// Publish a persistent message and wait for the broker confirmation.
    ///
    /// Fails with [`RabbitError::ChannelBufferFull`] right away when the
    /// channel signals backpressure; the message was still written and its
    /// confirmation settles in the background.
    pub async fn publish(&self, routing_key: &str, content: &T) -> Result<()> {
        self.inner.ensure_running()?;
        self.initialize().await?;

        let payload = serde_json::to_vec(content)?;

        // Counted before the re-check: stop() raises `stopping` before it drains
        let sending = self.inner.in_flight.start();
        self.inner.ensure_running()?;
        let channel = self.inner.channel()?;
        let receipt = channel
            .publish(
                &self.inner.exchange,
                routing_key,
                payload,
                PublishOptions { persistent: true },
            )
            .await?;

        if receipt.buffer_full {
            let confirmation = receipt.confirmation;
            tokio::spawn(async move {
                let _sending = sending;
                if let Err(err) = confirmation.await {
                    debug!(error = %err, "Confirmation failed after buffer-full rejection");
                }
            });
            return Err(RabbitError::ChannelBufferFull);
        }

        let confirmed = receipt.confirmation.await;
        drop(sending);

        if confirmed.is_ok() {
            debug!(
                exchange = %self.inner.exchange,
                routing_key = %routing_key,
                "Published message"
            );
        }
        confirmed
    }

    /// Stop publishing once pending sends are confirmed.
    ///
    /// A stopped publisher rejects every later `publish` or `initialize` with
    /// [`RabbitError::PublisherStopped`]. A stop that timed out leaves it
    /// stopping, so it can be retried.
    pub async fn stop(&self, close_connection: bool) -> Result<()> {
        self.inner.stopping.store(true, Ordering::SeqCst);

        let listener = self.inner.state().reconnected_listener.take();
        if let Some(id) = listener {
            self.inner.connection.remove_listener(id);
        }

        // Graceful stop
        if !self.inner.in_flight.drain(self.inner.stop_timeout).await {
            warn!(
                exchange = %self.inner.exchange,
                in_flight = self.inner.in_flight.current(),
                "Can not stop publisher gracefully"
            );
            return Err(RabbitError::StopTimeout {
                component: "publisher",
                timeout: self.inner.stop_timeout,
            });
        }

        let channel = {
            let mut state = self.inner.state();
            state.initialized = false;
            state.stopped = true;
            state.channel.take()
        };
        if let Some(channel) = channel {
            if let Err(err) = channel.close().await {
                warn!(exchange = %self.inner.exchange, error = %err, "Failed to close publisher channel");
            }
        }

        if close_connection {
            self.inner.connection.close().await?;
        }

        self.inner.stopping.store(false, Ordering::SeqCst);
        info!(exchange = %self.inner.exchange, "Publisher stopped");
        Ok(())
    }
}
