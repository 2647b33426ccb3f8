// src/rabbitmq/consumer.rs

use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use super::connection::Connection;
use super::errors::{RabbitError, Result};
use super::events::ListenerId;
use super::in_flight::{InFlight, InFlightGuard, DEFAULT_STOP_TIMEOUT};
use crate::transport::{Delivery, DeliveryHandler, TransportChannel};

/// Called when processing a message fails, before the message is discarded.
pub type ExceptionHandler =
    Arc<dyn Fn(Delivery, anyhow::Error) -> BoxFuture<'static, ()> + Send + Sync>;

type Processor<T> =
    Arc<dyn Fn(T, Delivery) -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

pub struct ConsumerOptions {
    pub queue: String,
    /// Number of unacknowledged messages the broker may push at once
    pub prefetch: u16,
    pub stop_timeout: Duration,
    pub exception_handler: Option<ExceptionHandler>,
}

impl ConsumerOptions {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            prefetch: 1,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            exception_handler: None,
        }
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    pub fn with_exception_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Delivery, anyhow::Error) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: ExceptionHandler = Arc::new(
            move |delivery: Delivery, err: anyhow::Error| -> BoxFuture<'static, ()> {
                handler(delivery, err).boxed()
            },
        );
        self.exception_handler = Some(handler);
        self
    }
}

fn log_exception_handler() -> ExceptionHandler {
    Arc::new(|delivery: Delivery, err: anyhow::Error| -> BoxFuture<'static, ()> {
        async move {
            error!(
                delivery_tag = delivery.delivery_tag,
                routing_key = %delivery.routing_key,
                "Unexpected exception while consuming: {:#}",
                err
            );
        }
        .boxed()
    })
}

#[derive(Default)]
struct ConsumerState {
    initialized: bool,
    connected: bool,
    channel: Option<Arc<dyn TransportChannel>>,
    listeners: Vec<ListenerId>,
}

struct ConsumerInner<T> {
    connection: Connection,
    queue: String,
    prefetch: u16,
    stop_timeout: Duration,
    exception_handler: ExceptionHandler,
    state: Mutex<ConsumerState>,
    stopping: AtomicBool,
    in_flight: InFlight,
    _content: PhantomData<fn() -> T>,
}

/// Binds a processing function to a queue and keeps it bound across reconnects.
///
/// Each message body is decoded from JSON into `T` and handed to the processor
/// together with the raw delivery. The processor answers whether to ack;
/// `Ok(false)` and errors discard the message (nack without requeue).
pub struct Consumer<T> {
    inner: Arc<ConsumerInner<T>>,
}

impl<T> Clone for Consumer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Consumer<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub fn new(connection: Connection, options: ConsumerOptions) -> Self {
        let exception_handler = options
            .exception_handler
            .unwrap_or_else(log_exception_handler);

        Self {
            inner: Arc::new(ConsumerInner {
                connection,
                queue: options.queue,
                prefetch: options.prefetch,
                stop_timeout: options.stop_timeout,
                exception_handler,
                state: Mutex::new(ConsumerState::default()),
                stopping: AtomicBool::new(false),
                in_flight: InFlight::new(),
                _content: PhantomData,
            }),
        }
    }

    pub fn queue(&self) -> &str {
        &self.inner.queue
    }

    /// Bound to the queue through a live channel.
    pub fn is_consuming(&self) -> bool {
        let state = self.inner.state();
        state.initialized && state.connected
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }

    /// Messages currently being processed.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.current()
    }

    /// Start consuming, activating the connection if needed.
    pub async fn consume<F, Fut>(&self, processor: F) -> Result<()>
    where
        F: Fn(T, Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        {
            let mut state = self.inner.state();
            if state.initialized {
                return Err(RabbitError::AlreadyInitialized);
            }
            state.initialized = true;
        }

        let processor: Processor<T> = Arc::new(
            move |content: T, delivery: Delivery| -> BoxFuture<'static, anyhow::Result<bool>> {
                processor(content, delivery).boxed()
            },
        );

        if let Err(err) = self.start(processor).await {
            self.inner.state().initialized = false;
            return Err(err);
        }

        info!(queue = %self.inner.queue, prefetch = self.inner.prefetch, "Consumer started");
        Ok(())
    }

    async fn start(&self, processor: Processor<T>) -> Result<()> {
        let connection = &self.inner.connection;
        if !connection.is_activated() {
            connection.connect().await?;
        }

        ConsumerInner::bind(&self.inner, processor.clone()).await?;

        let weak = Arc::downgrade(&self.inner);
        let on_disconnected = connection.on_disconnected(move || {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_disconnect();
                }
            }
        });

        // Start consuming again once reconnected
        let weak = Arc::downgrade(&self.inner);
        let on_reconnected = connection.on_reconnected(move |_connection| {
            let weak = weak.clone();
            let processor = processor.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if let Err(err) = ConsumerInner::bind(&inner, processor).await {
                    error!(queue = %inner.queue, error = %err, "Failed to resume consuming after reconnect");
                }
            }
        });

        self.inner.state().listeners = vec![on_disconnected, on_reconnected];
        Ok(())
    }

    /// Stop consuming once in-flight messages are settled.
    ///
    /// New deliveries are left unacknowledged while stopping. If processing
    /// does not finish within the stop timeout this fails with
    /// [`RabbitError::StopTimeout`] and the channel stays open; calling `stop`
    /// again keeps waiting.
    pub async fn stop(&self, close_connection: bool) -> Result<()> {
        let listeners = {
            let mut state = self.inner.state();
            if !state.initialized {
                return Err(RabbitError::NotInitialized);
            }
            state.initialized = false;
            std::mem::take(&mut state.listeners)
        };

        self.inner.stopping.store(true, Ordering::SeqCst);
        for id in listeners {
            self.inner.connection.remove_listener(id);
        }

        // Graceful stop
        if !self.inner.in_flight.drain(self.inner.stop_timeout).await {
            self.inner.state().initialized = true;
            warn!(
                queue = %self.inner.queue,
                in_flight = self.inner.in_flight.current(),
                "Can not stop consumer gracefully"
            );
            return Err(RabbitError::StopTimeout {
                component: "consumer",
                timeout: self.inner.stop_timeout,
            });
        }

        let channel = {
            let mut state = self.inner.state();
            state.connected = false;
            state.channel.take()
        };
        if let Some(channel) = channel {
            if let Err(err) = channel.close().await {
                warn!(queue = %self.inner.queue, error = %err, "Failed to close consumer channel");
            }
        }

        if close_connection {
            self.inner.connection.close().await?;
        }

        self.inner.stopping.store(false, Ordering::SeqCst);
        info!(queue = %self.inner.queue, "Consumer stopped");
        Ok(())
    }
}

impl<T> ConsumerInner<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn state(&self) -> MutexGuard<'_, ConsumerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn bind(inner: &Arc<Self>, processor: Processor<T>) -> Result<()> {
        let channel = inner.connection.create_channel().await?;
        channel.set_prefetch(inner.prefetch).await?;

        let weak = Arc::downgrade(inner);
        let handler_channel = channel.clone();
        let handler: DeliveryHandler = Arc::new(move |delivery: Option<Delivery>| -> BoxFuture<'static, ()> {
            let Some(inner) = weak.upgrade() else {
                return future::ready(()).boxed();
            };
            // Cancel notification
            let Some(delivery) = delivery else {
                debug!(queue = %inner.queue, "Consumer cancelled by broker");
                return future::ready(()).boxed();
            };
            let Some(in_flight) = inner.admit(&delivery) else {
                return future::ready(()).boxed();
            };

            let channel = handler_channel.clone();
            let processor = processor.clone();
            async move {
                inner.process(&channel, &processor, delivery, in_flight).await;
            }
            .boxed()
        });

        let consumer_tag = channel.consume(&inner.queue, handler).await?;
        debug!(queue = %inner.queue, consumer_tag = %consumer_tag, "Consumer bound to channel");

        let mut state = inner.state();
        state.connected = true;
        state.channel = Some(channel);
        Ok(())
    }

    fn handle_disconnect(&self) {
        debug!(queue = %self.queue, "Consumer lost its channel");
        let mut state = self.state();
        state.connected = false;
        state.channel = None;
    }

    /// Count the delivery as in flight unless the consumer is stopping.
    ///
    /// The slot is taken before `stopping` is read and stop() raises
    /// `stopping` before it drains, so a drain that saw zero can never be
    /// followed by an admitted delivery.
    fn admit(&self, delivery: &Delivery) -> Option<InFlightGuard> {
        let in_flight = self.in_flight.start();
        if self.stopping.load(Ordering::SeqCst) {
            // Left unacknowledged, the broker redelivers it later
            debug!(delivery_tag = delivery.delivery_tag, "Consumer stopping, message skipped");
            return None;
        }
        Some(in_flight)
    }

    async fn process(
        &self,
        channel: &Arc<dyn TransportChannel>,
        processor: &Processor<T>,
        delivery: Delivery,
        _in_flight: InFlightGuard,
    ) {
        let delivery_tag = delivery.delivery_tag;

        let outcome = match serde_json::from_slice::<T>(&delivery.data) {
            Ok(content) => processor(content, delivery.clone()).await,
            Err(err) => Err(anyhow::Error::new(err).context("Failed to deserialize message")),
        };

        let settled = match outcome {
            Ok(true) => channel.ack(delivery_tag).await,
            // Only this message and no requeue
            Ok(false) => channel.nack(delivery_tag, false, false).await,
            Err(err) => {
                (self.exception_handler)(delivery, err).await;
                channel.nack(delivery_tag, false, false).await
            }
        };

        if let Err(err) = settled {
            error!(delivery_tag, error = %err, "Failed to settle message");
        }
    }
}
