// src/rabbitmq/connection.rs

//! Resilient broker connection.
//!
//! A [`Connection`] is a cheap, clonable handle to one logical connection. It
//! owns at most one live transport link at a time and keeps its identity
//! across reconnects, so consumers and publishers can hold a clone and simply
//! ask it for fresh channels after a `reconnected` event.
//!
//! When the link drops without `close()` having been called, the connection
//! emits `disconnected` and runs the reconnection loop: it asks its
//! [`ReconnectStrategy`] whether to retry, reconnects, and emits either
//! `reconnected` or `error` per attempt. When the strategy gives up the
//! connection stays activated but disconnected and `reconnect_exhausted` is
//! emitted; no error is returned to anyone.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::future::{self, BoxFuture, FutureExt};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use super::errors::{RabbitError, Result};
use super::events::{ConnectionEvent, EventKind, Listener, ListenerId, ListenerRegistry};
use super::reconnect::{FixedDelay, ReconnectStrategy};
use crate::transport::{Link, LinkEvent, LinkEvents, Transport, TransportChannel};

pub struct ConnectionOptions {
    pub uri: String,
    pub reconnect: Box<dyn ReconnectStrategy>,
}

impl ConnectionOptions {
    /// Options with the default strategy: 1 second delay, 10 attempts.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            reconnect: Box::new(FixedDelay::default()),
        }
    }

    pub fn with_reconnect<S: ReconnectStrategy + 'static>(mut self, strategy: S) -> Self {
        self.reconnect = Box::new(strategy);
        self
    }
}

#[derive(Default)]
struct ConnectionState {
    activated: bool,
    connected: bool,
    closing: bool,
    // Bumped on every new link and on close; notifications from older links are ignored.
    generation: u64,
    link: Option<Arc<dyn Link>>,
}

struct ConnectionInner {
    uri: String,
    transport: Arc<dyn Transport>,
    reconnect: AsyncMutex<Box<dyn ReconnectStrategy>>,
    state: Mutex<ConnectionState>,
    listeners: Mutex<ListenerRegistry>,
}

impl ConnectionInner {
    fn state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listeners(&self) -> MutexGuard<'_, ListenerRegistry> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state();
        f.debug_struct("Connection")
            .field("activated", &state.activated)
            .field("connected", &state.connected)
            .field("closing", &state.closing)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(transport: Arc<dyn Transport>, options: ConnectionOptions) -> Self {
        Connection {
            inner: Arc::new(ConnectionInner {
                uri: options.uri,
                transport,
                reconnect: AsyncMutex::new(options.reconnect),
                state: Mutex::new(ConnectionState::default()),
                listeners: Mutex::new(ListenerRegistry::default()),
            }),
        }
    }

    pub fn is_activated(&self) -> bool {
        self.inner.state().activated
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state().connected
    }

    pub fn is_closing(&self) -> bool {
        self.inner.state().closing
    }

    /// Whether both handles point at the same logical connection.
    pub fn same_as(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Open the transport link and start watching it.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.inner.state();
            if state.activated && state.connected {
                return Err(RabbitError::AlreadyConnected);
            }
            if !state.activated {
                // Fresh activation after a completed close
                state.closing = false;
            }
            state.activated = true;
        }

        self.attach_link().await
    }

    async fn attach_link(&self) -> Result<()> {
        let (link, events) = self.inner.transport.connect(&self.inner.uri).await?;

        let attached = {
            let mut state = self.inner.state();
            if !state.activated || state.closing {
                // close() ran while the link was being opened
                Err(RabbitError::NotActivated)
            } else if state.connected {
                // Another connect() or the reconnect loop got there first
                Err(RabbitError::AlreadyConnected)
            } else {
                state.generation += 1;
                state.link = Some(link.clone());
                state.connected = true;
                Ok(state.generation)
            }
        };

        let generation = match attached {
            Ok(generation) => generation,
            Err(err) => {
                if let Err(close_err) = link.close().await {
                    debug!(error = %close_err, "Ignoring error while discarding extra link");
                }
                return Err(err);
            }
        };

        tokio::spawn(watch_link(Arc::downgrade(&self.inner), generation, events));
        info!("Connected to RabbitMQ");
        Ok(())
    }

    /// Close the connection. Calling it again while or after closing is a no-op.
    pub async fn close(&self) -> Result<()> {
        let link = {
            let mut state = self.inner.state();
            if state.closing {
                return Ok(());
            }
            if !state.activated {
                return Err(RabbitError::NotActivated);
            }
            state.closing = true;
            state.connected = false;
            state.generation += 1;
            state.link.take()
        };

        if let Some(link) = link {
            if let Err(err) = link.close().await {
                debug!(error = %err, "Ignoring error while closing connection");
            }
        }

        self.emit(ConnectionEvent::Closed).await;
        self.inner.listeners().clear();

        self.inner.state().activated = false;
        info!("Connection closed");
        Ok(())
    }

    /// Open a new confirm-mode channel on the live link.
    pub async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>> {
        let link = self.live_link()?;
        link.create_confirm_channel().await
    }

    fn live_link(&self) -> Result<Arc<dyn Link>> {
        let state = self.inner.state();
        if !state.activated {
            return Err(RabbitError::NotActivated);
        }
        state.link.clone().ok_or(RabbitError::NotConnected)
    }

    pub fn on(&self, kind: EventKind, listener: Listener) -> ListenerId {
        self.inner.listeners().add(kind, listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners().remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners().len()
    }

    pub fn on_reconnected<F, Fut>(&self, listener: F) -> ListenerId
    where
        F: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener: Listener = Arc::new(move |event: ConnectionEvent| -> BoxFuture<'static, ()> {
            match event {
                ConnectionEvent::Reconnected(connection) => listener(connection).boxed(),
                _ => future::ready(()).boxed(),
            }
        });
        self.on(EventKind::Reconnected, listener)
    }

    pub fn on_disconnected<F, Fut>(&self, listener: F) -> ListenerId
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener: Listener =
            Arc::new(move |_: ConnectionEvent| -> BoxFuture<'static, ()> { listener().boxed() });
        self.on(EventKind::Disconnected, listener)
    }

    pub fn on_closed<F, Fut>(&self, listener: F) -> ListenerId
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener: Listener =
            Arc::new(move |_: ConnectionEvent| -> BoxFuture<'static, ()> { listener().boxed() });
        self.on(EventKind::Closed, listener)
    }

    pub fn on_error<F, Fut>(&self, listener: F) -> ListenerId
    where
        F: Fn(Arc<RabbitError>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener: Listener = Arc::new(move |event: ConnectionEvent| -> BoxFuture<'static, ()> {
            match event {
                ConnectionEvent::Error(err) => listener(err).boxed(),
                _ => future::ready(()).boxed(),
            }
        });
        self.on(EventKind::Error, listener)
    }

    pub fn on_reconnect_exhausted<F, Fut>(&self, listener: F) -> ListenerId
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener: Listener =
            Arc::new(move |_: ConnectionEvent| -> BoxFuture<'static, ()> { listener().boxed() });
        self.on(EventKind::ReconnectExhausted, listener)
    }

    async fn emit(&self, event: ConnectionEvent) {
        if let ConnectionEvent::Error(err) = &event {
            error!(error = %err, "Connection error");
        }

        let listeners = self.inner.listeners().snapshot(event.kind());
        for listener in listeners {
            listener(event.clone()).await;
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.state().generation == generation
    }

    async fn handle_link_closed(&self, generation: u64) {
        let closing = {
            let mut state = self.inner.state();
            if state.generation != generation {
                return;
            }
            state.connected = false;
            state.link = None;
            state.closing
        };

        if closing {
            debug!("Connection closed.");
            return;
        }

        debug!("Connection closed unexpectedly.");
        self.emit(ConnectionEvent::Disconnected).await;
        self.reconnect().await;
    }

    async fn should_reconnect(&self) -> bool {
        self.inner.reconnect.lock().await.should_reconnect().await
    }

    async fn reconnect(&self) {
        let mut reconnecting = self.should_reconnect().await;

        while reconnecting {
            if self.is_closing() || !self.is_activated() {
                debug!("Connection is closing, reconnect abandoned.");
                return;
            }

            debug!("Reconnecting...");
            let attempt = if self.is_connected() {
                Ok(())
            } else {
                self.attach_link().await
            };
            match attempt {
                // A concurrent connect() already brought a link up; adopt it
                Ok(()) | Err(RabbitError::AlreadyConnected) => {
                    self.inner.reconnect.lock().await.reset();
                    debug!("Reconnected.");
                    self.emit(ConnectionEvent::Reconnected(self.clone())).await;
                    return;
                }
                Err(err) => {
                    debug!(error = %err, "Reconnect failed.");
                    self.emit(ConnectionEvent::Error(Arc::new(err))).await;
                    reconnecting = self.should_reconnect().await;
                }
            }
        }

        warn!("Reconnection attempts exhausted, connection stays down");
        self.emit(ConnectionEvent::ReconnectExhausted).await;
    }
}

// Boxed so the reconnect loop, which spawns this again, has a nameable type.
fn watch_link(
    inner: Weak<ConnectionInner>,
    generation: u64,
    mut events: LinkEvents,
) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        while let Some(event) = events.recv().await {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let connection = Connection { inner };
            if !connection.is_current(generation) {
                return;
            }

            match event {
                LinkEvent::Error(err) => {
                    connection.emit(ConnectionEvent::Error(Arc::new(err))).await;
                }
                LinkEvent::Closed => {
                    connection.handle_link_closed(generation).await;
                    return;
                }
            }
        }
    })
}
