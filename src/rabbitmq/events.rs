// src/rabbitmq/events.rs

use std::sync::Arc;

use futures::future::BoxFuture;

use super::connection::Connection;
use super::errors::RabbitError;

/// Lifecycle notification emitted by a [`Connection`].
#[derive(Clone, Debug)]
pub enum ConnectionEvent {
    /// The link was re-established after an unexpected drop.
    Reconnected(Connection),
    /// The link dropped without `close()` being called.
    Disconnected,
    /// `close()` completed.
    Closed,
    /// Non-fatal error, from the link or from a failed reconnect attempt.
    Error(Arc<RabbitError>),
    /// The reconnect strategy gave up; the connection stays down.
    ReconnectExhausted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Reconnected,
    Disconnected,
    Closed,
    Error,
    ReconnectExhausted,
}

impl ConnectionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ConnectionEvent::Reconnected(_) => EventKind::Reconnected,
            ConnectionEvent::Disconnected => EventKind::Disconnected,
            ConnectionEvent::Closed => EventKind::Closed,
            ConnectionEvent::Error(_) => EventKind::Error,
            ConnectionEvent::ReconnectExhausted => EventKind::ReconnectExhausted,
        }
    }
}

pub type Listener = Arc<dyn Fn(ConnectionEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handle returned on subscription, used to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Observers keyed by event kind, kept in insertion order.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    next_id: u64,
    entries: Vec<(ListenerId, EventKind, Listener)>,
}

impl ListenerRegistry {
    pub(crate) fn add(&mut self, kind: EventKind, listener: Listener) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.entries.push((id, kind, listener));
        id
    }

    pub(crate) fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _, _)| *entry_id != id);
        self.entries.len() != before
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Listeners for `kind`, cloned so they can be awaited without holding a lock.
    pub(crate) fn snapshot(&self, kind: EventKind) -> Vec<Listener> {
        self.entries
            .iter()
            .filter(|(_, entry_kind, _)| *entry_kind == kind)
            .map(|(_, _, listener)| listener.clone())
            .collect()
    }
}
