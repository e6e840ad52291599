//! Topic-filtered event fan-out for push-channel connections.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::AgentEvent;

/// Push-channel connection identifier.
pub type ConnectionId = Uuid;

/// Default per-connection queue depth.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Filter value matching every event.
pub const WILDCARD: &str = "*";

/// Subscription filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Match a dotted event type, e.g. `snapshot.created`.
    EventType(String),
    /// Match every event emitted by a component, e.g. `snapshot`.
    Component(String),
}

impl Topic {
    /// Whether this filter selects `event`.
    #[must_use]
    pub fn matches(&self, event: &AgentEvent) -> bool {
        match self {
            Self::EventType(t) => t == WILDCARD || *t == event.event_type,
            Self::Component(c) => c == WILDCARD || *c == event.component,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EventType(t) => write!(f, "event:{t}"),
            Self::Component(c) => write!(f, "component:{c}"),
        }
    }
}

/// Event hub error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("Connection not registered: {0}")]
    NotRegistered(ConnectionId),
}

struct Subscriber {
    sender: mpsc::Sender<AgentEvent>,
    topics: HashSet<Topic>,
}

/// Fan-out of agent events to subscribed connections.
///
/// Each connection owns a bounded queue. Publication never waits on a
/// queue: events for a full queue are dropped, and connections whose
/// receiver has gone away are pruned.
pub struct EventHub {
    subscribers: RwLock<HashMap<ConnectionId, Subscriber>>,
    capacity: usize,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    /// Create a hub with the default per-connection capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a hub with a custom per-connection capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Register a connection and get its event receiver.
    ///
    /// Re-registering an id drops its previous queue and subscriptions.
    pub fn register(&self, id: ConnectionId) -> mpsc::Receiver<AgentEvent> {
        let (sender, receiver) = mpsc::channel(self.capacity);
        self.write().insert(
            id,
            Subscriber {
                sender,
                topics: HashSet::new(),
            },
        );
        receiver
    }

    /// Add a filter for a connection. Returns `false` if it already existed.
    ///
    /// # Errors
    /// Returns error if the connection is not registered.
    pub fn subscribe(&self, id: ConnectionId, topic: Topic) -> Result<bool, HubError> {
        let mut subscribers = self.write();
        let subscriber = subscribers.get_mut(&id).ok_or(HubError::NotRegistered(id))?;
        let added = subscriber.topics.insert(topic.clone());
        tracing::debug!(connection_id = %id, %topic, added, "subscribed");
        Ok(added)
    }

    /// Remove a filter. Returns whether it was present.
    pub fn unsubscribe(&self, id: ConnectionId, topic: &Topic) -> bool {
        self.write()
            .get_mut(&id)
            .is_some_and(|s| s.topics.remove(topic))
    }

    /// Drop a connection and all of its subscriptions.
    ///
    /// Returns the number of subscriptions removed.
    pub fn disconnect(&self, id: ConnectionId) -> usize {
        let removed = self.write().remove(&id).map_or(0, |s| s.topics.len());
        tracing::debug!(connection_id = %id, removed, "connection removed from event hub");
        removed
    }

    /// Active filters for a connection.
    #[must_use]
    pub fn subscriptions(&self, id: ConnectionId) -> Vec<Topic> {
        self.read()
            .get(&id)
            .map(|s| s.topics.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.read().len()
    }

    /// Number of connections holding exactly this filter.
    #[must_use]
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.read()
            .values()
            .filter(|s| s.topics.contains(topic))
            .count()
    }

    /// Deliver an event to every matching connection.
    ///
    /// Returns the number of connections the event was queued for.
    pub fn publish(&self, event: &AgentEvent) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        for (id, subscriber) in self.read().iter() {
            if !subscriber.topics.iter().any(|t| t.matches(event)) {
                continue;
            }
            match subscriber.sender.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        connection_id = %id,
                        event_type = %event.event_type,
                        "subscriber queue full, dropping event"
                    );
                }
                Err(TrySendError::Closed(_)) => closed.push(*id),
            }
        }

        if !closed.is_empty() {
            let mut subscribers = self.write();
            for id in closed {
                subscribers.remove(&id);
            }
        }

        delivered
    }

    /// Build and publish an event.
    pub fn emit(&self, event_type: &str, payload: Value) -> usize {
        self.publish(&AgentEvent::new(event_type, payload))
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ConnectionId, Subscriber>> {
        self.subscribers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ConnectionId, Subscriber>> {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
