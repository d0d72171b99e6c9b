//! Registry of connected stream clients and their outbound queues.

use chrono::{DateTime, Utc};
use relay_types::Event;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

/// Default number of events a client may have queued before deliveries are dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// A registered stream client.
///
/// Cloning a `Client` clones the queue's sending half; the receiving half is
/// handed out once, by [`ClientRegistry::add`].
#[derive(Debug, Clone)]
pub struct Client {
    /// Unique client identifier.
    pub id: String,
    /// When the client connected.
    pub created_at: DateTime<Utc>,
    /// The last event id the client reported when connecting (may be empty).
    pub last_event_id: String,
    sender: mpsc::Sender<Event>,
}

impl Client {
    /// Number of events currently waiting in the client's queue.
    pub fn queued(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }
}

/// A new registration: the client record plus the receiving end of its queue.
#[derive(Debug)]
pub struct Registration {
    pub client: Client,
    pub events: mpsc::Receiver<Event>,
}

/// Tracks connected clients and fans events out to their queues.
///
/// Uses `std::sync::RwLock`: every lock acquisition is a brief HashMap
/// operation or a non-blocking `try_send` loop that never spans an `.await`.
#[derive(Debug)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, Client>>,
    queue_capacity: usize,
    dropped: AtomicU64,
}

impl ClientRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Registers a new client with a fresh bounded queue.
    pub fn add(&self, last_event_id: impl Into<String>) -> Registration {
        let (sender, events) = mpsc::channel(self.queue_capacity);
        let client = Client {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            last_event_id: last_event_id.into(),
            sender,
        };
        self.write_clients()
            .insert(client.id.clone(), client.clone());
        tracing::debug!(client_id = %client.id, last_event_id = %client.last_event_id, "client registered");
        Registration { client, events }
    }

    pub fn get(&self, id: &str) -> Option<Client> {
        self.read_clients().get(id).cloned()
    }

    /// Deregisters a client. Returns `false` if it was not registered.
    ///
    /// Once the registry's sender and every clone of the [`Client`] are
    /// dropped, the client's receiver observes the queue as closed.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.write_clients().remove(id).is_some();
        if removed {
            tracing::debug!(client_id = %id, "client deregistered");
        }
        removed
    }

    /// Delivers `event` to every registered client without blocking.
    ///
    /// A client whose queue is full misses this event; the drop is counted
    /// and the client can recover it through replay. Returns the number of
    /// queues the event was placed on.
    pub fn broadcast(&self, event: &Event) -> usize {
        let clients = self.read_clients();
        let mut delivered = 0;
        for client in clients.values() {
            match client.sender.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        client_id = %client.id,
                        event_id = %event.id,
                        "dropping event for slow stream client"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::trace!(client_id = %client.id, "client queue closed, skipping");
                }
            }
        }
        delivered
    }

    pub fn count(&self) -> usize {
        self.read_clients().len()
    }

    /// Total deliveries dropped because a client's queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    fn read_clients(&self) -> RwLockReadGuard<'_, HashMap<String, Client>> {
        self.clients.read().unwrap_or_else(|poisoned| {
            tracing::error!("client registry lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write_clients(&self) -> RwLockWriteGuard<'_, HashMap<String, Client>> {
        self.clients.write().unwrap_or_else(|poisoned| {
            tracing::error!("client registry lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str) -> Event {
        Event::new(id, "observation", "{}")
    }

    #[test]
    fn add_assigns_unique_ids() {
        let registry = ClientRegistry::default();
        let a = registry.add("");
        let b = registry.add("7");
        assert!(!a.client.id.is_empty());
        assert_ne!(a.client.id, b.client.id);
        assert_eq!(b.client.last_event_id, "7");
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn broadcast_reaches_every_client() {
        let registry = ClientRegistry::default();
        let mut a = registry.add("");
        let mut b = registry.add("");

        assert_eq!(registry.broadcast(&event("1")), 2);
        assert_eq!(a.events.try_recv().unwrap().id, "1");
        assert_eq!(b.events.try_recv().unwrap().id, "1");
    }

    #[test]
    fn removed_client_is_unreachable() {
        let registry = ClientRegistry::default();
        let mut a = registry.add("");
        let id = a.client.id.clone();
        drop(a.client);

        assert!(registry.remove(&id));
        assert!(registry.get(&id).is_none());
        assert_eq!(registry.count(), 0);
        assert_eq!(registry.broadcast(&event("1")), 0);
        // Registry held the last sender, so the queue is now closed.
        assert!(matches!(
            a.events.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert!(!registry.remove(&id));
    }

    #[test]
    fn full_queue_drops_without_blocking_others() {
        let registry = ClientRegistry::new(2);
        let slow = registry.add("");
        let mut fast = registry.add("");

        for i in 0..5 {
            registry.broadcast(&event(&i.to_string()));
            // Keep the fast client drained.
            assert_eq!(fast.events.try_recv().unwrap().id, i.to_string());
        }

        assert_eq!(slow.client.queued(), 2);
        assert_eq!(registry.dropped(), 3);
    }

    #[test]
    fn get_returns_registered_client() {
        let registry = ClientRegistry::default();
        let reg = registry.add("42");
        let found = registry.get(&reg.client.id).expect("client should be registered");
        assert_eq!(found.last_event_id, "42");
        assert_eq!(found.created_at, reg.client.created_at);
    }
}
