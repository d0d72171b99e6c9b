//! The fan-out hub shared by every stream connection and bridge.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use relay_types::Event;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::HubError;
use crate::registry::{ClientRegistry, DEFAULT_QUEUE_CAPACITY};
use crate::store::EventStore;

/// Default number of events retained for replay.
pub const DEFAULT_REPLAY_CAPACITY: usize = 1000;

/// Sizing for a [`Hub`].
#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    /// Events retained for replay.
    pub replay_capacity: usize,
    /// Per-client outbound queue capacity.
    pub client_queue_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            replay_capacity: DEFAULT_REPLAY_CAPACITY,
            client_queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Point-in-time counters for monitoring.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HubStats {
    pub clients: usize,
    pub stored_events: usize,
    pub last_event_id: Option<String>,
    pub dropped_deliveries: u64,
    pub active_bridges: usize,
    pub shutting_down: bool,
    pub closed: bool,
}

/// Owns the replay log, the client registry, and the shutdown signal.
///
/// Cheap to clone; all clones share the same state.
#[derive(Debug, Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

#[derive(Debug)]
struct HubInner {
    store: EventStore,
    registry: ClientRegistry,
    /// Last assigned event id. Held across append and fan-out so every
    /// client sees events in id order.
    sequence: Mutex<u64>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    /// Cancellation tokens of running bridges, by subscription id.
    bridges: Mutex<HashMap<String, CancellationToken>>,
    tasks: TaskTracker,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                store: EventStore::new(config.replay_capacity),
                registry: ClientRegistry::new(config.client_queue_capacity),
                sequence: Mutex::new(0),
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
                bridges: Mutex::new(HashMap::new()),
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn store(&self) -> &EventStore {
        &self.inner.store
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.inner.registry
    }

    /// Serializes `payload`, assigns the next event id, appends the event to
    /// the replay log and delivers it to every registered client.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] once [`Hub::close`] has been called, or
    /// [`HubError::Serialization`] if the payload cannot be encoded.
    pub fn publish<T: Serialize + ?Sized>(
        &self,
        event_type: &str,
        payload: &T,
    ) -> Result<Event, HubError> {
        let payload = serde_json::to_string(payload)?;
        self.publish_raw(event_type, payload)
    }

    /// Like [`Hub::publish`] for a payload that is already serialized.
    pub fn publish_raw(&self, event_type: &str, payload: String) -> Result<Event, HubError> {
        let mut sequence = lock(&self.inner.sequence);
        // Checked under the sequence lock; `close` takes it before flipping the flag.
        if self.is_closed() {
            return Err(HubError::Closed);
        }
        *sequence += 1;
        let event = Event::new(sequence.to_string(), event_type, payload);
        self.inner.store.add(event.clone());
        let delivered = self.inner.registry.broadcast(&event);
        drop(sequence);

        tracing::debug!(event_id = %event.id, event_type, delivered, "event broadcast");
        Ok(event)
    }

    /// Fire-and-forget variant of [`Hub::publish`]; failures are logged.
    pub fn broadcast<T: Serialize + ?Sized>(&self, event_type: &str, payload: &T) {
        if let Err(e) = self.publish(event_type, payload) {
            tracing::warn!(event_type, "broadcast failed: {}", e);
        }
    }

    /// Id of the newest event in the replay log.
    pub fn last_event_id(&self) -> Option<String> {
        self.inner.store.last_id()
    }

    /// The process-wide shutdown signal. Cancelled by [`Hub::shutdown`] and [`Hub::close`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Signals shutdown and rejects further events. Idempotent.
    pub fn close(&self) {
        let sequence = lock(&self.inner.sequence);
        let already_closed = self.inner.closed.swap(true, Ordering::AcqRel);
        drop(sequence);
        if already_closed {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        tracing::info!("event hub closed");
    }

    /// Signals shutdown, waits up to `grace` for bridges to broadcast their
    /// terminal events and exit, then closes the hub.
    pub async fn shutdown(&self, grace: Duration) {
        tracing::info!(
            bridges = self.active_bridges(),
            clients = self.inner.registry.count(),
            "event hub shutting down"
        );
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        if tokio::time::timeout(grace, self.inner.tasks.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = self.active_bridges(),
                grace_ms = grace.as_millis() as u64,
                "bridges did not exit within shutdown grace period"
            );
        }
        self.close();
    }

    /// Cancels the bridge for `subscription_id`. Returns `false` if none is running.
    pub fn cancel_subscription(&self, subscription_id: &str) -> bool {
        match lock(&self.inner.bridges).get(subscription_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_bridges(&self) -> usize {
        lock(&self.inner.bridges).len()
    }

    pub fn is_bridged(&self, subscription_id: &str) -> bool {
        lock(&self.inner.bridges).contains_key(subscription_id)
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            clients: self.inner.registry.count(),
            stored_events: self.inner.store.len(),
            last_event_id: self.inner.store.last_id(),
            dropped_deliveries: self.inner.registry.dropped(),
            active_bridges: self.active_bridges(),
            shutting_down: self.is_shutting_down(),
            closed: self.is_closed(),
        }
    }

    /// Reserves the bridge slot for a subscription and returns its cancellation token.
    pub(crate) fn register_bridge(&self, subscription_id: &str) -> Result<CancellationToken, HubError> {
        if self.is_closed() || self.is_shutting_down() {
            return Err(HubError::Closed);
        }
        let mut bridges = lock(&self.inner.bridges);
        if bridges.contains_key(subscription_id) {
            return Err(HubError::AlreadyBridged(subscription_id.to_string()));
        }
        let token = CancellationToken::new();
        bridges.insert(subscription_id.to_string(), token.clone());
        Ok(token)
    }

    pub(crate) fn release_bridge(&self, subscription_id: &str) {
        lock(&self.inner.bridges).remove(subscription_id);
    }

    pub(crate) fn tasks(&self) -> &TaskTracker {
        &self.inner.tasks
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::error!("hub lock poisoned, recovering");
        poisoned.into_inner()
    })
}
