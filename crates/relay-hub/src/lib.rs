//! In-process event delivery core for the relay server.
//!
//! The [`Hub`] owns a bounded replay log ([`EventStore`]) and the registry of
//! connected stream clients ([`ClientRegistry`]). Producers call
//! [`Hub::publish`]; each event gets the next process-wide id, is appended to
//! the log, and is offered to every client's bounded queue without blocking.
//! Clients that fall behind lose events and recover them through replay.
//!
//! Backend subscriptions are fed in by bridges, one per active subscription,
//! started with [`spawn_bridge`] and controlled through the returned
//! [`BridgeHandle`]. Every bridge observes the hub's shutdown signal and
//! emits exactly one terminal event.
//!
//! # Usage
//!
//! ```rust,ignore
//! use relay_hub::{spawn_bridge, Hub, HubConfig};
//!
//! let hub = Hub::new(HubConfig::default());
//! let ctx = tokio_util::sync::CancellationToken::new();
//! let subscription = backend.subscribe(params, ctx.clone()).await?;
//! spawn_bridge(&hub, subscription, ctx)?;
//!
//! // On SIGTERM:
//! hub.shutdown(std::time::Duration::from_secs(5)).await;
//! ```

mod backend;
mod bridge;
mod error;
mod hub;
mod registry;
mod store;

pub use backend::{Backend, NoBackend, ObservationStream, Subscription, SubscriptionState};
pub use bridge::{relay_blocking, spawn_bridge, BridgeExit, BridgeHandle};
pub use error::{BackendError, HubError};
pub use hub::{Hub, HubConfig, HubStats, DEFAULT_REPLAY_CAPACITY};
pub use registry::{Client, ClientRegistry, Registration, DEFAULT_QUEUE_CAPACITY};
pub use store::{EventStore, Replay};
