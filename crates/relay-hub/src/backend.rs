//! The backend automation service, as seen by the hub.
//!
//! The backend offers unary request/response operations and a server-push
//! operation per subscription. Concrete clients live outside this crate;
//! `relay-server` ships an HTTP implementation.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::BackendError;

/// Items pushed by the backend for one subscription.
///
/// The stream ends when the backend closes the subscription. An `Err` item
/// is terminal: the bridge stops after the first one.
pub type ObservationStream = BoxStream<'static, Result<Value, BackendError>>;

/// Lifecycle state the backend reports when a subscription is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl SubscriptionState {
    /// Terminal subscriptions will never produce items and are not bridged.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionState {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" | "running" | "pending" => Ok(Self::Active),
            "completed" | "done" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            other => Err(BackendError::Protocol(format!(
                "unknown subscription state: {other}"
            ))),
        }
    }
}

/// An opened backend subscription.
pub struct Subscription {
    pub id: String,
    pub state: SubscriptionState,
    pub observations: ObservationStream,
}

impl Subscription {
    pub fn new(id: impl Into<String>, state: SubscriptionState, observations: ObservationStream) -> Self {
        Self {
            id: id.into(),
            state,
            observations,
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// A backend automation service.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Performs a unary operation.
    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, BackendError>;

    /// Opens a server-push subscription.
    ///
    /// `ctx` is cancelled when the subscription's bridge stops (shutdown,
    /// unsubscribe, or stream end); implementations should abandon any
    /// in-flight work for the subscription when it fires.
    async fn subscribe(
        &self,
        params: Option<Value>,
        ctx: CancellationToken,
    ) -> Result<Subscription, BackendError>;
}

/// Backend used when none is configured: every operation reports it unavailable.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackend;

#[async_trait]
impl Backend for NoBackend {
    async fn call(&self, _method: &str, _params: Option<Value>) -> Result<Value, BackendError> {
        Err(BackendError::Unavailable("no backend configured".to_string()))
    }

    async fn subscribe(
        &self,
        _params: Option<Value>,
        _ctx: CancellationToken,
    ) -> Result<Subscription, BackendError> {
        Err(BackendError::Unavailable("no backend configured".to_string()))
    }
}
