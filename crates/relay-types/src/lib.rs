//! Shared wire types for the relay workspace.
//!
//! This crate holds the types that cross crate boundaries: the [`Event`]
//! delivered to stream subscribers, the terminal-event payloads and their
//! [`ReconnectHint`], and the JSON-RPC 2.0 envelope used by the
//! request/response route.
//!
//! No crate in the workspace depends on anything *except* `relay-types` for
//! cross-cutting type definitions.

pub mod jsonrpc;

pub use jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestId, JSONRPC_VERSION};

use serde::{Deserialize, Serialize};

/// Event type for a single backend observation forwarded by a bridge.
pub const EVENT_OBSERVATION: &str = "observation";
/// Event type emitted when a subscription starts streaming.
pub const EVENT_SUBSCRIBED: &str = "subscribed";
/// Event type emitted when a bridged subscription stops for any reason other than shutdown.
pub const EVENT_STREAM_END: &str = "stream_end";
/// Event type emitted when the server is shutting down.
pub const EVENT_SHUTDOWN: &str = "shutdown";
/// Event type emitted when a reconnecting client asked for an id the replay log no longer holds.
pub const EVENT_REPLAY_GAP: &str = "replay_gap";

/// A single event delivered to stream subscribers.
///
/// Events are immutable once created. Identifiers are assigned by the hub
/// from a process-wide counter, so they are monotonically increasing in
/// broadcast order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Process-wide event identifier, echoed back by clients as `Last-Event-ID`.
    pub id: String,
    /// Type tag, sent as the SSE `event:` field.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Serialized JSON payload, sent verbatim as the SSE `data:` field.
    pub payload: String,
}

impl Event {
    pub fn new(id: impl Into<String>, event_type: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            event_type: event_type.into(),
            payload: payload.into(),
        }
    }
}

/// What a remote client should do after a subscription stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectHint {
    /// Open a new subscription; the old one will not produce more items.
    Resubscribe,
    /// The subscription finished; fetch its final state with a unary call.
    Poll,
    /// The backend is temporarily unavailable; retry after a delay.
    Wait,
    /// Reconnect to the event stream with `Last-Event-ID` to replay what was missed.
    Resume,
}

impl ReconnectHint {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resubscribe => "resubscribe",
            Self::Poll => "poll",
            Self::Wait => "wait",
            Self::Resume => "resume",
        }
    }
}

impl std::fmt::Display for ReconnectHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a bridged subscription stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The backend closed the stream normally.
    Completed,
    /// The backend reported an error.
    Failed,
    /// The subscription was cancelled by an `unsubscribe` request.
    Cancelled,
}

/// Payload of an `observation` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationPayload {
    pub subscription_id: String,
    pub observation: serde_json::Value,
}

/// Payload of a `subscribed` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribedPayload {
    pub subscription_id: String,
}

/// Payload of a `stream_end` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEndPayload {
    pub subscription_id: String,
    pub reason: EndReason,
    pub hint: ReconnectHint,
    /// Human-readable error detail when `reason` is `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Suggested delay before acting on the hint, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// Payload of a `shutdown` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownPayload {
    pub reason: String,
    /// Always [`ReconnectHint::Resume`]: missed events can be replayed after reconnecting.
    pub hint: ReconnectHint,
    /// Set when the shutdown concerns a single subscription.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    /// The last event id the server broadcast, to pass as `Last-Event-ID`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_id: Option<String>,
}

/// Payload of a `replay_gap` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayGapPayload {
    pub last_event_id: String,
    pub hint: ReconnectHint,
}
