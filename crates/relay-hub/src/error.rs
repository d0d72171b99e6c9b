//! Error types for the event hub.

/// Errors returned by [`crate::Hub`] operations.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// The hub has been closed; no further events are accepted.
    #[error("hub is closed")]
    Closed,

    /// A payload could not be serialized to JSON.
    #[error("hub serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A bridge is already running for this subscription.
    #[error("subscription {0} is already bridged")]
    AlreadyBridged(String),
}

/// Errors reported by a [`crate::Backend`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The backend could not be reached or refused the connection.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The backend does not implement the requested method.
    #[error("backend method not found: {0}")]
    MethodNotFound(String),

    /// The backend rejected the request parameters.
    #[error("backend rejected params: {0}")]
    InvalidParams(String),

    /// The backend answered with something that does not follow the protocol.
    #[error("backend protocol error: {0}")]
    Protocol(String),

    /// A server-push stream failed mid-flight.
    #[error("backend stream error: {0}")]
    Stream(String),

    /// The backend returned an application error.
    #[error("backend error {code}: {message}")]
    Remote { code: i64, message: String },
}
