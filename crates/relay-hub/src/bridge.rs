//! Bridges one backend subscription into the hub.
//!
//! A bridge forwards every backend observation as an `observation` event and
//! converts the end of the subscription into exactly one terminal event.
//!
//! ```text
//! start     → publish `subscribed`
//! item      → publish `observation`                 → keep going
//! end       → publish `stream_end` (completed/poll)  → stop
//! error     → publish `stream_end` (failed/hint)     → stop
//! unsubscribe → cancel backend ctx → `stream_end` (cancelled/resubscribe) → stop
//! shutdown  → cancel backend ctx → publish `shutdown` (resume)            → stop
//! ```
//!
//! The outer loop selects over the shutdown signal, the subscription's own
//! cancellation, and the next observation. Dropping the pending `next()`
//! future is how a receive is abandoned; backends whose client can only do a
//! blocking receive go through [`relay_blocking`] instead.

use futures_util::stream::{self, StreamExt};
use relay_types::{
    EndReason, ObservationPayload, ReconnectHint, ShutdownPayload, StreamEndPayload,
    SubscribedPayload, EVENT_OBSERVATION, EVENT_SHUTDOWN, EVENT_STREAM_END, EVENT_SUBSCRIBED,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{ObservationStream, Subscription};
use crate::error::{BackendError, HubError};
use crate::hub::Hub;

/// Delay suggested to clients when the backend is unavailable.
const UNAVAILABLE_RETRY_MS: u64 = 1000;

/// How a bridge stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeExit {
    /// The backend closed the stream.
    Completed,
    /// The backend reported an error.
    Failed,
    /// The subscription was cancelled.
    Cancelled,
    /// The hub's shutdown signal fired.
    Shutdown,
    /// The hub was closed before the bridge noticed shutdown.
    HubClosed,
}

/// Handle to a running bridge.
#[derive(Debug)]
pub struct BridgeHandle {
    subscription_id: String,
    cancel: CancellationToken,
    join: JoinHandle<BridgeExit>,
}

impl BridgeHandle {
    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    /// Requests the bridge to stop; it publishes a `stream_end` event on its way out.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the bridge task to finish.
    pub async fn join(self) -> BridgeExit {
        match self.join.await {
            Ok(exit) => exit,
            Err(e) => {
                tracing::error!(subscription_id = %self.subscription_id, "bridge task failed: {}", e);
                BridgeExit::Failed
            }
        }
    }
}

/// Starts a bridge for `subscription` on the hub's task tracker.
///
/// `backend_ctx` is the token the subscription was opened with; the bridge
/// cancels it when it stops. A `subscribed` event is published before the
/// task starts. Returns `Ok(None)` without spawning or publishing anything if
/// the subscription is already terminal.
///
/// # Errors
///
/// [`HubError::Closed`] once shutdown has begun, or
/// [`HubError::AlreadyBridged`] if a bridge for this subscription id is running.
pub fn spawn_bridge(
    hub: &Hub,
    subscription: Subscription,
    backend_ctx: CancellationToken,
) -> Result<Option<BridgeHandle>, HubError> {
    if subscription.state.is_terminal() {
        tracing::info!(
            subscription_id = %subscription.id,
            state = %subscription.state,
            "subscription already terminal, not bridging"
        );
        backend_ctx.cancel();
        return Ok(None);
    }

    let cancel = match hub.register_bridge(&subscription.id) {
        Ok(token) => token,
        Err(e) => {
            backend_ctx.cancel();
            return Err(e);
        }
    };
    let subscription_id = subscription.id.clone();
    hub.broadcast(
        EVENT_SUBSCRIBED,
        &SubscribedPayload {
            subscription_id: subscription_id.clone(),
        },
    );
    let bridge = StreamBridge {
        hub: hub.clone(),
        subscription_id: subscription.id,
        observations: subscription.observations,
        backend_ctx,
        cancel: cancel.clone(),
    };
    let join = hub.tasks().spawn(bridge.run());

    tracing::info!(subscription_id = %subscription_id, "bridge started");
    Ok(Some(BridgeHandle {
        subscription_id,
        cancel,
        join,
    }))
}

/// Forwards one subscription's observations into the hub.
pub(crate) struct StreamBridge {
    hub: Hub,
    subscription_id: String,
    observations: ObservationStream,
    backend_ctx: CancellationToken,
    cancel: CancellationToken,
}

enum Step {
    Shutdown,
    Cancelled,
    Item(Value),
    Failed(BackendError),
    Ended,
}

impl StreamBridge {
    /// Runs until the subscription ends, is cancelled, or the hub shuts down.
    async fn run(mut self) -> BridgeExit {
        let shutdown = self.hub.shutdown_token();
        let exit = loop {
            let step = tokio::select! {
                biased;
                _ = shutdown.cancelled() => Step::Shutdown,
                _ = self.cancel.cancelled() => Step::Cancelled,
                next = self.observations.next() => match next {
                    Some(Ok(item)) => Step::Item(item),
                    Some(Err(e)) => Step::Failed(e),
                    None => Step::Ended,
                },
            };

            match step {
                Step::Item(observation) => {
                    if let Err(e) = self.forward(observation) {
                        tracing::warn!(subscription_id = %self.subscription_id, "stopping bridge: {}", e);
                        break BridgeExit::HubClosed;
                    }
                }
                Step::Shutdown => break self.on_shutdown(),
                Step::Cancelled => break self.on_cancelled(),
                Step::Failed(e) => break self.on_failed(e),
                Step::Ended => break self.on_ended(),
            }
        };

        self.backend_ctx.cancel();
        self.hub.release_bridge(&self.subscription_id);
        tracing::info!(subscription_id = %self.subscription_id, exit = ?exit, "bridge stopped");
        exit
    }

    fn forward(&self, observation: Value) -> Result<(), HubError> {
        let payload = ObservationPayload {
            subscription_id: self.subscription_id.clone(),
            observation,
        };
        self.hub.publish(EVENT_OBSERVATION, &payload).map(|_| ())
    }

    fn on_shutdown(&self) -> BridgeExit {
        // Unblock the backend before announcing, so the upstream stops producing.
        self.backend_ctx.cancel();
        let payload = ShutdownPayload {
            reason: "server shutting down".to_string(),
            hint: ReconnectHint::Resume,
            subscription_id: Some(self.subscription_id.clone()),
            last_event_id: self.hub.last_event_id(),
        };
        self.hub.broadcast(EVENT_SHUTDOWN, &payload);
        BridgeExit::Shutdown
    }

    fn on_cancelled(&self) -> BridgeExit {
        self.backend_ctx.cancel();
        self.end(EndReason::Cancelled, ReconnectHint::Resubscribe, None, None);
        BridgeExit::Cancelled
    }

    fn on_failed(&self, error: BackendError) -> BridgeExit {
        tracing::warn!(subscription_id = %self.subscription_id, "backend stream failed: {}", error);
        let (hint, retry_after_ms) = hint_for(&error);
        self.end(EndReason::Failed, hint, Some(error.to_string()), retry_after_ms);
        BridgeExit::Failed
    }

    fn on_ended(&self) -> BridgeExit {
        self.end(EndReason::Completed, ReconnectHint::Poll, None, None);
        BridgeExit::Completed
    }

    fn end(
        &self,
        reason: EndReason,
        hint: ReconnectHint,
        detail: Option<String>,
        retry_after_ms: Option<u64>,
    ) {
        let payload = StreamEndPayload {
            subscription_id: self.subscription_id.clone(),
            reason,
            hint,
            detail,
            retry_after_ms,
        };
        self.hub.broadcast(EVENT_STREAM_END, &payload);
    }
}

/// Maps a backend failure to what the remote client should do next.
fn hint_for(error: &BackendError) -> (ReconnectHint, Option<u64>) {
    match error {
        BackendError::Unavailable(_) => (ReconnectHint::Wait, Some(UNAVAILABLE_RETRY_MS)),
        BackendError::MethodNotFound(_) | BackendError::InvalidParams(_) => {
            (ReconnectHint::Poll, None)
        }
        BackendError::Protocol(_) | BackendError::Stream(_) | BackendError::Remote { .. } => {
            (ReconnectHint::Resubscribe, None)
        }
    }
}

/// Adapts a blocking receive function into an [`ObservationStream`].
///
/// `recv` runs on a blocking worker thread and hands each result to a
/// single-slot channel. The worker checks `ctx` between receives and exits
/// once the stream is dropped, `recv` returns `None`, or after the first
/// error. `recv` is given `ctx` so a source can wait with a timeout and
/// return `None` once it is cancelled; otherwise a receive in progress runs
/// to completion while the stream side has already stopped waiting.
pub fn relay_blocking<F>(ctx: CancellationToken, mut recv: F) -> ObservationStream
where
    F: FnMut(&CancellationToken) -> Option<Result<Value, BackendError>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(1);
    tokio::task::spawn_blocking(move || {
        while !ctx.is_cancelled() {
            let Some(item) = recv(&ctx) else { break };
            let failed = item.is_err();
            if tx.blocking_send(item).is_err() || failed {
                break;
            }
        }
    });

    stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed()
}
