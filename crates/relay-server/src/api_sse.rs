//! SSE event stream handler.
//!
//! Each connection registers a client with the hub, replays what the client
//! missed, then streams live events until the client goes away, the stream
//! deadline passes, or the server shuts down.

use crate::AppState;
use axum::{
    extract::{Extension, Query},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, Sse},
        IntoResponse, Response,
    },
};
use futures_util::stream::{self, StreamExt};
use relay_hub::{Hub, Replay};
use relay_types::{
    Event, ReconnectHint, ReplayGapPayload, ShutdownPayload, EVENT_REPLAY_GAP, EVENT_SHUTDOWN,
};
use serde::Deserialize;
use std::collections::HashSet;
use std::convert::Infallible;
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tokio_util::sync::CancellationToken;

/// Header carrying the id of the last event a reconnecting client received.
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";

/// Query parameters for `GET /events`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    /// Fallback for `Last-Event-ID` when the client cannot set headers.
    pub last_event_id: Option<String>,
}

/// Handler for `GET /events`.
///
/// Streams hub events as SSE frames (`id`, `event`, `data`), preceded by a
/// replay of everything after the client's `Last-Event-ID`. Idle connections
/// receive a `: ping` comment every heartbeat interval.
pub async fn events_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<EventsQuery>,
    headers: HeaderMap,
) -> Response {
    let hub = &state.hub;
    if hub.is_closed() || hub.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server is shutting down").into_response();
    }

    let last_event_id = headers
        .get(LAST_EVENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or(params.last_event_id)
        .unwrap_or_default();

    // Register before taking the replay snapshot: anything broadcast in
    // between lands in the queue and is de-duplicated below.
    let registration = hub.registry().add(last_event_id.clone());
    let client_id = registration.client.id.clone();
    let guard = ClientGuard {
        hub: hub.clone(),
        client_id: client_id.clone(),
    };

    let mut initial = Vec::new();
    let mut replayed = HashSet::new();
    match hub.store().replay(&last_event_id) {
        Replay::Events(events) => {
            for event in &events {
                replayed.insert(event.id.clone());
                initial.push(to_sse(event));
            }
        }
        Replay::Gap => {
            tracing::warn!(
                client_id = %client_id,
                last_event_id = %last_event_id,
                "requested replay point is no longer available"
            );
            initial.push(replay_gap_frame(&last_event_id));
        }
        Replay::Fresh | Replay::UpToDate => {}
    }

    tracing::info!(
        client_id = %client_id,
        last_event_id = %last_event_id,
        replayed = replayed.len(),
        clients = hub.registry().count(),
        "stream client connected"
    );

    let connection = Connection {
        guard,
        events: registration.events,
        heartbeat: heartbeat_interval(state.heartbeat),
        shutdown: hub.shutdown_token(),
        deadline: state
            .stream_deadline
            .map(|limit| Box::pin(tokio::time::sleep(limit))),
        replayed,
        finished: false,
    };

    let live = stream::unfold(connection, |mut connection| async move {
        connection
            .next_frame()
            .await
            .map(|frame| (frame, connection))
    });
    let frames = stream::iter(initial).chain(live).map(Ok::<_, Infallible>);

    Sse::new(frames).into_response()
}

/// Deregisters the client when the connection's stream is dropped.
///
/// Hyper drops the response body as soon as the peer disconnects, so this
/// covers client disconnects as well as normal termination.
struct ClientGuard {
    hub: Hub,
    client_id: String,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.hub.registry().remove(&self.client_id);
        tracing::info!(
            client_id = %self.client_id,
            clients = self.hub.registry().count(),
            "stream client disconnected"
        );
    }
}

/// Live half of a stream connection.
struct Connection {
    guard: ClientGuard,
    events: mpsc::Receiver<Event>,
    heartbeat: Interval,
    shutdown: CancellationToken,
    deadline: Option<Pin<Box<Sleep>>>,
    /// Ids already sent by the replay that may still be sitting in the queue.
    replayed: HashSet<String>,
    finished: bool,
}

impl Connection {
    /// Waits for the next frame to send, or `None` when the stream should end.
    async fn next_frame(&mut self) -> Option<SseEvent> {
        if self.finished {
            return None;
        }

        let Self {
            guard,
            events,
            heartbeat,
            shutdown,
            deadline,
            replayed,
            finished,
        } = self;

        loop {
            let expired = async {
                match deadline.as_mut() {
                    Some(sleep) => sleep.as_mut().await,
                    None => pending().await,
                }
            };

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    *finished = true;
                    tracing::debug!(client_id = %guard.client_id, "closing stream for shutdown");
                    return Some(shutdown_frame(guard.hub.last_event_id()));
                }
                _ = expired => {
                    tracing::debug!(client_id = %guard.client_id, "stream deadline reached");
                    return None;
                }
                received = events.recv() => match received {
                    Some(event) => {
                        if !replayed.is_empty() && replayed.remove(&event.id) {
                            continue;
                        }
                        heartbeat.reset();
                        return Some(to_sse(&event));
                    }
                    // Deregistered elsewhere; nothing more will arrive.
                    None => return None,
                },
                _ = heartbeat.tick() => return Some(SseEvent::default().comment("ping")),
            }
        }
    }
}

fn heartbeat_interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

fn to_sse(event: &Event) -> SseEvent {
    SseEvent::default()
        .id(event.id.as_str())
        .event(event.event_type.as_str())
        .data(event.payload.as_str())
}

fn shutdown_frame(last_event_id: Option<String>) -> SseEvent {
    let payload = ShutdownPayload {
        reason: "server shutting down".to_string(),
        hint: ReconnectHint::Resume,
        subscription_id: None,
        last_event_id,
    };
    json_frame(EVENT_SHUTDOWN, &payload)
}

fn replay_gap_frame(last_event_id: &str) -> SseEvent {
    let payload = ReplayGapPayload {
        last_event_id: last_event_id.to_string(),
        hint: ReconnectHint::Resubscribe,
    };
    json_frame(EVENT_REPLAY_GAP, &payload)
}

/// Builds an id-less frame, so the client's `Last-Event-ID` keeps pointing at a real event.
fn json_frame<T: serde::Serialize>(event_type: &str, payload: &T) -> SseEvent {
    match serde_json::to_string(payload) {
        Ok(data) => SseEvent::default().event(event_type).data(data),
        Err(e) => {
            tracing::error!(event_type, "failed to serialize stream frame: {}", e);
            SseEvent::default().event(event_type).data("{}")
        }
    }
}
