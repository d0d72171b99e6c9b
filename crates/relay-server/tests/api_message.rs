mod common;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use common::{test_state, wait_until, FakeBackend};
use relay_hub::{Backend, Hub, SubscriptionState};
use relay_server::{app, AppState};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

fn fake_state(hub: Hub, backend: Arc<dyn Backend>) -> AppState {
    let mut state = test_state(hub);
    state.backend = backend;
    state
}

async fn post_message(state: AppState, body: &str) -> (StatusCode, Option<Value>) {
    let response = app(state)
        .oneshot(
            Request::post("/message")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        None
    } else {
        Some(serde_json::from_slice(&bytes).unwrap())
    };
    (status, json)
}

#[tokio::test]
async fn unparseable_body_is_a_parse_error() {
    let (status, body) = post_message(test_state(Hub::default()), "{not json").await;
    let body = body.unwrap();
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["jsonrpc"], "2.0");
    assert_eq!(body["error"]["code"], -32700);
    assert!(body["id"].is_null());
}

#[tokio::test]
async fn malformed_envelopes_are_invalid_requests() {
    let state = test_state(Hub::default());

    let (status, body) = post_message(state.clone(), r#"{"jsonrpc":"1.0","id":1,"method":"echo"}"#).await;
    let body = body.unwrap();
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], -32600);
    assert_eq!(body["id"], 1);

    let (status, body) = post_message(state.clone(), r#"{"jsonrpc":"2.0","id":"abc"}"#).await;
    let body = body.unwrap();
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], -32600);
    assert_eq!(body["id"], "abc");

    let (status, _) = post_message(state, r#"{"jsonrpc":"2.0","id":2,"method":"  "}"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn requests_are_forwarded_to_backend() {
    let backend = Arc::new(FakeBackend::default());
    let state = fake_state(Hub::default(), backend.clone());

    let (status, body) = post_message(
        state,
        r##"{"jsonrpc":"2.0","id":7,"method":"echo","params":{"selector":"#login"}}"##,
    )
    .await;
    let body = body.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], 7);
    assert_eq!(body["result"]["method"], "echo");
    assert_eq!(body["result"]["params"]["selector"], "#login");
    assert!(body.get("error").is_none());
    assert_eq!(backend.calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn backend_errors_become_jsonrpc_errors() {
    let backend = Arc::new(FakeBackend::default());
    let state = fake_state(Hub::default(), backend);

    let (status, body) = post_message(state.clone(), r#"{"jsonrpc":"2.0","id":1,"method":"nope"}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.unwrap()["error"]["code"], -32601);

    let (_, body) = post_message(state, r#"{"jsonrpc":"2.0","id":2,"method":"fail"}"#).await;
    let body = body.unwrap();
    assert_eq!(body["error"]["code"], 4001);
    assert_eq!(body["error"]["message"], "element not found");
}

#[tokio::test]
async fn missing_backend_reports_unavailable() {
    let (status, body) = post_message(
        test_state(Hub::default()),
        r#"{"jsonrpc":"2.0","id":1,"method":"page.title"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.unwrap()["error"]["code"], -32000);
}

#[tokio::test]
async fn notifications_are_accepted_without_body() {
    let backend = Arc::new(FakeBackend::default());
    let state = fake_state(Hub::default(), backend.clone());

    let (status, body) = post_message(state, r#"{"jsonrpc":"2.0","method":"echo","params":[1]}"#).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(body.is_none());
    assert_eq!(backend.calls.lock().unwrap()[0].0, "echo");
}

#[tokio::test]
async fn subscribe_bridges_and_unsubscribe_cancels() {
    let hub = Hub::default();
    let backend = Arc::new(FakeBackend::default());
    let state = fake_state(hub.clone(), backend.clone());
    let mut watcher = hub.registry().add("");

    let (status, body) = post_message(state.clone(), r#"{"jsonrpc":"2.0","id":1,"method":"subscribe"}"#).await;
    let body = body.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["subscriptionId"], "sub-1");
    assert_eq!(body["result"]["state"], "active");
    assert_eq!(body["result"]["bridged"], true);
    assert!(hub.is_bridged("sub-1"));

    backend.feed(0).send(Ok(json!({"url": "https://example.com"}))).unwrap();
    wait_until("observation broadcast", || hub.store().len() == 2).await;
    assert_eq!(watcher.events.try_recv().unwrap().event_type, "subscribed");
    let observation = watcher.events.try_recv().unwrap();
    assert_eq!(observation.event_type, "observation");
    let payload: Value = serde_json::from_str(&observation.payload).unwrap();
    assert_eq!(payload["subscriptionId"], "sub-1");
    assert_eq!(payload["observation"]["url"], "https://example.com");

    let (_, body) = post_message(
        state.clone(),
        r#"{"jsonrpc":"2.0","id":2,"method":"unsubscribe","params":{"subscriptionId":"sub-1"}}"#,
    )
    .await;
    assert_eq!(body.unwrap()["result"]["cancelled"], true);
    wait_until("bridge exit", || hub.active_bridges() == 0).await;
    assert!(backend.contexts.lock().unwrap()[0].is_cancelled());

    let last = hub.store().get_since("2");
    assert_eq!(last.len(), 1);
    assert_eq!(last[0].event_type, "stream_end");
    let payload: Value = serde_json::from_str(&last[0].payload).unwrap();
    assert_eq!(payload["reason"], "cancelled");

    let (_, body) = post_message(
        state,
        r#"{"jsonrpc":"2.0","id":3,"method":"unsubscribe","params":{"subscriptionId":"sub-1"}}"#,
    )
    .await;
    assert_eq!(body.unwrap()["result"]["cancelled"], false);
}

#[tokio::test]
async fn terminal_subscription_is_reported_but_not_bridged() {
    let hub = Hub::default();
    let backend = Arc::new(FakeBackend::default());
    *backend.subscription_state.lock().unwrap() = Some(SubscriptionState::Completed);
    let state = fake_state(hub.clone(), backend.clone());

    let (_, body) = post_message(state, r#"{"jsonrpc":"2.0","id":1,"method":"subscribe"}"#).await;
    let body = body.unwrap();
    let result = &body["result"];
    assert_eq!(result["state"], "completed");
    assert_eq!(result["bridged"], false);
    assert_eq!(hub.active_bridges(), 0);
    assert!(hub.store().is_empty());
    assert!(backend.contexts.lock().unwrap()[0].is_cancelled());
}

#[tokio::test]
async fn unsubscribe_requires_subscription_id() {
    let (_, body) = post_message(
        test_state(Hub::default()),
        r#"{"jsonrpc":"2.0","id":1,"method":"unsubscribe","params":{}}"#,
    )
    .await;
    assert_eq!(body.unwrap()["error"]["code"], -32602);
}

#[tokio::test]
async fn subscribe_after_shutdown_is_unavailable() {
    let hub = Hub::default();
    let backend = Arc::new(FakeBackend::default());
    hub.close();
    let state = fake_state(hub, backend.clone());

    let (_, body) = post_message(state, r#"{"jsonrpc":"2.0","id":1,"method":"subscribe"}"#).await;
    assert_eq!(body.unwrap()["error"]["code"], -32000);
    assert!(backend.feeds.lock().unwrap().is_empty());
}

#[tokio::test]
async fn null_id_is_answered_like_any_request() {
    let backend = Arc::new(FakeBackend::default());
    let state = fake_state(Hub::default(), backend.clone());

    let (status, body) = post_message(
        state.clone(),
        r#"{"jsonrpc":"2.0","id":null,"method":"echo"}"#,
    )
    .await;
    let body = body.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert!(body["id"].is_null());
    assert_eq!(body["result"]["method"], "echo");

    let (status, body) = post_message(
        test_state(Hub::default()),
        r#"{"jsonrpc":"2.0","id":null,"method":"page.title"}"#,
    )
    .await;
    let body = body.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert!(body["id"].is_null());
    assert_eq!(body["error"]["code"], -32000);
    assert_eq!(backend.calls.lock().unwrap().len(), 1);
}
