#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use relay_hub::{Backend, BackendError, Hub, HubConfig, NoBackend, Subscription, SubscriptionState};
use relay_server::config::Config;
use relay_server::{app, AppState};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub fn test_state(hub: Hub) -> AppState {
    AppState::new(hub, Arc::new(NoBackend), &Config::default())
}

pub fn small_hub(replay_capacity: usize) -> Hub {
    Hub::new(HubConfig {
        replay_capacity,
        client_queue_capacity: 64,
    })
}

/// Serves `state` on an ephemeral port and returns its base URL.
pub async fn spawn_server(state: AppState) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app(state)).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Polls `check` until it holds or five seconds pass.
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// One parsed SSE frame.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Frame {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
    pub comment: Option<String>,
}

impl Frame {
    pub fn json(&self) -> Value {
        serde_json::from_str(&self.data).expect("frame data should be JSON")
    }
}

/// Incremental reader for a `text/event-stream` response body.
pub struct SseReader {
    response: reqwest::Response,
    buffer: String,
}

impl SseReader {
    pub fn new(response: reqwest::Response) -> Self {
        Self {
            response,
            buffer: String::new(),
        }
    }

    /// Next frame, or `None` once the server ends the stream.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            if let Some(pos) = self.buffer.find("\n\n") {
                let raw: String = self.buffer.drain(..pos + 2).collect();
                return Some(parse_frame(&raw[..pos]));
            }
            let chunk = tokio::time::timeout(Duration::from_secs(5), self.response.chunk())
                .await
                .expect("timed out waiting for stream frame")
                .expect("stream read failed");
            match chunk {
                Some(bytes) => self.buffer.push_str(&String::from_utf8_lossy(&bytes)),
                None => return None,
            }
        }
    }

    /// Next frame that is not a heartbeat comment.
    pub async fn next_event(&mut self) -> Frame {
        loop {
            let frame = self.next_frame().await.expect("stream ended early");
            if frame.comment.is_none() {
                return frame;
            }
        }
    }
}

fn parse_frame(raw: &str) -> Frame {
    let mut frame = Frame::default();
    let mut data = Vec::new();
    for line in raw.lines() {
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "" => frame.comment = Some(value.to_string()),
            "id" => frame.id = Some(value.to_string()),
            "event" => frame.event = Some(value.to_string()),
            "data" => data.push(value.to_string()),
            _ => {}
        }
    }
    frame.data = data.join("\n");
    frame
}

/// In-memory backend recording calls and handing out test-fed subscriptions.
#[derive(Default)]
pub struct FakeBackend {
    pub calls: Mutex<Vec<(String, Option<Value>)>>,
    pub subscription_state: Mutex<Option<SubscriptionState>>,
    pub feeds: Mutex<Vec<mpsc::UnboundedSender<Result<Value, BackendError>>>>,
    pub contexts: Mutex<Vec<CancellationToken>>,
}

impl FakeBackend {
    pub fn feed(&self, index: usize) -> mpsc::UnboundedSender<Result<Value, BackendError>> {
        self.feeds.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, BackendError> {
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), params.clone()));
        match method {
            "echo" => Ok(json!({ "method": method, "params": params })),
            "fail" => Err(BackendError::Remote {
                code: 4001,
                message: "element not found".to_string(),
            }),
            _ => Err(BackendError::MethodNotFound(method.to_string())),
        }
    }

    async fn subscribe(
        &self,
        _params: Option<Value>,
        ctx: CancellationToken,
    ) -> Result<Subscription, BackendError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut feeds = self.feeds.lock().unwrap();
        let id = format!("sub-{}", feeds.len() + 1);
        feeds.push(tx);
        self.contexts.lock().unwrap().push(ctx);

        let state = self
            .subscription_state
            .lock()
            .unwrap()
            .unwrap_or(SubscriptionState::Active);
        let observations = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();
        Ok(Subscription::new(id, state, observations))
    }
}
