//! HTTP client for the backend automation service.
//!
//! Unary calls are JSON-RPC 2.0 POSTs to `{base}/rpc`. Subscriptions are
//! opened with `POST {base}/subscribe`; the response headers carry the
//! subscription id and state and the body streams one JSON observation per
//! line until the backend closes it.

use async_trait::async_trait;
use futures_util::stream::{self, Stream, StreamExt};
use relay_hub::{Backend, BackendError, ObservationStream, Subscription, SubscriptionState};
use relay_types::jsonrpc::{INVALID_PARAMS, METHOD_NOT_FOUND};
use relay_types::{JsonRpcRequest, JsonRpcResponse, RequestId};
use reqwest::StatusCode;
use serde_json::Value;
use std::fmt::Display;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Response header carrying the backend's subscription id.
pub const SUBSCRIPTION_ID_HEADER: &str = "x-subscription-id";
/// Response header carrying the subscription's initial state.
pub const SUBSCRIPTION_STATE_HEADER: &str = "x-subscription-state";

/// Backend reached over HTTP.
#[derive(Debug)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    next_id: AtomicI64,
}

impl HttpBackend {
    /// Creates a client for the backend at `base_url`.
    ///
    /// `timeout` bounds connection setup and unary calls. Subscription bodies
    /// are long-lived and are not subject to it.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .user_agent(concat!("relay-server/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            next_id: AtomicI64::new(1),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, BackendError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(RequestId::Number(id), method, params);

        let response = self
            .client
            .post(self.url("rpc"))
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, method));
        }

        let body: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Protocol(format!("invalid rpc response: {e}")))?;

        match (body.result, body.error) {
            (_, Some(error)) => Err(match error.code {
                METHOD_NOT_FOUND => BackendError::MethodNotFound(error.message),
                INVALID_PARAMS => BackendError::InvalidParams(error.message),
                code => BackendError::Remote {
                    code,
                    message: error.message,
                },
            }),
            (Some(result), None) => Ok(result),
            (None, None) => Err(BackendError::Protocol(
                "rpc response carries neither result nor error".to_string(),
            )),
        }
    }

    async fn subscribe(
        &self,
        params: Option<Value>,
        ctx: CancellationToken,
    ) -> Result<Subscription, BackendError> {
        let request = self
            .client
            .post(self.url("subscribe"))
            .json(&params.unwrap_or(Value::Null))
            .send();

        let response = tokio::select! {
            _ = ctx.cancelled() => {
                return Err(BackendError::Unavailable("subscription cancelled before it opened".to_string()));
            }
            response = request => response.map_err(transport_error)?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, "subscribe"));
        }

        let headers = response.headers();
        let id = headers
            .get(SUBSCRIPTION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                BackendError::Protocol(format!("missing {SUBSCRIPTION_ID_HEADER} header"))
            })?
            .to_string();
        let state = match headers
            .get(SUBSCRIPTION_STATE_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            Some(raw) => raw.parse()?,
            None => SubscriptionState::Active,
        };

        tracing::debug!(subscription_id = %id, state = %state, "backend subscription opened");
        let observations = ndjson_stream(response.bytes_stream())
            .take_until(ctx.cancelled_owned())
            .boxed();
        Ok(Subscription::new(id, state, observations))
    }
}

fn transport_error(error: reqwest::Error) -> BackendError {
    if error.is_connect() || error.is_timeout() {
        BackendError::Unavailable(error.to_string())
    } else {
        BackendError::Protocol(error.to_string())
    }
}

fn status_error(status: StatusCode, method: &str) -> BackendError {
    match status {
        StatusCode::NOT_FOUND => BackendError::MethodNotFound(method.to_string()),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            BackendError::InvalidParams(format!("backend answered {status}"))
        }
        s if s.is_server_error() => BackendError::Unavailable(format!("backend answered {s}")),
        s => BackendError::Protocol(format!("unexpected backend status {s}")),
    }
}

/// Splits a byte stream into newline-delimited JSON values.
///
/// Blank lines are skipped and a final line without a trailing newline is
/// still parsed. The stream ends after the first malformed line or transport
/// error, which is yielded as an `Err`.
pub fn ndjson_stream<S, B, E>(body: S) -> ObservationStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Display + Send,
{
    let body = Box::pin(body);
    stream::unfold(Some((body, Vec::<u8>::new())), |state| async move {
        let (mut body, mut buf) = state?;
        loop {
            if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                if line.trim_ascii().is_empty() {
                    continue;
                }
                return Some(match parse_line(&line) {
                    Ok(value) => (Ok(value), Some((body, buf))),
                    Err(e) => (Err(e), None),
                });
            }

            match body.next().await {
                Some(Ok(chunk)) => buf.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => return Some((Err(BackendError::Stream(e.to_string())), None)),
                None => {
                    if buf.trim_ascii().is_empty() {
                        return None;
                    }
                    return Some((parse_line(&buf), None));
                }
            }
        }
    })
    .boxed()
}

fn parse_line(line: &[u8]) -> Result<Value, BackendError> {
    serde_json::from_slice(line.trim_ascii())
        .map_err(|e| BackendError::Protocol(format!("malformed observation: {e}")))
}
