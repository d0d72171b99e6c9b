//! JSON-RPC 2.0 request/response handler.

use crate::AppState;
use axum::{
    body::Bytes,
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use relay_hub::{spawn_bridge, BackendError, HubError};
use relay_types::jsonrpc::{RequestId, BACKEND_UNAVAILABLE};
use relay_types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Method that opens a backend subscription and bridges it into the hub.
pub const METHOD_SUBSCRIBE: &str = "subscribe";
/// Method that cancels a bridged subscription.
pub const METHOD_UNSUBSCRIBE: &str = "unsubscribe";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnsubscribeParams {
    subscription_id: String,
}

/// Handler for `POST /message`.
///
/// Malformed envelopes are rejected with `400 Bad Request` and a JSON-RPC
/// error body. Notifications (no `id` member) are dispatched and answered
/// with `202 Accepted` and no body. Everything else gets `200 OK` with a response
/// carrying either `result` or `error`.
pub async fn message_handler(
    Extension(state): Extension<Arc<AppState>>,
    body: Bytes,
) -> Response {
    let raw: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            tracing::debug!("rejecting unparseable message: {}", e);
            return bad_request(None, JsonRpcError::parse_error(e.to_string()));
        }
    };

    let request: JsonRpcRequest = match serde_json::from_value(raw.clone()) {
        Ok(request) => request,
        Err(e) => {
            let id = raw
                .get("id")
                .and_then(|id| serde_json::from_value::<RequestId>(id.clone()).ok());
            return bad_request(id, JsonRpcError::invalid_request(e.to_string()));
        }
    };
    if let Err(error) = request.validate() {
        return bad_request(request.response_id(), error);
    }

    let JsonRpcRequest {
        id, method, params, ..
    } = request;
    let outcome = dispatch(&state, &method, params).await;

    // An explicit `"id": null` is still a request and gets a response.
    let Some(id) = id else {
        if let Err(e) = outcome {
            tracing::warn!(method = %method, "notification failed: {}", e);
        }
        return StatusCode::ACCEPTED.into_response();
    };

    let response = match outcome {
        Ok(result) => JsonRpcResponse::success(id, result),
        Err(error) => {
            tracing::debug!(method = %method, request_id = ?id, code = error.code, "request failed: {}", error.message);
            JsonRpcResponse::failure(id, error)
        }
    };
    (StatusCode::OK, Json(response)).into_response()
}

fn bad_request(id: Option<RequestId>, error: JsonRpcError) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(JsonRpcResponse::failure(id, error)),
    )
        .into_response()
}

async fn dispatch(state: &AppState, method: &str, params: Option<Value>) -> Result<Value, JsonRpcError> {
    match method {
        METHOD_SUBSCRIBE => subscribe(state, params).await,
        METHOD_UNSUBSCRIBE => unsubscribe(state, params),
        _ => state
            .backend
            .call(method, params)
            .await
            .map_err(|e| backend_error(method, e)),
    }
}

async fn subscribe(state: &AppState, params: Option<Value>) -> Result<Value, JsonRpcError> {
    let hub = &state.hub;
    if hub.is_closed() || hub.is_shutting_down() {
        return Err(JsonRpcError::new(BACKEND_UNAVAILABLE, "server is shutting down"));
    }

    // Cancelled by the bridge on exit, and by shutdown through the parent.
    let ctx = hub.shutdown_token().child_token();
    let subscription = match state.backend.subscribe(params, ctx.clone()).await {
        Ok(subscription) => subscription,
        Err(e) => {
            ctx.cancel();
            return Err(backend_error(METHOD_SUBSCRIBE, e));
        }
    };

    let subscription_id = subscription.id.clone();
    let subscription_state = subscription.state;
    let bridged = match spawn_bridge(hub, subscription, ctx) {
        Ok(handle) => handle.is_some(),
        Err(HubError::AlreadyBridged(id)) => {
            return Err(JsonRpcError::invalid_params(format!(
                "subscription {id} is already bridged"
            )));
        }
        Err(HubError::Closed) => {
            return Err(JsonRpcError::new(BACKEND_UNAVAILABLE, "server is shutting down"));
        }
        Err(e) => return Err(JsonRpcError::internal(e.to_string())),
    };

    tracing::info!(
        subscription_id = %subscription_id,
        state = %subscription_state,
        bridged,
        "subscription opened"
    );
    Ok(json!({
        "subscriptionId": subscription_id,
        "state": subscription_state.as_str(),
        "bridged": bridged,
    }))
}

fn unsubscribe(state: &AppState, params: Option<Value>) -> Result<Value, JsonRpcError> {
    let params: UnsubscribeParams = params
        .ok_or_else(|| JsonRpcError::invalid_params("subscriptionId is required"))
        .and_then(|p| {
            serde_json::from_value(p).map_err(|e| JsonRpcError::invalid_params(e.to_string()))
        })?;

    let cancelled = state.hub.cancel_subscription(&params.subscription_id);
    tracing::info!(subscription_id = %params.subscription_id, cancelled, "unsubscribe requested");
    Ok(json!({ "cancelled": cancelled }))
}

/// Maps a backend failure onto the JSON-RPC error space.
pub fn backend_error(method: &str, error: BackendError) -> JsonRpcError {
    match error {
        BackendError::Unavailable(detail) => {
            JsonRpcError::new(BACKEND_UNAVAILABLE, format!("backend unavailable: {detail}"))
        }
        BackendError::MethodNotFound(_) => JsonRpcError::method_not_found(method),
        BackendError::InvalidParams(detail) => JsonRpcError::invalid_params(detail),
        BackendError::Remote { code, message } => JsonRpcError::new(code, message),
        e @ (BackendError::Protocol(_) | BackendError::Stream(_)) => {
            tracing::error!(method, "backend call failed: {}", e);
            JsonRpcError::internal(e.to_string())
        }
    }
}
