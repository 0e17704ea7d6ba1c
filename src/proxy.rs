// Copyright 2026 The OpenGNK Project
// SPDX-License-Identifier: Apache-2.0

// HTTP surface.
//
// Responsibilities:
// - POST /v1/chat/completions: sanitize → (tool-sim | stream | buffered) → restore
// - GET /v1/models from the cached upstream model list
// - GET /health heartbeat
// - GET / embedded chat UI
// - X-Sanitize-Redactions response header (base64 JSON) when redactions occurred

use crate::sanitize::{restore_stream, Sanitizer, TokenMap};
use crate::toolsim;
use crate::upstream::Client;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, Request, Response, StatusCode};
use axum::response::{Html, IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::Method;
use serde_json::json;
use std::sync::{Arc, RwLock};
use std::time::Duration;

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
const MODEL_LOAD_ATTEMPTS: u32 = 3;

/// Shared state injected into axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub upstream: Arc<Client>,
    /// None when sanitization is disabled.
    pub sanitizer: Option<Arc<Sanitizer>>,
    pub simulate_tool_calls: bool,
    /// Cached raw model objects from upstream.
    pub models: Arc<RwLock<Vec<serde_json::Value>>>,
}

impl AppState {
    pub fn new(
        upstream: Arc<Client>,
        sanitizer: Option<Arc<Sanitizer>>,
        simulate_tool_calls: bool,
    ) -> Self {
        Self {
            upstream,
            sanitizer,
            simulate_tool_calls,
            models: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

/// Build the axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/", get(serve_ui))
        .with_state(state)
}

/// Load the model cache from upstream with a few retries. Spawned at
/// startup; the gateway serves requests while this runs.
pub async fn load_models(state: AppState) {
    for attempt in 1..=MODEL_LOAD_ATTEMPTS {
        match state.upstream.fetch_models().await {
            Ok(models) => {
                tracing::info!(count = models.len(), "models loaded");
                *state.models.write().expect("model cache lock poisoned") = models;
                return;
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, "model load failed");
                tokio::time::sleep(Duration::from_secs(u64::from(attempt) * 2)).await;
            }
        }
    }
    tracing::error!("could not load models after retries");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn serve_ui() -> Html<&'static str> {
    Html(include_str!("../web/index.html"))
}

async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    let models = state.models.read().expect("model cache lock poisoned").clone();

    let mut entries: Vec<serde_json::Value> = models
        .iter()
        .filter_map(|m| m.get("id").and_then(|id| id.as_str()))
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "created": 1677610602,
                "owned_by": "gonka",
            })
        })
        .collect();

    if entries.is_empty() {
        entries = vec![json!({
            "id": "gonka-model",
            "object": "model",
            "created": 1677610602,
            "owned_by": "gonka",
        })];
    }

    Json(json!({"object": "list", "data": entries}))
}

async fn chat_completions(
    State(state): State<AppState>,
    request: Request<Body>,
) -> Response<Body> {
    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &format!("failed to read body: {e}")),
    };

    // Redact sensitive data from the outgoing messages.
    let (body, tm) = match &state.sanitizer {
        Some(sanitizer) => {
            let (redacted, tm) = sanitizer.redact_messages(&body).await;
            if !tm.is_empty() {
                tracing::info!(count = tm.len(), "sanitize: redacted tokens in request");
            }
            (Bytes::from(redacted), tm)
        }
        None => (body, TokenMap::new()),
    };

    if state.simulate_tool_calls && toolsim::needs_simulation(&body) {
        return tool_sim_response(&state, &body, &tm).await;
    }

    let wants_stream = serde_json::from_slice::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("stream").and_then(|s| s.as_bool()))
        .unwrap_or(false);

    tracing::info!(stream = wants_stream, body_len = body.len(), "chat completions");

    if wants_stream {
        stream_response(&state, &body, tm).await
    } else {
        buffered_response(&state, &body, &tm).await
    }
}

/// Requests with tools: rewrite the prompt, issue a buffered upstream call,
/// and convert the JSON reply back into tool_calls format.
async fn tool_sim_response(state: &AppState, body: &[u8], tm: &TokenMap) -> Response<Body> {
    let (rewritten, tools, _was_stream) = match toolsim::rewrite_request(body) {
        Ok(out) => out,
        Err(e) => {
            tracing::error!(error = %e, "toolsim rewrite error");
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("tool simulation rewrite failed: {e}"),
            );
        }
    };

    tracing::info!(body_len = rewritten.len(), "toolsim: sending rewritten request");

    let (status, resp_body) = match state
        .upstream
        .request(Method::POST, "/chat/completions", &rewritten)
        .await
    {
        Ok(out) => out,
        Err(e) => {
            tracing::error!(error = %e, "toolsim upstream error");
            return error_response(StatusCode::BAD_GATEWAY, &format!("upstream error: {e}"));
        }
    };

    if status.as_u16() >= 400 {
        tracing::error!(code = status.as_u16(), "toolsim upstream status");
        return passthrough_json(status, resp_body);
    }

    let result = toolsim::parse_response(&resp_body, &tools);
    let result = tm.restore_bytes(&result);

    let mut resp = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(value) = sanitize_header_value(tm) {
        resp = resp.header("X-Sanitize-Redactions", value);
    }
    resp.body(Body::from(result)).expect("static response parts are valid")
}

async fn buffered_response(state: &AppState, body: &[u8], tm: &TokenMap) -> Response<Body> {
    let (status, resp_body) = match state
        .upstream
        .request(Method::POST, "/chat/completions", body)
        .await
    {
        Ok(out) => out,
        Err(e) => {
            tracing::error!(error = %e, "upstream error");
            return error_response(StatusCode::BAD_GATEWAY, &format!("upstream error: {e}"));
        }
    };

    // Restore any redacted tokens before returning to the client. The
    // upstream status (including 4xx/5xx) passes through verbatim.
    let resp_body = tm.restore_bytes(&resp_body);

    let mut resp = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(value) = sanitize_header_value(tm) {
        resp = resp.header("X-Sanitize-Redactions", value);
    }
    resp.body(Body::from(resp_body)).expect("static response parts are valid")
}

async fn stream_response(state: &AppState, body: &[u8], tm: TokenMap) -> Response<Body> {
    let upstream_resp = match state
        .upstream
        .request_stream(Method::POST, "/chat/completions", body)
        .await
    {
        Ok(resp) => resp,
        Err(e) => {
            tracing::error!(error = %e, "upstream stream error");
            return error_response(StatusCode::BAD_GATEWAY, &format!("upstream error: {e}"));
        }
    };

    let status = upstream_resp.status();
    if status.as_u16() >= 400 {
        let err_body = upstream_resp.bytes().await.unwrap_or_default();
        tracing::error!(code = status.as_u16(), "upstream stream status");
        return passthrough_json(status, err_body);
    }

    let mut resp = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("X-Accel-Buffering", "no");
    if let Some(value) = sanitize_header_value(&tm) {
        resp = resp.header("X-Sanitize-Redactions", value);
    }

    // Wrap the upstream bytes with the token restorer. Dropping the body on
    // client disconnect aborts the upstream call at the next read.
    let upstream_bytes = upstream_resp.bytes_stream().filter_map(|item| {
        futures_util::future::ready(match item {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::error!(error = %e, "upstream read error");
                None
            }
        })
    });
    let restored = restore_stream(upstream_bytes, Arc::new(tm))
        .map(Ok::<Bytes, std::convert::Infallible>);

    resp.body(Body::from_stream(restored)).expect("static response parts are valid")
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Encode the redaction list for the X-Sanitize-Redactions header. The JSON
/// is base64-encoded so the UTF-8 placeholder delimiters survive HTTP header
/// transmission without corruption. None when nothing was redacted.
fn sanitize_header_value(tm: &TokenMap) -> Option<HeaderValue> {
    if tm.is_empty() {
        return None;
    }
    let encoded = B64.encode(serde_json::to_vec(&tm.redactions()).ok()?);
    HeaderValue::from_str(&encoded).ok()
}

fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    let body = serde_json::to_vec(&json!({"error": message})).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("static response parts are valid")
}

/// Forward an upstream reply (typically an error) verbatim.
fn passthrough_json(status: StatusCode, body: Bytes) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("static response parts are valid")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
