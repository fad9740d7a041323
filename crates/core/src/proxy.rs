//! Credential-injecting relay in front of the chat completion vendor.
//!
//! Clients post `{messages, model?, temperature?, max_tokens?}` without any
//! credential; the relay adds the server-side bearer key and forwards the
//! request, returning the vendor's JSON untouched.

use std::time::Instant;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};
use utoipa::ToSchema;

use crate::{chat::ChatMessage, AppState};

pub const PROXY_PATH: &str = "/api/groq-proxy";

const MESSAGES_REQUIRED: &str = "Invalid request: messages array required";

/// Request accepted by the relay.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProxyRequest {
    pub messages: Vec<ChatMessage>,
    /// Defaults to the configured proxy model.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ProxyErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Body sent on to the vendor; messages are forwarded as received.
#[derive(Debug, Serialize)]
struct VendorRequest<'a> {
    messages: &'a [Value],
    model: &'a str,
    temperature: f64,
    max_tokens: u64,
    top_p: f64,
    stream: bool,
}

/// Outcome label of a relayed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpstreamOutcome {
    Success,
    VendorError,
    TransportError,
}

impl UpstreamOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamOutcome::Success => "success",
            UpstreamOutcome::VendorError => "vendor_error",
            UpstreamOutcome::TransportError => "transport_error",
        }
    }
}

fn error_response(status: StatusCode, error: impl Into<String>, message: Option<String>) -> Response {
    let body = ProxyErrorBody {
        error: error.into(),
        message,
    };
    (status, Json(body)).into_response()
}

#[utoipa::path(
    post,
    path = "/api/groq-proxy",
    request_body = ProxyRequest,
    responses(
        (status = 200, description = "Vendor chat completion, passed through"),
        (status = 400, description = "messages missing or not an array", body = ProxyErrorBody),
        (status = 405, description = "Only POST is accepted", body = ProxyErrorBody),
        (status = 500, description = "Credential missing or vendor unreachable", body = ProxyErrorBody)
    ),
    tag = "proxy"
)]
pub async fn proxy_handler(State(state): State<AppState>, method: Method, body: Bytes) -> Response {
    let started = Instant::now();
    let response = relay(&state, &method, &body).await;
    state.record_http_observation(method, PROXY_PATH, response.status(), started);
    response
}

async fn relay(state: &AppState, method: &Method, body: &[u8]) -> Response {
    if method != Method::POST {
        return error_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed", None);
    }

    let cfg = state.proxy_config();
    let Some(api_key) = cfg.api_key.as_ref() else {
        error!("proxy called but no vendor API key is configured");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "API key not configured",
            Some("AVION_GROQ_API_KEY or GROQ_API_KEY environment variable is missing".into()),
        );
    };

    let payload: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(err) => {
            debug!(error = %err, "proxy request body is not JSON");
            return error_response(StatusCode::BAD_REQUEST, MESSAGES_REQUIRED, None);
        }
    };
    let Some(messages) = payload.get("messages").and_then(Value::as_array) else {
        return error_response(StatusCode::BAD_REQUEST, MESSAGES_REQUIRED, None);
    };

    let request = VendorRequest {
        messages,
        model: payload
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(&cfg.default_model),
        temperature: payload
            .get("temperature")
            .and_then(Value::as_f64)
            .unwrap_or(cfg.default_temperature),
        max_tokens: payload
            .get("max_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(u64::from(cfg.default_max_tokens)),
        top_p: 1.0,
        stream: false,
    };
    debug!(model = request.model, messages = messages.len(), "relaying chat request");

    let sent = state
        .http_client()
        .post(&cfg.vendor_url)
        .bearer_auth(api_key.expose())
        .json(&request)
        .send()
        .await;
    let upstream = match sent {
        Ok(upstream) => upstream,
        Err(err) => {
            state.record_upstream(UpstreamOutcome::TransportError);
            error!(error = %err, "vendor unreachable");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
                Some(err.to_string()),
            );
        }
    };

    let status = upstream.status();
    let text = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            state.record_upstream(UpstreamOutcome::TransportError);
            error!(error = %err, "failed to read vendor response");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
                Some(err.to_string()),
            );
        }
    };

    if !status.is_success() {
        state.record_upstream(UpstreamOutcome::VendorError);
        let raw = String::from_utf8_lossy(&text).into_owned();
        warn!(%status, body = %raw, "vendor rejected relayed request");
        let message = if raw.is_empty() {
            "Unknown error from upstream".to_string()
        } else {
            raw
        };
        return error_response(
            StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
            format!("Upstream error: {}", status.as_u16()),
            Some(message),
        );
    }

    state.record_upstream(UpstreamOutcome::Success);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(text))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
