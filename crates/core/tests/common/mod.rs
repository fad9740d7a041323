#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;

pub const COMPLETIONS_PATH: &str = "/v1/chat/completions";

type Responder = dyn Fn(usize, &Value) -> (StatusCode, Value) + Send + Sync;

/// What the fake vendor saw for one request.
#[derive(Debug, Clone)]
pub struct Hit {
    pub authorization: Option<String>,
    pub body: Value,
}

#[derive(Clone)]
struct VendorState {
    hits: Arc<Mutex<Vec<Hit>>>,
    responder: Arc<Responder>,
}

pub struct FakeVendor {
    pub url: String,
    hits: Arc<Mutex<Vec<Hit>>>,
}

impl FakeVendor {
    pub fn hits(&self) -> Vec<Hit> {
        self.hits.lock().unwrap().clone()
    }

    pub fn models(&self) -> Vec<String> {
        self.hits()
            .into_iter()
            .map(|h| h.body["model"].as_str().unwrap_or_default().to_string())
            .collect()
    }
}

async fn completions(
    State(state): State<VendorState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let authorization = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let index = {
        let mut hits = state.hits.lock().unwrap();
        hits.push(Hit {
            authorization,
            body: body.clone(),
        });
        hits.len() - 1
    };
    let (status, reply) = (state.responder)(index, &body);
    (status, Json(reply))
}

/// Serves `POST /v1/chat/completions` on an ephemeral port. `responder`
/// gets the zero-based request index and the request body.
pub async fn spawn_vendor<F>(responder: F) -> FakeVendor
where
    F: Fn(usize, &Value) -> (StatusCode, Value) + Send + Sync + 'static,
{
    let hits = Arc::new(Mutex::new(Vec::new()));
    let state = VendorState {
        hits: hits.clone(),
        responder: Arc::new(responder),
    };
    let app = Router::new()
        .route(COMPLETIONS_PATH, post(completions))
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    FakeVendor {
        url: format!("http://{addr}{COMPLETIONS_PATH}"),
        hits,
    }
}

/// Serves an axum router on an ephemeral port and returns its base URL.
pub async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

pub fn completion(content: &str) -> Value {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "model": "test",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }]
    })
}

pub fn vendor_error(message: &str) -> Value {
    json!({"error": {"message": message, "type": "invalid_request_error"}})
}
