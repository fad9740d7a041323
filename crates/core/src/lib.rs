use axum::error_handling::HandleErrorLayer;
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, Method, Request, StatusCode},
    middleware::{from_fn_with_state, Next},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use prometheus_client::{
    encoding::{text::encode, EncodeLabel, EncodeLabelSet},
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::Registry,
};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};
use tower::{limit::ConcurrencyLimitLayer, timeout::TimeoutLayer, BoxError, ServiceBuilder};
use utoipa::OpenApi;

pub mod chat;
pub mod config;
pub mod context;
pub mod decision;
pub mod dispatch;
pub mod error;
#[cfg(any(test, feature = "test-util"))]
pub mod fakes;
pub mod prompt;
pub mod proxy;
pub mod retry;

pub use chat::{ChatMessage, Role, Sampling};
pub use config::{load_config, ApiKey, AppConfig, DecisionConfig, PlacementProfile, ProxyConfig, UpstreamMode};
pub use context::{Clock, ContextGatherer, FixedClock, ProgressSource, SystemClock};
pub use decision::{
    DailyObjective, DecisionKind, DecisionLayer, DecisionLog, ReadinessExplanation,
    RecoveryDecision, SkillSyllabus, WeeklyAnalysis, FALLBACK_CONFIDENCE,
};
pub use dispatch::{ChatBackend, Dispatcher, Endpoint, HttpBackend};
pub use error::{AvionError, ErrorClass, Result};
pub use proxy::UpstreamOutcome;
pub use retry::{RetryPolicy, RetryingDispatcher, Sleeper, TokioSleeper};

const LATENCY_BUCKETS: [f64; 8] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0];
/// Upper bound for one relayed vendor call.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(OpenApi)]
#[openapi(
    paths(health, ready, proxy::proxy_handler),
    components(schemas(
        chat::ChatMessage,
        chat::Role,
        proxy::ProxyRequest,
        proxy::ProxyErrorBody
    )),
    tags(
        (name = "core", description = "Service endpoints"),
        (name = "proxy", description = "Chat completion relay")
    )
)]
pub struct ApiDoc;

/// Creates a latency histogram with predefined buckets.
fn create_latency_histogram() -> Histogram {
    Histogram::new(LATENCY_BUCKETS)
}

#[derive(Clone)]
pub struct AppState(Arc<AppStateInner>);

struct AppStateInner {
    proxy: ProxyConfig,
    http_requests: Family<HttpLabels, Counter<u64>>,
    http_latency: Family<HttpDurationLabels, Histogram>,
    upstream_requests: Family<UpstreamLabels, Counter<u64>>,
    registry: Mutex<Registry>,
    /// Client for relayed vendor calls.
    http_client: reqwest::Client,
    ready: AtomicBool,
}

impl AppState {
    fn new(proxy: ProxyConfig) -> Self {
        let mut registry = Registry::default();

        let http_requests: Family<HttpLabels, Counter<u64>> = Family::default();
        registry.register(
            "http_requests",
            "Total number of HTTP requests received",
            http_requests.clone(),
        );

        let http_latency: Family<HttpDurationLabels, Histogram> =
            Family::new_with_constructor(create_latency_histogram);
        registry.register(
            "http_request_duration_seconds",
            "HTTP request duration",
            http_latency.clone(),
        );

        let upstream_requests: Family<UpstreamLabels, Counter<u64>> = Family::default();
        registry.register(
            "upstream_requests",
            "Relayed vendor calls by outcome",
            upstream_requests.clone(),
        );

        Self(Arc::new(AppStateInner {
            proxy,
            http_requests,
            http_latency,
            upstream_requests,
            registry: Mutex::new(registry),
            http_client: dispatch::build_client(UPSTREAM_TIMEOUT),
            ready: AtomicBool::new(false),
        }))
    }

    pub fn proxy_config(&self) -> &ProxyConfig {
        &self.0.proxy
    }

    pub fn http_client(&self) -> reqwest::Client {
        self.0.http_client.clone()
    }

    fn encode_metrics(&self) -> std::result::Result<String, fmt::Error> {
        let mut body = String::new();
        let registry = self.0.registry.lock().map_err(|_| fmt::Error)?;
        encode(&mut body, &registry)?;
        Ok(body)
    }

    pub fn record_http_observation(
        &self,
        method: Method,
        path: &'static str,
        status: StatusCode,
        started: Instant,
    ) {
        let elapsed = started.elapsed().as_secs_f64();
        self.0
            .http_requests
            .get_or_create(&HttpLabels::new(method.clone(), path, status))
            .inc();
        self.0
            .http_latency
            .get_or_create(&HttpDurationLabels::new(method, path))
            .observe(elapsed);
    }

    pub fn record_upstream(&self, outcome: UpstreamOutcome) {
        self.0
            .upstream_requests
            .get_or_create(&UpstreamLabels { outcome })
            .inc();
    }

    pub fn set_ready(&self) {
        self.0.ready.store(true, Ordering::Release);
    }

    fn is_ready(&self) -> bool {
        self.0.ready.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct HttpDurationLabels {
    method: Method,
    path: &'static str,
}

impl HttpDurationLabels {
    fn new(method: Method, path: &'static str) -> Self {
        Self { method, path }
    }
}

impl EncodeLabelSet for HttpDurationLabels {
    fn encode(
        &self,
        encoder: &mut prometheus_client::encoding::LabelSetEncoder<'_>,
    ) -> std::result::Result<(), fmt::Error> {
        ("method", self.method.as_str()).encode(encoder.encode_label())?;
        ("path", self.path).encode(encoder.encode_label())?;
        Ok(())
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct HttpLabels {
    method: Method,
    path: &'static str,
    status: StatusCode,
}

impl HttpLabels {
    fn new(method: Method, path: &'static str, status: StatusCode) -> Self {
        Self {
            method,
            path,
            status,
        }
    }
}

impl EncodeLabelSet for HttpLabels {
    fn encode(
        &self,
        encoder: &mut prometheus_client::encoding::LabelSetEncoder<'_>,
    ) -> std::result::Result<(), fmt::Error> {
        ("method", self.method.as_str()).encode(encoder.encode_label())?;
        ("path", self.path).encode(encoder.encode_label())?;
        ("status", self.status.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct UpstreamLabels {
    outcome: UpstreamOutcome,
}

impl EncodeLabelSet for UpstreamLabels {
    fn encode(
        &self,
        encoder: &mut prometheus_client::encoding::LabelSetEncoder<'_>,
    ) -> std::result::Result<(), fmt::Error> {
        ("outcome", self.outcome.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service healthy")),
    tag = "core"
)]
async fn health(State(state): State<AppState>) -> &'static str {
    let started = Instant::now();
    state.record_http_observation(Method::GET, "/health", StatusCode::OK, started);
    "ok"
}

#[utoipa::path(
    get,
    path = "/ready",
    responses(
        (status = 200, description = "Service ready"),
        (status = 503, description = "Service starting")
    ),
    tag = "core"
)]
async fn ready(State(state): State<AppState>) -> (StatusCode, &'static str) {
    let started = Instant::now();
    let (status, body) = if state.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    };
    state.record_http_observation(Method::GET, "/ready", status, started);
    (status, body)
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let started = Instant::now();
    let encoded_metrics = state.encode_metrics();
    let status = if encoded_metrics.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };

    state.record_http_observation(Method::GET, "/metrics", status, started);

    match encoded_metrics {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            "Internal server error".to_string(),
        )
            .into_response(),
    }
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

pub fn build_app(cfg: ProxyConfig) -> Router {
    build_app_with_state(cfg).0
}

pub fn build_app_with_state(cfg: ProxyConfig) -> (Router, AppState) {
    let allowed_origin = Arc::new(cors_origin(&cfg.allowed_origin));
    let state = AppState::new(cfg);

    // --- Request guards ------------------------------------------------------
    // Defaults: 60s timeout (vendor calls are slow), 64 concurrent requests:
    //   AVION_HTTP_TIMEOUT_MS (u64; 0 = disabled)
    //   AVION_HTTP_CONCURRENCY (u64; 0 = disabled)
    let timeout_ms = config::env_u64("AVION_HTTP_TIMEOUT_MS", 60_000);
    let concurrency = config::env_u64("AVION_HTTP_CONCURRENCY", 64);

    let timeout_layer = if timeout_ms > 0 {
        Some(TimeoutLayer::new(Duration::from_millis(timeout_ms)))
    } else {
        tracing::info!("AVION_HTTP_TIMEOUT_MS=0 → request timeout disabled");
        None
    };
    let concurrency_layer = if concurrency > 0 {
        let c = std::cmp::min(concurrency, usize::MAX as u64) as usize;
        Some(ConcurrencyLimitLayer::new(c))
    } else {
        tracing::info!("AVION_HTTP_CONCURRENCY=0 → concurrency limit disabled");
        None
    };

    let request_guards = ServiceBuilder::new()
        .layer(HandleErrorLayer::new(|err: BoxError| async move {
            if err.is::<tower::timeout::error::Elapsed>() {
                (StatusCode::REQUEST_TIMEOUT, "request timed out")
            } else {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "service temporarily unavailable",
                )
            }
        }))
        .option_layer(timeout_layer)
        .option_layer(concurrency_layer)
        // option_layer's Either needs both branches to share an error type.
        .layer(tower::util::MapErrLayer::new(
            |e: std::convert::Infallible| -> BoxError { match e {} },
        ));

    // The readiness flag is set by the caller once the listener is bound.
    let app = routes()
        .with_state(state.clone())
        .layer(from_fn_with_state(allowed_origin, cors_middleware))
        .layer(request_guards);

    (app, state)
}

fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .route("/api-docs/openapi.json", get(openapi_json))
        .route(proxy::PROXY_PATH, any(proxy::proxy_handler))
}

/// `None` allows any origin.
type CorsState = Arc<Option<HeaderValue>>;

fn cors_origin(raw: &str) -> Option<HeaderValue> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "*" {
        return None;
    }
    match HeaderValue::from_str(raw) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(origin = raw, error = %err, "invalid allowed origin, allowing any");
            None
        }
    }
}

async fn cors_middleware(
    State(allowed_origin): State<CorsState>,
    req: Request<Body>,
    next: Next,
) -> std::result::Result<Response, StatusCode> {
    let origin = req.headers().get(header::ORIGIN).cloned();
    let allow_value = match allowed_origin.as_ref() {
        None => Some(HeaderValue::from_static("*")),
        Some(allowed) if origin.as_ref() == Some(allowed) => Some(allowed.clone()),
        Some(_) => None,
    };

    if req.method() == Method::OPTIONS {
        let Some(allow_value) = allow_value else {
            return Response::builder()
                .status(StatusCode::FORBIDDEN)
                .body(Body::empty())
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR);
        };

        return Response::builder()
            .status(StatusCode::OK)
            .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, allow_value)
            .header(header::ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, OPTIONS")
            .header(
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static("Content-Type, Authorization"),
            )
            .header(
                header::ACCESS_CONTROL_MAX_AGE,
                HeaderValue::from_static("600"),
            )
            .header(header::VARY, HeaderValue::from_static("Origin"))
            .body(Body::empty())
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR);
    }

    let mut response = next.run(req).await;
    if let Some(allow_value) = allow_value {
        response
            .headers_mut()
            .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, allow_value);
        response
            .headers_mut()
            .append(header::VARY, HeaderValue::from_static("Origin"));
    }

    Ok(response)
}
