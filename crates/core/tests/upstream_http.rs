mod common;

use std::{sync::Arc, time::Duration};

use avion_core::{
    build_app_with_state, fakes::RecordingSleeper, ApiKey, AvionError, ChatMessage,
    DecisionConfig, Dispatcher, HttpBackend, ProxyConfig, RetryPolicy, RetryingDispatcher,
    Sampling, UpstreamMode,
};
use axum::http::StatusCode;
use common::{completion, serve, spawn_vendor, vendor_error};

fn direct(url: &str, key: Option<&str>) -> DecisionConfig {
    DecisionConfig {
        mode: UpstreamMode::Direct,
        vendor_url: url.to_string(),
        model: "primary".into(),
        fallback_model: "backup".into(),
        retry_delay_ms: 5,
        api_key: key.map(ApiKey::new),
        ..DecisionConfig::default()
    }
}

fn via_proxy(url: &str) -> DecisionConfig {
    DecisionConfig {
        mode: UpstreamMode::Proxy,
        proxy_url: url.to_string(),
        model: "primary".into(),
        fallback_model: "backup".into(),
        retry_delay_ms: 5,
        ..DecisionConfig::default()
    }
}

fn retrying(cfg: &DecisionConfig, sleeper: Arc<RecordingSleeper>) -> RetryingDispatcher {
    let backend = HttpBackend::from_config(cfg).expect("backend");
    RetryingDispatcher::new(
        Dispatcher::new(Arc::new(backend), &cfg.model, &cfg.fallback_model),
        RetryPolicy::from_config(cfg),
        sleeper,
    )
}

fn ask() -> Vec<ChatMessage> {
    vec![ChatMessage::system("be brief"), ChatMessage::user("hi")]
}

#[tokio::test]
async fn direct_mode_sends_bearer_credential() {
    let vendor = spawn_vendor(|_, _| (StatusCode::OK, completion("hello"))).await;
    let dispatcher = retrying(&direct(&vendor.url, Some("gsk_direct")), Arc::default());

    let text = dispatcher
        .execute(&ask(), Sampling::new(0.3, 500))
        .await
        .expect("completion");
    assert_eq!(text, "hello");

    let hits = vendor.hits();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].authorization.as_deref(), Some("Bearer gsk_direct"));
    assert_eq!(hits[0].body["model"], "primary");
    assert_eq!(hits[0].body["temperature"], 0.3);
    assert_eq!(hits[0].body["max_tokens"], 500);
    assert_eq!(hits[0].body["messages"][0]["role"], "system");
}

#[tokio::test]
async fn proxy_mode_sends_no_credential() {
    let vendor = spawn_vendor(|_, _| (StatusCode::OK, completion("hello"))).await;
    let dispatcher = retrying(&via_proxy(&vendor.url), Arc::default());

    dispatcher
        .execute(&ask(), Sampling::default())
        .await
        .expect("completion");

    let hits = vendor.hits();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].authorization, None);
}

#[tokio::test]
async fn direct_mode_without_key_fails_before_any_request() {
    let vendor = spawn_vendor(|_, _| (StatusCode::OK, completion("hello"))).await;
    let sleeper = Arc::new(RecordingSleeper::new());
    let dispatcher = retrying(&direct(&vendor.url, None), sleeper.clone());

    let err = dispatcher
        .execute(&ask(), Sampling::default())
        .await
        .expect_err("missing key");
    assert!(matches!(err, AvionError::Config(_)), "{err}");
    assert!(vendor.hits().is_empty());
    assert!(sleeper.delays().is_empty());
}

#[tokio::test]
async fn transient_errors_are_retried_on_the_primary_model() {
    let vendor = spawn_vendor(|index, _| match index {
        0 | 1 => (
            StatusCode::SERVICE_UNAVAILABLE,
            vendor_error("Service Unavailable"),
        ),
        _ => (StatusCode::OK, completion("third time")),
    })
    .await;
    let sleeper = Arc::new(RecordingSleeper::new());
    let dispatcher = retrying(&direct(&vendor.url, Some("gsk")), sleeper.clone());

    let text = dispatcher
        .execute(&ask(), Sampling::default())
        .await
        .expect("completion");

    assert_eq!(text, "third time");
    assert_eq!(vendor.models(), ["primary", "primary", "primary"]);
    assert_eq!(
        sleeper.delays(),
        [Duration::from_millis(5), Duration::from_millis(10)]
    );
}

#[tokio::test]
async fn decommissioned_model_switches_to_fallback() {
    let vendor = spawn_vendor(|_, body| {
        if body["model"] == "primary" {
            (
                StatusCode::BAD_REQUEST,
                vendor_error("The model `primary` has been decommissioned and is no longer supported"),
            )
        } else {
            (StatusCode::OK, completion("from backup"))
        }
    })
    .await;
    let sleeper = Arc::new(RecordingSleeper::new());
    let dispatcher = retrying(&direct(&vendor.url, Some("gsk")), sleeper.clone());

    let text = dispatcher
        .execute(&ask(), Sampling::default())
        .await
        .expect("completion");

    assert_eq!(text, "from backup");
    assert_eq!(vendor.models(), ["primary", "backup"]);
    assert!(sleeper.delays().is_empty());
}

#[tokio::test]
async fn persistent_failure_exhausts_the_budget() {
    let vendor = spawn_vendor(|_, _| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            vendor_error("internal error"),
        )
    })
    .await;
    let dispatcher = retrying(&direct(&vendor.url, Some("gsk")), Arc::default());

    let err = dispatcher
        .execute(&ask(), Sampling::default())
        .await
        .expect_err("exhausted");

    match err {
        AvionError::Exhausted { attempts, last } => {
            assert_eq!(attempts, 4);
            assert!(last.contains("500"), "{last}");
        }
        other => panic!("expected exhaustion, got {other}"),
    }
    assert_eq!(vendor.models(), ["primary", "primary", "primary", "backup"]);
}

#[tokio::test]
async fn decision_client_through_relay_end_to_end() {
    let vendor = spawn_vendor(|_, body| {
        if body["model"] == "primary" {
            (
                StatusCode::BAD_REQUEST,
                vendor_error("The model `primary` has been decommissioned"),
            )
        } else {
            (StatusCode::OK, completion(r#"{"status":"ok"}"#))
        }
    })
    .await;

    let (app, state) = build_app_with_state(ProxyConfig {
        vendor_url: vendor.url.clone(),
        api_key: Some(ApiKey::new("gsk_server")),
        ..ProxyConfig::default()
    });
    state.set_ready();
    let base = serve(app).await;

    let sleeper = Arc::new(RecordingSleeper::new());
    let dispatcher = retrying(&via_proxy(&format!("{base}/api/groq-proxy")), sleeper.clone());
    let text = dispatcher
        .execute(&ask(), Sampling::new(0.1, 50))
        .await
        .expect("completion");

    assert_eq!(text, r#"{"status":"ok"}"#);
    let hits = vendor.hits();
    assert_eq!(vendor.models(), ["primary", "backup"]);
    // the relay adds the server credential; the client sent none
    assert!(hits
        .iter()
        .all(|h| h.authorization.as_deref() == Some("Bearer gsk_server")));
    assert_eq!(hits[1].body["max_tokens"], 50);
    assert!(sleeper.delays().is_empty());
}
