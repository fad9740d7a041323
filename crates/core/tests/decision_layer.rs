mod common;

use std::sync::Arc;

use avion_core::{
    decision::{ObjectiveType, Priority},
    fakes::RecordingSleeper,
    ApiKey, ContextGatherer, DailyObjective, DecisionConfig, DecisionLayer, Dispatcher,
    FixedClock, HttpBackend, PlacementProfile, RetryPolicy, RetryingDispatcher, UpstreamMode,
    FALLBACK_CONFIDENCE,
};
use avion_memory::{CalendarEvent, EventKind, ProgressStore, SystemState};
use axum::http::StatusCode;
use chrono::NaiveDate;
use common::{completion, spawn_vendor, vendor_error};
use serde_json::json;
use tempfile::tempdir;

fn direct(url: &str) -> DecisionConfig {
    DecisionConfig {
        mode: UpstreamMode::Direct,
        vendor_url: url.to_string(),
        model: "primary".into(),
        fallback_model: "backup".into(),
        max_retries: 2,
        retry_delay_ms: 1,
        api_key: Some(ApiKey::new("gsk_test")),
        ..DecisionConfig::default()
    }
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

#[tokio::test]
async fn daily_objective_is_parsed_and_logged_in_the_store() {
    let reply = json!({
        "objective": "Revise OS scheduling for the exam",
        "type": "academic",
        "priority": "critical",
        "reason": "OS exam in 3 days",
        "estimatedTime": "2 hours",
        "successCriteria": "Solve 10 scheduling problems"
    });
    let content = format!("```json\n{reply}\n```");
    let vendor = spawn_vendor(move |_, _| (StatusCode::OK, completion(&content))).await;

    let dir = tempdir().expect("tempdir");
    let store = ProgressStore::open(dir.path().join("progress.db")).expect("store");
    let today = date(2025, 3, 10);
    store
        .set_system_state(&SystemState {
            current_streak: 12,
            momentum_score: 74.0,
            academic_progress: 55.0,
        })
        .expect("state");
    store
        .add_event(&CalendarEvent {
            date: date(2025, 3, 13),
            title: "Operating Systems".into(),
            kind: EventKind::Exam,
        })
        .expect("event");

    let cfg = direct(&vendor.url);
    let shared = Arc::new(store.clone());
    let gatherer = ContextGatherer::new(
        shared.clone(),
        Arc::new(FixedClock(today)),
        PlacementProfile::default(),
    );
    let dispatcher = RetryingDispatcher::new(
        Dispatcher::new(
            Arc::new(HttpBackend::from_config(&cfg).expect("backend")),
            &cfg.model,
            &cfg.fallback_model,
        ),
        RetryPolicy::from_config(&cfg),
        Arc::new(RecordingSleeper::new()),
    );
    let layer = DecisionLayer::new(gatherer, dispatcher, shared);

    let objective = layer.select_daily_objective().await;
    assert_eq!(objective.kind, ObjectiveType::Academic);
    assert_eq!(objective.priority, Priority::Critical);
    assert_eq!(objective.objective, "Revise OS scheduling for the exam");

    // the prompt carried the gathered context
    let hits = vendor.hits();
    assert_eq!(hits.len(), 1);
    let user_prompt = hits[0].body["messages"][1]["content"]
        .as_str()
        .expect("user prompt");
    assert!(user_prompt.contains("Operating Systems"), "{user_prompt}");

    let log = store.recent_decisions(10).expect("log");
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].kind, "daily_objective");
    assert_eq!(log[0].confidence, 1.0);
    assert_eq!(log[0].context["currentStreak"], 12);
    assert_eq!(log[0].context["nextDeadline"]["daysUntil"], 3);
    assert_eq!(log[0].result["type"], "academic");
}

#[tokio::test]
async fn failing_upstream_falls_back_and_logs_low_confidence() {
    let vendor = spawn_vendor(|_, _| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            vendor_error("internal error"),
        )
    })
    .await;

    let dir = tempdir().expect("tempdir");
    let store = ProgressStore::open(dir.path().join("progress.db")).expect("store");
    let layer = DecisionLayer::from_config(&direct(&vendor.url), store.clone()).expect("layer");

    let objective = layer.select_daily_objective().await;
    assert_eq!(objective, DailyObjective::fallback());
    // two primary attempts, then one on the fallback model
    assert_eq!(vendor.models(), ["primary", "primary", "backup"]);

    let log = store.recent_decisions(10).expect("log");
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].kind, "daily_objective");
    assert_eq!(log[0].confidence, FALLBACK_CONFIDENCE);
    assert!(log[0].context["error"]
        .as_str()
        .expect("error text")
        .contains("3 attempts"));
}

#[tokio::test]
async fn syllabus_fallback_keeps_track_and_week() {
    let vendor = spawn_vendor(|_, _| (StatusCode::OK, completion("not json"))).await;

    let dir = tempdir().expect("tempdir");
    let store = ProgressStore::open(dir.path().join("progress.db")).expect("store");
    let layer = DecisionLayer::from_config(&direct(&vendor.url), store.clone()).expect("layer");

    let syllabus = layer.generate_skill_syllabus("python", 4).await;
    assert!(!syllabus.daily_tasks.is_empty());
    // a malformed answer is not retried
    assert_eq!(vendor.hits().len(), 1);

    let log = store.recent_decisions(1).expect("log");
    assert_eq!(log[0].kind, "skill_syllabus");
    assert_eq!(log[0].context["trackId"], "python");
    assert_eq!(log[0].context["weekNumber"], 4);
}
