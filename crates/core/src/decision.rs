//! Decision methods: gather, prompt, dispatch, parse, score and log.
//!
//! Every method returns a value. Any failure along the way (store read,
//! upstream, malformed or incomplete JSON) yields the kind's fixed fallback
//! with confidence [`FALLBACK_CONFIDENCE`], and both paths are logged.

use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use avion_memory::{DecisionLogEntry, ProgressStore};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::{
    chat::{ChatMessage, Sampling},
    config::DecisionConfig,
    context::{blocking, snapshot, ContextGatherer, SystemClock},
    error::{AvionError, Result},
    prompt,
    retry::RetryingDispatcher,
};

pub const FALLBACK_CONFIDENCE: f64 = 0.1;

/// Context keys whose presence raises confidence by a tenth each.
const CONTEXT_SIGNALS: [&str; 3] = ["currentStreak", "momentumScore", "nextDeadline"];

const HEALTH_SAMPLING: Sampling = Sampling::new(0.1, 50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionKind {
    DailyObjective,
    WeeklyAnalysis,
    SkillSyllabus,
    RecoveryMode,
    PlacementReadiness,
}

impl DecisionKind {
    /// Name stored in the decision log.
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionKind::DailyObjective => "daily_objective",
            DecisionKind::WeeklyAnalysis => "weekly_analysis",
            DecisionKind::SkillSyllabus => "skill_syllabus",
            DecisionKind::RecoveryMode => "recovery_mode",
            DecisionKind::PlacementReadiness => "placement_readiness",
        }
    }

    pub fn sampling(&self) -> Sampling {
        match self {
            DecisionKind::DailyObjective => Sampling::new(0.3, 500),
            DecisionKind::WeeklyAnalysis => Sampling::new(0.4, 800),
            DecisionKind::SkillSyllabus => Sampling::new(0.5, 1200),
            DecisionKind::RecoveryMode => Sampling::new(0.2, 600),
            DecisionKind::PlacementReadiness => Sampling::new(0.3, 700),
        }
    }

    /// Result fields holding enum values.
    fn enum_fields(&self) -> &'static [&'static str] {
        match self {
            DecisionKind::DailyObjective => &["type", "priority"],
            DecisionKind::WeeklyAnalysis => &["verdict", "weakestArea"],
            DecisionKind::SkillSyllabus => &[],
            DecisionKind::RecoveryMode => &["recoveryLevel", "urgencyLevel"],
            DecisionKind::PlacementReadiness => &["riskAssessment"],
        }
    }

    /// Result field that marks a usable answer.
    pub fn key_field(&self) -> &'static str {
        match self {
            DecisionKind::DailyObjective => "objective",
            DecisionKind::WeeklyAnalysis => "verdict",
            DecisionKind::SkillSyllabus => "dailyTasks",
            DecisionKind::RecoveryMode => "enterRecoveryMode",
            DecisionKind::PlacementReadiness => "nextActions",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveType {
    Protocol,
    Academic,
    Skill,
    Deadline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyObjective {
    pub objective: String,
    #[serde(rename = "type")]
    pub kind: ObjectiveType,
    pub priority: Priority,
    pub reason: String,
    pub estimated_time: String,
    pub success_criteria: String,
}

impl DailyObjective {
    pub fn fallback() -> Self {
        Self {
            objective: "Complete Morning Protocol Block".into(),
            kind: ObjectiveType::Protocol,
            priority: Priority::High,
            reason: "AI unavailable - defaulting to protocol consistency".into(),
            estimated_time: "30 minutes".into(),
            success_criteria: "Complete at least 2 critical blocks".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Excellent,
    Good,
    NeedsImprovement,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusArea {
    SkillTraining,
    AcademicStudy,
    ProtocolConsistency,
    TimeManagement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeeklyAnalysis {
    pub verdict: Verdict,
    pub weekly_score: f64,
    pub weakest_area: FocusArea,
    pub focus_shift: String,
    pub adjustments: Vec<String>,
    #[serde(default)]
    pub risk_factors: Vec<String>,
    #[serde(default)]
    pub strengths: Vec<String>,
}

impl WeeklyAnalysis {
    pub fn fallback() -> Self {
        Self {
            verdict: Verdict::NeedsImprovement,
            weekly_score: 50.0,
            weakest_area: FocusArea::ProtocolConsistency,
            focus_shift: "Focus on daily protocol completion".into(),
            adjustments: vec![
                "Complete morning blocks daily".into(),
                "Track time more consistently".into(),
            ],
            risk_factors: vec!["Inconsistent execution".into()],
            strengths: vec!["System awareness".into()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyllabusTask {
    pub day: String,
    pub task: String,
    pub difficulty: u8,
    pub min_time: u32,
    pub emergency_time: u32,
    #[serde(default)]
    pub skills: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillSyllabus {
    pub week_title: String,
    pub difficulty_level: u8,
    pub focus_areas: Vec<String>,
    pub daily_tasks: Vec<SyllabusTask>,
    pub emergency_task: String,
    pub adaptation_reason: String,
}

impl SkillSyllabus {
    pub fn fallback(week: u32) -> Self {
        Self {
            week_title: format!("Week {week}: Basic Training"),
            difficulty_level: 2,
            focus_areas: vec!["Fundamentals".into()],
            daily_tasks: (1..=7)
                .map(|i| SyllabusTask {
                    day: format!("Day {i}"),
                    task: "Basic practice exercises".into(),
                    difficulty: 2,
                    min_time: 30,
                    emergency_time: 15,
                    skills: vec!["basic".into()],
                })
                .collect(),
            emergency_task: "Quick review session".into(),
            adaptation_reason: "AI unavailable - using safe defaults".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryLevel {
    Light,
    Deep,
    Emergency,
}

/// Three-step scale used for urgency and risk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryDecision {
    pub enter_recovery_mode: bool,
    pub recovery_level: RecoveryLevel,
    pub reason: String,
    pub recovery_duration: String,
    pub simplified_tasks: Vec<String>,
    pub exit_criteria: String,
    pub urgency_level: Level,
}

impl RecoveryDecision {
    pub fn fallback() -> Self {
        Self {
            enter_recovery_mode: false,
            recovery_level: RecoveryLevel::Light,
            reason: "AI unavailable - maintaining current mode".into(),
            recovery_duration: "N/A".into(),
            simplified_tasks: vec![
                "Complete one small study task".into(),
                "Maintain basic routine".into(),
            ],
            exit_criteria: "Complete 2 consecutive days of basic tasks".into(),
            urgency_level: Level::Low,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessExplanation {
    pub readiness_explanation: String,
    pub trend_analysis: String,
    pub next_actions: Vec<String>,
    pub risk_assessment: Level,
    pub time_to_improve: String,
    pub focus_priority: String,
}

impl ReadinessExplanation {
    pub fn fallback() -> Self {
        Self {
            readiness_explanation: "Continue consistent study across all subjects".into(),
            trend_analysis: "Steady progress maintained".into(),
            next_actions: vec![
                "Complete daily protocol blocks".into(),
                "Focus on weakest subject area".into(),
            ],
            risk_assessment: Level::Medium,
            time_to_improve: "4-6 weeks".into(),
            focus_priority: "DAA".into(),
        }
    }
}

/// Drops surrounding whitespace and a Markdown code fence, if any.
fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    // the info string ("json") may sit on its own line or share it with the body
    rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric()).trim()
}

/// Models vary the case of enum values: "Needs Improvement" reads as `needs_improvement`.
fn normalize_enum_fields(object: &mut Map<String, Value>, fields: &[&str]) {
    for field in fields {
        if let Some(Value::String(raw)) = object.get_mut(*field) {
            *raw = raw
                .trim()
                .to_ascii_lowercase()
                .replace([' ', '-'], "_");
        }
    }
}

/// Parses model text into the typed result of `kind`.
pub fn parse_decision<R: DeserializeOwned>(kind: DecisionKind, text: &str) -> Result<R> {
    let mut value: Value = serde_json::from_str(strip_fences(text))?;
    let Some(object) = value.as_object_mut() else {
        return Err(AvionError::Schema("expected a JSON object".into()));
    };
    if object.get(kind.key_field()).map_or(true, Value::is_null) {
        return Err(AvionError::Schema(kind.key_field().to_string()));
    }
    normalize_enum_fields(object, kind.enum_fields());
    serde_json::from_value(value).map_err(|err| {
        let message = err.to_string();
        if message.starts_with("missing field") {
            AvionError::Schema(message)
        } else {
            AvionError::Parse(err)
        }
    })
}

fn present(value: &Value, key: &str) -> bool {
    value.get(key).is_some_and(|v| !v.is_null())
}

/// Advisory score: 0.5 plus a tenth per context signal, two tenths for the key field, at most 1.0.
pub fn confidence(kind: DecisionKind, context: &Value, result: &Value) -> f64 {
    let mut tenths = 5u32;
    tenths += CONTEXT_SIGNALS
        .iter()
        .filter(|key| present(context, key))
        .count() as u32;
    if present(result, kind.key_field()) {
        tenths += 2;
    }
    f64::from(tenths.min(10)) / 10.0
}

/// Append-only sink for decisions.
#[async_trait]
pub trait DecisionLog: Send + Sync {
    async fn record(&self, entry: DecisionLogEntry) -> Result<()>;
}

#[async_trait]
impl DecisionLog for ProgressStore {
    async fn record(&self, entry: DecisionLogEntry) -> Result<()> {
        blocking(self, move |s| s.log_decision(&entry)).await
    }
}

#[derive(Clone)]
pub struct DecisionLayer {
    gatherer: ContextGatherer,
    dispatcher: RetryingDispatcher,
    log: Arc<dyn DecisionLog>,
}

impl DecisionLayer {
    pub fn new(
        gatherer: ContextGatherer,
        dispatcher: RetryingDispatcher,
        log: Arc<dyn DecisionLog>,
    ) -> Self {
        Self {
            gatherer,
            dispatcher,
            log,
        }
    }

    /// Production wiring: one store serves as progress source and decision log.
    pub fn from_config(cfg: &DecisionConfig, store: ProgressStore) -> Result<Self> {
        let store = Arc::new(store);
        let gatherer = ContextGatherer::new(
            store.clone(),
            Arc::new(SystemClock),
            cfg.placement.clone(),
        );
        Ok(Self::new(
            gatherer,
            RetryingDispatcher::from_config(cfg)?,
            store,
        ))
    }

    pub async fn select_daily_objective(&self) -> DailyObjective {
        let context = self.gatherer.daily().await;
        self.decide(
            DecisionKind::DailyObjective,
            context,
            prompt::daily_objective,
            DailyObjective::fallback(),
            Map::new(),
        )
        .await
    }

    pub async fn analyze_weekly_performance(&self) -> WeeklyAnalysis {
        let context = self.gatherer.weekly().await;
        self.decide(
            DecisionKind::WeeklyAnalysis,
            context,
            prompt::weekly_analysis,
            WeeklyAnalysis::fallback(),
            Map::new(),
        )
        .await
    }

    pub async fn generate_skill_syllabus(&self, track: &str, week: u32) -> SkillSyllabus {
        let context = self.gatherer.skill(track, week).await;
        let mut fallback_context = Map::new();
        fallback_context.insert("trackId".into(), json!(track));
        fallback_context.insert("weekNumber".into(), json!(week));
        self.decide(
            DecisionKind::SkillSyllabus,
            context,
            prompt::skill_syllabus,
            SkillSyllabus::fallback(week),
            fallback_context,
        )
        .await
    }

    pub async fn should_enter_recovery_mode(&self) -> RecoveryDecision {
        let context = self.gatherer.recovery().await;
        self.decide(
            DecisionKind::RecoveryMode,
            context,
            prompt::recovery_mode,
            RecoveryDecision::fallback(),
            Map::new(),
        )
        .await
    }

    pub async fn explain_placement_readiness(&self) -> ReadinessExplanation {
        let context = self.gatherer.placement().await;
        self.decide(
            DecisionKind::PlacementReadiness,
            context,
            prompt::placement_readiness,
            ReadinessExplanation::fallback(),
            Map::new(),
        )
        .await
    }

    /// True only when the upstream answers the health prompt with `{"status":"ok"}`.
    pub async fn health_check(&self) -> bool {
        let reply = match self
            .dispatcher
            .execute(&prompt::health_check(), HEALTH_SAMPLING)
            .await
        {
            Ok(reply) => reply,
            Err(err) => {
                warn!(error = %err, "decision layer health check failed");
                return false;
            }
        };
        match serde_json::from_str::<Value>(strip_fences(&reply)) {
            Ok(value) => value.get("status").and_then(Value::as_str) == Some("ok"),
            Err(err) => {
                warn!(error = %err, "health check reply is not JSON");
                false
            }
        }
    }

    async fn decide<C, R>(
        &self,
        kind: DecisionKind,
        context: Result<C>,
        build: fn(&C) -> Vec<ChatMessage>,
        fallback: R,
        mut fallback_context: Map<String, Value>,
    ) -> R
    where
        C: Serialize,
        R: Serialize + DeserializeOwned,
    {
        let started = Instant::now();
        match self.attempt(kind, context, build).await {
            Ok((context, result)) => {
                let result_json = snapshot(&result);
                let confidence = confidence(kind, &context, &result_json);
                info!(
                    kind = kind.as_str(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    confidence,
                    "decision made"
                );
                self.append(kind, context, result_json, confidence).await;
                result
            }
            Err(err) => {
                warn!(
                    kind = kind.as_str(),
                    error = %err,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "decision failed, using fallback"
                );
                fallback_context.insert("error".into(), Value::String(err.to_string()));
                self.append(
                    kind,
                    Value::Object(fallback_context),
                    snapshot(&fallback),
                    FALLBACK_CONFIDENCE,
                )
                .await;
                fallback
            }
        }
    }

    async fn attempt<C, R>(
        &self,
        kind: DecisionKind,
        context: Result<C>,
        build: fn(&C) -> Vec<ChatMessage>,
    ) -> Result<(Value, R)>
    where
        C: Serialize,
        R: DeserializeOwned,
    {
        let context = context?;
        let text = self.dispatcher.execute(&build(&context), kind.sampling()).await?;
        let result = parse_decision(kind, &text)?;
        Ok((snapshot(&context), result))
    }

    async fn append(&self, kind: DecisionKind, context: Value, result: Value, confidence: f64) {
        let entry = DecisionLogEntry::new(kind.as_str(), context, result, confidence);
        if let Err(err) = self.log.record(entry).await {
            warn!(kind = kind.as_str(), error = %err, "failed to log decision");
        }
    }
}
