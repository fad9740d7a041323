//! Context gathering: read-only snapshots of the progress stores per decision kind.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use avion_memory::{
    CalendarEvent, ExecutionRecord, ProgressStore, RoutineRecord, SkillProgressEntry, SystemState,
    PROTOCOL_BLOCKS_PER_DAY,
};
use chrono::{Datelike, Duration as Days, Local, NaiveDate, Weekday};
use serde::Serialize;
use serde_json::{json, Value};

use crate::{
    config::PlacementProfile,
    error::{AvionError, Result},
};

const WINDOW_DAYS: i64 = 7;
const DEADLINE_HORIZON_DAYS: u32 = 14;
/// Score difference between the two halves of a window that counts as a trend.
const TREND_THRESHOLD: f64 = 5.0;

const DEFAULT_DIFFICULTY: f64 = 2.0;
const DEFAULT_CONFIDENCE: f64 = 3.0;
const DEFAULT_TIME_EFFICIENCY: f64 = 75.0;

/// Source of "today".
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDate);

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        self.0
    }
}

/// Read side of the progress stores.
#[async_trait]
pub trait ProgressSource: Send + Sync {
    async fn system_state(&self) -> Result<SystemState>;
    async fn daily_routine(&self, date: NaiveDate) -> Result<Option<RoutineRecord>>;
    async fn execution_history(&self, since: NaiveDate) -> Result<Vec<ExecutionRecord>>;
    async fn routine_history(&self, since: NaiveDate) -> Result<Vec<RoutineRecord>>;
    async fn upcoming_events(&self, from: NaiveDate, horizon_days: u32) -> Result<Vec<CalendarEvent>>;
    async fn skill_progress(&self, track: &str, week: u32) -> Result<Vec<SkillProgressEntry>>;
    async fn time_by_category(&self, since: NaiveDate) -> Result<BTreeMap<String, u32>>;
}

/// Runs a synchronous store call on the blocking pool.
pub(crate) async fn blocking<T, F>(store: &ProgressStore, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&ProgressStore) -> anyhow::Result<T> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| AvionError::Store(format!("store task failed: {e}")))?
        .map_err(|e| AvionError::Store(format!("{e:#}")))
}

#[async_trait]
impl ProgressSource for ProgressStore {
    async fn system_state(&self) -> Result<SystemState> {
        blocking(self, |s| s.system_state()).await
    }

    async fn daily_routine(&self, date: NaiveDate) -> Result<Option<RoutineRecord>> {
        blocking(self, move |s| s.daily_routine(date)).await
    }

    async fn execution_history(&self, since: NaiveDate) -> Result<Vec<ExecutionRecord>> {
        blocking(self, move |s| s.execution_history(since)).await
    }

    async fn routine_history(&self, since: NaiveDate) -> Result<Vec<RoutineRecord>> {
        blocking(self, move |s| s.routine_history(since)).await
    }

    async fn upcoming_events(&self, from: NaiveDate, horizon_days: u32) -> Result<Vec<CalendarEvent>> {
        blocking(self, move |s| s.upcoming_events(from, horizon_days)).await
    }

    async fn skill_progress(&self, track: &str, week: u32) -> Result<Vec<SkillProgressEntry>> {
        let track = track.to_string();
        blocking(self, move |s| s.skill_progress(&track, week)).await
    }

    async fn time_by_category(&self, since: NaiveDate) -> Result<BTreeMap<String, u32>> {
        blocking(self, move |s| s.time_by_category(since)).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DayType {
    Weekday,
    Weekend,
}

impl DayType {
    pub fn of(date: NaiveDate) -> Self {
        match date.weekday() {
            Weekday::Sat | Weekday::Sun => DayType::Weekend,
            _ => DayType::Weekday,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Improving,
    Declining,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreakStatus {
    Active,
    Broken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StressIndicator {
    ConsecutiveMissedDays,
    LowCompletionRate,
    EmergencyModeOveruse,
    LowMomentum,
}

impl StressIndicator {
    pub fn as_str(&self) -> &'static str {
        match self {
            StressIndicator::ConsecutiveMissedDays => "consecutive_missed_days",
            StressIndicator::LowCompletionRate => "low_completion_rate",
            StressIndicator::EmergencyModeOveruse => "emergency_mode_overuse",
            StressIndicator::LowMomentum => "low_momentum",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Deadline {
    pub title: String,
    pub days_until: i64,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyContext {
    pub date: NaiveDate,
    pub day_type: DayType,
    pub current_streak: u32,
    pub momentum_score: f64,
    pub protocol_completed: u32,
    pub protocol_total: u32,
    pub next_deadline: Option<Deadline>,
    pub academic_progress: f64,
    pub recent_performance: Trend,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeeklyContext {
    pub execution_days: u32,
    pub avg_daily_score: f64,
    pub streak_status: StreakStatus,
    pub protocol_completion: f64,
    pub academic_progress: f64,
    /// Percent of tracked minutes per category.
    pub time_distribution: BTreeMap<String, u32>,
    pub missed_days: u32,
    pub performance_trend: Trend,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillContext {
    pub track_id: String,
    pub week_number: u32,
    pub track_name: String,
    pub previous_completion: f64,
    pub avg_difficulty: f64,
    pub time_efficiency: f64,
    pub avg_confidence: f64,
    pub struggle_areas: Vec<String>,
    pub strengths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryContext {
    pub current_streak: u32,
    pub days_since_activity: u32,
    pub recent_completion_rate: u32,
    pub momentum_score: f64,
    pub missed_critical_blocks: u32,
    pub stress_indicators: Vec<StressIndicator>,
    pub emergency_mode_usage: u32,
    pub consecutive_missed_days: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementContext {
    pub current_streak: u32,
    pub momentum_score: f64,
    pub overall_readiness: f64,
    pub academic_breakdown: BTreeMap<String, f64>,
    pub skill_breakdown: BTreeMap<String, f64>,
    pub recent_trend: String,
    pub weak_areas: Vec<String>,
    pub strong_areas: Vec<String>,
    pub days_to_placement: i64,
}

/// JSON object form of a context, as logged and scored.
pub fn snapshot<T: Serialize>(context: &T) -> Value {
    serde_json::to_value(context).unwrap_or_else(|err| json!({ "error": err.to_string() }))
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    sum / count.max(1) as f64
}

/// Compares the mean score of the newer half of `history` against the older half.
pub fn performance_trend(history: &[ExecutionRecord]) -> Trend {
    if history.len() < 2 {
        return Trend::Stable;
    }
    let mut sorted: Vec<&ExecutionRecord> = history.iter().collect();
    sorted.sort_by_key(|r| r.date);
    let (older, newer) = sorted.split_at(sorted.len() / 2);
    let delta = mean(newer.iter().map(|r| r.execution_score))
        - mean(older.iter().map(|r| r.execution_score));
    if delta > TREND_THRESHOLD {
        Trend::Improving
    } else if delta < -TREND_THRESHOLD {
        Trend::Declining
    } else {
        Trend::Stable
    }
}

/// Days counted back from `today` (at most 7) without a record or with a zero score.
pub fn consecutive_missed_days(history: &[ExecutionRecord], today: NaiveDate) -> u32 {
    (0..WINDOW_DAYS)
        .map(|back| today - Days::days(back))
        .take_while(|day| {
            !history
                .iter()
                .any(|r| r.date == *day && r.execution_score != 0.0)
        })
        .count() as u32
}

/// Minutes per category as whole percentages of the total.
pub fn time_distribution(minutes: &BTreeMap<String, u32>) -> BTreeMap<String, u32> {
    let total: u32 = minutes.values().sum();
    if total == 0 {
        return BTreeMap::new();
    }
    minutes
        .iter()
        .map(|(category, m)| {
            let pct = (f64::from(*m) * 100.0 / f64::from(total)).round() as u32;
            (category.clone(), pct)
        })
        .collect()
}

fn capitalize(id: &str) -> String {
    let mut chars = id.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn time_efficiency(entries: &[SkillProgressEntry]) -> f64 {
    let (planned, spent) = entries
        .iter()
        .filter_map(|e| e.planned_min.map(|p| (p, e.time_spent_min)))
        .filter(|(_, spent)| *spent > 0)
        .fold((0u32, 0u32), |(p, s), (planned, spent)| (p + planned, s + spent));
    if spent == 0 {
        DEFAULT_TIME_EFFICIENCY
    } else {
        (f64::from(planned) * 100.0 / f64::from(spent)).min(100.0)
    }
}

fn tasks_where(entries: &[SkillProgressEntry], keep: impl Fn(u8) -> bool, default: &str) -> Vec<String> {
    let tasks: Vec<String> = entries
        .iter()
        .filter(|e| e.confidence_rating.is_some_and(&keep) && !e.task.is_empty())
        .map(|e| e.task.clone())
        .collect();
    if tasks.is_empty() {
        vec![default.to_string()]
    } else {
        tasks
    }
}

/// Builds the per-kind contexts from a [`ProgressSource`].
#[derive(Clone)]
pub struct ContextGatherer {
    source: Arc<dyn ProgressSource>,
    clock: Arc<dyn Clock>,
    placement: PlacementProfile,
}

impl ContextGatherer {
    pub fn new(
        source: Arc<dyn ProgressSource>,
        clock: Arc<dyn Clock>,
        placement: PlacementProfile,
    ) -> Self {
        Self {
            source,
            clock,
            placement,
        }
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    fn window_start(&self) -> NaiveDate {
        self.today() - Days::days(WINDOW_DAYS - 1)
    }

    pub async fn daily(&self) -> Result<DailyContext> {
        let today = self.today();
        let state = self.source.system_state().await?;
        let routine = self.source.daily_routine(today).await?;
        let events = self
            .source
            .upcoming_events(today, DEADLINE_HORIZON_DAYS)
            .await?;
        let history = self.source.execution_history(self.window_start()).await?;

        let next_deadline = events
            .iter()
            .filter(|e| e.kind.is_critical())
            .min_by_key(|e| e.date)
            .map(|e| Deadline {
                title: e.title.clone(),
                days_until: (e.date - today).num_days(),
                kind: e.kind.as_str().to_string(),
            });

        Ok(DailyContext {
            date: today,
            day_type: DayType::of(today),
            current_streak: state.current_streak,
            momentum_score: state.momentum_score,
            protocol_completed: routine.map(|r| r.completed_blocks()).unwrap_or(0),
            protocol_total: PROTOCOL_BLOCKS_PER_DAY,
            next_deadline,
            academic_progress: state.academic_progress,
            recent_performance: performance_trend(&history),
        })
    }

    pub async fn weekly(&self) -> Result<WeeklyContext> {
        let since = self.window_start();
        let state = self.source.system_state().await?;
        let executions = self.source.execution_history(since).await?;
        let routines = self.source.routine_history(since).await?;
        let minutes = self.source.time_by_category(since).await?;

        let execution_days = executions.len() as u32;
        Ok(WeeklyContext {
            execution_days,
            avg_daily_score: mean(executions.iter().map(|e| e.execution_score)),
            streak_status: if execution_days > 0 {
                StreakStatus::Active
            } else {
                StreakStatus::Broken
            },
            protocol_completion: mean(routines.iter().map(|r| r.momentum_score)),
            academic_progress: state.academic_progress,
            time_distribution: time_distribution(&minutes),
            missed_days: (WINDOW_DAYS as u32).saturating_sub(execution_days),
            performance_trend: performance_trend(&executions),
        })
    }

    /// Context for planning `week` of `track`, built from the previous week's entries.
    pub async fn skill(&self, track: &str, week: u32) -> Result<SkillContext> {
        let entries = self
            .source
            .skill_progress(track, week.saturating_sub(1))
            .await?;

        let completed = entries.iter().filter(|e| e.completed).count();
        Ok(SkillContext {
            track_id: track.to_string(),
            week_number: week,
            track_name: capitalize(track),
            previous_completion: completed as f64 * 100.0 / entries.len().max(1) as f64,
            avg_difficulty: mean(
                entries
                    .iter()
                    .map(|e| e.difficulty_level.map_or(DEFAULT_DIFFICULTY, f64::from)),
            ),
            time_efficiency: time_efficiency(&entries),
            avg_confidence: mean(
                entries
                    .iter()
                    .map(|e| e.confidence_rating.map_or(DEFAULT_CONFIDENCE, f64::from)),
            ),
            struggle_areas: tasks_where(&entries, |c| c <= 2, "Complex algorithms"),
            strengths: tasks_where(&entries, |c| c >= 4, "Basic syntax"),
        })
    }

    pub async fn recovery(&self) -> Result<RecoveryContext> {
        let today = self.today();
        let since = self.window_start();
        let state = self.source.system_state().await?;
        let executions = self.source.execution_history(since).await?;
        let routines = self.source.routine_history(since).await?;

        let missed = consecutive_missed_days(&executions, today);
        let completion_rate = mean(executions.iter().map(|e| e.execution_score));
        let emergency_usage = routines.iter().filter(|r| r.emergency_mode).count() as f64 * 100.0
            / routines.len().max(1) as f64;

        let mut stress = Vec::new();
        if missed >= 2 {
            stress.push(StressIndicator::ConsecutiveMissedDays);
        }
        if completion_rate < 30.0 {
            stress.push(StressIndicator::LowCompletionRate);
        }
        if emergency_usage > 30.0 {
            stress.push(StressIndicator::EmergencyModeOveruse);
        }
        if state.momentum_score < 25.0 {
            stress.push(StressIndicator::LowMomentum);
        }

        Ok(RecoveryContext {
            current_streak: state.current_streak,
            days_since_activity: missed,
            recent_completion_rate: completion_rate.round() as u32,
            momentum_score: state.momentum_score,
            missed_critical_blocks: routines.iter().map(|r| r.missed_critical_blocks()).sum(),
            stress_indicators: stress,
            emergency_mode_usage: emergency_usage.round() as u32,
            consecutive_missed_days: missed,
        })
    }

    pub async fn placement(&self) -> Result<PlacementContext> {
        let state = self.source.system_state().await?;
        let profile = &self.placement;
        Ok(PlacementContext {
            current_streak: state.current_streak,
            momentum_score: state.momentum_score,
            overall_readiness: profile.overall_readiness,
            academic_breakdown: profile.academic_breakdown.clone(),
            skill_breakdown: profile.skill_breakdown.clone(),
            recent_trend: profile.recent_trend.clone(),
            weak_areas: profile.weak_areas.clone(),
            strong_areas: profile.strong_areas.clone(),
            days_to_placement: profile.days_to_placement(self.today()),
        })
    }
}
