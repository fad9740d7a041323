//! In-memory fakes for the decision layer seams (testing only).
//!
//! Provides a scripted [`ChatBackend`], a [`Sleeper`] that only records,
//! and in-memory [`ProgressSource`] / [`DecisionLog`] implementations.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use avion_memory::{
    CalendarEvent, DecisionLogEntry, ExecutionRecord, RoutineRecord, SkillProgressEntry,
    SystemState, TimeEntry,
};
use chrono::{Duration as Days, NaiveDate};

use crate::{
    chat::ChatCompletionRequest,
    context::ProgressSource,
    decision::DecisionLog,
    dispatch::ChatBackend,
    error::{AvionError, Result},
    retry::Sleeper,
};

// ---------------------------------------------------------------------------
// ScriptedBackend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Status(u16, String),
    /// Never answers; exercises the per-attempt timeout.
    Hang,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Reply::Text(text.into())
    }

    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Reply::Status(status, message.into())
    }
}

/// Replays a script of replies; the last one repeats once the script runs out.
#[derive(Debug)]
pub struct ScriptedBackend {
    script: Mutex<VecDeque<Reply>>,
    last: Mutex<Reply>,
    per_model: HashMap<String, Reply>,
    requests: Mutex<Vec<ChatCompletionRequest>>,
}

impl ScriptedBackend {
    pub fn new(script: impl IntoIterator<Item = Reply>) -> Self {
        let script: VecDeque<Reply> = script.into_iter().collect();
        let last = script
            .back()
            .cloned()
            .unwrap_or_else(|| Reply::status(500, "empty script"));
        Self {
            script: Mutex::new(script),
            last: Mutex::new(last),
            per_model: HashMap::new(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn always_ok(text: impl Into<String>) -> Self {
        Self::new([Reply::text(text)])
    }

    pub fn always_status(status: u16, message: impl Into<String>) -> Self {
        Self::new([Reply::status(status, message)])
    }

    /// Requests for `model` always get `reply`, bypassing the script.
    pub fn with_model_reply(mut self, model: impl Into<String>, reply: Reply) -> Self {
        self.per_model.insert(model.into(), reply);
        self
    }

    pub fn requests(&self) -> Vec<ChatCompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn models(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.model).collect()
    }

    fn next_reply(&self, model: &str) -> Reply {
        if let Some(reply) = self.per_model.get(model) {
            return reply.clone();
        }
        let mut script = self.script.lock().unwrap();
        match script.pop_front() {
            Some(reply) => {
                *self.last.lock().unwrap() = reply.clone();
                reply
            }
            None => self.last.lock().unwrap().clone(),
        }
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn complete(&self, request: &ChatCompletionRequest) -> Result<String> {
        self.requests.lock().unwrap().push(request.clone());
        match self.next_reply(&request.model) {
            Reply::Text(text) => Ok(text),
            Reply::Status(status, message) => Err(AvionError::Upstream { status, message }),
            Reply::Hang => std::future::pending().await,
        }
    }
}

// ---------------------------------------------------------------------------
// RecordingSleeper
// ---------------------------------------------------------------------------

/// Fake clock: remembers every requested delay and returns at once.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.slept.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept.lock().unwrap().push(duration);
    }
}

// ---------------------------------------------------------------------------
// MemoryProgressSource
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct MemoryProgressSource {
    pub state: SystemState,
    pub executions: Vec<ExecutionRecord>,
    pub routines: Vec<RoutineRecord>,
    pub events: Vec<CalendarEvent>,
    pub skills: BTreeMap<(String, u32), Vec<SkillProgressEntry>>,
    pub time: Vec<TimeEntry>,
    /// Every read fails when set.
    pub fail: bool,
}

impl MemoryProgressSource {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn check(&self) -> Result<()> {
        if self.fail {
            Err(AvionError::Store("progress store unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ProgressSource for MemoryProgressSource {
    async fn system_state(&self) -> Result<SystemState> {
        self.check()?;
        Ok(self.state.clone())
    }

    async fn daily_routine(&self, date: NaiveDate) -> Result<Option<RoutineRecord>> {
        self.check()?;
        Ok(self.routines.iter().find(|r| r.date == date).cloned())
    }

    async fn execution_history(&self, since: NaiveDate) -> Result<Vec<ExecutionRecord>> {
        self.check()?;
        Ok(self
            .executions
            .iter()
            .filter(|r| r.date >= since)
            .cloned()
            .collect())
    }

    async fn routine_history(&self, since: NaiveDate) -> Result<Vec<RoutineRecord>> {
        self.check()?;
        Ok(self
            .routines
            .iter()
            .filter(|r| r.date >= since)
            .cloned()
            .collect())
    }

    async fn upcoming_events(&self, from: NaiveDate, horizon_days: u32) -> Result<Vec<CalendarEvent>> {
        self.check()?;
        let until = from + Days::days(i64::from(horizon_days));
        let mut events: Vec<CalendarEvent> = self
            .events
            .iter()
            .filter(|e| e.date >= from && e.date <= until)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.date);
        Ok(events)
    }

    async fn skill_progress(&self, track: &str, week: u32) -> Result<Vec<SkillProgressEntry>> {
        self.check()?;
        Ok(self
            .skills
            .get(&(track.to_string(), week))
            .cloned()
            .unwrap_or_default())
    }

    async fn time_by_category(&self, since: NaiveDate) -> Result<BTreeMap<String, u32>> {
        self.check()?;
        let mut totals = BTreeMap::new();
        for entry in self.time.iter().filter(|t| t.date >= since) {
            *totals.entry(entry.category.clone()).or_insert(0) += entry.minutes;
        }
        Ok(totals)
    }
}

// ---------------------------------------------------------------------------
// MemoryDecisionLog
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryDecisionLog {
    entries: Mutex<Vec<DecisionLogEntry>>,
    fail: bool,
}

impl MemoryDecisionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A log whose writes always fail.
    pub fn failing() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn entries(&self) -> Vec<DecisionLogEntry> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl DecisionLog for MemoryDecisionLog {
    async fn record(&self, entry: DecisionLogEntry) -> Result<()> {
        if self.fail {
            return Err(AvionError::Store("decision log unavailable".to_string()));
        }
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }
}
