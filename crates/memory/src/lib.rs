use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;

mod records;
pub use records::{
    BlockStatus, CalendarEvent, DecisionLogEntry, EventKind, ExecutionRecord, RoutineRecord,
    SkillProgressEntry, SystemState, TimeEntry, CRITICAL_BLOCKS, PROTOCOL_BLOCKS_PER_DAY,
};

const SCHEMA: &str = r#"
    PRAGMA journal_mode=WAL;
    CREATE TABLE IF NOT EXISTS system_state(
        id INTEGER PRIMARY KEY CHECK (id = 1),
        current_streak INTEGER NOT NULL DEFAULT 0,
        momentum_score REAL NOT NULL DEFAULT 0,
        academic_progress REAL NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS daily_execution(
        date TEXT PRIMARY KEY,
        execution_score REAL NOT NULL
    );
    CREATE TABLE IF NOT EXISTS daily_routine(
        date TEXT PRIMARY KEY,
        blocks_json TEXT NOT NULL,
        momentum_score REAL NOT NULL DEFAULT 0,
        emergency_mode INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS calendar_events(
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        date TEXT NOT NULL,
        title TEXT NOT NULL,
        kind TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS skill_progress(
        track TEXT NOT NULL,
        week INTEGER NOT NULL,
        day TEXT NOT NULL,
        task TEXT NOT NULL DEFAULT '',
        completed INTEGER NOT NULL DEFAULT 0,
        difficulty_level INTEGER NULL,
        confidence_rating INTEGER NULL,
        time_spent_min INTEGER NOT NULL DEFAULT 0,
        planned_min INTEGER NULL,
        PRIMARY KEY (track, week, day)
    );
    CREATE TABLE IF NOT EXISTS time_tracking(
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        date TEXT NOT NULL,
        category TEXT NOT NULL,
        subject TEXT NOT NULL,
        minutes INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS ai_decisions(
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        kind TEXT NOT NULL,
        context_json TEXT NOT NULL,
        result_json TEXT NOT NULL,
        confidence REAL NOT NULL,
        created_ts TEXT NOT NULL
    );
    CREATE TRIGGER IF NOT EXISTS ai_decisions_no_update
        BEFORE UPDATE ON ai_decisions
        BEGIN SELECT RAISE(ABORT, 'ai_decisions is append-only'); END;
    CREATE TRIGGER IF NOT EXISTS ai_decisions_no_delete
        BEFORE DELETE ON ai_decisions
        BEGIN SELECT RAISE(ABORT, 'ai_decisions is append-only'); END;
"#;

// ---------- Public API ----------

#[derive(Clone, Debug, Default)]
pub struct StoreConfig {
    /// Optionaler Pfad zur DB-Datei. Default: $XDG_STATE_HOME/avion/progress.db
    pub db_path: Option<PathBuf>,
}

/// SQLite-backed progress store and decision log.
///
/// Every call opens its own connection, so the store is cheap to share
/// between threads and async tasks (wrap calls in `spawn_blocking`).
#[derive(Clone, Debug)]
pub struct ProgressStore {
    db_path: PathBuf,
}

pub fn default_db_path() -> PathBuf {
    let base = dirs::state_dir().unwrap_or_else(|| {
        // Fallback in $HOME/.local/state
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home.join(".local/state")
    });
    base.join("avion").join("progress.db")
}

impl ProgressStore {
    pub fn open_with(cfg: StoreConfig) -> Result<Self> {
        Self::open(cfg.db_path.unwrap_or_else(default_db_path))
    }

    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create parent dir for {:?}", db_path))?;
        }

        let conn = Connection::open(&db_path)
            .with_context(|| format!("open sqlite at {:?}", db_path))?;
        conn.execute_batch(SCHEMA).context("apply progress schema")?;
        tracing::debug!(path = %db_path.display(), "progress store ready");

        Ok(Self { db_path })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn conn(&self) -> Result<Connection> {
        Connection::open(&self.db_path).with_context(|| format!("open sqlite at {:?}", self.db_path))
    }

    // ---------- system state ----------

    /// Missing row reads as zeroed state.
    pub fn system_state(&self) -> Result<SystemState> {
        let conn = self.conn()?;
        let state = conn
            .query_row(
                "SELECT current_streak, momentum_score, academic_progress FROM system_state WHERE id=1",
                [],
                |r| {
                    Ok(SystemState {
                        current_streak: r.get(0)?,
                        momentum_score: r.get(1)?,
                        academic_progress: r.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(state.unwrap_or_default())
    }

    pub fn set_system_state(&self, state: &SystemState) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"INSERT INTO system_state(id, current_streak, momentum_score, academic_progress)
                VALUES (1, ?1, ?2, ?3)
                ON CONFLICT(id) DO UPDATE SET
                    current_streak=excluded.current_streak,
                    momentum_score=excluded.momentum_score,
                    academic_progress=excluded.academic_progress;"#,
            params![state.current_streak, state.momentum_score, state.academic_progress],
        )?;
        Ok(())
    }

    // ---------- execution history ----------

    pub fn record_execution(&self, record: &ExecutionRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"INSERT INTO daily_execution(date, execution_score) VALUES (?1, ?2)
                ON CONFLICT(date) DO UPDATE SET execution_score=excluded.execution_score;"#,
            params![record.date, record.execution_score],
        )?;
        Ok(())
    }

    /// Records dated `since` or later, oldest first.
    pub fn execution_history(&self, since: NaiveDate) -> Result<Vec<ExecutionRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT date, execution_score FROM daily_execution WHERE date >= ?1 ORDER BY date",
        )?;
        let rows = stmt
            .query_map(params![since], execution_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ---------- routine history ----------

    pub fn record_routine(&self, record: &RoutineRecord) -> Result<()> {
        let blocks = serde_json::to_string(&record.blocks)?;
        let conn = self.conn()?;
        conn.execute(
            r#"INSERT INTO daily_routine(date, blocks_json, momentum_score, emergency_mode)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(date) DO UPDATE SET
                    blocks_json=excluded.blocks_json,
                    momentum_score=excluded.momentum_score,
                    emergency_mode=excluded.emergency_mode;"#,
            params![record.date, blocks, record.momentum_score, record.emergency_mode],
        )?;
        Ok(())
    }

    pub fn daily_routine(&self, date: NaiveDate) -> Result<Option<RoutineRecord>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT date, blocks_json, momentum_score, emergency_mode FROM daily_routine WHERE date=?1",
                params![date],
                routine_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn routine_history(&self, since: NaiveDate) -> Result<Vec<RoutineRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT date, blocks_json, momentum_score, emergency_mode
                FROM daily_routine WHERE date >= ?1 ORDER BY date"#,
        )?;
        let rows = stmt
            .query_map(params![since], routine_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ---------- calendar ----------

    pub fn add_event(&self, event: &CalendarEvent) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO calendar_events(date, title, kind) VALUES (?1, ?2, ?3)",
            params![event.date, event.title, event.kind.as_str()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Events in `[from, from + horizon_days]`, earliest first.
    pub fn upcoming_events(&self, from: NaiveDate, horizon_days: u32) -> Result<Vec<CalendarEvent>> {
        let until = from + Duration::days(i64::from(horizon_days));
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT date, title, kind FROM calendar_events
                WHERE date >= ?1 AND date <= ?2 ORDER BY date, id"#,
        )?;
        let rows = stmt
            .query_map(params![from, until], |r| {
                let kind: String = r.get(2)?;
                Ok(CalendarEvent {
                    date: r.get(0)?,
                    title: r.get(1)?,
                    kind: kind.parse().unwrap_or_else(|e| {
                        tracing::warn!(error = ?e, "unknown event kind in calendar_events");
                        EventKind::Other
                    }),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ---------- skill progress ----------

    pub fn upsert_skill_progress(&self, track: &str, week: u32, entry: &SkillProgressEntry) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"INSERT INTO skill_progress(track, week, day, task, completed, difficulty_level,
                    confidence_rating, time_spent_min, planned_min)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(track, week, day) DO UPDATE SET
                    task=excluded.task,
                    completed=excluded.completed,
                    difficulty_level=excluded.difficulty_level,
                    confidence_rating=excluded.confidence_rating,
                    time_spent_min=excluded.time_spent_min,
                    planned_min=excluded.planned_min;"#,
            params![
                track,
                week,
                entry.day,
                entry.task,
                entry.completed,
                entry.difficulty_level,
                entry.confidence_rating,
                entry.time_spent_min,
                entry.planned_min
            ],
        )?;
        Ok(())
    }

    pub fn skill_progress(&self, track: &str, week: u32) -> Result<Vec<SkillProgressEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT day, task, completed, difficulty_level, confidence_rating, time_spent_min, planned_min
                FROM skill_progress WHERE track=?1 AND week=?2 ORDER BY day"#,
        )?;
        let rows = stmt
            .query_map(params![track, week], |r| {
                Ok(SkillProgressEntry {
                    day: r.get(0)?,
                    task: r.get(1)?,
                    completed: r.get(2)?,
                    difficulty_level: r.get(3)?,
                    confidence_rating: r.get(4)?,
                    time_spent_min: r.get(5)?,
                    planned_min: r.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ---------- time tracking ----------

    pub fn track_time(&self, entry: &TimeEntry) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO time_tracking(date, category, subject, minutes) VALUES (?1, ?2, ?3, ?4)",
            params![entry.date, entry.category, entry.subject, entry.minutes],
        )?;
        Ok(())
    }

    /// Total minutes per category since `since`.
    pub fn time_by_category(&self, since: NaiveDate) -> Result<BTreeMap<String, u32>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT category, SUM(minutes) FROM time_tracking
                WHERE date >= ?1 GROUP BY category ORDER BY category"#,
        )?;
        let rows = stmt
            .query_map(params![since], |r| Ok((r.get::<_, String>(0)?, r.get::<_, u32>(1)?)))?
            .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;
        Ok(rows)
    }

    // ---------- decision log (append-only) ----------

    pub fn log_decision(&self, entry: &DecisionLogEntry) -> Result<()> {
        let context = serde_json::to_string(&entry.context)?;
        let result = serde_json::to_string(&entry.result)?;
        let conn = self.conn()?;
        conn.execute(
            r#"INSERT INTO ai_decisions(id, kind, context_json, result_json, confidence, created_ts)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
            params![
                entry.id,
                entry.kind,
                context,
                result,
                entry.confidence,
                entry.created_ts
            ],
        )?;
        Ok(())
    }

    /// Newest entries first.
    pub fn recent_decisions(&self, limit: u32) -> Result<Vec<DecisionLogEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, kind, context_json, result_json, confidence, created_ts
                FROM ai_decisions ORDER BY seq DESC LIMIT ?1"#,
        )?;
        let rows = stmt
            .query_map(params![limit], |r| {
                Ok(DecisionLogEntry {
                    id: r.get(0)?,
                    kind: r.get(1)?,
                    context: json_column(r, 2)?,
                    result: json_column(r, 3)?,
                    confidence: r.get(4)?,
                    created_ts: r.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn execution_from_row(r: &Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    Ok(ExecutionRecord {
        date: r.get(0)?,
        execution_score: r.get(1)?,
    })
}

fn routine_from_row(r: &Row<'_>) -> rusqlite::Result<RoutineRecord> {
    Ok(RoutineRecord {
        date: r.get(0)?,
        blocks: json_column(r, 1)?,
        momentum_score: r.get(2)?,
        emergency_mode: r.get(3)?,
    })
}

fn json_column<T: DeserializeOwned>(r: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = r.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
