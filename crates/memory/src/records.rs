use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

/// Blocks that count as critical when judging a day's routine.
pub const CRITICAL_BLOCKS: [&str; 2] = ["morning", "evening"];

/// Number of protocol blocks in a full day.
pub const PROTOCOL_BLOCKS_PER_DAY: u32 = 4;

/// Global counters maintained by the tracker (single row).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemState {
    pub current_streak: u32,
    /// Externally computed consistency metric (0..100), consumed as-is.
    pub momentum_score: f64,
    pub academic_progress: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub date: NaiveDate,
    pub execution_score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStatus {
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutineRecord {
    pub date: NaiveDate,
    #[serde(default)]
    pub blocks: BTreeMap<String, BlockStatus>,
    #[serde(default)]
    pub momentum_score: f64,
    #[serde(default)]
    pub emergency_mode: bool,
}

impl RoutineRecord {
    pub fn completed_blocks(&self) -> u32 {
        self.blocks.values().filter(|b| b.completed).count() as u32
    }

    /// Critical blocks that are absent or not completed.
    pub fn missed_critical_blocks(&self) -> u32 {
        CRITICAL_BLOCKS
            .iter()
            .filter(|id| !self.blocks.get(**id).is_some_and(|b| b.completed))
            .count() as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Exam,
    Deadline,
    Class,
    Other,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Exam => "exam",
            EventKind::Deadline => "deadline",
            EventKind::Class => "class",
            EventKind::Other => "other",
        }
    }

    /// Exams and deadlines are what the daily objective plans around.
    pub fn is_critical(&self) -> bool {
        matches!(self, EventKind::Exam | EventKind::Deadline)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exam" => Ok(EventKind::Exam),
            "deadline" | "dead" => Ok(EventKind::Deadline),
            "class" => Ok(EventKind::Class),
            "other" => Ok(EventKind::Other),
            other => Err(anyhow::anyhow!("unknown event kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub date: NaiveDate,
    pub title: String,
    pub kind: EventKind,
}

/// One day of a skill track week.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillProgressEntry {
    pub day: String,
    #[serde(default)]
    pub task: String,
    pub completed: bool,
    pub difficulty_level: Option<u8>,
    pub confidence_rating: Option<u8>,
    #[serde(default)]
    pub time_spent_min: u32,
    pub planned_min: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeEntry {
    pub date: NaiveDate,
    pub category: String,
    pub subject: String,
    pub minutes: u32,
}

/// Row of the append-only AI decision log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionLogEntry {
    pub id: String,
    pub kind: String,
    pub context: Value,
    pub result: Value,
    pub confidence: f64,
    pub created_ts: DateTime<Utc>,
}

impl DecisionLogEntry {
    pub fn new(kind: impl Into<String>, context: Value, result: Value, confidence: f64) -> Self {
        Self {
            id: Ulid::new().to_string(),
            kind: kind.into(),
            context,
            result,
            confidence,
            created_ts: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routine(blocks: &[(&str, bool)]) -> RoutineRecord {
        RoutineRecord {
            date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            blocks: blocks
                .iter()
                .map(|(id, done)| (id.to_string(), BlockStatus { completed: *done }))
                .collect(),
            momentum_score: 0.0,
            emergency_mode: false,
        }
    }

    #[test]
    fn missing_critical_blocks_count_as_missed() {
        assert_eq!(routine(&[]).missed_critical_blocks(), 2);
        assert_eq!(routine(&[("morning", true)]).missed_critical_blocks(), 1);
        assert_eq!(
            routine(&[("morning", true), ("evening", false), ("noon", true)])
                .missed_critical_blocks(),
            1
        );
        assert_eq!(
            routine(&[("morning", true), ("evening", true)]).missed_critical_blocks(),
            0
        );
    }

    #[test]
    fn event_kind_accepts_legacy_short_form() {
        assert_eq!("dead".parse::<EventKind>().unwrap(), EventKind::Deadline);
        assert_eq!("Exam".parse::<EventKind>().unwrap(), EventKind::Exam);
        assert!("holiday".parse::<EventKind>().is_err());
        assert!(EventKind::Exam.is_critical());
        assert!(!EventKind::Class.is_critical());
    }
}
