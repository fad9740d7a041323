//! Instruction builders: one system and one user message per decision kind.
//!
//! Each user message embeds the gathered context and describes the JSON
//! object the model has to answer with.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::{
    chat::ChatMessage,
    context::{DailyContext, PlacementContext, RecoveryContext, SkillContext, WeeklyContext},
};

const JSON_ONLY: &str = "Answer with a single JSON object and nothing else.";

fn system(role: &str) -> ChatMessage {
    ChatMessage::system(format!("You are the AVION {role}. {JSON_ONLY}"))
}

/// Wire name of a serializable enum value.
fn label<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(Value::String(s)) => s,
        Ok(other) => other.to_string(),
        Err(_) => "unknown".to_string(),
    }
}

fn list(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}

fn breakdown<V: std::fmt::Display>(map: &BTreeMap<String, V>) -> String {
    if map.is_empty() {
        return "none".to_string();
    }
    map.iter()
        .map(|(k, v)| format!("{k} {v}%"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn daily_objective(ctx: &DailyContext) -> Vec<ChatMessage> {
    let deadline = match &ctx.next_deadline {
        Some(d) => format!("{} ({}) in {} days", d.title, d.kind, d.days_until),
        None => "none within 14 days".to_string(),
    };
    let user = format!(
        r#"Pick exactly one primary objective for today.

Context:
- date: {date} ({day_type})
- streak: {streak} days
- momentum: {momentum:.0}%
- protocol blocks done: {done}/{total}
- next deadline: {deadline}
- academic progress: {academic:.0}%
- recent performance: {performance}

Guidelines: protect a streak shorter than 3 days first, prepare for a deadline
that is 3 days away or closer, otherwise work on the weakest placement area.

Schema:
{{
  "objective": string,
  "type": "protocol" | "academic" | "skill" | "deadline",
  "priority": "critical" | "high" | "medium",
  "reason": string,
  "estimatedTime": string,
  "successCriteria": string
}}"#,
        date = ctx.date,
        day_type = label(&ctx.day_type),
        streak = ctx.current_streak,
        momentum = ctx.momentum_score,
        done = ctx.protocol_completed,
        total = ctx.protocol_total,
        academic = ctx.academic_progress,
        performance = label(&ctx.recent_performance),
    );
    vec![system("daily objective selector"), ChatMessage::user(user)]
}

pub fn weekly_analysis(ctx: &WeeklyContext) -> Vec<ChatMessage> {
    let distribution = serde_json::to_string(&ctx.time_distribution).unwrap_or_default();
    let user = format!(
        r#"Review the last 7 days and recommend adjustments for next week.

Context:
- days with execution: {days}/7 (missed {missed})
- average daily score: {avg:.1}%
- streak: {streak}
- protocol completion: {protocol:.1}%
- academic progress: {academic:.0}%
- time distribution (percent): {distribution}
- trend: {trend}

Schema:
{{
  "verdict": "excellent" | "good" | "needs_improvement" | "critical",
  "weeklyScore": number 0-100,
  "weakestArea": "skill_training" | "academic_study" | "protocol_consistency" | "time_management",
  "focusShift": string,
  "adjustments": [string],
  "riskFactors": [string],
  "strengths": [string]
}}"#,
        days = ctx.execution_days,
        missed = ctx.missed_days,
        avg = ctx.avg_daily_score,
        streak = label(&ctx.streak_status),
        protocol = ctx.protocol_completion,
        academic = ctx.academic_progress,
        trend = label(&ctx.performance_trend),
    );
    vec![system("performance analyst"), ChatMessage::user(user)]
}

pub fn skill_syllabus(ctx: &SkillContext) -> Vec<ChatMessage> {
    let user = format!(
        r#"Plan week {week} of the {track} skill track from last week's results.

Context:
- completion last week: {completion:.0}%
- average difficulty handled: {difficulty:.1}/5
- time efficiency: {efficiency:.0}%
- average confidence: {confidence:.1}/5
- struggling with: {struggles}
- strong at: {strengths}

Lower the difficulty one level below 70% completion, raise it one level above
90% completion with confidence over 4, add practice when efficiency is under
60%. Every task needs an emergency time of about half its minimum time.

Schema (exactly 7 entries in dailyTasks):
{{
  "weekTitle": string,
  "difficultyLevel": integer 1-5,
  "focusAreas": [string],
  "dailyTasks": [{{
    "day": string,
    "task": string,
    "difficulty": integer 1-5,
    "minTime": minutes,
    "emergencyTime": minutes,
    "skills": [string]
  }}],
  "emergencyTask": string,
  "adaptationReason": string
}}"#,
        week = ctx.week_number,
        track = ctx.track_name,
        completion = ctx.previous_completion,
        difficulty = ctx.avg_difficulty,
        efficiency = ctx.time_efficiency,
        confidence = ctx.avg_confidence,
        struggles = list(&ctx.struggle_areas),
        strengths = list(&ctx.strengths),
    );
    vec![system("curriculum planner"), ChatMessage::user(user)]
}

pub fn recovery_mode(ctx: &RecoveryContext) -> Vec<ChatMessage> {
    let stress: Vec<String> = ctx
        .stress_indicators
        .iter()
        .map(|s| s.as_str().to_string())
        .collect();
    let user = format!(
        r#"Decide whether the user should switch to recovery mode.

Context:
- streak: {streak} days
- days since activity: {inactive}
- recent completion rate: {rate}%
- momentum: {momentum:.0}%
- missed critical blocks this week: {missed_blocks}
- stress indicators: {stress}
- emergency mode usage: {emergency}%
- consecutive missed days: {missed_days}

Recovery is warranted for a broken streak with more than 2 inactive days,
completion under 30%, momentum under 20%, several stress indicators at once
or emergency mode on more than half of the days.

Schema:
{{
  "enterRecoveryMode": boolean,
  "recoveryLevel": "light" | "deep" | "emergency",
  "reason": string,
  "recoveryDuration": string,
  "simplifiedTasks": [string],
  "exitCriteria": string,
  "urgencyLevel": "low" | "medium" | "high"
}}"#,
        streak = ctx.current_streak,
        inactive = ctx.days_since_activity,
        rate = ctx.recent_completion_rate,
        momentum = ctx.momentum_score,
        missed_blocks = ctx.missed_critical_blocks,
        stress = list(&stress),
        emergency = ctx.emergency_mode_usage,
        missed_days = ctx.consecutive_missed_days,
    );
    vec![system("recovery supervisor"), ChatMessage::user(user)]
}

pub fn placement_readiness(ctx: &PlacementContext) -> Vec<ChatMessage> {
    let user = format!(
        r#"Explain the current placement readiness and what to do next.

Context:
- overall readiness: {overall:.0}%
- academics: {academics}
- skills: {skills}
- recent trend: {trend}
- weak areas: {weak}
- strong areas: {strong}
- days until placement season: {days}
- streak: {streak} days, momentum {momentum:.0}%

Give two concrete next actions with a timeline.

Schema:
{{
  "readinessExplanation": string,
  "trendAnalysis": string,
  "nextActions": [string],
  "riskAssessment": "low" | "medium" | "high",
  "timeToImprove": string,
  "focusPriority": string
}}"#,
        overall = ctx.overall_readiness,
        academics = breakdown(&ctx.academic_breakdown),
        skills = breakdown(&ctx.skill_breakdown),
        trend = ctx.recent_trend,
        weak = list(&ctx.weak_areas),
        strong = list(&ctx.strong_areas),
        days = ctx.days_to_placement,
        streak = ctx.current_streak,
        momentum = ctx.momentum_score,
    );
    vec![system("placement advisor"), ChatMessage::user(user)]
}

pub fn health_check() -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(r#"Connectivity check. Reply with exactly {"status": "ok"}"#),
        ChatMessage::user("health check"),
    ]
}
