use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::Context;
use avion_core::{load_config, DecisionLayer};
use avion_memory::{
    BlockStatus, CalendarEvent, EventKind, ExecutionRecord, ProgressStore, RoutineRecord,
    SkillProgressEntry, StoreConfig, SystemState, TimeEntry,
};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "avion", version, about = "AVION decision layer CLI")]
struct Cli {
    /// More log output
    #[arg(long, short, global = true)]
    verbose: bool,

    /// YAML config file
    #[arg(long, global = true, env = "AVION_CONFIG", default_value = "./configs/avion.yaml")]
    config: PathBuf,

    /// Progress database (default: $XDG_STATE_HOME/avion/progress.db)
    #[arg(long, global = true, env = "AVION_DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ask the decision layer; prints the result as JSON
    Decide {
        #[command(subcommand)]
        cmd: DecideCmd,
    },
    /// Check that the upstream model answers
    Health,
    /// Show the newest decision log entries
    Log {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Write tracker data into the progress store
    Record {
        #[command(subcommand)]
        cmd: RecordCmd,
    },
}

#[derive(Subcommand, Debug)]
enum DecideCmd {
    /// Primary objective for today
    Daily,
    /// Verdict on the last seven days
    Weekly,
    /// Seven-day plan for a skill track week
    Syllabus {
        #[arg(long)]
        track: String,
        #[arg(long)]
        week: u32,
    },
    /// Whether to switch to a reduced workload
    Recovery,
    /// Narrative around the placement readiness score
    Readiness,
}

#[derive(Subcommand, Debug)]
enum RecordCmd {
    /// Overwrite the global counters
    State {
        #[arg(long)]
        streak: u32,
        #[arg(long)]
        momentum: f64,
        #[arg(long, default_value_t = 0.0)]
        academic: f64,
    },
    /// Daily execution score (0..100)
    Execution {
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        score: f64,
    },
    /// Protocol blocks of one day
    Routine {
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Completed block ids, e.g. morning,evening
        #[arg(long, value_delimiter = ',')]
        completed: Vec<String>,
        /// Blocks that were planned but skipped
        #[arg(long, value_delimiter = ',')]
        missed: Vec<String>,
        #[arg(long, default_value_t = 0.0)]
        momentum: f64,
        #[arg(long)]
        emergency: bool,
    },
    /// Minutes spent on a subject
    Time {
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        category: String,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        minutes: u32,
    },
    /// Calendar entry (exam, deadline, class, other)
    Event {
        #[arg(long)]
        date: NaiveDate,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "deadline")]
        kind: EventKind,
    },
    /// One day of a skill track week
    Skill {
        #[arg(long)]
        track: String,
        #[arg(long)]
        week: u32,
        #[arg(long)]
        day: String,
        #[arg(long, default_value = "")]
        task: String,
        #[arg(long)]
        completed: bool,
        #[arg(long)]
        difficulty: Option<u8>,
        #[arg(long)]
        confidence: Option<u8>,
        #[arg(long, default_value_t = 0)]
        spent: u32,
        #[arg(long)]
        planned: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    let store = ProgressStore::open_with(StoreConfig { db_path: cli.db })?;
    tracing::debug!(db = %store.path().display(), "progress store opened");

    match cli.command {
        Commands::Decide { cmd } => {
            let layer = decision_layer(&cli.config, store)?;
            match cmd {
                DecideCmd::Daily => print_json(&layer.select_daily_objective().await)?,
                DecideCmd::Weekly => print_json(&layer.analyze_weekly_performance().await)?,
                DecideCmd::Syllabus { track, week } => {
                    print_json(&layer.generate_skill_syllabus(&track, week).await)?
                }
                DecideCmd::Recovery => print_json(&layer.should_enter_recovery_mode().await)?,
                DecideCmd::Readiness => print_json(&layer.explain_placement_readiness().await)?,
            }
        }
        Commands::Health => {
            let layer = decision_layer(&cli.config, store)?;
            if !layer.health_check().await {
                anyhow::bail!("decision upstream is not healthy");
            }
            println!("ok");
        }
        Commands::Log { limit } => print_log_table(&store, limit)?,
        Commands::Record { cmd } => record(&store, cmd)?,
    }

    Ok(())
}

fn decision_layer(config: &Path, store: ProgressStore) -> anyhow::Result<DecisionLayer> {
    let config = load_config(config).with_env();
    DecisionLayer::from_config(&config.decision, store).context("decision layer setup failed")
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn today_or(date: Option<NaiveDate>) -> NaiveDate {
    date.unwrap_or_else(|| Local::now().date_naive())
}

fn record(store: &ProgressStore, cmd: RecordCmd) -> anyhow::Result<()> {
    match cmd {
        RecordCmd::State {
            streak,
            momentum,
            academic,
        } => store.set_system_state(&SystemState {
            current_streak: streak,
            momentum_score: momentum,
            academic_progress: academic,
        })?,
        RecordCmd::Execution { date, score } => store.record_execution(&ExecutionRecord {
            date: today_or(date),
            execution_score: score,
        })?,
        RecordCmd::Routine {
            date,
            completed,
            missed,
            momentum,
            emergency,
        } => {
            let mut blocks = BTreeMap::new();
            for id in missed {
                blocks.insert(id, BlockStatus { completed: false });
            }
            for id in completed {
                blocks.insert(id, BlockStatus { completed: true });
            }
            store.record_routine(&RoutineRecord {
                date: today_or(date),
                blocks,
                momentum_score: momentum,
                emergency_mode: emergency,
            })?
        }
        RecordCmd::Time {
            date,
            category,
            subject,
            minutes,
        } => store.track_time(&TimeEntry {
            date: today_or(date),
            category,
            subject,
            minutes,
        })?,
        RecordCmd::Event { date, title, kind } => {
            let id = store.add_event(&CalendarEvent { date, title, kind })?;
            println!("event {id}");
        }
        RecordCmd::Skill {
            track,
            week,
            day,
            task,
            completed,
            difficulty,
            confidence,
            spent,
            planned,
        } => store.upsert_skill_progress(
            &track,
            week,
            &SkillProgressEntry {
                day,
                task,
                completed,
                difficulty_level: difficulty,
                confidence_rating: confidence,
                time_spent_min: spent,
                planned_min: planned,
            },
        )?,
    }
    Ok(())
}

fn print_log_table(store: &ProgressStore, limit: u32) -> anyhow::Result<()> {
    use tabled::{Table, Tabled};

    #[derive(Tabled)]
    struct Row {
        id: String,
        kind: String,
        #[tabled(rename = "Confidence")]
        confidence: String,
        #[tabled(rename = "Created")]
        created: String,
    }

    let rows: Vec<Row> = store
        .recent_decisions(limit)?
        .into_iter()
        .map(|entry| Row {
            id: entry.id,
            kind: entry.kind,
            confidence: format!("{:.1}", entry.confidence),
            created: entry.created_ts.format("%Y-%m-%d %H:%M:%S").to_string(),
        })
        .collect();

    let table = Table::new(rows).to_string();
    println!("{table}");
    Ok(())
}
