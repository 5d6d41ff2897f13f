//! Run-history storage: records of finished runs and their event streams.
//!
//! Backends persist each run as a `RunRecord` plus the run's events in wire
//! form (serialized JSON, one string per event). Replay is tolerant: stored
//! events whose `type` field is missing or unrecognized are skipped, never
//! fatal. Two backends ship: in-memory and SQLite.

use std::env;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Event, EventType};

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryBackend;
pub use sqlite::SqliteBackend;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminalStatus {
    Success,
    Failed,
}

impl TerminalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalStatus::Success => "SUCCESS",
            TerminalStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUCCESS" => Some(TerminalStatus::Success),
            "FAILED" => Some(TerminalStatus::Failed),
            _ => None,
        }
    }
}

/// Summary record of one finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    /// Name of the pipeline that ran.
    pub pipeline: String,
    pub status: TerminalStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Stage of the first unrecovered failure, if any.
    pub error_step: Option<String>,
    /// Opaque run-level metadata, serialized by the caller.
    pub run_meta: Option<String>,
}

impl RunRecord {
    /// Derive a record from a collected event sequence. The run counts as
    /// failed when any STEP_ERROR or PIPELINE_ERROR was emitted.
    pub fn from_events(run_id: impl Into<String>, pipeline: impl Into<String>, events: &[Event]) -> Self {
        let first_error = events.iter().find(|e| {
            matches!(
                e.event_type,
                EventType::StepError | EventType::PipelineError
            )
        });
        let status = if first_error.is_some() {
            TerminalStatus::Failed
        } else {
            TerminalStatus::Success
        };
        Self {
            run_id: run_id.into(),
            pipeline: pipeline.into(),
            status,
            started_at: events
                .first()
                .map(|e| e.timestamp)
                .unwrap_or_else(Utc::now),
            finished_at: events.last().map(|e| e.timestamp),
            error_message: first_error.map(|e| e.payload.to_string()),
            error_step: first_error.map(|e| e.stage.clone()),
            run_meta: None,
        }
    }
}

/// Storage backend failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid event record: {0}")]
    InvalidEvent(String),
    #[error("run '{0}' already exists")]
    DuplicateRun(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Persistent run history.
pub trait StorageBackend: Send + Sync {
    /// Atomically save a run and its events (wire-form JSON strings). A
    /// malformed event aborts the whole save.
    fn save_run(&self, run: &RunRecord, events: &[String]) -> Result<(), StorageError>;

    fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, StorageError>;

    /// Most-recent-first listing with optional status filter and paging.
    fn list_runs(
        &self,
        status: Option<TerminalStatus>,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<RunRecord>, StorageError>;

    /// Replay a run's events, optionally filtered by type. Stored records
    /// that fail to parse are skipped.
    fn get_events(
        &self,
        run_id: &str,
        event_type: Option<EventType>,
    ) -> Result<Vec<Event>, StorageError>;

    /// Delete a run and its events; returns whether anything was deleted.
    fn delete_run(&self, run_id: &str) -> Result<bool, StorageError>;

    /// Runs whose id starts with `prefix`, most recent first.
    fn find_runs_by_prefix(
        &self,
        prefix: &str,
        limit: Option<usize>,
    ) -> Result<Vec<RunRecord>, StorageError>;
}

/// Storage directory: `JUSTPIPE_STORAGE_PATH` when set, else `~/.justpipe`.
pub fn resolve_storage_path() -> PathBuf {
    if let Ok(path) = env::var("JUSTPIPE_STORAGE_PATH") {
        return PathBuf::from(path);
    }
    let home = env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".justpipe")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_resolve_storage_path_env_override_and_default() {
        // Single test covers both branches: env mutation is process-global.
        env::set_var("JUSTPIPE_STORAGE_PATH", "/tmp/justpipe-test");
        assert_eq!(
            resolve_storage_path(),
            PathBuf::from("/tmp/justpipe-test")
        );

        env::remove_var("JUSTPIPE_STORAGE_PATH");
        let default = resolve_storage_path();
        assert!(default.ends_with(".justpipe"));
    }

    #[test]
    fn test_run_record_from_events_success() {
        let events = vec![
            Event::new(EventType::Start, "p", Value::Null),
            Event::new(EventType::StepStart, "a", Value::Null),
            Event::new(EventType::StepEnd, "a", Value::Null),
            Event::new(EventType::Finish, "p", Value::Null),
        ];
        let record = RunRecord::from_events("r1", "p", &events);
        assert_eq!(record.status, TerminalStatus::Success);
        assert!(record.error_step.is_none());
        assert_eq!(record.started_at, events[0].timestamp);
        assert_eq!(record.finished_at, Some(events[3].timestamp));
    }

    #[test]
    fn test_run_record_from_events_failure() {
        let events = vec![
            Event::new(EventType::Start, "p", Value::Null),
            Event::new(EventType::StepStart, "step_a", Value::Null),
            Event::new(EventType::StepError, "step_a", json!("step exploded")),
            Event::new(EventType::Finish, "p", Value::Null),
        ];
        let record = RunRecord::from_events("err1", "p", &events);
        assert_eq!(record.status, TerminalStatus::Failed);
        assert_eq!(record.error_step.as_deref(), Some("step_a"));
        assert!(record.error_message.unwrap().contains("step exploded"));
    }

    #[tokio::test]
    async fn test_run_events_persist_and_replay() {
        use crate::pipe::{Pipe, StepConfig};
        use crate::testing::TestResult;
        use crate::types::StepOutcome;

        let mut pipe: Pipe<(), ()> = Pipe::new("etl");
        pipe.step(StepConfig::new("extract").to("load"), |_| async {
            Ok(StepOutcome::value(json!({"rows": 2})))
        })
        .unwrap();
        pipe.step(StepConfig::new("load"), |_| async { Ok(StepOutcome::none()) })
            .unwrap();

        let result = TestResult::collect(pipe.run(())).await;
        let wire: Vec<String> = result.events.iter().map(Event::to_wire).collect();
        let record = RunRecord::from_events("run-etl-1", "etl", &result.events);
        assert_eq!(record.status, TerminalStatus::Success);

        let backend = memory::InMemoryBackend::new();
        backend.save_run(&record, &wire).unwrap();

        // Replay gives back the exact emitted sequence.
        let replayed = backend.get_events("run-etl-1", None).unwrap();
        assert_eq!(replayed, result.events);
        let ends = backend
            .get_events("run-etl-1", Some(EventType::StepEnd))
            .unwrap();
        assert_eq!(ends.len(), 2);
        assert_eq!(ends[0].payload, json!({"rows": 2}));
    }
}
