//! SQLite-backed run history.
//!
//! File-based persistence suitable for development and moderate production
//! load. A connection is opened per operation, so separate backend
//! instances over the same file interoperate. Events are stored in wire
//! form; generated columns expose the event type and stage for SQL-side
//! filtering.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{RunRecord, StorageBackend, StorageError, TerminalStatus};
use crate::types::{Event, EventType};

/// SQLite [`StorageBackend`]. The schema is created on construction; a
/// corrupt database file fails here rather than on first use.
#[derive(Debug)]
pub struct SqliteBackend {
    db_path: PathBuf,
}

impl SqliteBackend {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let backend = Self {
            db_path: db_path.as_ref().to_path_buf(),
        };
        backend.init_schema()?;
        Ok(backend)
    }

    fn conn(&self) -> Result<Connection, StorageError> {
        Ok(Connection::open(&self.db_path)?)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS runs (
                run_id        TEXT PRIMARY KEY,
                pipeline      TEXT NOT NULL,
                status        TEXT NOT NULL,
                started_at    TEXT NOT NULL,
                finished_at   TEXT,
                error_message TEXT,
                error_step    TEXT,
                run_meta      TEXT
            );
            CREATE TABLE IF NOT EXISTS events (
                run_id     TEXT NOT NULL,
                seq        INTEGER NOT NULL,
                raw        TEXT NOT NULL,
                event_type TEXT GENERATED ALWAYS AS (json_extract(raw, '$.type')) VIRTUAL,
                stage      TEXT GENERATED ALWAYS AS (json_extract(raw, '$.stage')) VIRTUAL,
                PRIMARY KEY (run_id, seq)
            );
            CREATE INDEX IF NOT EXISTS idx_events_run ON events(run_id);",
        )?;
        Ok(())
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
        let status: String = row.get("status")?;
        let started_at: String = row.get("started_at")?;
        let finished_at: Option<String> = row.get("finished_at")?;
        Ok(RunRecord {
            run_id: row.get("run_id")?,
            pipeline: row.get("pipeline")?,
            status: TerminalStatus::parse(&status).unwrap_or(TerminalStatus::Failed),
            started_at: parse_timestamp(&started_at),
            finished_at: finished_at.as_deref().map(parse_timestamp),
            error_message: row.get("error_message")?,
            error_step: row.get("error_step")?,
            run_meta: row.get("run_meta")?,
        })
    }
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Run-id prefixes are restricted to `[A-Za-z0-9_-]` so they can never
/// smuggle LIKE wildcards or statement syntax.
fn valid_prefix(prefix: &str) -> bool {
    !prefix.is_empty()
        && prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl StorageBackend for SqliteBackend {
    fn save_run(&self, run: &RunRecord, events: &[String]) -> Result<(), StorageError> {
        // Validate before touching the database so a bad event never leaves
        // a half-written run behind.
        for raw in events {
            if serde_json::from_str::<serde_json::Value>(raw).is_err() {
                return Err(StorageError::InvalidEvent(raw.clone()));
            }
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO runs
             (run_id, pipeline, status, started_at, finished_at, error_message, error_step, run_meta)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run.run_id,
                run.pipeline,
                run.status.as_str(),
                run.started_at.to_rfc3339(),
                run.finished_at.map(|t| t.to_rfc3339()),
                run.error_message,
                run.error_step,
                run.run_meta,
            ],
        )?;
        if inserted == 0 {
            return Err(StorageError::DuplicateRun(run.run_id.clone()));
        }
        for (seq, raw) in events.iter().enumerate() {
            tx.execute(
                "INSERT INTO events (run_id, seq, raw) VALUES (?1, ?2, ?3)",
                params![run.run_id, seq as i64, raw],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, StorageError> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT * FROM runs WHERE run_id = ?1",
                params![run_id],
                Self::row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    fn list_runs(
        &self,
        status: Option<TerminalStatus>,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<RunRecord>, StorageError> {
        let conn = self.conn()?;
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut records = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM runs WHERE status = ?1
                     ORDER BY started_at DESC LIMIT ?2 OFFSET ?3",
                )?;
                let rows = stmt.query_map(
                    params![status.as_str(), limit, offset as i64],
                    Self::row_to_record,
                )?;
                for row in rows {
                    records.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM runs ORDER BY started_at DESC LIMIT ?1 OFFSET ?2",
                )?;
                let rows = stmt.query_map(params![limit, offset as i64], Self::row_to_record)?;
                for row in rows {
                    records.push(row?);
                }
            }
        }
        Ok(records)
    }

    fn get_events(
        &self,
        run_id: &str,
        event_type: Option<EventType>,
    ) -> Result<Vec<Event>, StorageError> {
        let conn = self.conn()?;
        let mut events = Vec::new();
        match event_type {
            Some(event_type) => {
                let mut stmt = conn.prepare(
                    "SELECT raw FROM events WHERE run_id = ?1 AND event_type = ?2 ORDER BY seq",
                )?;
                let rows = stmt.query_map(params![run_id, event_type.as_str()], |row| {
                    row.get::<_, String>(0)
                })?;
                for row in rows {
                    if let Some(event) = Event::from_wire(&row?) {
                        events.push(event);
                    }
                }
            }
            None => {
                let mut stmt =
                    conn.prepare("SELECT raw FROM events WHERE run_id = ?1 ORDER BY seq")?;
                let rows = stmt.query_map(params![run_id], |row| row.get::<_, String>(0))?;
                for row in rows {
                    if let Some(event) = Event::from_wire(&row?) {
                        events.push(event);
                    }
                }
            }
        }
        Ok(events)
    }

    fn delete_run(&self, run_id: &str) -> Result<bool, StorageError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM events WHERE run_id = ?1", params![run_id])?;
        let deleted = tx.execute("DELETE FROM runs WHERE run_id = ?1", params![run_id])?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    fn find_runs_by_prefix(
        &self,
        prefix: &str,
        limit: Option<usize>,
    ) -> Result<Vec<RunRecord>, StorageError> {
        if !valid_prefix(prefix) {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM runs WHERE run_id LIKE ?1 ORDER BY started_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            params![format!("{prefix}%"), limit.map(|l| l as i64).unwrap_or(-1)],
            Self::row_to_record,
        )?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    fn make_run(run_id: &str, status: TerminalStatus) -> RunRecord {
        RunRecord {
            run_id: run_id.to_string(),
            pipeline: "test".to_string(),
            status,
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            error_message: None,
            error_step: None,
            run_meta: None,
        }
    }

    fn make_events() -> Vec<String> {
        vec![
            Event::new(EventType::Start, "p", Value::Null).to_wire(),
            Event::new(EventType::StepStart, "step_a", Value::Null).to_wire(),
            Event::new(EventType::StepEnd, "step_a", json!(1)).to_wire(),
            Event::new(EventType::Finish, "p", Value::Null).to_wire(),
        ]
    }

    fn backend(dir: &TempDir) -> SqliteBackend {
        SqliteBackend::new(dir.path().join("runs.db")).unwrap()
    }

    #[test]
    fn test_save_and_get_run() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        backend
            .save_run(&make_run("run1", TerminalStatus::Success), &make_events())
            .unwrap();
        let run = backend.get_run("run1").unwrap().expect("run saved");
        assert_eq!(run.run_id, "run1");
        assert_eq!(run.status, TerminalStatus::Success);
        assert!(backend.get_run("missing").unwrap().is_none());
    }

    #[test]
    fn test_run_with_error_fields() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        let mut run = make_run("err1", TerminalStatus::Failed);
        run.error_message = Some("step exploded".to_string());
        run.error_step = Some("step_a".to_string());
        backend.save_run(&run, &make_events()).unwrap();

        let loaded = backend.get_run("err1").unwrap().unwrap();
        assert_eq!(loaded.status, TerminalStatus::Failed);
        assert_eq!(loaded.error_message.as_deref(), Some("step exploded"));
        assert_eq!(loaded.error_step.as_deref(), Some("step_a"));
    }

    #[test]
    fn test_run_meta_stored() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        let mut run = make_run("meta1", TerminalStatus::Success);
        run.run_meta = Some(r#"{"run": {"data": {"key": "val"}}}"#.to_string());
        backend.save_run(&run, &[]).unwrap();
        let loaded = backend.get_run("meta1").unwrap().unwrap();
        assert_eq!(
            loaded.run_meta.as_deref(),
            Some(r#"{"run": {"data": {"key": "val"}}}"#)
        );
    }

    #[test]
    fn test_list_runs_with_status_filter_and_pagination() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        backend
            .save_run(&make_run("r1", TerminalStatus::Success), &[])
            .unwrap();
        backend
            .save_run(&make_run("r2", TerminalStatus::Failed), &[])
            .unwrap();
        assert_eq!(backend.list_runs(None, None, 0).unwrap().len(), 2);
        assert_eq!(
            backend
                .list_runs(Some(TerminalStatus::Failed), None, 0)
                .unwrap()
                .len(),
            1
        );

        for i in 3..8 {
            backend
                .save_run(&make_run(&format!("r{i}"), TerminalStatus::Success), &[])
                .unwrap();
        }
        assert_eq!(backend.list_runs(None, Some(2), 0).unwrap().len(), 2);
        assert_eq!(backend.list_runs(None, Some(2), 3).unwrap().len(), 2);
    }

    #[test]
    fn test_get_events_with_generated_column_filter() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        backend
            .save_run(&make_run("run1", TerminalStatus::Success), &make_events())
            .unwrap();

        let all = backend.get_events("run1", None).unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].event_type, EventType::Start);
        assert_eq!(all[1].stage, "step_a");

        let starts = backend
            .get_events("run1", Some(EventType::StepStart))
            .unwrap();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].stage, "step_a");
    }

    #[test]
    fn test_get_events_empty_and_nonexistent_run() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        backend
            .save_run(&make_run("empty-run", TerminalStatus::Success), &[])
            .unwrap();
        assert!(backend.get_events("empty-run", None).unwrap().is_empty());
        assert!(backend.get_events("does-not-exist", None).unwrap().is_empty());
    }

    #[test]
    fn test_delete_run() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        backend
            .save_run(&make_run("run1", TerminalStatus::Success), &make_events())
            .unwrap();
        assert!(backend.delete_run("run1").unwrap());
        assert!(backend.get_run("run1").unwrap().is_none());
        assert!(backend.get_events("run1", None).unwrap().is_empty());
        assert!(!backend.delete_run("run1").unwrap());
    }

    #[test]
    fn test_find_runs_by_prefix() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        backend
            .save_run(&make_run("run-abc-123", TerminalStatus::Success), &[])
            .unwrap();
        backend
            .save_run(&make_run("run-abc-456", TerminalStatus::Success), &[])
            .unwrap();
        backend
            .save_run(&make_run("run-xyz-789", TerminalStatus::Success), &[])
            .unwrap();

        let matches = backend.find_runs_by_prefix("run-abc", None).unwrap();
        assert_eq!(matches.len(), 2);
        assert!(matches.iter().all(|r| r.run_id.starts_with("run-abc")));
        assert!(backend.find_runs_by_prefix("zzz", None).unwrap().is_empty());
        assert_eq!(backend.find_runs_by_prefix("run-", Some(2)).unwrap().len(), 2);
    }

    #[test]
    fn test_find_runs_by_prefix_rejects_invalid_chars() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        backend
            .save_run(&make_run("run-abc", TerminalStatus::Success), &[])
            .unwrap();
        assert!(backend.find_runs_by_prefix("run%", None).unwrap().is_empty());
        assert!(backend
            .find_runs_by_prefix("run;DROP", None)
            .unwrap()
            .is_empty());
        assert!(backend.find_runs_by_prefix("", None).unwrap().is_empty());
    }

    #[test]
    fn test_atomic_save_rejects_invalid_event() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        let bad_events = vec!["not valid json".to_string()];
        let err = backend
            .save_run(&make_run("run1", TerminalStatus::Success), &bad_events)
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidEvent(_)));
        assert!(backend.get_run("run1").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_run_id_rejected() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        backend
            .save_run(&make_run("dup-1", TerminalStatus::Success), &[])
            .unwrap();
        let err = backend
            .save_run(&make_run("dup-1", TerminalStatus::Success), &[])
            .unwrap_err();
        assert!(matches!(err, StorageError::DuplicateRun(_)));
    }

    #[test]
    fn test_corrupt_db_fails_on_init() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("runs.db");
        std::fs::write(&db_path, b"this is not a sqlite database").unwrap();
        assert!(SqliteBackend::new(&db_path).is_err());
    }

    #[test]
    fn test_separate_instances_share_data() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("runs.db");
        let first = SqliteBackend::new(&db_path).unwrap();
        first
            .save_run(&make_run("shared", TerminalStatus::Success), &make_events())
            .unwrap();

        let second = SqliteBackend::new(&db_path).unwrap();
        let loaded = second.get_run("shared").unwrap().unwrap();
        assert_eq!(loaded.run_id, "shared");
    }
}
