//! In-memory run history, mainly for tests and short-lived processes.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::{RunRecord, StorageBackend, StorageError, TerminalStatus};
use crate::types::{Event, EventType};

#[derive(Debug, Default)]
struct MemoryInner {
    /// Runs in insertion order.
    runs: Vec<RunRecord>,
    /// Wire-form events keyed by run id.
    events: HashMap<String, Vec<String>>,
}

/// Process-local [`StorageBackend`].
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    inner: Mutex<MemoryInner>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for InMemoryBackend {
    fn save_run(&self, run: &RunRecord, events: &[String]) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        if inner.runs.iter().any(|r| r.run_id == run.run_id) {
            return Err(StorageError::DuplicateRun(run.run_id.clone()));
        }
        inner.runs.push(run.clone());
        inner.events.insert(run.run_id.clone(), events.to_vec());
        Ok(())
    }

    fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, StorageError> {
        let inner = self.inner.lock();
        Ok(inner.runs.iter().find(|r| r.run_id == run_id).cloned())
    }

    fn list_runs(
        &self,
        status: Option<TerminalStatus>,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<RunRecord>, StorageError> {
        let inner = self.inner.lock();
        let filtered = inner
            .runs
            .iter()
            .rev()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .skip(offset);
        Ok(match limit {
            Some(limit) => filtered.take(limit).cloned().collect(),
            None => filtered.cloned().collect(),
        })
    }

    fn get_events(
        &self,
        run_id: &str,
        event_type: Option<EventType>,
    ) -> Result<Vec<Event>, StorageError> {
        let inner = self.inner.lock();
        let Some(raw_events) = inner.events.get(run_id) else {
            return Ok(Vec::new());
        };
        Ok(raw_events
            .iter()
            .filter_map(|raw| Event::from_wire(raw))
            .filter(|e| event_type.map_or(true, |t| e.event_type == t))
            .collect())
    }

    fn delete_run(&self, run_id: &str) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock();
        let before = inner.runs.len();
        inner.runs.retain(|r| r.run_id != run_id);
        inner.events.remove(run_id);
        Ok(inner.runs.len() < before)
    }

    fn find_runs_by_prefix(
        &self,
        prefix: &str,
        limit: Option<usize>,
    ) -> Result<Vec<RunRecord>, StorageError> {
        if prefix.is_empty() {
            return Ok(Vec::new());
        }
        let inner = self.inner.lock();
        let matching = inner
            .runs
            .iter()
            .rev()
            .filter(|r| r.run_id.starts_with(prefix));
        Ok(match limit {
            Some(limit) => matching.take(limit).cloned().collect(),
            None => matching.cloned().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_run(run_id: &str, status: TerminalStatus) -> RunRecord {
        RunRecord {
            run_id: run_id.to_string(),
            pipeline: "test".to_string(),
            status,
            started_at: chrono::Utc::now(),
            finished_at: None,
            error_message: None,
            error_step: None,
            run_meta: None,
        }
    }

    #[test]
    fn test_get_events_skips_invalid_event_type() {
        let backend = InMemoryBackend::new();
        let events = vec![
            json!({"type": "STEP_START", "stage": "a", "timestamp": "2026-01-01T00:00:00Z"})
                .to_string(),
            json!({"type": "", "stage": "bad", "timestamp": "2026-01-01T00:00:01Z"}).to_string(),
            json!({"stage": "missing_type", "timestamp": "2026-01-01T00:00:02Z"}).to_string(),
            json!({"type": "STEP_END", "stage": "a", "timestamp": "2026-01-01T00:00:03Z"})
                .to_string(),
        ];
        backend
            .save_run(&make_run("r1", TerminalStatus::Success), &events)
            .unwrap();

        let result = backend.get_events("r1", None).unwrap();
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_get_events_filtered_with_invalid_types() {
        let backend = InMemoryBackend::new();
        let events = vec![
            json!({"type": "STEP_START", "stage": "a", "timestamp": "2026-01-01T00:00:00Z"})
                .to_string(),
            json!({"type": "bogus", "stage": "bad", "timestamp": "2026-01-01T00:00:01Z"})
                .to_string(),
            json!({"type": "STEP_END", "stage": "a", "timestamp": "2026-01-01T00:00:02Z"})
                .to_string(),
        ];
        backend
            .save_run(&make_run("r1", TerminalStatus::Success), &events)
            .unwrap();

        let result = backend
            .get_events("r1", Some(EventType::StepEnd))
            .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].stage, "a");
    }

    #[test]
    fn test_duplicate_run_rejected() {
        let backend = InMemoryBackend::new();
        backend
            .save_run(&make_run("dup", TerminalStatus::Success), &[])
            .unwrap();
        let err = backend
            .save_run(&make_run("dup", TerminalStatus::Success), &[])
            .unwrap_err();
        assert!(matches!(err, StorageError::DuplicateRun(_)));
    }

    #[test]
    fn test_save_get_and_delete() {
        let backend = InMemoryBackend::new();
        backend
            .save_run(&make_run("run1", TerminalStatus::Success), &[])
            .unwrap();
        assert_eq!(
            backend.get_run("run1").unwrap().unwrap().run_id,
            "run1"
        );
        assert!(backend.get_run("missing").unwrap().is_none());
        assert!(backend.delete_run("run1").unwrap());
        assert!(backend.get_run("run1").unwrap().is_none());
        assert!(!backend.delete_run("run1").unwrap());
    }

    #[test]
    fn test_list_runs_filter_and_pagination() {
        let backend = InMemoryBackend::new();
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
        // Most recent first.
        assert_eq!(backend.list_runs(None, Some(1), 0).unwrap()[0].run_id, "r7");
    }

    #[test]
    fn test_find_runs_by_prefix() {
        let backend = InMemoryBackend::new();
        for run_id in ["run-abc-123", "run-abc-456", "run-xyz-789"] {
            backend
                .save_run(&make_run(run_id, TerminalStatus::Success), &[])
                .unwrap();
        }
        let matches = backend.find_runs_by_prefix("run-abc", None).unwrap();
        assert_eq!(matches.len(), 2);
        assert!(matches.iter().all(|r| r.run_id.starts_with("run-abc")));
        assert!(backend.find_runs_by_prefix("zzz", None).unwrap().is_empty());
        assert!(backend.find_runs_by_prefix("", None).unwrap().is_empty());
        assert_eq!(
            backend.find_runs_by_prefix("run-", Some(2)).unwrap().len(),
            2
        );
    }
}
