//! Helpers for asserting on pipeline runs in tests.

use futures::StreamExt;
use serde_json::Value;

use crate::failures::ExecutionLog;
use crate::runtime::bus::EventStream;
use crate::types::{Event, EventType, SharedState};

/// A fully collected run: event sequence, final state handle, failure log.
pub struct TestResult<S> {
    pub events: Vec<Event>,
    pub state: SharedState<S>,
    pub log: ExecutionLog,
}

impl<S> TestResult<S> {
    /// Drain a run's event stream to completion.
    pub async fn collect(mut stream: EventStream<S>) -> Self {
        let state = stream.state();
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        let log = stream.execution_log();
        Self { events, state, log }
    }

    /// Events of one type, in emission order.
    pub fn filter(&self, event_type: EventType) -> Vec<&Event> {
        self.events
            .iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    /// Stage names of all STEP_START events, in order.
    pub fn step_starts(&self) -> Vec<String> {
        self.filter(EventType::StepStart)
            .into_iter()
            .map(|e| e.stage.clone())
            .collect()
    }

    /// Payloads of all TOKEN events, in order.
    pub fn tokens(&self) -> Vec<Value> {
        self.filter(EventType::Token)
            .into_iter()
            .map(|e| e.payload.clone())
            .collect()
    }

    /// The FINISH event. Panics unless exactly one was emitted.
    pub fn finish(&self) -> &Event {
        let finishes = self.filter(EventType::Finish);
        assert_eq!(
            finishes.len(),
            1,
            "expected exactly 1 FINISH, got {}",
            finishes.len()
        );
        finishes[0]
    }

    /// All STEP_ERROR and PIPELINE_ERROR events, in order.
    pub fn errors(&self) -> Vec<&Event> {
        self.events
            .iter()
            .filter(|e| {
                matches!(
                    e.event_type,
                    EventType::StepError | EventType::PipelineError
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::RwLock;
    use serde_json::json;
    use std::sync::Arc;

    fn ev(event_type: EventType, stage: &str, payload: Value) -> Event {
        Event::new(event_type, stage, payload)
    }

    fn result_of(events: Vec<Event>) -> TestResult<()> {
        TestResult {
            events,
            state: Arc::new(RwLock::new(())),
            log: ExecutionLog::default(),
        }
    }

    #[test]
    fn test_filter_returns_matching_events() {
        let result = result_of(vec![
            ev(EventType::StepStart, "a", Value::Null),
            ev(EventType::StepEnd, "a", json!({"x": 1})),
            ev(EventType::StepStart, "b", Value::Null),
        ]);

        let filtered = result.filter(EventType::StepStart);

        assert_eq!(filtered.len(), 2);
        assert!(filtered.iter().all(|e| e.event_type == EventType::StepStart));
        assert_eq!(
            filtered.iter().map(|e| e.stage.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
    }

    #[test]
    fn test_filter_returns_empty_when_no_matches() {
        let result = result_of(vec![
            ev(EventType::StepStart, "a", Value::Null),
            ev(EventType::StepEnd, "a", Value::Null),
        ]);
        assert!(result.filter(EventType::Token).is_empty());
    }

    #[test]
    fn test_step_starts_returns_stage_names() {
        let result = result_of(vec![
            ev(EventType::Start, "pipeline", Value::Null),
            ev(EventType::StepStart, "load", Value::Null),
            ev(EventType::StepEnd, "load", Value::Null),
            ev(EventType::StepStart, "transform", Value::Null),
            ev(EventType::StepEnd, "transform", Value::Null),
            ev(EventType::Finish, "pipeline", Value::Null),
        ]);
        assert_eq!(result.step_starts(), vec!["load", "transform"]);
    }

    #[test]
    fn test_tokens_returns_payloads() {
        let result = result_of(vec![
            ev(EventType::StepStart, "stream", Value::Null),
            ev(EventType::Token, "stream", json!("chunk1")),
            ev(EventType::Token, "stream", json!("chunk2")),
            ev(EventType::Token, "stream", json!("chunk3")),
            ev(EventType::StepEnd, "stream", Value::Null),
        ]);
        assert_eq!(
            result.tokens(),
            vec![json!("chunk1"), json!("chunk2"), json!("chunk3")]
        );
    }

    #[test]
    fn test_finish_returns_single_finish_event() {
        let result = result_of(vec![
            ev(EventType::Start, "pipeline", Value::Null),
            ev(EventType::Finish, "pipeline", Value::Null),
        ]);
        assert_eq!(result.finish().event_type, EventType::Finish);
    }

    #[test]
    fn test_errors_includes_both_error_kinds() {
        let result = result_of(vec![
            ev(EventType::StepError, "a", json!("boom")),
            ev(EventType::PipelineError, "pipeline", json!("bad hook")),
            ev(EventType::StepEnd, "b", Value::Null),
        ]);
        assert_eq!(result.errors().len(), 2);
    }
}
