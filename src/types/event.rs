//! Lifecycle event types emitted during a pipeline run.
//!
//! Every run produces a stream of `Event` values: exactly one START and one
//! FINISH bracketing the run, a STEP_START/STEP_END (or STEP_ERROR) pair per
//! step invocation, TOKEN events for items streamed out of streaming steps,
//! and PIPELINE_ERROR for run-level faults. The serialized form of `Event`
//! is the wire contract used by the storage backends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The kind of a lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// First event of every run.
    Start,
    /// Last event of every run.
    Finish,
    /// A step invocation began.
    StepStart,
    /// A step invocation completed (possibly recovered by an error handler).
    StepEnd,
    /// A step invocation failed and was not recovered.
    StepError,
    /// An item streamed out of a streaming step.
    Token,
    /// A run-level fault: failed startup hook, validation failure, bad entry.
    PipelineError,
}

impl EventType {
    /// Wire name of the event type (`"STEP_START"`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Start => "START",
            EventType::Finish => "FINISH",
            EventType::StepStart => "STEP_START",
            EventType::StepEnd => "STEP_END",
            EventType::StepError => "STEP_ERROR",
            EventType::Token => "TOKEN",
            EventType::PipelineError => "PIPELINE_ERROR",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single lifecycle event.
///
/// `stage` is the step name for step-scoped events and the pipeline name for
/// START/FINISH/PIPELINE_ERROR. Sub-pipeline events are forwarded with their
/// stage re-stamped as `"{owner}/{stage}"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event kind.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Stage (step or pipeline) name the event belongs to.
    pub stage: String,
    /// Event payload: step result, token item, or error message.
    #[serde(default)]
    pub payload: Value,
    /// Step meta snapshot, attached to STEP_END/STEP_ERROR.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    /// Emission timestamp.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Create an event stamped with the current time.
    pub fn new(event_type: EventType, stage: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type,
            stage: stage.into(),
            payload,
            meta: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach a step meta snapshot.
    pub fn with_meta(mut self, meta: Option<Value>) -> Self {
        self.meta = meta;
        self
    }

    /// Serialize to the wire format used by storage backends.
    pub fn to_wire(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Parse an event from its wire form.
    ///
    /// Returns `None` for malformed records or records whose `type` field is
    /// missing or unrecognized: replay skips such records, it never fails.
    pub fn from_wire(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}
