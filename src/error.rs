//! Error types for the pipeline runtime.
//!
//! `PipeError` covers everything the framework itself can raise:
//! registration/graph validation problems, unresolvable step references,
//! per-step timeouts and the run-time routing failures of switch and map
//! wrappers. User step bodies report their own failures through
//! `anyhow::Error`; the runtime downcasts to `PipeError` where it needs to
//! distinguish framework faults from user ones.

use thiserror::Error;

use crate::failures::FailureReason;

/// Errors raised by the pipeline framework.
#[derive(Debug, Error)]
pub enum PipeError {
    /// Registration-time or graph-time integrity problem. Never raised
    /// during a run except through `validate_on_run`.
    #[error("{message}")]
    Validation { message: String },

    /// A step name was referenced that is not registered.
    #[error("Step not found: {name}")]
    StepNotFound { name: String },

    /// A step exceeded its configured deadline.
    #[error("Step '{step}' timed out after {seconds}s")]
    Timeout { step: String, seconds: f64 },

    /// A switch returned a value with no matching route and no default.
    #[error("Step '{step}' (switch) returned {value}, which matches no route and no default was provided")]
    NoRoute { step: String, value: String },

    /// A map owner returned something that is not an array of items.
    #[error("Step '{step}' (map) must return an array of items, got {got}")]
    MapOutput { step: String, got: String },
}

impl PipeError {
    /// Shorthand for a validation failure with a formatted message.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// The failure reason this error is recorded under in the execution log.
    pub fn reason(&self) -> FailureReason {
        match self {
            PipeError::Validation { .. } => FailureReason::ValidationError,
            PipeError::StepNotFound { .. } => FailureReason::StepNotFound,
            PipeError::Timeout { .. } => FailureReason::Timeout,
            PipeError::NoRoute { .. } | PipeError::MapOutput { .. } => FailureReason::StepError,
        }
    }
}
