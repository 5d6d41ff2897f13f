//! Core type definitions: events, routing values, step metadata, call args.

pub mod args;
pub mod event;
pub mod routing;
pub mod step;

pub use args::{Injected, Payload, SharedState, StepArgs};
pub use event::{Event, EventType};
pub use routing::{RouteTarget, Routes, StepOutcome, StreamYield};
pub use step::{RetryConfig, RetryPolicy, StepContext, StepInfo, StepKind};
