//! # justpipe
//!
//! A declarative, event-emitting pipeline runtime for DAG-shaped workflows
//! of user-supplied async steps.
//!
//! Register named steps (plain units of work, fan-out maps, conditional
//! switches, nested sub-pipelines, token-streaming steps), declare static
//! successor edges, then run the pipeline against a seed state and consume
//! the resulting lifecycle events as a lazy stream:
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use justpipe::{Pipe, StepConfig, StepOutcome};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let mut pipe: Pipe<Vec<String>, ()> = Pipe::new("etl");
//! pipe.step(StepConfig::new("extract").to("transform"), |_args| async {
//!     Ok(StepOutcome::none())
//! })?;
//! pipe.step(StepConfig::new("transform"), |_args| async {
//!     Ok(StepOutcome::none())
//! })?;
//!
//! let mut events = pipe.run(Vec::new());
//! while let Some(event) = events.next().await {
//!     println!("{:?} {}", event.event_type, event.stage);
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod failures;
pub mod graph;
pub mod middleware;
pub mod pipe;
pub mod runtime;
pub mod signature;
pub mod storage;
pub mod testing;
pub mod types;
pub mod visualization;

pub use error::PipeError;
pub use failures::{
    ExecutionLog, FailureClassificationConfig, FailureClassificationContext, FailureJournal,
    FailureKind, FailureReason, FailureRecord, FailureSource, OriginatedError,
};
pub use middleware::{Middleware, RetryMiddleware};
pub use pipe::{Pipe, StepConfig};
pub use runtime::meta;
pub use runtime::EventStream;
pub use signature::{Param, ParamSource, Signature};
pub use types::{
    Event, EventType, RetryConfig, RetryPolicy, RouteTarget, Routes, SharedState, StepArgs,
    StepInfo, StepKind, StepOutcome, StreamYield,
};
