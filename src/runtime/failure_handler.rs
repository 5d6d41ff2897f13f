//! The failure chain: per-step handler, then global handler, then default.
//!
//! A handler that returns normally recovers the step; its return becomes the
//! STEP_END payload. A per-step handler that raises hands its new error to
//! the global handler, if one is configured; if that also raises (or none
//! exists) the original exception propagates as STEP_ERROR. There is no
//! third level. Absent any handler, the default path logs the failure with
//! timestamp, truncated state and the error chain, and propagates.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::pipe::Registry;
use crate::runtime::invoker::StepInvoker;
use crate::types::SharedState;

/// Outcome of running the failure chain for one invocation.
pub(crate) enum Recovery {
    /// A handler returned normally; the value is the STEP_END payload.
    Recovered(Value),
    /// No handler recovered; the original failure propagates.
    Unrecovered(Arc<anyhow::Error>),
}

pub(crate) struct FailureHandler<S, C> {
    reg: Arc<Registry<S, C>>,
    invoker: Arc<StepInvoker<S, C>>,
}

impl<S, C> FailureHandler<S, C>
where
    S: Send + Sync + fmt::Debug + 'static,
    C: Send + Sync + 'static,
{
    pub fn new(reg: Arc<Registry<S, C>>, invoker: Arc<StepInvoker<S, C>>) -> Self {
        Self { reg, invoker }
    }

    /// Run the failure chain for a failed step.
    pub async fn handle(
        &self,
        name: &str,
        error: anyhow::Error,
        state: &SharedState<S>,
        context: &Option<Arc<C>>,
    ) -> Recovery {
        let error = Arc::new(error);
        let step_handler = self
            .reg
            .settings
            .get(name)
            .and_then(|s| s.on_error.clone());

        if let Some(handler) = step_handler {
            let args = self.invoker.build_args(
                &format!("{name}:on_error"),
                None,
                state,
                context,
                Some(error.clone()),
                Some(name),
            );
            match handler(args).await {
                Ok(value) => return Recovery::Recovered(value),
                Err(handler_error) => {
                    if let Some(global) = self.reg.on_error.clone() {
                        let args = self.invoker.build_args(
                            "system:on_error",
                            None,
                            state,
                            context,
                            Some(Arc::new(handler_error)),
                            Some(name),
                        );
                        if let Ok(value) = global(args).await {
                            return Recovery::Recovered(value);
                        }
                    }
                    self.log_default(name, &error, state);
                    return Recovery::Unrecovered(error);
                }
            }
        }

        if let Some(global) = self.reg.on_error.clone() {
            let args = self.invoker.build_args(
                "system:on_error",
                None,
                state,
                context,
                Some(error.clone()),
                Some(name),
            );
            match global(args).await {
                Ok(value) => return Recovery::Recovered(value),
                Err(_) => {
                    self.log_default(name, &error, state);
                    return Recovery::Unrecovered(error);
                }
            }
        }

        self.log_default(name, &error, state);
        Recovery::Unrecovered(error)
    }

    /// Default path: structured error log with truncated state.
    fn log_default(&self, name: &str, error: &anyhow::Error, state: &SharedState<S>) {
        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S");
        let state_str: String = {
            let guard = state.read();
            format!("{:?}", &*guard).chars().take(1000).collect()
        };
        log::error!(
            "[{timestamp}] Step '{name}' failed: {error:?}\nState: {state_str}"
        );
    }
}
