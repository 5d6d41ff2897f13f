//! Step invocation: injection materialization, timeouts, token pumping.
//!
//! `execute` looks the step up, builds its keyword-argument map from the
//! invocation payload and the step's injection table, then drives the
//! callable under the step's deadline. Streaming callables are pumped here:
//! token items go out on the bus as TOKEN events, the last routing item
//! yielded becomes the invocation's routing decision.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;

use crate::error::PipeError;
use crate::middleware::StepCallable;
use crate::pipe::Registry;
use crate::runtime::bus::{BusMsg, Tx};
use crate::signature::ParamSource;
use crate::types::{
    Event, EventType, Injected, Payload, SharedState, StepArgs, StepOutcome, StreamYield,
};

pub(crate) struct StepInvoker<S, C> {
    reg: Arc<Registry<S, C>>,
}

impl<S, C> StepInvoker<S, C>
where
    S: Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    pub fn new(reg: Arc<Registry<S, C>>) -> Self {
        Self { reg }
    }

    /// Execute a single step invocation and return its routing decision.
    pub async fn execute(
        &self,
        name: &str,
        state: &SharedState<S>,
        context: &Option<Arc<C>>,
        payload: Option<&Payload>,
        bus: &Tx<BusMsg<S, C>>,
    ) -> anyhow::Result<StepOutcome<S, C>> {
        let func = self
            .reg
            .steps
            .get(name)
            .cloned()
            .ok_or_else(|| PipeError::StepNotFound {
                name: name.to_string(),
            })?;

        let timeout = self.reg.settings.get(name).and_then(|s| s.timeout);
        let args = self.build_args(name, payload, state, context, None, Some(name));

        let invocation = self.drive(name, func, args, bus);
        match timeout {
            Some(seconds) => match tokio::time::timeout(
                Duration::from_secs_f64(seconds),
                invocation,
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(PipeError::Timeout {
                    step: name.to_string(),
                    seconds,
                }
                .into()),
            },
            None => invocation.await,
        }
    }

    async fn drive(
        &self,
        name: &str,
        func: StepCallable<S, C>,
        args: StepArgs<S, C>,
        bus: &Tx<BusMsg<S, C>>,
    ) -> anyhow::Result<StepOutcome<S, C>> {
        match func {
            StepCallable::Unary(f) => f(args).await,
            StepCallable::Streaming(f) => {
                let mut stream = f(args);
                let mut last_route: Option<StepOutcome<S, C>> = None;
                while let Some(item) = stream.next().await {
                    match item? {
                        StreamYield::Route(outcome) => last_route = Some(outcome),
                        StreamYield::Token(value) => {
                            let event = Event::new(EventType::Token, name, value);
                            if bus.send(BusMsg::Event(event)).await.is_err() {
                                // Consumer is gone; the run is being torn down.
                                return Ok(StepOutcome::Suspend);
                            }
                        }
                    }
                }
                Ok(last_route.unwrap_or_else(StepOutcome::none))
            }
        }
    }

    /// Materialize the keyword map for a step or handler invocation.
    ///
    /// Starts from the payload items, then overlays the injected sources the
    /// callable declared. Unknown parameters are filled only by the payload.
    pub fn build_args(
        &self,
        meta_key: &str,
        payload: Option<&Payload>,
        state: &SharedState<S>,
        context: &Option<Arc<C>>,
        error: Option<Arc<anyhow::Error>>,
        step_name: Option<&str>,
    ) -> StepArgs<S, C> {
        let mut kwargs: HashMap<String, Injected<S, C>> = payload
            .map(|p| {
                p.iter()
                    .map(|(k, v)| (k.clone(), Injected::Item(v.clone())))
                    .collect()
            })
            .unwrap_or_default();

        if let Some(injection) = self.reg.injection.get(meta_key) {
            for (param, source) in injection {
                match source {
                    ParamSource::State => {
                        kwargs.insert(param.clone(), Injected::State(state.clone()));
                    }
                    ParamSource::Context => {
                        kwargs.insert(param.clone(), Injected::Context(context.clone()));
                    }
                    ParamSource::Error => {
                        kwargs.insert(param.clone(), Injected::Error(error.clone()));
                    }
                    ParamSource::StepName => {
                        kwargs.insert(
                            param.clone(),
                            Injected::StepName(step_name.unwrap_or(meta_key).to_string()),
                        );
                    }
                    ParamSource::Unknown => {}
                }
            }
        }
        StepArgs::new(kwargs)
    }
}

/// The payload key of a map companion: its single unknown parameter.
pub(crate) fn map_payload_key<S, C>(reg: &Registry<S, C>, target: &str) -> Option<String> {
    reg.injection
        .get(target)
        .and_then(|inj| crate::signature::first_unknown(inj))
        .map(str::to_string)
}

/// Build the per-item payload for one map child.
pub(crate) fn map_item_payload(key: Option<&str>, item: Value) -> Payload {
    let mut payload = Payload::new();
    if let Some(key) = key {
        payload.insert(key.to_string(), item);
    }
    payload
}
