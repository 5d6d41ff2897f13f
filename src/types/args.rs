//! Materialized call arguments handed to step callables.
//!
//! At call time the invoker turns a step's injection table into a keyword
//! map: each declared parameter name is bound to its resolved source
//! (state handle, context handle, triggering error, step name, or a payload
//! item for map companions). `StepArgs` wraps that map with typed accessors.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

/// Shared handle to the run's state, passed by reference to every step.
pub type SharedState<S> = Arc<RwLock<S>>;

/// Per-invocation payload: the keyword items a map owner attached to each
/// child invocation.
pub type Payload = HashMap<String, Value>;

/// A single resolved argument.
pub enum Injected<S, C> {
    /// The run's shared state handle.
    State(SharedState<S>),
    /// The run's context handle, if one was provided.
    Context(Option<Arc<C>>),
    /// The error being handled (error handlers only).
    Error(Option<Arc<anyhow::Error>>),
    /// The name of the step being invoked.
    StepName(String),
    /// A payload item (the per-item slot of a map companion).
    Item(Value),
}

impl<S, C> Clone for Injected<S, C> {
    fn clone(&self) -> Self {
        match self {
            Injected::State(s) => Injected::State(s.clone()),
            Injected::Context(c) => Injected::Context(c.clone()),
            Injected::Error(e) => Injected::Error(e.clone()),
            Injected::StepName(n) => Injected::StepName(n.clone()),
            Injected::Item(v) => Injected::Item(v.clone()),
        }
    }
}

/// The keyword-argument map materialized for one step invocation.
pub struct StepArgs<S, C> {
    kwargs: HashMap<String, Injected<S, C>>,
}

impl<S, C> Clone for StepArgs<S, C> {
    fn clone(&self) -> Self {
        Self {
            kwargs: self.kwargs.clone(),
        }
    }
}

impl<S, C> StepArgs<S, C> {
    pub(crate) fn new(kwargs: HashMap<String, Injected<S, C>>) -> Self {
        Self { kwargs }
    }

    /// The shared state handle, if the step declared a state parameter.
    pub fn state(&self) -> Option<SharedState<S>> {
        self.kwargs.values().find_map(|v| match v {
            Injected::State(s) => Some(s.clone()),
            _ => None,
        })
    }

    /// The context handle, if the step declared a context parameter and the
    /// run was given a context.
    pub fn context(&self) -> Option<Arc<C>> {
        self.kwargs.values().find_map(|v| match v {
            Injected::Context(c) => c.clone(),
            _ => None,
        })
    }

    /// The error being handled. Only bound inside error handlers.
    pub fn error(&self) -> Option<Arc<anyhow::Error>> {
        self.kwargs.values().find_map(|v| match v {
            Injected::Error(e) => e.clone(),
            _ => None,
        })
    }

    /// The name of the step being invoked, if declared.
    pub fn step_name(&self) -> Option<&str> {
        self.kwargs.values().find_map(|v| match v {
            Injected::StepName(n) => Some(n.as_str()),
            _ => None,
        })
    }

    /// A payload item by parameter name.
    pub fn item(&self, name: &str) -> Option<&Value> {
        match self.kwargs.get(name) {
            Some(Injected::Item(v)) => Some(v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_accessors() {
        let state: SharedState<i64> = Arc::new(RwLock::new(7));
        let mut kwargs: HashMap<String, Injected<i64, ()>> = HashMap::new();
        kwargs.insert("s".to_string(), Injected::State(state.clone()));
        kwargs.insert("ctx".to_string(), Injected::Context(None));
        kwargs.insert(
            "step_name".to_string(),
            Injected::StepName("load".to_string()),
        );
        kwargs.insert("row".to_string(), Injected::Item(json!(42)));

        let args = StepArgs::new(kwargs);
        assert_eq!(*args.state().expect("state").read(), 7);
        assert!(args.context().is_none());
        assert!(args.error().is_none());
        assert_eq!(args.step_name(), Some("load"));
        assert_eq!(args.item("row"), Some(&json!(42)));
        assert_eq!(args.item("missing"), None);
    }
}
