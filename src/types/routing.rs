//! Routing values returned by steps to direct control flow.
//!
//! A step's return is normalized into a `StepOutcome`. Plain values follow
//! the static topology; the other variants override it: `Next` jumps to a
//! specific successor, `Map` fans out one invocation per item, `Run` drives
//! a nested pipeline to completion, `Suspend` yields without advancing and
//! `Stop` ends the run cleanly. No other return shapes are accepted.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::pipe::Pipe;

/// Routing decision produced by one step invocation.
pub enum StepOutcome<S, C> {
    /// A plain value: follow the static topology edges. `Value(Null)` is the
    /// "returned nothing" case.
    Value(Value),
    /// Override the static edges and go to one specific successor.
    Next(String),
    /// Fan out one invocation of `target` per item. The returning step owns
    /// the batch and is not complete until every child has finished.
    Map { items: Vec<Value>, target: String },
    /// Execute a nested pipeline to completion with the given seed state.
    Run { pipe: Arc<Pipe<S, C>>, state: S },
    /// Yield control without advancing; the invocation still counts as
    /// complete.
    Suspend,
    /// Terminate the whole run cleanly.
    Stop,
}

impl<S, C> StepOutcome<S, C> {
    /// The "returned nothing" outcome: follow the static topology.
    pub fn none() -> Self {
        StepOutcome::Value(Value::Null)
    }

    /// A plain value outcome.
    pub fn value(value: impl Into<Value>) -> Self {
        StepOutcome::Value(value.into())
    }

    /// Jump to a specific successor.
    pub fn next(target: impl Into<String>) -> Self {
        StepOutcome::Next(target.into())
    }
}

impl<S, C> fmt::Debug for StepOutcome<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutcome::Value(v) => f.debug_tuple("Value").field(v).finish(),
            StepOutcome::Next(t) => f.debug_tuple("Next").field(t).finish(),
            StepOutcome::Map { items, target } => f
                .debug_struct("Map")
                .field("items", &items.len())
                .field("target", target)
                .finish(),
            StepOutcome::Run { pipe, .. } => {
                f.debug_struct("Run").field("pipe", &pipe.name()).finish()
            }
            StepOutcome::Suspend => f.write_str("Suspend"),
            StepOutcome::Stop => f.write_str("Stop"),
        }
    }
}

/// One item yielded by a streaming step.
///
/// Non-routing items become TOKEN events; the last routing item yielded is
/// the step's routing decision.
pub enum StreamYield<S, C> {
    /// Emit this item as a TOKEN event.
    Token(Value),
    /// Remember this as the routing decision; not emitted.
    Route(StepOutcome<S, C>),
}

impl<S, C> fmt::Debug for StreamYield<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamYield::Token(v) => f.debug_tuple("Token").field(v).finish(),
            StreamYield::Route(o) => f.debug_tuple("Route").field(o).finish(),
        }
    }
}

/// Where a switch route leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    /// Continue with the named step.
    Step(String),
    /// Terminate the run cleanly.
    Stop,
}

impl RouteTarget {
    /// Shorthand for a step target.
    pub fn step(name: impl Into<String>) -> Self {
        RouteTarget::Step(name.into())
    }
}

/// Route table of a switch step: either a static key → target table or a
/// dynamic callable applied to the step's raw return.
#[derive(Clone)]
pub enum Routes {
    /// Static table matched against the step's return by value equality.
    Table(Vec<(Value, RouteTarget)>),
    /// Dynamic router; `None` falls through to the declared default.
    Dynamic(Arc<dyn Fn(&Value) -> Option<RouteTarget> + Send + Sync>),
}

impl Routes {
    /// Build a static route table.
    pub fn table<K: Into<Value>>(routes: impl IntoIterator<Item = (K, RouteTarget)>) -> Self {
        Routes::Table(routes.into_iter().map(|(k, t)| (k.into(), t)).collect())
    }

    /// Build a dynamic router from a callable.
    pub fn dynamic(f: impl Fn(&Value) -> Option<RouteTarget> + Send + Sync + 'static) -> Self {
        Routes::Dynamic(Arc::new(f))
    }

    /// Resolve a step return against the table, without applying defaults.
    pub(crate) fn resolve(&self, key: &Value) -> Option<RouteTarget> {
        match self {
            Routes::Table(table) => table.iter().find(|(k, _)| k == key).map(|(_, t)| t.clone()),
            Routes::Dynamic(f) => f(key),
        }
    }

    /// Step names reachable through this table (static tables only).
    pub(crate) fn static_targets(&self) -> Vec<String> {
        match self {
            Routes::Table(table) => table
                .iter()
                .filter_map(|(_, t)| match t {
                    RouteTarget::Step(name) => Some(name.clone()),
                    RouteTarget::Stop => None,
                })
                .collect(),
            Routes::Dynamic(_) => Vec::new(),
        }
    }
}

impl fmt::Debug for Routes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Routes::Table(table) => f.debug_tuple("Table").field(&table.len()).finish(),
            Routes::Dynamic(_) => f.write_str("Dynamic"),
        }
    }
}
