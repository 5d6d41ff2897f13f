//! Pipeline registration and run API.
//!
//! A `Pipe` collects named steps (plain, map, switch, sub, streaming), the
//! static successor edges between them, lifecycle hooks and middleware, then
//! runs the graph against a seed state, producing a lazy stream of events.
//!
//! Registration happens through builder methods rather than decorators: each
//! takes a [`StepConfig`] describing the step (name, successors, timeout,
//! retries, declared parameters, per-step error handler) and the user
//! callable. Map, switch and sub callables are wrapped at registration so
//! their raw returns are normalized into routing values before the
//! orchestrator sees them.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::{FutureExt, Stream, StreamExt};
use indexmap::IndexMap;
use serde_json::Value;

use crate::error::PipeError;
use crate::failures::FailureClassificationConfig;
use crate::graph::validate_graph;
use crate::middleware::{Middleware, RetryMiddleware, StepCallable, StreamFn, UnaryFn};
use crate::runtime::bus::{EventHook, EventStream};
use crate::runtime::runner;
use crate::signature::{analyze_signature, InjectionMap, Signature};
use crate::types::{
    Event, RetryPolicy, RouteTarget, Routes, SharedState, StepArgs, StepInfo, StepKind,
    StepOutcome, StreamYield,
};
use crate::visualization::{MermaidRenderer, VisualAst};

/// Boxed startup/shutdown hook.
pub(crate) type HookFn<S, C> = Arc<
    dyn Fn(SharedState<S>, Option<Arc<C>>) -> futures::future::BoxFuture<'static, anyhow::Result<()>>
        + Send
        + Sync,
>;

/// Boxed error handler: returns the recovered STEP_END payload.
pub(crate) type HandlerFn<S, C> = Arc<
    dyn Fn(StepArgs<S, C>) -> futures::future::BoxFuture<'static, anyhow::Result<Value>>
        + Send
        + Sync,
>;

/// Per-step configuration held by the registry.
pub(crate) struct StepSettings<S, C> {
    pub kind: StepKind,
    pub timeout: Option<f64>,
    pub retries: Option<RetryPolicy>,
    /// Reserved: maximum wait for a fan-out batch to drain. Carried through
    /// to introspection but not enforced.
    pub barrier_timeout: Option<f64>,
    pub on_error: Option<HandlerFn<S, C>>,
    pub map_target: Option<String>,
    pub switch_routes: Option<Routes>,
    pub switch_default: Option<String>,
    pub sub_pipe: Option<Arc<Pipe<S, C>>>,
}

impl<S, C> StepSettings<S, C> {
    pub(crate) fn of(kind: StepKind) -> Self {
        Self {
            kind,
            timeout: None,
            retries: None,
            barrier_timeout: None,
            on_error: None,
            map_target: None,
            switch_routes: None,
            switch_default: None,
            sub_pipe: None,
        }
    }
}

impl<S, C> Clone for StepSettings<S, C> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            timeout: self.timeout,
            retries: self.retries,
            barrier_timeout: self.barrier_timeout,
            on_error: self.on_error.clone(),
            map_target: self.map_target.clone(),
            switch_routes: self.switch_routes.clone(),
            switch_default: self.switch_default.clone(),
            sub_pipe: self.sub_pipe.clone(),
        }
    }
}

/// Immutable snapshot of a pipe handed to the runner for one run.
pub(crate) struct Registry<S, C> {
    pub name: String,
    pub steps: HashMap<String, StepCallable<S, C>>,
    pub injection: HashMap<String, InjectionMap>,
    pub settings: IndexMap<String, StepSettings<S, C>>,
    pub topology: IndexMap<String, Vec<String>>,
    pub startup: Vec<HookFn<S, C>>,
    pub shutdown: Vec<HookFn<S, C>>,
    pub on_error: Option<HandlerFn<S, C>>,
    pub event_hooks: Vec<EventHook>,
    pub classification: FailureClassificationConfig,
    pub validate_on_run: bool,
}

/// Builder for one step registration.
pub struct StepConfig<S, C> {
    name: String,
    to: Vec<String>,
    timeout: Option<f64>,
    retries: Option<RetryPolicy>,
    barrier_timeout: Option<f64>,
    signature: Signature,
    on_error: Option<(Signature, HandlerFn<S, C>)>,
}

impl<S, C> StepConfig<S, C> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            to: Vec::new(),
            timeout: None,
            retries: None,
            barrier_timeout: None,
            signature: Signature::new(),
            on_error: None,
        }
    }

    /// Append a static successor edge. Chain for multiple successors.
    pub fn to(mut self, target: impl Into<String>) -> Self {
        self.to.push(target.into());
        self
    }

    /// Per-invocation deadline in seconds.
    pub fn timeout(mut self, seconds: f64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    /// Retry up to `n` times after the first attempt.
    pub fn retries(mut self, n: u32) -> Self {
        self.retries = Some(RetryPolicy::Attempts(n));
        self
    }

    /// Full retry policy.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retries = Some(policy);
        self
    }

    /// Reserved: maximum wait for this step's fan-out batches to drain.
    pub fn barrier_timeout(mut self, seconds: f64) -> Self {
        self.barrier_timeout = Some(seconds);
        self
    }

    /// Declare the callable's parameters for injection analysis.
    pub fn params(mut self, signature: Signature) -> Self {
        self.signature = signature;
        self
    }

    /// Per-step error handler. A handler that returns normally recovers the
    /// step: its return becomes the STEP_END payload.
    pub fn on_error<F, Fut>(mut self, signature: Signature, handler: F) -> Self
    where
        F: Fn(StepArgs<S, C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.on_error = Some((signature, Arc::new(move |args| handler(args).boxed())));
        self
    }
}

/// A declarative, event-emitting pipeline of named async steps.
pub struct Pipe<S, C> {
    name: String,
    queue_size: usize,
    validate_on_run: bool,
    middleware: Vec<Arc<dyn Middleware<S, C>>>,
    steps: HashMap<String, StepCallable<S, C>>,
    injection: HashMap<String, InjectionMap>,
    pub(crate) settings: IndexMap<String, StepSettings<S, C>>,
    pub(crate) topology: IndexMap<String, Vec<String>>,
    startup: Vec<HookFn<S, C>>,
    shutdown: Vec<HookFn<S, C>>,
    on_error: Option<HandlerFn<S, C>>,
    event_hooks: Vec<EventHook>,
    classification: FailureClassificationConfig,
}

impl<S, C> Pipe<S, C>
where
    S: Send + Sync + fmt::Debug + 'static,
    C: Send + Sync + 'static,
{
    /// Create a pipe with the stock middleware (retry) installed.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue_size: 0,
            validate_on_run: false,
            middleware: vec![Arc::new(RetryMiddleware)],
            steps: HashMap::new(),
            injection: HashMap::new(),
            settings: IndexMap::new(),
            topology: IndexMap::new(),
            startup: Vec::new(),
            shutdown: Vec::new(),
            on_error: None,
            event_hooks: Vec::new(),
            classification: FailureClassificationConfig::default(),
        }
    }

    /// Builder: default event queue bound for runs (0 = unbounded).
    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    /// Builder: validate the graph at the start of every run.
    pub fn with_validate_on_run(mut self, enabled: bool) -> Self {
        self.validate_on_run = enabled;
        self
    }

    /// Builder: failure classification configuration.
    pub fn with_classification(mut self, config: FailureClassificationConfig) -> Self {
        self.classification = config;
        self
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register a plain step.
    pub fn step<F, Fut>(&mut self, cfg: StepConfig<S, C>, func: F) -> Result<(), PipeError>
    where
        F: Fn(StepArgs<S, C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<StepOutcome<S, C>>> + Send + 'static,
    {
        let (name, retries) = self.register_common(cfg, StepKind::Step, 1)?;
        let unary: UnaryFn<S, C> = Arc::new(move |args| func(args).boxed());
        self.wrap_and_store(&name, StepKind::Step, retries, StepCallable::Unary(unary));
        Ok(())
    }

    /// Register a fan-out step. The callable must return an array; one
    /// invocation of `using` is spawned per element, with the element bound
    /// to the companion's single unknown parameter.
    pub fn map<F, Fut>(
        &mut self,
        cfg: StepConfig<S, C>,
        using: impl Into<String>,
        func: F,
    ) -> Result<(), PipeError>
    where
        F: Fn(StepArgs<S, C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let target: String = using.into();
        let (name, retries) = self.register_common(cfg, StepKind::Map, 1)?;
        if let Some(settings) = self.settings.get_mut(&name) {
            settings.map_target = Some(target.clone());
        }
        let stage = name.clone();
        let unary: UnaryFn<S, C> = Arc::new(move |args| {
            let fut = func(args);
            let stage = stage.clone();
            let target = target.clone();
            async move {
                match fut.await? {
                    Value::Array(items) => Ok(StepOutcome::Map { items, target }),
                    other => Err(PipeError::MapOutput {
                        step: stage,
                        got: json_type_name(&other).to_string(),
                    }
                    .into()),
                }
            }
            .boxed()
        });
        self.wrap_and_store(&name, StepKind::Map, retries, StepCallable::Unary(unary));
        Ok(())
    }

    /// Register a conditional branch. The callable's return is matched
    /// against `routes`; no match and no default fails the invocation.
    pub fn switch<F, Fut>(
        &mut self,
        cfg: StepConfig<S, C>,
        routes: Routes,
        default: Option<&str>,
        func: F,
    ) -> Result<(), PipeError>
    where
        F: Fn(StepArgs<S, C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let (name, retries) = self.register_common(cfg, StepKind::Switch, 0)?;
        let default_owned = default.map(str::to_string);
        if let Some(settings) = self.settings.get_mut(&name) {
            settings.switch_routes = Some(routes.clone());
            settings.switch_default = default_owned.clone();
        }
        let stage = name.clone();
        let unary: UnaryFn<S, C> = Arc::new(move |args| {
            let fut = func(args);
            let routes = routes.clone();
            let default = default_owned.clone();
            let stage = stage.clone();
            async move {
                let key = fut.await?;
                let target = routes
                    .resolve(&key)
                    .or_else(|| default.map(RouteTarget::Step));
                match target {
                    Some(RouteTarget::Step(t)) => Ok(StepOutcome::Next(t)),
                    Some(RouteTarget::Stop) => Ok(StepOutcome::Stop),
                    None => Err(PipeError::NoRoute {
                        step: stage,
                        value: key.to_string(),
                    }
                    .into()),
                }
            }
            .boxed()
        });
        self.wrap_and_store(&name, StepKind::Switch, retries, StepCallable::Unary(unary));
        Ok(())
    }

    /// Register a nested sub-pipeline step. The callable's return seeds the
    /// nested run; the nested pipeline's terminal status determines this
    /// step's completion.
    pub fn sub<F, Fut>(
        &mut self,
        cfg: StepConfig<S, C>,
        using: Arc<Pipe<S, C>>,
        func: F,
    ) -> Result<(), PipeError>
    where
        F: Fn(StepArgs<S, C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<S>> + Send + 'static,
    {
        let (name, retries) = self.register_common(cfg, StepKind::Sub, 0)?;
        if let Some(settings) = self.settings.get_mut(&name) {
            settings.sub_pipe = Some(using.clone());
        }
        let unary: UnaryFn<S, C> = Arc::new(move |args| {
            let fut = func(args);
            let pipe = using.clone();
            async move {
                Ok(StepOutcome::Run {
                    pipe,
                    state: fut.await?,
                })
            }
            .boxed()
        });
        self.wrap_and_store(&name, StepKind::Sub, retries, StepCallable::Unary(unary));
        Ok(())
    }

    /// Register a streaming step. Token items become TOKEN events; the last
    /// routing item yielded is the step's routing decision.
    pub fn streaming<F, St>(&mut self, cfg: StepConfig<S, C>, func: F) -> Result<(), PipeError>
    where
        F: Fn(StepArgs<S, C>) -> St + Send + Sync + 'static,
        St: Stream<Item = anyhow::Result<StreamYield<S, C>>> + Send + 'static,
    {
        let (name, retries) = self.register_common(cfg, StepKind::Streaming, 1)?;
        let stream_fn: StreamFn<S, C> = Arc::new(move |args| func(args).boxed());
        self.wrap_and_store(
            &name,
            StepKind::Streaming,
            retries,
            StepCallable::Streaming(stream_fn),
        );
        Ok(())
    }

    /// Register a startup hook, run in registration order before the entry
    /// step. A failing hook ends the run with PIPELINE_ERROR then FINISH.
    pub fn on_startup<F, Fut>(&mut self, hook: F)
    where
        F: Fn(SharedState<S>, Option<Arc<C>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.startup.push(Arc::new(move |s, c| hook(s, c).boxed()));
    }

    /// Register a shutdown hook, run in reverse registration order at
    /// quiescence.
    pub fn on_shutdown<F, Fut>(&mut self, hook: F)
    where
        F: Fn(SharedState<S>, Option<Arc<C>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.shutdown.push(Arc::new(move |s, c| hook(s, c).boxed()));
    }

    /// Register the global error handler, invoked when a step has no
    /// handler of its own or that handler raised.
    pub fn on_error<F, Fut>(&mut self, signature: Signature, handler: F) -> Result<(), PipeError>
    where
        F: Fn(StepArgs<S, C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let injection = analyze_signature::<S, C>("system:on_error", &signature, 0)?;
        self.injection.insert("system:on_error".to_string(), injection);
        self.on_error = Some(Arc::new(move |args| handler(args).boxed()));
        Ok(())
    }

    /// Append a middleware. Applies to steps registered afterwards.
    pub fn add_middleware(&mut self, middleware: Arc<dyn Middleware<S, C>>) {
        self.middleware.push(middleware);
    }

    /// Append an event hook, applied in order to every event before it is
    /// yielded to the consumer.
    pub fn add_event_hook<F>(&mut self, hook: F)
    where
        F: Fn(Event) -> Event + Send + Sync + 'static,
    {
        self.event_hooks.push(Arc::new(hook));
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Read-only copy of the static execution graph.
    pub fn topology(&self) -> IndexMap<String, Vec<String>> {
        self.topology.clone()
    }

    /// Registered steps with their configuration.
    pub fn steps(&self) -> Vec<StepInfo> {
        self.settings
            .iter()
            .map(|(name, s)| {
                let mut targets: Vec<String> =
                    self.topology.get(name).cloned().unwrap_or_default();
                if let Some(target) = &s.map_target {
                    targets.push(target.clone());
                }
                if let Some(routes) = &s.switch_routes {
                    targets.extend(routes.static_targets());
                }
                if let Some(default) = &s.switch_default {
                    targets.push(default.clone());
                }
                StepInfo {
                    name: name.clone(),
                    kind: s.kind,
                    timeout: s.timeout,
                    retries: s.retries.map(|r| r.retries()).unwrap_or(0),
                    barrier_timeout: s.barrier_timeout,
                    has_error_handler: s.on_error.is_some(),
                    targets,
                }
            })
            .collect()
    }

    /// Validate graph integrity, naming the first dangling reference.
    pub fn validate(&self) -> Result<(), PipeError> {
        validate_graph(&self.settings, &self.topology)
    }

    /// Render the pipeline as Mermaid diagram source.
    pub fn graph(&self) -> String {
        let ast = VisualAst::build(
            &self.settings,
            &self.topology,
            self.startup.len(),
            self.shutdown.len(),
        );
        MermaidRenderer::new(ast).render()
    }

    // -----------------------------------------------------------------------
    // Run
    // -----------------------------------------------------------------------

    /// Run the pipeline against a seed state. Must be called within a Tokio
    /// runtime; returns the lazy event stream.
    pub fn run(&self, state: S) -> EventStream<S> {
        self.run_with(state, None, None, None)
    }

    /// Run with explicit context, entry step and queue bound.
    ///
    /// `start` defaults to the single registered step no edge points at;
    /// an ambiguous or empty entry set fails the run with PIPELINE_ERROR.
    pub fn run_with(
        &self,
        state: S,
        context: Option<C>,
        start: Option<&str>,
        queue_size: Option<usize>,
    ) -> EventStream<S> {
        let registry = Arc::new(self.registry_snapshot());
        runner::spawn_run(
            registry,
            state,
            context,
            start.map(str::to_string),
            queue_size.unwrap_or(self.queue_size),
        )
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn register_common(
        &mut self,
        cfg: StepConfig<S, C>,
        kind: StepKind,
        expected_unknowns: usize,
    ) -> Result<(String, Option<RetryPolicy>), PipeError> {
        let name = cfg.name;
        if self.settings.contains_key(&name) {
            return Err(PipeError::validation(format!(
                "Step '{name}' is already registered"
            )));
        }

        let injection = analyze_signature::<S, C>(&name, &cfg.signature, expected_unknowns)?;
        let handler = match cfg.on_error {
            Some((sig, handler)) => {
                let handler_injection =
                    analyze_signature::<S, C>(&format!("{name}:on_error"), &sig, 0)?;
                self.injection
                    .insert(format!("{name}:on_error"), handler_injection);
                Some(handler)
            }
            None => None,
        };
        self.injection.insert(name.clone(), injection);

        let mut settings = StepSettings::of(kind);
        settings.timeout = cfg.timeout;
        settings.retries = cfg.retries;
        settings.barrier_timeout = cfg.barrier_timeout;
        settings.on_error = handler;
        self.settings.insert(name.clone(), settings);

        if !cfg.to.is_empty() {
            self.topology.insert(name.clone(), cfg.to);
        }

        Ok((name, cfg.retries))
    }

    fn wrap_and_store(
        &mut self,
        name: &str,
        kind: StepKind,
        retries: Option<RetryPolicy>,
        callable: StepCallable<S, C>,
    ) {
        let ctx = crate::types::StepContext {
            name: name.to_string(),
            pipe_name: self.name.clone(),
            kind,
            retries,
        };
        let mut wrapped = callable;
        for mw in &self.middleware {
            wrapped = mw.wrap(wrapped, &ctx);
        }
        self.steps.insert(name.to_string(), wrapped);
    }

    fn registry_snapshot(&self) -> Registry<S, C> {
        Registry {
            name: self.name.clone(),
            steps: self.steps.clone(),
            injection: self.injection.clone(),
            settings: self.settings.clone(),
            topology: self.topology.clone(),
            startup: self.startup.clone(),
            shutdown: self.shutdown.clone(),
            on_error: self.on_error.clone(),
            event_hooks: self.event_hooks.clone(),
            classification: self.classification.clone(),
            validate_on_run: self.validate_on_run,
        }
    }
}

impl<S, C> Pipe<S, C> {
    /// Pipe name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<S, C> fmt::Debug for Pipe<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipe")
            .field("name", &self.name)
            .field("steps", &self.settings.len())
            .field("queue_size", &self.queue_size)
            .finish()
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
