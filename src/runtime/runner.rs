//! The run driver: dispatches invocations, interprets routing values,
//! tracks fan-out batches and drives the run to quiescence.
//!
//! One orchestrator task owns the receiving side of the bus. Step bodies run
//! as spawned tasks that report TOKEN events and a terminal `StepResult`
//! back over the bus; the orchestrator emits lifecycle events to the
//! consumer stream, enqueues successors and notifies the scheduler. The run
//! finishes when the in-flight count is zero, no map batch is outstanding
//! and the bus is drained.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::error::PipeError;
use crate::failures::{ExecutionLog, FailureJournal, FailureKind, FailureReason, FailureSource};
use crate::graph::validate_graph;
use crate::pipe::Registry;
use crate::runtime::bus::{self, BusMsg, EventStream, Rx, StepResult, StepTermination, Tx};
use crate::runtime::failure_handler::{FailureHandler, Recovery};
use crate::runtime::invoker::{map_item_payload, map_payload_key, StepInvoker};
use crate::runtime::meta::{StepMeta, StepStatus, CURRENT_STEP_META};
use crate::runtime::scheduler::{MapBatch, Scheduler};
use crate::runtime::tracker::ExecutionTracker;
use crate::types::{Event, EventType, Payload, SharedState, StepOutcome};

/// Start a run: spawn the orchestrator task and hand back the event stream.
pub(crate) fn spawn_run<S, C>(
    reg: Arc<Registry<S, C>>,
    state: S,
    context: Option<C>,
    start: Option<String>,
    queue_size: usize,
) -> EventStream<S>
where
    S: Send + Sync + fmt::Debug + 'static,
    C: Send + Sync + 'static,
{
    let state: SharedState<S> = Arc::new(RwLock::new(state));
    let context = context.map(Arc::new);
    let log = Arc::new(Mutex::new(ExecutionLog::default()));
    let (out_tx, out_rx) = bus::channel::<Event>(queue_size);
    let stream = EventStream::new(out_rx, reg.event_hooks.clone(), state.clone(), log.clone());

    let runner = PipelineRunner::new(reg, state, context, log, out_tx, queue_size);
    tokio::spawn(runner.run(start));
    stream
}

struct PipelineRunner<S, C> {
    reg: Arc<Registry<S, C>>,
    invoker: Arc<StepInvoker<S, C>>,
    failures: Arc<FailureHandler<S, C>>,
    journal: FailureJournal,
    log: Arc<Mutex<ExecutionLog>>,
    tracker: Arc<ExecutionTracker>,
    scheduler: Scheduler,
    /// Map owners whose completion is deferred until their batches drain:
    /// one queued entry per deferred invocation, keyed by owner step name,
    /// holding the owner that invocation reports to. FIFO, matching the
    /// scheduler's batch order.
    deferred: HashMap<String, VecDeque<String>>,
    /// Meta snapshots of sub steps awaiting their nested run.
    pending_subs: HashMap<Uuid, Option<Value>>,
    state: SharedState<S>,
    context: Option<Arc<C>>,
    bus_tx: Tx<BusMsg<S, C>>,
    bus_rx: Rx<BusMsg<S, C>>,
    out: Tx<Event>,
    tasks: JoinSet<()>,
    queue_size: usize,
}

impl<S, C> PipelineRunner<S, C>
where
    S: Send + Sync + fmt::Debug + 'static,
    C: Send + Sync + 'static,
{
    fn new(
        reg: Arc<Registry<S, C>>,
        state: SharedState<S>,
        context: Option<Arc<C>>,
        log: Arc<Mutex<ExecutionLog>>,
        out: Tx<Event>,
        queue_size: usize,
    ) -> Self {
        let (bus_tx, bus_rx) = bus::channel(queue_size);
        let invoker = Arc::new(StepInvoker::new(reg.clone()));
        let failures = Arc::new(FailureHandler::new(reg.clone(), invoker.clone()));
        let journal = FailureJournal::new(reg.classification.clone());
        Self {
            reg,
            invoker,
            failures,
            journal,
            log,
            tracker: Arc::new(ExecutionTracker::new()),
            scheduler: Scheduler::new(),
            deferred: HashMap::new(),
            pending_subs: HashMap::new(),
            state,
            context,
            bus_tx,
            bus_rx,
            out,
            tasks: JoinSet::new(),
            queue_size,
        }
    }

    async fn run(mut self, start: Option<String>) {
        let pipe_name = self.reg.name.clone();
        if !self
            .emit(Event::new(EventType::Start, pipe_name.as_str(), Value::Null))
            .await
        {
            return;
        }

        if self.reg.validate_on_run {
            if let Err(err) = validate_graph(&self.reg.settings, &self.reg.topology) {
                self.record_run_failure(
                    FailureKind::Validation,
                    FailureReason::ValidationError,
                    &err.to_string(),
                );
                self.pipeline_error(&pipe_name, err.to_string()).await;
                self.finish(&pipe_name).await;
                return;
            }
        }

        for hook in self.reg.startup.clone() {
            if let Err(err) = hook(self.state.clone(), self.context.clone()).await {
                self.record_run_failure(
                    FailureKind::Infra,
                    FailureReason::HookError,
                    &format!("startup hook failed: {err:#}"),
                );
                self.pipeline_error(&pipe_name, format!("startup hook failed: {err:#}"))
                    .await;
                self.finish(&pipe_name).await;
                return;
            }
        }

        let entry = match self.resolve_start(start) {
            Ok(entry) => entry,
            Err(err) => {
                self.record_run_failure(
                    FailureKind::Validation,
                    FailureReason::ValidationError,
                    &err.to_string(),
                );
                self.pipeline_error(&pipe_name, err.to_string()).await;
                self.finish(&pipe_name).await;
                return;
            }
        };

        if !self.dispatch(&entry, entry.clone(), None).await {
            return;
        }

        while let Some(msg) = self.bus_rx.recv().await {
            while self.tasks.try_join_next().is_some() {}
            if !self.handle_msg(msg).await {
                return;
            }
            if self.tracker.is_quiescent() && self.scheduler.is_idle() {
                // Drain anything already queued before declaring quiescence.
                while let Some(msg) = self.bus_rx.try_recv() {
                    if !self.handle_msg(msg).await {
                        return;
                    }
                }
                if self.tracker.is_quiescent() && self.scheduler.is_idle() {
                    break;
                }
            }
        }

        for hook in self.reg.shutdown.clone().into_iter().rev() {
            if let Err(err) = hook(self.state.clone(), self.context.clone()).await {
                self.record_run_failure(
                    FailureKind::Infra,
                    FailureReason::HookError,
                    &format!("shutdown hook failed: {err:#}"),
                );
                if !self
                    .pipeline_error(&pipe_name, format!("shutdown hook failed: {err:#}"))
                    .await
                {
                    return;
                }
            }
        }
        self.finish(&pipe_name).await;
    }

    async fn handle_msg(&mut self, msg: BusMsg<S, C>) -> bool {
        match msg {
            BusMsg::Event(event) => self.emit(event).await,
            BusMsg::Done(result) => self.handle_done(result).await,
        }
    }

    async fn handle_done(&mut self, result: StepResult<S, C>) -> bool {
        let StepResult {
            owner,
            name,
            invocation_id,
            termination,
            meta,
        } = result;

        match termination {
            StepTermination::Completed(outcome) => match outcome {
                StepOutcome::Value(value) => {
                    if !self
                        .emit(Event::new(EventType::StepEnd, name.as_str(), value).with_meta(meta))
                        .await
                    {
                        return false;
                    }
                    let successors = self.static_successors(&name);
                    self.complete_invocation(&name, &owner, successors).await
                }
                StepOutcome::Next(target) => {
                    if !self
                        .emit(
                            Event::new(EventType::StepEnd, name.as_str(), Value::Null)
                                .with_meta(meta),
                        )
                        .await
                    {
                        return false;
                    }
                    self.complete_invocation(&name, &owner, vec![target]).await
                }
                StepOutcome::Suspend | StepOutcome::Stop => {
                    if !self
                        .emit(
                            Event::new(EventType::StepEnd, name.as_str(), Value::Null)
                                .with_meta(meta),
                        )
                        .await
                    {
                        return false;
                    }
                    self.complete_invocation(&name, &owner, Vec::new()).await
                }
                StepOutcome::Map { items, target } => {
                    if !self
                        .emit(
                            Event::new(EventType::StepEnd, name.as_str(), Value::Null)
                                .with_meta(meta),
                        )
                        .await
                    {
                        return false;
                    }
                    self.scheduler
                        .register_batch(&name, &target, items.len(), Some(invocation_id));
                    if owner != name {
                        self.deferred
                            .entry(name.clone())
                            .or_default()
                            .push_back(owner.clone());
                    }
                    let key = map_payload_key(&self.reg, &target);
                    for item in items {
                        let payload = map_item_payload(key.as_deref(), item);
                        if !self.dispatch(&target, name.clone(), Some(payload)).await {
                            return false;
                        }
                    }
                    self.tracker.decrement();
                    let drained = self.scheduler.on_step_completed(&name, &name);
                    self.handle_drained(&name, drained).await
                }
                StepOutcome::Run { pipe, state } => {
                    self.pending_subs.insert(invocation_id, meta);
                    let bus = self.bus_tx.clone();
                    let queue_size = self.queue_size;
                    self.tasks.spawn(async move {
                        forward_sub_run(pipe, state, name, owner, invocation_id, queue_size, bus)
                            .await;
                    });
                    true
                }
            },
            StepTermination::Recovered(value) => {
                if !self
                    .emit(Event::new(EventType::StepEnd, name.as_str(), value).with_meta(meta))
                    .await
                {
                    return false;
                }
                let successors = self.static_successors(&name);
                self.complete_invocation(&name, &owner, successors).await
            }
            StepTermination::Failed {
                message,
                reason,
                error,
            } => {
                self.record_step_failure(&name, reason, &message, Some(&error));
                if !self
                    .emit(
                        Event::new(EventType::StepError, name.as_str(), Value::String(message))
                            .with_meta(meta),
                    )
                    .await
                {
                    return false;
                }
                self.complete_invocation(&name, &owner, Vec::new()).await
            }
            StepTermination::SubFinished { failed } => {
                let meta = self.pending_subs.remove(&invocation_id).flatten();
                match failed {
                    None => {
                        if !self
                            .emit(
                                Event::new(EventType::StepEnd, name.as_str(), Value::Null)
                                    .with_meta(meta),
                            )
                            .await
                        {
                            return false;
                        }
                        let successors = self.static_successors(&name);
                        self.complete_invocation(&name, &owner, successors).await
                    }
                    Some(message) => {
                        self.record_step_failure(&name, FailureReason::StepError, &message, None);
                        if !self
                            .emit(
                                Event::new(
                                    EventType::StepError,
                                    name.as_str(),
                                    Value::String(message),
                                )
                                .with_meta(meta),
                            )
                            .await
                        {
                            return false;
                        }
                        self.complete_invocation(&name, &owner, Vec::new()).await
                    }
                }
            }
        }
    }

    /// Emit STEP_START and spawn the invocation task.
    async fn dispatch(&mut self, name: &str, owner: String, payload: Option<Payload>) -> bool {
        if !self
            .emit(Event::new(EventType::StepStart, name, Value::Null))
            .await
        {
            return false;
        }
        self.tracker.increment();

        let invoker = self.invoker.clone();
        let failures = self.failures.clone();
        let state = self.state.clone();
        let context = self.context.clone();
        let bus = self.bus_tx.clone();
        let name = name.to_string();
        let invocation_id = Uuid::new_v4();
        self.tasks.spawn(async move {
            run_invocation(
                invoker,
                failures,
                name,
                owner,
                invocation_id,
                payload,
                state,
                context,
                bus,
            )
            .await;
        });
        true
    }

    /// Dispatch successors, then account for the finished invocation.
    async fn complete_invocation(
        &mut self,
        name: &str,
        owner: &str,
        successors: Vec<String>,
    ) -> bool {
        for target in successors {
            if !self.dispatch(&target, target.clone(), None).await {
                return false;
            }
        }
        self.tracker.decrement();
        let drained = self.scheduler.on_step_completed(owner, name);
        self.handle_drained(owner, drained).await
    }

    /// Process drained batches: enqueue each owner's static successors and
    /// propagate deferred map-owner completions outward.
    async fn handle_drained(&mut self, owner: &str, drained: Vec<MapBatch>) -> bool {
        let mut work: VecDeque<(String, MapBatch)> = drained
            .into_iter()
            .map(|b| (owner.to_string(), b))
            .collect();
        while let Some((batch_owner, _batch)) = work.pop_front() {
            for target in self.static_successors(&batch_owner) {
                if !self.dispatch(&target, target.clone(), None).await {
                    return false;
                }
            }
            // Each drained batch corresponds to one fan-out invocation of
            // its owner; pop that invocation's deferral and report the
            // completion outward.
            let parent = match self.deferred.get_mut(&batch_owner) {
                Some(parents) => {
                    let parent = parents.pop_front();
                    if parents.is_empty() {
                        self.deferred.remove(&batch_owner);
                    }
                    parent
                }
                None => None,
            };
            if let Some(parent) = parent {
                if parent != batch_owner {
                    let next = self.scheduler.on_step_completed(&parent, &batch_owner);
                    work.extend(next.into_iter().map(|b| (parent.clone(), b)));
                }
            }
        }
        true
    }

    fn static_successors(&self, name: &str) -> Vec<String> {
        self.reg.topology.get(name).cloned().unwrap_or_default()
    }

    /// Pick the entry step: the explicit `start`, else the single step no
    /// edge points at.
    fn resolve_start(&self, start: Option<String>) -> Result<String, PipeError> {
        if let Some(start) = start {
            if self.reg.settings.contains_key(&start) {
                return Ok(start);
            }
            return Err(PipeError::validation(format!(
                "Start step '{start}' is not registered"
            )));
        }

        let mut referenced: Vec<String> = Vec::new();
        for successors in self.reg.topology.values() {
            referenced.extend(successors.iter().cloned());
        }
        for settings in self.reg.settings.values() {
            if let Some(target) = &settings.map_target {
                referenced.push(target.clone());
            }
            if let Some(routes) = &settings.switch_routes {
                referenced.extend(routes.static_targets());
            }
            if let Some(default) = &settings.switch_default {
                referenced.push(default.clone());
            }
        }

        let entries: Vec<&String> = self
            .reg
            .settings
            .keys()
            .filter(|name| !referenced.contains(name))
            .collect();
        match entries.as_slice() {
            [single] => Ok((*single).clone()),
            [] => Err(PipeError::validation(
                "Cannot determine entry step: every registered step has a predecessor",
            )),
            many => Err(PipeError::validation(format!(
                "Cannot determine entry step: {} candidates ({}); pass `start` explicitly",
                many.len(),
                many.iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            ))),
        }
    }

    async fn emit(&self, event: Event) -> bool {
        self.out.send(event).await.is_ok()
    }

    async fn pipeline_error(&self, pipe_name: &str, message: String) -> bool {
        self.emit(Event::new(
            EventType::PipelineError,
            pipe_name,
            Value::String(message),
        ))
        .await
    }

    async fn finish(&self, pipe_name: &str) {
        let _ = self
            .emit(Event::new(EventType::Finish, pipe_name, Value::Null))
            .await;
    }

    fn record_step_failure(
        &self,
        step: &str,
        reason: FailureReason,
        message: &str,
        error: Option<&Arc<anyhow::Error>>,
    ) {
        let mut log = self.log.lock();
        self.journal.record_failure(
            &mut log,
            FailureKind::Step,
            FailureSource::UserCode,
            reason,
            message,
            Some(step),
            error.map(|e| e.as_ref()),
        );
    }

    fn record_run_failure(&self, kind: FailureKind, reason: FailureReason, message: &str) {
        let mut log = self.log.lock();
        self.journal.record_failure(
            &mut log,
            kind,
            FailureSource::UserCode,
            reason,
            message,
            None,
            None,
        );
    }
}

/// One step invocation, run as its own task: install the meta slot, execute
/// under it, run the failure chain on error, report the terminal result.
#[allow(clippy::too_many_arguments)]
async fn run_invocation<S, C>(
    invoker: Arc<StepInvoker<S, C>>,
    failures: Arc<FailureHandler<S, C>>,
    name: String,
    owner: String,
    invocation_id: Uuid,
    payload: Option<Payload>,
    state: SharedState<S>,
    context: Option<Arc<C>>,
    bus: Tx<BusMsg<S, C>>,
) where
    S: Send + Sync + fmt::Debug + 'static,
    C: Send + Sync + 'static,
{
    let slot = Arc::new(Mutex::new(StepMeta::default()));
    let started = Instant::now();

    let result = CURRENT_STEP_META
        .scope(
            slot.clone(),
            invoker.execute(&name, &state, &context, payload.as_ref(), &bus),
        )
        .await;

    let termination = match result {
        Ok(outcome) => {
            slot.lock().framework.status = Some(StepStatus::Success);
            StepTermination::Completed(outcome)
        }
        Err(error) => {
            slot.lock().framework.status = Some(StepStatus::Error);
            match failures.handle(&name, error, &state, &context).await {
                Recovery::Recovered(value) => StepTermination::Recovered(value),
                Recovery::Unrecovered(error) => {
                    let reason = error
                        .downcast_ref::<PipeError>()
                        .map(PipeError::reason)
                        .unwrap_or(FailureReason::StepError);
                    StepTermination::Failed {
                        message: format!("{error:#}"),
                        reason,
                        error,
                    }
                }
            }
        }
    };

    let meta = {
        let mut meta = slot.lock();
        meta.framework.duration_s = started.elapsed().as_secs_f64();
        Some(meta.snapshot())
    };

    let _ = bus
        .send(BusMsg::Done(StepResult {
            owner,
            name,
            invocation_id,
            termination,
            meta,
        }))
        .await;
}

/// Drive a nested pipeline for a sub step: forward its events re-stamped
/// under the sub step's stage namespace, then report the terminal status.
async fn forward_sub_run<S, C>(
    pipe: Arc<crate::pipe::Pipe<S, C>>,
    seed: S,
    name: String,
    owner: String,
    invocation_id: Uuid,
    queue_size: usize,
    bus: Tx<BusMsg<S, C>>,
) where
    S: Send + Sync + fmt::Debug + 'static,
    C: Send + Sync + 'static,
{
    let mut stream = pipe.run_with(seed, None, None, Some(queue_size));
    let mut failed: Option<String> = None;
    while let Some(event) = stream.next().await {
        if matches!(
            event.event_type,
            EventType::StepError | EventType::PipelineError
        ) && failed.is_none()
        {
            failed = Some(format!(
                "sub pipeline '{}' failed at '{}'",
                pipe.name(),
                event.stage
            ));
        }
        // The nested START/FINISH bracket is not forwarded: the sub step's
        // own STEP_START/STEP_END plays that role in the outer stream, which
        // keeps the one-START-one-FINISH invariant intact.
        if matches!(event.event_type, EventType::Start | EventType::Finish) {
            continue;
        }
        let mut forwarded = event;
        forwarded.stage = format!("{}/{}", name, forwarded.stage);
        if bus.send(BusMsg::Event(forwarded)).await.is_err() {
            return;
        }
    }
    let _ = bus
        .send(BusMsg::Done(StepResult {
            owner,
            name,
            invocation_id,
            termination: StepTermination::SubFinished { failed },
            meta: None,
        }))
        .await;
}
