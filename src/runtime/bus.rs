//! Bounded event bus and the consumer-facing event stream.
//!
//! A single FIFO channel carries both lifecycle events and internal
//! completion notifications from step tasks to the orchestrator. The bound
//! is the run's `queue_size` (0 = unbounded); producers suspend when the
//! channel is full, which is the backpressure path all the way out to the
//! caller's iteration of the run.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::failures::{ExecutionLog, FailureReason};
use crate::types::{Event, SharedState, StepOutcome};

/// Hook applied to every event before it leaves the bus. May transform an
/// event but never drop one.
pub type EventHook = Arc<dyn Fn(Event) -> Event + Send + Sync>;

/// Terminal disposition of one step invocation.
pub(crate) enum StepTermination<S, C> {
    /// The step body returned a routing value.
    Completed(StepOutcome<S, C>),
    /// The step failed but an error handler returned normally; the value is
    /// the handler's return, emitted as the STEP_END payload.
    Recovered(Value),
    /// Unrecovered failure.
    Failed {
        message: String,
        reason: FailureReason,
        error: Arc<anyhow::Error>,
    },
    /// A nested pipeline driven by this step finished.
    SubFinished { failed: Option<String> },
}

/// Completion notification sent by a step task to the orchestrator.
pub(crate) struct StepResult<S, C> {
    /// Step whose batch this completion counts against (the map owner for
    /// fan-out children, the step itself otherwise).
    pub owner: String,
    /// Step that ran.
    pub name: String,
    pub invocation_id: Uuid,
    pub termination: StepTermination<S, C>,
    /// Step meta snapshot captured at the end of the invocation.
    pub meta: Option<Value>,
}

/// Message on the internal bus.
pub(crate) enum BusMsg<S, C> {
    Event(Event),
    Done(StepResult<S, C>),
}

/// Sender half of a bounded-or-unbounded channel.
pub(crate) enum Tx<T> {
    Bounded(mpsc::Sender<T>),
    Unbounded(mpsc::UnboundedSender<T>),
}

impl<T> Clone for Tx<T> {
    fn clone(&self) -> Self {
        match self {
            Tx::Bounded(tx) => Tx::Bounded(tx.clone()),
            Tx::Unbounded(tx) => Tx::Unbounded(tx.clone()),
        }
    }
}

impl<T> Tx<T> {
    /// Send, suspending while the channel is full. Errors only when the
    /// receiver is gone.
    pub async fn send(&self, value: T) -> Result<(), ()> {
        match self {
            Tx::Bounded(tx) => tx.send(value).await.map_err(|_| ()),
            Tx::Unbounded(tx) => tx.send(value).map_err(|_| ()),
        }
    }
}

/// Receiver half of a bounded-or-unbounded channel.
pub(crate) enum Rx<T> {
    Bounded(mpsc::Receiver<T>),
    Unbounded(mpsc::UnboundedReceiver<T>),
}

impl<T> Rx<T> {
    pub async fn recv(&mut self) -> Option<T> {
        match self {
            Rx::Bounded(rx) => rx.recv().await,
            Rx::Unbounded(rx) => rx.recv().await,
        }
    }

    pub fn try_recv(&mut self) -> Option<T> {
        match self {
            Rx::Bounded(rx) => rx.try_recv().ok(),
            Rx::Unbounded(rx) => rx.try_recv().ok(),
        }
    }

    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<T>> {
        match self {
            Rx::Bounded(rx) => rx.poll_recv(cx),
            Rx::Unbounded(rx) => rx.poll_recv(cx),
        }
    }
}

/// Open a FIFO channel with the given bound; 0 means unbounded.
pub(crate) fn channel<T>(queue_size: usize) -> (Tx<T>, Rx<T>) {
    if queue_size == 0 {
        let (tx, rx) = mpsc::unbounded_channel();
        (Tx::Unbounded(tx), Rx::Unbounded(rx))
    } else {
        let (tx, rx) = mpsc::channel(queue_size);
        (Tx::Bounded(tx), Rx::Bounded(rx))
    }
}

/// The lazy event sequence returned by `Pipe::run`.
///
/// Dropping the stream cancels the run: the orchestrator observes the closed
/// channel and terminates, aborting outstanding step tasks.
pub struct EventStream<S> {
    rx: Rx<Event>,
    hooks: Vec<EventHook>,
    state: SharedState<S>,
    log: Arc<Mutex<ExecutionLog>>,
}

impl<S> EventStream<S> {
    pub(crate) fn new(
        rx: Rx<Event>,
        hooks: Vec<EventHook>,
        state: SharedState<S>,
        log: Arc<Mutex<ExecutionLog>>,
    ) -> Self {
        Self {
            rx,
            hooks,
            state,
            log,
        }
    }

    /// Handle to the run's shared state.
    pub fn state(&self) -> SharedState<S> {
        self.state.clone()
    }

    /// Snapshot of the failures and diagnostics recorded so far.
    pub fn execution_log(&self) -> ExecutionLog {
        self.log.lock().clone()
    }
}

impl<S> Stream for EventStream<S> {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        let this = self.get_mut();
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(mut event)) => {
                for hook in &this.hooks {
                    event = hook(event);
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S> Unpin for EventStream<S> {}
