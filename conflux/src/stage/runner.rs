//! Stage execution: a worker pool between an input and an output channel.

use super::config::StageConfig;
use super::reorder::ReorderBuffer;
use super::Transform;
use crate::channel::Channel;
use crate::errors::{debug_repr, FlowError, TransformError};
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::json;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Execution state of a stage. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    /// Built but not started.
    Created,
    /// Workers are processing items.
    Running,
    /// The input has closed; in-flight items are finishing.
    Draining,
    /// Terminally faulted; the first fault is recorded on the stage.
    Faulted,
    /// All workers finished and the output channel was completed.
    Completed,
}

impl StageState {
    /// Returns true for the two terminal states.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Faulted | Self::Completed)
    }

    /// Returns a stable short name for diagnostics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Faulted => "faulted",
            Self::Completed => "completed",
        }
    }

    fn rank(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Running => 1,
            Self::Draining => 2,
            Self::Faulted => 3,
            Self::Completed => 4,
        }
    }

    fn may_advance(self, to: Self) -> bool {
        !self.is_terminal() && to.rank() > self.rank()
    }
}

pub(crate) struct StageShared {
    name: String,
    state: watch::Sender<StageState>,
    shutdown: watch::Sender<bool>,
    fault: Mutex<Option<FlowError>>,
    suppressed: Mutex<Vec<FlowError>>,
}

impl StageShared {
    fn new(name: String) -> Self {
        let (state, _) = watch::channel(StageState::Created);
        let (shutdown, _) = watch::channel(false);
        Self {
            name,
            state,
            shutdown,
            fault: Mutex::new(None),
            suppressed: Mutex::new(Vec::new()),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> StageState {
        *self.state.borrow()
    }

    fn state_receiver(&self) -> watch::Receiver<StageState> {
        self.state.subscribe()
    }

    fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    fn advance(&self, to: StageState) -> bool {
        self.state.send_if_modified(|current| {
            if current.may_advance(to) {
                *current = to;
                true
            } else {
                false
            }
        })
    }

    /// Records a fault; the first one wins. Returns true to the winner, who
    /// is responsible for faulting the output channel. Losing faults are
    /// kept for diagnostics only.
    fn record_fault(&self, error: FlowError) -> bool {
        {
            let mut slot = self.fault.lock();
            if slot.is_some() {
                drop(slot);
                debug!(stage = %self.name, error = %error, "suppressed subsequent fault");
                self.suppressed.lock().push(error);
                return false;
            }
            *slot = Some(error.clone());
        }
        warn!(stage = %self.name, error = %error, "stage faulted");
        self.advance(StageState::Faulted);
        let _ = self.shutdown.send(true);
        true
    }

    fn is_faulted(&self) -> bool {
        self.fault.lock().is_some()
    }

    fn first_fault(&self) -> Option<FlowError> {
        self.fault.lock().clone()
    }

    fn suppressed_faults(&self) -> Vec<FlowError> {
        self.suppressed.lock().clone()
    }
}

struct WorkerContext<In, Out> {
    shared: Arc<StageShared>,
    transform: Arc<dyn Transform<In, Out>>,
    input: Arc<Channel<In>>,
    output: Arc<Channel<Out>>,
    ordered: bool,
    sequence: AtomicU64,
    intake: AsyncMutex<()>,
    reorder: Option<ReorderBuffer<Out>>,
}

/// A pool of workers reading from an input channel, applying a
/// [`Transform`], and writing to an output channel.
///
/// The stage owns both channels; upstream producers write into
/// [`Stage::input`] and downstream consumers (or links) read from
/// [`Stage::output`]. The first fault wins: it is recorded on the stage,
/// propagated to the output channel, and siblings stop pulling input.
pub struct Stage<In, Out> {
    id: Uuid,
    config: StageConfig,
    ctx: Arc<WorkerContext<In, Out>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl<In, Out> Stage<In, Out>
where
    In: Send + fmt::Debug + 'static,
    Out: Send + 'static,
{
    /// Creates a new stage with its own input and output channels.
    pub fn new(
        name: impl Into<String>,
        config: StageConfig,
        transform: impl Transform<In, Out> + 'static,
    ) -> Self {
        let name = name.into();
        let input = Arc::new(
            Channel::new(config.capacity, config.overflow_policy)
                .with_label(format!("{name}.in")),
        );
        let output = Arc::new(
            Channel::new(config.capacity, config.overflow_policy)
                .with_label(format!("{name}.out")),
        );
        // A single worker already preserves order.
        let ordered = config.ordered && config.parallelism > 1;
        Self {
            id: Uuid::new_v4(),
            ctx: Arc::new(WorkerContext {
                shared: Arc::new(StageShared::new(name)),
                transform: Arc::new(transform),
                input,
                output,
                ordered,
                sequence: AtomicU64::new(0),
                intake: AsyncMutex::new(()),
                reorder: ordered.then(ReorderBuffer::new),
            }),
            config,
            supervisor: Mutex::new(None),
        }
    }

    /// Returns the stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.ctx.shared.name()
    }

    /// Returns the stage id.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the stage configuration.
    #[must_use]
    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    /// Returns the channel upstream producers write into.
    #[must_use]
    pub fn input(&self) -> Arc<Channel<In>> {
        self.ctx.input.clone()
    }

    /// Returns the channel downstream consumers read from.
    #[must_use]
    pub fn output(&self) -> Arc<Channel<Out>> {
        self.ctx.output.clone()
    }

    /// Returns the current execution state.
    #[must_use]
    pub fn state(&self) -> StageState {
        self.ctx.shared.state()
    }

    /// Returns a receiver observing state transitions.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<StageState> {
        self.ctx.shared.state_receiver()
    }

    /// Returns the first fault recorded on this stage, if any.
    #[must_use]
    pub fn first_fault(&self) -> Option<FlowError> {
        self.ctx.shared.first_fault()
    }

    /// Returns faults that lost the first-fault race, for diagnostics.
    #[must_use]
    pub fn suppressed_faults(&self) -> Vec<FlowError> {
        self.ctx.shared.suppressed_faults()
    }

    /// Spawns the worker pool. Idempotent: only the first call starts
    /// workers.
    pub fn start(&self) {
        if !self.ctx.shared.advance(StageState::Running) {
            return;
        }
        debug!(stage = %self.name(), parallelism = self.config.parallelism, "stage started");
        let workers: Vec<JoinHandle<()>> = (0..self.config.parallelism)
            .map(|index| tokio::spawn(run_worker(self.ctx.clone(), index)))
            .collect();
        let shared = self.ctx.shared.clone();
        let output = self.ctx.output.clone();
        let supervisor = tokio::spawn(async move {
            for joined in join_all(workers).await {
                if let Err(join_error) = joined {
                    let error =
                        FlowError::internal(format!("stage worker terminated abnormally: {join_error}"));
                    if shared.record_fault(error.clone()) {
                        output.fault(error);
                    }
                }
            }
            if !shared.is_faulted() {
                shared.advance(StageState::Draining);
                output.complete();
                shared.advance(StageState::Completed);
            }
        });
        *self.supervisor.lock() = Some(supervisor);
    }

    /// Suspends until the stage reaches a terminal state, which is returned.
    pub async fn wait(&self) -> StageState {
        let mut receiver = self.ctx.shared.state_receiver();
        loop {
            let current = *receiver.borrow_and_update();
            if current.is_terminal() {
                return current;
            }
            if receiver.changed().await.is_err() {
                return self.state();
            }
        }
    }

    /// Returns a serializable diagnostic view of the stage.
    #[must_use]
    pub fn snapshot(&self) -> serde_json::Value {
        json!({
            "id": self.id.to_string(),
            "name": self.name(),
            "state": self.state().as_str(),
            "parallelism": self.config.parallelism,
            "ordered": self.config.ordered,
            "input_buffered": self.ctx.input.count(),
            "output_buffered": self.ctx.output.count(),
            "first_fault": self.first_fault().map(|e| e.to_dict()),
            "suppressed_faults": self.suppressed_faults().len(),
        })
    }
}

impl<In, Out> fmt::Debug for Stage<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.ctx.shared.name())
            .field("state", &self.ctx.shared.state())
            .field("config", &self.config)
            .finish()
    }
}

/// Type-erased control surface of a stage, used by pipelines and
/// cancellation scopes.
pub trait StageControl: Send + Sync {
    /// Returns the stage name.
    fn name(&self) -> &str;

    /// Returns the stage id.
    fn id(&self) -> Uuid;

    /// Returns the current execution state.
    fn state(&self) -> StageState;

    /// Returns a receiver observing state transitions.
    fn state_receiver(&self) -> watch::Receiver<StageState>;

    /// Returns the first fault recorded on this stage, if any.
    fn first_fault(&self) -> Option<FlowError>;

    /// Spawns the worker pool.
    fn start(&self);

    /// Injects `error` as if one of the stage's transforms had failed,
    /// additionally faulting the input channel so suspended callers within
    /// reach resolve promptly.
    fn inject_fault(&self, error: FlowError);

    /// Returns a serializable diagnostic view of the stage.
    fn snapshot(&self) -> serde_json::Value;
}

impl<In, Out> StageControl for Stage<In, Out>
where
    In: Send + fmt::Debug + 'static,
    Out: Send + 'static,
{
    fn name(&self) -> &str {
        Stage::name(self)
    }

    fn id(&self) -> Uuid {
        Stage::id(self)
    }

    fn state(&self) -> StageState {
        Stage::state(self)
    }

    fn state_receiver(&self) -> watch::Receiver<StageState> {
        Stage::state_receiver(self)
    }

    fn first_fault(&self) -> Option<FlowError> {
        Stage::first_fault(self)
    }

    fn start(&self) {
        Stage::start(self);
    }

    fn inject_fault(&self, error: FlowError) {
        if self.ctx.shared.record_fault(error.clone()) {
            self.ctx.output.fault(error.clone());
        }
        self.ctx.input.fault(error);
    }

    fn snapshot(&self) -> serde_json::Value {
        Stage::snapshot(self)
    }
}

async fn run_worker<In, Out>(ctx: Arc<WorkerContext<In, Out>>, worker: usize)
where
    In: Send + fmt::Debug + 'static,
    Out: Send + 'static,
{
    let mut shutdown = ctx.shared.shutdown_receiver();
    loop {
        if *shutdown.borrow() {
            break;
        }
        let dequeued = tokio::select! {
            dequeued = next_item(&ctx) => dequeued,
            _ = shutdown.changed() => continue,
        };
        match dequeued {
            Ok((seq, item)) => {
                let rendering = debug_repr(&item);
                match ctx.transform.apply(item).await {
                    Ok(value) => {
                        let emitted = match &ctx.reorder {
                            Some(reorder) => reorder.release(seq, value, &ctx.output).await,
                            None => ctx.output.write(value).await,
                        };
                        if let Err(error) = emitted {
                            // Downstream refused the result; no progress is possible.
                            if ctx.shared.record_fault(error.clone()) {
                                ctx.output.fault(error);
                            }
                            break;
                        }
                    }
                    Err(cause) => {
                        let error = FlowError::from(TransformError::new(
                            ctx.shared.name(),
                            rendering,
                            cause,
                        ));
                        if ctx.shared.record_fault(error.clone()) {
                            ctx.output.fault(error);
                        }
                        break;
                    }
                }
            }
            Err(FlowError::ClosedChannel(_)) => {
                // Input completed and drained.
                ctx.shared.advance(StageState::Draining);
                break;
            }
            Err(error) => {
                // Upstream fault, or a cancellation injected into the input.
                if ctx.shared.record_fault(error.clone()) {
                    ctx.output.fault(error);
                }
                break;
            }
        }
    }
    debug!(stage = %ctx.shared.name(), worker, "worker exited");
}

/// Dequeues the next item. In ordered mode the sequence tag is assigned
/// under the intake lock so tag order equals dequeue order.
async fn next_item<In, Out>(ctx: &WorkerContext<In, Out>) -> Result<(u64, In), FlowError> {
    if ctx.ordered {
        let _intake = ctx.intake.lock().await;
        let item = ctx.input.read().await?;
        Ok((ctx.sequence.fetch_add(1, Ordering::SeqCst), item))
    } else {
        Ok((0, ctx.input.read().await?))
    }
}
