//! Encapsulated pipelines: a DAG of stages behind an ingress/egress pair.

use super::link::Link;
use crate::cancellation::CancellationScope;
use crate::channel::Channel;
use crate::errors::FlowError;
use crate::stage::{StageControl, StageState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Identifies a pipeline instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineIdentity {
    /// The unique id of this pipeline.
    pub pipeline_id: Uuid,
    /// The pipeline name.
    pub name: String,
    /// When the pipeline was built.
    pub created_at: DateTime<Utc>,
}

impl PipelineIdentity {
    /// Creates a new identity with a generated id.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            pipeline_id: Uuid::new_v4(),
            name: name.into(),
            created_at: Utc::now(),
        }
    }
}

/// Derived lifecycle of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Built but not started.
    Created,
    /// At least one stage is still running or draining.
    Running,
    /// At least one stage faulted.
    Faulted,
    /// Every stage completed.
    Completed,
}

impl PipelineState {
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
            Self::Faulted => "faulted",
            Self::Completed => "completed",
        }
    }
}

/// A directed acyclic graph of stages and links, exposed only through its
/// ingress and egress channels.
///
/// The pipeline's state derives from its stages: it faults the instant any
/// stage faults and completes only once every stage has completed. A fault
/// does not forcibly tear down unaffected branches - they run to natural
/// completion unless the pipeline's cancellation scope is triggered.
pub struct Pipeline<In, Out> {
    identity: PipelineIdentity,
    stages: Vec<Arc<dyn StageControl>>,
    links: Vec<Link>,
    ingress: Arc<Channel<In>>,
    egress: Arc<Channel<Out>>,
    scope: Arc<CancellationScope>,
    started: AtomicBool,
}

impl<In, Out> Pipeline<In, Out> {
    pub(crate) fn new(
        name: String,
        stages: Vec<Arc<dyn StageControl>>,
        links: Vec<Link>,
        ingress: Arc<Channel<In>>,
        egress: Arc<Channel<Out>>,
        scope: Arc<CancellationScope>,
    ) -> Self {
        Self {
            identity: PipelineIdentity::new(name),
            stages,
            links,
            ingress,
            egress,
            scope,
            started: AtomicBool::new(false),
        }
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.identity.name
    }

    /// Returns the pipeline identity.
    #[must_use]
    pub fn identity(&self) -> &PipelineIdentity {
        &self.identity
    }

    /// Returns the channel producers write into.
    #[must_use]
    pub fn ingress(&self) -> Arc<Channel<In>> {
        self.ingress.clone()
    }

    /// Returns the channel consumers read from.
    #[must_use]
    pub fn egress(&self) -> Arc<Channel<Out>> {
        self.egress.clone()
    }

    /// Returns the pipeline's cancellation scope.
    #[must_use]
    pub fn scope(&self) -> Arc<CancellationScope> {
        self.scope.clone()
    }

    /// Starts every stage. Idempotent. Items written to the ingress before
    /// this call simply buffer and are drained once workers spawn.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            pipeline = %self.identity.name,
            stages = self.stages.len(),
            "pipeline started"
        );
        for stage in &self.stages {
            stage.start();
        }
    }

    /// Triggers the pipeline's cancellation scope.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.scope.trigger(reason);
    }

    /// Returns the derived pipeline state.
    #[must_use]
    pub fn state(&self) -> PipelineState {
        if !self.started.load(Ordering::SeqCst) {
            return PipelineState::Created;
        }
        let mut all_completed = true;
        for stage in &self.stages {
            match stage.state() {
                StageState::Faulted => return PipelineState::Faulted,
                StageState::Completed => {}
                _ => all_completed = false,
            }
        }
        if all_completed {
            PipelineState::Completed
        } else {
            PipelineState::Running
        }
    }

    /// Returns the first fault recorded by any stage, if any.
    #[must_use]
    pub fn first_fault(&self) -> Option<FlowError> {
        self.stages.iter().find_map(|stage| stage.first_fault())
    }

    /// Suspends until the pipeline reaches a terminal state.
    ///
    /// Returns the originating error if any stage faulted. Must be called
    /// after [`Pipeline::start`]; an unstarted pipeline never terminates.
    pub async fn wait(&self) -> Result<(), FlowError> {
        let mut receivers: Vec<_> = self
            .stages
            .iter()
            .map(|stage| stage.state_receiver())
            .collect();
        loop {
            match self.state() {
                PipelineState::Completed => return Ok(()),
                PipelineState::Faulted => {
                    return Err(self.first_fault().unwrap_or_else(|| {
                        FlowError::internal("pipeline faulted without a recorded error")
                    }));
                }
                _ => {}
            }
            if receivers.is_empty() {
                return Err(FlowError::internal(
                    "pipeline stages went away before reaching a terminal state",
                ));
            }
            let (changed, index) = {
                let waits: Vec<_> = receivers
                    .iter_mut()
                    .map(|receiver| Box::pin(receiver.changed()))
                    .collect();
                let (changed, index, rest) = futures::future::select_all(waits).await;
                drop(rest);
                (changed, index)
            };
            if changed.is_err() {
                // That stage was dropped; stop watching it.
                receivers.remove(index);
            }
        }
    }

    /// Returns a serializable diagnostic view of the whole pipeline.
    #[must_use]
    pub fn snapshot(&self) -> serde_json::Value {
        json!({
            "identity": serde_json::to_value(&self.identity).unwrap_or(serde_json::Value::Null),
            "state": self.state().as_str(),
            "stages": self.stages.iter().map(|s| s.snapshot()).collect::<Vec<_>>(),
            "links": self.links.iter().map(Link::snapshot).collect::<Vec<_>>(),
        })
    }
}

impl<In, Out> fmt::Debug for Pipeline<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.identity.name)
            .field("state", &self.state())
            .field("stages", &self.stages.len())
            .field("links", &self.links.len())
            .finish()
    }
}
