//! Error types for the conflux channel and pipeline primitives.
//!
//! Faults are first-class values here: a single fault recorded on a channel
//! is observed by every subsequent reader, so every error in this taxonomy
//! is cheaply cloneable (underlying causes are shared behind an `Arc`).

use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// A shared, type-erased error cause.
///
/// Transform failures originate as `anyhow::Error` at the user boundary and
/// are converted once, then shared by every observer of the fault.
pub type SharedCause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// The unified fault type flowing through channels, stages, and pipelines.
#[derive(Debug, Clone, Error)]
pub enum FlowError {
    /// A stage transform failed on an item.
    #[error(transparent)]
    Transform(#[from] TransformError),

    /// A cancellation scope was triggered.
    #[error(transparent)]
    Canceled(#[from] CanceledError),

    /// An operation was attempted against a completed channel with nothing
    /// left to deliver.
    #[error(transparent)]
    ClosedChannel(#[from] ClosedChannelError),

    /// A non-suspending write found a full channel under the `Wait` policy.
    #[error(transparent)]
    CapacityExceeded(#[from] CapacityExceededError),

    /// A configuration or topology value failed validation.
    #[error(transparent)]
    Validation(#[from] ConfigValidationError),

    /// A cycle was detected in a pipeline topology.
    #[error(transparent)]
    CycleDetected(#[from] CycleDetectedError),

    /// An internal invariant was violated (e.g. a worker task panicked).
    #[error("internal error: {0}")]
    Internal(String),
}

impl FlowError {
    /// Creates a canceled error with the given reason.
    #[must_use]
    pub fn canceled(reason: impl Into<String>) -> Self {
        Self::Canceled(CanceledError::new(reason))
    }

    /// Creates a closed-channel error.
    #[must_use]
    pub fn closed() -> Self {
        Self::ClosedChannel(ClosedChannelError)
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this fault originated from a cancellation scope.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled(_))
    }

    /// Returns true if this is a closed-channel error.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ClosedChannel(_))
    }

    /// Returns true if this fault originated from a failing transform.
    #[must_use]
    pub fn is_transform(&self) -> bool {
        matches!(self, Self::Transform(_))
    }

    /// Returns a stable short name for the error kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transform(_) => "transform",
            Self::Canceled(_) => "canceled",
            Self::ClosedChannel(_) => "closed_channel",
            Self::CapacityExceeded(_) => "capacity_exceeded",
            Self::Validation(_) => "validation",
            Self::CycleDetected(_) => "cycle_detected",
            Self::Internal(_) => "internal",
        }
    }

    /// Converts to a dictionary representation for diagnostics.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        json!({
            "kind": self.kind(),
            "message": self.to_string(),
        })
    }
}

/// Error raised when a stage transform fails on an item.
///
/// Carries a `Debug` rendering of the failing input (truncated) and the
/// underlying cause.
#[derive(Debug, Clone, Error)]
#[error("transform failed in stage '{stage}' on input {input}: {source}")]
pub struct TransformError {
    /// The stage whose transform failed.
    pub stage: String,
    /// A `Debug` rendering of the failing input.
    pub input: String,
    /// The underlying cause, shared across fault observers.
    #[source]
    source: SharedCause,
}

impl TransformError {
    /// Creates a new transform error from an `anyhow` cause.
    #[must_use]
    pub fn new(stage: impl Into<String>, input: impl Into<String>, cause: anyhow::Error) -> Self {
        Self {
            stage: stage.into(),
            input: input.into(),
            source: Arc::from(Box::<dyn std::error::Error + Send + Sync>::from(cause)),
        }
    }

    /// Returns the underlying cause.
    #[must_use]
    pub fn cause(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self.source.as_ref()
    }
}

/// Error raised when a cancellation scope is triggered.
#[derive(Debug, Clone, Error)]
#[error("canceled: {reason}")]
pub struct CanceledError {
    /// The reason given when the scope was triggered.
    pub reason: String,
    /// The scope that was triggered, if known.
    pub scope_id: Option<Uuid>,
}

impl CanceledError {
    /// Creates a new canceled error.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            scope_id: None,
        }
    }

    /// Sets the triggering scope id.
    #[must_use]
    pub fn with_scope_id(mut self, scope_id: Uuid) -> Self {
        self.scope_id = Some(scope_id);
        self
    }
}

/// Error raised when reading from or writing to a channel that has been
/// completed and fully drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("channel is closed")]
pub struct ClosedChannelError;

/// Error raised by a non-suspending write against a full channel under the
/// `Wait` overflow policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("channel is at capacity")]
pub struct CapacityExceededError;

/// Error raised when a configuration value or pipeline topology fails
/// validation.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ConfigValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved, if any.
    pub stages: Vec<String>,
}

impl ConfigValidationError {
    /// Creates a new validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }
}

/// Error raised when a cycle is detected in a pipeline topology.
#[derive(Debug, Clone, Error)]
#[error("cycle detected in pipeline topology: {}", path.join(" -> "))]
pub struct CycleDetectedError {
    /// The stage/link labels forming the cycle.
    pub path: Vec<String>,
}

impl CycleDetectedError {
    /// Creates a new cycle error from the labels forming the cycle.
    #[must_use]
    pub fn new(path: Vec<String>) -> Self {
        Self { path }
    }
}

const MAX_INPUT_RENDERING: usize = 256;

/// Renders a value with `Debug`, truncated for storage inside an error.
pub(crate) fn debug_repr<T: std::fmt::Debug>(value: &T) -> String {
    let mut rendered = format!("{value:?}");
    if rendered.len() > MAX_INPUT_RENDERING {
        let mut end = MAX_INPUT_RENDERING;
        while !rendered.is_char_boundary(end) {
            end -= 1;
        }
        rendered.truncate(end);
        rendered.push_str("...");
    }
    rendered
}
