//! Stages: pools of workers applying a transform between two channels.
//!
//! A [`Stage`] owns an input and an output [`crate::channel::Channel`] and
//! runs a configurable number of concurrent workers, each reading, applying
//! the stage's [`Transform`], and writing the result downstream.

mod config;
mod reorder;
mod runner;

pub use config::StageConfig;
pub use runner::{Stage, StageControl, StageState};

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;

/// Capability trait for a stage's per-item transform.
///
/// A transform may fail; failures fault the owning stage. Local recovery
/// (retries, fallbacks) is the transform's own responsibility - the stage
/// never retries on its behalf.
#[async_trait]
pub trait Transform<In, Out>: Send + Sync {
    /// Applies the transform to one input item.
    async fn apply(&self, input: In) -> anyhow::Result<Out>;
}

/// A transform backed by a synchronous closure.
pub struct FnTransform<F> {
    func: F,
}

impl<F> FnTransform<F> {
    /// Creates a new function-based transform.
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> fmt::Debug for FnTransform<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTransform").finish()
    }
}

#[async_trait]
impl<In, Out, F> Transform<In, Out> for FnTransform<F>
where
    In: Send + 'static,
    Out: Send + 'static,
    F: Fn(In) -> anyhow::Result<Out> + Send + Sync,
{
    async fn apply(&self, input: In) -> anyhow::Result<Out> {
        (self.func)(input)
    }
}

/// A transform backed by an asynchronous closure.
pub struct AsyncFnTransform<F, Fut> {
    func: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> AsyncFnTransform<F, Fut> {
    /// Creates a new async function-based transform.
    pub fn new(func: F) -> Self {
        Self {
            func,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> fmt::Debug for AsyncFnTransform<F, Fut> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncFnTransform").finish()
    }
}

#[async_trait]
impl<In, Out, F, Fut> Transform<In, Out> for AsyncFnTransform<F, Fut>
where
    In: Send + 'static,
    Out: Send + 'static,
    F: Fn(In) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Out>> + Send,
{
    async fn apply(&self, input: In) -> anyhow::Result<Out> {
        (self.func)(input).await
    }
}
