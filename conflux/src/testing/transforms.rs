//! Mock transforms for exercising stages and pipelines.

use crate::stage::Transform;
use anyhow::bail;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt::Debug;
use std::time::Duration;

/// A pass-through transform that records every item it sees.
pub struct RecordingTransform<T> {
    seen: Mutex<Vec<T>>,
}

impl<T: Clone> RecordingTransform<T> {
    /// Creates a new recording transform.
    #[must_use]
    pub fn new() -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Returns the items recorded so far.
    #[must_use]
    pub fn seen(&self) -> Vec<T> {
        self.seen.lock().clone()
    }
}

impl<T: Clone> Default for RecordingTransform<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> Transform<T, T> for RecordingTransform<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn apply(&self, input: T) -> anyhow::Result<T> {
        self.seen.lock().push(input.clone());
        Ok(input)
    }
}

/// A pass-through transform that fails on items matching a predicate.
pub struct FailingTransform<F> {
    trip: F,
}

impl<F> FailingTransform<F> {
    /// Creates a transform failing whenever `trip` returns true.
    pub fn when(trip: F) -> Self {
        Self { trip }
    }
}

#[async_trait]
impl<T, F> Transform<T, T> for FailingTransform<F>
where
    T: Debug + Send + 'static,
    F: Fn(&T) -> bool + Send + Sync,
{
    async fn apply(&self, input: T) -> anyhow::Result<T> {
        if (self.trip)(&input) {
            bail!("injected failure on {input:?}");
        }
        Ok(input)
    }
}

/// A pass-through transform that sleeps before forwarding.
#[derive(Debug, Clone)]
pub struct SlowTransform {
    delay: Duration,
}

impl SlowTransform {
    /// Creates a transform sleeping `delay` per item.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl<T> Transform<T, T> for SlowTransform
where
    T: Send + 'static,
{
    async fn apply(&self, input: T) -> anyhow::Result<T> {
        tokio::time::sleep(self.delay).await;
        Ok(input)
    }
}
