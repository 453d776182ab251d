//! Memoized asynchronous values with retry on failure.

use crate::errors::FlowError;
use parking_lot::Mutex;
use std::future::Future;
use tokio::sync::Notify;

enum MemoState<T> {
    Empty,
    Computing,
    Ready(T),
    Failed(FlowError),
}

/// A lazily-computed, memoized value.
///
/// The first caller computes; concurrent callers wait for the result. A
/// failed computation is returned to everyone already waiting, and the next
/// call retries instead of caching the failure - there is no poisoning.
pub struct Memoized<T> {
    state: Mutex<MemoState<T>>,
    notify: Notify,
}

impl<T: Clone> Memoized<T> {
    /// Creates an empty cell.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoState::Empty),
            notify: Notify::new(),
        }
    }

    /// Returns the value if it is ready.
    #[must_use]
    pub fn get(&self) -> Option<T> {
        match &*self.state.lock() {
            MemoState::Ready(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Returns true once a value is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(&*self.state.lock(), MemoState::Ready(_))
    }

    /// Explicitly clears the cell so the next call recomputes. A computation
    /// in flight is left to finish; its result lands normally.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        if !matches!(*state, MemoState::Computing) {
            *state = MemoState::Empty;
        }
    }

    /// Returns the memoized value, computing it with `compute` if necessary.
    ///
    /// Exactly one caller runs `compute` per attempt; concurrent callers
    /// suspend until it resolves and share the outcome.
    pub async fn get_or_compute<F, Fut>(&self, compute: F) -> Result<T, FlowError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        enum Role<T> {
            Use(T),
            Fail(FlowError),
            Compute,
            Wait,
        }

        let mut compute = Some(compute);
        let mut waited = false;
        loop {
            let role = {
                let mut state = self.state.lock();
                match &*state {
                    MemoState::Ready(value) => Role::Use(value.clone()),
                    MemoState::Computing => Role::Wait,
                    MemoState::Empty => {
                        *state = MemoState::Computing;
                        Role::Compute
                    }
                    MemoState::Failed(error) => {
                        if waited {
                            // This caller observed the attempt it was waiting
                            // on fail; the error is its answer.
                            Role::Fail(error.clone())
                        } else {
                            *state = MemoState::Computing;
                            Role::Compute
                        }
                    }
                }
            };
            match role {
                Role::Use(value) => return Ok(value),
                Role::Fail(error) => return Err(error),
                Role::Compute => {
                    let Some(compute) = compute.take() else {
                        return Err(FlowError::internal("memoized computation ran twice"));
                    };
                    match compute().await {
                        Ok(value) => {
                            *self.state.lock() = MemoState::Ready(value.clone());
                            self.notify.notify_waiters();
                            return Ok(value);
                        }
                        Err(cause) => {
                            let error = FlowError::internal(format!(
                                "memoized computation failed: {cause}"
                            ));
                            *self.state.lock() = MemoState::Failed(error.clone());
                            self.notify.notify_waiters();
                            return Err(error);
                        }
                    }
                }
                Role::Wait => {
                    let notified = self.notify.notified();
                    tokio::pin!(notified);
                    // Register interest before re-checking, so a notification
                    // landing in between is not missed.
                    notified.as_mut().enable();
                    if matches!(&*self.state.lock(), MemoState::Computing) {
                        notified.await;
                    }
                    waited = true;
                }
            }
        }
    }
}

impl<T: Clone> Default for Memoized<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Memoized<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.state.lock() {
            MemoState::Empty => "empty",
            MemoState::Computing => "computing",
            MemoState::Ready(_) => "ready",
            MemoState::Failed(_) => "failed",
        };
        f.debug_struct("Memoized").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_computes_once() {
        let memo = Memoized::new();
        let runs = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = memo
                .get_or_compute(|| async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                })
                .await
                .unwrap();
            assert_eq!(value, 42);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(memo.get(), Some(42));
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_computation() {
        let memo = Arc::new(Memoized::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let memo = memo.clone();
                let runs = runs.clone();
                tokio::spawn(async move {
                    memo.get_or_compute(|| async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok(7u32)
                    })
                    .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), 7);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_retries_on_next_call() {
        let memo = Memoized::new();
        let runs = AtomicUsize::new(0);

        let first = memo
            .get_or_compute(|| async {
                runs.fetch_add(1, Ordering::SeqCst);
                bail!("not yet")
            })
            .await;
        assert!(first.is_err());
        assert!(!memo.is_ready());

        let second = memo
            .get_or_compute(|| async {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(9)
            })
            .await
            .unwrap();
        assert_eq!(second, 9);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reset_clears_ready_value() {
        let memo = Memoized::new();
        memo.get_or_compute(|| async { Ok(1) }).await.unwrap();
        assert!(memo.is_ready());
        memo.reset();
        assert!(!memo.is_ready());
        let value = memo.get_or_compute(|| async { Ok(2) }).await.unwrap();
        assert_eq!(value, 2);
    }
}
