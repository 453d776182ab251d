//! Deadline-driven cancellation.
//!
//! A timeout is a scheduled scope trigger: once the deadline passes, the
//! scope fires and every suspended read/write within its reach resolves to
//! a `Canceled` failure through the ordinary fault path.

use super::CancellationScope;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

/// Schedules `scope.trigger(reason)` after `delay`.
///
/// Aborting the returned handle abandons the schedule; triggering the scope
/// earlier by other means makes the scheduled trigger a no-op.
pub fn cancel_after(
    scope: &Arc<CancellationScope>,
    delay: Duration,
    reason: impl Into<String>,
) -> JoinHandle<()> {
    cancel_at(scope, Instant::now() + delay, reason)
}

/// Schedules `scope.trigger(reason)` at `deadline`.
pub fn cancel_at(
    scope: &Arc<CancellationScope>,
    deadline: Instant,
    reason: impl Into<String>,
) -> JoinHandle<()> {
    let scope = scope.clone();
    let reason = reason.into();
    tokio::spawn(async move {
        sleep_until(deadline).await;
        scope.trigger(reason);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_after_triggers() {
        let scope = CancellationScope::new();
        let handle = cancel_after(&scope, Duration::from_millis(10), "deadline");
        handle.await.unwrap();
        assert!(scope.is_triggered());
        assert_eq!(scope.reason(), Some("deadline".to_string()));
    }

    #[tokio::test]
    async fn test_aborted_schedule_never_fires() {
        let scope = CancellationScope::new();
        let handle = cancel_after(&scope, Duration::from_secs(60), "too late");
        handle.abort();
        let _ = handle.await;
        assert!(!scope.is_triggered());
    }

    #[tokio::test]
    async fn test_earlier_trigger_wins() {
        let scope = CancellationScope::new();
        let handle = cancel_after(&scope, Duration::from_millis(10), "deadline");
        scope.trigger("manual");
        handle.await.unwrap();
        assert_eq!(scope.reason(), Some("manual".to_string()));
    }
}
