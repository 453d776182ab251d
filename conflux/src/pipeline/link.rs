//! Links: forwarding rules between channels with completion and fault
//! propagation.

use crate::channel::Channel;
use crate::errors::FlowError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Propagation flags for a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkOptions {
    /// Whether the source's completion closes the target (after the source
    /// is fully drained into it).
    pub propagate_completion: bool,
    /// Whether a source fault faults the target.
    pub propagate_fault: bool,
}

impl LinkOptions {
    /// Creates link options with explicit flags.
    #[must_use]
    pub fn new(propagate_completion: bool, propagate_fault: bool) -> Self {
        Self {
            propagate_completion,
            propagate_fault,
        }
    }

    /// Propagates both completion and faults.
    #[must_use]
    pub fn propagate_all() -> Self {
        Self::new(true, true)
    }

    /// Forwards items only; the target is left open on this edge.
    #[must_use]
    pub fn forward_only() -> Self {
        Self::new(false, false)
    }
}

/// AND-join for fan-in targets.
///
/// Every link created with `propagate_completion = true` registers here;
/// the target is completed only once every registered contributor has
/// arrived. Faults bypass the join entirely (OR-short-circuit): the first
/// one faults the target directly and channel idempotence makes it win.
pub struct CompletionJoin<T> {
    target: Arc<Channel<T>>,
    pending: AtomicUsize,
}

impl<T> CompletionJoin<T> {
    /// Creates a join for the given target channel.
    #[must_use]
    pub fn new(target: Arc<Channel<T>>) -> Self {
        Self {
            target,
            pending: AtomicUsize::new(0),
        }
    }

    /// Registers one contributing link. Must happen before the link's pump
    /// can observe its source completing.
    pub fn register(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    /// Marks one contributor complete; the last arrival closes the target.
    pub fn arrive(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.target.complete();
        }
    }

    /// Returns the number of contributors still outstanding.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

/// A running forwarding rule from a source channel to a target channel.
///
/// The pump drains every item the source delivers - including items
/// buffered before a completion or fault signal - so nothing written by the
/// source is lost to the propagation.
pub struct Link {
    label: String,
    options: LinkOptions,
    forwarded: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl Link {
    /// Spawns the pump task for a new link.
    pub fn spawn<T: Send + 'static>(
        label: impl Into<String>,
        source: Arc<Channel<T>>,
        target: Arc<Channel<T>>,
        options: LinkOptions,
        join: Arc<CompletionJoin<T>>,
    ) -> Self {
        let label = label.into();
        if options.propagate_completion {
            join.register();
        }
        let forwarded = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(pump(
            label.clone(),
            source,
            target,
            options,
            join,
            forwarded.clone(),
        ));
        Self {
            label,
            options,
            forwarded,
            task,
        }
    }

    /// Returns the link label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns the link's propagation flags.
    #[must_use]
    pub fn options(&self) -> LinkOptions {
        self.options
    }

    /// Returns the number of items forwarded so far.
    #[must_use]
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Returns true once the pump task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Returns a serializable diagnostic view of the link.
    #[must_use]
    pub fn snapshot(&self) -> serde_json::Value {
        json!({
            "label": self.label,
            "propagate_completion": self.options.propagate_completion,
            "propagate_fault": self.options.propagate_fault,
            "forwarded": self.forwarded(),
            "finished": self.is_finished(),
        })
    }
}

async fn pump<T: Send + 'static>(
    label: String,
    source: Arc<Channel<T>>,
    target: Arc<Channel<T>>,
    options: LinkOptions,
    join: Arc<CompletionJoin<T>>,
    forwarded: Arc<AtomicU64>,
) {
    loop {
        match source.read().await {
            Ok(item) => match target.write(item).await {
                Ok(()) => {
                    forwarded.fetch_add(1, Ordering::Relaxed);
                }
                Err(error) => {
                    // The target refused the item. The source is left to run
                    // to its own completion; teardown is cancellation's job.
                    warn!(link = %label, error = %error, "target refused item; link stopped");
                    break;
                }
            },
            Err(FlowError::ClosedChannel(_)) => {
                if options.propagate_completion {
                    debug!(link = %label, "source drained; completion propagated");
                    join.arrive();
                }
                break;
            }
            Err(fault) => {
                if options.propagate_fault {
                    debug!(link = %label, error = %fault, "source drained; fault propagated");
                    target.fault(fault);
                } else {
                    debug!(link = %label, error = %fault, "source faulted; fault not propagated");
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Capacity, ChannelStatus, OverflowPolicy};

    fn unbounded() -> Arc<Channel<u32>> {
        Arc::new(Channel::new(Capacity::Unbounded, OverflowPolicy::Wait))
    }

    #[tokio::test]
    async fn test_link_forwards_then_completes_after_drain() {
        let source = unbounded();
        let target = unbounded();
        let join = Arc::new(CompletionJoin::new(target.clone()));
        let link = Link::spawn(
            "a->b",
            source.clone(),
            target.clone(),
            LinkOptions::propagate_all(),
            join,
        );

        for i in 0..3 {
            source.write(i).await.unwrap();
        }
        source.complete();

        for i in 0..3 {
            assert_eq!(target.read().await.unwrap(), i);
        }
        assert!(target.read().await.unwrap_err().is_closed());
        assert_eq!(link.forwarded(), 3);
    }

    #[tokio::test]
    async fn test_link_propagates_fault_after_drain() {
        let source = unbounded();
        let target = unbounded();
        let join = Arc::new(CompletionJoin::new(target.clone()));
        let _link = Link::spawn(
            "a->b",
            source.clone(),
            target.clone(),
            LinkOptions::propagate_all(),
            join,
        );

        source.write(7).await.unwrap();
        source.fault(FlowError::canceled("boom"));

        // The buffered item arrives before the fault surfaces.
        assert_eq!(target.read().await.unwrap(), 7);
        assert!(target.read().await.unwrap_err().is_canceled());
    }

    #[tokio::test]
    async fn test_forward_only_leaves_target_open() {
        let source = unbounded();
        let target = unbounded();
        let join = Arc::new(CompletionJoin::new(target.clone()));
        let link = Link::spawn(
            "a->b",
            source.clone(),
            target.clone(),
            LinkOptions::forward_only(),
            join,
        );

        source.write(1).await.unwrap();
        source.complete();
        assert_eq!(target.read().await.unwrap(), 1);

        // The pump has exited without closing the target.
        while !link.is_finished() {
            tokio::task::yield_now().await;
        }
        assert_eq!(target.status(), ChannelStatus::Open);
    }

    #[tokio::test]
    async fn test_and_join_completes_after_all_contributors() {
        let target = unbounded();
        let join = Arc::new(CompletionJoin::new(target.clone()));
        let s1 = unbounded();
        let s2 = unbounded();
        let l1 = Link::spawn(
            "s1->t",
            s1.clone(),
            target.clone(),
            LinkOptions::propagate_all(),
            join.clone(),
        );
        let _l2 = Link::spawn(
            "s2->t",
            s2.clone(),
            target.clone(),
            LinkOptions::propagate_all(),
            join.clone(),
        );

        s1.write(1).await.unwrap();
        s1.complete();
        assert_eq!(target.read().await.unwrap(), 1);

        while !l1.is_finished() {
            tokio::task::yield_now().await;
        }
        // One contributor is still open, so the target must be too.
        assert_eq!(target.status(), ChannelStatus::Open);
        assert_eq!(join.pending(), 1);

        s2.write(2).await.unwrap();
        s2.complete();
        assert_eq!(target.read().await.unwrap(), 2);
        assert!(target.read().await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_fan_in_fault_short_circuits() {
        let target = unbounded();
        let join = Arc::new(CompletionJoin::new(target.clone()));
        let s1 = unbounded();
        let s2 = unbounded();
        let _l1 = Link::spawn(
            "s1->t",
            s1.clone(),
            target.clone(),
            LinkOptions::propagate_all(),
            join.clone(),
        );
        let _l2 = Link::spawn(
            "s2->t",
            s2.clone(),
            target.clone(),
            LinkOptions::propagate_all(),
            join,
        );

        // One faulting contributor is enough, even though the other is open.
        s1.fault(FlowError::internal("bad branch"));
        assert!(matches!(
            target.read().await.unwrap_err(),
            FlowError::Internal(_)
        ));
    }

    #[tokio::test]
    async fn test_link_snapshot_shape() {
        let source = unbounded();
        let target = unbounded();
        let join = Arc::new(CompletionJoin::new(target.clone()));
        let link = Link::spawn("edge", source, target, LinkOptions::propagate_all(), join);
        let snapshot = link.snapshot();
        assert_eq!(snapshot["label"], "edge");
        assert_eq!(snapshot["propagate_completion"], true);
        assert_eq!(snapshot["forwarded"], 0);
    }
}
