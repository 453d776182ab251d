//! The core channel: a policy-driven FIFO queue with completion and fault
//! signals.
//!
//! All buffer, waiter, and lifecycle state lives under one mutex. Suspending
//! operations register a one-shot rendezvous slot while holding the lock and
//! await it after release, so every wakeup is a direct hand-off from the
//! operation that freed capacity or produced an item - there is no window in
//! which a wakeup can be missed.

use super::metrics::ChannelMetrics;
use super::policy::{Capacity, OverflowPolicy};
use crate::errors::{ClosedChannelError, FlowError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Lifecycle of a channel. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Accepting writes and reads.
    Open,
    /// No new writes; buffered items are still being drained.
    Completing,
    /// Terminally faulted; buffered items drain, then reads surface the fault.
    Faulted,
    /// Terminally closed with nothing left to deliver.
    Completed,
}

/// Error returned by a non-suspending write. The rejected item is handed
/// back to the caller.
#[derive(Debug)]
pub enum TryWriteError<T> {
    /// The channel was full under the `Wait` policy.
    Full(T),
    /// The channel no longer accepts writes.
    Closed(T),
}

impl<T> TryWriteError<T> {
    /// Recovers the rejected item.
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(item) | Self::Closed(item) => item,
        }
    }

    /// Returns true if the write was rejected for lack of capacity.
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full(_))
    }
}

impl<T> fmt::Display for TryWriteError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => write!(f, "channel is at capacity"),
            Self::Closed(_) => write!(f, "channel is closed"),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for TryWriteError<T> {}

impl<T> From<TryWriteError<T>> for FlowError {
    fn from(err: TryWriteError<T>) -> Self {
        match err {
            TryWriteError::Full(_) => crate::errors::CapacityExceededError.into(),
            TryWriteError::Closed(_) => ClosedChannelError.into(),
        }
    }
}

/// Error returned by a non-suspending read.
#[derive(Debug, Clone, Error)]
pub enum TryReadError {
    /// No item was buffered, but the channel may still produce one.
    #[error("channel is empty")]
    Empty,
    /// The channel completed and its buffer is drained.
    #[error("channel is closed")]
    Closed,
    /// The channel faulted and its buffer is drained.
    #[error(transparent)]
    Faulted(FlowError),
}

enum Completion {
    Open,
    Completing,
    Faulted(FlowError),
    Completed,
}

impl Completion {
    fn status(&self) -> ChannelStatus {
        match self {
            Self::Open => ChannelStatus::Open,
            Self::Completing => ChannelStatus::Completing,
            Self::Faulted(_) => ChannelStatus::Faulted,
            Self::Completed => ChannelStatus::Completed,
        }
    }

    fn fault(&self) -> Option<&FlowError> {
        match self {
            Self::Faulted(error) => Some(error),
            _ => None,
        }
    }
}

struct WriteWaiter<T> {
    item: T,
    ack: oneshot::Sender<Result<(), FlowError>>,
}

struct ChannelState<T> {
    buffer: VecDeque<T>,
    completion: Completion,
    read_waiters: VecDeque<oneshot::Sender<Result<T, FlowError>>>,
    write_waiters: VecDeque<WriteWaiter<T>>,
}

pub(crate) enum WriteStep {
    Done(Result<(), FlowError>),
    Park(oneshot::Receiver<Result<(), FlowError>>),
}

pub(crate) enum ReadStep<T> {
    Done(Result<T, FlowError>),
    Park(oneshot::Receiver<Result<T, FlowError>>),
}

/// A bounded (or rendezvous, or unbounded) FIFO queue with a configurable
/// overflow policy and a completion/fault signal.
///
/// Items admitted to the buffer are delivered to exactly one reader, in
/// admission order, except where the overflow policy explicitly discards
/// them. Once [`Channel::complete`] or [`Channel::fault`] has been called,
/// no further write is accepted; a faulted channel retains already-admitted
/// items for one final drain before reads surface the fault.
pub struct Channel<T> {
    label: String,
    capacity: Capacity,
    policy: OverflowPolicy,
    state: Mutex<ChannelState<T>>,
    metrics: ChannelMetrics,
}

impl<T> Channel<T> {
    /// Creates a new open channel.
    #[must_use]
    pub fn new(capacity: Capacity, policy: OverflowPolicy) -> Self {
        Self {
            label: "channel".to_string(),
            capacity,
            policy,
            state: Mutex::new(ChannelState {
                buffer: VecDeque::new(),
                completion: Completion::Open,
                read_waiters: VecDeque::new(),
                write_waiters: VecDeque::new(),
            }),
            metrics: ChannelMetrics::default(),
        }
    }

    /// Sets the label used in logs and diagnostics.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Writes an item, suspending under the `Wait` policy while the channel
    /// is full. Under the drop policies this never suspends.
    ///
    /// Fails with [`ClosedChannelError`] if the channel completed (also when
    /// completion arrives while suspended), or with the fault's error if the
    /// channel faulted.
    pub async fn write(&self, item: T) -> Result<(), FlowError> {
        match self.write_step(item) {
            WriteStep::Done(result) => result,
            WriteStep::Park(parked) => match parked.await {
                Ok(result) => result,
                Err(_) => Err(ClosedChannelError.into()),
            },
        }
    }

    /// Writes an item without suspending.
    ///
    /// Under the `Wait` policy a full channel rejects the write with
    /// [`TryWriteError::Full`]; the drop policies resolve the overflow
    /// immediately. A closed channel rejects with [`TryWriteError::Closed`].
    pub fn try_write(&self, item: T) -> Result<(), TryWriteError<T>> {
        let mut state = self.state.lock();
        if !matches!(state.completion, Completion::Open) {
            self.metrics.record_rejected();
            return Err(TryWriteError::Closed(item));
        }
        let item = match Self::hand_to_reader(&mut state, item) {
            Ok(()) => {
                self.metrics.record_written();
                self.metrics.record_delivered();
                return Ok(());
            }
            Err(item) => item,
        };
        if self.capacity.has_room(state.buffer.len()) {
            state.buffer.push_back(item);
            self.metrics.record_written();
            return Ok(());
        }
        match self.policy {
            OverflowPolicy::Wait => {
                self.metrics.record_rejected();
                Err(TryWriteError::Full(item))
            }
            OverflowPolicy::DropOldest => {
                self.admit_evicting(&mut state, item);
                Ok(())
            }
            OverflowPolicy::DropWrite => {
                self.metrics.record_dropped_write();
                debug!(channel = %self.label, "discarded write to full channel");
                Ok(())
            }
        }
    }

    /// Reads the next item, suspending while the channel is empty and open.
    ///
    /// Once the channel is completed and drained, fails with
    /// [`ClosedChannelError`]; once faulted and drained, propagates the
    /// fault's error.
    pub async fn read(&self) -> Result<T, FlowError> {
        match self.read_step() {
            ReadStep::Done(result) => result,
            ReadStep::Park(parked) => match parked.await {
                Ok(result) => result,
                Err(_) => Err(ClosedChannelError.into()),
            },
        }
    }

    /// Reads the next item without suspending.
    ///
    /// Unlike [`Channel::read`], a faulted channel with an empty buffer
    /// surfaces the fault immediately.
    pub fn try_read(&self) -> Result<T, TryReadError> {
        let mut state = self.state.lock();
        if let Some(item) = state.buffer.pop_front() {
            self.metrics.record_delivered();
            self.admit_parked_writers(&mut state);
            Self::finish_completing(&mut state);
            return Ok(item);
        }
        if let Some(writer) = state.write_waiters.pop_front() {
            let _ = writer.ack.send(Ok(()));
            self.metrics.record_written();
            self.metrics.record_delivered();
            return Ok(writer.item);
        }
        match &state.completion {
            Completion::Open => Err(TryReadError::Empty),
            Completion::Completing => {
                state.completion = Completion::Completed;
                Err(TryReadError::Closed)
            }
            Completion::Completed => Err(TryReadError::Closed),
            Completion::Faulted(error) => Err(TryReadError::Faulted(error.clone())),
        }
    }

    /// Stops accepting writes. Buffered items remain readable; the channel
    /// reaches [`ChannelStatus::Completed`] once the buffer drains.
    ///
    /// Idempotent: calls after the first (or after a fault) have no effect.
    /// Writers suspended on a full channel fail with [`ClosedChannelError`].
    pub fn complete(&self) {
        let mut state = self.state.lock();
        if !matches!(state.completion, Completion::Open) {
            return;
        }
        for writer in state.write_waiters.drain(..) {
            self.metrics.record_rejected();
            let _ = writer.ack.send(Err(ClosedChannelError.into()));
        }
        for reader in state.read_waiters.drain(..) {
            let _ = reader.send(Err(ClosedChannelError.into()));
        }
        state.completion = if state.buffer.is_empty() {
            Completion::Completed
        } else {
            Completion::Completing
        };
        debug!(channel = %self.label, buffered = state.buffer.len(), "channel completing");
    }

    /// Faults the channel. Buffered items already admitted remain readable
    /// for one final drain; afterwards reads surface `error`. All suspended
    /// callers are failed with `error`; all further writes are rejected.
    ///
    /// Idempotent: the first terminal transition wins.
    pub fn fault(&self, error: FlowError) {
        let mut state = self.state.lock();
        if !matches!(state.completion, Completion::Open) {
            debug!(channel = %self.label, "ignoring fault after terminal signal");
            return;
        }
        for writer in state.write_waiters.drain(..) {
            self.metrics.record_rejected();
            let _ = writer.ack.send(Err(error.clone()));
        }
        for reader in state.read_waiters.drain(..) {
            let _ = reader.send(Err(error.clone()));
        }
        warn!(channel = %self.label, error = %error, "channel faulted");
        state.completion = Completion::Faulted(error);
    }

    /// Returns the channel's lifecycle status.
    #[must_use]
    pub fn status(&self) -> ChannelStatus {
        self.state.lock().completion.status()
    }

    /// Returns true once the channel no longer accepts writes.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.status() != ChannelStatus::Open
    }

    /// Returns the number of currently buffered items.
    #[must_use]
    pub fn count(&self) -> usize {
        self.state.lock().buffer.len()
    }

    /// Returns the fault recorded on this channel, if any.
    #[must_use]
    pub fn fault_error(&self) -> Option<FlowError> {
        self.state.lock().completion.fault().cloned()
    }

    /// Returns the configured capacity.
    #[must_use]
    pub fn capacity(&self) -> Capacity {
        self.capacity
    }

    /// Returns the configured overflow policy.
    #[must_use]
    pub fn overflow_policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Returns the channel label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns the channel's counters.
    #[must_use]
    pub fn metrics(&self) -> &ChannelMetrics {
        &self.metrics
    }

    pub(crate) fn write_step(&self, item: T) -> WriteStep {
        let mut state = self.state.lock();
        match &state.completion {
            Completion::Open => {}
            Completion::Faulted(error) => {
                self.metrics.record_rejected();
                return WriteStep::Done(Err(error.clone()));
            }
            _ => {
                self.metrics.record_rejected();
                return WriteStep::Done(Err(ClosedChannelError.into()));
            }
        }
        let item = match Self::hand_to_reader(&mut state, item) {
            Ok(()) => {
                self.metrics.record_written();
                self.metrics.record_delivered();
                return WriteStep::Done(Ok(()));
            }
            Err(item) => item,
        };
        if self.capacity.has_room(state.buffer.len()) {
            state.buffer.push_back(item);
            self.metrics.record_written();
            return WriteStep::Done(Ok(()));
        }
        match self.policy {
            OverflowPolicy::Wait => {
                let (ack, parked) = oneshot::channel();
                state.write_waiters.push_back(WriteWaiter { item, ack });
                WriteStep::Park(parked)
            }
            OverflowPolicy::DropOldest => {
                self.admit_evicting(&mut state, item);
                WriteStep::Done(Ok(()))
            }
            OverflowPolicy::DropWrite => {
                self.metrics.record_dropped_write();
                debug!(channel = %self.label, "discarded write to full channel");
                WriteStep::Done(Ok(()))
            }
        }
    }

    pub(crate) fn read_step(&self) -> ReadStep<T> {
        let mut state = self.state.lock();
        if let Some(item) = state.buffer.pop_front() {
            self.metrics.record_delivered();
            self.admit_parked_writers(&mut state);
            Self::finish_completing(&mut state);
            return ReadStep::Done(Ok(item));
        }
        // Empty buffer: take directly from a parked writer (rendezvous hand-off).
        if let Some(writer) = state.write_waiters.pop_front() {
            let _ = writer.ack.send(Ok(()));
            self.metrics.record_written();
            self.metrics.record_delivered();
            return ReadStep::Done(Ok(writer.item));
        }
        match &state.completion {
            Completion::Open => {
                let (slot, parked) = oneshot::channel();
                state.read_waiters.push_back(slot);
                ReadStep::Park(parked)
            }
            Completion::Completing => {
                state.completion = Completion::Completed;
                ReadStep::Done(Err(ClosedChannelError.into()))
            }
            Completion::Completed => ReadStep::Done(Err(ClosedChannelError.into())),
            Completion::Faulted(error) => ReadStep::Done(Err(error.clone())),
        }
    }

    /// Hands `item` to the first parked reader still waiting. A reader that
    /// abandoned its slot returns the value, which goes to the next one.
    fn hand_to_reader(state: &mut ChannelState<T>, item: T) -> Result<(), T> {
        let mut pending = item;
        while let Some(reader) = state.read_waiters.pop_front() {
            match reader.send(Ok(pending)) {
                Ok(()) => return Ok(()),
                Err(returned) => match returned {
                    Ok(value) => pending = value,
                    Err(_) => unreachable!("a rejected hand-off returns the value that was sent"),
                },
            }
        }
        Err(pending)
    }

    /// Admits parked writers into freed buffer slots, one per slot. A writer
    /// whose future was dropped still has its item admitted - the write was
    /// already committed to the waiter queue.
    fn admit_parked_writers(&self, state: &mut ChannelState<T>) {
        while self.capacity.has_room(state.buffer.len()) {
            let Some(writer) = state.write_waiters.pop_front() else {
                break;
            };
            state.buffer.push_back(writer.item);
            self.metrics.record_written();
            let _ = writer.ack.send(Ok(()));
        }
    }

    fn admit_evicting(&self, state: &mut ChannelState<T>, item: T) {
        if state.buffer.pop_front().is_some() {
            state.buffer.push_back(item);
            self.metrics.record_written();
            self.metrics.record_dropped_oldest();
            debug!(channel = %self.label, "evicted oldest buffered item");
        } else {
            // Rendezvous: nothing exists to evict, so the incoming item goes.
            self.metrics.record_dropped_write();
            debug!(channel = %self.label, "discarded write to rendezvous channel");
        }
    }

    fn finish_completing(state: &mut ChannelState<T>) {
        if matches!(state.completion, Completion::Completing)
            && state.buffer.is_empty()
            && state.write_waiters.is_empty()
        {
            state.completion = Completion::Completed;
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("label", &self.label)
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .field("status", &self.status())
            .field("count", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use tokio_test::{assert_pending, assert_ready, task};

    fn bounded(limit: usize, policy: OverflowPolicy) -> Channel<u32> {
        Channel::new(Capacity::bounded(limit), policy)
    }

    #[tokio::test]
    async fn test_fifo_then_closed() {
        let ch = Channel::new(Capacity::Unbounded, OverflowPolicy::Wait);
        for i in 0..5u32 {
            ch.write(i).await.unwrap();
        }
        ch.complete();
        for i in 0..5u32 {
            assert_eq!(ch.read().await.unwrap(), i);
        }
        let err = ch.read().await.unwrap_err();
        assert!(err.is_closed());
        assert_eq!(ch.status(), ChannelStatus::Completed);
    }

    #[tokio::test]
    async fn test_drop_oldest_keeps_newest() {
        let ch = bounded(3, OverflowPolicy::DropOldest);
        for i in 0..7 {
            ch.write(i).await.unwrap();
        }
        ch.complete();
        let mut drained = Vec::new();
        while let Ok(item) = ch.read().await {
            drained.push(item);
        }
        assert_eq!(drained, vec![4, 5, 6]);
        assert_eq!(ch.metrics().dropped_oldest(), 4);
    }

    #[tokio::test]
    async fn test_drop_write_keeps_oldest() {
        let ch = bounded(3, OverflowPolicy::DropWrite);
        for i in 0..7 {
            ch.write(i).await.unwrap();
        }
        ch.complete();
        let mut drained = Vec::new();
        while let Ok(item) = ch.read().await {
            drained.push(item);
        }
        assert_eq!(drained, vec![0, 1, 2]);
        assert_eq!(ch.metrics().dropped_writes(), 4);
    }

    #[tokio::test]
    async fn test_backpressure_write_parks_until_read() {
        let ch = Arc::new(bounded(1, OverflowPolicy::Wait));
        ch.write(7).await.unwrap();

        let writer = ch.clone();
        let mut parked = task::spawn(async move { writer.write(13).await });
        assert_pending!(parked.poll());

        assert_eq!(ch.read().await.unwrap(), 7);
        assert!(parked.is_woken());
        assert_ready!(parked.poll()).unwrap();
        assert_eq!(ch.read().await.unwrap(), 13);
    }

    #[tokio::test]
    async fn test_rendezvous_hand_off() {
        let ch = Arc::new(Channel::new(Capacity::Rendezvous, OverflowPolicy::Wait));
        let writer = ch.clone();
        let mut parked = task::spawn(async move { writer.write(42u32).await });
        assert_pending!(parked.poll());

        assert_eq!(ch.read().await.unwrap(), 42);
        assert_ready!(parked.poll()).unwrap();
        assert_eq!(ch.count(), 0);
    }

    #[tokio::test]
    async fn test_read_parks_until_write() {
        let ch = Arc::new(bounded(4, OverflowPolicy::Wait));
        let reader = ch.clone();
        let mut parked = task::spawn(async move { reader.read().await });
        assert_pending!(parked.poll());

        ch.write(9).await.unwrap();
        assert!(parked.is_woken());
        assert_eq!(assert_ready!(parked.poll()).unwrap(), 9);
    }

    #[tokio::test]
    async fn test_try_write_full_returns_item() {
        let ch = bounded(1, OverflowPolicy::Wait);
        ch.try_write(1).unwrap();
        let err = ch.try_write(2).unwrap_err();
        assert!(err.is_full());
        assert_eq!(err.into_inner(), 2);
        assert_eq!(FlowError::from(ch.try_write(3).unwrap_err()).kind(), "capacity_exceeded");
    }

    #[tokio::test]
    async fn test_try_read_empty_then_item() {
        let ch = bounded(2, OverflowPolicy::Wait);
        assert!(matches!(ch.try_read(), Err(TryReadError::Empty)));
        ch.try_write(5).unwrap();
        assert_eq!(ch.try_read().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_write_after_complete_rejected() {
        let ch = bounded(2, OverflowPolicy::Wait);
        ch.complete();
        assert!(ch.write(1).await.unwrap_err().is_closed());
        let err = ch.try_write(1).unwrap_err();
        assert!(!err.is_full());
        assert_eq!(ch.metrics().rejected(), 2);
    }

    #[tokio::test]
    async fn test_fault_drains_then_surfaces() {
        let ch = bounded(4, OverflowPolicy::Wait);
        ch.write(1).await.unwrap();
        ch.write(2).await.unwrap();
        ch.fault(FlowError::canceled("stop"));

        // Already-admitted items remain readable.
        assert_eq!(ch.read().await.unwrap(), 1);
        assert_eq!(ch.read().await.unwrap(), 2);
        // Afterwards the fault surfaces.
        assert!(ch.read().await.unwrap_err().is_canceled());
        // Writes are rejected with the fault's error.
        assert!(ch.write(3).await.unwrap_err().is_canceled());
        assert_eq!(ch.status(), ChannelStatus::Faulted);
    }

    #[tokio::test]
    async fn test_try_read_on_faulted_empty_surfaces_immediately() {
        let ch: Channel<u32> = bounded(4, OverflowPolicy::Wait);
        ch.fault(FlowError::canceled("stop"));
        assert!(matches!(ch.try_read(), Err(TryReadError::Faulted(_))));
    }

    #[tokio::test]
    async fn test_fault_unblocks_suspended_reader() {
        let ch: Arc<Channel<u32>> = Arc::new(bounded(4, OverflowPolicy::Wait));
        let reader = ch.clone();
        let mut parked = task::spawn(async move { reader.read().await });
        assert_pending!(parked.poll());

        ch.fault(FlowError::canceled("deadline"));
        assert!(parked.is_woken());
        assert!(assert_ready!(parked.poll()).unwrap_err().is_canceled());
    }

    #[tokio::test]
    async fn test_complete_unblocks_suspended_writer() {
        let ch = Arc::new(bounded(1, OverflowPolicy::Wait));
        ch.write(1).await.unwrap();
        let writer = ch.clone();
        let mut parked = task::spawn(async move { writer.write(2).await });
        assert_pending!(parked.poll());

        ch.complete();
        assert!(parked.is_woken());
        assert!(assert_ready!(parked.poll()).unwrap_err().is_closed());
        // The buffered item is still delivered.
        assert_eq!(ch.read().await.unwrap(), 1);
        assert!(ch.read().await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_complete_and_fault_are_idempotent() {
        let ch = bounded(2, OverflowPolicy::Wait);
        ch.write(1).await.unwrap();
        ch.complete();
        ch.complete();
        ch.fault(FlowError::canceled("late"));
        assert_eq!(ch.status(), ChannelStatus::Completing);
        assert_eq!(ch.read().await.unwrap(), 1);
        assert_eq!(ch.status(), ChannelStatus::Completed);

        let faulty: Channel<u32> = bounded(2, OverflowPolicy::Wait);
        faulty.fault(FlowError::canceled("first"));
        faulty.fault(FlowError::internal("second"));
        assert!(faulty.fault_error().is_some_and(|e| e.is_canceled()));
    }

    #[tokio::test]
    async fn test_drop_policies_never_suspend() {
        let ch = bounded(1, OverflowPolicy::DropOldest);
        ch.write(1).await.unwrap();
        ch.write(2).await.unwrap();
        assert_eq!(ch.read().await.unwrap(), 2);

        let ch = bounded(1, OverflowPolicy::DropWrite);
        ch.write(1).await.unwrap();
        ch.write(2).await.unwrap();
        assert_eq!(ch.read().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_completing_transitions_after_fault_still_first_wins() {
        let ch = bounded(2, OverflowPolicy::Wait);
        ch.write(1).await.unwrap();
        ch.fault(FlowError::internal("boom"));
        // Completion after a fault has no effect.
        ch.complete();
        assert_eq!(ch.status(), ChannelStatus::Faulted);
        assert_eq!(ch.read().await.unwrap(), 1);
        assert!(matches!(ch.read().await.unwrap_err(), FlowError::Internal(_)));
    }
}
