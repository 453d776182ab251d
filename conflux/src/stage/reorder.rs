//! Sequence-ordered release of stage outputs.

use crate::channel::Channel;
use crate::errors::FlowError;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

/// Buffers out-of-order outputs and releases them strictly in sequence.
///
/// An output arriving ahead of its predecessors waits in the buffer; the
/// output that fills the gap releases every consecutive successor. The lock
/// is held across the downstream write so no later sequence can slip in
/// between releases.
pub(crate) struct ReorderBuffer<T> {
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    next: u64,
    pending: BTreeMap<u64, T>,
}

impl<T> ReorderBuffer<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next: 0,
                pending: BTreeMap::new(),
            }),
        }
    }

    /// Stores `item` under `seq` and writes every consecutively-ready output
    /// to `output` in sequence order.
    pub(crate) async fn release(
        &self,
        seq: u64,
        item: T,
        output: &Channel<T>,
    ) -> Result<(), FlowError> {
        let mut inner = self.inner.lock().await;
        inner.pending.insert(seq, item);
        loop {
            let next = inner.next;
            let Some(ready) = inner.pending.remove(&next) else {
                break;
            };
            output.write(ready).await?;
            inner.next += 1;
        }
        Ok(())
    }
}
