//! Per-channel counters for backpressure monitoring.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters tracking a channel's admissions, deliveries, and drops.
#[derive(Debug, Default)]
pub struct ChannelMetrics {
    /// Items admitted to the channel (buffered or handed off).
    written: AtomicU64,
    /// Items delivered to a reader.
    delivered: AtomicU64,
    /// Buffered items evicted under `DropOldest`.
    dropped_oldest: AtomicU64,
    /// Incoming items discarded under `DropWrite` (or a full rendezvous).
    dropped_writes: AtomicU64,
    /// Writes rejected because the channel was closed or at capacity.
    rejected: AtomicU64,
}

impl ChannelMetrics {
    pub(crate) fn record_written(&self) {
        self.written.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped_oldest(&self) {
        self.dropped_oldest.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped_write(&self) {
        self.dropped_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of items admitted to the channel.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Returns the number of items delivered to readers.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Returns the number of buffered items evicted under `DropOldest`.
    #[must_use]
    pub fn dropped_oldest(&self) -> u64 {
        self.dropped_oldest.load(Ordering::Relaxed)
    }

    /// Returns the number of incoming items discarded under `DropWrite`.
    #[must_use]
    pub fn dropped_writes(&self) -> u64 {
        self.dropped_writes.load(Ordering::Relaxed)
    }

    /// Returns the number of rejected writes.
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Returns the total number of items dropped by overflow policy.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped_oldest() + self.dropped_writes()
    }

    /// Converts metrics to a dictionary.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::json!({
            "written": self.written(),
            "delivered": self.delivered(),
            "dropped_oldest": self.dropped_oldest(),
            "dropped_writes": self.dropped_writes(),
            "rejected": self.rejected(),
        })
    }
}
