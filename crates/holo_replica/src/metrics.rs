//! In-process counters for chunked state transfers.
//!
//! Updated from the control-message thread and from loader workers, so every
//! counter is a relaxed atomic; readers take a [`TransferMetricsSnapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for inbound state transfers of one replicated service.
#[derive(Debug, Default)]
pub struct TransferMetrics {
    /// Begin-transfer messages that registered a new transfer.
    started: AtomicU64,
    /// Transfers whose state loader returned successfully.
    completed: AtomicU64,
    /// Transfers whose state loader failed.
    failed: AtomicU64,
    /// Transfers force-terminated by a second begin for the same key.
    overridden: AtomicU64,
    /// Transfers abandoned because their sender left the view.
    swept: AtomicU64,
    chunks_received: AtomicU64,
    /// Chunks for unknown or already finished transfers.
    chunks_dropped: AtomicU64,
    bytes_received: AtomicU64,
}

/// Immutable snapshot view of [`TransferMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferMetricsSnapshot {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub overridden: u64,
    pub swept: u64,
    pub chunks_received: u64,
    pub chunks_dropped: u64,
    pub bytes_received: u64,
}

impl TransferMetrics {
    /// Records one newly registered transfer.
    pub fn record_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one transfer whose state was applied.
    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one transfer whose loader failed or timed out.
    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one transfer replaced by a second begin for the same key.
    pub fn record_overridden(&self) {
        self.overridden.fetch_add(1, Ordering::Relaxed);
    }

    /// Records `transfers` abandoned after their sender left the view.
    pub fn record_swept(&self, transfers: u64) {
        self.swept.fetch_add(transfers, Ordering::Relaxed);
    }

    /// Records one chunk of `bytes` handed to a loader.
    pub fn record_chunk(&self, bytes: usize) {
        self.chunks_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Records one chunk discarded without reaching a loader.
    pub fn record_dropped_chunk(&self) {
        self.chunks_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of every counter.
    pub fn snapshot(&self) -> TransferMetricsSnapshot {
        TransferMetricsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            overridden: self.overridden.load(Ordering::Relaxed),
            swept: self.swept.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_events() {
        let metrics = TransferMetrics::default();
        metrics.record_started();
        metrics.record_chunk(10);
        metrics.record_chunk(5);
        metrics.record_dropped_chunk();
        metrics.record_swept(2);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.started, 1);
        assert_eq!(snapshot.chunks_received, 2);
        assert_eq!(snapshot.bytes_received, 15);
        assert_eq!(snapshot.chunks_dropped, 1);
        assert_eq!(snapshot.swept, 2);
        assert_eq!(snapshot.completed, 0);
    }
}
