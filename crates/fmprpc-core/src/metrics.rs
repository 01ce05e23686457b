//! Per-transport counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
/// Snapshot of transport metrics at a point in time.
pub struct MetricsSnapshot {
    /// Frames written to the stream.
    pub frames_sent: u64,
    /// Frames read from the stream.
    pub frames_received: u64,
    /// Total bytes written.
    pub bytes_sent: u64,
    /// Total bytes read.
    pub bytes_received: u64,
    /// Calls issued by the dispatcher.
    pub calls_sent: u64,
    /// Notifications issued by the dispatcher.
    pub notifies_sent: u64,
    /// Cancel frames queued for abandoned calls.
    pub cancels_sent: u64,
    /// Calls and notifications handed to the receiver.
    pub requests_received: u64,
    /// Responses written by the receiver.
    pub replies_sent: u64,
    /// Responses that matched an outstanding call.
    pub replies_received: u64,
    /// Responses with no matching call.
    pub unexpected_replies: u64,
    /// Frames that failed to decode.
    pub decode_errors: u64,
}

/// Thread-safe transport counters.
#[derive(Default)]
pub struct TransportMetrics {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    calls_sent: AtomicU64,
    notifies_sent: AtomicU64,
    cancels_sent: AtomicU64,
    requests_received: AtomicU64,
    replies_sent: AtomicU64,
    replies_received: AtomicU64,
    unexpected_replies: AtomicU64,
    decode_errors: AtomicU64,
}

impl std::fmt::Debug for TransportMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl TransportMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one written frame of `bytes` bytes.
    pub fn frame_sent(&self, bytes: u64) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records one read frame of `bytes` bytes.
    pub fn frame_received(&self, bytes: u64) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_calls_sent(&self) {
        self.calls_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_notifies_sent(&self) {
        self.notifies_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cancels_sent(&self) {
        self.cancels_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_requests_received(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_replies_sent(&self) {
        self.replies_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_replies_received(&self) {
        self.replies_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_unexpected_replies(&self) {
        self.unexpected_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_decode_errors(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a snapshot of all current metric values.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            calls_sent: self.calls_sent.load(Ordering::Relaxed),
            notifies_sent: self.notifies_sent.load(Ordering::Relaxed),
            cancels_sent: self.cancels_sent.load(Ordering::Relaxed),
            requests_received: self.requests_received.load(Ordering::Relaxed),
            replies_sent: self.replies_sent.load(Ordering::Relaxed),
            replies_received: self.replies_received.load(Ordering::Relaxed),
            unexpected_replies: self.unexpected_replies.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_metrics_zeroed() {
        let snapshot = TransportMetrics::new().snapshot();
        assert_eq!(snapshot.frames_sent, 0);
        assert_eq!(snapshot.bytes_received, 0);
        assert_eq!(snapshot.unexpected_replies, 0);
    }

    #[test]
    fn test_frame_counters() {
        let metrics = TransportMetrics::new();
        metrics.frame_sent(10);
        metrics.frame_sent(5);
        metrics.frame_received(7);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.frames_sent, 2);
        assert_eq!(snapshot.bytes_sent, 15);
        assert_eq!(snapshot.frames_received, 1);
        assert_eq!(snapshot.bytes_received, 7);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = TransportMetrics::new();
        metrics.inc_calls_sent();
        metrics.inc_unexpected_replies();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["calls_sent"], 1);
        assert_eq!(json["unexpected_replies"], 1);
    }
}
