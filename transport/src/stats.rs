use std::sync::atomic::Ordering;

use portable_atomic::AtomicU64;

/// Per-stream counters. The owning stream thread writes with relaxed
/// stores; observers read whole 64-bit values (portable-atomic keeps
/// those untorn on 32-bit targets).
#[derive(Debug, Default)]
pub struct StreamStats {
    pub received_packets: AtomicU64,
    pub received_bytes: AtomicU64,
    pub sent_packets: AtomicU64,
    pub sent_bytes: AtomicU64,
    pub committed_chunks: AtomicU64,
    /// Gap-inferred drops (RX ring overrun or sequence holes).
    pub dropped_packets: AtomicU64,
    pub checksum_mismatch: AtomicU64,
    last_sequence: AtomicU64,
}

/// Plain-value view of the counters at one instant.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received_packets: u64,
    pub received_bytes: u64,
    pub sent_packets: u64,
    pub sent_bytes: u64,
    pub committed_chunks: u64,
    pub dropped_packets: u64,
    pub checksum_mismatch: u64,
    pub last_sequence: u64,
}

impl StatsSnapshot {
    /// Megabits represented by the received byte count.
    pub fn received_mbits(&self) -> f64 {
        self.received_bytes as f64 * 8.0 / 1.0e6
    }
}

impl StreamStats {
    pub fn on_received(&self, bytes: usize) {
        self.received_packets.fetch_add(1, Ordering::Relaxed);
        self.received_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn on_sent(&self, packets: u64, bytes: u64) {
        self.sent_packets.fetch_add(packets, Ordering::Relaxed);
        self.sent_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn on_dropped(&self, packets: u64) {
        self.dropped_packets.fetch_add(packets, Ordering::Relaxed);
    }

    pub fn on_checksum_mismatch(&self) {
        self.checksum_mismatch.fetch_add(1, Ordering::Relaxed);
    }

    /// Reset-to-value sequence tracker; returns the previous value.
    pub fn set_last_sequence(&self, seq: u64) -> u64 {
        self.last_sequence.swap(seq, Ordering::Relaxed)
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received_packets: self.received_packets.load(Ordering::Relaxed),
            received_bytes: self.received_bytes.load(Ordering::Relaxed),
            sent_packets: self.sent_packets.load(Ordering::Relaxed),
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            committed_chunks: self.committed_chunks.load(Ordering::Relaxed),
            dropped_packets: self.dropped_packets.load(Ordering::Relaxed),
            checksum_mismatch: self.checksum_mismatch.load(Ordering::Relaxed),
            last_sequence: self.last_sequence.load(Ordering::Relaxed),
        }
    }

    /// Snapshot-and-zero of the rate-window counters; `last_sequence` is
    /// preserved.
    pub fn take_window(&self) -> StatsSnapshot {
        StatsSnapshot {
            received_packets: self.received_packets.swap(0, Ordering::Relaxed),
            received_bytes: self.received_bytes.swap(0, Ordering::Relaxed),
            sent_packets: self.sent_packets.swap(0, Ordering::Relaxed),
            sent_bytes: self.sent_bytes.swap(0, Ordering::Relaxed),
            committed_chunks: self.committed_chunks.swap(0, Ordering::Relaxed),
            dropped_packets: self.dropped_packets.swap(0, Ordering::Relaxed),
            checksum_mismatch: self.checksum_mismatch.swap(0, Ordering::Relaxed),
            last_sequence: self.last_sequence.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod stats_test {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = StreamStats::default();
        stats.on_received(100);
        stats.on_received(200);
        stats.on_dropped(3);
        let snap = stats.snapshot();
        assert_eq!(snap.received_packets, 2);
        assert_eq!(snap.received_bytes, 300);
        assert_eq!(snap.dropped_packets, 3);
    }

    #[test]
    fn test_window_reset_preserves_sequence() {
        let stats = StreamStats::default();
        stats.on_received(1500);
        stats.set_last_sequence(41);
        let window = stats.take_window();
        assert_eq!(window.received_packets, 1);
        assert_eq!(stats.snapshot().received_packets, 0);
        assert_eq!(stats.last_sequence(), 41);
    }

    #[test]
    fn test_mbits() {
        let snap = StatsSnapshot {
            received_bytes: 1_250_000,
            ..Default::default()
        };
        assert!((snap.received_mbits() - 10.0).abs() < 1e-9);
    }
}
