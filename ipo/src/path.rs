use std::collections::VecDeque;

use rtp::sequence::{forward_distance, SequenceWidth};
use transport::RxStream;

/// One redundant receive path of an ordering stream: the underlying
/// stream, its own sequence bookkeeping, and the FIFO of ring slots the
/// engine still holds.
pub struct IpoPath {
    pub stream: RxStream,
    width: SequenceWidth,
    last_sequence: Option<u32>,
    dropped: u64,
    held: VecDeque<HeldSlot>,
}

#[derive(Debug, Clone, Copy)]
struct HeldSlot {
    arrival_ns: u64,
}

impl IpoPath {
    pub fn new(stream: RxStream, width: SequenceWidth) -> Self {
        IpoPath {
            stream,
            width,
            last_sequence: None,
            dropped: 0,
            held: VecDeque::new(),
        }
    }

    /// Path-level drop inference from sequence gaps, wrap-aware.
    pub fn track_sequence(&mut self, raw_sequence: u32) {
        if let Some(last) = self.last_sequence {
            self.dropped += sequence_gap(last, raw_sequence, self.width);
        }
        self.last_sequence = Some(raw_sequence);
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn last_sequence(&self) -> Option<u32> {
        self.last_sequence
    }

    /// Records a consumed ring slot the engine now holds. Slots are
    /// held in arrival order, which on one path is ring order.
    pub fn note_held(&mut self, arrival_ns: u64) {
        self.held.push_back(HeldSlot { arrival_ns });
    }

    /// Returns ring slots older than `cutoff_ns` to the stream, FIFO.
    /// By the time a slot crosses twice the path differential its
    /// packet has been emitted, counted redundant or counted lost, so
    /// nothing references it anymore.
    pub fn release_older_than(&mut self, cutoff_ns: u64) -> util::Result<usize> {
        let mut count = 0;
        while let Some(front) = self.held.front() {
            if front.arrival_ns >= cutoff_ns {
                break;
            }
            self.held.pop_front();
            count += 1;
        }
        if count > 0 {
            self.stream.release_packets(count)?;
        }
        Ok(count)
    }

    pub fn held_slots(&self) -> usize {
        self.held.len()
    }
}

/// Packets missing between two consecutively observed sequence numbers.
pub fn sequence_gap(last: u32, current: u32, width: SequenceWidth) -> u64 {
    let distance = forward_distance(last, current, width) as u64;
    distance.saturating_sub(1)
}

#[cfg(test)]
mod path_test {
    use super::*;

    #[test]
    fn test_gap_inference() {
        let w = SequenceWidth::Short;
        assert_eq!(sequence_gap(10, 11, w), 0);
        assert_eq!(sequence_gap(11, 14, w), 2);
        // duplicate observed: a zero-distance step infers nothing
        assert_eq!(sequence_gap(14, 14, w), 0);
        // wrap: 65535 -> 2 skipped 0 and 1
        assert_eq!(sequence_gap(65535, 2, w), 2);
        assert_eq!(sequence_gap(u32::MAX, 1, SequenceWidth::Extended), 1);
    }
}
