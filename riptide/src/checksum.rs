use std::sync::Arc;

use transport::StreamStats;
use util::{Error, Result};

/// App header used by the generic sender/receiver pair to verify
/// delivery: a 32-bit sequence and a byte-sum checksum, big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumHeader {
    pub sequence: u32,
    pub checksum: u32,
}

pub const CHECKSUM_HEADER_SIZE: usize = 8;

impl ChecksumHeader {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < CHECKSUM_HEADER_SIZE {
            return Err(Error::invalid_argument("short checksum header"));
        }
        Ok(ChecksumHeader {
            sequence: u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
            checksum: u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
        })
    }

    pub fn write_to(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < CHECKSUM_HEADER_SIZE {
            return Err(Error::invalid_argument("short checksum header buffer"));
        }
        buf[0..4].copy_from_slice(&self.sequence.to_be_bytes());
        buf[4..8].copy_from_slice(&self.checksum.to_be_bytes());
        Ok(())
    }
}

/// Wrapping byte sum over the payload.
pub fn byte_sum(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |acc, &b| acc.wrapping_add(b as u32))
}

/// Per-stream verifier: counts sequence-gap drops and checksum
/// mismatches into the stream's counters. Soft failures only; nothing
/// here aborts the packet path.
pub struct ChecksumVerifier {
    stats: Arc<StreamStats>,
    first_packet: bool,
}

impl ChecksumVerifier {
    pub fn new(stats: Arc<StreamStats>) -> Self {
        ChecksumVerifier {
            stats,
            first_packet: true,
        }
    }

    pub fn verify(&mut self, header: &[u8], payload: &[u8]) {
        let parsed = match ChecksumHeader::parse(header) {
            Ok(parsed) => parsed,
            Err(_) => {
                self.stats.on_checksum_mismatch();
                return;
            }
        };
        self.check_drops(parsed.sequence);
        if byte_sum(payload) != parsed.checksum {
            self.stats.on_checksum_mismatch();
        }
    }

    fn check_drops(&mut self, sequence: u32) {
        if !self.first_packet {
            let last = self.stats.last_sequence() as u32;
            let drops = if sequence < last {
                // wrap-around gap
                sequence.wrapping_add(u32::MAX - last)
            } else {
                sequence.wrapping_sub(last.wrapping_add(1))
            };
            if drops > 0 {
                self.stats.on_dropped(drops as u64);
            }
        }
        self.first_packet = false;
        self.stats.set_last_sequence(sequence as u64);
    }
}

#[cfg(test)]
mod checksum_test {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let header = ChecksumHeader {
            sequence: 0xA1B2C3D4,
            checksum: 0x00112233,
        };
        let mut buf = [0u8; CHECKSUM_HEADER_SIZE];
        header.write_to(&mut buf).unwrap();
        assert_eq!(
            buf,
            [0xA1, 0xB2, 0xC3, 0xD4, 0x00, 0x11, 0x22, 0x33]
        );
        assert_eq!(ChecksumHeader::parse(&buf).unwrap(), header);
        assert!(ChecksumHeader::parse(&buf[..4]).is_err());
    }

    #[test]
    fn test_byte_sum() {
        assert_eq!(byte_sum(&[]), 0);
        assert_eq!(byte_sum(&[1, 2, 3]), 6);
        assert_eq!(byte_sum(&[0xff; 4]), 0x3fc);
    }

    #[test]
    fn test_verifier_counts_mismatch_and_drops() {
        let stats = Arc::new(StreamStats::default());
        let mut verifier = ChecksumVerifier::new(stats.clone());

        let packet = |seq: u32, payload: &[u8], good: bool| {
            let mut header = [0u8; CHECKSUM_HEADER_SIZE];
            let checksum = if good { byte_sum(payload) } else { byte_sum(payload) + 1 };
            ChecksumHeader { sequence: seq, checksum }
                .write_to(&mut header)
                .unwrap();
            header
        };

        let payload = [7u8; 16];
        verifier.verify(&packet(0, &payload, true), &payload);
        verifier.verify(&packet(1, &payload, true), &payload);
        // two drops, then a corrupted payload
        verifier.verify(&packet(4, &payload, true), &payload);
        verifier.verify(&packet(5, &payload, false), &payload);

        let snap = stats.snapshot();
        assert_eq!(snap.dropped_packets, 2);
        assert_eq!(snap.checksum_mismatch, 1);
        assert_eq!(snap.last_sequence, 5);
    }
}
