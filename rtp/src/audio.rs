use util::marshal::Marshal;

use crate::error::{Error, Result};
use crate::header::{RtpHeader, HEADER_SIZE};
use crate::params::AudioFormat;

/// Simulated SSRC of generated audio streams.
pub const AUDIO_SSRC: u32 = 0x0eb51dbe;

/// ST 2110-30 / AES67 framer. Packets are uniform: `samples_per_packet`
/// sample frames of interleaved big-endian PCM behind a plain RTP
/// header. No marker bit; the timestamp advances by the sample count per
/// packet.
pub struct AudioFramer {
    format: AudioFormat,
    payload_size: usize,
    samples_per_packet: usize,
    sequence: u32,
    timestamp: u64,
    ssrc: u32,
}

impl AudioFramer {
    pub fn new(format: AudioFormat) -> Result<Self> {
        format.validate().map_err(Error::Util)?;
        Ok(AudioFramer {
            payload_size: format.payload_size(),
            samples_per_packet: format.samples_per_packet(),
            format,
            sequence: 0,
            timestamp: 0,
            ssrc: AUDIO_SSRC,
        })
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    pub fn packet_size(&self) -> usize {
        self.payload_size + HEADER_SIZE
    }

    pub fn samples_per_packet(&self) -> usize {
        self.samples_per_packet
    }

    /// Seeds the RTP timestamp from the scheduled first-packet time.
    pub fn set_timestamp_tick(&mut self, tick: u64) {
        self.timestamp = tick;
    }

    /// Builds one packet from exactly `payload_size` bytes of encoded
    /// PCM. Returns the packet size.
    pub fn fill_packet(&mut self, buf: &mut [u8], pcm: &[u8]) -> Result<usize> {
        if pcm.len() != self.payload_size {
            return Err(Error::ErrGeometryMismatch(format!(
                "audio payload {} bytes, expected {}",
                pcm.len(),
                self.payload_size
            )));
        }
        if buf.len() < self.packet_size() {
            return Err(Error::ErrBufferTooSmall);
        }
        let header = RtpHeader {
            marker: false,
            payload_type: self.format.payload_type,
            sequence_number: self.sequence as u16,
            timestamp: self.timestamp as u32,
            ssrc: self.ssrc,
        };
        header.marshal_to(buf).map_err(Error::Util)?;
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(self.samples_per_packet as u64);
        buf[HEADER_SIZE..HEADER_SIZE + self.payload_size].copy_from_slice(pcm);
        Ok(self.packet_size())
    }
}
