use bytes::{Buf, BufMut};

use util::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::error::{Error, Result};

pub const HEADER_SIZE: usize = 12;
/// High 16 bits of the extended sequence number, carried as the first two
/// payload bytes by the -20 and -40 mappings.
pub const EXTENSION_SEQ_SIZE: usize = 2;

pub const VERSION_SHIFT: u8 = 6;
pub const VERSION_MASK: u8 = 0x3;
pub const PADDING_SHIFT: u8 = 5;
pub const EXTENSION_SHIFT: u8 = 4;
pub const CC_MASK: u8 = 0xF;
pub const MARKER_SHIFT: u8 = 7;
pub const MARKER_MASK: u8 = 0x1;
pub const PT_MASK: u8 = 0x7F;

/// Fixed-layout RTP header emitted by the 2110 framers: version 2, no
/// padding, no extension, no CSRCs.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       sequence number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           synchronization source (SSRC) identifier            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Eq, PartialEq, Default, Clone)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl MarshalSize for RtpHeader {
    fn marshal_size(&self) -> usize {
        HEADER_SIZE
    }
}

impl Marshal for RtpHeader {
    fn marshal_to(&self, buf: &mut [u8]) -> std::result::Result<usize, util::Error> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::ErrBufferTooSmall.into());
        }
        let mut buf = buf;
        buf.put_u8(2 << VERSION_SHIFT);
        buf.put_u8(((self.marker as u8) << MARKER_SHIFT) | (self.payload_type & PT_MASK));
        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        Ok(HEADER_SIZE)
    }
}

impl Unmarshal for RtpHeader {
    fn unmarshal<B>(raw: &mut B) -> std::result::Result<Self, util::Error>
    where
        B: Buf,
    {
        if raw.remaining() < HEADER_SIZE {
            return Err(Error::ErrHeaderSizeInsufficient.into());
        }
        let b0 = raw.get_u8();
        let version = b0 >> VERSION_SHIFT & VERSION_MASK;
        if version != 2 {
            return Err(Error::ErrBadVersion.into());
        }
        let cc = (b0 & CC_MASK) as usize;
        let b1 = raw.get_u8();
        let marker = (b1 >> MARKER_SHIFT & MARKER_MASK) > 0;
        let payload_type = b1 & PT_MASK;
        let sequence_number = raw.get_u16();
        let timestamp = raw.get_u32();
        let ssrc = raw.get_u32();
        // CSRCs are never emitted by the framers but are skipped on parse
        if raw.remaining() < cc * 4 {
            return Err(Error::ErrHeaderSizeInsufficient.into());
        }
        raw.advance(cc * 4);
        Ok(RtpHeader {
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
        })
    }
}

/// Reads just the sequence number out of a raw header, without a full
/// parse. The receive fast path calls this per packet.
pub fn peek_sequence_number(raw: &[u8]) -> Result<u16> {
    if raw.len() < HEADER_SIZE {
        return Err(Error::ErrHeaderSizeInsufficient);
    }
    Ok(u16::from_be_bytes([raw[2], raw[3]]))
}

/// Reads the extended 32-bit sequence number: high 16 bits from the first
/// two payload bytes, low 16 from the header.
pub fn peek_extended_sequence_number(header: &[u8], payload: &[u8]) -> Result<u32> {
    let low = peek_sequence_number(header)? as u32;
    if payload.len() < EXTENSION_SEQ_SIZE {
        return Err(Error::ErrBufferTooSmall);
    }
    let high = u16::from_be_bytes([payload[0], payload[1]]) as u32;
    Ok(high << 16 | low)
}
