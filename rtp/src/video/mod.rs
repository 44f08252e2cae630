#[cfg(test)]
mod video_test;

use bytes::BufMut;

use util::marshal::Marshal;
use util::Rational;

use crate::error::{Error, Result};
use crate::header::{RtpHeader, EXTENSION_SEQ_SIZE, HEADER_SIZE};
use crate::params::{PixelFormat, Resolution, Scan, VideoFormat, PIXELS_PER_GROUP};
use crate::sequence::Sequencer;
use crate::{IPV4_HDR_SIZE, UDP_HDR_SIZE};

pub const SRD_HEADER_SIZE: usize = 6;
/// RTP + extended sequence + one SRD.
pub const USER_HEADER_SIZE: usize = HEADER_SIZE + EXTENSION_SEQ_SIZE + SRD_HEADER_SIZE;

/// Sample Row Data header.
///
/// ```text
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           SRD Length          |F|     SRD Row Number          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |C|         SRD Offset          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SrdHeader {
    pub length: u16,
    pub row_number: u16,
    pub field: bool,
    pub continuation: bool,
    pub offset: u16,
}

impl SrdHeader {
    pub fn write_to(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < SRD_HEADER_SIZE {
            return Err(Error::ErrBufferTooSmall);
        }
        let mut buf = buf;
        buf.put_u16(self.length);
        buf.put_u16(((self.field as u16) << 15) | (self.row_number & 0x7fff));
        buf.put_u16(((self.continuation as u16) << 15) | (self.offset & 0x7fff));
        Ok(())
    }

    pub fn parse(raw: &[u8]) -> Result<SrdHeader> {
        if raw.len() < SRD_HEADER_SIZE {
            return Err(Error::ErrBufferTooSmall);
        }
        let length = u16::from_be_bytes([raw[0], raw[1]]);
        let row = u16::from_be_bytes([raw[2], raw[3]]);
        let offset = u16::from_be_bytes([raw[4], raw[5]]);
        Ok(SrdHeader {
            length,
            row_number: row & 0x7fff,
            field: row >> 15 != 0,
            continuation: offset >> 15 != 0,
            offset: offset & 0x7fff,
        })
    }
}

/// Nominal packet counts of the standard formats, used by the send
/// scheduler for the inter-packet spacing (Trs) regardless of the actual
/// MTU-driven plan.
pub fn packets_per_frame_table(resolution: Resolution, pixel_format: PixelFormat) -> u32 {
    let uhd = resolution.width > crate::params::FHD_WIDTH;
    match (pixel_format.bit_depth(), uhd) {
        (10, false) => 4320,
        (10, true) => 17280,
        (_, false) => 3240,
        (_, true) => 12960,
    }
}

/// Per-packet wire sizes of one frame (progressive) or one field
/// (interlaced), planned once per stream. Entries count RTP headers and
/// payload, not IP/UDP.
#[derive(Debug, Clone)]
pub struct VideoPacketPlan {
    sizes: Vec<u16>,
    pgroups_per_line: usize,
    lines_per_field: usize,
    group_size: usize,
}

impl VideoPacketPlan {
    pub fn new(format: &VideoFormat) -> Result<Self> {
        let Resolution { width, height } = format.resolution;
        if width == 0 || height == 0 || width % 2 != 0 {
            return Err(Error::ErrGeometryMismatch(format!(
                "bad resolution {width}x{height}"
            )));
        }
        if format.scan == Scan::Interlaced && height % 2 != 0 {
            return Err(Error::ErrGeometryMismatch(format!(
                "interlaced height {height} is odd"
            )));
        }
        let group_size = format.pixel_format.group_size();
        let max_payload = format
            .mtu
            .checked_sub(IPV4_HDR_SIZE + UDP_HDR_SIZE)
            .ok_or(Error::ErrMtuTooSmall)?;
        if max_payload < USER_HEADER_SIZE + SRD_HEADER_SIZE + group_size {
            return Err(Error::ErrMtuTooSmall);
        }

        let pgroups_per_line = width as usize / PIXELS_PER_GROUP;
        let lines_per_field = (height / format.scan.fields_per_frame()) as usize;
        let mut pgroups_left = pgroups_per_line * lines_per_field;

        let mut sizes: Vec<u16> = Vec::new();
        let mut line_remainder = pgroups_per_line;
        while pgroups_left > 0 {
            let mut payload = max_payload - USER_HEADER_SIZE;
            let used;
            let size;
            if line_remainder <= (payload - SRD_HEADER_SIZE) / group_size {
                if pgroups_left < (payload - SRD_HEADER_SIZE) / group_size {
                    // short tail of the frame/field
                    used = pgroups_left;
                    size = match sizes.last() {
                        Some(&previous) if format.allow_padding => previous as usize,
                        _ => used * group_size + USER_HEADER_SIZE,
                    };
                } else {
                    // line break mid-packet, a second SRD rides along
                    payload -= SRD_HEADER_SIZE;
                    used = payload / group_size;
                    size = used * group_size + USER_HEADER_SIZE + SRD_HEADER_SIZE;
                    line_remainder = pgroups_per_line - (used - line_remainder);
                }
            } else {
                used = (payload / group_size).min(line_remainder);
                size = used * group_size + USER_HEADER_SIZE;
                line_remainder -= used;
            }
            if line_remainder == 0 {
                line_remainder = pgroups_per_line;
            }
            pgroups_left -= used.min(pgroups_left);
            sizes.push(size as u16);
        }

        Ok(VideoPacketPlan {
            sizes,
            pgroups_per_line,
            lines_per_field,
            group_size,
        })
    }

    pub fn packets_per_frame_field(&self) -> usize {
        self.sizes.len()
    }

    pub fn sizes(&self) -> &[u16] {
        &self.sizes
    }

    pub fn max_packet_size(&self) -> usize {
        self.sizes.iter().copied().max().unwrap_or(0) as usize
    }

    pub fn pgroups_per_line(&self) -> usize {
        self.pgroups_per_line
    }

    pub fn lines_per_field(&self) -> usize {
        self.lines_per_field
    }
}

/// Borrowed planes of one decoded frame. Interleaved formats put the
/// whole buffer in `y`.
#[derive(Debug, Clone, Copy)]
pub struct FrameRef<'a> {
    pub y: &'a [u8],
    pub cb: &'a [u8],
    pub cr: &'a [u8],
}

/// Progress through one frame/field while its packets are being built.
#[derive(Debug, Clone, Copy)]
pub struct FrameCursor {
    pub packet_counter: usize,
    pgroups_left_in_frame_field: usize,
    pgroups_left_in_line: usize,
}

impl FrameCursor {
    pub fn done(&self) -> bool {
        self.pgroups_left_in_frame_field == 0
    }
}

/// ST 2110-20 framer: one instance per video stream, building packets
/// straight into chunk memory.
pub struct VideoFramer {
    format: VideoFormat,
    plan: VideoPacketPlan,
    sequence: Sequencer,
    ssrc: u32,
    timestamp: Rational,
    ticks_per_frame_field: Rational,
    field: bool,
    current_line: u16,
    srd_offset: u16,
    // plane cursors; planar formats count samples, interleaved counts bytes
    y_counter: usize,
    cb_counter: usize,
    cr_counter: usize,
}

impl VideoFramer {
    pub fn new(format: VideoFormat, ssrc: u32) -> Result<Self> {
        let plan = VideoPacketPlan::new(&format)?;
        let fps = format.frame_rate;
        if fps.is_zero() {
            return Err(Error::ErrGeometryMismatch("zero frame rate".into()));
        }
        let mut ticks = Rational::from_integer(crate::params::VIDEO_CLOCK_RATE as u64)
            .checked_div(&fps)
            .map_err(Error::Util)?;
        if format.scan == Scan::Interlaced {
            ticks = ticks / 2;
        }
        Ok(VideoFramer {
            format,
            plan,
            sequence: Sequencer::new(0),
            ssrc,
            timestamp: Rational::ZERO,
            ticks_per_frame_field: ticks,
            field: false,
            current_line: 0,
            srd_offset: 0,
            y_counter: 0,
            cb_counter: 0,
            cr_counter: 0,
        })
    }

    pub fn plan(&self) -> &VideoPacketPlan {
        &self.plan
    }

    /// Seeds the RTP timestamp from the scheduled first-packet time.
    pub fn set_timestamp_tick(&mut self, tick: u64) {
        self.timestamp = Rational::from_integer(tick);
    }

    pub fn sequence_number(&self) -> u32 {
        self.sequence.peek()
    }

    /// Resets the plane cursors for a new frame or field. The second
    /// interlaced field starts one line in, then every line advance
    /// skips the other field's line.
    pub fn begin_frame_field(&mut self) -> FrameCursor {
        self.y_counter = 0;
        self.cb_counter = 0;
        self.cr_counter = 0;
        self.current_line = 0;
        self.srd_offset = 0;
        if self.format.scan == Scan::Interlaced && self.field {
            self.jump_line();
        }
        FrameCursor {
            packet_counter: 0,
            pgroups_left_in_frame_field: self.plan.pgroups_per_line * self.plan.lines_per_field,
            pgroups_left_in_line: self.plan.pgroups_per_line,
        }
    }

    /// Flips the interlace field after a field has been fully packed.
    pub fn end_frame_field(&mut self) {
        if self.format.scan == Scan::Interlaced {
            self.field = !self.field;
        }
    }

    fn jump_line(&mut self) {
        let groups = self.plan.pgroups_per_line;
        match self.format.pixel_format {
            PixelFormat::Yuv422p8 | PixelFormat::Yuv422p10 => {
                self.cb_counter += groups;
                self.cr_counter += groups;
                self.y_counter += groups * 2;
            }
            PixelFormat::Uyvy422 => {
                self.y_counter += groups * self.plan.group_size;
            }
        }
    }

    /// Builds one packet into `buf`, returning its wire size (headers +
    /// payload). `buf` must hold at least the planned size for this
    /// packet index.
    pub fn fill_packet(
        &mut self,
        buf: &mut [u8],
        cursor: &mut FrameCursor,
        frame: &FrameRef<'_>,
    ) -> Result<usize> {
        let index = cursor.packet_counter;
        let planned = *self
            .plan
            .sizes
            .get(index)
            .ok_or_else(|| Error::ErrGeometryMismatch(format!("packet {index} out of plan")))?
            as usize;
        if buf.len() < planned {
            return Err(Error::ErrBufferTooSmall);
        }
        let group_size = self.plan.group_size;
        let last_of_frame_field = index == self.plan.packets_per_frame_field() - 1;

        let seq = self.sequence.next();
        let header = RtpHeader {
            marker: last_of_frame_field,
            payload_type: self.format.payload_type,
            sequence_number: Sequencer::low16(seq),
            timestamp: self.timestamp.floor() as u32,
            ssrc: self.ssrc,
        };
        header.marshal_to(buf).map_err(Error::Util)?;
        if last_of_frame_field {
            self.timestamp += self.ticks_per_frame_field;
        }
        buf[HEADER_SIZE..HEADER_SIZE + 2].copy_from_slice(&Sequencer::high16(seq).to_be_bytes());

        let mut data_offset = USER_HEADER_SIZE;
        let mut payload_size = planned - USER_HEADER_SIZE;
        let mut srd = SrdHeader {
            length: 0,
            row_number: self.current_line,
            field: self.field,
            continuation: false,
            offset: self.srd_offset,
        };

        let payload_with_two_srds =
            payload_size.saturating_sub(SRD_HEADER_SIZE) / group_size * group_size;
        let copy_size;
        if cursor.pgroups_left_in_line < payload_size / group_size
            && cursor.pgroups_left_in_frame_field > cursor.pgroups_left_in_line
            && payload_with_two_srds >= (cursor.pgroups_left_in_line + 1) * group_size
        {
            // the line ends inside this packet and the next line starts
            // in it too, so two SRDs are emitted
            payload_size = payload_with_two_srds;
            copy_size = payload_size;

            let first_len = cursor.pgroups_left_in_line * group_size;
            srd.length = first_len as u16;
            srd.continuation = true;
            srd.write_to(&mut buf[HEADER_SIZE + EXTENSION_SEQ_SIZE..])?;
            cursor.pgroups_left_in_frame_field -= cursor.pgroups_left_in_line;
            cursor.pgroups_left_in_line = 0;

            self.current_line = (self.current_line + 1) % self.plan.lines_per_field as u16;
            let second_groups = (payload_size - first_len) / group_size;
            let srd2 = SrdHeader {
                length: (second_groups * group_size) as u16,
                row_number: self.current_line,
                field: self.field,
                continuation: false,
                offset: 0,
            };
            srd2.write_to(&mut buf[HEADER_SIZE + EXTENSION_SEQ_SIZE + SRD_HEADER_SIZE..])?;
            cursor.pgroups_left_in_frame_field -= second_groups;
            cursor.pgroups_left_in_line = self.plan.pgroups_per_line - second_groups;
            self.srd_offset = (((self.plan.pgroups_per_line - cursor.pgroups_left_in_line)
                * PIXELS_PER_GROUP)
                % self.format.resolution.width as usize) as u16;
            data_offset += SRD_HEADER_SIZE;
        } else {
            payload_size = payload_size / group_size * group_size;
            if cursor.pgroups_left_in_frame_field <= payload_size / group_size {
                // last packet of the frame/field, possibly short
                copy_size = cursor.pgroups_left_in_frame_field * group_size;
                srd.length = copy_size as u16;
                srd.write_to(&mut buf[HEADER_SIZE + EXTENSION_SEQ_SIZE..])?;
                self.current_line = 0;
                self.srd_offset = 0;
                if copy_size < payload_size {
                    // uniform-size padding mode zero-fills the tail
                    buf[data_offset + copy_size..data_offset + payload_size].fill(0);
                }
                cursor.pgroups_left_in_frame_field = 0;
            } else {
                copy_size = payload_size;
                srd.length = payload_size as u16;
                srd.write_to(&mut buf[HEADER_SIZE + EXTENSION_SEQ_SIZE..])?;
                cursor.pgroups_left_in_line -= payload_size / group_size;
                cursor.pgroups_left_in_frame_field -= payload_size / group_size;
                self.srd_offset = (((self.plan.pgroups_per_line - cursor.pgroups_left_in_line)
                    * PIXELS_PER_GROUP)
                    % self.format.resolution.width as usize) as u16;
                if cursor.pgroups_left_in_line == 0 {
                    self.current_line = (self.current_line + 1) % self.plan.lines_per_field as u16;
                    cursor.pgroups_left_in_line = self.plan.pgroups_per_line;
                    self.srd_offset = 0;
                }
            }
        }

        self.copy_pixel_groups(&mut buf[data_offset..data_offset + copy_size], frame)?;
        cursor.packet_counter += 1;
        Ok(planned)
    }

    fn copy_pixel_groups(&mut self, dst: &mut [u8], frame: &FrameRef<'_>) -> Result<()> {
        let groups_per_line = self.plan.pgroups_per_line;
        let interlaced = self.format.scan == Scan::Interlaced;
        match self.format.pixel_format {
            PixelFormat::Yuv422p8 => {
                let mut offset = 0;
                while offset < dst.len() {
                    let (cb, y0, cr, y1) = (
                        *frame.cb.get(self.cb_counter).ok_or(Error::ErrBufferTooSmall)?,
                        *frame.y.get(self.y_counter).ok_or(Error::ErrBufferTooSmall)?,
                        *frame.cr.get(self.cr_counter).ok_or(Error::ErrBufferTooSmall)?,
                        *frame
                            .y
                            .get(self.y_counter + 1)
                            .ok_or(Error::ErrBufferTooSmall)?,
                    );
                    dst[offset] = cb;
                    dst[offset + 1] = y0;
                    dst[offset + 2] = cr;
                    dst[offset + 3] = y1;
                    offset += 4;
                    self.cb_counter += 1;
                    self.cr_counter += 1;
                    self.y_counter += 2;
                    if interlaced && self.cb_counter % groups_per_line == 0 {
                        self.jump_line();
                    }
                }
            }
            PixelFormat::Yuv422p10 => {
                let sample = |plane: &[u8], index: usize| -> Result<u16> {
                    let byte = index * 2;
                    if byte + 1 >= plane.len() {
                        return Err(Error::ErrBufferTooSmall);
                    }
                    Ok(u16::from_le_bytes([plane[byte], plane[byte + 1]]))
                };
                let mut offset = 0;
                while offset < dst.len() {
                    let cb = sample(frame.cb, self.cb_counter)?;
                    let y0 = sample(frame.y, self.y_counter)?;
                    let cr = sample(frame.cr, self.cr_counter)?;
                    let y1 = sample(frame.y, self.y_counter + 1)?;
                    dst[offset] = (cb >> 2) as u8;
                    dst[offset + 1] = (((cb << 6) & 0xc0) | (y0 >> 4)) as u8;
                    dst[offset + 2] = (((y0 << 4) & 0xf0) | (cr >> 6)) as u8;
                    dst[offset + 3] = (((cr << 2) & 0xfc) | (y1 >> 8)) as u8;
                    dst[offset + 4] = (y1 & 0xff) as u8;
                    offset += 5;
                    self.cb_counter += 1;
                    self.cr_counter += 1;
                    self.y_counter += 2;
                    if interlaced && self.cr_counter % groups_per_line == 0 {
                        self.jump_line();
                    }
                }
            }
            PixelFormat::Uyvy422 => {
                let line_bytes = groups_per_line * self.plan.group_size;
                let mut remaining = dst.len();
                let mut offset = 0;
                while remaining > 0 {
                    let until_line_end = line_bytes - (self.y_counter % line_bytes);
                    let take = remaining.min(until_line_end);
                    let src = frame
                        .y
                        .get(self.y_counter..self.y_counter + take)
                        .ok_or(Error::ErrBufferTooSmall)?;
                    dst[offset..offset + take].copy_from_slice(src);
                    self.y_counter += take;
                    offset += take;
                    remaining -= take;
                    if interlaced && self.y_counter % line_bytes == 0 {
                        self.jump_line();
                    }
                }
            }
        }
        Ok(())
    }
}
