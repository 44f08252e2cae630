use util::{Error, Rational, Result};

/// Pixels per 4:2:2 pixel group.
pub const PIXELS_PER_GROUP: usize = 2;

pub const FHD_WIDTH: u32 = 1920;
pub const FHD_HEIGHT: u32 = 1080;
pub const UHD_WIDTH: u32 = 3840;
pub const UHD_HEIGHT: u32 = 2160;

/// RTP video clock rate for -20 and -40.
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// AES67 section 6.2 DSCP class for audio media.
pub const DSCP_MEDIA_RTP_CLASS: u8 = 34;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scan {
    Progressive,
    Interlaced,
}

impl Scan {
    pub fn fields_per_frame(&self) -> u32 {
        match self {
            Scan::Progressive => 1,
            Scan::Interlaced => 2,
        }
    }
}

/// 4:2:2 sampling only; the bit depth decides the pixel-group byte size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Planar 8-bit 4:2:2 (Y, Cb, Cr planes).
    Yuv422p8,
    /// Planar 10-bit 4:2:2, 16-bit little-endian plane samples.
    Yuv422p10,
    /// Interleaved 8-bit Cb Y Cr Y.
    Uyvy422,
}

impl PixelFormat {
    /// Bytes per pixel group on the wire: 4 for 8-bit, 5 for 10-bit.
    pub fn group_size(&self) -> usize {
        match self {
            PixelFormat::Yuv422p8 | PixelFormat::Uyvy422 => 4,
            PixelFormat::Yuv422p10 => 5,
        }
    }

    pub fn bit_depth(&self) -> u16 {
        match self {
            PixelFormat::Yuv422p8 | PixelFormat::Uyvy422 => 8,
            PixelFormat::Yuv422p10 => 10,
        }
    }

    pub fn is_planar(&self) -> bool {
        !matches!(self, PixelFormat::Uyvy422)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Resolution { width, height }
    }
}

/// Video format description consumed by the -20 framer and the send
/// scheduler.
#[derive(Debug, Clone)]
pub struct VideoFormat {
    pub resolution: Resolution,
    pub scan: Scan,
    pub pixel_format: PixelFormat,
    pub frame_rate: Rational,
    pub payload_type: u8,
    /// Packet size ceiling, MTU style (IP + UDP headers included).
    pub mtu: usize,
    /// Pad the short tail packet of a frame/field up to the size of its
    /// predecessor, keeping all packets MTU-uniform.
    pub allow_padding: bool,
}

/// Audio format description consumed by the -30 framer.
#[derive(Debug, Clone)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
    pub ptime_us: u64,
    pub payload_type: u8,
}

impl AudioFormat {
    pub fn samples_per_packet(&self) -> usize {
        (self.sample_rate as u64 * self.ptime_us / 1_000_000) as usize
    }

    pub fn bytes_per_sample_frame(&self) -> usize {
        self.channels as usize * (self.bit_depth as usize / 8)
    }

    pub fn payload_size(&self) -> usize {
        self.samples_per_packet() * self.bytes_per_sample_frame()
    }

    pub fn validate(&self) -> Result<()> {
        if ![16, 24, 32].contains(&self.bit_depth) {
            return Err(Error::invalid_argument(format!(
                "unsupported audio bit depth {}",
                self.bit_depth
            )));
        }
        if self.sample_rate == 0 || self.channels == 0 || self.ptime_us == 0 {
            return Err(Error::invalid_argument(
                "audio format requires non-zero rate, channels and ptime",
            ));
        }
        if (self.sample_rate as u64 * self.ptime_us) % 1_000_000 != 0 {
            return Err(Error::invalid_argument(format!(
                "ptime {} us is not a whole number of samples at {} Hz",
                self.ptime_us, self.sample_rate
            )));
        }
        Ok(())
    }
}

/// Ancillary (-40) stream description: one ANC data block per field with
/// a fixed DID/SDID pair.
#[derive(Debug, Clone)]
pub struct AncillaryFormat {
    pub payload_type: u8,
    pub did: u16,
    pub sdid: u16,
    pub scan: Scan,
    pub frame_rate: Rational,
}

/// Derived stream geometry: everything the scheduler and the chunk engine
/// need to know about a media stream, computed (never parsed) from the
/// format description.
#[derive(Debug, Clone)]
pub struct MediaParams {
    pub resolution: Resolution,
    pub scan: Scan,
    pub frame_rate: Rational,
    pub sample_rate: u32,
    pub packets_per_frame_field: u32,
    pub packets_per_line: u32,
    pub chunks_per_frame_field: u32,
    pub frame_field_interval_ns: Rational,
}

impl MediaParams {
    /// Interval between frames (progressive) or fields (interlaced).
    pub fn interval_ns(frame_rate: &Rational, scan: Scan) -> Result<Rational> {
        if frame_rate.is_zero() {
            return Err(Error::invalid_argument("zero frame rate"));
        }
        let t_frame = Rational::from_integer(1_000_000_000).checked_div(frame_rate)?;
        Ok(match scan {
            Scan::Progressive => t_frame,
            Scan::Interlaced => t_frame / 2,
        })
    }
}

#[cfg(test)]
mod params_test {
    use super::*;

    #[test]
    fn test_group_sizes() {
        assert_eq!(PixelFormat::Yuv422p8.group_size(), 4);
        assert_eq!(PixelFormat::Uyvy422.group_size(), 4);
        assert_eq!(PixelFormat::Yuv422p10.group_size(), 5);
        assert_eq!(PixelFormat::Yuv422p10.bit_depth(), 10);
    }

    #[test]
    fn test_audio_sizes() {
        let fmt = AudioFormat {
            sample_rate: 48_000,
            channels: 2,
            bit_depth: 24,
            ptime_us: 1_000,
            payload_type: 97,
        };
        fmt.validate().unwrap();
        assert_eq!(fmt.samples_per_packet(), 48);
        assert_eq!(fmt.payload_size(), 288);
    }

    #[test]
    fn test_audio_validation() {
        let mut fmt = AudioFormat {
            sample_rate: 48_000,
            channels: 2,
            bit_depth: 20,
            ptime_us: 1_000,
            payload_type: 97,
        };
        assert!(fmt.validate().is_err());
        fmt.bit_depth = 24;
        fmt.ptime_us = 0;
        assert!(fmt.validate().is_err());
    }

    #[test]
    fn test_field_interval() {
        let sixty = Rational::from_integer(60);
        let progressive = MediaParams::interval_ns(&sixty, Scan::Progressive).unwrap();
        let interlaced = MediaParams::interval_ns(&sixty, Scan::Interlaced).unwrap();
        assert_eq!(progressive.floor(), 16_666_666);
        assert_eq!(interlaced * 2u64, progressive);
    }
}
