use rtp::params::PixelFormat;
use rtp::video::FrameRef;
use util::{Error, Result};

/// One decoded video frame handed to the pipeline by the external frame
/// source. Planar formats carry three planes (Y, Cb, Cr); interleaved
/// formats put everything in plane 0.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub planes: Vec<Vec<u8>>,
    pub linesize: [usize; 3],
    pub pts_ns: Option<u64>,
}

impl VideoFrame {
    pub fn frame_ref(&self) -> FrameRef<'_> {
        static EMPTY: [u8; 0] = [];
        let plane = |i: usize| self.planes.get(i).map(|p| p.as_slice()).unwrap_or(&EMPTY);
        FrameRef {
            y: plane(0),
            cb: plane(1),
            cr: plane(2),
        }
    }

    /// Checks that the planes hold a full frame of the declared
    /// geometry.
    pub fn validate(&self) -> Result<()> {
        let pixels = self.width as usize * self.height as usize;
        let ok = match self.format {
            PixelFormat::Uyvy422 => self.planes.first().map_or(false, |y| y.len() >= pixels * 2),
            PixelFormat::Yuv422p8 => {
                self.planes.len() >= 3
                    && self.planes[0].len() >= pixels
                    && self.planes[1].len() >= pixels / 2
                    && self.planes[2].len() >= pixels / 2
            }
            PixelFormat::Yuv422p10 => {
                self.planes.len() >= 3
                    && self.planes[0].len() >= pixels * 2
                    && self.planes[1].len() >= pixels
                    && self.planes[2].len() >= pixels
            }
        };
        if ok {
            Ok(())
        } else {
            Err(Error::invalid_argument(format!(
                "short planes for {}x{} frame",
                self.width, self.height
            )))
        }
    }
}

/// Interleaved or planar PCM sample layout of an [`AudioBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    S16,
    S32,
    F32,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::S16 => 2,
            SampleFormat::S32 | SampleFormat::F32 => 4,
        }
    }
}

/// A run of interleaved PCM samples from the external audio source.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    pub sample_rate: u32,
    pub channels: u16,
    pub format: SampleFormat,
    /// Interleaved samples, native-endian.
    pub data: Vec<u8>,
}

impl AudioBuffer {
    pub fn sample_frames(&self) -> usize {
        self.data.len() / (self.format.bytes_per_sample() * self.channels as usize)
    }
}
