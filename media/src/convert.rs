use rtp::params::PixelFormat;
use util::{Error, Result};

use crate::frame::{AudioBuffer, SampleFormat, VideoFrame};

/// The converter stage. Decode and scaling belong to the external frame
/// source; this stage only passes through the wire-packable 4:2:2
/// formats and rejects everything else, mirroring the scaler bypass of
/// the player.
pub struct VideoConverter;

impl VideoConverter {
    pub fn convert(frame: VideoFrame) -> Result<VideoFrame> {
        match frame.format {
            PixelFormat::Yuv422p8 | PixelFormat::Yuv422p10 | PixelFormat::Uyvy422 => {
                frame.validate()?;
                Ok(frame)
            }
        }
    }
}

/// PCM encoder stage: interleaved native-endian samples to the 24-bit
/// big-endian wire format of the audio framer.
pub fn encode_s24be(buffer: &AudioBuffer) -> Result<Vec<u8>> {
    let bytes_per_sample = buffer.format.bytes_per_sample();
    if buffer.data.len() % (bytes_per_sample * buffer.channels as usize) != 0 {
        return Err(Error::invalid_argument(
            "audio buffer is not a whole number of sample frames",
        ));
    }
    let samples = buffer.data.len() / bytes_per_sample;
    let mut out = Vec::with_capacity(samples * 3);
    match buffer.format {
        SampleFormat::S16 => {
            for chunk in buffer.data.chunks_exact(2) {
                let sample = i16::from_ne_bytes([chunk[0], chunk[1]]) as i32;
                let widened = sample << 8;
                out.extend_from_slice(&widened.to_be_bytes()[1..4]);
            }
        }
        SampleFormat::S32 => {
            for chunk in buffer.data.chunks_exact(4) {
                let sample = i32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                out.extend_from_slice(&sample.to_be_bytes()[..3]);
            }
        }
        SampleFormat::F32 => {
            for chunk in buffer.data.chunks_exact(4) {
                let sample = f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                let scaled = (sample.clamp(-1.0, 1.0) * 8_388_607.0) as i32;
                let shifted = scaled << 8;
                out.extend_from_slice(&shifted.to_be_bytes()[..3]);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod convert_test {
    use super::*;

    #[test]
    fn test_s32_keeps_top_three_bytes() {
        let buffer = AudioBuffer {
            sample_rate: 48_000,
            channels: 1,
            format: SampleFormat::S32,
            data: 0x1234_5678i32.to_ne_bytes().to_vec(),
        };
        assert_eq!(encode_s24be(&buffer).unwrap(), vec![0x12, 0x34, 0x56]);
    }

    #[test]
    fn test_s16_widens() {
        let buffer = AudioBuffer {
            sample_rate: 48_000,
            channels: 1,
            format: SampleFormat::S16,
            data: 0x1234i16.to_ne_bytes().to_vec(),
        };
        assert_eq!(encode_s24be(&buffer).unwrap(), vec![0x12, 0x34, 0x00]);
    }

    #[test]
    fn test_f32_full_scale() {
        let buffer = AudioBuffer {
            sample_rate: 48_000,
            channels: 1,
            format: SampleFormat::F32,
            data: 1.0f32.to_ne_bytes().to_vec(),
        };
        assert_eq!(encode_s24be(&buffer).unwrap(), vec![0x7f, 0xff, 0xff]);
    }

    #[test]
    fn test_partial_sample_frame_rejected() {
        let buffer = AudioBuffer {
            sample_rate: 48_000,
            channels: 2,
            format: SampleFormat::S16,
            data: vec![0; 6],
        };
        assert!(encode_s24be(&buffer).is_err());
    }

    #[test]
    fn test_converter_passthrough_validates() {
        let frame = VideoFrame {
            format: PixelFormat::Uyvy422,
            width: 4,
            height: 2,
            planes: vec![vec![0; 16]],
            linesize: [8, 0, 0],
            pts_ns: None,
        };
        assert!(VideoConverter::convert(frame).is_ok());

        let short = VideoFrame {
            format: PixelFormat::Uyvy422,
            width: 4,
            height: 2,
            planes: vec![vec![0; 3]],
            linesize: [8, 0, 0],
            pts_ns: None,
        };
        assert!(VideoConverter::convert(short).is_err());
    }
}
