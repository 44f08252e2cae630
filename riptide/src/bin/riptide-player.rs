use std::net::SocketAddrV4;

use riptide::config::{player_command, PlayerArgs};
use riptide::{exit_code, EXIT_USAGE};

use media::pipeline::{
    AncillaryPipelineConfig, AudioPipelineConfig, PipelineConfig, PipelineCores,
    VideoPipelineConfig,
};
use media::sender::SenderOptions;
use media::{AudioBuffer, MediaPipeline, SampleFormat, VideoFrame};
use rtp::params::{
    AncillaryFormat, AudioFormat, PixelFormat, Resolution, VideoFormat,
};
use transport::TransportConfig;
use util::affinity::CPU_NONE;
use util::clock::Clock;
use util::{Error, Result};

fn main() {
    env_logger::init();
    let matches = player_command().get_matches();
    let args = match PlayerArgs::from_matches(&matches) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(EXIT_USAGE);
        }
    };

    if let Err(e) = util::shutdown::install_signal_handlers() {
        eprintln!("failed to install signal handlers: {e}");
    }

    let result = run(args);
    transport::cleanup();
    util::shutdown::run_finalizers();
    std::process::exit(exit_code(&result));
}

fn run(args: PlayerArgs) -> Result<()> {
    let clock = match Clock::new(args.clock.clone()) {
        Ok(clock) => clock,
        Err(e) => {
            // fall back to the system clock rather than refusing to play
            log::warn!("clock source unavailable ({e}), using the system clock");
            Clock::system_tai()
        }
    };
    let ctx = transport::initialize(TransportConfig {
        clock,
        internal_core: args.internal_core,
    })?;

    let core = |index: usize| args.cores.get(index).copied().unwrap_or(CPU_NONE);
    let mut destinations = args
        .dst_ips
        .iter()
        .zip(&args.dst_ports)
        .map(|(&ip, &port)| SocketAddrV4::new(ip, port));

    let video_format = VideoFormat {
        resolution: Resolution::new(args.width, args.height),
        scan: args.scan,
        pixel_format: args.pixel_format,
        frame_rate: args.frame_rate,
        payload_type: 96,
        mtu: args.mtu,
        allow_padding: args.allow_padding,
    };
    let audio_format = AudioFormat {
        sample_rate: 48_000,
        channels: 2,
        bit_depth: 24,
        ptime_us: 1_000,
        payload_type: 97,
    };

    let mut next_destination = || {
        destinations
            .next()
            .ok_or_else(|| Error::invalid_argument("not enough destinations"))
    };
    let video = if args.video {
        Some(VideoPipelineConfig {
            format: video_format.clone(),
            destination: next_destination()?,
            tro_modification: args.tro_modification,
        })
    } else {
        None
    };
    let audio = if args.audio {
        Some(AudioPipelineConfig {
            format: audio_format.clone(),
            destination: next_destination()?,
        })
    } else {
        None
    };
    let ancillary = if args.ancillary {
        Some(AncillaryPipelineConfig {
            format: AncillaryFormat {
                payload_type: 100,
                did: args.did,
                sdid: args.sdid,
                scan: args.scan,
                frame_rate: args.frame_rate,
            },
            destination: next_destination()?,
            duration_seconds: args.duration_seconds,
        })
    } else {
        None
    };

    let pipeline = MediaPipeline::start(
        &ctx,
        PipelineConfig {
            video,
            audio,
            ancillary,
            options: SenderOptions {
                local_ip: args.local_ip,
                core: CPU_NONE,
                loop_mode: args.loop_mode,
                wait_for_event: args.wait_event,
                sleep_us: args.sleep_us,
                start_lead_ns: 5_000_000_000,
            },
            cores: PipelineCores {
                video_converter: core(0),
                video_sender: core(1),
                audio_encoder: core(2),
                audio_sender: core(3),
            },
            disable_synchronization: args.disable_synchronization,
        },
    )?;

    let feed_result = feed_sources(&pipeline, &args, &video_format, &audio_format);
    let join_result = pipeline.join();
    feed_result.and(join_result)
}

/// Stands in for the external decoder: synthesizes frames and PCM at
/// the configured geometry and pushes them through the ingest queues.
fn feed_sources(
    pipeline: &MediaPipeline,
    args: &PlayerArgs,
    video_format: &VideoFormat,
    audio_format: &AudioFormat,
) -> Result<()> {
    let frames_per_iteration =
        (args.frame_rate * args.duration_seconds).floor().max(1);
    let template = args.video.then(|| synthesize_frame(video_format));

    loop {
        if args.video {
            let template = template.as_ref().ok_or(Error::NotInitialized)?;
            for _ in 0..frames_per_iteration {
                if util::shutdown::exit_requested() {
                    return Err(Error::Signal);
                }
                pipeline.submit_video(template.clone())?;
            }
        }
        if args.audio {
            let total_samples = args.duration_seconds * audio_format.sample_rate as u64;
            let mut remaining = total_samples;
            while remaining > 0 {
                if util::shutdown::exit_requested() {
                    return Err(Error::Signal);
                }
                let samples = remaining.min(1024) as usize;
                pipeline.submit_audio(synthesize_tone(audio_format, samples))?;
                remaining -= samples as u64;
            }
        }
        pipeline.finish()?;
        if !args.loop_mode {
            return Ok(());
        }
    }
}

fn synthesize_frame(format: &VideoFormat) -> VideoFrame {
    let Resolution { width, height } = format.resolution;
    let pixels = (width * height) as usize;
    let (planes, linesize) = match format.pixel_format {
        PixelFormat::Uyvy422 => {
            let row: Vec<u8> = (0..width as usize * 2).map(|i| (i % 251) as u8).collect();
            let mut buffer = Vec::with_capacity(pixels * 2);
            for _ in 0..height {
                buffer.extend_from_slice(&row);
            }
            (vec![buffer], [width as usize * 2, 0, 0])
        }
        PixelFormat::Yuv422p8 => (
            vec![
                (0..pixels).map(|i| (i % 219 + 16) as u8).collect(),
                vec![0x80; pixels / 2],
                vec![0x80; pixels / 2],
            ],
            [width as usize, width as usize / 2, 0],
        ),
        PixelFormat::Yuv422p10 => {
            let luma: Vec<u8> = (0..pixels)
                .flat_map(|i| ((i % 876 + 64) as u16).to_le_bytes())
                .collect();
            let chroma: Vec<u8> = (0..pixels / 2)
                .flat_map(|_| 512u16.to_le_bytes())
                .collect();
            (
                vec![luma, chroma.clone(), chroma],
                [width as usize * 2, width as usize, 0],
            )
        }
    };
    VideoFrame {
        format: format.pixel_format,
        width,
        height,
        planes,
        linesize,
        pts_ns: None,
    }
}

fn synthesize_tone(format: &AudioFormat, sample_frames: usize) -> AudioBuffer {
    // a coarse 1 kHz-ish square wave is plenty for a demo source
    let mut data = Vec::with_capacity(sample_frames * format.channels as usize * 4);
    for i in 0..sample_frames {
        let value: i32 = if (i / 24) % 2 == 0 { 1 << 26 } else { -(1 << 26) };
        for _ in 0..format.channels {
            data.extend_from_slice(&value.to_ne_bytes());
        }
    }
    AudioBuffer {
        sample_rate: format.sample_rate,
        channels: format.channels,
        format: SampleFormat::S32,
        data,
    }
}
