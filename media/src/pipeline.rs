use std::net::SocketAddrV4;
use std::sync::Arc;
use std::thread::JoinHandle;

use rtp::params::{AncillaryFormat, AudioFormat, VideoFormat};
use transport::TransportContext;
use util::affinity::CPU_NONE;
use util::{Error, Rational, Result};

use crate::convert::{encode_s24be, VideoConverter};
use crate::frame::{AudioBuffer, VideoFrame};
use crate::queue::{BoundedQueue, QueueItem};
use crate::sender::{AncillarySender, AudioSender, SenderOptions, VideoSender};
use crate::sync::LoopSync;

/// Stage queue depths, in frames/buffers.
const VIDEO_QUEUE_DEPTH: usize = 50;
const AUDIO_QUEUE_DEPTH: usize = 90;

/// Which media types a program carries.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamSelection {
    pub video: bool,
    pub audio: bool,
    pub ancillary: bool,
}

/// Per-stage CPU pinning, mirroring the player's six-core layout minus
/// the external reader threads.
#[derive(Debug, Clone, Copy)]
pub struct PipelineCores {
    pub video_converter: i64,
    pub video_sender: i64,
    pub audio_encoder: i64,
    pub audio_sender: i64,
}

impl Default for PipelineCores {
    fn default() -> Self {
        PipelineCores {
            video_converter: CPU_NONE,
            video_sender: CPU_NONE,
            audio_encoder: CPU_NONE,
            audio_sender: CPU_NONE,
        }
    }
}

pub struct VideoPipelineConfig {
    pub format: VideoFormat,
    pub destination: SocketAddrV4,
    pub tro_modification: u16,
}

pub struct AudioPipelineConfig {
    pub format: AudioFormat,
    pub destination: SocketAddrV4,
}

pub struct AncillaryPipelineConfig {
    pub format: AncillaryFormat,
    pub destination: SocketAddrV4,
    /// Content seconds per iteration (the generator has no file to hit
    /// EOF on).
    pub duration_seconds: u64,
}

pub struct PipelineConfig {
    pub video: Option<VideoPipelineConfig>,
    pub audio: Option<AudioPipelineConfig>,
    pub ancillary: Option<AncillaryPipelineConfig>,
    pub options: SenderOptions,
    pub cores: PipelineCores,
    pub disable_synchronization: bool,
}

/// The TX stage graph: ingest queues feeding converter/encoder stages
/// feeding per-stream sender threads, with an optional loop-mode EOF
/// synchronizer tying the streams together.
pub struct MediaPipeline {
    video_in: Option<Arc<BoundedQueue<VideoFrame>>>,
    audio_in: Option<Arc<BoundedQueue<AudioBuffer>>>,
    threads: Vec<JoinHandle<()>>,
    sync: Option<Arc<LoopSync>>,
}

impl MediaPipeline {
    pub fn start(ctx: &TransportContext, config: PipelineConfig) -> Result<Self> {
        if config.ancillary.is_some() && config.video.is_none() {
            return Err(Error::invalid_argument(
                "an ancillary stream needs a video stream to pace against",
            ));
        }
        if config.video.is_none() && config.audio.is_none() && config.ancillary.is_none() {
            return Err(Error::invalid_argument("no streams selected"));
        }

        let stream_count = config.video.is_some() as usize
            + config.audio.is_some() as usize
            + config.ancillary.is_some() as usize;
        let sync = if config.options.loop_mode && !config.disable_synchronization {
            Some(LoopSync::new())
        } else {
            None
        };
        let mut handles = Vec::new();
        if let Some(sync) = &sync {
            for _ in 0..stream_count {
                handles.push(sync.register());
            }
        }
        let mut handles = handles.into_iter();
        let mut threads = Vec::new();

        let video_fps = config.video.as_ref().map(|v| v.format.frame_rate);

        let mut video_in = None;
        if let Some(video) = config.video {
            let ingest: Arc<BoundedQueue<VideoFrame>> = BoundedQueue::new(VIDEO_QUEUE_DEPTH);
            let send_queue: Arc<BoundedQueue<VideoFrame>> = BoundedQueue::new(VIDEO_QUEUE_DEPTH);

            let sender = VideoSender::new(
                ctx,
                video.format,
                video.destination,
                video.tro_modification,
                send_queue.clone(),
                sync.clone().zip(handles.next()),
                SenderOptions {
                    core: config.cores.video_sender,
                    ..config.options.clone()
                },
            )?;
            threads.push(spawn_named("video-sender", move || sender.run())?);

            let converter_core = config.cores.video_converter;
            let converter_in = ingest.clone();
            threads.push(spawn_named("video-converter", move || {
                converter_stage(converter_in, send_queue, converter_core)
            })?);
            video_in = Some(ingest);
        }

        let mut audio_in = None;
        if let Some(audio) = config.audio {
            let ingest: Arc<BoundedQueue<AudioBuffer>> = BoundedQueue::new(AUDIO_QUEUE_DEPTH);
            let send_queue: Arc<BoundedQueue<Vec<u8>>> = BoundedQueue::new(AUDIO_QUEUE_DEPTH);

            // audio aligns against the video cadence when present, its
            // own packet cadence otherwise
            let alignment_rate = match video_fps {
                Some(fps) => fps,
                None => Rational::from_ratio(1_000_000, audio.format.ptime_us.max(1))
                    .unwrap_or(Rational::from_integer(50)),
            };
            let sender = AudioSender::new(
                ctx,
                audio.format,
                audio.destination,
                alignment_rate,
                send_queue.clone(),
                sync.clone().zip(handles.next()),
                SenderOptions {
                    core: config.cores.audio_sender,
                    ..config.options.clone()
                },
            )?;
            threads.push(spawn_named("audio-sender", move || sender.run())?);

            let encoder_core = config.cores.audio_encoder;
            let encoder_in = ingest.clone();
            threads.push(spawn_named("audio-encoder", move || {
                encoder_stage(encoder_in, send_queue, encoder_core)
            })?);
            audio_in = Some(ingest);
        }

        if let Some(ancillary) = config.ancillary {
            let sender = AncillarySender::new(
                ctx,
                ancillary.format,
                ancillary.destination,
                ancillary.duration_seconds,
                sync.clone().zip(handles.next()),
                config.options.clone(),
            )?;
            threads.push(spawn_named("ancillary-sender", move || sender.run())?);
        }

        if let Some(sync) = &sync {
            let runner = sync.clone();
            threads.push(spawn_named("stream-synchronizer", move || runner.run())?);
        }

        Ok(MediaPipeline {
            video_in,
            audio_in,
            threads,
            sync,
        })
    }

    /// Frame-level TX entry point for video.
    pub fn submit_video(&self, frame: VideoFrame) -> Result<()> {
        self.video_in
            .as_ref()
            .ok_or_else(|| Error::invalid_argument("pipeline has no video stream"))?
            .push(QueueItem::Item(frame))
    }

    /// Frame-level TX entry point for audio.
    pub fn submit_audio(&self, buffer: AudioBuffer) -> Result<()> {
        self.audio_in
            .as_ref()
            .ok_or_else(|| Error::invalid_argument("pipeline has no audio stream"))?
            .push(QueueItem::Item(buffer))
    }

    /// Propagates EOF through every ingest queue. In loop mode the
    /// source pushes the next iteration's frames right after.
    pub fn finish(&self) -> Result<()> {
        if let Some(queue) = &self.video_in {
            queue.push(QueueItem::Eof)?;
        }
        if let Some(queue) = &self.audio_in {
            queue.push(QueueItem::Eof)?;
        }
        Ok(())
    }

    /// Waits for every stage to drain and exit.
    pub fn join(mut self) -> Result<()> {
        if let Some(sync) = self.sync.take() {
            // the synchronizer would otherwise wait for the next round
            sync.close();
        }
        let mut failed = false;
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                failed = true;
            }
        }
        if failed {
            Err(Error::Io("a pipeline stage panicked".into()))
        } else {
            Ok(())
        }
    }
}

fn spawn_named(
    name: &str,
    body: impl FnOnce() + Send + 'static,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(|e| Error::Io(format!("spawning {name}: {e}")))
}

fn converter_stage(
    input: Arc<BoundedQueue<VideoFrame>>,
    output: Arc<BoundedQueue<VideoFrame>>,
    core: i64,
) {
    if let Err(e) = util::affinity::pin_current_to_core(core) {
        log::warn!("video converter affinity: {e}");
    }
    loop {
        let item = match input.pop() {
            Ok(item) => item,
            Err(_) => return,
        };
        let forward = match item {
            QueueItem::Eof => QueueItem::Eof,
            QueueItem::Item(frame) => match VideoConverter::convert(frame) {
                Ok(frame) => QueueItem::Item(frame),
                Err(e) => {
                    log::error!("dropping unconvertible frame: {e}");
                    continue;
                }
            },
        };
        if output.push(forward).is_err() {
            return;
        }
    }
}

fn encoder_stage(
    input: Arc<BoundedQueue<AudioBuffer>>,
    output: Arc<BoundedQueue<Vec<u8>>>,
    core: i64,
) {
    if let Err(e) = util::affinity::pin_current_to_core(core) {
        log::warn!("audio encoder affinity: {e}");
    }
    loop {
        let item = match input.pop() {
            Ok(item) => item,
            Err(_) => return,
        };
        let forward = match item {
            QueueItem::Eof => QueueItem::Eof,
            QueueItem::Item(buffer) => match encode_s24be(&buffer) {
                Ok(encoded) => QueueItem::Item(encoded),
                Err(e) => {
                    log::error!("dropping unencodable audio buffer: {e}");
                    continue;
                }
            },
        };
        if output.push(forward).is_err() {
            return;
        }
    }
}
