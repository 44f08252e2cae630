use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use rtp::ancillary::{AncillaryFramer, ANC_EXT_HEADER_SIZE, ANC_PAYLOAD_SIZE};
use rtp::audio::AudioFramer;
use rtp::params::{AncillaryFormat, AudioFormat, Scan, VideoFormat, VIDEO_CLOCK_RATE};
use rtp::video::{packets_per_frame_table, VideoFramer};
use transport::{EventChannel, TransportContext, TxStream, TxStreamConfig};
use util::clock::{time_to_rtp_timestamp, Clock};
use util::{Error, Rational, Result};

use crate::queue::{BoundedQueue, QueueItem};
use crate::schedule::{first_packet_time, TroParams, TxSchedule};
use crate::sync::{LoopSync, SyncHandle};
use crate::VideoFrame;

/// Simulated SSRC of generated video streams.
const VIDEO_SSRC: u32 = 0x0eb51dbd;

/// Packets per video chunk; any number works, the ring is sized from it.
const VIDEO_STRIDES_PER_CHUNK: usize = 256;

/// Sleep granularity of the ancillary generator, which would otherwise
/// flood the commit path.
const ANC_WAKEUP_DELTA: Duration = Duration::from_millis(10);

/// Shared knobs of all sender threads.
#[derive(Debug, Clone)]
pub struct SenderOptions {
    pub local_ip: Ipv4Addr,
    pub core: i64,
    pub loop_mode: bool,
    /// Park on the stream event channel instead of sleeping between
    /// retries.
    pub wait_for_event: bool,
    /// Retry sleep when not event-driven.
    pub sleep_us: u64,
    /// Lead time between startup and the first scheduled frame.
    pub start_lead_ns: u64,
}

impl Default for SenderOptions {
    fn default() -> Self {
        SenderOptions {
            local_ip: Ipv4Addr::LOCALHOST,
            core: util::affinity::CPU_NONE,
            loop_mode: false,
            wait_for_event: true,
            sleep_us: 100,
            start_lead_ns: 5_000_000_000,
        }
    }
}

fn commit_with_retry(
    stream: &mut TxStream,
    event: &Arc<EventChannel>,
    options: &SenderOptions,
    timeout_ns: u64,
) -> Result<()> {
    loop {
        match stream.commit_chunk(timeout_ns) {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() => wait_retry(event, options)?,
            Err(e) => return Err(e),
        }
    }
}

fn wait_for_chunk(
    stream: &TxStream,
    event: &Arc<EventChannel>,
    options: &SenderOptions,
) -> Result<()> {
    loop {
        match stream.chunk_ready() {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() => wait_retry(event, options)?,
            Err(e) => return Err(e),
        }
    }
}

fn wait_retry(event: &Arc<EventChannel>, options: &SenderOptions) -> Result<()> {
    if util::shutdown::exit_requested() {
        return Err(Error::Signal);
    }
    if options.wait_for_event {
        event.wait(Duration::from_secs(1))
    } else {
        std::thread::sleep(Duration::from_micros(options.sleep_us.max(1)));
        Ok(())
    }
}

fn teardown(stream: TxStream, what: &str) {
    let mut stream = stream;
    stream.cancel_unsent_chunks();
    if let Err(e) = stream.destroy() {
        log::warn!("destroying {what} stream: {e}");
    }
}

fn log_end(what: &str, result: &Result<()>) {
    match result {
        Ok(()) | Err(Error::Signal) => log::info!("done sending {what}"),
        Err(e) => log::error!("{what} sender failed: {e}"),
    }
}

/// ST 2110-20 sender stage: frames in, timed chunks out.
pub struct VideoSender {
    stream: TxStream,
    event: Arc<EventChannel>,
    framer: VideoFramer,
    schedule: TxSchedule,
    queue: Arc<BoundedQueue<VideoFrame>>,
    sync: Option<(Arc<LoopSync>, SyncHandle)>,
    options: SenderOptions,
    format: VideoFormat,
    tro: TroParams,
}

impl VideoSender {
    pub fn new(
        ctx: &TransportContext,
        format: VideoFormat,
        destination: SocketAddrV4,
        tro_modification: u16,
        queue: Arc<BoundedQueue<VideoFrame>>,
        sync: Option<(Arc<LoopSync>, SyncHandle)>,
        options: SenderOptions,
    ) -> Result<Self> {
        let framer = VideoFramer::new(format.clone(), VIDEO_SSRC)?;
        let plan = framer.plan();
        let packets_per_frame_field = plan.packets_per_frame_field();
        let chunks_per_frame_field =
            (packets_per_frame_field + VIDEO_STRIDES_PER_CHUNK - 1) / VIDEO_STRIDES_PER_CHUNK;

        // per-slot sizes of one frame/field, zero-padded to whole chunks
        let mut sizes = plan.sizes().to_vec();
        sizes.resize(chunks_per_frame_field * VIDEO_STRIDES_PER_CHUNK, 0);

        // enough ring blocks for about half a second of frames
        let fields = format.scan.fields_per_frame() as usize;
        let mem_blocks = ((format.frame_rate.floor() as usize / 2).max(2)) * fields;

        let stream = ctx.create_tx_stream(TxStreamConfig {
            local_ip: options.local_ip,
            destination,
            packets_per_chunk: VIDEO_STRIDES_PER_CHUNK,
            num_chunks: chunks_per_frame_field * mem_blocks,
            max_packet_size: plan.max_packet_size(),
            packet_sizes: Some(sizes),
            dscp: 0,
            memory: None,
        })?;
        let event = stream.event_channel();

        let clock = ctx.clock().clone();
        let tro = TroParams {
            scan: format.scan,
            height: format.resolution.height,
            packets_per_frame: packets_per_frame_table(format.resolution, format.pixel_format),
            tro_modification,
        };
        let t0 = first_packet_time(
            clock.now_ns() + options.start_lead_ns,
            &format.frame_rate,
            Some(&tro),
        )?;
        let interval = frame_field_interval(&format.frame_rate, format.scan)?;
        let mut framer = framer;
        let schedule = TxSchedule::new(clock.clone(), t0, interval)?;
        framer.set_timestamp_tick(schedule.timestamp_tick(VIDEO_CLOCK_RATE));

        Ok(VideoSender {
            stream,
            event,
            framer,
            schedule,
            queue,
            sync,
            options,
            format,
            tro,
        })
    }

    pub fn run(mut self) {
        let result = self.run_inner();
        log_end("video", &result);
        teardown(self.stream, "video");
    }

    fn run_inner(&mut self) -> Result<()> {
        util::affinity::pin_current_to_core(self.options.core)?;
        util::affinity::set_time_critical_priority();
        self.schedule.sleep_until_start();
        log::info!("video sender is on");

        loop {
            let frame = match self.queue.pop()? {
                QueueItem::Item(frame) => frame,
                QueueItem::Eof => {
                    if !self.options.loop_mode {
                        return Ok(());
                    }
                    self.realign_after_eof()?;
                    continue;
                }
            };

            for _ in 0..self.format.scan.fields_per_frame() {
                self.send_frame_field(&frame)?;
            }
        }
    }

    fn send_frame_field(&mut self, frame: &VideoFrame) -> Result<()> {
        let frame_ref = frame.frame_ref();
        let mut cursor = self.framer.begin_frame_field();
        let mut chunk_index = 0usize;
        while !cursor.done() {
            wait_for_chunk(&self.stream, &self.event, &self.options)?;
            {
                let mut chunk = self.stream.get_next_chunk()?;
                let mut stride = 0usize;
                while stride < VIDEO_STRIDES_PER_CHUNK && !cursor.done() {
                    let buf = chunk.packet_mut(stride)?;
                    self.framer.fill_packet(buf, &mut cursor, &frame_ref)?;
                    stride += 1;
                }
            }
            let timeout = self.schedule.commit_timeout(chunk_index == 0);
            commit_with_retry(&mut self.stream, &self.event, &self.options, timeout)?;
            chunk_index += 1;
        }
        self.framer.end_frame_field();
        self.schedule.advance_frame_field();
        Ok(())
    }

    fn realign_after_eof(&mut self) -> Result<()> {
        if let Some((sync, handle)) = &self.sync {
            let released_at = sync.rendezvous(handle, self.schedule.next_send_ns())?;
            let t0 = first_packet_time(released_at, &self.format.frame_rate, Some(&self.tro))?;
            self.schedule.realign(t0.floor());
            self.framer
                .set_timestamp_tick(self.schedule.timestamp_tick(VIDEO_CLOCK_RATE));
        }
        Ok(())
    }
}

/// ST 2110-30 sender stage: encoded PCM in, uniformly sized chunks out.
pub struct AudioSender {
    stream: TxStream,
    event: Arc<EventChannel>,
    framer: AudioFramer,
    schedule: TxSchedule,
    queue: Arc<BoundedQueue<Vec<u8>>>,
    sync: Option<(Arc<LoopSync>, SyncHandle)>,
    options: SenderOptions,
    alignment_rate: Rational,
    packets_per_chunk: usize,
    fifo: Vec<u8>,
    sample_rate: u32,
}

impl AudioSender {
    pub fn new(
        ctx: &TransportContext,
        format: AudioFormat,
        destination: SocketAddrV4,
        alignment_rate: Rational,
        queue: Arc<BoundedQueue<Vec<u8>>>,
        sync: Option<(Arc<LoopSync>, SyncHandle)>,
        options: SenderOptions,
    ) -> Result<Self> {
        let framer = AudioFramer::new(format.clone())?;
        let samples_per_packet = framer.samples_per_packet();
        // about three source buffers (1024 samples each) per chunk
        let packets_per_chunk = (3 * 1024 / samples_per_packet.max(1)).max(1);
        let num_chunks = 50;

        let stream = ctx.create_tx_stream(TxStreamConfig {
            local_ip: options.local_ip,
            destination,
            packets_per_chunk,
            num_chunks,
            max_packet_size: framer.packet_size(),
            packet_sizes: Some(vec![framer.packet_size() as u16; packets_per_chunk]),
            dscp: rtp::params::DSCP_MEDIA_RTP_CLASS,
            memory: None,
        })?;
        let event = stream.event_channel();

        let clock = ctx.clock().clone();
        let t0 = first_packet_time(
            clock.now_ns() + options.start_lead_ns,
            &alignment_rate,
            None,
        )?;
        // a chunk spans packets_per_chunk packet times
        let interval =
            Rational::from_integer(packets_per_chunk as u64 * format.ptime_us * 1_000);
        let mut framer = framer;
        let schedule = TxSchedule::new(clock, t0, interval)?;
        framer.set_timestamp_tick(schedule.timestamp_tick(format.sample_rate));

        Ok(AudioSender {
            stream,
            event,
            framer,
            schedule,
            queue,
            sync,
            options,
            alignment_rate,
            packets_per_chunk,
            fifo: Vec::new(),
            sample_rate: format.sample_rate,
        })
    }

    pub fn run(mut self) {
        let result = self.run_inner();
        log_end("audio", &result);
        teardown(self.stream, "audio");
    }

    fn run_inner(&mut self) -> Result<()> {
        util::affinity::pin_current_to_core(self.options.core)?;
        util::affinity::set_time_critical_priority();
        self.schedule.sleep_until_start();
        log::info!("audio sender is on");

        let chunk_bytes = self.packets_per_chunk * self.framer.payload_size();
        loop {
            // gather a full chunk of payload before touching the ring
            while self.fifo.len() < chunk_bytes {
                match self.queue.pop()? {
                    QueueItem::Item(pcm) => self.fifo.extend_from_slice(&pcm),
                    QueueItem::Eof => {
                        if !self.options.loop_mode {
                            return Ok(());
                        }
                        self.realign_after_eof()?;
                        self.fifo.clear();
                    }
                }
            }

            wait_for_chunk(&self.stream, &self.event, &self.options)?;
            {
                let mut chunk = self.stream.get_next_chunk()?;
                for i in 0..self.packets_per_chunk {
                    let buf = chunk.packet_mut(i)?;
                    let payload_len = self.framer.payload_size();
                    self.framer.fill_packet(buf, &self.fifo[..payload_len])?;
                    self.fifo.drain(..payload_len);
                }
            }
            let timeout = self.schedule.commit_timeout(true);
            commit_with_retry(&mut self.stream, &self.event, &self.options, timeout)?;
            self.schedule.advance_frame_field();
        }
    }

    fn realign_after_eof(&mut self) -> Result<()> {
        if let Some((sync, handle)) = &self.sync {
            let released_at = sync.rendezvous(handle, self.schedule.next_send_ns())?;
            let t0 = first_packet_time(released_at, &self.alignment_rate, None)?;
            self.schedule.realign(t0.floor());
            self.framer
                .set_timestamp_tick(self.schedule.timestamp_tick(self.sample_rate));
        }
        Ok(())
    }
}

/// ST 2110-40 sender stage: self-generating, one ANC packet per
/// frame/field, batched wake-ups.
pub struct AncillarySender {
    stream: TxStream,
    event: Arc<EventChannel>,
    framer: AncillaryFramer,
    schedule: TxSchedule,
    sync: Option<(Arc<LoopSync>, SyncHandle)>,
    options: SenderOptions,
    frame_rate: Rational,
    fields_per_iteration: u64,
    fields_per_second: u64,
    clock: Clock,
}

impl AncillarySender {
    pub fn new(
        ctx: &TransportContext,
        format: AncillaryFormat,
        destination: SocketAddrV4,
        duration_seconds: u64,
        sync: Option<(Arc<LoopSync>, SyncHandle)>,
        options: SenderOptions,
    ) -> Result<Self> {
        let frame_rate = format.frame_rate;
        if frame_rate.is_zero() {
            return Err(Error::invalid_argument("zero ancillary frame rate"));
        }
        let fields = format.scan.fields_per_frame() as u64;
        let fields_per_second = frame_rate.floor().max(1) * fields;
        let fields_per_iteration = (frame_rate * duration_seconds).floor().max(1) * fields;

        let packet_capacity = ANC_PAYLOAD_SIZE + ANC_EXT_HEADER_SIZE;
        let stream = ctx.create_tx_stream(TxStreamConfig {
            local_ip: options.local_ip,
            destination,
            packets_per_chunk: 1,
            num_chunks: (100 * frame_rate.floor().max(1)) as usize,
            max_packet_size: packet_capacity,
            packet_sizes: None,
            dscp: 0,
            memory: None,
        })?;
        let event = stream.event_channel();

        let clock = ctx.clock().clone();
        let t0 = first_packet_time(clock.now_ns() + options.start_lead_ns, &frame_rate, None)?;
        let interval = frame_field_interval(&frame_rate, format.scan)?;
        let framer = AncillaryFramer::new(format);
        let schedule = TxSchedule::new(clock.clone(), t0, interval)?;

        Ok(AncillarySender {
            stream,
            event,
            framer,
            schedule,
            sync,
            options,
            frame_rate,
            fields_per_iteration,
            fields_per_second,
            clock,
        })
    }

    pub fn run(mut self) {
        let result = self.run_inner();
        log_end("ancillary", &result);
        teardown(self.stream, "ancillary");
    }

    fn run_inner(&mut self) -> Result<()> {
        util::affinity::pin_current_to_core(self.options.core)?;
        self.clock
            .go_to_sleep(self.schedule.next_send_ns(), 1_000_000_000);
        log::info!("ancillary sender is on");

        loop {
            for field_index in 0..self.fields_per_iteration {
                if util::shutdown::exit_requested() {
                    return Err(Error::Signal);
                }
                if (field_index + 1) % self.fields_per_second == 0 {
                    // wake up about once per second of content instead of
                    // flooding the commit path
                    self.clock
                        .go_to_sleep(self.schedule.next_send_ns(), ANC_WAKEUP_DELTA.as_nanos() as u64);
                }

                wait_for_chunk(&self.stream, &self.event, &self.options)?;
                let tick =
                    time_to_rtp_timestamp(self.schedule.next_send_ns(), VIDEO_CLOCK_RATE) as u32;
                {
                    let mut chunk = self.stream.get_next_chunk()?;
                    let buf = chunk.packet_mut(0)?;
                    let written = self.framer.fill_packet(buf, tick)?;
                    chunk.set_packet_size(0, written as u16)?;
                }
                let timeout = self.schedule.commit_timeout(true);
                commit_with_retry(&mut self.stream, &self.event, &self.options, timeout)?;
                self.schedule.advance_frame_field();
            }

            if !self.options.loop_mode {
                return Ok(());
            }
            if let Some((sync, handle)) = &self.sync {
                let released_at = sync.rendezvous(handle, self.schedule.next_send_ns())?;
                let t0 = first_packet_time(released_at, &self.frame_rate, None)?;
                self.schedule.realign(t0.floor());
            }
        }
    }
}

pub(crate) fn frame_field_interval(frame_rate: &Rational, scan: Scan) -> Result<Rational> {
    let t_frame = Rational::from_integer(1_000_000_000).checked_div(frame_rate)?;
    Ok(match scan {
        Scan::Progressive => t_frame,
        Scan::Interlaced => t_frame / 2,
    })
}
