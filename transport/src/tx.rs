use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use portable_atomic::AtomicU64;

use mem::{new_allocator, MemoryKind, Region};
use util::clock::Clock;
use util::{Error, Result};

use crate::event::EventChannel;
use crate::layout::PacketLayout;
use crate::ring::SlotMemory;
use crate::stats::StreamStats;
use crate::StreamId;

/// Teardown retry pause while the hardware side still holds chunks.
pub const DESTROY_RETRY: Duration = Duration::from_millis(300);

const WORKER_POLL: Duration = Duration::from_millis(100);

/// Send-stream construction parameters.
pub struct TxStreamConfig {
    pub local_ip: Ipv4Addr,
    pub destination: SocketAddrV4,
    pub packets_per_chunk: usize,
    pub num_chunks: usize,
    /// Entry size of the single payload sub-block; every packet of the
    /// stream fits in it.
    pub max_packet_size: usize,
    /// Static per-slot size table repeated over the ring (media mode);
    /// zero entries are skipped at send time. `None` selects dynamic
    /// sizing through [`ChunkSlot::set_packet_size`].
    pub packet_sizes: Option<Vec<u16>>,
    /// DSCP class of the emitted traffic.
    pub dscp: u8,
    /// Application-owned payload region; allocated internally when
    /// absent.
    pub memory: Option<Region>,
}

struct CommitMsg {
    timeout_ns: u64,
}

struct TxShared {
    memory: SlotMemory,
    sizes: Box<[AtomicU16]>,
    released_chunks: AtomicU64,
    pending_chunks: AtomicU64,
    failed: AtomicBool,
    cancelled: AtomicBool,
    event: Arc<EventChannel>,
    stats: Arc<StreamStats>,
    clock: Clock,
    destination: SocketAddrV4,
}

/// One TX stream: a chunk ring co-owned with a worker thread that plays
/// the hardware role, transmitting committed chunks at their scheduled
/// times. Commits and completions are strictly FIFO.
pub struct TxStream {
    id: StreamId,
    shared: Arc<TxShared>,
    acquired_chunks: u64,
    chunk_armed: bool,
    dynamic_sizes: bool,
    commit_tx: Option<SyncSender<CommitMsg>>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for TxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxStream")
            .field("id", &self.id)
            .field("acquired_chunks", &self.acquired_chunks)
            .field("chunk_armed", &self.chunk_armed)
            .field("dynamic_sizes", &self.dynamic_sizes)
            .finish()
    }
}

impl TxStream {
    pub(crate) fn new(
        id: StreamId,
        config: TxStreamConfig,
        clock: Clock,
        internal_core: i64,
    ) -> Result<Self> {
        let layout = PacketLayout::single(
            config.packets_per_chunk,
            config.num_chunks,
            config.max_packet_size,
        )?;
        let total = layout.total_packets();

        let sizes: Box<[AtomicU16]> = match &config.packet_sizes {
            Some(pattern) => {
                if pattern.is_empty() || total % pattern.len() != 0 {
                    return Err(Error::invalid_argument(format!(
                        "size table of {} entries does not tile a ring of {total} packets",
                        pattern.len()
                    )));
                }
                if let Some(&bad) = pattern
                    .iter()
                    .find(|&&s| s as usize > config.max_packet_size)
                {
                    return Err(Error::invalid_argument(format!(
                        "packet size {bad} exceeds max {}",
                        config.max_packet_size
                    )));
                }
                (0..total)
                    .map(|i| AtomicU16::new(pattern[i % pattern.len()]))
                    .collect()
            }
            None => (0..total).map(|_| AtomicU16::new(0)).collect(),
        };

        let payload = match config.memory {
            Some(region) => region,
            None => {
                let allocator = new_allocator(MemoryKind::Malloc)?;
                Region::whole(allocator.allocate(layout.payload_bytes(), util::cache_line_size())?)
            }
        };
        let memory = SlotMemory::new(layout, None, payload)?;

        let socket = UdpSocket::bind(SocketAddrV4::new(config.local_ip, 0))?;
        set_dscp(&socket, config.dscp);

        let shared = Arc::new(TxShared {
            memory,
            sizes,
            released_chunks: AtomicU64::new(0),
            pending_chunks: AtomicU64::new(0),
            failed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            event: EventChannel::new(),
            stats: Arc::new(StreamStats::default()),
            clock,
            destination: config.destination,
        });

        let (commit_tx, commit_rx) = std::sync::mpsc::sync_channel(config.num_chunks);
        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name(format!("tx-stream-{}", id.raw()))
            .spawn(move || worker_loop(worker_shared, commit_rx, socket, internal_core))
            .map_err(|e| Error::Io(format!("spawning tx worker: {e}")))?;

        log::info!("created tx stream {} -> {}", id.raw(), config.destination);
        Ok(TxStream {
            id,
            shared,
            acquired_chunks: 0,
            chunk_armed: false,
            dynamic_sizes: config.packet_sizes.is_none(),
            commit_tx: Some(commit_tx),
            worker: Some(worker),
        })
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn stats(&self) -> Arc<StreamStats> {
        self.shared.stats.clone()
    }

    pub fn event_channel(&self) -> Arc<EventChannel> {
        self.shared.event.clone()
    }

    pub fn packets_per_chunk(&self) -> usize {
        self.shared.memory.layout().packets_per_chunk
    }

    /// Probes whether [`TxStream::get_next_chunk`] would succeed right
    /// now, without taking the chunk. Lets callers park on the event
    /// channel before acquiring.
    pub fn chunk_ready(&self) -> Result<()> {
        if util::shutdown::exit_requested() {
            return Err(Error::Signal);
        }
        if self.shared.failed.load(Ordering::Relaxed) {
            return Err(Error::HwCompletionIssue);
        }
        if self.chunk_armed {
            return Ok(());
        }
        let num_chunks = self.shared.memory.layout().num_chunks as u64;
        let in_flight = self.acquired_chunks - self.shared.released_chunks.load(Ordering::Acquire);
        if in_flight >= num_chunks {
            return Err(Error::NoFreeChunk);
        }
        Ok(())
    }

    /// Acquires the next free chunk of the ring. Until it is committed,
    /// repeated calls return the same chunk.
    pub fn get_next_chunk(&mut self) -> Result<ChunkSlot<'_>> {
        if util::shutdown::exit_requested() {
            return Err(Error::Signal);
        }
        if self.shared.failed.load(Ordering::Relaxed) {
            return Err(Error::HwCompletionIssue);
        }
        let num_chunks = self.shared.memory.layout().num_chunks as u64;
        if !self.chunk_armed {
            let in_flight =
                self.acquired_chunks - self.shared.released_chunks.load(Ordering::Acquire);
            if in_flight >= num_chunks {
                return Err(Error::NoFreeChunk);
            }
            self.chunk_armed = true;
        }
        let base_slot = self.acquired_chunks * self.shared.memory.layout().packets_per_chunk as u64;
        Ok(ChunkSlot {
            shared: &*self.shared,
            base_slot,
            dynamic: self.dynamic_sizes,
        })
    }

    /// Hands the acquired chunk to the hardware side. `timeout_ns` is a
    /// transport-domain wall time for the first packet; zero means "as
    /// soon as the previous chunk is out".
    pub fn commit_chunk(&mut self, timeout_ns: u64) -> Result<()> {
        if util::shutdown::exit_requested() {
            return Err(Error::Signal);
        }
        if self.shared.failed.load(Ordering::Relaxed) {
            return Err(Error::HwCompletionIssue);
        }
        if !self.chunk_armed {
            return Err(Error::invalid_argument("no chunk acquired"));
        }
        let sender = self.commit_tx.as_ref().ok_or(Error::NotInitialized)?;
        match sender.try_send(CommitMsg { timeout_ns }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => return Err(Error::QueueFull),
            Err(TrySendError::Disconnected(_)) => return Err(Error::HwCompletionIssue),
        }
        self.shared.pending_chunks.fetch_add(1, Ordering::Relaxed);
        self.shared
            .stats
            .committed_chunks
            .fetch_add(1, Ordering::Relaxed);
        self.acquired_chunks += 1;
        self.chunk_armed = false;
        Ok(())
    }

    /// Marks every not-yet-transmitted commit as cancelled; the worker
    /// releases them without sending.
    pub fn cancel_unsent_chunks(&mut self) {
        self.shared.cancelled.store(true, Ordering::Relaxed);
    }

    /// Tears the stream down, waiting out in-flight chunks. Retries
    /// internally while the hardware side is `Busy`.
    pub fn destroy(mut self) -> Result<()> {
        self.teardown();
        Ok(())
    }

    fn teardown(&mut self) {
        let mut tries = 0u32;
        while self.shared.pending_chunks.load(Ordering::Relaxed) > 0 {
            if util::shutdown::exit_requested() || tries >= 20 {
                self.shared.cancelled.store(true, Ordering::Relaxed);
            }
            if tries >= 40 {
                log::warn!("tx stream {}: abandoning pending chunks", self.id.raw());
                break;
            }
            tries += 1;
            std::thread::sleep(DESTROY_RETRY);
        }
        self.commit_tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        log::info!("destroyed tx stream {}", self.id.raw());
    }
}

impl Drop for TxStream {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.shared.cancelled.store(true, Ordering::Relaxed);
            self.teardown();
        }
    }
}

/// Application view of one acquired chunk.
pub struct ChunkSlot<'a> {
    shared: &'a TxShared,
    base_slot: u64,
    dynamic: bool,
}

impl std::fmt::Debug for ChunkSlot<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkSlot")
            .field("base_slot", &self.base_slot)
            .field("dynamic", &self.dynamic)
            .finish()
    }
}

impl ChunkSlot<'_> {
    pub fn packets(&self) -> usize {
        self.shared.memory.layout().packets_per_chunk
    }

    /// Writable packet slot `i` of this chunk (the full stride entry).
    pub fn packet_mut(&mut self, i: usize) -> Result<&mut [u8]> {
        if i >= self.packets() {
            return Err(Error::invalid_argument(format!("packet {i} out of chunk")));
        }
        // exclusive: the chunk is acquired and not yet committed
        Ok(unsafe { self.shared.memory.payload_slot_mut(self.base_slot + i as u64) })
    }

    /// Declares the wire size of packet `i`. Zero-sized packets are
    /// skipped at transmission. Only dynamic-size streams may resize.
    pub fn set_packet_size(&mut self, i: usize, size: u16) -> Result<()> {
        if !self.dynamic {
            return Err(Error::unsupported("static-size stream"));
        }
        if i >= self.packets() {
            return Err(Error::invalid_argument(format!("packet {i} out of chunk")));
        }
        if size as usize > self.shared.memory.layout().payload_block().entry_size {
            return Err(Error::invalid_argument(format!(
                "size {size} exceeds stream entry size"
            )));
        }
        let total = self.shared.memory.layout().total_packets() as u64;
        let index = ((self.base_slot + i as u64) % total) as usize;
        self.shared.sizes[index].store(size, Ordering::Relaxed);
        Ok(())
    }

    pub fn packet_size(&self, i: usize) -> u16 {
        let total = self.shared.memory.layout().total_packets() as u64;
        let index = ((self.base_slot + i as u64) % total) as usize;
        self.shared.sizes[index].load(Ordering::Relaxed)
    }
}

fn worker_loop(
    shared: Arc<TxShared>,
    commits: Receiver<CommitMsg>,
    socket: UdpSocket,
    internal_core: i64,
) {
    if let Err(e) = util::affinity::pin_current_to_core(internal_core) {
        log::warn!("tx worker affinity: {e}");
    }
    util::affinity::set_time_critical_priority();

    let packets_per_chunk = shared.memory.layout().packets_per_chunk as u64;
    let total = shared.memory.layout().total_packets() as u64;
    let mut chunk_cursor: u64 = 0;

    loop {
        let msg = match commits.recv_timeout(WORKER_POLL) {
            Ok(msg) => msg,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        if !shared.cancelled.load(Ordering::Relaxed) {
            if msg.timeout_ns > 0 {
                let wake = shared.clock.from_transport_clock(msg.timeout_ns);
                sleep_until_interruptible(&shared, wake);
            }
        }
        if !shared.cancelled.load(Ordering::Relaxed) {
            let base = chunk_cursor * packets_per_chunk;
            let mut packets = 0u64;
            let mut bytes = 0u64;
            for i in 0..packets_per_chunk {
                let slot = base + i;
                let size = shared.sizes[(slot % total) as usize].load(Ordering::Relaxed) as usize;
                if size == 0 {
                    continue;
                }
                // the committed chunk is owned by this side until release
                let data = unsafe { shared.memory.payload_slot(slot) };
                match socket.send_to(&data[..size], shared.destination) {
                    Ok(_) => {
                        packets += 1;
                        bytes += size as u64;
                    }
                    Err(e) => {
                        log::error!("tx send failed: {e}");
                        shared.failed.store(true, Ordering::Relaxed);
                        break;
                    }
                }
            }
            shared.stats.on_sent(packets, bytes);
        }

        chunk_cursor += 1;
        shared.pending_chunks.fetch_sub(1, Ordering::Relaxed);
        shared.released_chunks.fetch_add(1, Ordering::Release);
        shared.event.notify();
    }
}

/// Sleeps towards `wake_ns` in short slices so cancellation and
/// shutdown cut the wait short.
fn sleep_until_interruptible(shared: &TxShared, wake_ns: u64) {
    loop {
        if shared.cancelled.load(Ordering::Relaxed) || util::shutdown::exit_requested() {
            return;
        }
        let now = shared.clock.now_ns();
        if now >= wake_ns {
            return;
        }
        let remaining = Duration::from_nanos(wake_ns - now);
        std::thread::sleep(remaining.min(Duration::from_millis(50)));
    }
}

#[cfg(not(windows))]
fn set_dscp(socket: &UdpSocket, dscp: u8) {
    use std::os::fd::AsRawFd;
    let tos = (dscp as libc::c_int) << 2;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_TOS,
            &tos as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        log::warn!("failed to set DSCP {dscp}: {}", std::io::Error::last_os_error());
    }
}

#[cfg(windows)]
fn set_dscp(_socket: &UdpSocket, _dscp: u8) {}
