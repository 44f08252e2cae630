use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use portable_atomic::AtomicU64;

use mem::{allocate_with_fallback, new_allocator, DeviceIface, MemoryKind, Region};
use util::clock::Clock;
use util::{Error, Result};

use crate::event::EventChannel;
use crate::flow::FourTupleFlow;
use crate::layout::PacketLayout;
use crate::ring::{PacketRecord, PacketRecords, SlotMemory};
use crate::stats::StreamStats;
use crate::StreamId;

const WORKER_POLL: Duration = Duration::from_millis(100);

/// Latency/CPU trade of the receive side: a completion carries at least
/// `min_chunk` packets (when any arrive), at most `max_chunk`, and the
/// engine waits at most `wait_timeout_ns` to gather the minimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionModeration {
    pub min_chunk: usize,
    pub max_chunk: usize,
    pub wait_timeout_ns: u64,
}

impl Default for CompletionModeration {
    fn default() -> Self {
        CompletionModeration {
            min_chunk: 0,
            max_chunk: 5000,
            wait_timeout_ns: 0,
        }
    }
}

/// Receive-stream construction parameters.
pub struct RxStreamConfig {
    pub nic: DeviceIface,
    /// Ring capacity in packets.
    pub capacity_packets: usize,
    pub payload_size: usize,
    /// Non-zero selects header-data split with this app-header size.
    pub header_size: usize,
    pub moderation: CompletionModeration,
    /// Allocator for internally-owned memory.
    pub allocator: MemoryKind,
    /// Application-owned regions (header first when HDS); when absent
    /// the stream allocates its own.
    pub memory: Option<RxMemory>,
}

/// Application-provided backing memory for a receive ring.
pub struct RxMemory {
    pub header: Option<Region>,
    pub payload: Region,
}

struct RxShared {
    memory: SlotMemory,
    records: PacketRecords,
    produced: AtomicU64,
    released: AtomicU64,
    failed: AtomicBool,
    event: Arc<EventChannel>,
    stats: Arc<StreamStats>,
    clock: Clock,
}

enum FlowCmd {
    Attach(FourTupleFlow, UdpSocket),
    Detach(u32),
}

/// One RX stream: flows steer packets into a pre-registered ring written
/// by the hardware side; the application drains it in moderated
/// completion chunks and releases slots once done with their bytes.
pub struct RxStream {
    id: StreamId,
    shared: Arc<RxShared>,
    moderation: CompletionModeration,
    consumed: u64,
    attached: Vec<FourTupleFlow>,
    cmd_tx: Option<Sender<FlowCmd>>,
    worker: Option<JoinHandle<()>>,
    nic: DeviceIface,
}

impl RxStream {
    pub(crate) fn new(
        id: StreamId,
        config: RxStreamConfig,
        clock: Clock,
        internal_core: i64,
    ) -> Result<Self> {
        if config.capacity_packets == 0 {
            return Err(Error::invalid_argument("zero ring capacity"));
        }
        let layout = if config.header_size > 0 {
            PacketLayout::header_data(1, config.capacity_packets, config.header_size, config.payload_size)?
        } else {
            PacketLayout::single(1, config.capacity_packets, config.payload_size)?
        };

        let memory = match config.memory {
            Some(memory) => SlotMemory::new(layout, memory.header, memory.payload)?,
            None => {
                let mut allocator = new_allocator(config.allocator)?;
                let payload = Region::whole(allocate_with_fallback(
                    &mut allocator,
                    layout.payload_bytes(),
                    util::cache_line_size(),
                )?);
                let header = match layout.header_block() {
                    Some(_) => {
                        // headers always land in host memory
                        let mut host = new_allocator(MemoryKind::HugePages { page_size: None })?;
                        Some(Region::whole(allocate_with_fallback(
                            &mut host,
                            layout.header_bytes(),
                            util::cache_line_size(),
                        )?))
                    }
                    None => None,
                };
                SlotMemory::new(layout, header, payload)?
            }
        };

        let shared = Arc::new(RxShared {
            records: PacketRecords::new(memory.layout().total_packets()),
            memory,
            produced: AtomicU64::new(0),
            released: AtomicU64::new(0),
            failed: AtomicBool::new(false),
            event: EventChannel::new(),
            stats: Arc::new(StreamStats::default()),
            clock,
        });

        let (cmd_tx, cmd_rx) = std::sync::mpsc::channel();
        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name(format!("rx-stream-{}", id.raw()))
            .spawn(move || worker_loop(worker_shared, cmd_rx, internal_core))
            .map_err(|e| Error::Io(format!("spawning rx worker: {e}")))?;

        log::info!(
            "created rx stream {} on {} ({} packets)",
            id.raw(),
            config.nic,
            config.capacity_packets
        );
        Ok(RxStream {
            id,
            shared,
            moderation: config.moderation,
            consumed: 0,
            attached: Vec::new(),
            cmd_tx: Some(cmd_tx),
            worker: Some(worker),
            nic: config.nic,
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

    pub fn is_hds(&self) -> bool {
        self.shared.memory.layout().is_hds()
    }

    pub fn capacity_packets(&self) -> usize {
        self.shared.memory.layout().total_packets()
    }

    pub fn moderation(&self) -> CompletionModeration {
        self.moderation
    }

    /// Binds a steering rule to this stream. The flow's destination
    /// decides the socket: multicast groups are joined on the stream's
    /// NIC, unicast binds the destination address directly.
    pub fn attach_flow(&mut self, flow: &FourTupleFlow) -> Result<()> {
        if self.attached.iter().any(|f| f.tag == flow.tag) {
            return Err(Error::AlreadyAttached);
        }
        let socket = open_flow_socket(flow, &self.nic)?;
        let sender = self.cmd_tx.as_ref().ok_or(Error::NotInitialized)?;
        sender
            .send(FlowCmd::Attach(flow.clone(), socket))
            .map_err(|_| Error::HwCompletionIssue)?;
        self.attached.push(flow.clone());
        log::info!("attached {} to stream {}", flow, self.id.raw());
        Ok(())
    }

    /// Detaches a flow; detaching an unknown flow reports `NotAttached`.
    pub fn detach_flow(&mut self, flow: &FourTupleFlow) -> Result<()> {
        let index = self
            .attached
            .iter()
            .position(|f| f.tag == flow.tag)
            .ok_or(Error::NotAttached)?;
        self.attached.remove(index);
        let sender = self.cmd_tx.as_ref().ok_or(Error::NotInitialized)?;
        sender
            .send(FlowCmd::Detach(flow.tag))
            .map_err(|_| Error::HwCompletionIssue)?;
        log::info!("detached flow {} from stream {}", flow.tag, self.id.raw());
        Ok(())
    }

    pub fn attached_flows(&self) -> &[FourTupleFlow] {
        &self.attached
    }

    /// Drains the next moderated batch of packets. Returns an empty
    /// completion when nothing arrived within the moderation window;
    /// `Signal` on shutdown.
    pub fn get_next_chunk(&mut self) -> Result<Completion<'_>> {
        if self.shared.failed.load(Ordering::Relaxed) {
            return Err(Error::HwCompletionIssue);
        }
        let deadline = Instant::now() + Duration::from_nanos(self.moderation.wait_timeout_ns);
        loop {
            if util::shutdown::exit_requested() {
                return Err(Error::Signal);
            }
            let available =
                (self.shared.produced.load(Ordering::Acquire) - self.consumed) as usize;
            let enough = available >= self.moderation.min_chunk.max(1);
            let expired = Instant::now() >= deadline;
            if enough || expired {
                let take = available.min(self.moderation.max_chunk.max(1));
                let first = self.consumed;
                self.consumed += take as u64;
                return Ok(Completion {
                    shared: &*self.shared,
                    first_slot: first,
                    count: take,
                });
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            self.shared.event.wait(remaining.min(WORKER_POLL))?;
        }
    }

    /// Re-derives the zero-copy view of a consumed-but-unreleased slot.
    /// Consumers that hold packets across completions (the ordering
    /// engine) use this to defer materialization until emission.
    pub fn packet_at(&self, slot: u64) -> Option<RxPacket<'_>> {
        let released = self.shared.released.load(Ordering::Relaxed);
        if slot < released || slot >= self.consumed {
            return None;
        }
        let record = unsafe { self.shared.records.read(slot) };
        let header = unsafe { self.shared.memory.header_slot(slot) };
        let payload = unsafe { self.shared.memory.payload_slot(slot) };
        Some(RxPacket {
            header: &header[..(record.header_size as usize).min(header.len())],
            payload: &payload[..(record.payload_size as usize).min(payload.len())],
            flow_tag: record.flow_tag,
            timestamp_ns: record.timestamp_ns,
            slot,
        })
    }

    /// Returns the `count` oldest unreleased packet slots to the
    /// hardware side. Release is strictly FIFO and never runs ahead of
    /// consumption.
    pub fn release_packets(&mut self, count: usize) -> Result<()> {
        let released = self.shared.released.load(Ordering::Relaxed);
        if released + count as u64 > self.consumed {
            return Err(Error::invalid_argument(format!(
                "releasing {count} packets but only {} are held",
                self.consumed - released
            )));
        }
        self.shared
            .released
            .fetch_add(count as u64, Ordering::Release);
        Ok(())
    }

    /// Packets consumed and not yet released.
    pub fn held_packets(&self) -> usize {
        (self.consumed - self.shared.released.load(Ordering::Relaxed)) as usize
    }

    pub fn destroy(mut self) -> Result<()> {
        self.teardown();
        Ok(())
    }

    fn teardown(&mut self) {
        self.cmd_tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        log::info!("destroyed rx stream {}", self.id.raw());
    }
}

impl Drop for RxStream {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.teardown();
        }
    }
}

/// One received packet: zero-copy slices into the ring plus the
/// hardware-recorded metadata. Valid until its slot is released.
#[derive(Debug, Clone, Copy)]
pub struct RxPacket<'a> {
    pub header: &'a [u8],
    pub payload: &'a [u8],
    pub flow_tag: u32,
    pub timestamp_ns: u64,
    /// Global slot number, usable as a release cursor.
    pub slot: u64,
}

/// A moderated batch of received packets.
pub struct Completion<'a> {
    shared: &'a RxShared,
    first_slot: u64,
    count: usize,
}

impl<'a> Completion<'a> {
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn first_slot(&self) -> u64 {
        self.first_slot
    }

    pub fn packet(&self, i: usize) -> Option<RxPacket<'a>> {
        if i >= self.count {
            return None;
        }
        let slot = self.first_slot + i as u64;
        // consumed slots stay stable until released
        let record = unsafe { self.shared.records.read(slot) };
        let header = unsafe { self.shared.memory.header_slot(slot) };
        let payload = unsafe { self.shared.memory.payload_slot(slot) };
        Some(RxPacket {
            header: &header[..(record.header_size as usize).min(header.len())],
            payload: &payload[..(record.payload_size as usize).min(payload.len())],
            flow_tag: record.flow_tag,
            timestamp_ns: record.timestamp_ns,
            slot,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = RxPacket<'a>> + '_ {
        (0..self.count).filter_map(move |i| self.packet(i))
    }
}

fn open_flow_socket(flow: &FourTupleFlow, nic: &DeviceIface) -> Result<UdpSocket> {
    let dst = flow.destination;
    let socket = if dst.ip().is_multicast() {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, dst.port()))?;
        socket.join_multicast_v4(dst.ip(), &nic.address)?;
        socket
    } else {
        UdpSocket::bind(dst)?
    };
    socket.set_nonblocking(true)?;
    Ok(socket)
}

fn worker_loop(shared: Arc<RxShared>, commands: Receiver<FlowCmd>, internal_core: i64) {
    if let Err(e) = util::affinity::pin_current_to_core(internal_core) {
        log::warn!("rx worker affinity: {e}");
    }
    util::affinity::set_time_critical_priority();

    let capacity = shared.memory.layout().total_packets() as u64;
    let header_entry = shared
        .memory
        .layout()
        .header_block()
        .map(|b| b.entry_size)
        .unwrap_or(0);
    let payload_entry = shared.memory.layout().payload_block().entry_size;
    let mut scratch = vec![0u8; header_entry + payload_entry];
    let mut flows: Vec<(FourTupleFlow, UdpSocket)> = Vec::new();

    loop {
        // flow plumbing first so detach takes effect promptly
        loop {
            match commands.try_recv() {
                Ok(FlowCmd::Attach(flow, socket)) => flows.push((flow, socket)),
                Ok(FlowCmd::Detach(tag)) => flows.retain(|(f, _)| f.tag != tag),
                Err(std::sync::mpsc::TryRecvError::Empty) => break,
                Err(std::sync::mpsc::TryRecvError::Disconnected) => return,
            }
        }
        if flows.is_empty() {
            match commands.recv_timeout(WORKER_POLL) {
                Ok(FlowCmd::Attach(flow, socket)) => flows.push((flow, socket)),
                Ok(FlowCmd::Detach(tag)) => flows.retain(|(f, _)| f.tag != tag),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return,
            }
            continue;
        }

        let readable = wait_readable(&flows, WORKER_POLL);
        let mut advanced = false;
        for index in readable {
            let (flow, socket) = &flows[index];
            loop {
                match socket.recv_from(&mut scratch) {
                    Ok((received, source)) => {
                        let source = match source {
                            std::net::SocketAddr::V4(v4) => v4,
                            _ => continue,
                        };
                        if !flow.matches_source(&source) {
                            continue;
                        }
                        let produced = shared.produced.load(Ordering::Relaxed);
                        if produced - shared.released.load(Ordering::Acquire) >= capacity {
                            // ring overrun: the hardware drops and counts
                            shared.stats.on_dropped(1);
                            continue;
                        }
                        write_packet(&shared, produced, flow, &scratch[..received], header_entry);
                        shared.produced.fetch_add(1, Ordering::Release);
                        shared.stats.on_received(received);
                        advanced = true;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::error!("rx recv failed: {e}");
                        shared.failed.store(true, Ordering::Relaxed);
                        return;
                    }
                }
            }
        }
        if advanced {
            shared.event.notify();
        }
    }
}

fn write_packet(
    shared: &RxShared,
    slot: u64,
    flow: &FourTupleFlow,
    datagram: &[u8],
    header_entry: usize,
) {
    let header_len = datagram.len().min(header_entry);
    let payload = &datagram[header_len..];
    unsafe {
        if header_len > 0 {
            shared.memory.header_slot_mut(slot)[..header_len].copy_from_slice(&datagram[..header_len]);
        }
        let payload_slot = shared.memory.payload_slot_mut(slot);
        let payload_len = payload.len().min(payload_slot.len());
        payload_slot[..payload_len].copy_from_slice(&payload[..payload_len]);
        shared.records.write(
            slot,
            PacketRecord {
                payload_size: payload_len as u32,
                header_size: header_len as u32,
                flow_tag: flow.tag,
                timestamp_ns: shared.clock.now_ns(),
            },
        );
    }
}

#[cfg(not(windows))]
fn wait_readable(flows: &[(FourTupleFlow, UdpSocket)], timeout: Duration) -> Vec<usize> {
    use std::os::fd::AsRawFd;

    let mut poll_fds: Vec<libc::pollfd> = flows
        .iter()
        .map(|(_, socket)| libc::pollfd {
            fd: socket.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
    let rc = unsafe {
        libc::poll(
            poll_fds.as_mut_ptr(),
            poll_fds.len() as libc::nfds_t,
            timeout_ms,
        )
    };
    if rc <= 0 {
        return Vec::new();
    }
    poll_fds
        .iter()
        .enumerate()
        .filter(|(_, fd)| fd.revents & libc::POLLIN != 0)
        .map(|(i, _)| i)
        .collect()
}

#[cfg(windows)]
fn wait_readable(flows: &[(FourTupleFlow, UdpSocket)], timeout: Duration) -> Vec<usize> {
    std::thread::sleep(timeout.min(Duration::from_millis(1)));
    (0..flows.len()).collect()
}
