use std::net::Ipv4Addr;
use std::time::Duration;

use mem::{allocate_with_fallback, new_allocator, DeviceIface, MemKey, MemoryKind, Region};
use rtp::header::{peek_extended_sequence_number, peek_sequence_number};
use rtp::sequence::SequenceWidth;
use transport::{
    CompletionModeration, FourTupleFlow, RxMemory, RxStreamConfig, TransportContext,
};
use util::{Error, Result};

use crate::path::IpoPath;
use crate::reorder::{ReorderBuffer, ReorderConfig, ReorderCounters, ReorderEntry};

/// One redundant path: the NIC it terminates on and the flow steering
/// its copy of the stream.
#[derive(Debug, Clone)]
pub struct IpoPathConfig {
    pub local_ip: Ipv4Addr,
    pub flow: FourTupleFlow,
}

/// Ordering-stream construction parameters.
pub struct IpoStreamConfig {
    pub paths: Vec<IpoPathConfig>,
    pub max_path_differential: Duration,
    /// Parse the 32-bit extended sequence number from the payload area.
    pub extended_sequence: bool,
    /// Ring capacity per path, in packets.
    pub capacity_packets: usize,
    pub payload_size: usize,
    /// App-header entry size; non-zero selects header-data split.
    pub header_size: usize,
    /// Register every path's regions with its NIC before stream
    /// creation. Requires header-data split.
    pub register_memory: bool,
    pub allocator: MemoryKind,
    pub moderation: CompletionModeration,
    /// Expected packet spacing, used to size the reorder window.
    pub packet_interval_ns: u64,
}

/// One de-duplicated, in-order packet handed to the consumer. The
/// slices point into the owning path's ring; they are valid only for
/// the duration of the callback.
#[derive(Debug, Clone, Copy)]
pub struct IpoReceivedPacket<'a> {
    pub sequence: u64,
    pub header: &'a [u8],
    pub payload: &'a [u8],
    pub flow_tag: u32,
    pub arrival_ns: u64,
    pub winning_path: usize,
}

/// Aggregate engine counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IpoStats {
    pub unique: u64,
    pub redundant: u64,
    pub late_drops: u64,
    pub lost_after_window: u64,
    pub emitted: u64,
    /// Gap-inferred drop count per path.
    pub path_dropped: Vec<u64>,
}

impl IpoStats {
    /// Total copies the engine accepted on any path.
    pub fn received_total(&self) -> u64 {
        self.unique + self.redundant + self.late_drops
    }
}

/// The N-path seamless-protection receive engine: every path feeds the
/// shared reorder window, which emits exactly one copy per sequence
/// number within the configured path differential.
pub struct IpoStream {
    paths: Vec<IpoPath>,
    reorder: ReorderBuffer,
    width: SequenceWidth,
    path_differential_ns: u64,
    memory_keys: Vec<MemKey>,
    clock: util::clock::Clock,
}

impl std::fmt::Debug for IpoStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpoStream")
            .field("paths", &self.paths.len())
            .field("width", &self.width)
            .field("path_differential_ns", &self.path_differential_ns)
            .finish()
    }
}

struct Arrival {
    arrival_ns: u64,
    path_id: usize,
    raw_sequence: u32,
    ring_slot: u64,
    flow_tag: u32,
}

/// Locates the RTP header and the extended-sequence area of a packet,
/// for both split (header sub-block) and contiguous layouts.
fn parse_sequence(width: SequenceWidth, header: &[u8], payload: &[u8]) -> Option<u32> {
    let (rtp_bytes, ext_area) = if header.len() >= rtp::header::HEADER_SIZE {
        (header, payload)
    } else {
        (
            payload,
            payload.get(rtp::header::HEADER_SIZE..).unwrap_or(&[]),
        )
    };
    match width {
        SequenceWidth::Short => peek_sequence_number(rtp_bytes).ok().map(u32::from),
        SequenceWidth::Extended => peek_extended_sequence_number(rtp_bytes, ext_area).ok(),
    }
}

impl IpoStream {
    pub fn new(ctx: &TransportContext, config: IpoStreamConfig) -> Result<Self> {
        if config.paths.is_empty() {
            return Err(Error::invalid_argument("at least one path is required"));
        }
        if config.register_memory && config.header_size == 0 {
            return Err(Error::invalid_argument(
                "memory registration needs header-data split",
            ));
        }

        let width = if config.extended_sequence {
            SequenceWidth::Extended
        } else {
            SequenceWidth::Short
        };
        let differential_ns = config.max_path_differential.as_nanos() as u64;

        // one allocation per sub-block spanning all paths, sliced per
        // path so a single registration can cover the whole receiver
        let layout = if config.header_size > 0 {
            transport::PacketLayout::header_data(
                1,
                config.capacity_packets,
                config.header_size,
                config.payload_size,
            )?
        } else {
            transport::PacketLayout::single(1, config.capacity_packets, config.payload_size)?
        };

        let mut payload_allocator = new_allocator(config.allocator)?;
        let payload_step = payload_allocator.align_length(layout.payload_bytes());
        let payload_region = Region::whole(allocate_with_fallback(
            &mut payload_allocator,
            payload_step * config.paths.len(),
            util::cache_line_size(),
        )?);

        let header_region = if config.header_size > 0 {
            let mut header_allocator = new_allocator(MemoryKind::HugePages { page_size: None })?;
            let step = header_allocator.align_length(layout.header_bytes());
            Some((
                Region::whole(allocate_with_fallback(
                    &mut header_allocator,
                    step * config.paths.len(),
                    util::cache_line_size(),
                )?),
                step,
            ))
        } else {
            None
        };

        let mut memory_keys = Vec::new();
        if config.register_memory {
            for path in &config.paths {
                let device = DeviceIface::from_local_ip(path.local_ip);
                if let Some((region, _)) = &header_region {
                    memory_keys.push(region.register(&device)?);
                }
                memory_keys.push(payload_region.register(&device)?);
            }
        }

        let mut paths = Vec::with_capacity(config.paths.len());
        for (index, path_config) in config.paths.iter().enumerate() {
            let payload = payload_region.slice(index * payload_step, layout.payload_bytes())?;
            let header = match &header_region {
                Some((region, step)) => {
                    Some(region.slice(index * step, layout.header_bytes())?)
                }
                None => None,
            };
            let mut stream = ctx.create_rx_stream(RxStreamConfig {
                nic: DeviceIface::from_local_ip(path_config.local_ip),
                capacity_packets: config.capacity_packets,
                payload_size: config.payload_size,
                header_size: config.header_size,
                moderation: config.moderation,
                allocator: config.allocator,
                memory: Some(RxMemory { header, payload }),
            })?;
            stream.attach_flow(&path_config.flow)?;
            paths.push(IpoPath::new(stream, width));
            log::info!("ipo path {index} attached: {}", path_config.flow);
        }

        let reorder = ReorderBuffer::new(ReorderConfig::for_packet_interval(
            width,
            differential_ns,
            config.packet_interval_ns,
        ));

        Ok(IpoStream {
            paths,
            reorder,
            width,
            path_differential_ns: differential_ns,
            memory_keys,
            clock: ctx.clock().clone(),
        })
    }

    pub fn paths(&self) -> usize {
        self.paths.len()
    }

    /// Per-path transport counters, for the stats reporter.
    pub fn path_stream_stats(&self) -> Vec<std::sync::Arc<transport::StreamStats>> {
        self.paths.iter().map(|p| p.stream.stats()).collect()
    }

    /// One engine iteration: drain every path's completions into the
    /// reorder window, emit due packets in order, and hand aged-out ring
    /// slots back. Consumers needing data beyond the callback must copy.
    pub fn poll(&mut self, on_packet: &mut dyn FnMut(IpoReceivedPacket<'_>)) -> Result<()> {
        let width = self.width;
        let mut arrivals: Vec<Arrival> = Vec::new();
        for (path_id, path) in self.paths.iter_mut().enumerate() {
            // copy out the per-packet facts; the slices are re-derived at
            // emission time
            let completion = path.stream.get_next_chunk()?;
            for packet in completion.iter() {
                match parse_sequence(width, packet.header, packet.payload) {
                    Some(raw_sequence) => arrivals.push(Arrival {
                        arrival_ns: packet.timestamp_ns,
                        path_id,
                        raw_sequence,
                        ring_slot: packet.slot,
                        flow_tag: packet.flow_tag,
                    }),
                    None => continue,
                }
            }
        }
        // per-path bookkeeping stays in ring order
        for arrival in &arrivals {
            let path = &mut self.paths[arrival.path_id];
            path.track_sequence(arrival.raw_sequence);
            path.note_held(arrival.arrival_ns);
        }
        // the window sees the merged arrival order, so a slow path's
        // earlier sequence is never pre-empted by a batch boundary
        arrivals.sort_by_key(|a| a.arrival_ns);
        for arrival in arrivals {
            self.reorder.insert(
                arrival.raw_sequence,
                arrival.path_id,
                arrival.ring_slot,
                arrival.flow_tag,
                arrival.arrival_ns,
            );
        }

        let clock_now = self.clock.now_ns();
        let paths = &self.paths;
        self.reorder.release_due(clock_now, &mut |entry: &ReorderEntry| {
            if let Some(packet) = paths[entry.path_id].stream.packet_at(entry.ring_slot) {
                on_packet(IpoReceivedPacket {
                    sequence: entry.sequence,
                    header: packet.header,
                    payload: packet.payload,
                    flow_tag: entry.flow_tag,
                    arrival_ns: entry.arrival_ns,
                    winning_path: entry.path_id,
                });
            }
        });

        // slots older than twice the differential cannot be referenced
        // by the window anymore
        let cutoff = clock_now.saturating_sub(2 * self.path_differential_ns);
        for path in &mut self.paths {
            path.release_older_than(cutoff)?;
        }
        Ok(())
    }

    pub fn stats(&self) -> IpoStats {
        let ReorderCounters {
            unique,
            redundant,
            late_drops,
            lost_after_window,
            emitted,
        } = self.reorder.counters();
        IpoStats {
            unique,
            redundant,
            late_drops,
            lost_after_window,
            emitted,
            path_dropped: self.paths.iter().map(|p| p.dropped()).collect(),
        }
    }

    /// Orderly teardown: detach flows, destroy streams, then deregister
    /// the memory keys.
    pub fn destroy(mut self) -> Result<()> {
        for path in self.paths.drain(..) {
            let mut stream = path.stream;
            for flow in stream.attached_flows().to_vec() {
                if let Err(e) = stream.detach_flow(&flow) {
                    log::warn!("detaching {flow}: {e}");
                }
            }
            stream.destroy()?;
        }
        for key in self.memory_keys.drain(..) {
            mem::deregister(key)?;
        }
        Ok(())
    }
}
