
use rtp::sequence::{extend_onto, SequenceWidth};

/// Floor on the reorder window, in packets.
pub const MIN_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy)]
pub struct ReorderConfig {
    pub width: SequenceWidth,
    /// Slots in the buffer; sized to cover twice the path differential
    /// at the stream's packet rate, floored at [`MIN_CAPACITY`].
    pub capacity: usize,
    /// Maximum tolerated inter-path skew. An entry this old is released
    /// even when predecessors are still missing.
    pub path_differential_ns: u64,
}

impl ReorderConfig {
    /// Sizes the window from the stream's expected packet interval.
    pub fn for_packet_interval(
        width: SequenceWidth,
        path_differential_ns: u64,
        packet_interval_ns: u64,
    ) -> Self {
        let needed = (2 * path_differential_ns / packet_interval_ns.max(1)) as usize;
        ReorderConfig {
            width,
            capacity: needed.max(MIN_CAPACITY).next_power_of_two(),
            path_differential_ns,
        }
    }
}

/// What happened to an inserted packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// First copy of this sequence number.
    Unique,
    /// A copy of a sequence number already buffered or just emitted;
    /// the newcomer's buffer goes straight back to its ring.
    Redundant,
    /// Behind the release cursor (or hopelessly far ahead); dropped.
    Stale,
}

/// A buffered packet reference: where one copy of a sequence number
/// lives, by path and ring slot.
#[derive(Debug, Clone, Copy)]
pub struct ReorderEntry {
    pub sequence: u64,
    pub path_id: usize,
    pub ring_slot: u64,
    pub flow_tag: u32,
    pub arrival_ns: u64,
}

/// Accounting of the engine, all monotonic.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReorderCounters {
    pub unique: u64,
    pub redundant: u64,
    pub late_drops: u64,
    pub lost_after_window: u64,
    pub emitted: u64,
}

/// Sequence-keyed reorder buffer with a release cursor.
///
/// Packets insert at `seq % capacity`. The cursor emits the next
/// expected sequence as soon as it is present, and skips gaps once the
/// oldest buffered successor has waited out the path differential,
/// counting the skipped numbers as lost.
pub struct ReorderBuffer {
    config: ReorderConfig,
    slots: Vec<Option<ReorderEntry>>,
    /// Next sequence to release, on the extended (unwrapped) line.
    head: u64,
    /// Highest extended sequence observed; the wrap reference.
    newest: u64,
    buffered: usize,
    counters: ReorderCounters,
    started: bool,
}

impl ReorderBuffer {
    pub fn new(config: ReorderConfig) -> Self {
        ReorderBuffer {
            slots: vec![None; config.capacity],
            config,
            head: 0,
            newest: 0,
            buffered: 0,
            counters: ReorderCounters::default(),
            started: false,
        }
    }

    pub fn counters(&self) -> ReorderCounters {
        self.counters
    }

    pub fn buffered(&self) -> usize {
        self.buffered
    }

    pub fn next_expected(&self) -> u64 {
        self.head
    }

    /// Offers one received copy to the window.
    ///
    /// Entries stay in their slot after emission (until a full window
    /// overwrites them), so a slow path's duplicate of a just-released
    /// sequence still counts as redundant rather than late.
    pub fn insert(
        &mut self,
        raw_sequence: u32,
        path_id: usize,
        ring_slot: u64,
        flow_tag: u32,
        arrival_ns: u64,
    ) -> InsertOutcome {
        let sequence = if self.started {
            extend_onto(raw_sequence, self.newest, self.config.width)
        } else {
            raw_sequence as u64
        };
        if !self.started {
            self.started = true;
            self.head = sequence;
            self.newest = sequence;
        }
        self.newest = self.newest.max(sequence);

        let index = (sequence % self.config.capacity as u64) as usize;
        if let Some(existing) = &self.slots[index] {
            if existing.sequence == sequence {
                self.counters.redundant += 1;
                return InsertOutcome::Redundant;
            }
        }
        if sequence < self.head || sequence >= self.head + self.config.capacity as u64 {
            // behind the slot-retention window, or too far ahead for the
            // buffer to hold without tearing the cursor
            self.counters.late_drops += 1;
            return InsertOutcome::Stale;
        }

        self.slots[index] = Some(ReorderEntry {
            sequence,
            path_id,
            ring_slot,
            flow_tag,
            arrival_ns,
        });
        self.buffered += 1;
        self.counters.unique += 1;
        InsertOutcome::Unique
    }

    /// Advances the release cursor, handing due entries to `emit` in
    /// sequence order. `now_ns` drives the age rule.
    pub fn release_due(&mut self, now_ns: u64, emit: &mut dyn FnMut(&ReorderEntry)) {
        loop {
            if self.buffered == 0 {
                return;
            }
            let head_index = (self.head % self.config.capacity as u64) as usize;
            if let Some(entry) = self.slots[head_index] {
                if entry.sequence == self.head {
                    emit(&entry);
                    // the entry lingers for duplicate detection
                    self.buffered -= 1;
                    self.counters.emitted += 1;
                    self.head += 1;
                    continue;
                }
            }
            // gap at the head: wait for the oldest buffered successor to
            // age out of the differential window, then skip to it
            match self.oldest_buffered() {
                Some(entry)
                    if now_ns.saturating_sub(entry.arrival_ns)
                        >= self.config.path_differential_ns =>
                {
                    self.counters.lost_after_window += entry.sequence - self.head;
                    self.head = entry.sequence;
                }
                _ => return,
            }
        }
    }

    fn oldest_buffered(&self) -> Option<ReorderEntry> {
        // bounded scan from the cursor; gaps are short-lived
        for offset in 0..self.config.capacity as u64 {
            let sequence = self.head + offset;
            let index = (sequence % self.config.capacity as u64) as usize;
            if let Some(entry) = self.slots[index] {
                if entry.sequence == sequence {
                    return Some(entry);
                }
            }
        }
        None
    }
}
