use std::cell::UnsafeCell;

use mem::Region;
use util::{Error, Result};

use crate::layout::PacketLayout;

/// The memory side of a chunk ring: one or two sub-block regions plus
/// the layout that addresses packet slots inside them.
///
/// Slot ownership follows the ring counters (see `tx.rs`/`rx.rs`): a
/// slot is written by exactly one side at a time, and every handoff
/// passes through a release/acquire counter or a channel. The unsafe
/// slice constructors below rely on that discipline.
pub(crate) struct SlotMemory {
    layout: PacketLayout,
    header: Option<Region>,
    payload: Region,
}

unsafe impl Send for SlotMemory {}
unsafe impl Sync for SlotMemory {}

impl SlotMemory {
    pub(crate) fn new(
        layout: PacketLayout,
        header: Option<Region>,
        payload: Region,
    ) -> Result<Self> {
        if payload.len() < layout.payload_bytes() {
            return Err(Error::invalid_argument(format!(
                "payload region {} bytes, ring needs {}",
                payload.len(),
                layout.payload_bytes()
            )));
        }
        match (&header, layout.header_block()) {
            (Some(region), Some(_)) if region.len() < layout.header_bytes() => {
                return Err(Error::invalid_argument(format!(
                    "header region {} bytes, ring needs {}",
                    region.len(),
                    layout.header_bytes()
                )));
            }
            (None, Some(_)) => {
                return Err(Error::invalid_argument(
                    "header-data split requires a header region",
                ));
            }
            _ => {}
        }
        Ok(SlotMemory {
            layout,
            header,
            payload,
        })
    }

    pub(crate) fn layout(&self) -> &PacketLayout {
        &self.layout
    }

    fn slot_index(&self, slot: u64) -> usize {
        (slot % self.layout.total_packets() as u64) as usize
    }

    /// # Safety
    /// The caller must own `slot` per the ring discipline and ensure no
    /// aliasing mutable access exists.
    pub(crate) unsafe fn payload_slot(&self, slot: u64) -> &[u8] {
        let block = self.layout.payload_block();
        let offset = self.slot_index(slot) * block.stride;
        std::slice::from_raw_parts(self.payload.as_ptr().add(offset), block.entry_size)
    }

    /// # Safety
    /// See [`SlotMemory::payload_slot`]; additionally the slot must be
    /// exclusively owned for writing.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn payload_slot_mut(&self, slot: u64) -> &mut [u8] {
        let block = self.layout.payload_block();
        let offset = self.slot_index(slot) * block.stride;
        std::slice::from_raw_parts_mut(self.payload.as_ptr().add(offset), block.entry_size)
    }

    /// # Safety
    /// See [`SlotMemory::payload_slot`].
    pub(crate) unsafe fn header_slot(&self, slot: u64) -> &[u8] {
        match (&self.header, self.layout.header_block()) {
            (Some(region), Some(block)) => {
                let offset = self.slot_index(slot) * block.stride;
                std::slice::from_raw_parts(region.as_ptr().add(offset), block.entry_size)
            }
            _ => &[],
        }
    }

    /// # Safety
    /// See [`SlotMemory::payload_slot_mut`].
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn header_slot_mut(&self, slot: u64) -> &mut [u8] {
        match (&self.header, self.layout.header_block()) {
            (Some(region), Some(block)) => {
                let offset = self.slot_index(slot) * block.stride;
                std::slice::from_raw_parts_mut(region.as_ptr().add(offset), block.entry_size)
            }
            _ => &mut [],
        }
    }
}

/// What the "hardware" recorded about one received packet.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PacketRecord {
    pub payload_size: u32,
    pub header_size: u32,
    pub flow_tag: u32,
    pub timestamp_ns: u64,
}

/// Per-slot packet records, synchronized by the same produced/released
/// counters as the slot bytes.
pub(crate) struct PacketRecords {
    cells: Box<[UnsafeCell<PacketRecord>]>,
}

unsafe impl Send for PacketRecords {}
unsafe impl Sync for PacketRecords {}

impl PacketRecords {
    pub(crate) fn new(slots: usize) -> Self {
        PacketRecords {
            cells: (0..slots)
                .map(|_| UnsafeCell::new(PacketRecord::default()))
                .collect(),
        }
    }

    /// # Safety
    /// Producer-side only, before publishing the slot.
    pub(crate) unsafe fn write(&self, slot: u64, record: PacketRecord) {
        let index = (slot % self.cells.len() as u64) as usize;
        *self.cells[index].get() = record;
    }

    /// # Safety
    /// Consumer-side only, after acquiring the slot.
    pub(crate) unsafe fn read(&self, slot: u64) -> PacketRecord {
        let index = (slot % self.cells.len() as u64) as usize;
        *self.cells[index].get()
    }
}
