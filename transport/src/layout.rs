use util::{Error, Result};

/// One sub-block of a stream's ring: uniform entries padded to a
/// cache-line stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubBlock {
    pub entry_size: usize,
    pub stride: usize,
}

impl SubBlock {
    pub fn new(entry_size: usize) -> Result<Self> {
        if entry_size == 0 {
            return Err(Error::invalid_argument("zero entry size"));
        }
        Ok(SubBlock {
            entry_size,
            stride: util::align_up_pow2(entry_size, util::cache_line_size()),
        })
    }
}

/// A stream has one payload sub-block, or two when header-data split is
/// on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockLayout {
    Single { payload: SubBlock },
    HeaderData { header: SubBlock, payload: SubBlock },
}

/// Ring geometry: `num_chunks` chunks of `packets_per_chunk` packets,
/// with packet `i` of a chunk at `stride * i` inside each sub-block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketLayout {
    pub packets_per_chunk: usize,
    pub num_chunks: usize,
    pub blocks: BlockLayout,
}

impl PacketLayout {
    pub fn single(
        packets_per_chunk: usize,
        num_chunks: usize,
        payload_entry: usize,
    ) -> Result<Self> {
        if packets_per_chunk == 0 || num_chunks == 0 {
            return Err(Error::invalid_argument("empty ring geometry"));
        }
        Ok(PacketLayout {
            packets_per_chunk,
            num_chunks,
            blocks: BlockLayout::Single {
                payload: SubBlock::new(payload_entry)?,
            },
        })
    }

    pub fn header_data(
        packets_per_chunk: usize,
        num_chunks: usize,
        header_entry: usize,
        payload_entry: usize,
    ) -> Result<Self> {
        if packets_per_chunk == 0 || num_chunks == 0 {
            return Err(Error::invalid_argument("empty ring geometry"));
        }
        Ok(PacketLayout {
            packets_per_chunk,
            num_chunks,
            blocks: BlockLayout::HeaderData {
                header: SubBlock::new(header_entry)?,
                payload: SubBlock::new(payload_entry)?,
            },
        })
    }

    pub fn is_hds(&self) -> bool {
        matches!(self.blocks, BlockLayout::HeaderData { .. })
    }

    pub fn total_packets(&self) -> usize {
        self.packets_per_chunk * self.num_chunks
    }

    pub fn payload_block(&self) -> SubBlock {
        match self.blocks {
            BlockLayout::Single { payload } => payload,
            BlockLayout::HeaderData { payload, .. } => payload,
        }
    }

    pub fn header_block(&self) -> Option<SubBlock> {
        match self.blocks {
            BlockLayout::Single { .. } => None,
            BlockLayout::HeaderData { header, .. } => Some(header),
        }
    }

    /// Bytes of payload memory the ring needs.
    pub fn payload_bytes(&self) -> usize {
        self.total_packets() * self.payload_block().stride
    }

    /// Bytes of header memory the ring needs (zero without HDS).
    pub fn header_bytes(&self) -> usize {
        self.header_block()
            .map(|b| self.total_packets() * b.stride)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod layout_test {
    use super::*;

    #[test]
    fn test_stride_is_cache_line_aligned() {
        let block = SubBlock::new(1220).unwrap();
        assert!(block.stride >= 1220);
        assert_eq!(block.stride % util::cache_line_size(), 0);
        let exact = SubBlock::new(util::cache_line_size()).unwrap();
        assert_eq!(exact.stride, util::cache_line_size());
    }

    #[test]
    fn test_single_layout_sizes() {
        let layout = PacketLayout::single(256, 30, 1220).unwrap();
        assert_eq!(layout.total_packets(), 256 * 30);
        assert!(!layout.is_hds());
        assert_eq!(layout.header_bytes(), 0);
        assert_eq!(
            layout.payload_bytes(),
            256 * 30 * layout.payload_block().stride
        );
    }

    #[test]
    fn test_hds_layout_sizes() {
        let layout = PacketLayout::header_data(1, 4096, 20, 1460).unwrap();
        assert!(layout.is_hds());
        let header = layout.header_block().unwrap();
        assert_eq!(header.stride, util::align_up_pow2(20, util::cache_line_size()));
        assert_eq!(layout.header_bytes(), 4096 * header.stride);
    }

    #[test]
    fn test_degenerate_geometry_rejected() {
        assert!(PacketLayout::single(0, 4, 100).is_err());
        assert!(PacketLayout::single(4, 0, 100).is_err());
        assert!(SubBlock::new(0).is_err());
    }
}
