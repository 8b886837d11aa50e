#![allow(unsafe_code)]
//! Fixed-size DMA block layout.
//!
//! The front end writes the lane stream into the ring in fixed-size blocks,
//! each owned by exactly one channel. A block starts with an 8-byte header:
//!
//! | bytes | field                  |
//! |-------|------------------------|
//! | 0-1   | channel id (LE)        |
//! | 2     | format tag             |
//! | 3     | block sequence number  |
//! | 4-5   | valid lane count (LE)  |
//! | 6-7   | reserved, zero         |
//!
//! followed by `lane_count` 64-bit little-endian lanes. The ring engine
//! hands out raw block addresses; [`BlockView`] is the bounded, read-only
//! window over one of them.

/// Size of the block header in bytes.
pub const BLOCK_HEADER_BYTES: usize = 8;

/// Format tag for blocks carrying a 64-bit lane stream.
pub const BLOCK_FORMAT_LANE64: u8 = 0x01;

/// Raw address of one block inside the DMA region.
///
/// Only ever produced by the ring engine, which guarantees the address stays
/// readable until the reclaim margin passes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAddr(pub usize);

/// Decoded block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Channel the block belongs to.
    pub channel_id: u16,
    /// Block format revision.
    pub format_tag: u8,
    /// Per-channel block sequence number (wrapping).
    pub seq: u8,
    /// Number of valid lanes following the header.
    pub lane_count: u16,
}

impl BlockHeader {
    /// Parse a header from the first [`BLOCK_HEADER_BYTES`] of a block.
    #[must_use]
    pub fn parse(bytes: &[u8; BLOCK_HEADER_BYTES]) -> Self {
        Self {
            channel_id: u16::from_le_bytes([bytes[0], bytes[1]]),
            format_tag: bytes[2],
            seq: bytes[3],
            lane_count: u16::from_le_bytes([bytes[4], bytes[5]]),
        }
    }

    /// Serialize the header into the first [`BLOCK_HEADER_BYTES`] of `buf`.
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.channel_id.to_le_bytes());
        buf[2] = self.format_tag;
        buf[3] = self.seq;
        buf[4..6].copy_from_slice(&self.lane_count.to_le_bytes());
        buf[6] = 0;
        buf[7] = 0;
    }
}

/// Read-only view over one block.
pub struct BlockView<'a> {
    bytes: &'a [u8],
    header: BlockHeader,
}

impl<'a> BlockView<'a> {
    /// View a block at a raw address emitted by the ring engine.
    ///
    /// # Safety
    ///
    /// `addr` must point to at least `block_bytes` readable bytes that remain
    /// valid and unmodified for `'a`. The ring engine's reclaim margin
    /// provides this: the front end is never allowed to overwrite a block
    /// that has been dispatched but not yet processed.
    #[must_use]
    pub unsafe fn from_addr(addr: BlockAddr, block_bytes: usize) -> Option<BlockView<'a>> {
        let bytes = std::slice::from_raw_parts(addr.0 as *const u8, block_bytes);
        Self::from_bytes(bytes)
    }

    /// View a block over a byte slice.
    ///
    /// Returns `None` when the slice is shorter than a header or the header
    /// declares more lanes than fit in the slice.
    #[must_use]
    pub fn from_bytes(bytes: &'a [u8]) -> Option<BlockView<'a>> {
        if bytes.len() < BLOCK_HEADER_BYTES {
            return None;
        }
        let mut hdr = [0u8; BLOCK_HEADER_BYTES];
        hdr.copy_from_slice(&bytes[..BLOCK_HEADER_BYTES]);
        let header = BlockHeader::parse(&hdr);
        let needed = BLOCK_HEADER_BYTES + usize::from(header.lane_count) * 8;
        if bytes.len() < needed {
            return None;
        }
        Some(BlockView { bytes, header })
    }

    /// The block header.
    #[must_use]
    pub fn header(&self) -> BlockHeader {
        self.header
    }

    /// Channel id from the header.
    #[must_use]
    pub fn channel_id(&self) -> u16 {
        self.header.channel_id
    }

    /// The valid lanes of this block, in wire order.
    pub fn lanes(&self) -> impl Iterator<Item = u64> + '_ {
        self.bytes[BLOCK_HEADER_BYTES..]
            .chunks_exact(8)
            .take(usize::from(self.header.lane_count))
            .map(|c| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(c);
                u64::from_le_bytes(raw)
            })
    }
}

/// Read just the channel id from a block's header.
///
/// The dispatch path needs nothing else from the block, so it avoids
/// constructing a full view.
///
/// # Safety
///
/// `addr` must point to at least [`BLOCK_HEADER_BYTES`] readable bytes.
#[must_use]
pub unsafe fn peek_channel_id(addr: BlockAddr) -> u16 {
    let bytes = std::slice::from_raw_parts(addr.0 as *const u8, 2);
    u16::from_le_bytes([bytes[0], bytes[1]])
}

/// Lanes that fit into one block of `block_bytes`.
#[must_use]
pub fn lanes_per_block(block_bytes: usize) -> usize {
    (block_bytes - BLOCK_HEADER_BYTES) / 8
}

/// Build one zero-padded block for `channel_id`.
///
/// `lanes` must fit; callers split streams with [`blocks_from_lanes`].
#[must_use]
pub fn build_block(channel_id: u16, seq: u8, lanes: &[u64], block_bytes: usize) -> Vec<u8> {
    debug_assert!(lanes.len() <= lanes_per_block(block_bytes));
    let mut bytes = vec![0u8; block_bytes];
    BlockHeader {
        channel_id,
        format_tag: BLOCK_FORMAT_LANE64,
        seq,
        lane_count: lanes.len() as u16,
    }
    .write_to(&mut bytes);
    for (i, lane) in lanes.iter().enumerate() {
        let at = BLOCK_HEADER_BYTES + i * 8;
        bytes[at..at + 8].copy_from_slice(&lane.to_le_bytes());
    }
    bytes
}

/// Split a lane stream into consecutive blocks for one channel, with a
/// wrapping per-channel sequence number. The last block may be partial.
#[must_use]
pub fn blocks_from_lanes(channel_id: u16, lanes: &[u64], block_bytes: usize) -> Vec<Vec<u8>> {
    lanes
        .chunks(lanes_per_block(block_bytes))
        .enumerate()
        .map(|(i, part)| build_block(channel_id, (i & 0xFF) as u8, part, block_bytes))
        .collect()
}
