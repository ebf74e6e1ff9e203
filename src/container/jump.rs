//! The jump table: a compact in-memory index mapping a block number to its
//! absolute offset in the backing file, derived from the persisted per-block
//! length array.
//!
//! Blocks are grouped into runs of `G = max(1, 2^16 / block_size)` blocks.
//! Each run stores one absolute 64-bit offset; blocks inside a run store a
//! 16-bit delta from the run start. For `offset(i)` with `i % G == 0` the
//! run offset is the answer; otherwise the delta is added. This keeps the
//! table at roughly two bytes per block.

use crate::base::{ByteSize, ZfileError, ZfileResult};

#[derive(Debug)]
pub struct JumpTable {
    group_size: usize,
    /// Absolute offset of the first block of each run; one trailing entry
    /// when the block count is an exact multiple of the run length.
    partial_offset: Vec<u64>,
    /// Offset of block `i` within its run; index 0 of every run holds 0.
    /// Contains one entry per block plus a terminator, so `offset(n_blocks)`
    /// is the end of the data region.
    deltas: Vec<u16>,
    n_blocks: usize,
}

impl JumpTable {
    /// Builds the table from the persisted block lengths. `data_start` is
    /// the absolute offset of block 0 (record space plus dictionary).
    /// `min_block_len` is the smallest believable entry: the CRC trailer
    /// size when `verify`, zero otherwise; entries at or below it are
    /// rejected as corrupt.
    pub fn build(
        block_len: &[u32],
        data_start: u64,
        block_size: u32,
        min_block_len: u32,
    ) -> ZfileResult<Self> {
        // Runs collapse to a single block once block_size outgrows the
        // 16-bit delta span; every offset is then a run offset.
        let group_size = ((u16::MAX as usize + 1) / block_size as usize).max(1);

        let mut partial_offset = Vec::with_capacity(block_len.len() / group_size + 1);
        let mut deltas = Vec::with_capacity(block_len.len() + 1);
        let mut offset = data_start;
        partial_offset.push(offset);
        deltas.push(0);

        for i in 1..=block_len.len() {
            let len = block_len[i - 1];
            if len <= min_block_len {
                error!(block = i - 1, len, "unexpected block length in index");
                return Err(ZfileError::Format("block length in index is too small"));
            }
            offset += len as u64;
            if i % group_size == 0 {
                partial_offset.push(offset);
                deltas.push(0);
                continue;
            }
            let delta = deltas[i - 1] as u64 + len as u64;
            if delta >= u16::MAX as u64 {
                error!(block = i - 1, delta, "cumulative run delta exceeds 16 bits");
                return Err(ZfileError::Range("jump table delta overflow"));
            }
            deltas.push(delta as u16);
        }

        debug!(
            blocks = block_len.len(),
            runs = partial_offset.len(),
            table_size = ?ByteSize((deltas.len() * 2 + partial_offset.len() * 8) as u64),
            "jump table built"
        );
        Ok(Self {
            group_size,
            partial_offset,
            deltas,
            n_blocks: block_len.len(),
        })
    }

    /// Number of blocks indexed.
    pub fn len(&self) -> usize {
        self.n_blocks
    }

    pub fn is_empty(&self) -> bool {
        self.n_blocks == 0
    }

    /// Absolute offset of block `idx`. Valid for `idx` in `0..=len()`;
    /// `offset(len())` is the end of the compressed data region.
    pub fn offset(&self, idx: usize) -> u64 {
        debug_assert!(idx <= self.n_blocks);
        let run = idx / self.group_size;
        if idx % self.group_size == 0 {
            self.partial_offset[run]
        } else {
            self.partial_offset[run] + self.deltas[idx] as u64
        }
    }

    /// On-disk bytes covered by blocks `[begin, end)`.
    pub fn span(&self, begin: usize, end: usize) -> u64 {
        debug_assert!(begin <= end);
        self.offset(end) - self.offset(begin)
    }
}
