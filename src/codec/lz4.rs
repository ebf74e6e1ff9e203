use lz4_flex::block::{compress_into, decompress_into, DecompressError};

use crate::base::{ZfileError, ZfileResult};
use crate::codec::Codec;

/// LZ4 block codec (raw block format, no frame, no length prefix).
///
/// The fastest option by a wide margin on decompression, which is where a
/// read-optimized container spends its time. Has no quality levels; the
/// persisted `level` field is ignored.
pub struct Lz4Codec;

impl Codec for Lz4Codec {
    fn compress(&mut self, src: &[u8], dst: &mut [u8]) -> ZfileResult<usize> {
        compress_into(src, dst).map_err(|e| ZfileError::Codec(format!("lz4 compress: {e}")))
    }

    fn decompress(&mut self, src: &[u8], dst: &mut [u8]) -> ZfileResult<usize> {
        decompress_into(src, dst).map_err(|e| match e {
            DecompressError::OutputTooSmall { .. } => {
                ZfileError::Range("lz4 output buffer too small for block")
            }
            other => ZfileError::Codec(format!("lz4 decompress: {other}")),
        })
    }

    fn n_batch(&self) -> usize {
        8
    }
}
