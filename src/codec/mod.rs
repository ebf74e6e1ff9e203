//! # Block compression codecs
//!
//! Every block of a container is compressed independently, which is the
//! invariant that makes random access possible. The [`Codec`] trait is the
//! small capability set the builders and the reader need: bounded-output
//! compression and exact-length decompression of a single block, plus an
//! optional batched variant used by the whole-file compression path.
//!
//! Codec instances carry only internal compressor state and are cheap to
//! build, so each compression worker owns one.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::base::{ZfileError, ZfileResult};
use crate::container::format::CompressOptions;

mod lz4;
mod zstd;

pub use lz4::Lz4Codec;
pub use zstd::ZstdCodec;

/// Compression algorithm identifier, persisted as one byte in the container
/// options. The values are part of the file format and shall never change.
#[repr(u8)]
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
pub enum CompressAlgo {
    Lz4 = 1,
    Zstd = 2,
}

/// A single-block compressor/decompressor.
pub trait Codec: Send {
    /// Compresses `src` into `dst`, returning the compressed length. Output
    /// never exceeds `dst.len()`; a block that will not fit is an error.
    fn compress(&mut self, src: &[u8], dst: &mut [u8]) -> ZfileResult<usize>;

    /// Decompresses `src` into `dst`, returning the exact decompressed
    /// length. Corrupt input fails with [`ZfileError::Codec`]; an undersized
    /// `dst` fails with [`ZfileError::Range`] where the format allows the
    /// two to be told apart.
    fn decompress(&mut self, src: &[u8], dst: &mut [u8]) -> ZfileResult<usize>;

    /// Preferred number of blocks per [`compress_batch`] call.
    ///
    /// [`compress_batch`]: Codec::compress_batch
    fn n_batch(&self) -> usize {
        1
    }

    /// Compresses `chunks` into per-chunk slots of `stride` bytes inside
    /// `out`, recording each compressed length in `lens`. The default simply
    /// loops over [`compress`]; codecs with a native batch mode may override.
    ///
    /// [`compress`]: Codec::compress
    fn compress_batch(
        &mut self,
        chunks: &[&[u8]],
        out: &mut [u8],
        stride: usize,
        lens: &mut Vec<usize>,
    ) -> ZfileResult<()> {
        if out.len() < chunks.len() * stride {
            return Err(ZfileError::Range("batch output buffer too small"));
        }
        lens.clear();
        for (i, chunk) in chunks.iter().enumerate() {
            let slot = &mut out[i * stride..(i + 1) * stride];
            lens.push(self.compress(chunk, slot)?);
        }
        Ok(())
    }
}

/// Builds the codec described by `opt`. Construction is deterministic; two
/// codecs built from equal options produce identical output for identical
/// input.
pub fn create_codec(opt: &CompressOptions) -> ZfileResult<Box<dyn Codec + Send>> {
    match opt.algo {
        CompressAlgo::Lz4 => Ok(Box::new(Lz4Codec)),
        CompressAlgo::Zstd => Ok(Box::new(ZstdCodec::new(opt.level as i32)?)),
    }
}
