//! # ZFile
//!
//! A read-optimized, block-compressed, random-accessible file container.
//!
//! A ZFile wraps an arbitrary byte-addressable backing file and presents a
//! read-only view of the original, uncompressed content. Raw data is chopped
//! into fixed-size blocks, each compressed independently and optionally
//! followed by a salted CRC-32C, so that any `pread(offset, len)` resolves to
//! a minimal set of backing-file reads and decompresses only the blocks that
//! intersect the requested range.
//!
//! ## Container layout
//!
//! ```text
//! | Header (512B) | dict (optional) | block 0 [crc0] | block 1 [crc1] | ...
//!   ... | block N-1 [crcN-1] | index: N x u32 | Trailer (512B) |
//! ```
//!
//! The header and trailer share one 512-byte record type carrying the magic
//! numbers, compression options, index location and a self CRC. After
//! finalization the trailer can optionally be copied back over the header
//! ("header overwrite"), letting a reader load all metadata from the first
//! 512 bytes alone.
//!
//! ## Modules
//!
//! - [`fio`]: the backing-file abstraction (positioned I/O plus cache
//!   eviction hints) with local-disk and in-memory implementations.
//! - [`codec`]: the pluggable block compression interface (LZ4, ZSTD).
//! - [`container`]: the on-disk format, the streaming builders (single and
//!   multi-worker), the random-access reader and the whole-file operations.

#[macro_use]
extern crate derive_more;
#[macro_use]
extern crate tracing;

pub mod base;
pub mod codec;
pub mod container;
pub mod fio;

pub use base::{ZfileError, ZfileResult};
pub use codec::{create_codec, Codec, CompressAlgo};
pub use container::builder::{Builder, CompressArgs, ZfileBuilder};
pub use container::builder_mp::ZfileBuilderMp;
pub use container::format::{CompressOptions, HeaderTrailer, MAX_READ_SIZE};
pub use container::ops::{compress_file, decompress_file, identify, validate, Identity};
pub use container::reader::{BlockObserver, ZfileReader};
pub use fio::{BackingFile, LocalFile, VirtualFile};
