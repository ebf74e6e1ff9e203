//! The container core: on-disk format, jump table, builders, reader and
//! whole-file operations.

pub mod builder;
pub mod builder_mp;
pub mod format;
pub mod jump;
pub mod ops;
pub mod reader;

#[cfg(test)]
mod tests;

pub use builder::{Builder, CompressArgs, ZfileBuilder};
pub use builder_mp::ZfileBuilderMp;
pub use format::{CompressOptions, HeaderTrailer};
pub use ops::{compress_file, decompress_file, identify, validate, Identity};
pub use reader::{BlockObserver, ZfileReader};
