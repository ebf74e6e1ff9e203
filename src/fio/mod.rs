//! # Backing-file I/O
//!
//! The container never touches the filesystem directly. Builders and readers
//! operate on a [`BackingFile`]: any byte-addressable object offering
//! positioned reads and writes, a size query, and cache-eviction hints. This
//! keeps the core usable over local disks, network blobs and in-memory
//! buffers alike, and makes corruption scenarios testable.
//!
//! Buffers are passed by value and handed back alongside the result, so
//! implementations are free to move them across threads (or submit them to a
//! kernel ring) without copying.

use std::io;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

mod local_fio;
mod virtual_fio;

pub use local_fio::*;
pub use virtual_fio::*;

fn not_supported(what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{what} is not supported by this backing file"),
    )
}

/// A byte-addressable backing store.
///
/// Only the operations the container core actually needs are part of the
/// trait. `trim` and `punch_hole` are best-effort hints that a cached range
/// (or the whole cached file) should be dropped and re-fetched from the
/// source of truth; backends without a cache may accept them as no-ops, and
/// backends that cannot express them at all reject them at call time with
/// [`io::ErrorKind::Unsupported`] via the provided defaults.
#[async_trait]
pub trait BackingFile: Send + Sync {
    /// Reads exactly `buf.len()` bytes at absolute offset `pos`.
    async fn read_exact_at(&self, buf: BytesMut, pos: u64) -> (io::Result<()>, BytesMut);

    /// Writes all of `buf` at absolute offset `pos`.
    async fn write_all_at(&self, buf: Bytes, pos: u64) -> (io::Result<()>, Bytes);

    /// Current size of the backing file in bytes.
    async fn size(&self) -> io::Result<u64>;

    /// Flushes buffered state to durable storage.
    async fn sync_all(&self) -> io::Result<()>;

    /// Hints that the byte range `[offset, offset + len)` may be stale and
    /// should be evicted from any intermediate cache.
    async fn trim(&self, _offset: u64, _len: u64) -> io::Result<()> {
        Err(not_supported("trim"))
    }

    /// Hints that the entire cached content may be stale. Equivalent to a
    /// whole-file hole punch on cache-backed implementations.
    async fn punch_hole(&self) -> io::Result<()> {
        Err(not_supported("punch_hole"))
    }
}
