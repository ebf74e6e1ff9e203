use std::{
    collections::BTreeMap,
    io,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::fio::BackingFile;

#[derive(Debug, Default)]
struct VirtualState {
    data: Vec<u8>,
    /// Stale-cache overlay: reads see these patches instead of `data`, until
    /// a `trim`/`punch_hole` evicts them. Lets tests emulate a caching layer
    /// that served corrupted bytes and heals on re-fetch.
    stale: BTreeMap<u64, Vec<u8>>,
}

impl VirtualState {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> io::Result<()> {
        let end = pos + buf.len() as u64;
        if end > self.data.len() as u64 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of virtual file",
            ));
        }
        buf.copy_from_slice(&self.data[pos as usize..end as usize]);
        for (&patch_pos, patch) in &self.stale {
            let patch_end = patch_pos + patch.len() as u64;
            if patch_end <= pos || patch_pos >= end {
                continue;
            }
            let from = patch_pos.max(pos);
            let to = patch_end.min(end);
            buf[(from - pos) as usize..(to - pos) as usize]
                .copy_from_slice(&patch[(from - patch_pos) as usize..(to - patch_pos) as usize]);
        }
        Ok(())
    }

    fn write_at(&mut self, pos: u64, buf: &[u8]) {
        if buf.is_empty() {
            return;
        }
        let end = (pos as usize) + buf.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[pos as usize..end].copy_from_slice(buf);
    }
}

/// An in-memory [`BackingFile`].
///
/// Handles are cheap clones sharing the same content, mirroring how multiple
/// readers and a builder can hold the same on-disk file. Beyond plain
/// storage it offers fault injection for tests: permanent corruption via
/// [`corrupt_xor`], and "stale cache" corruption via [`inject_stale`] which
/// is healed by the `trim`/`punch_hole` eviction hints, the contract the
/// reader's retry paths are built on.
///
/// [`corrupt_xor`]: VirtualFile::corrupt_xor
/// [`inject_stale`]: VirtualFile::inject_stale
#[derive(Debug, Clone, Default)]
pub struct VirtualFile {
    inner: Arc<RwLock<VirtualState>>,
}

fn poisoned() -> io::Error {
    io::Error::other("virtual file lock poisoned")
}

impl VirtualFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full copy of the current contents, for byte-level assertions.
    pub fn contents(&self) -> Vec<u8> {
        self.inner.read().expect("virtual file lock").data.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("virtual file lock").data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Permanently flips bits of the byte at `offset`. Survives eviction
    /// hints; models true on-disk corruption.
    pub fn corrupt_xor(&self, offset: u64, mask: u8) {
        let mut state = self.inner.write().expect("virtual file lock");
        state.data[offset as usize] ^= mask;
    }

    /// Overlays `bytes` at `offset` for all reads until the range is
    /// trimmed; models a caching layer holding stale or corrupted content.
    pub fn inject_stale(&self, offset: u64, bytes: Vec<u8>) {
        let mut state = self.inner.write().expect("virtual file lock");
        state.stale.insert(offset, bytes);
    }

    /// Like [`inject_stale`], but derives the patch by XOR-ing the byte
    /// currently stored at `offset`.
    ///
    /// [`inject_stale`]: VirtualFile::inject_stale
    pub fn inject_stale_xor(&self, offset: u64, mask: u8) {
        let mut state = self.inner.write().expect("virtual file lock");
        let patch = vec![state.data[offset as usize] ^ mask];
        state.stale.insert(offset, patch);
    }

    /// Number of stale-overlay patches still pending eviction.
    pub fn stale_patches(&self) -> usize {
        self.inner.read().expect("virtual file lock").stale.len()
    }
}

#[async_trait]
impl BackingFile for VirtualFile {
    async fn read_exact_at(&self, mut buf: BytesMut, pos: u64) -> (io::Result<()>, BytesMut) {
        let res = match self.inner.read() {
            Ok(state) => state.read_at(pos, &mut buf),
            Err(_) => Err(poisoned()),
        };
        (res, buf)
    }

    async fn write_all_at(&self, buf: Bytes, pos: u64) -> (io::Result<()>, Bytes) {
        let res = match self.inner.write() {
            Ok(mut state) => {
                state.write_at(pos, &buf);
                Ok(())
            }
            Err(_) => Err(poisoned()),
        };
        (res, buf)
    }

    async fn size(&self) -> io::Result<u64> {
        Ok(self.inner.read().map_err(|_| poisoned())?.data.len() as u64)
    }

    async fn sync_all(&self) -> io::Result<()> {
        Ok(())
    }

    async fn trim(&self, offset: u64, len: u64) -> io::Result<()> {
        let mut state = self.inner.write().map_err(|_| poisoned())?;
        let end = offset + len;
        let before = state.stale.len();
        state
            .stale
            .retain(|&pos, patch| pos + patch.len() as u64 <= offset || pos >= end);
        trace!(
            offset,
            len,
            evicted = before - state.stale.len(),
            "trimmed stale ranges from virtual file"
        );
        Ok(())
    }

    async fn punch_hole(&self) -> io::Result<()> {
        let mut state = self.inner.write().map_err(|_| poisoned())?;
        let evicted = state.stale.len();
        state.stale.clear();
        trace!(evicted, "punched whole-file hole in virtual file");
        Ok(())
    }
}
