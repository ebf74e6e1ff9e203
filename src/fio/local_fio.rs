use std::{
    fs,
    io,
    os::unix::fs::FileExt,
    path::Path,
    sync::Arc,
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::fio::BackingFile;

/// A [`BackingFile`] over a local filesystem file.
///
/// Positioned I/O goes through [`FileExt`] on a blocking worker thread, so a
/// handle can be shared freely between async tasks; there is no seek cursor.
/// `trim` and `punch_hole` are accepted as no-ops: the local page cache is
/// coherent with the file contents, so there is nothing stale to evict.
#[derive(Debug, Clone)]
pub struct LocalFile(Arc<fs::File>);

impl LocalFile {
    /// Opens an existing file read-only.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_owned();
        let file = tokio::task::spawn_blocking(move || fs::File::open(path))
            .await
            .map_err(io::Error::other)??;
        Ok(Self(Arc::new(file)))
    }

    /// Creates (or truncates) a file for read-write access.
    pub async fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_owned();
        let file = tokio::task::spawn_blocking(move || {
            fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
        })
        .await
        .map_err(io::Error::other)??;
        Ok(Self(Arc::new(file)))
    }
}

#[async_trait]
impl BackingFile for LocalFile {
    async fn read_exact_at(&self, mut buf: BytesMut, pos: u64) -> (io::Result<()>, BytesMut) {
        let file = self.0.clone();
        match tokio::task::spawn_blocking(move || {
            let res = file.read_exact_at(&mut buf, pos);
            (res, buf)
        })
        .await
        {
            Ok(out) => out,
            Err(join) => (Err(io::Error::other(join)), BytesMut::new()),
        }
    }

    async fn write_all_at(&self, buf: Bytes, pos: u64) -> (io::Result<()>, Bytes) {
        let file = self.0.clone();
        match tokio::task::spawn_blocking(move || {
            let res = file.write_all_at(&buf, pos);
            (res, buf)
        })
        .await
        {
            Ok(out) => out,
            Err(join) => (Err(io::Error::other(join)), Bytes::new()),
        }
    }

    async fn size(&self) -> io::Result<u64> {
        let file = self.0.clone();
        tokio::task::spawn_blocking(move || file.metadata().map(|m| m.len()))
            .await
            .map_err(io::Error::other)?
    }

    async fn sync_all(&self) -> io::Result<()> {
        let file = self.0.clone();
        tokio::task::spawn_blocking(move || file.sync_all())
            .await
            .map_err(io::Error::other)?
    }

    async fn trim(&self, offset: u64, len: u64) -> io::Result<()> {
        trace!(offset, len, "trim hint ignored on local file");
        Ok(())
    }

    async fn punch_hole(&self) -> io::Result<()> {
        trace!("punch_hole hint ignored on local file");
        Ok(())
    }
}
