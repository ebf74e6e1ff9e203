//! The random-access reader: opens a sealed container, loads the
//! header/trailer metadata and the jump table, and serves `pread` over the
//! logical (uncompressed) content with per-block CRC verification and
//! trim-and-re-read self-healing.

use bytes::BytesMut;
use tracing::instrument;

use crate::base::{ByteSize, HexU32, ZfileError, ZfileResult};
use crate::codec::{create_codec, Codec};
use crate::container::format::{
    crc32c_salted, CompressOptions, HeaderTrailer, BLOCK_CRC_SIZE, HT_SPACE, MAX_READ_SIZE,
};
use crate::container::jump::JumpTable;
use crate::fio::BackingFile;

/// Retries per block before a checksum or decompression failure becomes
/// final.
const BLOCK_RETRY_BUDGET: u32 = 3;

/// Observation hook invoked once per block served, with the compressed
/// payload length and the logical bytes the block contributed. Opt-in at
/// open time; replaces any notion of process-global counters.
pub type BlockObserver = Box<dyn Fn(usize, usize) + Send + Sync>;

/// What the reader does with block payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadMode {
    /// Decompress and serve data; trim-and-re-read on corruption.
    Normal,
    /// Verify checksums only; never decompress, never self-heal.
    CrcOnly,
}

/// Random-access reader over a sealed container.
pub struct ZfileReader<F: BackingFile> {
    file: F,
    ht: HeaderTrailer,
    opt: CompressOptions,
    jump: JumpTable,
    codec: Box<dyn Codec + Send>,
    mode: ReadMode,
    observer: Option<BlockObserver>,
}

impl<F: BackingFile + std::fmt::Debug> std::fmt::Debug for ZfileReader<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZfileReader")
            .field("file", &self.file)
            .field("ht", &self.ht)
            .field("opt", &self.opt)
            .field("jump", &self.jump)
            .field("mode", &self.mode)
            .field("has_observer", &self.observer.is_some())
            .finish()
    }
}

impl<F: BackingFile> ZfileReader<F> {
    /// Opens a container.
    ///
    /// `verify` both enables per-block CRC checking (AND-ed with the flag
    /// persisted in the container) and marks the backing file as evictable:
    /// if the metadata fails to load, the whole cached file is punched out
    /// and the load is retried once before giving up.
    pub async fn open(file: F, verify: bool) -> ZfileResult<Self> {
        Self::open_with(file, verify, None).await
    }

    /// [`open`] with an observation hook called per block served.
    ///
    /// [`open`]: ZfileReader::open
    #[instrument(skip(file, observer))]
    pub async fn open_with(
        file: F,
        verify: bool,
        observer: Option<BlockObserver>,
    ) -> ZfileResult<Self> {
        let (ht, mut opt, jump) = match Self::load_metadata(&file).await {
            Ok(loaded) => loaded,
            Err(e) if verify => {
                // the source may be a stale cache; evict it and retry once
                error!("failed to load container metadata: {e}; evicting and retrying");
                file.punch_hole().await?;
                Self::load_metadata(&file).await?
            }
            Err(e) => return Err(e),
        };
        opt.verify = opt.verify && verify;
        let codec = create_codec(&opt)?;
        info!(
            digest = ?HexU32(ht.self_digest.get()),
            algo = %opt.algo,
            block_size = ?ByteSize(opt.block_size as u64),
            original_size = ht.original_file_size.get(),
            verify = opt.verify,
            "opened container"
        );
        Ok(Self {
            file,
            ht,
            opt,
            jump,
            codec,
            mode: ReadMode::Normal,
            observer,
        })
    }

    async fn load_metadata(file: &F) -> ZfileResult<(HeaderTrailer, CompressOptions, JumpTable)> {
        // header
        let (res, buf) = file.read_exact_at(BytesMut::zeroed(HT_SPACE), 0).await;
        res?;
        let header = HeaderTrailer::decode(&buf)?;
        if !header.is_header() {
            return Err(ZfileError::Format("record at offset 0 is not a header"));
        }

        // the trailer holds the index metadata, unless a finalized trailer
        // image was copied back over the header
        let ht = if header.is_header_overwrite() {
            debug!("header carries the overwritten trailer image");
            header
        } else {
            if !header.is_data() {
                return Err(ZfileError::Format("not a data container"));
            }
            let file_size = file.size().await?;
            if file_size < 2 * HT_SPACE as u64 {
                return Err(ZfileError::Format("file too small for a sealed container"));
            }
            let trailer_offset = file_size - HT_SPACE as u64;
            let (res, buf) = file
                .read_exact_at(BytesMut::zeroed(HT_SPACE), trailer_offset)
                .await;
            res?;
            let trailer = HeaderTrailer::decode(&buf)?;
            if !trailer.is_trailer() || !trailer.is_data() || !trailer.is_sealed() {
                return Err(ZfileError::Format(
                    "trailer role, type or sealedness does not match",
                ));
            }
            let index_bytes = trailer.index_size.get().saturating_mul(4);
            if trailer
                .index_offset
                .get()
                .checked_add(index_bytes)
                .map_or(true, |end| end > trailer_offset)
            {
                return Err(ZfileError::Format("index does not fit the data region"));
            }
            trailer
        };

        let opt = CompressOptions::from_raw(&ht.opt)?;

        // index
        let entries = ht.index_size.get() as usize;
        let (res, index) = file
            .read_exact_at(BytesMut::zeroed(entries * 4), ht.index_offset.get())
            .await;
        res?;
        if ht.digest_enabled() {
            let actual = crc32c::crc32c(&index);
            let expected = ht.index_crc.get();
            if actual != expected {
                error!(
                    expected = ?HexU32(expected),
                    actual = ?HexU32(actual),
                    "block index checksum mismatch"
                );
                return Err(ZfileError::Checksum { expected, actual });
            }
        }
        let block_len: Vec<u32> = index
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let data_start = HT_SPACE as u64 + opt.dict_size as u64;
        let jump = JumpTable::build(&block_len, data_start, opt.block_size, opt.min_block_len())?;
        Ok((ht, opt, jump))
    }

    /// Logical (decompressed) size of the contained data. The analogue of
    /// `fstat` on the container: every other attribute belongs to the
    /// backing file, but the size is the original file's.
    pub fn size(&self) -> u64 {
        self.ht.original_file_size.get()
    }

    /// Number of compressed blocks.
    pub fn block_count(&self) -> u64 {
        self.ht.index_size.get()
    }

    pub fn options(&self) -> &CompressOptions {
        &self.opt
    }

    /// Releases the backing file.
    pub fn into_inner(self) -> F {
        self.file
    }

    /// Switches to checksum-only scanning: `pread` verifies block CRCs and
    /// counts logical bytes without decompressing, and corruption is
    /// reported immediately instead of healed.
    pub(crate) fn set_crc_only(&mut self) {
        self.mode = ReadMode::CrcOnly;
    }

    /// Reads `buf.len()` logical bytes starting at `offset`, clamped to the
    /// end of the contained data. Returns the number of bytes produced;
    /// bytes in `buf` are either correct or an error is returned.
    pub async fn pread(&mut self, buf: &mut [u8], offset: u64) -> ZfileResult<usize> {
        let count = buf.len() as u64;
        let n = self.read_blocks(Some(buf), count, offset).await?;
        Ok(n as usize)
    }

    /// Walks the same block path as [`pread`] without copying or
    /// decompressing, warming any lower-layer cache. Returns the logical
    /// byte count the equivalent `pread` would produce.
    ///
    /// [`pread`]: ZfileReader::pread
    pub async fn prefetch(&mut self, count: u64, offset: u64) -> ZfileResult<u64> {
        self.read_blocks(None, count, offset).await
    }

    async fn read_blocks(
        &mut self,
        mut out: Option<&mut [u8]>,
        count: u64,
        offset: u64,
    ) -> ZfileResult<u64> {
        let original = self.ht.original_file_size.get();
        if offset >= original {
            warn!(offset, original, "read offset beyond contained data");
            return Ok(0);
        }
        let count = count.min(original - offset);
        if count == 0 {
            return Ok(0);
        }

        let block_size = self.opt.block_size as u64;
        let begin = (offset / block_size) as usize;
        let last_byte = offset + count - 1;
        let end = (last_byte / block_size) as usize + 1;

        let mut span = SpanBuffer::fill(&self.file, &self.jump, begin, end).await?;
        let mut scratch: Option<Vec<u8>> = None;
        let mut produced: u64 = 0;

        for idx in begin..end {
            if span.exceeds(&self.jump, idx) {
                span.refill(&self.file, &self.jump, idx, end).await?;
                if span.exceeds(&self.jump, idx) {
                    return Err(ZfileError::Range(
                        "compressed block larger than the read buffer",
                    ));
                }
            }

            let disk_len = self.jump.span(idx, idx + 1) as usize;
            let payload_len = disk_len - if self.opt.verify { BLOCK_CRC_SIZE } else { 0 };
            let slice_begin = if idx == begin {
                (offset % block_size) as usize
            } else {
                0
            };
            let slice_end = if idx == end - 1 {
                (last_byte % block_size) as usize + 1
            } else {
                block_size as usize
            };
            let slice_len = slice_end - slice_begin;

            let mut retries = BLOCK_RETRY_BUDGET;
            loop {
                let block = span.block(&self.jump, idx);
                let payload = &block[..payload_len];

                if self.opt.verify {
                    let stored = u32::from_le_bytes(
                        block[payload_len..disk_len]
                            .try_into()
                            .expect("block crc trailer is 4 bytes"),
                    );
                    let computed = crc32c_salted(payload);
                    if computed != stored {
                        if self.mode == ReadMode::Normal && retries > 0 {
                            retries -= 1;
                            error!(
                                block = idx,
                                expected = ?HexU32(stored),
                                actual = ?HexU32(computed),
                                retries,
                                "block checksum failed; trimming and re-reading"
                            );
                            span.reload(&self.file, &self.jump, idx).await?;
                            continue;
                        }
                        return Err(ZfileError::Checksum {
                            expected: stored,
                            actual: computed,
                        });
                    }
                }

                if self.mode == ReadMode::CrcOnly {
                    break;
                }
                let Some(dst) = out.as_deref_mut() else {
                    // prefetch: the backing read already happened
                    break;
                };

                let dst_range = &mut dst[produced as usize..produced as usize + slice_len];
                let decompressed = if slice_len == block_size as usize {
                    // the slice covers the whole block: decompress in place
                    self.codec.decompress(payload, dst_range).and_then(|n| {
                        if n == slice_len {
                            Ok(n)
                        } else {
                            Err(ZfileError::Codec(format!(
                                "block {idx} decompressed to {n} bytes, expected {slice_len}"
                            )))
                        }
                    })
                } else {
                    let block_buf = scratch
                        .get_or_insert_with(|| vec![0u8; self.opt.block_size as usize]);
                    self.codec.decompress(payload, block_buf).and_then(|n| {
                        if n >= slice_end {
                            dst_range
                                .copy_from_slice(&block_buf[slice_begin..slice_end]);
                            Ok(n)
                        } else {
                            Err(ZfileError::Codec(format!(
                                "block {idx} decompressed to {n} bytes, expected at least {slice_end}"
                            )))
                        }
                    })
                };

                match decompressed {
                    Ok(_) => break,
                    Err(e) => {
                        if self.mode == ReadMode::Normal && retries > 0 {
                            retries -= 1;
                            error!(
                                block = idx,
                                retries,
                                "decompression failed ({e}); trimming and re-reading"
                            );
                            span.reload(&self.file, &self.jump, idx).await?;
                            continue;
                        }
                        return Err(e);
                    }
                }
            }

            if let Some(hook) = &self.observer {
                hook(payload_len, slice_len);
            }
            produced += slice_len as u64;
        }

        Ok(produced)
    }
}

/// Read-ahead buffer over a contiguous run of compressed blocks: up to
/// [`MAX_READ_SIZE`] bytes fetched with a single positioned read, plus the
/// index of the first block it holds. Replaces the pointer-threaded iterator
/// of older designs with explicit state.
struct SpanBuffer {
    buf: BytesMut,
    base: usize,
}

impl SpanBuffer {
    async fn fill<F: BackingFile>(
        file: &F,
        jump: &JumpTable,
        begin: usize,
        end: usize,
    ) -> ZfileResult<Self> {
        let mut span = Self {
            buf: BytesMut::new(),
            base: begin,
        };
        span.refill(file, jump, begin, end).await?;
        Ok(span)
    }

    /// Re-anchors the buffer at `begin` and reads as much of `[begin, end)`
    /// as fits.
    async fn refill<F: BackingFile>(
        &mut self,
        file: &F,
        jump: &JumpTable,
        begin: usize,
        end: usize,
    ) -> ZfileResult<()> {
        let len = (jump.span(begin, end) as usize).min(MAX_READ_SIZE);
        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();
        buf.resize(len, 0);
        let (res, buf) = file.read_exact_at(buf, jump.offset(begin)).await;
        self.buf = buf;
        res?;
        self.base = begin;
        trace!(begin, end, len, "filled compressed read-ahead buffer");
        Ok(())
    }

    /// Whether block `idx` extends past the buffered bytes.
    fn exceeds(&self, jump: &JumpTable, idx: usize) -> bool {
        jump.span(self.base, idx + 1) as usize > self.buf.len()
    }

    /// The buffered on-disk bytes of block `idx`, CRC trailer included.
    /// Callers check [`exceeds`] first.
    ///
    /// [`exceeds`]: SpanBuffer::exceeds
    fn block(&self, jump: &JumpTable, idx: usize) -> &[u8] {
        let start = jump.span(self.base, idx) as usize;
        let len = jump.span(idx, idx + 1) as usize;
        &self.buf[start..start + len]
    }

    /// Asks the backing file to evict block `idx` and re-reads just that
    /// block into its place in the buffer.
    async fn reload<F: BackingFile>(
        &mut self,
        file: &F,
        jump: &JumpTable,
        idx: usize,
    ) -> ZfileResult<()> {
        let pos = jump.offset(idx);
        let len = jump.span(idx, idx + 1) as usize;
        warn!(block = idx, pos, len, "trim and reload of compressed block");
        file.trim(pos, len as u64).await?;

        let start = jump.span(self.base, idx) as usize;
        let mut head = std::mem::take(&mut self.buf);
        let mut mid = head.split_off(start);
        let tail = mid.split_off(len);
        let (res, mut mid) = file.read_exact_at(mid, pos).await;
        mid.unsplit(tail);
        head.unsplit(mid);
        self.buf = head;
        res?;
        Ok(())
    }
}
