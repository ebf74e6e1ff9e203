//! The streaming single-worker builder, the argument bundle shared by every
//! compression entry point, and the front door that picks a builder variant
//! from the requested worker count.

use bytes::{BufMut, BytesMut};

use crate::base::{ByteSize, ZfileResult};
use crate::codec::{create_codec, Codec};
use crate::container::builder_mp::ZfileBuilderMp;
use crate::container::format::{
    crc32c_salted, write_record, CompressOptions, HeaderTrailer, BLOCK_CRC_SIZE, COMPRESS_HEADROOM,
    HT_SPACE,
};
use crate::fio::BackingFile;

/// How a container should be built.
#[derive(Debug, Clone)]
pub struct CompressArgs {
    pub opt: CompressOptions,
    /// Number of parallel compression workers; `1` selects the
    /// single-worker builder.
    pub workers: usize,
    /// Copy the trailer record back over the header after sealing, so a
    /// reader can load all metadata from the first 512 bytes.
    pub overwrite_header: bool,
}

impl Default for CompressArgs {
    fn default() -> Self {
        Self {
            opt: CompressOptions::default(),
            workers: 1,
            overwrite_header: false,
        }
    }
}

/// Compresses one raw block into `out` and appends the salted CRC when
/// `verify` is set. Returns the total on-disk length of the block.
pub(crate) fn compress_block(
    codec: &mut dyn Codec,
    opt: &CompressOptions,
    raw: &[u8],
    out: &mut BytesMut,
) -> ZfileResult<usize> {
    let cap = opt.block_size as usize + COMPRESS_HEADROOM;
    let crc_room = if opt.verify { BLOCK_CRC_SIZE } else { 0 };
    out.clear();
    out.resize(cap, 0);

    let n = codec.compress(raw, &mut out[..cap - crc_room])?;
    let mut total = n;
    if opt.verify {
        let crc = crc32c_salted(&out[..n]);
        out[n..n + BLOCK_CRC_SIZE].copy_from_slice(&crc.to_le_bytes());
        total += BLOCK_CRC_SIZE;
    }
    out.truncate(total);
    Ok(total)
}

/// Serializes the block-length index, stamps the trailer metadata and writes
/// index + trailer (+ optional trailer-over-header copy). Shared by both
/// builders and the whole-file compressor.
pub(crate) async fn write_tail<F: BackingFile>(
    file: &F,
    ht: &mut HeaderTrailer,
    block_len: &[u32],
    index_offset: u64,
    raw_size: u64,
    overwrite_header: bool,
) -> ZfileResult<()> {
    let mut index = BytesMut::with_capacity(block_len.len() * 4);
    for &len in block_len {
        index.put_u32_le(len);
    }
    let index_crc = crc32c::crc32c(&index);
    let index_bytes = index.len() as u64;
    info!(
        offset = index_offset,
        entries = block_len.len(),
        size = ?ByteSize(index_bytes),
        "writing block index"
    );
    let (res, _) = file.write_all_at(index.freeze(), index_offset).await;
    res?;

    ht.index_offset.set(index_offset);
    ht.index_size.set(block_len.len() as u64);
    ht.original_file_size.set(raw_size);
    ht.index_crc.set(index_crc);

    info!(raw_size, "writing trailer");
    write_record(file, ht, false, true, false, index_offset + index_bytes).await?;
    if overwrite_header {
        info!("overwriting file header with trailer image");
        write_record(file, ht, true, false, true, 0).await?;
    }
    Ok(())
}

/// Single-worker streaming builder.
///
/// Accepts writes of any size, buffers a partial tail block until a full
/// `block_size` accumulates, and appends one compressed block (plus CRC) per
/// full block. [`finalize`] flushes the short tail, writes the index and
/// trailer, and hands the backing file back.
///
/// [`finalize`]: ZfileBuilder::finalize
pub struct ZfileBuilder<F: BackingFile> {
    file: F,
    opt: CompressOptions,
    overwrite_header: bool,
    codec: Box<dyn Codec + Send>,
    ht: HeaderTrailer,
    /// Next append position in the backing file.
    moffset: u64,
    /// Total raw bytes accepted so far.
    raw_size: u64,
    block_len: Vec<u32>,
    /// Buffered partial tail; always shorter than one block.
    reserved: BytesMut,
    scratch: BytesMut,
}

impl<F: BackingFile> ZfileBuilder<F> {
    /// Validates the options, writes the (unsealed) header and returns a
    /// builder ready for [`write`] calls.
    ///
    /// [`write`]: ZfileBuilder::write
    pub async fn create(file: F, args: &CompressArgs) -> ZfileResult<Self> {
        args.opt.validate()?;
        let codec = create_codec(&args.opt)?;
        info!(
            block_size = ?ByteSize(args.opt.block_size as u64),
            algo = %args.opt.algo,
            verify = args.opt.verify,
            "creating stream compressing builder"
        );

        let mut ht = HeaderTrailer::new(&args.opt);
        write_record(&file, &mut ht, true, false, false, 0).await?;

        let block_size = args.opt.block_size as usize;
        Ok(Self {
            file,
            opt: args.opt,
            overwrite_header: args.overwrite_header,
            codec,
            ht,
            moffset: (HT_SPACE as u64) + args.opt.dict_size as u64,
            raw_size: 0,
            block_len: Vec::new(),
            reserved: BytesMut::with_capacity(block_size),
            scratch: BytesMut::with_capacity(block_size + COMPRESS_HEADROOM),
        })
    }

    /// Accepts `buf` in its entirety, cutting and compressing full blocks as
    /// they form. Returns `buf.len()`.
    pub async fn write(&mut self, mut buf: &[u8]) -> ZfileResult<usize> {
        let accepted = buf.len();
        self.raw_size += accepted as u64;
        let block_size = self.opt.block_size as usize;

        if !self.reserved.is_empty() {
            if self.reserved.len() + buf.len() < block_size {
                self.reserved.extend_from_slice(buf);
                return Ok(accepted);
            }
            let fill = block_size - self.reserved.len();
            self.reserved.extend_from_slice(&buf[..fill]);
            buf = &buf[fill..];

            let block = std::mem::take(&mut self.reserved);
            self.flush_block(&block).await?;
            self.reserved = block;
            self.reserved.clear();
        }

        let mut pos = 0;
        while pos < buf.len() {
            if pos + block_size > buf.len() {
                self.reserved.extend_from_slice(&buf[pos..]);
                break;
            }
            self.flush_block(&buf[pos..pos + block_size]).await?;
            pos += block_size;
        }
        trace!(accepted, reserved = self.reserved.len(), "buffered write");
        Ok(accepted)
    }

    async fn flush_block(&mut self, raw: &[u8]) -> ZfileResult<()> {
        let total = compress_block(self.codec.as_mut(), &self.opt, raw, &mut self.scratch)?;
        let (res, returned) = self
            .file
            .write_all_at(self.scratch.split().freeze(), self.moffset)
            .await;
        if let Ok(recycled) = returned.try_into_mut() {
            self.scratch = recycled;
            self.scratch.clear();
        }
        res?;
        self.block_len.push(total as u32);
        self.moffset += total as u64;
        Ok(())
    }

    /// Flushes the reserved tail as a short final block, writes the index
    /// and sealed trailer (and the optional header overwrite), syncs, and
    /// returns the backing file.
    pub async fn finalize(mut self) -> ZfileResult<F> {
        if !self.reserved.is_empty() {
            debug!(len = self.reserved.len(), "compressing reserved tail block");
            let tail = std::mem::take(&mut self.reserved);
            self.flush_block(&tail).await?;
        }
        write_tail(
            &self.file,
            &mut self.ht,
            &self.block_len,
            self.moffset,
            self.raw_size,
            self.overwrite_header,
        )
        .await?;
        self.file.sync_all().await?;
        Ok(self.file)
    }
}

/// Front door over the two builder variants, selected by
/// [`CompressArgs::workers`].
pub enum Builder<F: BackingFile> {
    Stream(ZfileBuilder<F>),
    Parallel(ZfileBuilderMp<F>),
}

impl<F: BackingFile + 'static> Builder<F> {
    pub async fn create(file: F, args: &CompressArgs) -> ZfileResult<Self> {
        if args.workers <= 1 {
            Ok(Self::Stream(ZfileBuilder::create(file, args).await?))
        } else {
            Ok(Self::Parallel(ZfileBuilderMp::create(file, args).await?))
        }
    }

    pub async fn write(&mut self, buf: &[u8]) -> ZfileResult<usize> {
        match self {
            Self::Stream(b) => b.write(buf).await,
            Self::Parallel(b) => b.write(buf).await,
        }
    }

    pub async fn finalize(self) -> ZfileResult<F> {
        match self {
            Self::Stream(b) => b.finalize().await,
            Self::Parallel(b) => b.finalize().await,
        }
    }
}
