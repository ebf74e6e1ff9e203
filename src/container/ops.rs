//! Whole-file operations: one-shot compression of a source file into a
//! container, full decompression into a sink, container identification and
//! a checksum-only validity scan.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::instrument;

use crate::base::{ByteSize, ZfileError, ZfileResult};
use crate::codec::create_codec;
use crate::container::builder::{write_tail, CompressArgs};
use crate::container::format::{
    crc32c_salted, write_record, HeaderTrailer, BLOCK_CRC_SIZE, COMPRESS_HEADROOM, HT_SPACE,
};
use crate::container::reader::ZfileReader;
use crate::fio::BackingFile;

/// Result of probing the first 512 bytes of a file.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    /// The magic numbers do not match; some other kind of file.
    NotZfile,
    /// A container with an intact header record.
    Valid,
    /// The magics match but the header record fails its self digest.
    Corrupt,
}

/// Compresses all of `src` into a container written to `dst`.
///
/// This is the batched variant of the builder: it reads `n_batch` blocks of
/// raw data per round, compresses them in one codec call, and appends each
/// output chunk (plus CRC) in order. The tail (index, trailer, optional
/// header overwrite) is identical to the streaming builders'.
#[instrument(skip_all)]
pub async fn compress_file<S, D>(src: &S, dst: &D, args: &CompressArgs) -> ZfileResult<u64>
where
    S: BackingFile,
    D: BackingFile,
{
    args.opt.validate()?;
    let opt = args.opt;
    let mut codec = create_codec(&opt)?;
    info!(
        block_size = ?ByteSize(opt.block_size as u64),
        algo = %opt.algo,
        verify = opt.verify,
        "whole-file compression started"
    );

    let mut ht = HeaderTrailer::new(&opt);
    write_record(dst, &mut ht, true, false, false, 0).await?;

    let block_size = opt.block_size as usize;
    let stride = block_size + COMPRESS_HEADROOM;
    let n_batch = codec.n_batch().max(1);
    let src_size = src.size().await?;

    let mut moffset = HT_SPACE as u64 + opt.dict_size as u64;
    let mut block_len: Vec<u32> = Vec::new();
    let mut out = vec![0u8; n_batch * stride];
    let mut lens: Vec<usize> = Vec::with_capacity(n_batch);
    let mut raw = BytesMut::with_capacity(n_batch * block_size);

    let mut pos = 0u64;
    while pos < src_size {
        let round = ((src_size - pos) as usize).min(n_batch * block_size);
        raw.clear();
        raw.resize(round, 0);
        let (res, filled) = src.read_exact_at(raw, pos).await;
        raw = filled;
        res?;

        let chunks: Vec<&[u8]> = raw.chunks(block_size).collect();
        codec.compress_batch(&chunks, &mut out, stride, &mut lens)?;

        for (slot, &compressed_len) in lens.iter().enumerate() {
            let payload = &out[slot * stride..slot * stride + compressed_len];
            let mut disk = BytesMut::with_capacity(compressed_len + BLOCK_CRC_SIZE);
            disk.put_slice(payload);
            if opt.verify {
                disk.put_u32_le(crc32c_salted(payload));
            }
            let total = disk.len();
            let (res, _) = dst.write_all_at(disk.freeze(), moffset).await;
            res?;
            block_len.push(total as u32);
            moffset += total as u64;
        }
        pos += round as u64;
    }

    write_tail(dst, &mut ht, &block_len, moffset, src_size, args.overwrite_header).await?;
    dst.sync_all().await?;
    info!(
        raw = ?ByteSize(src_size),
        compressed = ?ByteSize(moffset),
        blocks = block_len.len(),
        "whole-file compression finished"
    );
    Ok(src_size)
}

/// Decompresses the whole container `src` into `sink`, block-stride at a
/// time. Returns the number of logical bytes written.
#[instrument(skip_all)]
pub async fn decompress_file<S, D>(src: S, sink: &D) -> ZfileResult<u64>
where
    S: BackingFile,
    D: BackingFile,
{
    let mut reader = ZfileReader::open(src, true).await?;
    let total = reader.size();
    let block_size = reader.options().block_size as usize;

    let mut buf = vec![0u8; block_size];
    let mut pos = 0u64;
    while pos < total {
        let want = block_size.min((total - pos) as usize);
        let got = reader.pread(&mut buf[..want], pos).await?;
        debug_assert_eq!(got, want);
        let (res, _) = sink
            .write_all_at(Bytes::copy_from_slice(&buf[..got]), pos)
            .await;
        res?;
        pos += got as u64;
    }
    sink.sync_all().await?;
    info!(bytes = ?ByteSize(total), "container fully decompressed");
    Ok(total)
}

/// Probes whether `file` is a container, using only its first 512 bytes.
pub async fn identify<F: BackingFile>(file: &F) -> ZfileResult<Identity> {
    let (res, buf) = file.read_exact_at(BytesMut::zeroed(HT_SPACE), 0).await;
    if let Err(e) = res {
        // too short to even hold a header record
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(Identity::NotZfile);
        }
        return Err(e.into());
    }
    match HeaderTrailer::decode(&buf) {
        Ok(ht) if ht.is_header() => Ok(Identity::Valid),
        Ok(_) => Ok(Identity::NotZfile),
        Err(ZfileError::Format(_)) => Ok(Identity::NotZfile),
        Err(ZfileError::Checksum { .. }) => Ok(Identity::Corrupt),
        Err(e) => Err(e),
    }
}

/// Scans every block of the container, verifying its checksum without
/// decompressing. Succeeds iff all blocks are intact; containers built
/// without per-block checksums are rejected.
#[instrument(skip_all)]
pub async fn validate<F: BackingFile>(file: F) -> ZfileResult<()> {
    let mut reader = ZfileReader::open(file, true).await?;
    if !reader.options().verify {
        return Err(ZfileError::Config(
            "container carries no per-block checksums",
        ));
    }
    reader.set_crc_only();

    let total = reader.size();
    let block_size = reader.options().block_size as usize;
    let mut buf = vec![0u8; block_size];
    let mut pos = 0u64;
    while pos < total {
        let want = block_size.min((total - pos) as usize);
        reader.pread(&mut buf[..want], pos).await?;
        pos += want as u64;
    }
    info!(blocks = reader.block_count(), "validity scan passed");
    Ok(())
}
