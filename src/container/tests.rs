use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use bytes::Bytes;

use crate::base::ZfileError;
use crate::codec::CompressAlgo;
use crate::container::builder::{Builder, CompressArgs, ZfileBuilder};
use crate::container::builder_mp::ZfileBuilderMp;
use crate::container::format::{CompressOptions, HeaderTrailer, BLOCK_CRC_SIZE, HT_SPACE};
use crate::container::ops::{compress_file, decompress_file, identify, validate, Identity};
use crate::container::reader::ZfileReader;
use crate::fio::{BackingFile, VirtualFile};
use crate::tests::{deterministic_bytes, setup_tracing};

const KIB: usize = 1024;
const MIB: usize = 1024 * 1024;

fn lz4_args(block_size: u32, verify: bool) -> CompressArgs {
    CompressArgs {
        opt: CompressOptions {
            algo: CompressAlgo::Lz4,
            block_size,
            verify,
            ..Default::default()
        },
        workers: 1,
        overwrite_header: false,
    }
}

/// Streams `data` through the single-worker builder in odd-sized writes, so
/// the reserved-tail path is always exercised.
async fn build_container(data: &[u8], args: &CompressArgs) -> VirtualFile {
    let file = VirtualFile::new();
    let mut builder = ZfileBuilder::create(file.clone(), args).await.unwrap();
    for chunk in data.chunks(7 * KIB + 13) {
        assert_eq!(builder.write(chunk).await.unwrap(), chunk.len());
    }
    builder.finalize().await.unwrap();
    file
}

/// Trailer record plus decoded block-length index, read straight from the
/// raw container bytes.
fn parse_tail(file: &VirtualFile) -> (HeaderTrailer, Vec<u32>) {
    let data = file.contents();
    let ht = HeaderTrailer::decode(&data[data.len() - HT_SPACE..]).unwrap();
    let off = ht.index_offset.get() as usize;
    let entries = ht.index_size.get() as usize;
    let lens = data[off..off + entries * 4]
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect();
    (ht, lens)
}

#[tokio::test]
async fn empty_container_is_header_index_trailer() {
    setup_tracing();
    let file = build_container(&[], &lz4_args(64 * KIB as u32, true)).await;
    // header + zero-entry index + trailer
    assert_eq!(file.len(), 2 * HT_SPACE);

    let (ht, lens) = parse_tail(&file);
    assert!(ht.is_sealed());
    assert_eq!(ht.original_file_size.get(), 0);
    assert_eq!(ht.index_size.get(), 0);
    assert!(lens.is_empty());

    let mut reader = ZfileReader::open(file, true).await.unwrap();
    assert_eq!(reader.size(), 0);
    assert_eq!(reader.block_count(), 0);
    let mut buf = [0u8; 16];
    assert_eq!(reader.pread(&mut buf, 0).await.unwrap(), 0);
}

#[tokio::test]
async fn zeros_roundtrip_with_sixteen_blocks() {
    setup_tracing();
    let data = vec![0u8; MIB];
    let file = build_container(&data, &lz4_args(64 * KIB as u32, true)).await;

    let (ht, lens) = parse_tail(&file);
    assert_eq!(ht.index_size.get(), 16);
    assert_eq!(ht.original_file_size.get(), MIB as u64);
    assert!(lens.iter().all(|&l| l > BLOCK_CRC_SIZE as u32));

    let mut reader = ZfileReader::open(file, true).await.unwrap();
    let mut out = vec![0xAAu8; MIB];
    assert_eq!(reader.pread(&mut out, 0).await.unwrap(), MIB);
    assert_eq!(out, data);
}

#[tokio::test]
async fn partial_range_spans_exactly_two_blocks() {
    setup_tracing();
    let data = deterministic_bytes(42, 100 * KIB);
    let file = build_container(&data, &lz4_args(64 * KIB as u32, true)).await;

    let (ht, _) = parse_tail(&file);
    assert_eq!(ht.index_size.get(), 2);

    let mut reader = ZfileReader::open(file, true).await.unwrap();
    let mut out = vec![0u8; 20 * KIB];
    let n = reader
        .pread(&mut out, 50 * KIB as u64)
        .await
        .unwrap();
    assert_eq!(n, 20 * KIB);
    assert_eq!(out, &data[50 * KIB..70 * KIB]);
}

#[tokio::test]
async fn flipped_crc_byte_fails_after_retry_budget() {
    setup_tracing();
    let data = deterministic_bytes(42, 100 * KIB);
    let file = build_container(&data, &lz4_args(64 * KIB as u32, true)).await;

    // flip the last CRC byte of the second block, permanently
    let (_, lens) = parse_tail(&file);
    let crc_end = HT_SPACE as u64 + lens[0] as u64 + lens[1] as u64;
    file.corrupt_xor(crc_end - 1, 0xFF);

    let mut reader = ZfileReader::open(file, true).await.unwrap();
    let mut byte = [0u8; 1];
    let err = reader.pread(&mut byte, 64 * KIB as u64).await.unwrap_err();
    assert!(matches!(err, ZfileError::Checksum { .. }), "got {err}");
}

#[tokio::test]
async fn corruption_in_payload_also_surfaces_as_checksum_error() {
    setup_tracing();
    let data = deterministic_bytes(7, 80 * KIB);
    let file = build_container(&data, &lz4_args(64 * KIB as u32, true)).await;

    // first payload byte of block 0
    file.corrupt_xor(HT_SPACE as u64, 0x5A);

    let mut reader = ZfileReader::open(file, true).await.unwrap();
    let mut out = vec![0u8; 4 * KIB];
    let err = reader.pread(&mut out, 0).await.unwrap_err();
    assert!(matches!(err, ZfileError::Checksum { .. }), "got {err}");
}

#[tokio::test]
async fn multi_worker_counter_build_reads_back() {
    setup_tracing();
    let data: Vec<u8> = (0..10 * MIB).map(|i| (i % 256) as u8).collect();
    let args = CompressArgs {
        workers: 4,
        ..lz4_args(MIB as u32, true)
    };

    let file = VirtualFile::new();
    let mut builder = ZfileBuilderMp::create(file.clone(), &args).await.unwrap();
    for chunk in data.chunks(300 * KIB + 37) {
        assert_eq!(builder.write(chunk).await.unwrap(), chunk.len());
    }
    builder.finalize().await.unwrap();

    let (ht, _) = parse_tail(&file);
    assert_eq!(ht.original_file_size.get(), 10 * MIB as u64);
    assert_eq!(ht.index_size.get(), 10);

    let mut reader = ZfileReader::open(file, true).await.unwrap();
    let mut out = vec![0u8; MIB];
    for block in 0..10 {
        let pos = (block * MIB) as u64;
        assert_eq!(reader.pread(&mut out, pos).await.unwrap(), MIB);
        assert_eq!(out, &data[block * MIB..(block + 1) * MIB], "block {block}");
    }
}

#[tokio::test]
async fn multi_worker_output_is_byte_identical_to_single() {
    setup_tracing();
    let data = deterministic_bytes(1234, 2 * MIB + 321 * KIB + 7);
    let base = lz4_args(64 * KIB as u32, true);

    let single = build_container(&data, &base).await;

    for workers in [2usize, 4] {
        let args = CompressArgs {
            workers,
            ..base.clone()
        };
        let file = VirtualFile::new();
        let mut builder = Builder::create(file.clone(), &args).await.unwrap();
        for chunk in data.chunks(123 * KIB + 1) {
            builder.write(chunk).await.unwrap();
        }
        builder.finalize().await.unwrap();
        assert_eq!(
            file.contents(),
            single.contents(),
            "{workers}-worker output diverged"
        );
    }
}

#[tokio::test]
async fn unsealed_trailer_is_a_format_error() {
    setup_tracing();
    let data = deterministic_bytes(3, 10 * KIB);
    let file = build_container(&data, &lz4_args(4 * KIB as u32, true)).await;

    // rewrite the trailer with the sealed bit cleared but a valid digest
    let (mut ht, _) = parse_tail(&file);
    ht.clear_sealed();
    let image = ht.seal_record();
    let pos = (file.len() - HT_SPACE) as u64;
    let (res, _) = file.write_all_at(Bytes::copy_from_slice(&image), pos).await;
    res.unwrap();

    let err = ZfileReader::open(file, true).await.unwrap_err();
    assert!(matches!(err, ZfileError::Format(_)), "got {err}");
}

#[tokio::test]
async fn flipped_index_byte_is_a_checksum_error() {
    setup_tracing();
    let data = deterministic_bytes(11, 40 * KIB);
    let file = build_container(&data, &lz4_args(4 * KIB as u32, true)).await;

    let (ht, _) = parse_tail(&file);
    file.corrupt_xor(ht.index_offset.get(), 0x01);

    let err = ZfileReader::open(file.clone(), false).await.unwrap_err();
    assert!(matches!(err, ZfileError::Checksum { .. }), "got {err}");
}

#[tokio::test]
async fn pread_heals_stale_cached_block() {
    setup_tracing();
    let data = deterministic_bytes(99, 96 * KIB);
    let file = build_container(&data, &lz4_args(32 * KIB as u32, true)).await;

    // a caching layer served one corrupted byte inside block 0's payload;
    // the eviction hint repairs it
    file.inject_stale_xor(HT_SPACE as u64 + 3, 0xFF);

    let mut reader = ZfileReader::open(file.clone(), true).await.unwrap();
    let mut out = vec![0u8; data.len()];
    assert_eq!(reader.pread(&mut out, 0).await.unwrap(), data.len());
    assert_eq!(out, data);
    assert_eq!(file.stale_patches(), 0, "stale range was not evicted");
}

#[tokio::test]
async fn open_heals_stale_metadata_when_verifying() {
    setup_tracing();
    let data = deterministic_bytes(5, 20 * KIB);
    let file = build_container(&data, &lz4_args(4 * KIB as u32, true)).await;

    let trailer_pos = (file.len() - HT_SPACE) as u64;
    file.inject_stale_xor(trailer_pos + 40, 0xFF);

    // without verify the reader must not evict anything
    assert!(ZfileReader::open(file.clone(), false).await.is_err());
    assert_eq!(file.stale_patches(), 1);

    // with verify the whole-file hole punch evicts and the retry succeeds
    let mut reader = ZfileReader::open(file.clone(), true).await.unwrap();
    assert_eq!(file.stale_patches(), 0);
    let mut out = vec![0u8; data.len()];
    reader.pread(&mut out, 0).await.unwrap();
    assert_eq!(out, data);
}

#[tokio::test]
async fn header_overwrite_serves_reads_without_a_trailer() {
    setup_tracing();
    let data = deterministic_bytes(21, 50 * KIB);
    let args = CompressArgs {
        overwrite_header: true,
        ..lz4_args(16 * KIB as u32, true)
    };
    let file = build_container(&data, &args).await;

    let header = HeaderTrailer::decode(&file.contents()[..HT_SPACE]).unwrap();
    assert!(header.is_header());
    assert!(header.is_header_overwrite());
    assert_eq!(header.original_file_size.get(), data.len() as u64);

    // wipe the trailer record: the reader must never look at it
    let pos = (file.len() - HT_SPACE) as u64;
    let (res, _) = file
        .write_all_at(Bytes::from(vec![0u8; HT_SPACE]), pos)
        .await;
    res.unwrap();

    let mut reader = ZfileReader::open(file, true).await.unwrap();
    let mut out = vec![0u8; data.len()];
    assert_eq!(reader.pread(&mut out, 0).await.unwrap(), data.len());
    assert_eq!(out, data);
}

#[tokio::test]
async fn prefetch_reports_logical_bytes_only() {
    setup_tracing();
    let data = deterministic_bytes(64, 100 * KIB);
    let file = build_container(&data, &lz4_args(32 * KIB as u32, true)).await;

    let mut reader = ZfileReader::open(file, true).await.unwrap();
    assert_eq!(
        reader.prefetch(60 * KIB as u64, 10 * KIB as u64).await.unwrap(),
        60 * KIB as u64
    );
    // clamped at the end of the data
    assert_eq!(
        reader
            .prefetch(MIB as u64, 90 * KIB as u64)
            .await
            .unwrap(),
        10 * KIB as u64
    );
    assert_eq!(reader.prefetch(KIB as u64, 200 * KIB as u64).await.unwrap(), 0);
}

#[tokio::test]
async fn observer_sees_every_block_served() {
    setup_tracing();
    let data = deterministic_bytes(17, 64 * KIB);
    let file = build_container(&data, &lz4_args(16 * KIB as u32, true)).await;

    let blocks = Arc::new(AtomicUsize::new(0));
    let logical = Arc::new(AtomicUsize::new(0));
    let (b, l) = (blocks.clone(), logical.clone());
    let mut reader = ZfileReader::open_with(
        file,
        true,
        Some(Box::new(move |_, n| {
            b.fetch_add(1, Ordering::Relaxed);
            l.fetch_add(n, Ordering::Relaxed);
        })),
    )
    .await
    .unwrap();

    let mut out = vec![0u8; 20 * KIB];
    reader.pread(&mut out, 10 * KIB as u64).await.unwrap();
    assert_eq!(blocks.load(Ordering::Relaxed), 2);
    assert_eq!(logical.load(Ordering::Relaxed), 20 * KIB);
}

#[tokio::test]
async fn every_offset_and_length_roundtrips() {
    setup_tracing();
    let data = deterministic_bytes(31, 10 * KIB);
    let file = build_container(&data, &lz4_args(KIB as u32, true)).await;
    let mut reader = ZfileReader::open(file, true).await.unwrap();

    for start in (0..data.len()).step_by(701) {
        for len in [1usize, 13, KIB, 3 * KIB + 5] {
            let end = (start + len).min(data.len());
            let mut out = vec![0u8; len];
            let n = reader.pread(&mut out, start as u64).await.unwrap();
            assert_eq!(n, end - start, "pread({start}, {len})");
            assert_eq!(&out[..n], &data[start..end], "pread({start}, {len})");
        }
    }
}

#[tokio::test]
async fn zstd_container_roundtrips() {
    setup_tracing();
    let data = deterministic_bytes(8, 300 * KIB);
    let args = CompressArgs {
        opt: CompressOptions {
            algo: CompressAlgo::Zstd,
            block_size: 64 * KIB as u32,
            level: 3,
            verify: true,
            ..Default::default()
        },
        workers: 1,
        overwrite_header: false,
    };
    let file = build_container(&data, &args).await;

    let mut reader = ZfileReader::open(file, true).await.unwrap();
    let mut out = vec![0u8; data.len()];
    assert_eq!(reader.pread(&mut out, 0).await.unwrap(), data.len());
    assert_eq!(out, data);
}

#[tokio::test]
async fn verify_disabled_container_has_no_crcs() {
    setup_tracing();
    let data = deterministic_bytes(13, 30 * KIB);
    let with_crc = build_container(&data, &lz4_args(8 * KIB as u32, true)).await;
    let without_crc = build_container(&data, &lz4_args(8 * KIB as u32, false)).await;

    let (_, lens_with) = parse_tail(&with_crc);
    let (_, lens_without) = parse_tail(&without_crc);
    for (w, wo) in lens_with.iter().zip(&lens_without) {
        assert_eq!(*w, wo + BLOCK_CRC_SIZE as u32);
    }

    let mut reader = ZfileReader::open(without_crc, true).await.unwrap();
    let mut out = vec![0u8; data.len()];
    assert_eq!(reader.pread(&mut out, 0).await.unwrap(), data.len());
    assert_eq!(out, data);
}

#[tokio::test]
async fn identify_distinguishes_valid_corrupt_and_foreign() {
    setup_tracing();
    let data = deterministic_bytes(2, 8 * KIB);
    let file = build_container(&data, &lz4_args(4 * KIB as u32, true)).await;
    assert_eq!(identify(&file).await.unwrap(), Identity::Valid);

    // flip a non-magic metadata byte: digest no longer matches
    file.corrupt_xor(40, 0x01);
    assert_eq!(identify(&file).await.unwrap(), Identity::Corrupt);

    let foreign = VirtualFile::new();
    let (res, _) = foreign
        .write_all_at(Bytes::from(vec![0x42u8; HT_SPACE]), 0)
        .await;
    res.unwrap();
    assert_eq!(identify(&foreign).await.unwrap(), Identity::NotZfile);

    let tiny = VirtualFile::new();
    let (res, _) = tiny.write_all_at(Bytes::from_static(b"short"), 0).await;
    res.unwrap();
    assert_eq!(identify(&tiny).await.unwrap(), Identity::NotZfile);
}

#[tokio::test]
async fn validate_scans_all_blocks() {
    setup_tracing();
    let data = deterministic_bytes(23, 128 * KIB);
    let file = build_container(&data, &lz4_args(16 * KIB as u32, true)).await;
    validate(file.clone()).await.unwrap();

    // corrupt a payload byte in the middle block: scan must fail
    let (_, lens) = parse_tail(&file);
    let block3 = HT_SPACE as u64 + lens[..3].iter().map(|&l| l as u64).sum::<u64>();
    file.corrupt_xor(block3 + 1, 0x80);
    let err = validate(file).await.unwrap_err();
    assert!(matches!(err, ZfileError::Checksum { .. }), "got {err}");

    // containers without checksums cannot be validated
    let unchecked = build_container(&data, &lz4_args(16 * KIB as u32, false)).await;
    let err = validate(unchecked).await.unwrap_err();
    assert!(matches!(err, ZfileError::Config(_)), "got {err}");
}

#[tokio::test]
async fn whole_file_compress_matches_streaming_builder() {
    setup_tracing();
    let data = deterministic_bytes(77, 500 * KIB + 11);
    let source = VirtualFile::new();
    let (res, _) = source
        .write_all_at(Bytes::copy_from_slice(&data), 0)
        .await;
    res.unwrap();

    let args = lz4_args(64 * KIB as u32, true);
    let dest = VirtualFile::new();
    assert_eq!(
        compress_file(&source, &dest, &args).await.unwrap(),
        data.len() as u64
    );

    let streamed = build_container(&data, &args).await;
    assert_eq!(dest.contents(), streamed.contents());
}

#[tokio::test]
async fn whole_file_decompress_restores_source() {
    setup_tracing();
    let data = deterministic_bytes(55, 200 * KIB + 999);
    let container = build_container(&data, &lz4_args(32 * KIB as u32, true)).await;

    let sink = VirtualFile::new();
    assert_eq!(
        decompress_file(container, &sink).await.unwrap(),
        data.len() as u64
    );
    assert_eq!(sink.contents(), data);
}

#[tokio::test]
async fn multi_worker_needs_two_workers() {
    setup_tracing();
    let args = lz4_args(4 * KIB as u32, true);
    let err = ZfileBuilderMp::create(VirtualFile::new(), &args)
        .await
        .unwrap_err();
    assert!(matches!(err, ZfileError::Config(_)), "got {err}");
}
