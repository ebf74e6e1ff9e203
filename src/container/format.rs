//! On-disk record types of the container: the shared header/trailer record,
//! the persisted compression options, flags, magic numbers and checksum
//! helpers. All integers are little-endian and the layouts are packed; these
//! are part of the file format and shall never change.

use bytes::Bytes;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U32, U64};

use crate::base::{HexU32, ZfileError, ZfileResult};
use crate::codec::CompressAlgo;
use crate::fio::BackingFile;

/// Space a header or trailer record occupies on disk. Only the first
/// [`HT_RECORD_SIZE`] bytes are populated; the rest is zero-filled.
pub const HT_SPACE: usize = 512;

/// Size of the populated record prefix.
pub const HT_RECORD_SIZE: usize = size_of::<HeaderTrailer>();

/// Upper bound for `block_size`, and the size of the reader's read-ahead
/// buffer.
pub const MAX_READ_SIZE: usize = 1024 * 1024;

/// Default raw block size.
pub const DEFAULT_BLOCK_SIZE: u32 = 64 * 1024;

/// Per-block compression output headroom: a block's on-disk slot is
/// `block_size + COMPRESS_HEADROOM` bytes, covering codec expansion on
/// incompressible input plus the trailing CRC.
pub const COMPRESS_HEADROOM: usize = 512;

/// Bytes of the per-block checksum trailer when `verify` is enabled.
pub const BLOCK_CRC_SIZE: usize = 4;

/// First magic: the bytes `"ZFile\0\x01\0"`, an 8-byte little-endian word.
pub const MAGIC0: [u8; 8] = *b"ZFile\x00\x01\x00";

/// Second magic: a fixed UUID in its little-endian on-disk form.
pub const MAGIC1: [u8; 16] = [
    0x74, 0x75, 0x6a, 0x69, 0x2e, 0x79, 0x79, 0x66, 0x40, 0x41, 0x6c, 0x69, 0x62, 0x61, 0x62, 0x61,
];

/// Seed of the salted per-block CRC-32C.
pub const CRC32C_SALT_SEED: u32 = 100_007;

/// Salted CRC-32C used for per-block integrity.
#[inline]
pub fn crc32c_salted(payload: &[u8]) -> u32 {
    crc32c::crc32c_append(CRC32C_SALT_SEED, payload)
}

// -- record flags --

/// Set on the record at offset 0; clear on the trailer.
pub const FLAG_HEADER: u64 = 1 << 0;
/// Set on data containers (the only kind this crate writes).
pub const FLAG_DATA: u64 = 1 << 1;
/// Set once the trailer and index are fully written and consistent.
pub const FLAG_SEALED: u64 = 1 << 2;
/// Set on a trailer image copied back to offset 0 after finalization.
pub const FLAG_HEADER_OVERWRITE: u64 = 1 << 3;
/// Record and index digests are populated.
pub const FLAG_DIGEST: u64 = 1 << 4;
/// Reserved: compressed index.
pub const FLAG_INDEX_COMPRESSED: u64 = 1 << 5;

/// Persisted image of [`CompressOptions`], 24 bytes at record offset 72.
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RawCompressOptions {
    pub block_size: U32<LittleEndian>,
    pub algo: u8,
    pub level: i8,
    pub use_dict: u8,
    _pad0: u8,
    pub args: U32<LittleEndian>,
    pub dict_size: U32<LittleEndian>,
    pub verify: u8,
    _pad1: [u8; 7],
}

const _: () = assert!(size_of::<RawCompressOptions>() == 24);

/// Validated, in-memory compression options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressOptions {
    pub algo: CompressAlgo,
    /// Raw bytes per block; a power of two, at most [`MAX_READ_SIZE`].
    pub block_size: u32,
    /// Codec-specific quality knob.
    pub level: i8,
    /// Append a salted CRC-32C to every compressed block.
    pub verify: bool,
    /// Reserved; always zero today.
    pub dict_size: u32,
}

impl Default for CompressOptions {
    fn default() -> Self {
        Self {
            algo: CompressAlgo::Lz4,
            block_size: DEFAULT_BLOCK_SIZE,
            level: 0,
            verify: true,
            dict_size: 0,
        }
    }
}

impl CompressOptions {
    pub fn validate(&self) -> ZfileResult<()> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(ZfileError::Config("block_size must be a power of two"));
        }
        if self.block_size as usize > MAX_READ_SIZE {
            return Err(ZfileError::Config("block_size exceeds MAX_READ_SIZE"));
        }
        if self.dict_size != 0 {
            return Err(ZfileError::Config("dictionaries are not supported yet"));
        }
        Ok(())
    }

    pub(crate) fn to_raw(self) -> RawCompressOptions {
        RawCompressOptions {
            block_size: self.block_size.into(),
            algo: self.algo.into(),
            level: self.level,
            use_dict: 0,
            _pad0: 0,
            args: 0.into(),
            dict_size: self.dict_size.into(),
            verify: self.verify as u8,
            _pad1: [0; 7],
        }
    }

    pub(crate) fn from_raw(raw: &RawCompressOptions) -> ZfileResult<Self> {
        let algo = CompressAlgo::try_from(raw.algo)
            .map_err(|_| ZfileError::Config("unknown compression algorithm id"))?;
        let opt = Self {
            algo,
            block_size: raw.block_size.get(),
            level: raw.level,
            verify: raw.verify != 0,
            dict_size: raw.dict_size.get(),
        };
        opt.validate()?;
        Ok(opt)
    }

    /// Smallest believable on-disk block length; anything at or below this
    /// marks a corrupt index entry.
    pub(crate) fn min_block_len(&self) -> u32 {
        if self.verify {
            BLOCK_CRC_SIZE as u32
        } else {
            0
        }
    }
}

/// The record shared by the header and trailer positions.
///
/// 96 populated bytes, zero-filled to [`HT_SPACE`] on disk. `self_digest` is
/// the plain CRC-32C of the full 512-byte image with the digest field
/// itself zeroed.
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct HeaderTrailer {
    pub magic0: [u8; 8],
    pub magic1: [u8; 16],
    pub record_size: U32<LittleEndian>,
    pub self_digest: U32<LittleEndian>,
    pub flags: U64<LittleEndian>,
    /// Absolute byte offset of the block-length index.
    pub index_offset: U64<LittleEndian>,
    /// Number of index entries, not bytes.
    pub index_size: U64<LittleEndian>,
    pub original_file_size: U64<LittleEndian>,
    pub index_crc: U32<LittleEndian>,
    pub reserved: U32<LittleEndian>,
    pub opt: RawCompressOptions,
}

const _: () = assert!(size_of::<HeaderTrailer>() == 96);

/// Byte offset of `self_digest` within the record.
const DIGEST_OFFSET: usize = 28;

impl HeaderTrailer {
    pub fn new(opt: &CompressOptions) -> Self {
        Self {
            magic0: MAGIC0,
            magic1: MAGIC1,
            record_size: (HT_RECORD_SIZE as u32).into(),
            self_digest: 0.into(),
            flags: 0.into(),
            index_offset: 0.into(),
            index_size: 0.into(),
            original_file_size: 0.into(),
            index_crc: 0.into(),
            reserved: 0.into(),
            opt: opt.to_raw(),
        }
    }

    fn flag(&self, bit: u64) -> bool {
        self.flags.get() & bit != 0
    }

    fn set_flag(&mut self, bit: u64) {
        self.flags.set(self.flags.get() | bit);
    }

    fn clear_flag(&mut self, bit: u64) {
        self.flags.set(self.flags.get() & !bit);
    }

    pub fn is_header(&self) -> bool {
        self.flag(FLAG_HEADER)
    }

    pub fn is_trailer(&self) -> bool {
        !self.is_header()
    }

    pub fn is_data(&self) -> bool {
        self.flag(FLAG_DATA)
    }

    pub fn is_sealed(&self) -> bool {
        self.flag(FLAG_SEALED)
    }

    pub fn is_header_overwrite(&self) -> bool {
        self.flag(FLAG_HEADER_OVERWRITE)
    }

    pub fn digest_enabled(&self) -> bool {
        self.flag(FLAG_DIGEST)
    }

    pub fn set_header(&mut self) {
        self.set_flag(FLAG_HEADER);
    }

    pub fn set_trailer(&mut self) {
        self.clear_flag(FLAG_HEADER);
    }

    pub fn set_data(&mut self) {
        self.set_flag(FLAG_DATA);
    }

    pub fn set_sealed(&mut self) {
        self.set_flag(FLAG_SEALED);
    }

    pub fn clear_sealed(&mut self) {
        self.clear_flag(FLAG_SEALED);
    }

    pub fn set_header_overwrite(&mut self) {
        self.set_flag(FLAG_HEADER_OVERWRITE);
    }

    pub fn set_digest_enabled(&mut self) {
        self.set_flag(FLAG_DIGEST);
    }

    /// The full 512-byte on-disk image with the current `self_digest` value.
    pub fn record_bytes(&self) -> [u8; HT_SPACE] {
        let mut buf = [0u8; HT_SPACE];
        buf[..HT_RECORD_SIZE].copy_from_slice(self.as_bytes());
        buf
    }

    /// Recomputes `self_digest` over the zero-padded image and returns the
    /// sealed 512-byte record ready to hit the disk.
    pub fn seal_record(&mut self) -> [u8; HT_SPACE] {
        self.self_digest.set(0);
        let mut buf = self.record_bytes();
        let digest = crc32c::crc32c(&buf);
        self.self_digest.set(digest);
        buf[DIGEST_OFFSET..DIGEST_OFFSET + 4].copy_from_slice(&digest.to_le_bytes());
        buf
    }

    /// Parses and verifies a record image: magic numbers, populated record
    /// size, and (when present) the self digest. Flag semantics are left to
    /// the caller, since header and trailer positions expect different bits.
    pub fn decode(buf: &[u8]) -> ZfileResult<Self> {
        if buf.len() < HT_SPACE {
            return Err(ZfileError::Format("header/trailer record is truncated"));
        }
        let (ht, _rest) = Self::read_from_prefix(buf)
            .map_err(|_| ZfileError::Format("header/trailer record is truncated"))?;
        if ht.magic0 != MAGIC0 || ht.magic1 != MAGIC1 {
            return Err(ZfileError::Format("magic numbers do not match"));
        }
        if ht.record_size.get() != HT_RECORD_SIZE as u32 {
            return Err(ZfileError::Format("unexpected record size"));
        }
        if !ht.digest_enabled() {
            warn!("record digest not present; skipping self check");
            return Ok(ht);
        }
        let mut image = [0u8; HT_SPACE];
        image.copy_from_slice(&buf[..HT_SPACE]);
        image[DIGEST_OFFSET..DIGEST_OFFSET + 4].fill(0);
        let actual = crc32c::crc32c(&image);
        let expected = ht.self_digest.get();
        if actual != expected {
            return Err(ZfileError::Checksum { expected, actual });
        }
        Ok(ht)
    }
}

/// Stamps role flags on `ht`, recomputes its digest and writes the 512-byte
/// record at `pos`. Used for the initial header, the trailer, and the
/// optional trailer-over-header copy.
pub(crate) async fn write_record<F: BackingFile>(
    file: &F,
    ht: &mut HeaderTrailer,
    is_header: bool,
    is_sealed: bool,
    header_overwrite: bool,
    pos: u64,
) -> ZfileResult<()> {
    if is_header {
        ht.set_header();
    } else {
        ht.set_trailer();
    }
    if is_sealed {
        ht.set_sealed();
    } else {
        ht.clear_sealed();
    }
    ht.set_data();
    if header_overwrite {
        ht.set_header_overwrite();
    }
    ht.set_digest_enabled();

    let image = ht.seal_record();
    debug!(
        pos,
        is_header,
        is_sealed,
        digest = ?HexU32(ht.self_digest.get()),
        "writing header/trailer record"
    );
    let (res, _) = file.write_all_at(Bytes::copy_from_slice(&image), pos).await;
    res?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed_image(opt: &CompressOptions) -> ([u8; HT_SPACE], HeaderTrailer) {
        let mut ht = HeaderTrailer::new(opt);
        ht.set_header();
        ht.set_data();
        ht.set_digest_enabled();
        let image = ht.seal_record();
        (image, ht)
    }

    #[test]
    fn record_prefix_is_96_bytes() {
        assert_eq!(HT_RECORD_SIZE, 96);
        assert_eq!(size_of::<RawCompressOptions>(), 24);
    }

    #[test]
    fn record_roundtrip() {
        let opt = CompressOptions::default();
        let (image, ht) = sealed_image(&opt);

        let parsed = HeaderTrailer::decode(&image).unwrap();
        assert!(parsed.is_header());
        assert!(parsed.is_data());
        assert!(!parsed.is_sealed());
        assert_eq!(parsed.self_digest.get(), ht.self_digest.get());

        let popt = CompressOptions::from_raw(&parsed.opt).unwrap();
        assert_eq!(popt, opt);
    }

    #[test]
    fn record_is_zero_padded() {
        let (image, _) = sealed_image(&CompressOptions::default());
        assert!(image[HT_RECORD_SIZE..].iter().all(|&b| b == 0));
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let (mut image, _) = sealed_image(&CompressOptions::default());
        image[0] ^= 0xFF;
        assert!(matches!(
            HeaderTrailer::decode(&image),
            Err(ZfileError::Format(_))
        ));
    }

    #[test]
    fn decode_rejects_bad_record_size() {
        let opt = CompressOptions::default();
        let mut ht = HeaderTrailer::new(&opt);
        ht.record_size.set(100);
        ht.set_digest_enabled();
        let image = ht.seal_record();
        assert!(matches!(
            HeaderTrailer::decode(&image),
            Err(ZfileError::Format(_))
        ));
    }

    #[test]
    fn decode_rejects_flipped_byte() {
        let (mut image, _) = sealed_image(&CompressOptions::default());
        // inside index_offset, past the magics
        image[42] ^= 0x01;
        assert!(matches!(
            HeaderTrailer::decode(&image),
            Err(ZfileError::Checksum { .. })
        ));
    }

    #[test]
    fn trailer_role_flips_header_bit() {
        let opt = CompressOptions::default();
        let mut ht = HeaderTrailer::new(&opt);
        ht.set_header();
        assert!(ht.is_header());
        ht.set_trailer();
        assert!(ht.is_trailer());
        ht.set_sealed();
        assert!(ht.is_sealed());
        ht.clear_sealed();
        assert!(!ht.is_sealed());
    }

    #[test]
    fn options_validation() {
        let mut opt = CompressOptions::default();
        opt.validate().unwrap();

        opt.block_size = 0;
        assert!(matches!(opt.validate(), Err(ZfileError::Config(_))));

        opt.block_size = 3 * 1024;
        assert!(matches!(opt.validate(), Err(ZfileError::Config(_))));

        opt.block_size = 2 * MAX_READ_SIZE as u32;
        assert!(matches!(opt.validate(), Err(ZfileError::Config(_))));
    }

    #[test]
    fn raw_options_reject_unknown_algo() {
        let mut raw = CompressOptions::default().to_raw();
        raw.algo = 9;
        assert!(matches!(
            CompressOptions::from_raw(&raw),
            Err(ZfileError::Config(_))
        ));
    }

    #[test]
    fn salted_crc_differs_from_plain() {
        let payload = b"zfile block payload";
        assert_ne!(crc32c_salted(payload), crc32c::crc32c(payload));
        // salted CRC chains from the seed
        assert_eq!(
            crc32c_salted(payload),
            crc32c::crc32c_append(CRC32C_SALT_SEED, payload)
        );
    }
}
