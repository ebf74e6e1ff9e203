use std::fmt;

/// Wraps a byte count for human-readable [`std::fmt::Debug`] output in log
/// fields, e.g. `1.5KiB` or `2GiB`. Exact multiples of a unit are printed
/// without a fractional part.
pub struct ByteSize(pub u64);

impl fmt::Debug for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [(u64, &str); 4] = [
            (1 << 40, "TiB"),
            (1 << 30, "GiB"),
            (1 << 20, "MiB"),
            (1 << 10, "KiB"),
        ];
        for (unit, suffix) in UNITS {
            if self.0 >= unit {
                let whole = self.0 / unit;
                let frac = (self.0 % unit) * 100 / unit;
                return if frac == 0 {
                    write!(f, "{}{}", whole, suffix)
                } else if frac % 10 == 0 {
                    write!(f, "{}.{}{}", whole, frac / 10, suffix)
                } else {
                    write!(f, "{}.{:02}{}", whole, frac, suffix)
                };
            }
        }
        write!(f, "{}B", self.0)
    }
}

/// Wraps a checksum for zero-padded hexadecimal [`std::fmt::Debug`] output,
/// e.g. `0x0001869f`.
pub struct HexU32(pub u32);

impl fmt::Debug for HexU32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Like [`HexU32`], for 64-bit values such as flag words and offsets.
pub struct HexU64(pub u64);

impl fmt::Debug for HexU64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_size_formatting() {
        assert_eq!(format!("{:?}", ByteSize(484)), "484B");
        assert_eq!(format!("{:?}", ByteSize(1536)), "1.5KiB");
        assert_eq!(format!("{:?}", ByteSize(64 * 1024)), "64KiB");
        assert_eq!(format!("{:?}", ByteSize(2 * 1024 * 1024 * 1024)), "2GiB");
    }

    #[test]
    fn hex_formatting() {
        assert_eq!(format!("{:?}", HexU32(100_007)), "0x000186a7");
        assert_eq!(format!("{:?}", HexU64(1)), "0x0000000000000001");
    }
}
