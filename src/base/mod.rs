//! Base types shared across the crate: the error enum and small formatting
//! helpers used in log output.

use std::io;

mod utils;

pub use utils::*;

/// Crate-wide error type.
///
/// The variants map onto the failure classes of the container: backing-file
/// I/O, structural format violations, checksum mismatches, out-of-range
/// offsets, codec failures and invalid configuration.
#[derive(Debug, Display, Error, From)]
pub enum ZfileError {
    #[display("i/o error: {_0}")]
    Io(io::Error),

    #[from(skip)]
    #[display("format error: {_0}")]
    Format(#[error(not(source))] &'static str),

    #[from(skip)]
    #[display("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    Checksum { expected: u32, actual: u32 },

    #[from(skip)]
    #[display("range error: {_0}")]
    Range(#[error(not(source))] &'static str),

    #[from(skip)]
    #[display("codec error: {_0}")]
    Codec(#[error(not(source))] String),

    #[from(skip)]
    #[display("invalid configuration: {_0}")]
    Config(#[error(not(source))] &'static str),
}

pub type ZfileResult<T> = Result<T, ZfileError>;
