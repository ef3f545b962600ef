//! Error types for NCA format records

use thiserror::Error;

/// Result type for format operations
pub type Result<T> = std::result::Result<T, Error>;

/// NCA format error types
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// `BinRW` parsing/writing error
    #[error("Binary format error: {0}")]
    BinRw(#[from] binrw::Error),

    /// Invalid BKTR magic bytes
    #[error("Invalid BKTR magic: expected [42, 4b, 54, 52], got {0:02x?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported bucket tree version
    #[error("Unsupported BKTR version: {0}")]
    UnsupportedVersion(u32),

    /// RomFS header size field disagrees with the fixed header length
    #[error("Invalid RomFS header size: {0:#x}")]
    InvalidRomFsHeaderSize(u64),

    /// Entry offset does not land on a record inside its table
    #[error("Entry at {offset:#x} does not fit a table of {table_size:#x} bytes")]
    EntryOutOfBounds { offset: u64, table_size: u64 },

    /// Section-level read failure reported by a reader implementation
    #[error("Section read of {len:#x} bytes at {offset:#x} exceeds section size {section_size:#x}")]
    SectionReadOutOfBounds {
        offset: u64,
        len: u64,
        section_size: u64,
    },
}
