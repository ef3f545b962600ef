//! Error types for the relocation engine

use thiserror::Error;

/// Result type for BKTR operations
pub type Result<T> = std::result::Result<T, Error>;

/// BKTR error types
#[derive(Error, Debug)]
pub enum Error {
    /// Caller-supplied handle or range is unusable
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// `BinRW` parsing error while decoding a storage block
    #[error("Binary format error: {0}")]
    BinRw(#[from] binrw::Error),

    /// Format-level failure, including collaborator section reads
    #[error("Format error: {0}")]
    Format(#[from] nca_format::Error),

    /// The update section does not carry a patch RomFS
    #[error("Update section is not a patch RomFS section")]
    NotAPatchSection,

    /// Base and update volumes disagree on program id, content type or
    /// id offset
    #[error("Base and update volumes do not describe the same content")]
    ContentMismatch,

    /// The update is older than the base it claims to patch
    #[error("Update title version {update} is older than base title version {base}")]
    TitleVersionRegression { base: u32, update: u32 },

    /// The two relocation tables do not tile the section tail
    #[error(
        "Relocation tables are laid out inconsistently: indirect ends at {indirect_end:#x}, \
         AesCtrEx spans {aes_ctr_ex_start:#x}..{aes_ctr_ex_end:#x}, section size {section_size:#x}"
    )]
    BlockLayoutMismatch {
        indirect_end: u64,
        aes_ctr_ex_start: u64,
        aes_ctr_ex_end: u64,
        section_size: u64,
    },

    /// Sparse base layers cannot be composed with a patch
    #[error("Base RomFS carries a sparse layer; composing it with a patch is unsupported")]
    SparseBaseLayer,

    /// The base section carries patch tables of its own
    #[error("Base section carries its own patch tables; stacked patches are unsupported")]
    StackedPatch,

    /// Block header declares an impossible bucket count
    #[error("Block declares {count} buckets (limit {limit})")]
    InvalidBucketCount { count: usize, limit: usize },

    /// Bucket header declares an impossible entry count
    #[error("Bucket {bucket} declares {count} entries (limit {limit})")]
    InvalidEntryCount {
        bucket: usize,
        count: usize,
        limit: usize,
    },

    /// Storage block blob is shorter than its header promises
    #[error("Storage block is truncated: expected {expected:#x} bytes, got {actual:#x}")]
    TruncatedBlock { expected: usize, actual: usize },

    /// Indirect entry names a source that is neither base nor patch
    #[error("Unknown storage source {0}")]
    UnknownStorageSource(u32),

    /// Offset falls outside the storage's key space
    #[error("Offset {offset:#x} is outside the storage range (size {end:#x})")]
    LookupOutOfRange { offset: u64, end: u64 },

    /// The bucket tree is corrupt: no entry serves the offset
    #[error("No bucket tree entry serves offset {offset:#x}")]
    LookupFailed { offset: u64 },

    /// AesCtrEx block covers a different physical range than its placement
    /// implies
    #[error("AesCtrEx block physical size {found:#x} does not match the table offset {expected:#x}")]
    PhysicalSizeMismatch { expected: u64, found: u64 },

    /// A read routed to the base volume, but no base RomFS was configured
    #[error("Read routes to the base volume, but no base RomFS is available")]
    MissingBaseRomFs,

    /// The patched RomFS header points at a missing or empty table
    #[error("Invalid patched RomFS {0} table")]
    InvalidRomFsTable(&'static str),
}
