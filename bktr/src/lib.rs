//! BKTR (bucket-tree relocation) patched-image reader.
//!
//! A patched title ships as two content volumes: the base volume holds the
//! original RomFS, and the update volume holds a patch section containing
//! rewritten data plus two relocation tables. The indirect storage table maps
//! every logical offset of the patched image onto either the base RomFS or
//! the patch section; the AesCtrEx storage table attaches a counter-mode key
//! generation to each physical range of the patch section. This crate parses
//! both tables, normalizes them into searchable bucket trees, and resolves
//! logical reads into decrypted section reads against both volumes.
//!
//! Section access goes through [`nca_format::SectionReader`]; this crate
//! never touches ciphertext itself.

mod context;
mod error;
mod tree;

pub use context::BktrContext;
pub use error::{Error, Result};
pub use tree::{AesCtrExEntry, AesCtrExStorage, IndirectEntry, IndirectStorage, StorageSource};

/// On-disk stride of every bucket, header included.
pub const BUCKET_STRIDE: usize = 0x4000;

/// Bytes of each bucket taken by its header.
pub(crate) const BUCKET_HEADER_SIZE: usize = 0x10;

/// A block's top-level table can route to at most this many buckets.
pub(crate) const MAX_BUCKET_COUNT: usize = (BUCKET_STRIDE - BUCKET_HEADER_SIZE) / 8;
