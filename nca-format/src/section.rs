//! Volume and section metadata, and the section reader seam.
//!
//! A patch section stores two relocation tables at its tail, described by a
//! [`PatchInfo`] record in the section header. Everything that actually
//! touches ciphertext is hidden behind [`SectionReader`].

use std::io::{Read, Seek};

use binrw::{BinRead, BinWrite};
use tracing::trace;

use crate::{Error, Result};

/// Magic bytes carried by both bucket tree headers.
pub const BKTR_MAGIC: [u8; 4] = *b"BKTR";

/// The only bucket tree version this crate understands.
pub const BKTR_VERSION: u32 = 1;

/// Content kind a volume was authored as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Program,
    Meta,
    Control,
    Manual,
    Data,
    PublicData,
}

/// Kind of filesystem a section carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionType {
    /// PFS0 partition filesystem.
    PartitionFs,
    /// Plain read-only filesystem.
    RomFs,
    /// RomFS delta: rewritten data plus the relocation tables that stitch it
    /// together with a base volume.
    PatchRomFs,
}

/// Identity of the volume a section belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeInfo {
    pub program_id: u64,
    pub content_type: ContentType,
    pub id_offset: u8,
    pub title_version: u32,
}

/// Header common to both bucket tree descriptors.
#[derive(Debug, Clone, Copy, BinRead, BinWrite)]
#[br(little)]
#[bw(little)]
pub struct BucketTreeHeader {
    /// Magic bytes, `"BKTR"` when valid.
    #[br(assert(magic == BKTR_MAGIC, "invalid BKTR magic"))]
    pub magic: [u8; 4],
    /// Version marker, [`BKTR_VERSION`] when valid.
    pub version: u32,
    /// Total number of entries stored across the table's buckets.
    pub entry_count: u32,
    /// Reserved word padding the record out to 0x10 bytes.
    pub reserved: u32,
}

impl BucketTreeHeader {
    /// Size of the header on disk, including the reserved word.
    pub const SIZE: usize = 0x10;

    /// Parse a bucket tree header at the reader's current position.
    pub fn parse<R: Read + Seek>(reader: &mut R) -> Result<Self> {
        Ok(Self::read_options(reader, binrw::Endian::Little, ())?)
    }

    /// Check the magic word and version marker.
    pub fn validate(&self) -> Result<()> {
        if self.magic != BKTR_MAGIC {
            return Err(Error::InvalidMagic(self.magic));
        }
        if self.version != BKTR_VERSION {
            return Err(Error::UnsupportedVersion(self.version));
        }
        Ok(())
    }
}

/// Placement of one relocation table inside the patch section.
#[derive(Debug, Clone, Copy, BinRead, BinWrite)]
#[br(little)]
#[bw(little)]
pub struct BucketInfo {
    /// Table offset within the section.
    pub offset: u64,
    /// Table size in bytes.
    pub size: u64,
    pub header: BucketTreeHeader,
}

impl BucketInfo {
    /// Size of the record on disk.
    pub const SIZE: usize = 0x10 + BucketTreeHeader::SIZE;

    /// Parse a bucket info record at the reader's current position.
    pub fn parse<R: Read + Seek>(reader: &mut R) -> Result<Self> {
        Ok(Self::read_options(reader, binrw::Endian::Little, ())?)
    }

    /// End of the table region, one past its last byte.
    pub fn end_offset(&self) -> u64 {
        self.offset + self.size
    }
}

/// Patch-info record from an update section header: the two relocation
/// tables stored back to back at the tail of the section.
#[derive(Debug, Clone, Copy, BinRead, BinWrite)]
#[br(little)]
#[bw(little)]
pub struct PatchInfo {
    /// Indirect storage table: logical offset to source + physical offset.
    pub indirect: BucketInfo,
    /// AesCtrEx storage table: physical offset to counter generation.
    pub aes_ctr_ex: BucketInfo,
}

impl PatchInfo {
    /// Size of the record on disk.
    pub const SIZE: usize = BucketInfo::SIZE * 2;

    /// Parse a patch info record at the reader's current position.
    pub fn parse<R: Read + Seek>(reader: &mut R) -> Result<Self> {
        let info = Self::read_options(reader, binrw::Endian::Little, ())?;
        trace!(
            indirect_offset = info.indirect.offset,
            indirect_size = info.indirect.size,
            aes_ctr_ex_offset = info.aes_ctr_ex.offset,
            aes_ctr_ex_size = info.aes_ctr_ex.size,
            "parsed patch info"
        );
        Ok(info)
    }

    /// Validate both table headers.
    pub fn validate(&self) -> Result<()> {
        self.indirect.header.validate()?;
        self.aes_ctr_ex.header.validate()
    }
}

/// Metadata of a single section within a volume.
#[derive(Debug, Clone, Copy)]
pub struct SectionInfo {
    /// Whether the section is present and decryptable at all.
    pub enabled: bool,
    pub section_type: SectionType,
    /// Size of the section in bytes.
    pub section_size: u64,
    /// A sparse overlay rewrites the section's physical layout; readers that
    /// compose sections must know about it.
    pub has_sparse_layer: bool,
    /// Counter generation of the section's upper IV.
    pub upper_iv_generation: u32,
    /// Relocation tables, present on patch sections only.
    pub patch_info: Option<PatchInfo>,
}

/// Decrypted access to one section of a volume.
///
/// Implementations sit on whatever transport and cipher plumbing the
/// surrounding application uses; this crate only consumes byte ranges.
/// Reads are positional and stateless between calls, so a shared reference
/// is enough for concurrent readers.
pub trait SectionReader {
    /// Identity of the owning volume.
    fn volume(&self) -> &VolumeInfo;

    /// Metadata of this section.
    fn section(&self) -> &SectionInfo;

    /// Read and decrypt `buf.len()` bytes at `offset` within the section.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()>;

    /// Like [`read_at`](Self::read_at), but derives the counter-mode IV from
    /// the supplied generation instead of the section default.
    fn read_at_with_generation(&self, buf: &mut [u8], offset: u64, generation: u32) -> Result<()>;

    /// Offset and size of the hash-target layer: the region holding the
    /// logical filesystem image this section describes.
    fn hash_target_properties(&self) -> Result<(u64, u64)>;
}
