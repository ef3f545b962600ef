//! The patched-image read context.
//!
//! [`BktrContext`] is built once from a base and an update section, owns the
//! two normalized relocation indexes plus the patched RomFS header and entry
//! tables, and is immutable afterwards. Every logical read funnels through
//! the physical resolver's split-and-dispatch: the indirect index decides
//! which volume serves a range, and for patch ranges the AesCtrEx index
//! decides which counter generation decrypts it.

use std::io::Cursor;

use tracing::{debug, error};

use nca_format::{
    ROMFS_HEADER_SIZE, RomFsDirectoryEntry, RomFsFileEntry, RomFsHeader, SectionReader,
    SectionType,
};

use crate::tree::{AesCtrExStorage, IndirectStorage, StorageSource};
use crate::{Error, Result};

/// Read-only view of a patched RomFS image composed from two volumes.
///
/// The borrowed section readers must outlive the context; the context itself
/// owns the relocation indexes and the RomFS tables. All read operations take
/// `&self`, so a context can serve concurrent readers as long as the
/// underlying [`SectionReader`]s tolerate concurrent calls.
impl std::fmt::Debug for BktrContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BktrContext")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("body_offset", &self.body_offset)
            .finish_non_exhaustive()
    }
}

pub struct BktrContext<'a> {
    /// Base RomFS section, absent when the base volume does not provide one.
    base: Option<&'a dyn SectionReader>,
    /// Patch section of the update volume.
    update: &'a dyn SectionReader,

    indirect: IndirectStorage,
    aes_ctr_ex: AesCtrExStorage,

    /// Start of the patched RomFS image within the logical section space.
    offset: u64,
    /// Size of the patched RomFS image.
    size: u64,
    /// Offset of the file data body, relative to the image start.
    body_offset: u64,

    header: RomFsHeader,
    dir_table: Vec<u8>,
    file_table: Vec<u8>,

    missing_base_romfs: bool,
}

impl<'a> BktrContext<'a> {
    /// Validate both volumes, load and normalize the relocation tables, and
    /// bootstrap the patched RomFS header and entry tables.
    ///
    /// Construction is transactional: any failure yields an error and no
    /// context.
    pub fn new(base: &'a dyn SectionReader, update: &'a dyn SectionReader) -> Result<Self> {
        let update_section = update.section();
        if !update_section.enabled || update_section.section_type != SectionType::PatchRomFs {
            return Err(Error::NotAPatchSection);
        }

        let base_volume = base.volume();
        let update_volume = update.volume();
        if base_volume.program_id != update_volume.program_id
            || base_volume.content_type != update_volume.content_type
            || base_volume.id_offset != update_volume.id_offset
        {
            return Err(Error::ContentMismatch);
        }
        if base_volume.title_version > update_volume.title_version {
            return Err(Error::TitleVersionRegression {
                base: base_volume.title_version,
                update: update_volume.title_version,
            });
        }

        let patch_info = update_section.patch_info.ok_or(Error::NotAPatchSection)?;
        patch_info.validate()?;

        // The two tables tile the section tail: indirect, then AesCtrEx,
        // ending exactly at the section end.
        if patch_info.indirect.end_offset() != patch_info.aes_ctr_ex.offset
            || patch_info.aes_ctr_ex.end_offset() != update_section.section_size
        {
            return Err(Error::BlockLayoutMismatch {
                indirect_end: patch_info.indirect.end_offset(),
                aes_ctr_ex_start: patch_info.aes_ctr_ex.offset,
                aes_ctr_ex_end: patch_info.aes_ctr_ex.end_offset(),
                section_size: update_section.section_size,
            });
        }

        let base_section = base.section();
        let missing_base_romfs =
            !base_section.enabled || base_section.section_type != SectionType::RomFs;
        let base = if missing_base_romfs {
            None
        } else {
            if base_section.has_sparse_layer {
                return Err(Error::SparseBaseLayer);
            }
            if base_section.patch_info.is_some() {
                return Err(Error::StackedPatch);
            }
            Some(base)
        };

        let mut indirect_raw = vec![0u8; patch_info.indirect.size as usize];
        update.read_at(&mut indirect_raw, patch_info.indirect.offset)?;
        let indirect = IndirectStorage::parse(&indirect_raw)?;

        let mut aes_ctr_ex_raw = vec![0u8; patch_info.aes_ctr_ex.size as usize];
        update.read_at(&mut aes_ctr_ex_raw, patch_info.aes_ctr_ex.offset)?;
        let aes_ctr_ex = AesCtrExStorage::parse(
            &aes_ctr_ex_raw,
            patch_info.indirect.offset,
            update_section.section_size,
            update_section.upper_iv_generation,
        )?;

        // The on-disk entries must cover everything up to their own tables.
        if aes_ctr_ex.physical_size() != patch_info.aes_ctr_ex.offset {
            return Err(Error::PhysicalSizeMismatch {
                expected: patch_info.aes_ctr_ex.offset,
                found: aes_ctr_ex.physical_size(),
            });
        }

        let (offset, size) = update.hash_target_properties()?;
        debug!(
            offset,
            size,
            missing_base_romfs,
            virtual_size = indirect.virtual_size(),
            "bootstrapping patched RomFS"
        );

        let mut ctx = Self {
            base,
            update,
            indirect,
            aes_ctr_ex,
            offset,
            size,
            body_offset: 0,
            header: RomFsHeader::default(),
            dir_table: Vec::new(),
            file_table: Vec::new(),
            missing_base_romfs,
        };

        let mut header_raw = [0u8; ROMFS_HEADER_SIZE as usize];
        ctx.physical_read(&mut header_raw, ctx.offset)?;
        let header = RomFsHeader::parse(&mut Cursor::new(&header_raw[..]))?;
        header.validate()?;

        ctx.dir_table =
            ctx.read_table(header.dir_entry_offset, header.dir_entry_size, "directory")?;
        ctx.file_table = ctx.read_table(header.file_entry_offset, header.file_entry_size, "file")?;

        ctx.body_offset = header.body_offset;
        ctx.header = header;
        Ok(ctx)
    }

    fn read_table(
        &self,
        table_offset: u64,
        table_size: u64,
        what: &'static str,
    ) -> Result<Vec<u8>> {
        if table_offset == 0
            || table_size == 0
            || table_offset
                .checked_add(table_size)
                .is_none_or(|end| end > self.size)
        {
            return Err(Error::InvalidRomFsTable(what));
        }

        let mut table = vec![0u8; table_size as usize];
        self.physical_read(&mut table, self.offset + table_offset)?;
        Ok(table)
    }

    /// Size of the patched RomFS image.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Start of the patched RomFS image within the logical section space.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Offset of the file data body, relative to the image start.
    pub fn body_offset(&self) -> u64 {
        self.body_offset
    }

    /// Whether reads that route to the base volume will fail.
    pub fn missing_base_romfs(&self) -> bool {
        self.missing_base_romfs
    }

    /// The patched RomFS header.
    pub fn header(&self) -> &RomFsHeader {
        &self.header
    }

    /// Raw directory entry table of the patched image.
    pub fn dir_table(&self) -> &[u8] {
        &self.dir_table
    }

    /// Raw file entry table of the patched image.
    pub fn file_table(&self) -> &[u8] {
        &self.file_table
    }

    /// Parse the file entry record at `table_offset`.
    pub fn file_entry_at(&self, table_offset: u64) -> Result<RomFsFileEntry> {
        Ok(RomFsFileEntry::parse_at(&self.file_table, table_offset)?)
    }

    /// Parse the directory entry record at `table_offset`.
    pub fn dir_entry_at(&self, table_offset: u64) -> Result<RomFsDirectoryEntry> {
        Ok(RomFsDirectoryEntry::parse_at(&self.dir_table, table_offset)?)
    }

    /// Fill `buf` with patched-image bytes starting at `offset`, relative to
    /// the image start.
    pub fn read_fs(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        if self.size == 0 {
            return Err(Error::InvalidArgument("context has no patched image"));
        }
        if buf.is_empty() {
            return Err(Error::InvalidArgument("empty read"));
        }
        let len = buf.len() as u64;
        if offset.checked_add(len).is_none_or(|end| end > self.size) {
            return Err(Error::InvalidArgument(
                "read past the end of the patched image",
            ));
        }

        self.physical_read(buf, self.offset + offset)
    }

    /// Fill `buf` with data of `entry`, starting `offset` bytes into the
    /// file.
    pub fn read_file(&self, entry: &RomFsFileEntry, buf: &mut [u8], offset: u64) -> Result<()> {
        self.check_file_entry(entry)?;
        let len = buf.len() as u64;
        if offset.checked_add(len).is_none_or(|end| end > entry.size) {
            return Err(Error::InvalidArgument("read past the end of the file"));
        }

        self.read_fs(buf, self.body_offset + entry.offset + offset)
    }

    /// Whether any byte of `entry` is served by the patch section rather
    /// than the base RomFS.
    pub fn is_file_updated(&self, entry: &RomFsFileEntry) -> Result<bool> {
        self.check_file_entry(entry)?;
        let start = self.offset + self.body_offset + entry.offset;
        self.indirect.range_touches_patch(start, start + entry.size)
    }

    fn check_file_entry(&self, entry: &RomFsFileEntry) -> Result<()> {
        if self.body_offset == 0 {
            return Err(Error::InvalidArgument("context has no file data body"));
        }
        if entry.size == 0 {
            return Err(Error::InvalidArgument("file entry is empty"));
        }
        if entry
            .offset
            .checked_add(entry.size)
            .is_none_or(|end| end > self.size)
        {
            return Err(Error::InvalidArgument(
                "file entry lies outside the patched image",
            ));
        }
        Ok(())
    }

    /// Resolve a logical read against the indirect index.
    ///
    /// A read contained in a single entry dispatches directly; one that
    /// crosses an entry boundary splits there and recurses, so every leaf
    /// read draws from a single source with a single decryption regime.
    fn physical_read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        if buf.is_empty() {
            return Err(Error::InvalidArgument("empty read"));
        }

        let (entry, next) = self.indirect.find(offset)?;
        let section_offset = offset - entry.virtual_offset + entry.physical_offset;
        let len = buf.len() as u64;

        if offset + len <= next.virtual_offset {
            match entry.source {
                StorageSource::Patch => self.aes_ctr_ex_read(buf, offset, section_offset),
                StorageSource::Base => match self.base {
                    Some(base) => Ok(base.read_at(buf, section_offset)?),
                    None => {
                        error!(
                            offset = section_offset,
                            len, "read routed to a base RomFS that is not present"
                        );
                        Err(Error::MissingBaseRomFs)
                    }
                },
            }
        } else {
            let head = (next.virtual_offset - offset) as usize;
            let (front, back) = buf.split_at_mut(head);
            self.physical_read(front, offset)?;
            self.physical_read(back, offset + head as u64)
        }
    }

    /// Read from the patch section at physical `section_offset`, decrypting
    /// with the generation the AesCtrEx index assigns to that range.
    ///
    /// A read crossing a generation boundary splits there but recurses
    /// through the physical resolver with the logical offset: a split may
    /// cross an indirect boundary as well, and only the logical view keeps
    /// both indexes consistent.
    fn aes_ctr_ex_read(&self, buf: &mut [u8], virtual_offset: u64, section_offset: u64) -> Result<()> {
        let (entry, next) = self.aes_ctr_ex.find(section_offset)?;
        let len = buf.len() as u64;

        if section_offset + len <= next.offset {
            Ok(self
                .update
                .read_at_with_generation(buf, section_offset, entry.generation)?)
        } else {
            let head = (next.offset - section_offset) as usize;
            let (front, back) = buf.split_at_mut(head);
            self.physical_read(front, virtual_offset)?;
            self.physical_read(back, virtual_offset + head as u64)
        }
    }
}
