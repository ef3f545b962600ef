//! RomFS header and entry-table records.
//!
//! Only the pieces a patched-image reader bootstraps are modeled: the fixed
//! header and individual records of the directory/file entry tables it points
//! at. Table-wide structure (hash buckets, sibling chains) belongs to the
//! filesystem walker, not this crate.

use std::io::{Cursor, Read, Seek};

use binrw::{BinRead, BinResult, BinWrite};

use crate::{Error, Result};

/// Size of the 64-bit RomFS header on disk.
pub const ROMFS_HEADER_SIZE: u64 = 0x50;

/// The fixed RomFS header: ten little-endian `u64` fields.
#[derive(Debug, Clone, Copy, Default, BinRead, BinWrite)]
#[br(little)]
#[bw(little)]
pub struct RomFsHeader {
    /// Self-described header length, [`ROMFS_HEADER_SIZE`] when valid.
    pub header_size: u64,
    pub dir_bucket_offset: u64,
    pub dir_bucket_size: u64,
    /// Directory entry table offset, relative to the image start.
    pub dir_entry_offset: u64,
    pub dir_entry_size: u64,
    pub file_bucket_offset: u64,
    pub file_bucket_size: u64,
    /// File entry table offset, relative to the image start.
    pub file_entry_offset: u64,
    pub file_entry_size: u64,
    /// Offset of the file data body, relative to the image start.
    pub body_offset: u64,
}

impl RomFsHeader {
    /// Parse a RomFS header at the reader's current position.
    pub fn parse<R: Read + Seek>(reader: &mut R) -> Result<Self> {
        Ok(Self::read_options(reader, binrw::Endian::Little, ())?)
    }

    /// Serialize the header back to its on-disk form.
    pub fn to_bytes(&self) -> Result<[u8; ROMFS_HEADER_SIZE as usize]> {
        let mut out = [0u8; ROMFS_HEADER_SIZE as usize];
        let mut cursor = Cursor::new(&mut out[..]);
        self.write_options(&mut cursor, binrw::Endian::Little, ())?;
        Ok(out)
    }

    /// Check the self-described header length.
    pub fn validate(&self) -> Result<()> {
        if self.header_size != ROMFS_HEADER_SIZE {
            return Err(Error::InvalidRomFsHeaderSize(self.header_size));
        }
        Ok(())
    }
}

/// One record of the file entry table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RomFsFileEntry {
    /// Table offset of the parent directory entry.
    pub parent_offset: u32,
    /// Table offset of the next sibling file entry.
    pub next_offset: u32,
    /// Data offset, relative to the body.
    pub offset: u64,
    /// Data size in bytes.
    pub size: u64,
    pub bucket_offset: u32,
    pub name: String,
}

impl BinRead for RomFsFileEntry {
    /// Size of the surrounding table, capping the name allocation.
    type Args<'a> = (u64,);

    fn read_options<R: Read + Seek>(
        reader: &mut R,
        endian: binrw::Endian,
        (table_size,): Self::Args<'_>,
    ) -> BinResult<Self> {
        let parent_offset = u32::read_options(reader, endian, ())?;
        let next_offset = u32::read_options(reader, endian, ())?;
        let offset = u64::read_options(reader, endian, ())?;
        let size = u64::read_options(reader, endian, ())?;
        let bucket_offset = u32::read_options(reader, endian, ())?;
        let name_length = u32::read_options(reader, endian, ())?;
        let name = read_name(reader, name_length, table_size)?;

        Ok(Self {
            parent_offset,
            next_offset,
            offset,
            size,
            bucket_offset,
            name,
        })
    }
}

impl RomFsFileEntry {
    /// Fixed part of the record, before the name bytes.
    pub const BASE_SIZE: u64 = 0x20;

    /// Parse the record at `entry_offset` within the file entry table.
    pub fn parse_at(table: &[u8], entry_offset: u64) -> Result<Self> {
        let mut cur = record_cursor(table, entry_offset, Self::BASE_SIZE)?;
        Ok(Self::read_options(
            &mut cur,
            binrw::Endian::Little,
            (table.len() as u64,),
        )?)
    }
}

/// One record of the directory entry table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RomFsDirectoryEntry {
    /// Table offset of the parent directory entry.
    pub parent_offset: u32,
    /// Table offset of the next sibling directory entry.
    pub next_offset: u32,
    /// Table offset of the first child directory entry.
    pub dir_offset: u32,
    /// Table offset of the first child file entry.
    pub file_offset: u32,
    pub bucket_offset: u32,
    pub name: String,
}

impl BinRead for RomFsDirectoryEntry {
    /// Size of the surrounding table, capping the name allocation.
    type Args<'a> = (u64,);

    fn read_options<R: Read + Seek>(
        reader: &mut R,
        endian: binrw::Endian,
        (table_size,): Self::Args<'_>,
    ) -> BinResult<Self> {
        let parent_offset = u32::read_options(reader, endian, ())?;
        let next_offset = u32::read_options(reader, endian, ())?;
        let dir_offset = u32::read_options(reader, endian, ())?;
        let file_offset = u32::read_options(reader, endian, ())?;
        let bucket_offset = u32::read_options(reader, endian, ())?;
        let name_length = u32::read_options(reader, endian, ())?;
        let name = read_name(reader, name_length, table_size)?;

        Ok(Self {
            parent_offset,
            next_offset,
            dir_offset,
            file_offset,
            bucket_offset,
            name,
        })
    }
}

impl RomFsDirectoryEntry {
    /// Fixed part of the record, before the name bytes.
    pub const BASE_SIZE: u64 = 0x18;

    /// Parse the record at `entry_offset` within the directory entry table.
    pub fn parse_at(table: &[u8], entry_offset: u64) -> Result<Self> {
        let mut cur = record_cursor(table, entry_offset, Self::BASE_SIZE)?;
        Ok(Self::read_options(
            &mut cur,
            binrw::Endian::Little,
            (table.len() as u64,),
        )?)
    }
}

fn record_cursor(table: &[u8], entry_offset: u64, base_size: u64) -> Result<Cursor<&[u8]>> {
    let table_size = table.len() as u64;
    if entry_offset
        .checked_add(base_size)
        .is_none_or(|end| end > table_size)
    {
        return Err(Error::EntryOutOfBounds {
            offset: entry_offset,
            table_size,
        });
    }

    let mut cur = Cursor::new(table);
    cur.set_position(entry_offset);
    Ok(cur)
}

fn read_name<R: Read + Seek>(reader: &mut R, name_length: u32, table_size: u64) -> BinResult<String> {
    let pos = reader.stream_position().unwrap_or(0);

    // A corrupt length field must not drive the allocation.
    if u64::from(name_length) > table_size {
        return Err(binrw::Error::Custom {
            pos,
            err: Box::new(Error::EntryOutOfBounds {
                offset: pos,
                table_size,
            }),
        });
    }

    let mut raw = vec![0u8; name_length as usize];
    reader.read_exact(&mut raw)?;
    String::from_utf8(raw).map_err(|e| binrw::Error::Custom {
        pos,
        err: Box::new(e),
    })
}
