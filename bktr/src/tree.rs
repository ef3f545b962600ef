//! Searchable bucket trees built from the raw relocation table blobs.
//!
//! On disk a storage block is a 0x4000-byte header (entry count, bucket
//! count, total key space, then a top-level key table) followed by
//! `bucket_count` buckets of 0x4000 bytes each, entries packed after a small
//! bucket header. Parsing turns each bucket into an owned entry vector and
//! appends sentinel entries so that a "next entry" is always present: the
//! sentinel of every interior bucket is a copy of the following bucket's
//! first entry, and the last bucket is terminated by the storage-specific
//! tail entries. Lookups never mutate.

use std::io::{Cursor, Read, Seek};

use binrw::{BinRead, BinResult};
use tracing::warn;

use crate::{BUCKET_HEADER_SIZE, BUCKET_STRIDE, Error, MAX_BUCKET_COUNT, Result};

/// Which volume a relocated range reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageSource {
    /// The original title's RomFS section.
    Base,
    /// The update volume's patch section.
    Patch,
}

impl StorageSource {
    /// Map the on-disk source index.
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Base),
            1 => Some(Self::Patch),
            _ => None,
        }
    }
}

/// Indirect storage entry: maps a logical range onto a source volume.
///
/// A logical byte at offset `v` inside this entry lives in `source` at
/// `physical_offset + (v - virtual_offset)`.
#[derive(Debug, Clone, Copy)]
pub struct IndirectEntry {
    pub virtual_offset: u64,
    pub physical_offset: u64,
    pub source: StorageSource,
}

/// AesCtrEx storage entry: the counter generation for every patch-section
/// byte from `offset` up to the next entry.
#[derive(Debug, Clone, Copy, BinRead)]
#[br(little)]
pub struct AesCtrExEntry {
    pub offset: u64,
    pub generation: u32,
}

impl BinRead for IndirectEntry {
    type Args<'a> = ();

    fn read_options<R: Read + Seek>(
        reader: &mut R,
        endian: binrw::Endian,
        _args: Self::Args<'_>,
    ) -> BinResult<Self> {
        let virtual_offset = u64::read_options(reader, endian, ())?;
        let physical_offset = u64::read_options(reader, endian, ())?;
        let raw = u32::read_options(reader, endian, ())?;
        let source = StorageSource::from_raw(raw).ok_or_else(|| binrw::Error::Custom {
            pos: reader.stream_position().unwrap_or(0),
            err: Box::new(Error::UnknownStorageSource(raw)),
        })?;

        Ok(Self {
            virtual_offset,
            physical_offset,
            source,
        })
    }
}

pub(crate) trait TreeEntry: Copy + std::fmt::Debug + for<'a> BinRead<Args<'a> = ()> {
    /// Packed size of the entry on disk.
    const SIZE: usize;

    fn key(&self) -> u64;
}

impl TreeEntry for IndirectEntry {
    const SIZE: usize = 0x14;

    fn key(&self) -> u64 {
        self.virtual_offset
    }
}

impl TreeEntry for AesCtrExEntry {
    const SIZE: usize = 0xc;

    fn key(&self) -> u64 {
        self.offset
    }
}

/// Fixed part of the block header, before the top-level key table.
#[derive(Debug, BinRead)]
#[br(little)]
struct BlockHeader {
    _entry_count_total: u32,
    bucket_count: u32,
    end_key: u64,
}

/// Header of a single 0x4000-byte bucket.
#[derive(Debug, BinRead)]
#[br(little)]
struct BucketHeader {
    _index: u32,
    entry_count: u32,
    _end_offset: u64,
}

#[derive(Debug)]
struct Bucket<E> {
    /// Number of real entries; anything past this index is a sentinel.
    entry_count: usize,
    entries: Vec<E>,
}

#[derive(Debug)]
struct BucketTree<E> {
    /// One past the last key served by the block: the virtual size for
    /// indirect storage, the physical size for AesCtrEx storage.
    end_key: u64,
    /// First key of each bucket; index 0 is not consulted.
    top_keys: Vec<u64>,
    buckets: Vec<Bucket<E>>,
}

impl<E: TreeEntry> BucketTree<E> {
    fn parse(data: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(data);
        let header = BlockHeader::read_options(&mut cur, binrw::Endian::Little, ())?;
        let bucket_count = header.bucket_count as usize;
        let end_key = header.end_key;

        if bucket_count == 0 || bucket_count > MAX_BUCKET_COUNT {
            return Err(Error::InvalidBucketCount {
                count: bucket_count,
                limit: MAX_BUCKET_COUNT,
            });
        }

        let expected = BUCKET_STRIDE * (1 + bucket_count);
        if data.len() < expected {
            return Err(Error::TruncatedBlock {
                expected,
                actual: data.len(),
            });
        }

        let mut top_keys = Vec::with_capacity(bucket_count);
        for _ in 0..bucket_count {
            top_keys.push(u64::read_options(&mut cur, binrw::Endian::Little, ())?);
        }

        let max_entries = (BUCKET_STRIDE - BUCKET_HEADER_SIZE) / E::SIZE;
        let mut buckets = Vec::with_capacity(bucket_count);
        for i in 0..bucket_count {
            cur.set_position(((i + 1) * BUCKET_STRIDE) as u64);
            let bucket_header = BucketHeader::read_options(&mut cur, binrw::Endian::Little, ())?;
            let entry_count = bucket_header.entry_count as usize;

            if entry_count == 0 || entry_count > max_entries {
                return Err(Error::InvalidEntryCount {
                    bucket: i,
                    count: entry_count,
                    limit: max_entries,
                });
            }

            // Room for the sentinels installed by the seal step.
            let mut entries = Vec::with_capacity(entry_count + 2);
            for _ in 0..entry_count {
                entries.push(E::read_options(&mut cur, binrw::Endian::Little, ())?);
            }
            buckets.push(Bucket {
                entry_count,
                entries,
            });
        }

        Ok(Self {
            end_key,
            top_keys,
            buckets,
        })
    }

    /// Append to every interior bucket a copy of the following bucket's
    /// first entry, so "next entry" lookups never leave the bucket.
    fn seal_interior(&mut self) {
        for i in 0..self.buckets.len().saturating_sub(1) {
            let sentinel = self.buckets[i + 1].entries[0];
            self.buckets[i].entries.push(sentinel);
        }
    }

    /// Append a terminating entry to the last bucket.
    fn push_tail(&mut self, entry: E) {
        if let Some(last) = self.buckets.last_mut() {
            last.entries.push(entry);
        }
    }

    /// Locate the entry serving `key`, as (bucket index, entry index).
    fn find(&self, key: u64) -> Result<(usize, usize)> {
        if key >= self.end_key {
            return Err(Error::LookupOutOfRange {
                offset: key,
                end: self.end_key,
            });
        }

        // Top-level routing: count the bucket keys at or below the target.
        let mut bucket_num = 0;
        for &top in &self.top_keys[1..] {
            if top <= key {
                bucket_num += 1;
            }
        }

        let bucket = &self.buckets[bucket_num];
        match Self::search_bucket(bucket, key) {
            Some(idx) => Ok((bucket_num, idx)),
            None => {
                warn!(offset = key, bucket = bucket_num, "bucket tree search miss");
                Err(Error::LookupFailed { offset: key })
            }
        }
    }

    /// Binary search over the real entries; sentinels stay outside the
    /// window.
    fn search_bucket(bucket: &Bucket<E>, key: u64) -> Option<usize> {
        if bucket.entry_count == 1 {
            return Some(0);
        }

        let mut low = 0usize;
        let mut high = bucket.entry_count - 1;
        while low <= high {
            let mid = (low + high) / 2;
            if bucket.entries[mid].key() > key {
                high = mid.checked_sub(1)?;
            } else if mid == bucket.entry_count - 1 || bucket.entries[mid + 1].key() > key {
                return Some(mid);
            } else {
                low = mid + 1;
            }
        }
        None
    }

    /// The located entry together with its successor. The successor index is
    /// always valid once the tree is sealed.
    fn entry_pair(&self, bucket: usize, idx: usize) -> (&E, &E) {
        let b = &self.buckets[bucket];
        (&b.entries[idx], &b.entries[idx + 1])
    }

    /// Real entries from the given position onward, crossing buckets and
    /// skipping sentinels.
    fn entries_from(&self, bucket: usize, idx: usize) -> impl Iterator<Item = &E> {
        self.buckets[bucket..]
            .iter()
            .enumerate()
            .flat_map(move |(i, b)| {
                let start = if i == 0 { idx } else { 0 };
                b.entries[start..b.entry_count].iter()
            })
    }
}

/// The indirect storage index: logical patched-image offsets to
/// `(source, physical offset)`.
#[derive(Debug)]
pub struct IndirectStorage {
    tree: BucketTree<IndirectEntry>,
}

impl IndirectStorage {
    /// Parse a raw indirect storage block and install the bucket sentinels.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut tree = BucketTree::parse(data)?;
        tree.seal_interior();
        tree.push_tail(IndirectEntry {
            virtual_offset: tree.end_key,
            physical_offset: 0,
            source: StorageSource::Base,
        });
        Ok(Self { tree })
    }

    /// Total size of the logical patched image.
    pub fn virtual_size(&self) -> u64 {
        self.tree.end_key
    }

    /// The entry serving `offset`, with its successor.
    pub fn find(&self, offset: u64) -> Result<(&IndirectEntry, &IndirectEntry)> {
        let (bucket, idx) = self.tree.find(offset)?;
        Ok(self.tree.entry_pair(bucket, idx))
    }

    /// Whether any entry overlapping `[start, end)` relocates into the patch
    /// section.
    pub fn range_touches_patch(&self, start: u64, end: u64) -> Result<bool> {
        let (bucket, idx) = self.tree.find(start)?;
        Ok(self
            .tree
            .entries_from(bucket, idx)
            .take_while(|e| e.virtual_offset < end)
            .any(|e| e.source == StorageSource::Patch))
    }
}

/// The AesCtrEx storage index: physical patch-section offsets to counter
/// generations.
#[derive(Debug)]
pub struct AesCtrExStorage {
    tree: BucketTree<AesCtrExEntry>,
}

impl AesCtrExStorage {
    /// Parse a raw AesCtrEx storage block and install the bucket sentinels.
    ///
    /// `table_offset` is where the relocation tables begin within the patch
    /// section; bytes from there on are served by the trailing sentinels
    /// (`table_offset` with the section's upper-IV generation, then
    /// `section_size` as the terminator) rather than by on-disk entries.
    pub fn parse(
        data: &[u8],
        table_offset: u64,
        section_size: u64,
        upper_iv_generation: u32,
    ) -> Result<Self> {
        let mut tree = BucketTree::parse(data)?;
        tree.seal_interior();
        tree.push_tail(AesCtrExEntry {
            offset: table_offset,
            generation: upper_iv_generation,
        });
        tree.push_tail(AesCtrExEntry {
            offset: section_size,
            generation: 0,
        });
        Ok(Self { tree })
    }

    /// Physical range covered by the on-disk entries.
    pub fn physical_size(&self) -> u64 {
        self.tree.end_key
    }

    /// The entry serving physical `offset`, with its successor.
    pub fn find(&self, offset: u64) -> Result<(&AesCtrExEntry, &AesCtrExEntry)> {
        if offset >= self.tree.end_key {
            return Err(Error::LookupOutOfRange {
                offset,
                end: self.tree.end_key,
            });
        }

        // Reads into the relocation-table region resolve to the first
        // trailing sentinel.
        let last = self
            .tree
            .buckets
            .last()
            .ok_or(Error::LookupFailed { offset })?;
        let first_sentinel = &last.entries[last.entry_count];
        if offset >= first_sentinel.offset {
            return Ok((first_sentinel, &last.entries[last.entry_count + 1]));
        }

        let (bucket, idx) = self.tree.find(offset)?;
        Ok(self.tree.entry_pair(bucket, idx))
    }
}
