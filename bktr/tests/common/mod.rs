//! Shared fixtures: in-memory section readers and raw relocation blocks.
//!
//! `Fixture::build` starts from the bytes of the logical patched image plus
//! an indirect entry list, and materializes consistent base/update sections
//! from them: every virtual range is copied to whichever volume its entry
//! names, and the two relocation blocks are appended at the update section
//! tail exactly as an authoring tool would lay them out.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::cell::RefCell;

use nca_format::{
    BKTR_MAGIC, BKTR_VERSION, BucketInfo, BucketTreeHeader, ContentType, PatchInfo,
    Result as FormatResult, RomFsHeader, SectionInfo, SectionReader, SectionType, VolumeInfo,
};

pub const BUCKET_STRIDE: usize = 0x4000;
pub const BUCKET_HEADER_SIZE: usize = 0x10;
pub const INDIRECT_ENTRY_SIZE: usize = 0x14;
pub const AES_CTR_EX_ENTRY_SIZE: usize = 0xc;

pub const BASE_TITLE_VERSION: u32 = 0x10000;
pub const UPDATE_TITLE_VERSION: u32 = 0x20000;

/// Offset of the file data body within every fixture image.
pub const BODY_OFFSET: u64 = 0x1000;

fn write_u32(data: &mut [u8], at: usize, value: u32) {
    data[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_u64(data: &mut [u8], at: usize, value: u64) {
    data[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

/// Raw indirect storage block with one bucket per entry slice.
pub fn indirect_block(virtual_size: u64, buckets: &[&[(u64, u64, u32)]]) -> Vec<u8> {
    let mut data = vec![0u8; BUCKET_STRIDE * (1 + buckets.len())];
    let total: usize = buckets.iter().map(|b| b.len()).sum();
    write_u32(&mut data, 0, total as u32);
    write_u32(&mut data, 4, buckets.len() as u32);
    write_u64(&mut data, 8, virtual_size);

    for (i, bucket) in buckets.iter().enumerate() {
        write_u64(&mut data, 0x10 + i * 8, bucket[0].0);

        let base = BUCKET_STRIDE * (1 + i);
        write_u32(&mut data, base, i as u32);
        write_u32(&mut data, base + 4, bucket.len() as u32);
        let end = buckets.get(i + 1).map_or(virtual_size, |next| next[0].0);
        write_u64(&mut data, base + 8, end);

        for (j, &(virt, phys, source)) in bucket.iter().enumerate() {
            let at = base + BUCKET_HEADER_SIZE + j * INDIRECT_ENTRY_SIZE;
            write_u64(&mut data, at, virt);
            write_u64(&mut data, at + 8, phys);
            write_u32(&mut data, at + 16, source);
        }
    }
    data
}

/// Raw AesCtrEx storage block with one bucket per entry slice.
pub fn aes_ctr_ex_block(physical_size: u64, buckets: &[&[(u64, u32)]]) -> Vec<u8> {
    let mut data = vec![0u8; BUCKET_STRIDE * (1 + buckets.len())];
    let total: usize = buckets.iter().map(|b| b.len()).sum();
    write_u32(&mut data, 0, total as u32);
    write_u32(&mut data, 4, buckets.len() as u32);
    write_u64(&mut data, 8, physical_size);

    for (i, bucket) in buckets.iter().enumerate() {
        write_u64(&mut data, 0x10 + i * 8, bucket[0].0);

        let base = BUCKET_STRIDE * (1 + i);
        write_u32(&mut data, base, i as u32);
        write_u32(&mut data, base + 4, bucket.len() as u32);
        let end = buckets.get(i + 1).map_or(physical_size, |next| next[0].0);
        write_u64(&mut data, base + 8, end);

        for (j, &(offset, generation)) in bucket.iter().enumerate() {
            let at = base + BUCKET_HEADER_SIZE + j * AES_CTR_EX_ENTRY_SIZE;
            write_u64(&mut data, at, offset);
            write_u32(&mut data, at + 8, generation);
        }
    }
    data
}

pub fn volume(title_version: u32) -> VolumeInfo {
    VolumeInfo {
        program_id: 0x0100_0000_0000_1000,
        content_type: ContentType::Program,
        id_offset: 0,
        title_version,
    }
}

/// In-memory section: plaintext bytes plus a log of generation reads.
pub struct FakeSection {
    pub volume: VolumeInfo,
    pub info: SectionInfo,
    pub data: Vec<u8>,
    pub hash_target: (u64, u64),
    /// `(offset, len, generation)` per generation-parameterized read.
    pub generation_reads: RefCell<Vec<(u64, u64, u32)>>,
}

impl SectionReader for FakeSection {
    fn volume(&self) -> &VolumeInfo {
        &self.volume
    }

    fn section(&self) -> &SectionInfo {
        &self.info
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> FormatResult<()> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.data.len() {
            return Err(nca_format::Error::SectionReadOutOfBounds {
                offset,
                len: buf.len() as u64,
                section_size: self.data.len() as u64,
            });
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn read_at_with_generation(
        &self,
        buf: &mut [u8],
        offset: u64,
        generation: u32,
    ) -> FormatResult<()> {
        self.generation_reads
            .borrow_mut()
            .push((offset, buf.len() as u64, generation));
        self.read_at(buf, offset)
    }

    fn hash_target_properties(&self) -> FormatResult<(u64, u64)> {
        Ok(self.hash_target)
    }
}

/// Description of a two-volume fixture.
pub struct FixtureSpec {
    /// Total size of the logical patched space.
    pub virtual_size: u64,
    /// Where the relocation tables start within the update section. Patch
    /// entries must map below this.
    pub table_offset: u64,
    /// Indirect entries `(virtual_offset, physical_offset, source)`, sorted.
    pub indirect: Vec<(u64, u64, u32)>,
    /// AesCtrEx entries `(offset, generation)`, sorted, covering everything
    /// up to the table offset.
    pub aes: Vec<(u64, u32)>,
    pub upper_iv_generation: u32,
    /// Bytes of the logical patched image.
    pub image: Vec<u8>,
    /// Where the image sits in the logical space (the hash-target offset).
    pub image_offset: u64,
    /// Whether the base volume supplies a RomFS section.
    pub base_present: bool,
}

impl FixtureSpec {
    pub fn new(virtual_size: u64, image: Vec<u8>) -> Self {
        Self {
            virtual_size,
            table_offset: virtual_size,
            indirect: vec![(0, 0, 0)],
            aes: vec![(0, 1)],
            upper_iv_generation: 1,
            image,
            image_offset: 0,
            base_present: true,
        }
    }
}

pub struct Fixture {
    pub base: FakeSection,
    pub update: FakeSection,
}

impl Fixture {
    pub fn build(spec: &FixtureSpec) -> Self {
        let ind_block = indirect_block(spec.virtual_size, &[&spec.indirect]);
        let aes_offset = spec.table_offset + ind_block.len() as u64;
        let aes_block = aes_ctr_ex_block(aes_offset, &[&spec.aes]);
        let section_size = aes_offset + aes_block.len() as u64;

        let mut update_data = vec![0u8; section_size as usize];
        let mut base_data = vec![0u8; spec.virtual_size as usize];

        // Materialize each virtual range into the volume its entry names.
        let image_start = spec.image_offset;
        let image_end = spec.image_offset + spec.image.len() as u64;
        for (i, &(virt, phys, source)) in spec.indirect.iter().enumerate() {
            let virt_end = spec
                .indirect
                .get(i + 1)
                .map_or(spec.virtual_size, |next| next.0);
            let overlap_start = virt.max(image_start);
            let overlap_end = virt_end.min(image_end);
            if overlap_start >= overlap_end {
                continue;
            }

            let chunk = &spec.image
                [(overlap_start - image_start) as usize..(overlap_end - image_start) as usize];
            let at = (phys + (overlap_start - virt)) as usize;
            let dst = if source == 1 {
                &mut update_data
            } else {
                &mut base_data
            };
            dst[at..at + chunk.len()].copy_from_slice(chunk);
        }

        update_data[spec.table_offset as usize..][..ind_block.len()].copy_from_slice(&ind_block);
        update_data[aes_offset as usize..][..aes_block.len()].copy_from_slice(&aes_block);

        let patch_info = PatchInfo {
            indirect: BucketInfo {
                offset: spec.table_offset,
                size: ind_block.len() as u64,
                header: BucketTreeHeader {
                    magic: BKTR_MAGIC,
                    version: BKTR_VERSION,
                    entry_count: spec.indirect.len() as u32,
                    reserved: 0,
                },
            },
            aes_ctr_ex: BucketInfo {
                offset: aes_offset,
                size: aes_block.len() as u64,
                header: BucketTreeHeader {
                    magic: BKTR_MAGIC,
                    version: BKTR_VERSION,
                    entry_count: spec.aes.len() as u32,
                    reserved: 0,
                },
            },
        };

        let update = FakeSection {
            volume: volume(UPDATE_TITLE_VERSION),
            info: SectionInfo {
                enabled: true,
                section_type: SectionType::PatchRomFs,
                section_size,
                has_sparse_layer: false,
                upper_iv_generation: spec.upper_iv_generation,
                patch_info: Some(patch_info),
            },
            data: update_data,
            hash_target: (spec.image_offset, spec.image.len() as u64),
            generation_reads: RefCell::new(Vec::new()),
        };

        let base = FakeSection {
            volume: volume(BASE_TITLE_VERSION),
            info: SectionInfo {
                enabled: spec.base_present,
                section_type: SectionType::RomFs,
                section_size: base_data.len() as u64,
                has_sparse_layer: false,
                upper_iv_generation: 0,
                patch_info: None,
            },
            data: base_data,
            hash_target: (0, 0),
            generation_reads: RefCell::new(Vec::new()),
        };

        Self { base, update }
    }
}

fn file_entry_bytes(name: &str, offset: u64, size: u64) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&0u32.to_le_bytes());
    data.extend_from_slice(&u32::MAX.to_le_bytes());
    data.extend_from_slice(&offset.to_le_bytes());
    data.extend_from_slice(&size.to_le_bytes());
    data.extend_from_slice(&u32::MAX.to_le_bytes());
    data.extend_from_slice(&(name.len() as u32).to_le_bytes());
    data.extend_from_slice(name.as_bytes());
    while data.len() % 4 != 0 {
        data.push(0);
    }
    data
}

/// A minimal RomFS image: header, a root directory entry, the given files.
///
/// File data is a deterministic byte pattern; `(offset, size)` are relative
/// to [`BODY_OFFSET`]. Returns the image and the table offset of each file
/// entry.
pub fn romfs_image(image_size: u64, files: &[(&str, u64, u64)]) -> (Vec<u8>, Vec<u64>) {
    let mut image: Vec<u8> = (0..image_size).map(|i| (i % 251) as u8).collect();

    let mut dir_table = Vec::new();
    dir_table.extend_from_slice(&0u32.to_le_bytes());
    dir_table.extend_from_slice(&u32::MAX.to_le_bytes());
    dir_table.extend_from_slice(&u32::MAX.to_le_bytes());
    dir_table.extend_from_slice(&0u32.to_le_bytes());
    dir_table.extend_from_slice(&u32::MAX.to_le_bytes());
    dir_table.extend_from_slice(&0u32.to_le_bytes());

    let mut file_table = Vec::new();
    let mut entry_offsets = Vec::new();
    for &(name, offset, size) in files {
        entry_offsets.push(file_table.len() as u64);
        file_table.extend_from_slice(&file_entry_bytes(name, offset, size));
    }
    if file_table.is_empty() {
        // The engine rejects empty tables, so keep a placeholder entry.
        file_table.extend_from_slice(&file_entry_bytes("placeholder", 0, 0));
    }

    let header = RomFsHeader {
        header_size: 0x50,
        dir_bucket_offset: 0x50,
        dir_bucket_size: 0x10,
        dir_entry_offset: 0x60,
        dir_entry_size: dir_table.len() as u64,
        file_bucket_offset: 0x78,
        file_bucket_size: 0x8,
        file_entry_offset: 0x80,
        file_entry_size: file_table.len() as u64,
        body_offset: BODY_OFFSET,
    };

    image[..0x50].copy_from_slice(&header.to_bytes().unwrap());
    image[0x60..0x60 + dir_table.len()].copy_from_slice(&dir_table);
    image[0x80..0x80 + file_table.len()].copy_from_slice(&file_table);
    (image, entry_offsets)
}
