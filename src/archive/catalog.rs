//! The catalog of archived classes.
//!
//! The catalog lives in the ro region: a count, a table of fixed-size records, the class
//! names, and the metadata blobs. The mc region holds one trampoline stub per class with
//! the absolute address of its metadata, which is only correct when the regions are mapped
//! where they were laid out. The md region holds the [`SerializedRoot`] that locates both.
//!
//! Everything in here is little-endian, like the header.

use crate::classloader::LoaderKind;
use crate::error::{ArchiveError, Result};
use crate::util::conversions::raw_align_up;
use crate::util::{Address, MemRange};
use byteorder::{ByteOrder, LittleEndian};

/// The entry point into the archived metadata, stored in the md region.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SerializedRoot {
    /// Offset of the catalog in the ro region.
    pub catalog_offset: u64,
    pub catalog_size: u64,
    pub class_count: u64,
    /// Offset of the stub table in the mc region.
    pub stub_table_offset: u64,
}

impl SerializedRoot {
    pub const SIZE: usize = 32;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::SIZE];
        LittleEndian::write_u64_into(
            &[
                self.catalog_offset,
                self.catalog_size,
                self.class_count,
                self.stub_table_offset,
            ],
            &mut buf,
        );
        buf
    }

    pub fn read(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(ArchiveError::CorruptedData("serialized root out of range"));
        }
        let mut words = [0u64; 4];
        LittleEndian::read_u64_into(&bytes[..Self::SIZE], &mut words);
        Ok(SerializedRoot {
            catalog_offset: words[0],
            catalog_size: words[1],
            class_count: words[2],
            stub_table_offset: words[3],
        })
    }
}

/// One fixed-size entry of the record table.
///
/// ```text
///  0: loader (u8), 3 bytes padding
///  4: path_index (i32)
///  8: name_offset (u32)
/// 12: name_len (u32)
/// 16: metadata_offset (u64)
/// 24: metadata_len (u64)
/// ```
#[derive(Copy, Clone, Debug, Default)]
struct CatalogRecord {
    loader: u8,
    path_index: i32,
    name_offset: u32,
    name_len: u32,
    metadata_offset: u64,
    metadata_len: u64,
}

impl CatalogRecord {
    fn write(&self, buf: &mut [u8]) {
        buf[0] = self.loader;
        buf[1..4].fill(0);
        LittleEndian::write_i32(&mut buf[4..8], self.path_index);
        LittleEndian::write_u32(&mut buf[8..12], self.name_offset);
        LittleEndian::write_u32(&mut buf[12..16], self.name_len);
        LittleEndian::write_u64(&mut buf[16..24], self.metadata_offset);
        LittleEndian::write_u64(&mut buf[24..32], self.metadata_len);
    }

    fn read(buf: &[u8]) -> Self {
        CatalogRecord {
            loader: buf[0],
            path_index: LittleEndian::read_i32(&buf[4..8]),
            name_offset: LittleEndian::read_u32(&buf[8..12]),
            name_len: LittleEndian::read_u32(&buf[12..16]),
            metadata_offset: LittleEndian::read_u64(&buf[16..24]),
            metadata_len: LittleEndian::read_u64(&buf[24..32]),
        }
    }
}

const RECORD_SIZE: usize = 32;
const CATALOG_HEADER_SIZE: usize = 8;
/// Size of one trampoline stub: metadata address and length.
pub const STUB_SIZE: usize = 16;

/// A class as handed to the dumper.
#[derive(Clone, Debug)]
pub struct ArchivedClass<'a> {
    pub name: &'a str,
    pub loader: LoaderKind,
    pub path_index: i32,
    pub metadata: &'a [u8],
}

/// A class as found in a mapped archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatalogEntry {
    pub name: String,
    pub loader: LoaderKind,
    pub path_index: i32,
    /// The class metadata inside the mapped ro region.
    pub metadata: MemRange,
    /// The trampoline stub of the class inside the mapped mc region.
    pub stub: Address,
}

/// Serialize `classes` into the contents of the ro region.
pub fn serialize_catalog(classes: &[ArchivedClass]) -> Vec<u8> {
    let strings_start = CATALOG_HEADER_SIZE + classes.len() * RECORD_SIZE;
    let names_size: usize = classes.iter().map(|c| c.name.len()).sum();
    let mut blob_cursor = raw_align_up(strings_start + names_size, 8);
    let mut name_cursor = strings_start;

    let mut records = Vec::with_capacity(classes.len());
    for class in classes {
        records.push(CatalogRecord {
            loader: class.loader as u8,
            path_index: class.path_index,
            name_offset: name_cursor as u32,
            name_len: class.name.len() as u32,
            metadata_offset: blob_cursor as u64,
            metadata_len: class.metadata.len() as u64,
        });
        name_cursor += class.name.len();
        blob_cursor = raw_align_up(blob_cursor + class.metadata.len(), 8);
    }

    let mut buf = vec![0u8; blob_cursor];
    LittleEndian::write_u32(&mut buf[0..4], classes.len() as u32);
    for (i, (record, class)) in records.iter().zip(classes).enumerate() {
        let at = CATALOG_HEADER_SIZE + i * RECORD_SIZE;
        record.write(&mut buf[at..at + RECORD_SIZE]);
        let name_at = record.name_offset as usize;
        buf[name_at..name_at + class.name.len()].copy_from_slice(class.name.as_bytes());
        let meta_at = record.metadata_offset as usize;
        buf[meta_at..meta_at + class.metadata.len()].copy_from_slice(class.metadata);
    }
    buf
}

/// `offset + len` as a range inside a buffer of `limit` bytes.
fn slice_bounds(offset: u64, len: u64, limit: usize) -> Option<(usize, usize)> {
    let start = usize::try_from(offset).ok()?;
    let end = start.checked_add(usize::try_from(len).ok()?)?;
    (end <= limit).then_some((start, end))
}

/// Parse a catalog. `catalog_base` is where `bytes` is (or will be) mapped and
/// `stub_base` where the stub table is.
pub fn parse_catalog(bytes: &[u8], catalog_base: Address, stub_base: Address) -> Result<Vec<CatalogEntry>> {
    let corrupted = ArchiveError::CorruptedData("corrupted class catalog");
    if bytes.len() < CATALOG_HEADER_SIZE {
        return Err(corrupted);
    }
    let count = LittleEndian::read_u32(&bytes[0..4]) as usize;
    let records_end = count
        .checked_mul(RECORD_SIZE)
        .and_then(|n| n.checked_add(CATALOG_HEADER_SIZE));
    if !matches!(records_end, Some(end) if end <= bytes.len()) {
        return Err(corrupted);
    }

    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let at = CATALOG_HEADER_SIZE + i * RECORD_SIZE;
        let record = CatalogRecord::read(&bytes[at..at + RECORD_SIZE]);
        let (Some((name_start, name_end)), Some((meta_start, meta_end))) = (
            slice_bounds(record.name_offset as u64, record.name_len as u64, bytes.len()),
            slice_bounds(record.metadata_offset, record.metadata_len, bytes.len()),
        ) else {
            return Err(corrupted);
        };
        let loader = LoaderKind::from_repr(record.loader).ok_or(ArchiveError::CorruptedData(
            "unknown loader kind in class catalog",
        ))?;
        entries.push(CatalogEntry {
            name: String::from_utf8_lossy(&bytes[name_start..name_end]).into_owned(),
            loader,
            path_index: record.path_index,
            metadata: MemRange::new(catalog_base + meta_start, meta_end - meta_start),
            stub: stub_base + i * STUB_SIZE,
        });
    }
    Ok(entries)
}

/// The trampoline stubs for a catalog mapped at `catalog_base`.
pub fn build_stub_table(catalog: &[u8], catalog_base: Address) -> Result<Vec<u8>> {
    let entries = parse_catalog(catalog, catalog_base, Address::ZERO)?;
    let mut stubs = vec![0u8; entries.len() * STUB_SIZE];
    for (e, stub) in entries.iter().zip(stubs.chunks_exact_mut(STUB_SIZE)) {
        LittleEndian::write_u64(&mut stub[0..8], e.metadata.start.as_usize() as u64);
        LittleEndian::write_u64(&mut stub[8..16], e.metadata.size as u64);
    }
    Ok(stubs)
}

/// Read the metadata address stored in a mapped stub.
///
/// # Safety
/// `stub` must point into a mapped stub table.
pub unsafe fn read_stub(stub: Address) -> MemRange {
    let bytes = stub.as_bytes(STUB_SIZE);
    let start = LittleEndian::read_u64(&bytes[0..8]) as usize;
    let size = LittleEndian::read_u64(&bytes[8..16]) as usize;
    MemRange::new(Address::from_usize(start), size)
}
