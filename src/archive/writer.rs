//! Sequential archive output.
//!
//! An archive is written in two passes over the same sequence of calls. The first pass has
//! no file: it only advances the offset and fills in the header (region offsets, sizes and
//! CRCs). The second pass opens the file, writes the finished header with its CRC, and then
//! replays the sequence, checking that every region lands where the first pass put it.

use super::format::{FileMapHeader, RegionKind};
use crate::error::fail_stop;
use crate::util::conversions::{bytes_to_formatted_string, raw_align_up};
use crate::util::{Address, BitMap, MemRange};
use crate::vm::NarrowOopEncoding;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// A heap range to archive and the slots in it that hold narrow oops.
#[derive(Clone, Debug)]
pub struct ArchivedHeapRange {
    pub range: MemRange,
    pub oopmap: BitMap,
}

pub struct FileMapWriter {
    header: FileMapHeader,
    /// `None` during the layout pass.
    output: Option<(PathBuf, File)>,
    file_offset: u64,
}

impl FileMapWriter {
    /// Start the layout pass.
    pub fn layout(header: FileMapHeader) -> Self {
        FileMapWriter {
            header,
            output: None,
            file_offset: 0,
        }
    }

    /// Start the output pass with a header completed by the layout pass. Any existing file
    /// at `path` is replaced.
    pub fn create(path: &Path, mut header: FileMapHeader) -> Self {
        // Remove the old file first, in case it is still mapped by another process.
        if path.exists() {
            if let Err(e) = fs::remove_file(path) {
                fail_stop(format!("Unable to remove shared archive file {}: {}", path.display(), e));
            }
        }
        let file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) => fail_stop(format!("Unable to create shared archive file {}: {}", path.display(), e)),
        };
        info!("Dumping shared data to file: {}", path.display());
        header.crc = header.compute_crc();
        let mut writer = FileMapWriter {
            header,
            output: Some((path.to_path_buf(), file)),
            file_offset: 0,
        };
        let bytes = writer.header.to_bytes();
        writer.write_bytes(&bytes);
        writer
    }

    pub fn header(&self) -> &FileMapHeader {
        &self.header
    }

    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    fn is_layout(&self) -> bool {
        self.output.is_none()
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        if let Some((path, file)) = self.output.as_mut() {
            if let Err(e) = file.write_all(bytes) {
                let path = path.clone();
                self.output = None;
                // Best effort: the archive is unusable either way.
                let _ = fs::remove_file(&path);
                fail_stop(format!("Unable to write to shared archive file {}: {}", path.display(), e));
            }
        }
        self.file_offset += bytes.len() as u64;
    }

    fn align_file_position(&mut self, alignment: usize) {
        let aligned = raw_align_up(self.file_offset as usize, alignment) as u64;
        if aligned != self.file_offset {
            let padding = vec![0u8; (aligned - self.file_offset) as usize];
            self.write_bytes(&padding);
        }
    }

    /// Write what precedes the regions: the header (already written in the output pass), the
    /// misc path info and, for a dynamic archive, the name of its base archive.
    pub fn write_header_section(&mut self, misc_info: &[u8], base_archive_name: Option<&str>) {
        if self.is_layout() {
            self.file_offset = self.header.header_size as u64;
            self.header.paths_misc_info_size = misc_info.len() as u32;
            self.header.base_archive_name_size = base_archive_name.map_or(0, |n| n.len() as u32 + 1);
        } else {
            assert_eq!(self.file_offset, self.header.header_size as u64);
            assert_eq!(self.header.paths_misc_info_size as usize, misc_info.len());
        }
        self.write_bytes(misc_info);
        if let Some(name) = base_archive_name {
            self.write_bytes(name.as_bytes());
            self.write_bytes(&[0]);
        }
        self.align_file_position(self.header.alignment as usize);
    }

    fn record_region(&mut self, kind: RegionKind, data: &[u8], addr: u64) {
        let crc = crc32fast::hash(data);
        let offset = self.file_offset;
        let layout = self.is_layout();
        let region = self.header.region_mut(kind);
        if layout {
            region.file_offset = offset;
            region.addr = addr;
            region.used = data.len() as u64;
            region.crc = crc;
            region.read_only = kind.read_only();
            region.allow_exec = kind.allow_exec();
        } else {
            assert_eq!(region.file_offset, offset, "region {} moved between passes", kind);
            assert_eq!(region.crc, crc, "region {} changed between passes", kind);
        }
        debug!(
            "Shared file region {}: {} bytes, addr {:#x} file offset {:#x} crc {:#010x}",
            kind,
            data.len(),
            addr,
            offset,
            crc
        );
    }

    /// Write one metadata region that will be mapped at `base`.
    pub fn write_region(&mut self, kind: RegionKind, data: &[u8], base: Address) {
        debug_assert!(!kind.is_heap());
        self.record_region(kind, data, base.as_usize() as u64);
        self.write_bytes(data);
        self.align_file_position(self.header.alignment as usize);
    }

    /// Write one half (closed or open) of the archived heap.
    ///
    /// The collector hands the archived objects over in at most two ranges per half. Each
    /// region records the narrow-oop encoding of its bottom under `encoding`.
    pub fn write_heap_regions(&mut self, open: bool, ranges: &[ArchivedHeapRange], encoding: &NarrowOopEncoding) {
        let kinds = if open {
            RegionKind::OPEN_HEAP
        } else {
            RegionKind::CLOSED_HEAP
        };
        if ranges.len() > kinds.len() {
            fail_stop(format!(
                "Unable to write archive heap memory regions: number of memory regions exceeds maximum due to fragmentation. \
                 Please increase java heap size (current max heap size is {}).",
                bytes_to_formatted_string(self.header.max_heap_size as usize)
            ));
        }
        for (kind, heap_range) in kinds.iter().zip(ranges) {
            let addr = match encoding.encode(heap_range.range.start) {
                Ok(narrow) => narrow as u64,
                Err(e) => fail_stop(format!("Archived heap region {} is not encodable: {}", kind, e)),
            };
            let data = unsafe { heap_range.range.start.as_bytes(heap_range.range.size) };
            self.record_region(*kind, data, addr);
            self.write_bytes(data);
            self.align_file_position(self.header.alignment as usize);
        }
    }

    /// Write the oopmaps of the heap regions written so far, after all regions.
    pub fn write_oopmaps(&mut self, open: bool, ranges: &[ArchivedHeapRange]) {
        let kinds = if open {
            RegionKind::OPEN_HEAP
        } else {
            RegionKind::CLOSED_HEAP
        };
        for (kind, heap_range) in kinds.iter().zip(ranges) {
            let bytes = heap_range.oopmap.to_bytes();
            let offset = self.file_offset;
            let layout = self.is_layout();
            let region = self.header.region_mut(*kind);
            if layout {
                region.oopmap_offset = offset;
                region.oopmap_size_in_bits = heap_range.oopmap.size_in_bits() as u64;
            } else {
                assert_eq!(region.oopmap_offset, offset, "oopmap of {} moved between passes", kind);
            }
            self.write_bytes(&bytes);
        }
    }

    /// Finish the pass and return the header. After the output pass the file is flushed
    /// and closed.
    pub fn finish(mut self) -> FileMapHeader {
        if let Some((path, file)) = self.output.take() {
            if let Err(e) = file.sync_all() {
                let _ = fs::remove_file(&path);
                fail_stop(format!("Unable to close shared archive file {}: {}", path.display(), e));
            }
            info!(
                "Shared archive {} written: {}",
                path.display(),
                bytes_to_formatted_string(self.file_offset as usize)
            );
        }
        self.header
    }
}
