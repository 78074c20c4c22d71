//! Opening an archive and checking that it fits the running process.

use super::format::{ArchiveKind, FileMapHeader, RegionKind};
use super::ident;
use super::misc_info::{RuntimePaths, SharedPathsMiscInfo};
use crate::error::{ArchiveError, Result};
use crate::util::conversions::bytes_to_formatted_string;
use crate::util::options::Options;
use crate::util::BitMap;
use crate::vm::{ClassPathResolver, VMEnvironment};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// An open archive file and its parsed header.
pub struct FileMapInfo {
    path: PathBuf,
    file: File,
    file_len: u64,
    header: FileMapHeader,
    misc_info: SharedPathsMiscInfo,
    base_archive_name: Option<String>,
    verify: bool,
}

impl std::fmt::Debug for FileMapInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileMapInfo")
            .field("path", &self.path)
            .field("kind", &self.header.kind())
            .field("file_len", &self.file_len)
            .finish()
    }
}

fn read_exact_at(file: &File, path: &Path, buf: &mut [u8], offset: u64, what: &'static str) -> Result<()> {
    file.read_exact_at(buf, offset).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => ArchiveError::Truncated { what },
        _ => ArchiveError::Io {
            path: path.to_path_buf(),
            source: e,
        },
    })
}

/// A byte range of the archive file.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct FileRange {
    offset: u64,
    len: usize,
}

impl FileRange {
    fn end(&self) -> u64 {
        self.offset + self.len as u64
    }
}

/// `len` bytes at `offset`, if they lie inside a file of `file_len` bytes.
fn file_range(offset: u64, len: u64, file_len: u64) -> Option<FileRange> {
    let end = offset.checked_add(len)?;
    (end <= file_len).then_some(FileRange {
        offset,
        len: usize::try_from(len).ok()?,
    })
}

impl FileMapInfo {
    /// Open `path` as an archive of variant `kind` and check what the header says about
    /// itself: format, version and identity, then object alignment and compact strings, then
    /// the header CRC (if `verify_shared_spaces`). Every offset and size the header records
    /// must lie inside the file.
    pub fn open(path: &Path, kind: ArchiveKind, env: &VMEnvironment, options: &Options) -> Result<Self> {
        let io_err = |source| ArchiveError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(io_err)?;
        let file_len = file.metadata().map_err(io_err)?.len();
        info!("Opened {} archive {}", kind, path.display());

        let mut header_bytes = vec![0u8; kind.header_size()];
        if file_len < header_bytes.len() as u64 {
            return Err(ArchiveError::Truncated { what: "file header" });
        }
        read_exact_at(&file, path, &mut header_bytes, 0, "file header")?;
        let header = FileMapHeader::parse(&header_bytes, kind)?;

        if !ident::is_terminated(&header.jvm_ident) {
            return Err(ArchiveError::CorruptedIdent);
        }
        let expected_ident = ident::make_ident(&env.vm_version);
        if expected_ident != header.jvm_ident {
            return Err(ArchiveError::IdentMismatch {
                expected: ident::ident_to_string(&expected_ident),
                actual: header.ident_string(),
            });
        }

        if header.obj_alignment as usize != options.object_alignment_in_bytes {
            return Err(ArchiveError::ObjectAlignmentMismatch {
                archive: header.obj_alignment,
                current: options.object_alignment_in_bytes as u32,
            });
        }
        if header.compact_strings != options.compact_strings {
            return Err(ArchiveError::CompactStringsMismatch {
                archive: header.compact_strings,
                current: options.compact_strings,
            });
        }

        if options.verify_shared_spaces {
            let crc = header.compute_crc();
            if crc != header.crc {
                return Err(ArchiveError::HeaderCrcMismatch {
                    expected: crc,
                    actual: header.crc,
                });
            }
        }

        if !header.alignment.is_power_of_two() {
            return Err(ArchiveError::CorruptedData("region alignment is not a power of two"));
        }
        let misc_range = file_range(header.header_size as u64, header.paths_misc_info_size as u64, file_len)
            .ok_or(ArchiveError::Truncated { what: "shared path misc info" })?;
        let mut misc = vec![0u8; misc_range.len];
        read_exact_at(&file, path, &mut misc, misc_range.offset, "shared path misc info")?;

        let base_archive_name = match kind {
            ArchiveKind::Static => None,
            ArchiveKind::Dynamic => {
                let name_range = file_range(misc_range.end(), header.base_archive_name_size as u64, file_len)
                    .ok_or(ArchiveError::Truncated { what: "base archive name" })?;
                let mut name = vec![0u8; name_range.len];
                read_exact_at(&file, path, &mut name, name_range.offset, "base archive name")?;
                if name.last() != Some(&0) {
                    return Err(ArchiveError::CorruptedData("base archive name is not terminated"));
                }
                name.pop();
                Some(String::from_utf8_lossy(&name).into_owned())
            }
        };

        for (region_kind, region) in header.regions.iter().filter(|(_, r)| !r.is_empty()) {
            if file_range(region.file_offset, region.used, file_len).is_none() {
                warn!(
                    "Region {} at {:#x} ({} bytes) does not fit in the file of {} bytes",
                    region_kind, region.file_offset, region.used, file_len
                );
                return Err(ArchiveError::Truncated { what: "region data" });
            }
        }
        if header
            .mapped_base_address
            .as_usize()
            .checked_add(header.non_heap_size())
            .is_none()
        {
            return Err(ArchiveError::CorruptedData("mapped regions leave the address space"));
        }

        Ok(FileMapInfo {
            path: path.to_path_buf(),
            file,
            file_len,
            header,
            misc_info: SharedPathsMiscInfo::from_bytes(misc),
            base_archive_name,
            verify: options.verify_shared_spaces,
        })
    }

    /// Check the header against the running process.
    ///
    /// A run that sets the `java.system.class.loader` property cannot use archived
    /// application classes, so the header is adjusted to describe a boot-only archive before
    /// the verification and classpath checks.
    pub fn validate_header(
        &mut self,
        options: &Options,
        env: &VMEnvironment,
        resolver: &dyn ClassPathResolver,
    ) -> Result<()> {
        let header = &mut self.header;
        if header.allow_archiving_with_java_agent {
            if !options.allow_archiving_with_java_agent {
                return Err(ArchiveError::JavaAgentMismatch);
            }
            warn!("This archive was created with AllowArchivingWithJavaAgent. It should be used for testing purposes only and should not be used in a production environment");
        }
        if let Some(loader) = &env.system_class_loader_property {
            warn!(
                "Archived non-system classes are disabled because the java.system.class.loader property is specified (value = \"{}\"). \
                 To use archived non-system classes, this property must not be set",
                loader
            );
            header.has_platform_or_app_classes = false;
        }
        if header.has_platform_or_app_classes
            && ((!header.verify_local && options.bytecode_verification_local)
                || (!header.verify_remote && options.bytecode_verification_remote))
        {
            return Err(ArchiveError::VerificationLessStrict);
        }

        let boot = resolver.boot_class_path_string();
        let app = resolver.app_class_path_string();
        self.misc_info.check(&RuntimePaths {
            boot_class_path: &boot,
            app_class_path: &app,
            has_platform_or_app_classes: self.header.has_platform_or_app_classes,
        })
    }

    /// Check that this dynamic archive was dumped on top of the archive with `base`.
    pub fn validate_base_archive(&self, base: &FileMapHeader) -> Result<()> {
        let Some(ext) = &self.header.dynamic else {
            return Err(ArchiveError::BaseArchiveMismatch("not a dynamic archive".into()));
        };
        if ext.base_header_crc != base.crc {
            return Err(ArchiveError::BaseArchiveMismatch(format!(
                "base archive header checksum {:#010x} does not match {:#010x}",
                base.crc, ext.base_header_crc
            )));
        }
        if ext.base_region_crc != base.region_crcs() {
            return Err(ArchiveError::BaseArchiveMismatch(
                "base archive region checksums do not match".into(),
            ));
        }
        if self.header.mapped_base_address != base.mapped_top() {
            return Err(ArchiveError::BaseArchiveMismatch(format!(
                "dynamic archive expects its base to end at {}, but it ends at {}",
                self.header.mapped_base_address,
                base.mapped_top()
            )));
        }
        Ok(())
    }

    /// Read a region's bytes from the file.
    pub fn read_region(&self, kind: RegionKind) -> Result<Vec<u8>> {
        let region = self.header.region(kind);
        let range = file_range(region.file_offset, region.used, self.file_len)
            .ok_or(ArchiveError::Truncated { what: "region data" })?;
        let mut buf = vec![0u8; range.len];
        read_exact_at(&self.file, &self.path, &mut buf, range.offset, "region data")?;
        Ok(buf)
    }

    /// Read the oopmap of a heap region.
    pub fn read_oopmap(&self, kind: RegionKind) -> Result<BitMap> {
        debug_assert!(kind.is_heap());
        let region = self.header.region(kind);
        let range = region
            .oopmap_size_in_bits
            .checked_add(63)
            .map(|bits| bits / 64 * 8)
            .and_then(|bytes| file_range(region.oopmap_offset, bytes, self.file_len))
            .ok_or(ArchiveError::Truncated { what: "oopmap" })?;
        let mut buf = vec![0u8; range.len];
        read_exact_at(&self.file, &self.path, &mut buf, range.offset, "oopmap")?;
        BitMap::from_bytes(&buf, region.oopmap_size_in_bits as usize)
            .ok_or(ArchiveError::CorruptedData("corrupted oopmap"))
    }

    /// Check `data`, the mapped contents of `kind`, against the recorded CRC. Does nothing
    /// unless `verify_shared_spaces` was set when the archive was opened.
    pub fn verify_region_checksum(&self, kind: RegionKind, data: &[u8]) -> Result<()> {
        if !self.verify {
            return Ok(());
        }
        let expected = self.header.region(kind).crc;
        let actual = crc32fast::hash(data);
        if actual != expected {
            return Err(ArchiveError::RegionCrcMismatch {
                region: kind,
                expected,
                actual,
            });
        }
        Ok(())
    }

    pub fn header(&self) -> &FileMapHeader {
        &self.header
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    pub fn misc_info(&self) -> &SharedPathsMiscInfo {
        &self.misc_info
    }

    pub fn base_archive_name(&self) -> Option<&str> {
        self.base_archive_name.as_deref()
    }

    /// Log a description of the archive.
    pub fn print_info(&self) {
        let h = &self.header;
        info!("{} archive: {}", h.kind(), self.path.display());
        info!("- magic:                      {:#010x}", h.magic);
        info!("- crc:                        {:#010x}", h.crc);
        info!("- version:                    {}", h.version);
        info!("- jvm ident:                  {}", h.ident_string());
        info!("- alignment:                  {}", h.alignment);
        info!("- obj alignment:              {}", h.obj_alignment);
        info!("- compact strings:            {}", h.compact_strings);
        info!(
            "- narrow oop:                 {} base {} shift {}",
            h.narrow_oop_mode, h.narrow_oop_base, h.narrow_oop_shift
        );
        info!(
            "- narrow klass:               base {} shift {}",
            h.narrow_klass_base, h.narrow_klass_shift
        );
        info!("- max heap size:              {}", bytes_to_formatted_string(h.max_heap_size as usize));
        info!("- heap reserved:              {} - {}", h.heap_reserved_start, h.heap_reserved_end);
        info!("- mapped base address:        {}", h.mapped_base_address);
        info!("- shared paths:               {}", h.num_shared_paths);
        info!("- max used path index:        {}", h.max_used_path_index);
        info!("- has platform or app classes: {}", h.has_platform_or_app_classes);
        if let Some(name) = &self.base_archive_name {
            info!("- base archive:               {}", name);
        }
        for (kind, region) in &h.regions {
            if region.is_empty() {
                continue;
            }
            info!(
                "  {:>3}: offset {:#010x} addr {:#x} used {:>8} crc {:#010x}{}{}",
                kind,
                region.file_offset,
                region.addr,
                region.used,
                region.crc,
                if region.read_only { " ro" } else { "" },
                if region.allow_exec { " exec" } else { "" }
            );
        }
        if let Ok(records) = self.misc_info.records() {
            for (path, ty) in records {
                info!("  misc path info: {} {}", ty, path);
            }
        }
    }
}
