//! The binary layout of an archive file.
//!
//! ```text
//! +--------------------+ 0
//! | header             |  static or dynamic variant, little-endian
//! +--------------------+ header_size
//! | misc-path info     |  paths_misc_info_size bytes
//! | base archive name  |  dynamic only, NUL terminated
//! +--------------------+ aligned to the allocation granularity
//! | mc | rw | ro | md  |  each padded to the region alignment
//! | heap regions       |  closed then open, each padded likewise
//! +--------------------+
//! | oopmaps            |  one per heap region
//! +--------------------+
//! ```
//!
//! Both header variants share one layout; the dynamic one appends the checksums of the base
//! archive it was dumped on top of. The variant is recorded explicitly in the `kind` byte and
//! must agree with the magic number.

use super::ident::{self, JVM_IDENT_MAX};
use crate::error::{ArchiveError, Result};
use crate::util::conversions::raw_align_up;
use crate::util::Address;
use crate::vm::NarrowOopMode;
use byteorder::{ByteOrder, LittleEndian};
use enum_map::{Enum, EnumMap};
use static_assertions::{const_assert, const_assert_eq};
use strum::EnumCount;
use strum_macros::{Display, EnumCount as EnumCountMacro, EnumIter, FromRepr};

/// Magic number of a static (base) archive.
pub const STATIC_ARCHIVE_MAGIC: u32 = 0xf00b_aba2;
/// Magic number of a dynamic (top-layer) archive.
pub const DYNAMIC_ARCHIVE_MAGIC: u32 = 0xf00b_aba8;
/// The only format version this build reads and writes.
pub const CURRENT_ARCHIVE_VERSION: u32 = 6;

/// The regions of an archive, in file and mapping order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Enum, EnumIter, EnumCountMacro, Display, FromRepr)]
#[repr(usize)]
pub enum RegionKind {
    /// Code: trampolines into archived metadata. Mapped executable.
    #[strum(serialize = "mc")]
    Mc,
    /// Read-write metadata, including the shared path table.
    #[strum(serialize = "rw")]
    Rw,
    /// Read-only metadata, including the class catalog.
    #[strum(serialize = "ro")]
    Ro,
    /// Miscellaneous data, including the serialized root.
    #[strum(serialize = "md")]
    Md,
    #[strum(serialize = "ca0")]
    ClosedHeap0,
    #[strum(serialize = "ca1")]
    ClosedHeap1,
    #[strum(serialize = "oa0")]
    OpenHeap0,
    #[strum(serialize = "oa1")]
    OpenHeap1,
}

pub const NUM_REGIONS: usize = RegionKind::COUNT;

impl RegionKind {
    /// The metadata regions, in mapping order. They are mapped contiguously.
    pub const NON_HEAP: [RegionKind; 4] = [RegionKind::Mc, RegionKind::Rw, RegionKind::Ro, RegionKind::Md];
    pub const CLOSED_HEAP: [RegionKind; 2] = [RegionKind::ClosedHeap0, RegionKind::ClosedHeap1];
    pub const OPEN_HEAP: [RegionKind; 2] = [RegionKind::OpenHeap0, RegionKind::OpenHeap1];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn is_heap(self) -> bool {
        self.index() >= RegionKind::ClosedHeap0.index()
    }

    pub const fn is_open_heap(self) -> bool {
        self.index() >= RegionKind::OpenHeap0.index()
    }

    /// Is the region mapped read-only by default?
    pub const fn read_only(self) -> bool {
        matches!(
            self,
            RegionKind::Ro | RegionKind::ClosedHeap0 | RegionKind::ClosedHeap1
        )
    }

    pub const fn allow_exec(self) -> bool {
        matches!(self, RegionKind::Mc)
    }
}

/// Which of the two header variants a file carries.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum ArchiveKind {
    #[strum(serialize = "static")]
    Static = 0,
    #[strum(serialize = "dynamic")]
    Dynamic = 1,
}

impl ArchiveKind {
    pub const fn magic(self) -> u32 {
        match self {
            ArchiveKind::Static => STATIC_ARCHIVE_MAGIC,
            ArchiveKind::Dynamic => DYNAMIC_ARCHIVE_MAGIC,
        }
    }

    pub const fn header_size(self) -> usize {
        match self {
            ArchiveKind::Static => STATIC_HEADER_SIZE,
            ArchiveKind::Dynamic => DYNAMIC_HEADER_SIZE,
        }
    }
}

/// Byte offsets of the header fields.
pub mod field {
    use super::{JVM_IDENT_MAX, NUM_REGIONS, REGION_DESCRIPTOR_SIZE};

    pub const MAGIC: usize = 0;
    pub const CRC: usize = 4;
    pub const VERSION: usize = 8;
    pub const HEADER_SIZE: usize = 12;
    pub const KIND: usize = 16;
    pub const COMPACT_STRINGS: usize = 17;
    pub const NARROW_OOP_MODE: usize = 18;
    pub const NARROW_OOP_SHIFT: usize = 19;
    pub const NARROW_KLASS_SHIFT: usize = 20;
    pub const VERIFY_LOCAL: usize = 21;
    pub const VERIFY_REMOTE: usize = 22;
    pub const HAS_PLATFORM_OR_APP_CLASSES: usize = 23;
    pub const ALLOW_ARCHIVING_WITH_JAVA_AGENT: usize = 24;
    pub const ALIGNMENT: usize = 28;
    pub const OBJ_ALIGNMENT: usize = 32;
    pub const PATHS_MISC_INFO_SIZE: usize = 36;
    pub const BASE_ARCHIVE_NAME_SIZE: usize = 40;
    pub const NUM_SHARED_PATHS: usize = 44;
    pub const APP_CLASS_PATHS_START_INDEX: usize = 48;
    pub const APP_MODULE_PATHS_START_INDEX: usize = 52;
    pub const NUM_MODULE_PATHS: usize = 56;
    pub const MAX_USED_PATH_INDEX: usize = 60;
    pub const NARROW_OOP_BASE: usize = 64;
    pub const NARROW_KLASS_BASE: usize = 72;
    pub const MAX_HEAP_SIZE: usize = 80;
    pub const HEAP_RESERVED_START: usize = 88;
    pub const HEAP_RESERVED_END: usize = 96;
    pub const MAPPED_BASE_ADDRESS: usize = 104;
    pub const SERIALIZED_DATA_OFFSET: usize = 112;
    pub const SHARED_PATH_TABLE_OFFSET: usize = 120;
    pub const SHARED_PATH_TABLE_SIZE: usize = 128;
    pub const JVM_IDENT: usize = 136;
    pub const REGIONS: usize = JVM_IDENT + JVM_IDENT_MAX;
    pub const BASE_HEADER_CRC: usize = REGIONS + NUM_REGIONS * REGION_DESCRIPTOR_SIZE;
    pub const BASE_REGION_CRC: usize = BASE_HEADER_CRC + 4;
    pub const DYNAMIC_END: usize = BASE_REGION_CRC + 4 * NUM_REGIONS;
}

/// Serialized size of one region descriptor.
pub const REGION_DESCRIPTOR_SIZE: usize = 48;
pub const STATIC_HEADER_SIZE: usize = field::BASE_HEADER_CRC;
pub const DYNAMIC_HEADER_SIZE: usize = raw_align_up(field::DYNAMIC_END, 8);

const_assert_eq!(field::REGIONS, 392);
const_assert_eq!(STATIC_HEADER_SIZE, 776);
const_assert_eq!(DYNAMIC_HEADER_SIZE, 816);
const_assert!(field::ALLOW_ARCHIVING_WITH_JAVA_AGENT < field::ALIGNMENT);

/// Where one region lives in the file and where it must be mapped.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RegionDescriptor {
    pub file_offset: u64,
    /// The mapping address for metadata regions. For heap regions this is the
    /// narrow-oop encoding of the region bottom under the dump-time encoding.
    pub addr: u64,
    pub used: u64,
    pub oopmap_offset: u64,
    pub oopmap_size_in_bits: u64,
    pub crc: u32,
    pub read_only: bool,
    pub allow_exec: bool,
}

impl RegionDescriptor {
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn used(&self) -> usize {
        self.used as usize
    }

    /// The mapping address of a metadata region.
    pub fn mapped_base(&self) -> Address {
        unsafe { Address::from_usize(self.addr as usize) }
    }

    fn write_to(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[0..], self.file_offset);
        LittleEndian::write_u64(&mut buf[8..], self.addr);
        LittleEndian::write_u64(&mut buf[16..], self.used);
        LittleEndian::write_u64(&mut buf[24..], self.oopmap_offset);
        LittleEndian::write_u64(&mut buf[32..], self.oopmap_size_in_bits);
        LittleEndian::write_u32(&mut buf[40..], self.crc);
        buf[44] = self.read_only as u8;
        buf[45] = self.allow_exec as u8;
    }

    fn read_from(buf: &[u8]) -> Self {
        RegionDescriptor {
            file_offset: LittleEndian::read_u64(&buf[0..]),
            addr: LittleEndian::read_u64(&buf[8..]),
            used: LittleEndian::read_u64(&buf[16..]),
            oopmap_offset: LittleEndian::read_u64(&buf[24..]),
            oopmap_size_in_bits: LittleEndian::read_u64(&buf[32..]),
            crc: LittleEndian::read_u32(&buf[40..]),
            read_only: buf[44] != 0,
            allow_exec: buf[45] != 0,
        }
    }
}

/// The fields only a dynamic archive has: checksums identifying its base archive.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DynamicHeaderExt {
    pub base_header_crc: u32,
    pub base_region_crc: [u32; NUM_REGIONS],
}

/// The archive header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileMapHeader {
    pub magic: u32,
    pub crc: u32,
    pub version: u32,
    pub header_size: u32,
    pub compact_strings: bool,
    pub narrow_oop_mode: NarrowOopMode,
    pub narrow_oop_shift: u8,
    pub narrow_klass_shift: u8,
    pub verify_local: bool,
    pub verify_remote: bool,
    pub has_platform_or_app_classes: bool,
    pub allow_archiving_with_java_agent: bool,
    /// Alignment of the metadata regions, in the file and in memory.
    pub alignment: u32,
    pub obj_alignment: u32,
    pub paths_misc_info_size: u32,
    pub base_archive_name_size: u32,
    pub num_shared_paths: u32,
    pub app_class_paths_start_index: u32,
    pub app_module_paths_start_index: u32,
    pub num_module_paths: u32,
    /// The highest shared path index used by an archived class, or -1.
    pub max_used_path_index: i32,
    pub narrow_oop_base: Address,
    pub narrow_klass_base: Address,
    pub max_heap_size: u64,
    pub heap_reserved_start: Address,
    pub heap_reserved_end: Address,
    /// Where the metadata regions were laid out at dump time.
    pub mapped_base_address: Address,
    /// Offset of the serialized root in the md region.
    pub serialized_data_offset: u64,
    /// Offset of the shared path table in the rw region.
    pub shared_path_table_offset: u64,
    pub shared_path_table_size: u64,
    pub jvm_ident: [u8; JVM_IDENT_MAX],
    pub regions: EnumMap<RegionKind, RegionDescriptor>,
    pub dynamic: Option<DynamicHeaderExt>,
}

impl FileMapHeader {
    /// A zeroed header of the given variant, stamped with the current magic, version, size
    /// and identity.
    pub fn new(kind: ArchiveKind, vm_version: &str) -> Self {
        FileMapHeader {
            magic: kind.magic(),
            crc: 0,
            version: CURRENT_ARCHIVE_VERSION,
            header_size: kind.header_size() as u32,
            compact_strings: false,
            narrow_oop_mode: NarrowOopMode::Unscaled,
            narrow_oop_shift: 0,
            narrow_klass_shift: 0,
            verify_local: false,
            verify_remote: false,
            has_platform_or_app_classes: false,
            allow_archiving_with_java_agent: false,
            alignment: 0,
            obj_alignment: 0,
            paths_misc_info_size: 0,
            base_archive_name_size: 0,
            num_shared_paths: 0,
            app_class_paths_start_index: 0,
            app_module_paths_start_index: 0,
            num_module_paths: 0,
            max_used_path_index: -1,
            narrow_oop_base: Address::ZERO,
            narrow_klass_base: Address::ZERO,
            max_heap_size: 0,
            heap_reserved_start: Address::ZERO,
            heap_reserved_end: Address::ZERO,
            mapped_base_address: Address::ZERO,
            serialized_data_offset: 0,
            shared_path_table_offset: 0,
            shared_path_table_size: 0,
            jvm_ident: ident::make_ident(vm_version),
            regions: EnumMap::default(),
            dynamic: match kind {
                ArchiveKind::Static => None,
                ArchiveKind::Dynamic => Some(DynamicHeaderExt::default()),
            },
        }
    }

    pub fn kind(&self) -> ArchiveKind {
        if self.dynamic.is_some() {
            ArchiveKind::Dynamic
        } else {
            ArchiveKind::Static
        }
    }

    pub fn is_static(&self) -> bool {
        self.dynamic.is_none()
    }

    pub fn region(&self, kind: RegionKind) -> &RegionDescriptor {
        &self.regions[kind]
    }

    pub fn region_mut(&mut self, kind: RegionKind) -> &mut RegionDescriptor {
        &mut self.regions[kind]
    }

    /// Bytes needed to map all metadata regions back to back.
    pub fn non_heap_size(&self) -> usize {
        RegionKind::NON_HEAP
            .iter()
            .map(|k| raw_align_up(self.regions[*k].used(), self.alignment as usize))
            .sum()
    }

    /// The end of the mapped metadata regions.
    pub fn mapped_top(&self) -> Address {
        self.mapped_base_address + self.non_heap_size()
    }

    pub fn region_crcs(&self) -> [u32; NUM_REGIONS] {
        let mut crcs = [0u32; NUM_REGIONS];
        for (kind, region) in &self.regions {
            crcs[kind.index()] = region.crc;
        }
        crcs
    }

    pub fn ident_string(&self) -> String {
        ident::ident_to_string(&self.jvm_ident)
    }

    /// Serialize into exactly `kind().header_size()` bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.kind().header_size()];
        LittleEndian::write_u32(&mut buf[field::MAGIC..], self.magic);
        LittleEndian::write_u32(&mut buf[field::CRC..], self.crc);
        LittleEndian::write_u32(&mut buf[field::VERSION..], self.version);
        LittleEndian::write_u32(&mut buf[field::HEADER_SIZE..], self.header_size);
        buf[field::KIND] = self.kind() as u8;
        buf[field::COMPACT_STRINGS] = self.compact_strings as u8;
        buf[field::NARROW_OOP_MODE] = self.narrow_oop_mode as u8;
        buf[field::NARROW_OOP_SHIFT] = self.narrow_oop_shift;
        buf[field::NARROW_KLASS_SHIFT] = self.narrow_klass_shift;
        buf[field::VERIFY_LOCAL] = self.verify_local as u8;
        buf[field::VERIFY_REMOTE] = self.verify_remote as u8;
        buf[field::HAS_PLATFORM_OR_APP_CLASSES] = self.has_platform_or_app_classes as u8;
        buf[field::ALLOW_ARCHIVING_WITH_JAVA_AGENT] = self.allow_archiving_with_java_agent as u8;
        LittleEndian::write_u32(&mut buf[field::ALIGNMENT..], self.alignment);
        LittleEndian::write_u32(&mut buf[field::OBJ_ALIGNMENT..], self.obj_alignment);
        LittleEndian::write_u32(&mut buf[field::PATHS_MISC_INFO_SIZE..], self.paths_misc_info_size);
        LittleEndian::write_u32(&mut buf[field::BASE_ARCHIVE_NAME_SIZE..], self.base_archive_name_size);
        LittleEndian::write_u32(&mut buf[field::NUM_SHARED_PATHS..], self.num_shared_paths);
        LittleEndian::write_u32(&mut buf[field::APP_CLASS_PATHS_START_INDEX..], self.app_class_paths_start_index);
        LittleEndian::write_u32(&mut buf[field::APP_MODULE_PATHS_START_INDEX..], self.app_module_paths_start_index);
        LittleEndian::write_u32(&mut buf[field::NUM_MODULE_PATHS..], self.num_module_paths);
        LittleEndian::write_i32(&mut buf[field::MAX_USED_PATH_INDEX..], self.max_used_path_index);
        LittleEndian::write_u64(&mut buf[field::NARROW_OOP_BASE..], self.narrow_oop_base.as_usize() as u64);
        LittleEndian::write_u64(&mut buf[field::NARROW_KLASS_BASE..], self.narrow_klass_base.as_usize() as u64);
        LittleEndian::write_u64(&mut buf[field::MAX_HEAP_SIZE..], self.max_heap_size);
        LittleEndian::write_u64(&mut buf[field::HEAP_RESERVED_START..], self.heap_reserved_start.as_usize() as u64);
        LittleEndian::write_u64(&mut buf[field::HEAP_RESERVED_END..], self.heap_reserved_end.as_usize() as u64);
        LittleEndian::write_u64(&mut buf[field::MAPPED_BASE_ADDRESS..], self.mapped_base_address.as_usize() as u64);
        LittleEndian::write_u64(&mut buf[field::SERIALIZED_DATA_OFFSET..], self.serialized_data_offset);
        LittleEndian::write_u64(&mut buf[field::SHARED_PATH_TABLE_OFFSET..], self.shared_path_table_offset);
        LittleEndian::write_u64(&mut buf[field::SHARED_PATH_TABLE_SIZE..], self.shared_path_table_size);
        buf[field::JVM_IDENT..field::REGIONS].copy_from_slice(&self.jvm_ident);
        for (kind, region) in &self.regions {
            let start = field::REGIONS + kind.index() * REGION_DESCRIPTOR_SIZE;
            region.write_to(&mut buf[start..start + REGION_DESCRIPTOR_SIZE]);
        }
        if let Some(ext) = &self.dynamic {
            LittleEndian::write_u32(&mut buf[field::BASE_HEADER_CRC..], ext.base_header_crc);
            LittleEndian::write_u32_into(
                &ext.base_region_crc,
                &mut buf[field::BASE_REGION_CRC..field::DYNAMIC_END],
            );
        }
        buf
    }

    /// Parse a header of the `expected` variant.
    ///
    /// The checks run in a fixed order: size of the buffer, magic number, variant
    /// discriminant, version, declared header size. Compatibility with the running process
    /// is not checked here.
    pub fn parse(bytes: &[u8], expected: ArchiveKind) -> Result<Self> {
        if bytes.len() < expected.header_size() {
            return Err(ArchiveError::Truncated { what: "file header" });
        }
        let magic = LittleEndian::read_u32(&bytes[field::MAGIC..]);
        if magic != expected.magic() {
            return Err(ArchiveError::BadMagic {
                expected: expected.magic(),
                actual: magic,
            });
        }
        if ArchiveKind::from_repr(bytes[field::KIND]) != Some(expected) {
            return Err(ArchiveError::CorruptedData(
                "archive kind does not agree with the magic number",
            ));
        }
        let version = LittleEndian::read_u32(&bytes[field::VERSION..]);
        if version != CURRENT_ARCHIVE_VERSION {
            return Err(ArchiveError::WrongVersion {
                expected: CURRENT_ARCHIVE_VERSION,
                actual: version,
            });
        }
        let header_size = LittleEndian::read_u32(&bytes[field::HEADER_SIZE..]);
        if header_size as usize != expected.header_size() {
            return Err(ArchiveError::HeaderSizeMismatch {
                expected: expected.header_size() as u32,
                actual: header_size,
            });
        }
        let narrow_oop_mode = NarrowOopMode::from_repr(bytes[field::NARROW_OOP_MODE])
            .ok_or(ArchiveError::CorruptedData("unknown narrow oop mode"))?;

        let read_u32 = |off: usize| LittleEndian::read_u32(&bytes[off..]);
        let read_u64 = |off: usize| LittleEndian::read_u64(&bytes[off..]);
        let read_addr = |off: usize| unsafe { Address::from_usize(read_u64(off) as usize) };
        let read_bool = |off: usize| bytes[off] != 0;

        let mut jvm_ident = [0u8; JVM_IDENT_MAX];
        jvm_ident.copy_from_slice(&bytes[field::JVM_IDENT..field::REGIONS]);

        let mut regions = EnumMap::<RegionKind, RegionDescriptor>::default();
        for (kind, region) in regions.iter_mut() {
            let start = field::REGIONS + kind.index() * REGION_DESCRIPTOR_SIZE;
            *region = RegionDescriptor::read_from(&bytes[start..start + REGION_DESCRIPTOR_SIZE]);
        }

        let dynamic = match expected {
            ArchiveKind::Static => None,
            ArchiveKind::Dynamic => {
                let mut base_region_crc = [0u32; NUM_REGIONS];
                LittleEndian::read_u32_into(
                    &bytes[field::BASE_REGION_CRC..field::DYNAMIC_END],
                    &mut base_region_crc,
                );
                Some(DynamicHeaderExt {
                    base_header_crc: read_u32(field::BASE_HEADER_CRC),
                    base_region_crc,
                })
            }
        };

        Ok(FileMapHeader {
            magic,
            crc: read_u32(field::CRC),
            version,
            header_size,
            compact_strings: read_bool(field::COMPACT_STRINGS),
            narrow_oop_mode,
            narrow_oop_shift: bytes[field::NARROW_OOP_SHIFT],
            narrow_klass_shift: bytes[field::NARROW_KLASS_SHIFT],
            verify_local: read_bool(field::VERIFY_LOCAL),
            verify_remote: read_bool(field::VERIFY_REMOTE),
            has_platform_or_app_classes: read_bool(field::HAS_PLATFORM_OR_APP_CLASSES),
            allow_archiving_with_java_agent: read_bool(field::ALLOW_ARCHIVING_WITH_JAVA_AGENT),
            alignment: read_u32(field::ALIGNMENT),
            obj_alignment: read_u32(field::OBJ_ALIGNMENT),
            paths_misc_info_size: read_u32(field::PATHS_MISC_INFO_SIZE),
            base_archive_name_size: read_u32(field::BASE_ARCHIVE_NAME_SIZE),
            num_shared_paths: read_u32(field::NUM_SHARED_PATHS),
            app_class_paths_start_index: read_u32(field::APP_CLASS_PATHS_START_INDEX),
            app_module_paths_start_index: read_u32(field::APP_MODULE_PATHS_START_INDEX),
            num_module_paths: read_u32(field::NUM_MODULE_PATHS),
            max_used_path_index: LittleEndian::read_i32(&bytes[field::MAX_USED_PATH_INDEX..]),
            narrow_oop_base: read_addr(field::NARROW_OOP_BASE),
            narrow_klass_base: read_addr(field::NARROW_KLASS_BASE),
            max_heap_size: read_u64(field::MAX_HEAP_SIZE),
            heap_reserved_start: read_addr(field::HEAP_RESERVED_START),
            heap_reserved_end: read_addr(field::HEAP_RESERVED_END),
            mapped_base_address: read_addr(field::MAPPED_BASE_ADDRESS),
            serialized_data_offset: read_u64(field::SERIALIZED_DATA_OFFSET),
            shared_path_table_offset: read_u64(field::SHARED_PATH_TABLE_OFFSET),
            shared_path_table_size: read_u64(field::SHARED_PATH_TABLE_SIZE),
            jvm_ident,
            regions,
            dynamic,
        })
    }

    /// CRC32 over every header byte after the CRC field.
    pub fn compute_crc(&self) -> u32 {
        crc32fast::hash(&self.to_bytes()[field::VERSION..])
    }
}

/// The stored CRC of a raw header, for callers that only have the bytes.
pub fn stored_crc(header_bytes: &[u8]) -> u32 {
    LittleEndian::read_u32(&header_bytes[field::CRC..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    fn sample_header(kind: ArchiveKind) -> FileMapHeader {
        let mut header = FileMapHeader::new(kind, "test-vm 1.0");
        header.compact_strings = true;
        header.narrow_oop_mode = NarrowOopMode::HeapBased;
        header.narrow_oop_shift = 3;
        header.alignment = 4096;
        header.obj_alignment = 8;
        header.max_used_path_index = 2;
        header.narrow_oop_base = unsafe { Address::from_usize(0x7f00_0000_0000) };
        header.mapped_base_address = unsafe { Address::from_usize(0x8_0000_0000) };
        header.region_mut(RegionKind::Rw).used = 100;
        header.region_mut(RegionKind::Rw).crc = 0xdead_beef;
        header.region_mut(RegionKind::OpenHeap1).oopmap_size_in_bits = 77;
        if let Some(ext) = header.dynamic.as_mut() {
            ext.base_header_crc = 0x1234_5678;
            ext.base_region_crc[3] = 42;
        }
        header
    }

    #[test]
    fn region_order_and_names() {
        let names: Vec<String> = RegionKind::iter().map(|k| k.to_string()).collect();
        assert_eq!(names, ["mc", "rw", "ro", "md", "ca0", "ca1", "oa0", "oa1"]);
        assert!(RegionKind::Mc.allow_exec());
        assert!(RegionKind::Ro.read_only());
        assert!(RegionKind::ClosedHeap1.read_only());
        assert!(!RegionKind::OpenHeap0.read_only());
        assert!(RegionKind::OpenHeap0.is_heap() && RegionKind::OpenHeap0.is_open_heap());
        assert!(!RegionKind::Md.is_heap());
    }

    #[test]
    fn header_fields_survive_serialization() {
        for kind in [ArchiveKind::Static, ArchiveKind::Dynamic] {
            let header = sample_header(kind);
            let bytes = header.to_bytes();
            assert_eq!(bytes.len(), kind.header_size());
            let parsed = FileMapHeader::parse(&bytes, kind).unwrap();
            assert_eq!(parsed, header);
            assert_eq!(parsed.to_bytes(), bytes);
        }
    }

    #[test]
    fn parse_checks_magic_before_version() {
        let mut bytes = sample_header(ArchiveKind::Static).to_bytes();
        LittleEndian::write_u32(&mut bytes[field::VERSION..], 1);
        assert!(matches!(
            FileMapHeader::parse(&bytes, ArchiveKind::Dynamic),
            Err(ArchiveError::BadMagic { .. })
        ));
        assert!(matches!(
            FileMapHeader::parse(&bytes, ArchiveKind::Static),
            Err(ArchiveError::WrongVersion { expected: CURRENT_ARCHIVE_VERSION, actual: 1 })
        ));
    }

    #[test]
    fn parse_rejects_inconsistent_headers() {
        let good = sample_header(ArchiveKind::Static).to_bytes();

        assert!(matches!(
            FileMapHeader::parse(&good[..100], ArchiveKind::Static),
            Err(ArchiveError::Truncated { .. })
        ));

        let mut bytes = good.clone();
        bytes[field::KIND] = ArchiveKind::Dynamic as u8;
        assert!(matches!(
            FileMapHeader::parse(&bytes, ArchiveKind::Static),
            Err(ArchiveError::CorruptedData(_))
        ));

        let mut bytes = good.clone();
        LittleEndian::write_u32(&mut bytes[field::HEADER_SIZE..], DYNAMIC_HEADER_SIZE as u32);
        assert!(matches!(
            FileMapHeader::parse(&bytes, ArchiveKind::Static),
            Err(ArchiveError::HeaderSizeMismatch { .. })
        ));

        let mut bytes = good;
        bytes[field::NARROW_OOP_MODE] = 9;
        assert!(matches!(
            FileMapHeader::parse(&bytes, ArchiveKind::Static),
            Err(ArchiveError::CorruptedData(_))
        ));
    }

    #[test]
    fn crc_covers_everything_after_the_crc_field() {
        let mut header = sample_header(ArchiveKind::Static);
        let crc = header.compute_crc();
        // the CRC field itself is excluded
        header.crc = crc;
        assert_eq!(header.compute_crc(), crc);
        header.jvm_ident[3] ^= 1;
        assert_ne!(header.compute_crc(), crc);
    }

    #[test]
    fn metadata_regions_are_contiguous() {
        let mut header = sample_header(ArchiveKind::Static);
        header.region_mut(RegionKind::Mc).used = 1;
        header.region_mut(RegionKind::Rw).used = 4096;
        header.region_mut(RegionKind::Ro).used = 4097;
        header.region_mut(RegionKind::Md).used = 0;
        assert_eq!(header.non_heap_size(), 4096 + 4096 + 8192);
        assert_eq!(
            header.mapped_top(),
            header.mapped_base_address + (4096 + 4096 + 8192usize)
        );
    }
}
