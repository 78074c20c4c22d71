//! The archive file: its on-disk format, and how it is written at dump time and read and
//! validated at run time.
//!
//! A file is laid out as
//!
//! ```text
//! header | misc info | base archive name | mc | rw | ro | md | heap regions | oopmaps
//! ```
//!
//! with every region starting on an allocation-granularity boundary so it can be mapped
//! directly. The base archive name is only present in dynamic archives.

pub mod catalog;
pub mod dump;
pub mod format;
pub mod ident;
pub mod misc_info;
pub mod path_table;
pub mod reader;
pub mod writer;

pub use self::catalog::CatalogEntry;
pub use self::dump::{dump_dynamic_archive, dump_static_archive, ArchivedHeapSnapshot, DumpContext};
pub use self::format::{ArchiveKind, FileMapHeader, RegionKind};
pub use self::reader::FileMapInfo;
pub use self::writer::{ArchivedHeapRange, FileMapWriter};
