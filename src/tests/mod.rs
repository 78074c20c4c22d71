// End-to-end scenarios: dump an archive into a temporary directory, then map it into a fresh
// `SharedSpaces` the way a later run of the process would.
//
// Every scenario maps at an address probed just before, so they all run under `serial_test`.

mod scenario_prelude {
    pub use crate::archive::format::{field, ArchiveKind, RegionKind};
    pub use crate::archive::{FileMapHeader, FileMapInfo};
    pub use crate::classloader::LoaderKind;
    pub use crate::error::ArchiveError;
    pub use crate::util::test_util::fixtures::*;
    pub use crate::util::test_util::mock_heap::MockHeap;
    pub use crate::util::test_util::serial_test;
    pub use crate::util::{Address, MemRange};
    pub use crate::vm::{ArchiveHeap, NoArchiveHeap};
    pub use crate::SharedSpaces;
    pub use std::sync::Arc;

    /// Overwrite `bytes` at `offset` of the file at `path`.
    pub fn patch_file(path: &std::path::Path, offset: u64, bytes: &[u8]) {
        use std::io::{Seek, SeekFrom, Write};
        let mut file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.write_all(bytes).unwrap();
    }

    /// Open the static archive of `fx` the way `SharedSpaces::initialize` does.
    pub fn open_static(fx: &ArchiveFixture) -> crate::Result<FileMapInfo> {
        FileMapInfo::open(&fx.static_archive(), ArchiveKind::Static, &fx.env(), &fx.options())
    }
}

mod scenario_dynamic_archive;
mod scenario_region_checksum;
