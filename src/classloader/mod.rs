//! Per-class-loader metadata bookkeeping: the metaspace, the [`ClassLoaderData`] of each
//! loader, and the [`ClassLoaderDataGraph`] that registers them all.

mod cld;
mod graph;
mod handles;
pub mod metaspace;

pub use self::cld::{ClassLoaderData, Klass, ModuleEntry, PackageEntry};
pub use self::graph::ClassLoaderDataGraph;
pub use self::handles::{ChunkedHandleList, OopHandle};
pub use self::metaspace::{ClassLoaderMetaspace, Metaspace};

use strum_macros::{Display, FromRepr};

/// Which loader a class loader data belongs to. Only the built-in loaders have classes in
/// the archive.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display, FromRepr)]
#[repr(u8)]
pub enum LoaderKind {
    #[strum(serialize = "boot")]
    Boot = 0,
    #[strum(serialize = "platform")]
    Platform = 1,
    #[strum(serialize = "app")]
    App = 2,
    #[strum(serialize = "custom")]
    Custom = 3,
}

impl LoaderKind {
    pub fn is_builtin(self) -> bool {
        self != LoaderKind::Custom
    }
}

/// The stable index of a class loader data in the graph's arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CldIndex(pub usize);

impl CldIndex {
    /// The boot loader's data is always created first.
    pub const BOOT: CldIndex = CldIndex(0);
}

impl std::fmt::Display for CldIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cld#{}", self.0)
    }
}
