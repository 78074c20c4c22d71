//! Interfaces to the collaborators of the archive: the garbage-collected heap, the classpath
//! resolver, and the facts about the running VM.

mod classpath;
mod encoding;
mod environment;
mod heap;

pub use self::classpath::{ClassPathEntry, ClassPathResolver, StaticClassPath, PATH_SEPARATOR};
pub(crate) use self::classpath::join_paths;
pub use self::encoding::{NarrowKlassEncoding, NarrowOopEncoding, NarrowOopMode};
pub use self::environment::VMEnvironment;
pub use self::heap::{ArchiveHeap, NoArchiveHeap};
