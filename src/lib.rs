//! A shared class-data archive.
//!
//! Class metadata loaded by the built-in class loaders is dumped once into an archive file,
//! and later runs map that file into their address space instead of parsing the classes
//! again. Optionally, heap objects are archived too: they are mapped into the collector's
//! heap and relocated if the heap moved.
//!
//! * [`archive`] defines the file format, and writes and reads archive files.
//! * [`mapper`] maps a validated archive into the process and relocates the archived heap.
//! * [`classloader`] keeps the per-loader metadata bookkeeping that archived classes are
//!   restored into.
//! * [`SharedSpaces`] ties them together for one process.
//!
//! The host runtime provides the collaborators in [`vm`]: the heap, the classpath, and the
//! facts about the running VM that an archive must agree with.

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;

#[macro_use]
pub mod util;
pub mod archive;
pub mod classloader;
pub mod error;
pub mod mapper;
mod shared_spaces;
pub mod vm;

pub use crate::error::{ArchiveError, Result};
pub use crate::shared_spaces::SharedSpaces;

#[cfg(test)]
mod tests;
