//! Utilities shared by the archive, the mapper and the class loader data graph.

/// Address and object reference types.
pub mod address;
/// The oopmap bitmap.
pub mod bitmap;
/// Size constants.
pub mod constants;
/// Alignment and size conversions.
pub mod conversions;
/// The built-in logger.
pub mod logger;
/// OS virtual-memory wrappers.
#[macro_use]
pub mod memory;
/// Options and their environment overrides.
pub mod options;
/// The safepoint protocol.
pub mod safepoint;

#[cfg(test)]
pub mod test_util;

pub use self::address::Address;
pub use self::address::ByteSize;
pub use self::address::MemRange;
pub use self::address::ObjectReference;
pub use self::bitmap::BitMap;
