//! Error types for the shared archive.
//!
//! Two tiers of failure exist. Recoverable failures are values of [`ArchiveError`]: the
//! archive cannot be used, the caller disables sharing and loads classes from source.
//! Fatal failures go through [`fail_stop`], which never returns.

use crate::archive::format::RegionKind;
use crate::util::Address;
use std::path::PathBuf;
use thiserror::Error;

/// A classified reason why an archive (or part of it) cannot be used.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// The archive file could not be opened or read.
    #[error("Unable to access shared archive {path}: {source}")]
    Io {
        /// The archive path.
        path: PathBuf,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The file ended before a structure that the header says is there.
    #[error("The shared archive file has been truncated: {what}")]
    Truncated {
        /// What could not be read in full.
        what: &'static str,
    },

    /// Wrong magic number for the variant being opened.
    #[error("The shared archive file has a bad magic number: expected {expected:#010x}, actual {actual:#010x}")]
    BadMagic {
        /// The magic number of the expected variant.
        expected: u32,
        /// The magic number found in the file.
        actual: u32,
    },

    /// The format version does not match exactly.
    #[error("The shared archive file has the wrong version: expected {expected}, actual {actual}")]
    WrongVersion {
        /// The version this build reads and writes.
        expected: u32,
        /// The version found in the file.
        actual: u32,
    },

    /// The header declares a size different from the one of its variant.
    #[error("The shared archive file has an incorrect header size: expected {expected}, actual {actual}")]
    HeaderSizeMismatch {
        /// The size of the expected variant.
        expected: u32,
        /// The size found in the file.
        actual: u32,
    },

    /// The stored identity string is not NUL terminated.
    #[error("JVM version identifier is corrupted")]
    CorruptedIdent,

    /// The archive was created by a different build.
    #[error("The shared archive file was created by a different version or build: expected {expected:?}, actual {actual:?}")]
    IdentMismatch {
        /// The identity computed for the running process.
        expected: String,
        /// The identity stored in the archive.
        actual: String,
    },

    /// Header checksum verification failed.
    #[error("Header checksum verification failed: expected {expected:#010x}, actual {actual:#010x}")]
    HeaderCrcMismatch {
        /// The CRC recomputed over the header bytes.
        expected: u32,
        /// The CRC stored in the header.
        actual: u32,
    },

    /// A region's payload does not match its recorded CRC.
    #[error("Checksum verification failed for region {region}: expected {expected:#010x}, actual {actual:#010x}")]
    RegionCrcMismatch {
        /// The region that failed.
        region: RegionKind,
        /// The CRC recorded in the header.
        expected: u32,
        /// The CRC of the mapped bytes.
        actual: u32,
    },

    /// The object alignment differs from the running process.
    #[error("The shared archive file's ObjectAlignmentInBytes of {archive} does not equal the current ObjectAlignmentInBytes of {current}")]
    ObjectAlignmentMismatch {
        /// The alignment recorded in the archive.
        archive: u32,
        /// The alignment of the running process.
        current: u32,
    },

    /// The compact strings setting differs from the running process.
    #[error("The shared archive file's CompactStrings setting ({archive}) does not equal the current CompactStrings setting ({current})")]
    CompactStringsMismatch {
        /// The setting recorded in the archive.
        archive: bool,
        /// The setting of the running process.
        current: bool,
    },

    /// The run asks for stricter bytecode verification than the dump used.
    #[error("The shared archive file was created with less restrictive verification setting than the current setting")]
    VerificationLessStrict,

    /// The archive was dumped with a Java agent but the run does not allow it.
    #[error("The setting of AllowArchivingWithJavaAgent is different from the setting in the shared archive")]
    JavaAgentMismatch,

    /// A recorded classpath no longer matches the running process.
    #[error("Classpath mismatch: {0}")]
    ClassPathMismatch(String),

    /// The shared path table or another serialized structure does not parse.
    #[error("Corrupted archive data: {0}")]
    CorruptedData(&'static str),

    /// The address range for the non-heap regions could not be reserved at the hint.
    #[error("Unable to reserve shared space at required address {requested} ({size} bytes): {reason}")]
    ReserveFailed {
        /// The address the archive was dumped for.
        requested: Address,
        /// The size of the reservation.
        size: usize,
        /// Why the reservation failed.
        reason: String,
    },

    /// A region could not be mapped at its required address.
    #[error("Unable to map {region} shared space at required address {addr}: {reason}")]
    MapFailed {
        /// The region that failed.
        region: RegionKind,
        /// The required address.
        addr: Address,
        /// Why the mapping failed.
        reason: String,
    },

    /// The collector refused or could not provide the heap ranges for the archived heap.
    #[error("Unable to map archived heap data: {0}")]
    HeapUnavailable(String),

    /// An address could not be expressed in a compressed-pointer encoding.
    #[error("Address {addr} cannot be encoded with base {base} and shift {shift}")]
    EncodingOverflow {
        /// The address that does not fit.
        addr: Address,
        /// The encoding base.
        base: Address,
        /// The encoding shift.
        shift: u8,
    },

    /// A dynamic archive does not belong to the mapped base archive.
    #[error("Dynamic archive cannot be used: {0}")]
    BaseArchiveMismatch(String),

    /// The metaspace reservation is exhausted.
    #[error("Metaspace exhausted while allocating {requested} bytes")]
    MetaspaceExhausted {
        /// The size of the failed request.
        requested: usize,
    },
}

/// The result type for archive operations.
pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Report an unrecoverable error and terminate.
///
/// This is used at dump time, where there is no fallback, and at run time when sharing is
/// mandatory. It runs before any managed exception machinery exists, so the only thing it
/// can do is report and stop.
pub fn fail_stop(msg: impl std::fmt::Display) -> ! {
    error!("An error has occurred while processing the shared archive file.");
    error!("{}", msg);
    panic!("Unrecoverable shared archive error: {}", msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_mismatch() {
        let err = ArchiveError::ObjectAlignmentMismatch {
            archive: 16,
            current: 8,
        };
        let msg = err.to_string();
        assert!(msg.contains("ObjectAlignmentInBytes of 16"));
        assert!(msg.contains("current ObjectAlignmentInBytes of 8"));

        let err = ArchiveError::BadMagic {
            expected: 0xf00baba2,
            actual: 0,
        };
        assert!(err.to_string().contains("0xf00baba2"));
    }

    #[test]
    #[should_panic(expected = "Unrecoverable shared archive error: boom")]
    fn fail_stop_panics() {
        fail_stop("boom");
    }
}
