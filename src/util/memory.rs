//! Thin wrappers over the OS virtual-memory calls used by the mapper and the metaspace.
//!
//! Everything here works on page-aligned ranges. None of these functions retry at a
//! different address: callers that need an exact placement compare the returned address
//! against the requested one and treat a difference as failure.

use crate::util::Address;
use std::fs::File;
use std::io::{Error, ErrorKind, Result};
use std::os::unix::io::AsRawFd;

/// The protection flags for a mapping.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MmapProtection {
    /// Allow read only
    ReadOnly,
    /// Allow read + write
    ReadWrite,
    /// Allow read + write + code execution
    ReadWriteExec,
    /// Allow read + code execution
    ReadExec,
    /// Do not allow any access
    NoAccess,
}

impl MmapProtection {
    /// The protection for a region given its read-only and executable flags.
    pub fn for_region(read_only: bool, allow_exec: bool) -> Self {
        match (read_only, allow_exec) {
            (true, false) => Self::ReadOnly,
            (true, true) => Self::ReadExec,
            (false, false) => Self::ReadWrite,
            (false, true) => Self::ReadWriteExec,
        }
    }

    fn into_native_flags(self) -> libc::c_int {
        use libc::{PROT_EXEC, PROT_NONE, PROT_READ, PROT_WRITE};
        match self {
            Self::ReadOnly => PROT_READ,
            Self::ReadWrite => PROT_READ | PROT_WRITE,
            Self::ReadWriteExec => PROT_READ | PROT_WRITE | PROT_EXEC,
            Self::ReadExec => PROT_READ | PROT_EXEC,
            Self::NoAccess => PROT_NONE,
        }
    }
}

/// Annotation for an mmap entry. This is for debugging only: on Linux we name the
/// mapping with `prctl(PR_SET_VMA)`, elsewhere it is ignored.
pub enum MmapAnnotation<'a> {
    /// The reservation that holds the non-heap archive regions.
    SharedSpace,
    /// One mapped archive region.
    Region {
        /// The name of the region.
        name: &'a str,
    },
    /// The metaspace reservation or one of its chunks.
    Metaspace,
    /// The mmap is for a test case.
    Test {
        /// The source file.
        file: &'a str,
        /// The line number.
        line: u32,
    },
}

/// Construct an `MmapAnnotation::Test` with the current file name and line number.
#[macro_export]
macro_rules! mmap_anno_test {
    () => {
        &$crate::util::memory::MmapAnnotation::Test {
            file: file!(),
            line: line!(),
        }
    };
}

impl std::fmt::Display for MmapAnnotation<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MmapAnnotation::SharedSpace => write!(f, "cds:shared-space"),
            MmapAnnotation::Region { name } => write!(f, "cds:region:{name}"),
            MmapAnnotation::Metaspace => write!(f, "cds:metaspace"),
            MmapAnnotation::Test { file, line } => write!(f, "cds:test:{file}:{line}"),
        }
    }
}

lazy_static! {
    static ref ALLOCATION_GRANULARITY: usize = {
        // SAFETY: sysconf has no preconditions.
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page <= 0 {
            crate::util::constants::BYTES_IN_PAGE
        } else {
            page as usize
        }
    };
}

/// The OS allocation granularity. Archive regions are aligned to this in the file so that
/// each region can be mapped directly.
pub fn allocation_granularity() -> usize {
    *ALLOCATION_GRANULARITY
}

/// Reserve `size` bytes of address space with no access, preferably at `hint`.
///
/// The kernel may place the reservation elsewhere; the returned address is where it
/// actually is. Callers that need `hint` exactly must check and release on mismatch.
pub fn reserve(hint: Option<Address>, size: usize, annotation: &MmapAnnotation) -> Result<Address> {
    let addr = hint.unwrap_or(Address::ZERO);
    let flags = libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_NORESERVE;
    let ret = unsafe {
        libc::mmap(
            addr.to_mut_ptr(),
            size,
            MmapProtection::NoAccess.into_native_flags(),
            flags,
            -1,
            0,
        )
    };
    if ret == libc::MAP_FAILED {
        return Err(Error::last_os_error());
    }
    let start = Address::from_mut_ptr(ret);
    set_vma_name(start, size, annotation);
    Ok(start)
}

/// Reserve `size` bytes exactly at `start`. Fails instead of placing the range elsewhere.
pub fn reserve_at(start: Address, size: usize, annotation: &MmapAnnotation) -> Result<Address> {
    let actual = reserve(Some(start), size, annotation)?;
    if actual != start {
        // Best effort: the range is ours, and we are reporting the real error anyway.
        let _ = munmap(actual, size);
        return Err(Error::new(
            ErrorKind::AddrInUse,
            format!("requested {start}, kernel placed the reservation at {actual}"),
        ));
    }
    Ok(actual)
}

/// Demand-zero mmap over a range this process already owns.
/// This function guarantees to zero all mapped memory.
pub fn dzmmap(start: Address, size: usize, prot: MmapProtection, annotation: &MmapAnnotation) -> Result<()> {
    let flags = libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_FIXED;
    mmap_fixed(start, size, prot.into_native_flags(), flags, -1, 0)?;
    set_vma_name(start, size, annotation);
    Ok(())
}

/// Map `size` bytes of `file` starting at `file_offset` to exactly `start`, replacing
/// whatever this process had there (a reservation, or heap memory handed to us).
///
/// The mapping is private: writes (such as oop patching) never reach the file.
pub fn map_file_at(
    file: &File,
    file_offset: u64,
    start: Address,
    size: usize,
    prot: MmapProtection,
    annotation: &MmapAnnotation,
) -> Result<Address> {
    let offset = libc::off_t::try_from(file_offset)
        .map_err(|_| Error::new(ErrorKind::InvalidInput, "file offset out of range"))?;
    let flags = libc::MAP_PRIVATE | libc::MAP_FIXED;
    mmap_fixed(start, size, prot.into_native_flags(), flags, file.as_raw_fd(), offset)?;
    set_vma_name(start, size, annotation);
    Ok(start)
}

fn mmap_fixed(
    start: Address,
    size: usize,
    prot: libc::c_int,
    flags: libc::c_int,
    fd: libc::c_int,
    offset: libc::off_t,
) -> Result<()> {
    let ptr = start.to_mut_ptr();
    wrap_libc_call(
        &|| unsafe { libc::mmap(start.to_mut_ptr(), size, prot, flags, fd, offset) },
        ptr,
    )
}

/// Unmap a memory region.
pub fn munmap(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(&|| unsafe { libc::munmap(start.to_mut_ptr(), size) }, 0)
}

/// Give a range back to the OS but keep the address space reserved (no access).
pub fn uncommit(start: Address, size: usize) -> Result<()> {
    let flags = libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_FIXED | libc::MAP_NORESERVE;
    mmap_fixed(
        start,
        size,
        MmapProtection::NoAccess.into_native_flags(),
        flags,
        -1,
        0,
    )
}

/// Change the protection of a memory region.
pub fn mprotect(start: Address, size: usize, prot: MmapProtection) -> Result<()> {
    wrap_libc_call(
        &|| unsafe { libc::mprotect(start.to_mut_ptr(), size, prot.into_native_flags()) },
        0,
    )
}

fn wrap_libc_call<T: PartialEq>(f: &dyn Fn() -> T, expect: T) -> Result<()> {
    let ret = f();
    if ret == expect {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(target_os = "linux")]
fn set_vma_name(start: Address, size: usize, annotation: &MmapAnnotation) {
    // `PR_SET_VMA` is new in Linux 5.17. Older kernels return `EINVAL`, which is fine: the
    // name is for debugging only, so we log the error instead of failing.
    let Ok(anno_cstr) = std::ffi::CString::new(annotation.to_string()) else {
        return;
    };
    let result = wrap_libc_call(
        &|| unsafe {
            libc::prctl(
                libc::PR_SET_VMA,
                libc::PR_SET_VMA_ANON_NAME,
                start.to_ptr::<libc::c_void>(),
                size,
                anno_cstr.as_ptr(),
            )
        },
        0,
    );
    if let Err(e) = result {
        trace!("Error while calling prctl: {e}");
    }
}

#[cfg(not(target_os = "linux"))]
fn set_vma_name(_start: Address, _size: usize, _annotation: &MmapAnnotation) {}

/// Get the memory maps for the process. The returned string is a multi-line string.
/// This is only meant to be used for debugging, e.g. after a mapping could not be placed.
#[cfg(target_os = "linux")]
pub fn get_process_memory_maps() -> Result<String> {
    std::fs::read_to_string("/proc/self/maps")
}

#[cfg(not(target_os = "linux"))]
pub fn get_process_memory_maps() -> Result<String> {
    Ok(String::from("(process memory maps are only available on Linux)"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::{probe_free_range, serial_test};
    use std::io::Write;

    #[test]
    fn reserve_anywhere_and_commit() {
        let page = allocation_granularity();
        let start = reserve(None, page * 4, mmap_anno_test!()).unwrap();
        assert!(start.is_aligned_to(page));
        dzmmap(start, page, MmapProtection::ReadWrite, mmap_anno_test!()).unwrap();
        unsafe {
            assert_eq!(start.load::<u64>(), 0);
            start.store(42u64);
            assert_eq!(start.load::<u64>(), 42);
        }
        munmap(start, page * 4).unwrap();
    }

    #[test]
    fn reserve_at_exact_address() {
        serial_test(|| {
            let page = allocation_granularity();
            let hint = probe_free_range(page * 2);
            let start = reserve_at(hint, page * 2, mmap_anno_test!()).unwrap();
            assert_eq!(start, hint);
            munmap(start, page * 2).unwrap();
        })
    }

    #[test]
    fn map_file_into_reservation() {
        serial_test(|| {
            let page = allocation_granularity();
            let mut file = tempfile::tempfile().unwrap();
            let mut contents = vec![0u8; page * 2];
            contents[page] = 0xab;
            contents[page + 1] = 0xcd;
            file.write_all(&contents).unwrap();

            let start = reserve(None, page * 2, mmap_anno_test!()).unwrap();
            let mapped = map_file_at(
                &file,
                page as u64,
                start,
                page,
                MmapProtection::ReadWrite,
                mmap_anno_test!(),
            )
            .unwrap();
            assert_eq!(mapped, start);
            unsafe {
                assert_eq!(start.load::<u8>(), 0xab);
                assert_eq!((start + 1usize).load::<u8>(), 0xcd);
                // private mapping: the write is not visible in the file
                start.store(0u8);
            }
            munmap(start, page * 2).unwrap();
        })
    }

    #[test]
    fn uncommit_keeps_reservation() {
        let page = allocation_granularity();
        let start = reserve(None, page, mmap_anno_test!()).unwrap();
        dzmmap(start, page, MmapProtection::ReadWrite, mmap_anno_test!()).unwrap();
        unsafe { start.store(7u32) };
        uncommit(start, page).unwrap();
        // recommit gives zeroed memory again
        dzmmap(start, page, MmapProtection::ReadWrite, mmap_anno_test!()).unwrap();
        assert_eq!(unsafe { start.load::<u32>() }, 0);
        munmap(start, page).unwrap();
    }

    #[test]
    fn protection_for_region() {
        assert_eq!(MmapProtection::for_region(true, false), MmapProtection::ReadOnly);
        assert_eq!(MmapProtection::for_region(false, true), MmapProtection::ReadWriteExec);
    }
}
