//! Auxiliary classpath records checked before any region is mapped.
//!
//! The blob is a sequence of records, each a NUL terminated path followed by a
//! little-endian `i32` type, and ends with a bare `i32` 0.

use crate::error::{ArchiveError, Result};
use crate::vm::PATH_SEPARATOR;
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::path::Path;
use strum_macros::{Display, FromRepr};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, FromRepr)]
#[repr(i32)]
pub enum MiscPathType {
    #[strum(serialize = "BOOT")]
    BootPath = 1,
    #[strum(serialize = "NON_EXIST")]
    NonExist = 2,
    #[strum(serialize = "APP")]
    AppPath = 5,
}

const END_MARKER: i32 = 0;

/// The runtime classpaths the recorded ones are checked against.
pub struct RuntimePaths<'a> {
    pub boot_class_path: &'a str,
    pub app_class_path: &'a str,
    /// Whether the archive holds platform or application classes. If it does not, the boot
    /// path check is relaxed to a prefix check.
    pub has_platform_or_app_classes: bool,
}

#[derive(Default)]
pub struct SharedPathsMiscInfo {
    buf: Vec<u8>,
    finished: bool,
}

impl SharedPathsMiscInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a blob read from an archive.
    pub fn from_bytes(buf: Vec<u8>) -> Self {
        SharedPathsMiscInfo {
            buf,
            finished: true,
        }
    }

    fn add_path(&mut self, path: &str, ty: MiscPathType) {
        debug_assert!(!self.finished);
        debug!("misc path info: {} {}", ty, path);
        self.buf.extend_from_slice(path.as_bytes());
        self.buf.push(0);
        // Writing into a Vec cannot fail.
        let _ = self.buf.write_i32::<LittleEndian>(ty as i32);
    }

    pub fn add_boot_classpath(&mut self, path: &str) {
        self.add_path(path, MiscPathType::BootPath);
    }

    pub fn add_app_classpath(&mut self, path: &str) {
        self.add_path(path, MiscPathType::AppPath);
    }

    pub fn add_nonexist_path(&mut self, path: &str) {
        self.add_path(path, MiscPathType::NonExist);
    }

    /// Append the end marker and return the blob.
    pub fn finish(mut self) -> Vec<u8> {
        if !self.finished {
            let _ = self.buf.write_i32::<LittleEndian>(END_MARKER);
        }
        self.buf
    }

    /// Parse the blob into its records.
    pub fn records(&self) -> Result<Vec<(String, MiscPathType)>> {
        let corrupted = || ArchiveError::CorruptedData("corrupted shared path misc info");
        let buf = &self.buf;
        let mut records = vec![];
        let mut pos = 0;
        loop {
            if buf.len() - pos == 4 && LittleEndian::read_i32(&buf[pos..]) == END_MARKER {
                return Ok(records);
            }
            let nul = buf[pos..].iter().position(|b| *b == 0).ok_or_else(corrupted)?;
            let path = String::from_utf8_lossy(&buf[pos..pos + nul]).into_owned();
            pos += nul + 1;
            if buf.len() - pos < 4 {
                return Err(corrupted());
            }
            let ty = MiscPathType::from_repr(LittleEndian::read_i32(&buf[pos..])).ok_or_else(corrupted)?;
            pos += 4;
            records.push((path, ty));
            if pos >= buf.len() {
                return Err(corrupted());
            }
        }
    }

    /// Check every record against the running process. Stops at the first mismatch.
    pub fn check(&self, runtime: &RuntimePaths) -> Result<()> {
        for (path, ty) in self.records()? {
            debug!("checking misc path info: {} {}", ty, path);
            match ty {
                MiscPathType::BootPath => check_boot_path(&path, runtime)?,
                MiscPathType::AppPath => check_app_path(&path, runtime.app_class_path)?,
                MiscPathType::NonExist => {
                    if Path::new(&path).exists() {
                        return Err(ArchiveError::ClassPathMismatch(format!(
                            "File must not exist: {}",
                            path
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Everything after the first entry (the modules image), or `None` if there is nothing else.
fn skip_first_path_entry(path: &str) -> Option<&str> {
    path.split_once(PATH_SEPARATOR)
        .map(|(_, rest)| rest)
        .filter(|rest| !rest.is_empty())
}

fn check_boot_path(dump_time: &str, runtime: &RuntimePaths) -> Result<()> {
    let relaxed = !runtime.has_platform_or_app_classes;
    let dp = skip_first_path_entry(dump_time);
    let rp = skip_first_path_entry(runtime.boot_class_path);
    let matches = match (dp, rp) {
        // both only have the modules image
        (None, None) => true,
        // the run appends to the boot path, which is fine if no app classes are archived
        (None, Some(_)) => relaxed,
        (Some(dp), Some(rp)) => {
            if relaxed {
                rp.starts_with(dp)
            } else {
                rp == dp
            }
        }
        (Some(_), None) => false,
    };
    if matches {
        Ok(())
    } else {
        Err(ArchiveError::ClassPathMismatch(format!(
            "[BOOT classpath mismatch, actual = {}]",
            runtime.boot_class_path
        )))
    }
}

fn check_app_path(dump_time: &str, runtime: &str) -> Result<()> {
    if runtime.len() < dump_time.len() {
        return Err(ArchiveError::ClassPathMismatch(format!(
            "Run time APP classpath is shorter than the one at dump time: {}",
            runtime
        )));
    }
    if !runtime.starts_with(dump_time) {
        return Err(ArchiveError::ClassPathMismatch(format!(
            "[APP classpath mismatch, actual: {}]",
            runtime
        )));
    }
    match runtime[dump_time.len()..].chars().next() {
        None => Ok(()),
        Some(c) if c == PATH_SEPARATOR => Ok(()),
        Some(_) => Err(ArchiveError::ClassPathMismatch(format!(
            "Dump time APP classpath is not a proper prefix of run time APP classpath: {}",
            runtime
        ))),
    }
}
