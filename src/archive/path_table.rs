//! The shared path table: a snapshot of every classpath entry an archived class may come
//! from, stored at the start of the rw region and re-validated at run time.

use super::misc_info::SharedPathsMiscInfo;
use crate::error::{ArchiveError, Result};
use crate::util::conversions::raw_align_up;
use crate::vm::{join_paths, ClassPathEntry, ClassPathResolver};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;
use std::time::UNIX_EPOCH;
use strum_macros::{Display, FromRepr};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum SharedPathKind {
    #[strum(serialize = "dir")]
    Dir = 0,
    #[strum(serialize = "jar")]
    Jar = 1,
    #[strum(serialize = "modules image")]
    ModulesImage = 2,
}

/// Fixed part of a serialized entry: kind, signed, has-manifest, pad, name length,
/// manifest length, timestamp, file size.
const ENTRY_FIXED_SIZE: usize = 4 + 4 + 4 + 8 + 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedPathEntry {
    pub kind: SharedPathKind,
    pub name: String,
    /// Modification time in seconds; 0 if not recorded.
    pub timestamp: i64,
    pub filesize: u64,
    pub manifest: Option<Vec<u8>>,
    pub signed: bool,
}

fn modification_time(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs() as i64)
}

fn is_signed(manifest: &[u8]) -> bool {
    manifest.windows(b"-Digest".len()).any(|w| w == b"-Digest")
}

impl SharedPathEntry {
    /// Snapshot `entry`. Returns `Ok(None)` if the entry does not exist.
    fn create(entry: &ClassPathEntry, is_modules_image: bool) -> Result<Option<Self>> {
        let name = entry.name();
        let Ok(meta) = fs::metadata(&entry.path) else {
            return Ok(None);
        };
        let shared = if meta.is_dir() {
            if !is_empty_dir(&entry.path) {
                return Err(ArchiveError::ClassPathMismatch(format!(
                    "Cannot have non-empty directory in paths: {}",
                    name
                )));
            }
            SharedPathEntry {
                kind: SharedPathKind::Dir,
                name,
                timestamp: 0,
                filesize: 0,
                manifest: None,
                signed: false,
            }
        } else if is_modules_image {
            // The image may be copied around, so only its size is recorded.
            SharedPathEntry {
                kind: SharedPathKind::ModulesImage,
                name,
                timestamp: 0,
                filesize: meta.len(),
                manifest: None,
                signed: false,
            }
        } else {
            let signed = entry.manifest.as_deref().is_some_and(is_signed);
            SharedPathEntry {
                kind: SharedPathKind::Jar,
                name,
                timestamp: modification_time(&meta),
                filesize: meta.len(),
                manifest: entry.manifest.clone(),
                signed,
            }
        };
        debug!("shared path entry: {} ({})", shared.name, shared.kind);
        Ok(Some(shared))
    }

    fn serialized_size(&self) -> usize {
        ENTRY_FIXED_SIZE + self.name.len() + self.manifest.as_ref().map_or(0, |m| m.len())
    }

    /// Check that the entry still describes the same file or directory.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let meta = match fs::metadata(&self.name) {
            Ok(meta) => meta,
            Err(_) => {
                return Err(match self.kind {
                    SharedPathKind::ModulesImage => {
                        format!("Required classpath entry does not exist: {}", self.name)
                    }
                    _ => format!("Classpath entry does not exist: {}", self.name),
                })
            }
        };
        match self.kind {
            SharedPathKind::Dir => {
                if !meta.is_dir() {
                    Err(format!("Expected a directory: {}", self.name))
                } else if !is_empty_dir(Path::new(&self.name)) {
                    Err(format!("directory is not empty: {}", self.name))
                } else {
                    Ok(())
                }
            }
            SharedPathKind::Jar | SharedPathKind::ModulesImage => {
                let timestamp_changed = self.kind == SharedPathKind::Jar
                    && self.timestamp != 0
                    && self.timestamp != modification_time(&meta);
                if meta.is_dir() || meta.len() != self.filesize || timestamp_changed {
                    Err(format!(
                        "A jar file is not the one used while building the shared archive file: {}",
                        self.name
                    ))
                } else {
                    Ok(())
                }
            }
        }
    }
}

fn is_empty_dir(path: &Path) -> bool {
    fs::read_dir(path).is_ok_and(|mut entries| entries.next().is_none())
}

/// The shared path table and the run-time validity of each entry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SharedPathTable {
    entries: Vec<SharedPathEntry>,
    valid: Vec<bool>,
    pub app_class_paths_start_index: u32,
    pub app_module_paths_start_index: u32,
    pub num_module_paths: u32,
}

impl SharedPathTable {
    /// Snapshot the classpaths at dump time and record the auxiliary checks in `misc_info`.
    ///
    /// Boot entries come first (entry 0 being the modules image), then application entries,
    /// then module path entries. A missing boot or module path entry is an error; a missing
    /// application entry is left out and recorded as one that must stay missing.
    pub fn build(resolver: &dyn ClassPathResolver, misc_info: &mut SharedPathsMiscInfo) -> Result<Self> {
        let boot = resolver.boot_class_path();
        let app = resolver.app_class_path();
        let modules = resolver.module_path();

        misc_info.add_boot_classpath(&join_paths(&boot));
        if !app.is_empty() {
            misc_info.add_app_classpath(&join_paths(&app));
        }

        let mut entries = vec![];
        for (i, entry) in boot.iter().enumerate() {
            match SharedPathEntry::create(entry, i == 0)? {
                Some(e) => entries.push(e),
                None => {
                    return Err(ArchiveError::ClassPathMismatch(format!(
                        "Boot classpath entry does not exist: {}",
                        entry.name()
                    )))
                }
            }
        }
        let app_class_paths_start_index = entries.len() as u32;
        for entry in &app {
            match SharedPathEntry::create(entry, false)? {
                Some(e) => entries.push(e),
                None => {
                    info!("Non-existent app classpath entry: {}", entry.name());
                    misc_info.add_nonexist_path(&entry.name());
                }
            }
        }
        let app_module_paths_start_index = entries.len() as u32;
        for entry in &modules {
            match SharedPathEntry::create(entry, false)? {
                Some(e) => entries.push(e),
                None => {
                    return Err(ArchiveError::ClassPathMismatch(format!(
                        "Module path entry does not exist: {}",
                        entry.name()
                    )))
                }
            }
        }
        let num_module_paths = modules.len() as u32;
        let valid = vec![true; entries.len()];
        Ok(SharedPathTable {
            entries,
            valid,
            app_class_paths_start_index,
            app_module_paths_start_index,
            num_module_paths,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, index: usize) -> Option<&SharedPathEntry> {
        self.entries.get(index)
    }

    pub fn entries(&self) -> &[SharedPathEntry] {
        &self.entries
    }

    /// Can classes attributed to entry `index` still be used?
    pub fn is_valid(&self, index: i32) -> bool {
        usize::try_from(index).is_ok_and(|i| self.valid.get(i).copied().unwrap_or(false))
    }

    pub fn is_boot_entry(&self, index: usize) -> bool {
        index < self.app_class_paths_start_index as usize
    }

    /// Size of the serialized table: the sum of the entry sizes plus the count, rounded up
    /// to a multiple of 8.
    pub fn serialized_size(&self) -> usize {
        let bytes: usize = 4 + self.entries.iter().map(|e| e.serialized_size()).sum::<usize>();
        raw_align_up(bytes, 8)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.serialized_size());
        // Writes into a Vec cannot fail.
        let _ = buf.write_u32::<LittleEndian>(self.entries.len() as u32);
        for e in &self.entries {
            buf.push(e.kind as u8);
            buf.push(e.signed as u8);
            buf.push(e.manifest.is_some() as u8);
            buf.push(0);
            let _ = buf.write_u32::<LittleEndian>(e.name.len() as u32);
            let _ = buf.write_u32::<LittleEndian>(e.manifest.as_ref().map_or(0, |m| m.len()) as u32);
            let _ = buf.write_i64::<LittleEndian>(e.timestamp);
            let _ = buf.write_u64::<LittleEndian>(e.filesize);
            buf.extend_from_slice(e.name.as_bytes());
            if let Some(m) = &e.manifest {
                buf.extend_from_slice(m);
            }
        }
        buf.resize(self.serialized_size(), 0);
        buf
    }

    /// Parse a serialized table. The start indices come from the archive header.
    pub fn deserialize(
        bytes: &[u8],
        app_class_paths_start_index: u32,
        app_module_paths_start_index: u32,
        num_module_paths: u32,
    ) -> Result<Self> {
        let corrupted = |_| ArchiveError::CorruptedData("corrupted shared path table");
        let mut cursor = Cursor::new(bytes);
        let count = cursor.read_u32::<LittleEndian>().map_err(corrupted)? as usize;
        let mut entries = Vec::with_capacity(count.min(bytes.len() / ENTRY_FIXED_SIZE));
        for _ in 0..count {
            let mut flags = [0u8; 4];
            cursor.read_exact(&mut flags).map_err(corrupted)?;
            let kind = SharedPathKind::from_repr(flags[0])
                .ok_or(ArchiveError::CorruptedData("unknown shared path kind"))?;
            let name_len = cursor.read_u32::<LittleEndian>().map_err(corrupted)? as usize;
            let manifest_len = cursor.read_u32::<LittleEndian>().map_err(corrupted)? as usize;
            let timestamp = cursor.read_i64::<LittleEndian>().map_err(corrupted)?;
            let filesize = cursor.read_u64::<LittleEndian>().map_err(corrupted)?;
            let pos = cursor.position() as usize;
            if bytes.len() < pos + name_len + manifest_len {
                return Err(ArchiveError::CorruptedData("corrupted shared path table"));
            }
            let name = String::from_utf8_lossy(&bytes[pos..pos + name_len]).into_owned();
            let manifest = (flags[2] != 0)
                .then(|| bytes[pos + name_len..pos + name_len + manifest_len].to_vec());
            cursor.set_position((pos + name_len + manifest_len) as u64);
            entries.push(SharedPathEntry {
                kind,
                name,
                timestamp,
                filesize,
                manifest,
                signed: flags[1] != 0,
            });
        }
        if app_class_paths_start_index > app_module_paths_start_index
            || app_module_paths_start_index as usize > entries.len()
        {
            return Err(ArchiveError::CorruptedData("shared path table indices out of range"));
        }
        let valid = vec![true; entries.len()];
        Ok(SharedPathTable {
            entries,
            valid,
            app_class_paths_start_index,
            app_module_paths_start_index,
            num_module_paths,
        })
    }

    /// Re-check the entries up to `max_used_path_index` against the file system.
    ///
    /// A failing boot entry fails the whole table. A failing application or module path
    /// entry only invalidates that entry. With `print_and_continue`, every failure is
    /// reported before the result is returned.
    pub fn validate(&mut self, max_used_path_index: i32, print_and_continue: bool) -> Result<()> {
        let mut first_failure = None;
        for i in 0..self.entries.len() {
            if i as i64 > max_used_path_index as i64 {
                debug!("skipping unused shared path entry {}: {}", i, self.entries[i].name);
                continue;
            }
            let entry = &self.entries[i];
            match entry.validate() {
                Ok(()) => {
                    if print_and_continue {
                        info!("[{}] ok: {}", i, entry.name);
                    }
                }
                Err(msg) if self.is_boot_entry(i) => {
                    if print_and_continue {
                        error!("[{}] {}", i, msg);
                        first_failure.get_or_insert(msg);
                    } else {
                        return Err(ArchiveError::ClassPathMismatch(msg));
                    }
                }
                Err(msg) => {
                    warn!("[{}] {}. Archived classes from this entry are disabled.", i, msg);
                    self.valid[i] = false;
                }
            }
        }
        match first_failure {
            Some(msg) => Err(ArchiveError::ClassPathMismatch(msg)),
            None => Ok(()),
        }
    }
}
