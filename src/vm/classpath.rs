use std::path::{Path, PathBuf};

/// The separator between entries of a joined classpath string.
pub const PATH_SEPARATOR: char = ':';

/// One entry of a classpath, as seen by the class loading machinery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassPathEntry {
    /// The file or directory backing the entry.
    pub path: PathBuf,
    /// The raw manifest of a jar, if the resolver extracted one.
    pub manifest: Option<Vec<u8>>,
}

impl ClassPathEntry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ClassPathEntry {
            path: path.into(),
            manifest: None,
        }
    }

    pub fn with_manifest(path: impl Into<PathBuf>, manifest: Vec<u8>) -> Self {
        ClassPathEntry {
            path: path.into(),
            manifest: Some(manifest),
        }
    }

    pub fn name(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }
}

/// Supplies the ordered classpaths of the process.
///
/// The archive snapshots them at dump time and re-checks them at run time. The first boot
/// entry is the runtime modules image.
pub trait ClassPathResolver: Send + Sync {
    fn boot_class_path(&self) -> Vec<ClassPathEntry>;
    fn app_class_path(&self) -> Vec<ClassPathEntry>;
    fn module_path(&self) -> Vec<ClassPathEntry>;

    /// The boot classpath joined with [`PATH_SEPARATOR`].
    fn boot_class_path_string(&self) -> String {
        join_paths(&self.boot_class_path())
    }

    /// The application classpath joined with [`PATH_SEPARATOR`].
    fn app_class_path_string(&self) -> String {
        join_paths(&self.app_class_path())
    }
}

pub(crate) fn join_paths(entries: &[ClassPathEntry]) -> String {
    itertools::join(entries.iter().map(|e| e.name()), &PATH_SEPARATOR.to_string())
}

/// A classpath fixed at construction time.
#[derive(Clone, Debug, Default)]
pub struct StaticClassPath {
    boot: Vec<ClassPathEntry>,
    app: Vec<ClassPathEntry>,
    module: Vec<ClassPathEntry>,
}

impl StaticClassPath {
    /// A classpath whose boot path holds only the modules image.
    pub fn new(modules_image: impl AsRef<Path>) -> Self {
        StaticClassPath {
            boot: vec![ClassPathEntry::new(modules_image.as_ref())],
            ..Default::default()
        }
    }

    pub fn append_boot(mut self, entry: ClassPathEntry) -> Self {
        self.boot.push(entry);
        self
    }

    pub fn append_app(mut self, entry: ClassPathEntry) -> Self {
        self.app.push(entry);
        self
    }

    pub fn append_module(mut self, entry: ClassPathEntry) -> Self {
        self.module.push(entry);
        self
    }
}

impl ClassPathResolver for StaticClassPath {
    fn boot_class_path(&self) -> Vec<ClassPathEntry> {
        self.boot.clone()
    }
    fn app_class_path(&self) -> Vec<ClassPathEntry> {
        self.app.clone()
    }
    fn module_path(&self) -> Vec<ClassPathEntry> {
        self.module.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joined_strings() {
        let cp = StaticClassPath::new("/jdk/lib/modules")
            .append_boot(ClassPathEntry::new("/extra/boot.jar"))
            .append_app(ClassPathEntry::new("/app/a.jar"))
            .append_app(ClassPathEntry::new("/app/b.jar"));
        assert_eq!(cp.boot_class_path_string(), "/jdk/lib/modules:/extra/boot.jar");
        assert_eq!(cp.app_class_path_string(), "/app/a.jar:/app/b.jar");
        assert!(cp.module_path().is_empty());
    }
}
