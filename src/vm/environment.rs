use super::encoding::{NarrowKlassEncoding, NarrowOopEncoding, NarrowOopMode};
use crate::util::Address;

/// Facts about the running process that the archive is checked against, other than
/// user-controlled options.
#[derive(Clone, Debug)]
pub struct VMEnvironment {
    /// The full version string of the running VM. Archives record it in truncated and
    /// hashed form and refuse to load into a different build.
    pub vm_version: String,
    /// The live narrow-oop encoding.
    pub narrow_oop: NarrowOopEncoding,
    /// The live narrow-klass encoding.
    pub narrow_klass: NarrowKlassEncoding,
    /// The value of the `java.system.class.loader` property, if set.
    pub system_class_loader_property: Option<String>,
}

impl VMEnvironment {
    /// An environment with unscaled encodings and no system class loader override.
    pub fn new(vm_version: impl Into<String>) -> Self {
        VMEnvironment {
            vm_version: vm_version.into(),
            narrow_oop: NarrowOopEncoding::new(NarrowOopMode::Unscaled, Address::ZERO, 0),
            narrow_klass: NarrowKlassEncoding::new(Address::ZERO, 0),
            system_class_loader_property: None,
        }
    }

    pub fn with_narrow_oop(mut self, encoding: NarrowOopEncoding) -> Self {
        self.narrow_oop = encoding;
        self
    }

    pub fn with_narrow_klass(mut self, encoding: NarrowKlassEncoding) -> Self {
        self.narrow_klass = encoding;
        self
    }

    pub fn with_system_class_loader(mut self, loader: impl Into<String>) -> Self {
        self.system_class_loader_property = Some(loader.into());
        self
    }
}
