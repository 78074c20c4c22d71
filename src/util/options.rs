use crate::util::constants::{BYTES_IN_KBYTE, BYTES_IN_MBYTE, BYTES_IN_PAGE};
use crate::util::conversions::raw_is_aligned;
use std::default::Default;

/// The default address at which the non-heap regions of a static archive are laid out at
/// dump time, and therefore the address at which they must be mapped at run time.
#[cfg(target_pointer_width = "64")]
pub const DEFAULT_SHARED_BASE_ADDRESS: usize = 0x8_0000_0000;
#[cfg(target_pointer_width = "32")]
pub const DEFAULT_SHARED_BASE_ADDRESS: usize = 0x3800_0000;

/// The default size of the address range reserved for class metadata.
pub const DEFAULT_METASPACE_RESERVE_SIZE: usize = 64 * BYTES_IN_MBYTE;
/// The default size of the chunks a class loader's arena draws from the metaspace.
pub const DEFAULT_METASPACE_CHUNK_SIZE: usize = 64 * BYTES_IN_KBYTE;
/// The default maximum heap size recorded in dumped archives.
pub const DEFAULT_MAX_HEAP_SIZE: usize = 128 * BYTES_IN_MBYTE;

/// The prefix of environment variables that override option defaults.
pub const ENV_PREFIX: &str = "CDS_";

fn always_valid<T>(_: &T) -> bool {
    true
}

fn page_aligned_nonzero(v: &usize) -> bool {
    *v > 0 && raw_is_aligned(*v, BYTES_IN_PAGE)
}

fn valid_object_alignment(v: &usize) -> bool {
    v.is_power_of_two() && (8..=256).contains(v)
}

macro_rules! options {
    ($($(#[$outer:meta])* $name:ident: $type:ty[$validator:expr] = $default:expr),*,) => [
        options!($($(#[$outer])* $name: $type[$validator] = $default),*);
    ];
    ($($(#[$outer:meta])* $name:ident: $type:ty[$validator:expr] = $default:expr),*) => [
        /// Flags that control how archives are dumped and whether (and how strictly) they are used.
        #[derive(Clone, Debug)]
        pub struct Options {
            $($(#[$outer])* pub $name: $type),*
        }
        impl Options {
            /// Set an option from a string. Returns `false` (and keeps the old value) if the key is
            /// unknown, the value cannot be parsed, or the value fails validation.
            pub fn set_from_str(&mut self, s: &str, val: &str) -> bool {
                match s {
                    // Parse the given value from str (by env vars or by calling set_from_str()) to the right type
                    $(stringify!($name) => if let Ok(ref val) = val.parse::<$type>() {
                        // Validate
                        let validate_fn = $validator;
                        let is_valid = validate_fn(val);
                        if is_valid {
                            // Only set value if valid.
                            self.$name = val.clone();
                        } else {
                            warn!("Unable to set {}={:?}. Invalid value. Default value will be used.", s, val);
                        }
                        is_valid
                    } else {
                        warn!("Unable to set {}={:?}. Cant parse value. Default value will be used.", s, val);
                        false
                    })*
                    _ => {
                        warn!("Unknown option {}", s);
                        false
                    }
                }
            }

            /// Options with their built-in defaults, ignoring the environment.
            pub fn builtin_defaults() -> Self {
                Options {
                    $($name: $default),*
                }
            }
        }
        impl Default for Options {
            fn default() -> Self {
                let mut options = Options::builtin_defaults();

                // If we have env vars that start with CDS_ and match any option (such as CDS_VERIFY_SHARED_SPACES),
                // we set the option to its value (if it is a valid value). Otherwise, use the default value.
                for (key, val) in std::env::vars() {
                    // strip the prefix, and get the lower case string
                    if let Some(rest_of_key) = key.strip_prefix(ENV_PREFIX) {
                        let lowercase: &str = &rest_of_key.to_lowercase();
                        match lowercase {
                            $(stringify!($name) => { options.set_from_str(lowercase, &val); },)*
                            _ => {}
                        }
                    }
                }
                options
            }
        }
    ]
}

options! {
    /// Try to map a shared archive at start-up.
    use_shared_spaces:               bool   [always_valid] = true,
    /// Sharing is mandatory: any failure to use the archive terminates the process.
    require_shared_spaces:           bool   [always_valid] = false,
    /// Verify the header CRC and every region CRC when mapping.
    verify_shared_spaces:            bool   [always_valid] = false,
    /// Diagnostic mode: report every invalid classpath entry instead of stopping at the first.
    print_shared_archive_and_exit:   bool   [always_valid] = false,
    /// Path of the static (base) archive.
    shared_archive_file:             String [|v: &String| !v.is_empty()] = String::from("classes.jsa"),
    /// Path of the dynamic (top-layer) archive. Empty means no dynamic archive.
    dynamic_archive_file:            String [always_valid] = String::new(),
    /// Where the non-heap regions are laid out at dump time.
    shared_base_address:             usize  [page_aligned_nonzero] = DEFAULT_SHARED_BASE_ADDRESS,
    /// Object alignment of the running process; must match the archive.
    object_alignment_in_bytes:       usize  [valid_object_alignment] = 8,
    /// Compact strings setting of the running process; must match the archive.
    compact_strings:                 bool   [always_valid] = true,
    /// Verify classes loaded by the boot loader.
    bytecode_verification_local:     bool   [always_valid] = false,
    /// Verify classes loaded by other loaders.
    bytecode_verification_remote:    bool   [always_valid] = true,
    /// Allow dumping while a Java agent is attached (testing only).
    allow_archiving_with_java_agent: bool   [always_valid] = false,
    /// The maximum heap size, recorded in the archive header.
    max_heap_size:                   usize  [|v: &usize| *v > 0] = DEFAULT_MAX_HEAP_SIZE,
    /// Size of the address range reserved for class metadata.
    metaspace_reserve_size:          usize  [page_aligned_nonzero] = DEFAULT_METASPACE_RESERVE_SIZE,
    /// Size of a metaspace chunk.
    metaspace_chunk_size:            usize  [page_aligned_nonzero] = DEFAULT_METASPACE_CHUNK_SIZE,
    /// Number of threads used by parallel class-loader-data root walks.
    root_walk_threads:               usize  [|v: &usize| *v > 0] = num_cpus::get(),
}

impl Options {
    /// The dynamic archive path, if one is configured.
    pub fn dynamic_archive(&self) -> Option<&str> {
        if self.dynamic_archive_file.is_empty() {
            None
        } else {
            Some(&self.dynamic_archive_file)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_env_var() {
        let options = Options::builtin_defaults();
        assert!(options.use_shared_spaces);
        assert!(!options.require_shared_spaces);
        assert_eq!(options.object_alignment_in_bytes, 8);
        assert_eq!(options.shared_base_address, DEFAULT_SHARED_BASE_ADDRESS);
        assert_eq!(options.dynamic_archive(), None);
    }

    #[test]
    fn set_valid_values() {
        let mut options = Options::builtin_defaults();
        assert!(options.set_from_str("verify_shared_spaces", "true"));
        assert!(options.verify_shared_spaces);
        assert!(options.set_from_str("object_alignment_in_bytes", "16"));
        assert_eq!(options.object_alignment_in_bytes, 16);
        assert!(options.set_from_str("dynamic_archive_file", "top.jsa"));
        assert_eq!(options.dynamic_archive(), Some("top.jsa"));
    }

    #[test]
    fn reject_invalid_values() {
        let mut options = Options::builtin_defaults();
        // not a power of two
        assert!(!options.set_from_str("object_alignment_in_bytes", "12"));
        assert_eq!(options.object_alignment_in_bytes, 8);
        // not page aligned
        assert!(!options.set_from_str("shared_base_address", "4097"));
        assert_eq!(options.shared_base_address, DEFAULT_SHARED_BASE_ADDRESS);
        // cannot parse
        assert!(!options.set_from_str("require_shared_spaces", "maybe"));
        assert!(!options.require_shared_spaces);
        // unknown key
        assert!(!options.set_from_str("no_such_option", "1"));
    }

    #[test]
    fn with_env_var() {
        crate::util::test_util::serial_test(|| {
            std::env::set_var("CDS_VERIFY_SHARED_SPACES", "true");
            std::env::set_var("CDS_ROOT_WALK_THREADS", "0");
            let options = Options::default();
            std::env::remove_var("CDS_VERIFY_SHARED_SPACES");
            std::env::remove_var("CDS_ROOT_WALK_THREADS");
            assert!(options.verify_shared_spaces);
            // 0 fails validation, so the default stays.
            assert_eq!(options.root_walk_threads, num_cpus::get());
        })
    }
}
