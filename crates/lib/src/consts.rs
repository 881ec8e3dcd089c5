//! Reserved file names, suffixes and limits shared across the crate.

/// The manifest describing the application and its resources.
pub const CONFIG_FILE: &str = "manifest.txt";

/// Records the version the install should be brought up to.
pub const VERSION_FILE: &str = "version.txt";

/// Lock file held while an update runs in an install directory.
pub const LOCK_FILE: &str = "updating.lock";

/// Records the app version whose UNPACK resources were last unpacked.
pub const UNPACKED_FILE: &str = "unpacked.dat";

/// Appended to a control file name to locate its detached signature.
pub const SIGNATURE_SUFFIX: &str = ".sig";

/// Suffix of a downloaded file awaiting installation.
pub const NEW_SUFFIX: &str = "_new";

/// Suffix of the previous copy while a staged file is moved into place.
pub const OLD_SUFFIX: &str = "_old";

/// Suffix of the marker file recording that a resource has been validated.
pub const VALID_MARKER_SUFFIX: &str = "v";

/// Suffix of the marker tracking the last use of a cached file.
pub const LAST_ACCESSED_SUFFIX: &str = ".lastAccessed";

/// Suffix of the sentinel recording that a native bundle has been unpacked.
pub const UNPACKED_SUFFIX: &str = ".unpacked";

/// Directory (relative to the install dir) holding cached code resources.
pub const CODE_CACHE_DIR: &str = ".cache";

/// Directory (relative to the code cache) holding native bundles.
pub const NATIVE_CACHE_DIR: &str = "native";

/// Maximum number of passes through the update loop before giving up.
pub const MAX_LOOPS: usize = 5;

/// Seconds the verifier waits for any worker event before declaring a stall.
pub const DEFAULT_VERIFY_TIMEOUT_SECS: u64 = 60;

/// Default retention for cached code resources.
pub const DEFAULT_CODE_CACHE_RETENTION_DAYS: u64 = 7;

/// Default directory (relative to the install dir) for a downloaded runtime.
pub const DEFAULT_RUNTIME_DIR: &str = "runtime";

/// File inside the runtime directory describing its version.
pub const RUNTIME_RELEASE_FILE: &str = "release";
