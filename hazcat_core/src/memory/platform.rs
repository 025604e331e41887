//! Platform paths for hazcat shared memory segments.
//!
//! All segments (allocators and message queues) live as files in a single
//! flat directory so every cooperating process resolves the same names:
//! - Linux: `/dev/shm/hazcat` (tmpfs - RAM-backed)
//! - other Unix: `/tmp/hazcat`
//! - override: `HAZCAT_SHM_DIR` environment variable

use std::path::PathBuf;

/// Maximum length of a segment file name. Kept below typical NAME_MAX (255)
/// with headroom for the directory prefix.
pub const SHM_NAME_MAX: usize = 250;

/// Base directory for all hazcat shared memory segments.
pub fn shm_base_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("HAZCAT_SHM_DIR") {
        return PathBuf::from(dir);
    }

    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/dev/shm/hazcat")
    }

    #[cfg(not(target_os = "linux"))]
    {
        std::env::temp_dir().join("hazcat")
    }
}

/// Full path for a named segment inside the hazcat shm directory.
pub fn segment_path(name: &str) -> PathBuf {
    shm_base_dir().join(name)
}
