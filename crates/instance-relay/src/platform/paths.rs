//! Platform-specific locations of the relay's named OS objects.
//!
//! Lock files and Unix socket endpoints live in a per-user runtime directory so
//! that object names stay private to the user/session boundary. Shared-memory ids
//! and named pipes live in OS namespaces and only need their names adjusted.

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use std::path::{Path, PathBuf};

/// Get the default directory for lock files and socket endpoints.
///
/// # Platform Behavior
/// - **Linux**: `$XDG_RUNTIME_DIR` (per-user, mode 0700)
/// - **Windows / macOS**: `{temp}/instance-relay` (no per-user runtime dir is defined)
pub fn default_runtime_dir() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(|| std::env::temp_dir().join(RelayConfig::FALLBACK_DIR_NAME))
}

/// Create the runtime directory if it doesn't exist yet.
///
/// A freshly created directory is made owner-only.
pub fn ensure_runtime_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    std::fs::create_dir_all(dir).map_err(|e| RelayError::Io {
        message: format!("Failed to create runtime directory: {}", dir.display()),
        path: Some(dir.to_path_buf()),
        source: Some(e),
    })?;
    super::permissions::set_private_dir(dir)
}

/// Get the path of the file backing a named lock.
///
/// Returns `{dir}/{name}.lock`.
pub fn lock_file_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.{}", name, RelayConfig::LOCK_FILE_EXTENSION))
}

/// Get the endpoint of a named stream channel.
///
/// # Platform Behavior
/// - **Linux/macOS**: `{dir}/{name}` (Unix domain socket)
/// - **Windows**: `\\.\pipe\{name}` (the directory is not used)
pub fn channel_endpoint(dir: &Path, name: &str) -> PathBuf {
    #[cfg(unix)]
    {
        dir.join(name)
    }
    #[cfg(windows)]
    {
        let _ = dir;
        PathBuf::from(format!(r"\\.\pipe\{}", name))
    }
}

/// Get the OS id of a named shared-memory mapping.
///
/// # Platform Behavior
/// - **Linux/macOS**: `/{name}` (POSIX `shm_open` namespace)
/// - **Windows**: `{name}` (session-local file mapping namespace)
pub fn shm_os_id(name: &str) -> String {
    #[cfg(unix)]
    {
        format!("/{}", name)
    }
    #[cfg(not(unix))]
    {
        name.to_string()
    }
}

/// Longest shared-memory id the OS accepts.
///
/// # Platform Behavior
/// - **Linux**: `NAME_MAX` of the `/dev/shm` entry
/// - **macOS**: `PSHMNAMLEN`
/// - **Windows**: `MAX_PATH`
#[cfg(target_os = "macos")]
pub const MAX_SHM_ID_LEN: usize = 31;
#[cfg(all(unix, not(target_os = "macos")))]
pub const MAX_SHM_ID_LEN: usize = 255;
#[cfg(not(unix))]
pub const MAX_SHM_ID_LEN: usize = 260;

/// Whether `name` can be used as a shared-memory id on this platform.
pub fn shm_name_fits(name: &str) -> bool {
    shm_os_id(name).len() <= MAX_SHM_ID_LEN
}
