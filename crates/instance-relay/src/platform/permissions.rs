//! Owner-only permissions for the relay's filesystem objects.
//!
//! Socket endpoints and a freshly created runtime directory are restricted to the
//! current user so that only processes inside the same user boundary can hand
//! arguments to the leader.

use crate::error::Result;
use std::path::Path;
use tracing::debug;

/// Set file permissions to be readable and writable by owner only.
///
/// # Platform Behavior
/// - **Linux/macOS**: Sets mode 0o600
/// - **Windows**: No-op (named pipes are already session-scoped)
pub fn set_private(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut permissions = std::fs::metadata(path)?.permissions();
        permissions.set_mode(0o600);
        std::fs::set_permissions(path, permissions)?;
        debug!("Set private permissions (0600) on: {}", path.display());
    }

    #[cfg(windows)]
    {
        debug!(
            "Skipping private permission setting on Windows for: {}",
            path.display()
        );
    }

    Ok(())
}

/// Restrict a directory to its owner.
///
/// # Platform Behavior
/// - **Linux/macOS**: Sets mode 0o700
/// - **Windows**: No-op
pub fn set_private_dir(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut permissions = std::fs::metadata(path)?.permissions();
        permissions.set_mode(0o700);
        std::fs::set_permissions(path, permissions)?;
        debug!("Set private permissions (0700) on: {}", path.display());
    }

    #[cfg(windows)]
    {
        debug!("Skipping directory permissions on Windows for: {}", path.display());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    #[test]
    fn test_set_private() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("endpoint");
        File::create(&file_path).unwrap();

        set_private(&file_path).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&file_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_set_private_dir() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("runtime");
        std::fs::create_dir(&dir).unwrap();

        set_private_dir(&dir).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }

    #[test]
    fn test_set_private_missing_file_errors() {
        let temp_dir = TempDir::new().unwrap();
        #[cfg(unix)]
        assert!(set_private(&temp_dir.path().join("missing")).is_err());
    }
}
