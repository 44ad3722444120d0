//! Platform abstraction layer for cross-platform compatibility.
//!
//! This module centralizes all platform-specific naming and permission code.
//! All `#[cfg]` blocks for OS-specific behavior outside of the channel
//! implementation should live here rather than scattered throughout the codebase.
//!
//! # Architecture
//!
//! - `paths` - Runtime directory, lock files, channel endpoints, shared-memory ids
//! - `permissions` - Owner-only permissions for endpoints and directories
//!
//! # Supported Platforms
//!
//! - **Linux**: Full support (Unix domain sockets + POSIX shared memory)
//! - **Windows**: Full support (named pipes + file mappings)
//! - **macOS**: Stream transport; shared-memory names are limited to 31 bytes

pub mod paths;
pub mod permissions;

pub use paths::{
    channel_endpoint, default_runtime_dir, ensure_runtime_dir, lock_file_path, shm_name_fits,
    shm_os_id, MAX_SHM_ID_LEN,
};
pub use permissions::set_private;

/// Returns the current platform name.
pub fn current_platform() -> &'static str {
    #[cfg(target_os = "linux")]
    {
        "linux"
    }
    #[cfg(target_os = "windows")]
    {
        "windows"
    }
    #[cfg(target_os = "macos")]
    {
        "macos"
    }
    #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
    {
        "unknown"
    }
}

/// Returns true if the platform has a connection-oriented named channel.
pub fn supports_stream_channel() -> bool {
    cfg!(any(unix, windows))
}

/// The current process id as carried on the wire.
pub fn current_process_id() -> i32 {
    std::process::id() as i32
}
