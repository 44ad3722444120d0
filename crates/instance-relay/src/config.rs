//! Centralized configuration for instance-relay.
//!
//! Fixed protocol constants live on [`RelayConfig`]; the handful of choices a host
//! application makes at build time are small enums passed to the controller builder.

use std::time::Duration;

/// Protocol-level constants.
pub struct RelayConfig;

impl RelayConfig {
    /// Bound on a follower's connect to the stream channel.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    /// Bound on a follower's wait for the leader to consume a mailbox write.
    pub const ARGS_CONSUMED_TIMEOUT: Duration = Duration::from_secs(10);
    /// Longest user-supplied identity accepted.
    pub const MAX_IDENTITY_LEN: usize = 260;
    /// Largest payload accepted behind a length prefix.
    pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;
    /// Byte written back by the stream leader once a message is dispatched.
    pub const ACK_BYTE: u8 = 0x06;
    /// Longest OS object name built from an identity, suffix included.
    ///
    /// Leaves room for the `.lock` extension within a 255-byte file name.
    pub const MAX_OBJECT_NAME_LEN: usize = 200;
    /// Longest socket path the stream probe accepts (sun_path is 104 bytes on macOS).
    pub const MAX_STREAM_PATH_LEN: usize = 100;
    /// Extension of the lock files backing leader and writer locks.
    pub const LOCK_FILE_EXTENSION: &'static str = "lock";
    /// Directory created under the temp dir when no per-user runtime dir exists.
    pub const FALLBACK_DIR_NAME: &'static str = "instance-relay";
}

/// Which transport carries follower messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransportKind {
    /// Probe the platform once and pick the stream channel when it is usable.
    #[default]
    Auto,
    /// Named connection-oriented channel (Unix domain socket / named pipe).
    Stream,
    /// Shared-memory mailbox with named signals.
    Mailbox,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Auto => "auto",
            TransportKind::Stream => "stream",
            TransportKind::Mailbox => "mailbox",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Some(TransportKind::Auto),
            "stream" | "pipe" => Some(TransportKind::Stream),
            "mailbox" | "shm" => Some(TransportKind::Mailbox),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payload encoding used by the stream transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PacketEncoding {
    /// `{"processid": .., "args": [..]}`
    #[default]
    Json,
    /// Little-endian integers and varint-prefixed UTF-8 strings.
    Binary,
}

impl PacketEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketEncoding::Json => "json",
            PacketEncoding::Binary => "binary",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "json" => Some(PacketEncoding::Json),
            "binary" => Some(PacketEncoding::Binary),
            _ => None,
        }
    }
}

impl std::fmt::Display for PacketEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What happens when a subsequent-launch callback panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallbackPanicPolicy {
    /// Log the panic and keep listening.
    #[default]
    Swallow,
    /// Stop listening and re-raise the panic from `Controller::run` after teardown.
    Propagate,
}
