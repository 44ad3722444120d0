//! Instance identity and OS object naming.
//!
//! Every OS object the relay creates is named after one identity string shared by
//! all processes of an application family. The naming scheme is fixed so that
//! differently-built binaries of the same family can still find each other.
//!
//! Names are `<id><suffix>`. When the longest of them would not fit
//! [`RelayConfig::MAX_OBJECT_NAME_LEN`], every name of that identity uses a
//! fixed-length digest of the identity in place of `<id>`.

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// `-argreader` followed by a hyphenated UUID.
const LONGEST_SUFFIX_LEN: usize = 10 + 36;

/// Opaque identifier for one application family.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceIdentity(String);

impl InstanceIdentity {
    /// Validate and wrap a user-supplied identity.
    ///
    /// The identity is embedded in file names and shared-memory ids, so it must be
    /// non-empty, at most [`RelayConfig::MAX_IDENTITY_LEN`] characters, and free of
    /// path separators and NUL.
    pub fn new(identity: impl Into<String>) -> Result<Self> {
        let identity = identity.into();
        let invalid = |reason: &str| RelayError::InvalidIdentity {
            identity: identity.clone(),
            reason: reason.to_string(),
        };

        if identity.is_empty() {
            return Err(invalid("identity is empty"));
        }
        if identity.chars().count() > RelayConfig::MAX_IDENTITY_LEN {
            return Err(invalid(&format!(
                "identity is longer than {} characters",
                RelayConfig::MAX_IDENTITY_LEN
            )));
        }
        if identity.contains(['/', '\\', '\0']) {
            return Err(invalid("identity contains a path separator or NUL"));
        }

        Ok(Self(identity))
    }

    /// Derive an identity from the running executable's path.
    ///
    /// Two launches of the same binary always agree; copies of the binary at
    /// different paths are treated as different applications.
    pub fn from_current_exe() -> Result<Self> {
        let basis = match std::env::current_exe() {
            Ok(path) => path.to_string_lossy().into_owned(),
            Err(e) => {
                tracing::debug!("current_exe unavailable ({}), using argv[0]", e);
                std::env::args().next().ok_or_else(|| {
                    RelayError::Other("Cannot derive an identity: no executable path".to_string())
                })?
            }
        };
        Ok(Self::from_basis(&basis))
    }

    fn from_basis(basis: &str) -> Self {
        let digest = Sha256::digest(basis.as_bytes());
        Self(hex::encode(&digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix shared by all OS object names of this identity.
    pub fn name_stem(&self) -> String {
        if self.0.len() + LONGEST_SUFFIX_LEN <= RelayConfig::MAX_OBJECT_NAME_LEN {
            self.0.clone()
        } else {
            let digest = Sha256::digest(self.0.as_bytes());
            hex::encode(&digest[..16])
        }
    }

    /// Name of the leader lock.
    pub fn lock_name(&self) -> String {
        format!("{}-mutex", self.name_stem())
    }

    /// Name of the stream channel.
    pub fn channel_name(&self) -> String {
        format!("{}-pipe", self.name_stem())
    }

    /// Name of the fixed-size mailbox region.
    pub fn mailbox_name(&self) -> String {
        format!("{}-args", self.name_stem())
    }

    /// Name of the "mailbox written" signal.
    pub fn mailbox_signal_name(&self) -> String {
        format!("{}-argsignal", self.name_stem())
    }

    /// Name of the lock serializing mailbox writers.
    pub fn writer_lock_name(&self) -> String {
        format!("{}-argwriter", self.name_stem())
    }

    /// Name of the per-handoff "args consumed" signal.
    pub fn consumed_signal_name(&self, rendezvous: &Uuid) -> String {
        format!("{}-argreader{}", self.name_stem(), rendezvous)
    }

    /// Name of the per-handoff secondary argument region.
    pub fn secondary_region_name(&self, rendezvous: &Uuid) -> String {
        format!("{}-argdata{}", self.name_stem(), rendezvous)
    }
}

impl std::fmt::Display for InstanceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for InstanceIdentity {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}
