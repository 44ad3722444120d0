//! Mailbox transport: a single-slot shared-memory mailbox.
//!
//! Used where a connection-oriented channel is unsuitable. Three named objects
//! coordinate the slot:
//!
//! - **Mailbox region** (`<id>-args`): exactly one [`MailboxControlBlock`], created
//!   by the leader for its lifetime
//! - **"Mailbox written" signal** (`<id>-argsignal`): auto-reset, set by a writer
//! - **Writer lock** (`<id>-argwriter`): serializes writers across processes
//!
//! Arguments travel in a per-message secondary region named after a fresh
//! rendezvous id; the writer waits on a per-message "args consumed" signal before
//! releasing the writer lock.

pub mod control;
pub mod reader;
pub mod shm;
pub mod writer;

pub use control::{MailboxControlBlock, CONTROL_BLOCK_SIZE};
pub use reader::MailboxReader;
pub use shm::{NamedSignal, SharedRegion};

use crate::cancel::CancellationToken;
use crate::config::TransportKind;
use crate::error::{RelayError, Result};
use crate::handler::Dispatcher;
use crate::identity::InstanceIdentity;
use crate::ipc::protocol::NextInstanceMessage;
use crate::transport::Transport;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// [`Transport`] over the shared-memory mailbox.
#[derive(Debug, Clone)]
pub struct MailboxTransport {
    identity: InstanceIdentity,
    runtime_dir: PathBuf,
}

impl MailboxTransport {
    /// `runtime_dir` holds the writer lock file.
    pub fn new(identity: InstanceIdentity, runtime_dir: &Path) -> Self {
        Self {
            identity,
            runtime_dir: runtime_dir.to_path_buf(),
        }
    }
}

#[async_trait]
impl Transport for MailboxTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Mailbox
    }

    async fn listen(
        &self,
        dispatcher: Dispatcher,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        let mailbox =
            SharedRegion::create_or_reclaim(&self.identity.mailbox_name(), CONTROL_BLOCK_SIZE)?;
        let written = Arc::new(NamedSignal::create(
            &self.identity.mailbox_signal_name(),
            true,
        )?);
        info!("Mailbox listener ready on {}", self.identity.mailbox_name());

        let reader = MailboxReader::new(
            self.identity.clone(),
            mailbox,
            written.clone(),
            dispatcher,
            cancel.clone(),
        );
        let mut reader_task = tokio::task::spawn_blocking(move || reader.run());

        // The reader blocks on the signal, so cancellation has to wake it up
        Ok(tokio::spawn(async move {
            let finished = tokio::select! {
                finished = &mut reader_task => finished,
                _ = cancel.cancelled() => {
                    if let Err(e) = written.set() {
                        warn!("Could not wake mailbox reader: {}", e);
                    }
                    reader_task.await
                }
            };
            if let Err(e) = finished {
                error!("Mailbox reader failed: {}", e);
            }
        }))
    }

    async fn send(&self, message: &NextInstanceMessage) -> Result<()> {
        let runtime_dir = self.runtime_dir.clone();
        let identity = self.identity.clone();
        let message = message.clone();
        tokio::task::spawn_blocking(move || writer::write_message(&runtime_dir, &identity, &message))
            .await
            .map_err(|e| RelayError::Runtime {
                message: format!("mailbox writer task failed: {}", e),
            })?
    }
}
