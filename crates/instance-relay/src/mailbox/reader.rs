//! Leader side of the mailbox transport.
//!
//! Runs on a blocking thread: wait for "mailbox written", take the control block,
//! copy the arguments out of the secondary region, release the follower, then
//! dispatch. A wake-up that finds the mailbox vacant is spurious, or is the
//! cancellation poke; either way the loop re-checks the token.

use super::control::{self, decode_arguments, MailboxControlBlock, CONTROL_BLOCK_SIZE};
use super::shm::{NamedSignal, SharedRegion};
use crate::cancel::CancellationToken;
use crate::error::{RelayError, Result};
use crate::handler::Dispatcher;
use crate::identity::InstanceIdentity;
use crate::ipc::protocol::NextInstanceMessage;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The leader's mailbox read loop.
#[derive(Debug)]
pub struct MailboxReader {
    identity: InstanceIdentity,
    mailbox: SharedRegion,
    written: Arc<NamedSignal>,
    dispatcher: Dispatcher,
    cancel: CancellationToken,
}

impl MailboxReader {
    pub fn new(
        identity: InstanceIdentity,
        mailbox: SharedRegion,
        written: Arc<NamedSignal>,
        dispatcher: Dispatcher,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            identity,
            mailbox,
            written,
            dispatcher,
            cancel,
        }
    }

    /// Serve the mailbox until cancelled. Blocking.
    pub fn run(mut self) {
        loop {
            if let Err(e) = self.written.wait(None) {
                error!("Mailbox wait failed, stopping reader: {}", e);
                break;
            }

            match self.take_block() {
                Ok(None) => debug!("Mailbox woke up vacant"),
                Ok(Some(block)) => self.receive(block),
                Err(e) => {
                    warn!("Discarding unreadable mailbox block: {}", e);
                    wait_started(self.dispatcher.dispatch_error(e));
                }
            }

            if self.cancel.is_cancelled() {
                break;
            }
        }
        info!("Mailbox reader stopped");
    }

    /// Read the control block and mark the mailbox vacant again.
    fn take_block(&mut self) -> Result<Option<MailboxControlBlock>> {
        let bytes = self.mailbox.read_vec(0, CONTROL_BLOCK_SIZE)?;
        self.mailbox.zero()?;
        if bytes.iter().all(|b| *b == 0) {
            return Ok(None);
        }
        match MailboxControlBlock::decode(&bytes) {
            Ok(block) if block.is_vacant() => Ok(None),
            Ok(block) => Ok(Some(block)),
            Err(e) => {
                // The writer still waits on its rendezvous, release it if we can
                if let Some(rendezvous) = control::raw_rendezvous_id(&bytes) {
                    self.acknowledge(&rendezvous);
                }
                Err(e)
            }
        }
    }

    fn receive(&self, block: MailboxControlBlock) {
        let arguments = self.read_arguments(&block);
        // Release the follower whether or not decoding worked
        self.acknowledge(&block.rendezvous_id);

        match arguments {
            Ok(arguments) => {
                wait_started(
                    self.dispatcher
                        .dispatch(NextInstanceMessage::new(block.process_id, arguments)),
                );
            }
            Err(e) => {
                warn!(
                    "Mailbox message from process {} could not be decoded: {}",
                    block.process_id, e
                );
                wait_started(self.dispatcher.dispatch_error(e));
            }
        }
    }

    fn read_arguments(&self, block: &MailboxControlBlock) -> Result<Vec<String>> {
        if !block.uses_secondary_region {
            return Ok(Vec::new());
        }

        let name = self.identity.secondary_region_name(&block.rendezvous_id);
        let region = SharedRegion::open(&name)?;
        let length = usize::try_from(block.data_length)
            .map_err(|_| RelayError::malformed("data length does not fit in memory"))?;
        if length > region.len() {
            return Err(RelayError::malformed(format!(
                "declared {} bytes but region {} holds {}",
                length,
                name,
                region.len()
            )));
        }
        let data = region.read_vec(0, length)?;
        decode_arguments(&data, block.argument_count as usize)
    }

    fn acknowledge(&self, rendezvous: &Uuid) {
        let name = self.identity.consumed_signal_name(rendezvous);
        match NamedSignal::open(&name).and_then(|signal| signal.set()) {
            Ok(()) => debug!("Released writer of mailbox block {}", rendezvous),
            Err(e) => warn!("Could not release writer of mailbox block {}: {}", rendezvous, e),
        }
    }
}

/// Block until a dispatched callback is running, so shutdown cannot discard it.
fn wait_started(started: oneshot::Receiver<()>) {
    if started.blocking_recv().is_err() {
        warn!("Dispatch was abandoned before the callback started");
    }
}
