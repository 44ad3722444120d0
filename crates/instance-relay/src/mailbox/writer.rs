//! Follower side of the mailbox transport.

use super::control::{encode_arguments, MailboxControlBlock};
use super::shm::{NamedSignal, SharedRegion};
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::identity::InstanceIdentity;
use crate::ipc::protocol::NextInstanceMessage;
use crate::lock::WriterLock;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

fn not_listening(identity: &InstanceIdentity, err: RelayError) -> RelayError {
    RelayError::NotListening {
        endpoint: identity.mailbox_name(),
        message: err.to_string(),
    }
}

/// Hand one message to the leader through the mailbox. Blocking.
///
/// Writers are serialized by the writer lock, which is held until the leader has
/// consumed the message or [`RelayConfig::ARGS_CONSUMED_TIMEOUT`] has passed. A
/// timeout is logged, not returned: the message may still be read later.
pub fn write_message(
    runtime_dir: &Path,
    identity: &InstanceIdentity,
    message: &NextInstanceMessage,
) -> Result<()> {
    write_message_with_timeout(
        runtime_dir,
        identity,
        message,
        RelayConfig::ARGS_CONSUMED_TIMEOUT,
    )
}

/// [`write_message`] with a custom bound on the wait for the leader.
pub fn write_message_with_timeout(
    runtime_dir: &Path,
    identity: &InstanceIdentity,
    message: &NextInstanceMessage,
    consumed_timeout: Duration,
) -> Result<()> {
    let _writer = WriterLock::acquire(runtime_dir, identity)?;

    let mut mailbox =
        SharedRegion::open(&identity.mailbox_name()).map_err(|e| not_listening(identity, e))?;
    let written = NamedSignal::open(&identity.mailbox_signal_name())
        .map_err(|e| not_listening(identity, e))?;

    let rendezvous = Uuid::new_v4();
    let consumed = NamedSignal::create(&identity.consumed_signal_name(&rendezvous), false)?;

    let argument_count = i32::try_from(message.arguments.len())
        .map_err(|_| RelayError::Other("too many arguments for the mailbox".to_string()))?;

    // Kept alive until the leader has copied the arguments out
    let mut secondary = None;
    let mut data_length = 0i64;
    if !message.arguments.is_empty() {
        let data = encode_arguments(&message.arguments)?;
        let mut region =
            SharedRegion::create(&identity.secondary_region_name(&rendezvous), data.len())?;
        region.write(0, &data)?;
        data_length = data.len() as i64;
        secondary = Some(region);
    }

    let block = MailboxControlBlock {
        process_id: message.process_id,
        argument_count,
        uses_secondary_region: secondary.is_some(),
        rendezvous_id: rendezvous,
        data_length,
    };
    mailbox.write(0, &block.encode())?;
    written.set()?;
    debug!(
        "Wrote mailbox block {} ({} args, {} bytes)",
        rendezvous, argument_count, data_length
    );

    match consumed.wait(Some(consumed_timeout)) {
        Ok(()) => debug!("Leader consumed mailbox block {}", rendezvous),
        Err(e) => warn!(
            "Leader did not consume mailbox block {} within {:?}: {}",
            rendezvous, consumed_timeout, e
        ),
    }

    drop(secondary);
    drop(consumed);
    Ok(())
}
