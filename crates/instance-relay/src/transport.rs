//! Transport abstraction and the capability probe that picks one.
//!
//! A deployment uses exactly one transport; there is no negotiation between them.
//! Leader and followers run the same probe over the same identity and runtime
//! directory, so they always agree.

use crate::cancel::CancellationToken;
use crate::config::{PacketEncoding, RelayConfig, TransportKind};
use crate::error::Result;
use crate::handler::Dispatcher;
use crate::identity::InstanceIdentity;
use crate::ipc::protocol::NextInstanceMessage;
use crate::ipc::StreamTransport;
use crate::mailbox::MailboxTransport;
use crate::platform;
use async_trait::async_trait;
use std::path::Path;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Carries follower messages to the leader.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The concrete kind (never [`TransportKind::Auto`]).
    fn kind(&self) -> TransportKind;

    /// Leader side: create the named objects and start the accept loop.
    ///
    /// Returns once followers can connect. The handle completes after the loop
    /// has observed `cancel` and released its objects.
    async fn listen(
        &self,
        dispatcher: Dispatcher,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>>;

    /// Follower side: hand one message to the leader.
    async fn send(&self, message: &NextInstanceMessage) -> Result<()>;
}

/// Resolve [`TransportKind::Auto`] to a concrete kind.
///
/// The stream channel wins when its endpoint fits the socket-path limit. The
/// mailbox is used otherwise, provided its longest per-message name fits the
/// shared-memory id limit; when neither fits the stream channel is kept and its
/// bind or connect reports the failure.
pub fn resolve_kind(
    requested: TransportKind,
    identity: &InstanceIdentity,
    runtime_dir: &Path,
) -> TransportKind {
    match requested {
        TransportKind::Auto => {
            let endpoint = platform::channel_endpoint(runtime_dir, &identity.channel_name());
            let path_len = endpoint.as_os_str().len();
            let stream_fits =
                platform::supports_stream_channel() && path_len <= RelayConfig::MAX_STREAM_PATH_LEN;
            let mailbox_fits = mailbox_names_fit(identity);
            let kind = if stream_fits || !mailbox_fits {
                TransportKind::Stream
            } else {
                TransportKind::Mailbox
            };
            if !stream_fits && !mailbox_fits {
                warn!(
                    "Neither transport fits the names of {} (endpoint length {})",
                    identity, path_len
                );
            }
            debug!(
                "Transport probe on {}: endpoint length {}, mailbox names fit: {}, using {}",
                platform::current_platform(),
                path_len,
                mailbox_fits,
                kind
            );
            kind
        }
        concrete => concrete,
    }
}

/// Whether every shared-memory name the mailbox needs is a valid OS id.
pub fn mailbox_names_fit(identity: &InstanceIdentity) -> bool {
    // The per-handoff names are the longest; their length does not depend on the UUID
    let rendezvous = uuid::Uuid::nil();
    [
        identity.mailbox_name(),
        identity.mailbox_signal_name(),
        identity.consumed_signal_name(&rendezvous),
        identity.secondary_region_name(&rendezvous),
    ]
    .iter()
    .all(|name| platform::shm_name_fits(name))
}

/// Build the transport for a deployment.
pub fn select_transport(
    requested: TransportKind,
    identity: &InstanceIdentity,
    runtime_dir: &Path,
    encoding: PacketEncoding,
) -> Box<dyn Transport> {
    match resolve_kind(requested, identity, runtime_dir) {
        TransportKind::Mailbox => Box::new(MailboxTransport::new(identity.clone(), runtime_dir)),
        _ => Box::new(StreamTransport::new(identity, runtime_dir, encoding)),
    }
}
