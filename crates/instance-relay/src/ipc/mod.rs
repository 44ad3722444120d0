//! Stream transport: a named connection-oriented channel.
//!
//! # Architecture
//!
//! - **Channel**: per-platform endpoint (Unix domain socket / named pipe)
//! - **Server**: leader accept loop, one frame per connection, acknowledged
//! - **Client**: follower connect, send, wait for acknowledgement
//! - **Protocol**: message encodings and length-prefixed framing used by both

pub mod channel;
pub mod client;
pub mod protocol;
pub mod server;

pub use client::StreamClient;
pub use protocol::NextInstanceMessage;
pub use server::StreamServer;

use crate::cancel::CancellationToken;
use crate::config::{PacketEncoding, TransportKind};
use crate::error::Result;
use crate::handler::Dispatcher;
use crate::identity::InstanceIdentity;
use crate::platform;
use crate::transport::Transport;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::task::JoinHandle;

/// [`Transport`] over the named stream channel.
#[derive(Debug, Clone)]
pub struct StreamTransport {
    endpoint: PathBuf,
    encoding: PacketEncoding,
    client: StreamClient,
}

impl StreamTransport {
    pub fn new(identity: &InstanceIdentity, runtime_dir: &Path, encoding: PacketEncoding) -> Self {
        let endpoint = platform::channel_endpoint(runtime_dir, &identity.channel_name());
        Self {
            client: StreamClient::new(endpoint.clone(), encoding),
            endpoint,
            encoding,
        }
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    async fn listen(
        &self,
        dispatcher: Dispatcher,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        StreamServer::start(&self.endpoint, self.encoding, dispatcher, cancel).await
    }

    async fn send(&self, message: &NextInstanceMessage) -> Result<()> {
        self.client.send(message).await
    }
}
