//! Follower side of the stream transport.
//!
//! Connects to the leader's endpoint, writes one frame, and blocks until the leader
//! acknowledges it. The acknowledgement is only sent once the leader's callback has
//! started, so a follower never exits before its message has reached the leader.

use super::channel;
use super::protocol::{write_frame, NextInstanceMessage};
use crate::config::{PacketEncoding, RelayConfig};
use crate::error::{RelayError, Result};
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Sends follower messages to a stream endpoint.
#[derive(Debug, Clone)]
pub struct StreamClient {
    endpoint: PathBuf,
    encoding: PacketEncoding,
}

impl StreamClient {
    pub fn new(endpoint: impl Into<PathBuf>, encoding: PacketEncoding) -> Self {
        Self {
            endpoint: endpoint.into(),
            encoding,
        }
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    /// Deliver one message. No retry is attempted on failure.
    ///
    /// Connecting is bounded by [`RelayConfig::CONNECT_TIMEOUT`]; waiting for the
    /// acknowledgement is not.
    pub async fn send(&self, message: &NextInstanceMessage) -> Result<()> {
        let payload = message.encode(self.encoding)?;

        let mut stream = tokio::time::timeout(
            RelayConfig::CONNECT_TIMEOUT,
            channel::connect(&self.endpoint),
        )
        .await
        .map_err(|_| RelayError::ConnectTimeout(RelayConfig::CONNECT_TIMEOUT))??;

        debug!(
            "Connected to {}, sending {} byte payload",
            self.endpoint.display(),
            payload.len()
        );
        write_frame(&mut stream, &payload).await?;

        let mut ack = [0u8; 1];
        match stream.read(&mut ack).await? {
            0 => Err(RelayError::NoAcknowledgement),
            _ if ack[0] == RelayConfig::ACK_BYTE => {
                debug!("Leader acknowledged message");
                Ok(())
            }
            _ => Err(RelayError::malformed(format!(
                "unexpected acknowledgement byte {:#04x}",
                ack[0]
            ))),
        }
    }
}
