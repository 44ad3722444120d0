//! Stream transport accept loop, run by the leader.
//!
//! Accepts one follower at a time, reads exactly one frame, dispatches the decoded
//! message and acknowledges it, then goes back to accepting.
//!
//! # Cancellation
//!
//! Only the wait for a new connection races the cancellation token. A connection
//! that was already accepted is always read and dispatched. Once cancellation is
//! observed, connections already queued on the endpoint are drained and handled
//! before the loop exits.
//!
//! Every frame read is bounded by [`RelayConfig::CONNECT_TIMEOUT`], so a client
//! that connects and never writes delays other followers and leader teardown by
//! at most that long.

use super::channel::{ChannelListener, ServerStream};
use super::protocol::{read_frame, NextInstanceMessage};
use crate::cancel::CancellationToken;
use crate::config::{PacketEncoding, RelayConfig};
use crate::error::Result;
use crate::handler::Dispatcher;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Stream transport server.
pub struct StreamServer;

impl StreamServer {
    /// Bind the endpoint and start the accept loop on the current runtime.
    ///
    /// The endpoint is bound before this returns, so a follower that connects
    /// afterwards is guaranteed a listener. The returned handle completes once the
    /// loop has observed `cancel` and drained.
    pub async fn start(
        endpoint: &Path,
        encoding: PacketEncoding,
        dispatcher: Dispatcher,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        Self::start_with_read_timeout(
            endpoint,
            encoding,
            dispatcher,
            cancel,
            RelayConfig::CONNECT_TIMEOUT,
        )
        .await
    }

    /// [`start`](Self::start) with a custom bound on each frame read.
    pub async fn start_with_read_timeout(
        endpoint: &Path,
        encoding: PacketEncoding,
        dispatcher: Dispatcher,
        cancel: CancellationToken,
        read_timeout: Duration,
    ) -> Result<JoinHandle<()>> {
        let listener = ChannelListener::bind(endpoint)?;
        info!("Stream listener bound on {}", endpoint.display());

        Ok(tokio::spawn(Self::accept_loop(
            listener,
            encoding,
            dispatcher,
            cancel,
            read_timeout,
        )))
    }

    async fn accept_loop(
        mut listener: ChannelListener,
        encoding: PacketEncoding,
        dispatcher: Dispatcher,
        cancel: CancellationToken,
        read_timeout: Duration,
    ) {
        loop {
            let stream = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(stream) => stream,
                    Err(e) => {
                        error!("Accept failed on {}: {}", listener.endpoint().display(), e);
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                        continue;
                    }
                },
            };

            Self::handle_connection(stream, encoding, &dispatcher, read_timeout).await;
        }

        let pending = listener.drain();
        if !pending.is_empty() {
            debug!("Draining {} pending connection(s)", pending.len());
        }
        for stream in pending {
            Self::handle_connection(stream, encoding, &dispatcher, read_timeout).await;
        }

        info!("Stream listener stopped");
    }

    async fn handle_connection(
        mut stream: ServerStream,
        encoding: PacketEncoding,
        dispatcher: &Dispatcher,
        read_timeout: Duration,
    ) {
        #[cfg(unix)]
        if let Ok(cred) = stream.peer_cred() {
            debug!("Follower connected (peer pid {:?})", cred.pid());
        }

        let frame = match tokio::time::timeout(read_timeout, read_frame(&mut stream)).await {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => {
                debug!("Follower disconnected without sending a message");
                return;
            }
            Ok(Err(e)) => {
                warn!("Dropping malformed packet: {}", e);
                return;
            }
            Err(_) => {
                warn!("Follower sent nothing within {:?}, dropping it", read_timeout);
                return;
            }
        };

        let message = match NextInstanceMessage::decode(&frame, encoding) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed packet: {}", e);
                return;
            }
        };

        if dispatcher.dispatch(message).await.is_err() {
            warn!("Dispatch was abandoned before the callback started");
            return;
        }

        let acked = async {
            stream.write_all(&[RelayConfig::ACK_BYTE]).await?;
            stream.flush().await
        }
        .await;
        if let Err(e) = acked {
            debug!("Follower left before acknowledgement: {}", e);
        }
    }
}
