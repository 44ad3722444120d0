//! Named, connection-oriented byte channel.
//!
//! - **Unix**: a Unix domain socket file in the runtime directory. The listening
//!   socket persists; every accepted connection is one single-use channel instance.
//! - **Windows**: a byte-mode named pipe. Each server instance serves exactly one
//!   client, so a fresh instance is created as soon as the current one connects.
//!
//! Streams are full duplex on both platforms: the follower writes a frame and the
//! leader writes one acknowledgement byte back.

use crate::error::{RelayError, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

#[cfg(unix)]
pub use unix::{connect, ChannelListener, ClientStream, ServerStream};

#[cfg(windows)]
pub use windows::{connect, ChannelListener, ClientStream, ServerStream};

fn not_listening(endpoint: &Path, err: &std::io::Error) -> RelayError {
    RelayError::NotListening {
        endpoint: endpoint.display().to_string(),
        message: err.to_string(),
    }
}

fn is_absent_listener(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::NotFound | ErrorKind::ConnectionRefused | ErrorKind::AddrNotAvailable
    )
}

#[cfg(unix)]
mod unix {
    use super::*;
    use crate::platform;
    use tokio::net::{UnixListener, UnixStream};

    pub type ServerStream = UnixStream;
    pub type ClientStream = UnixStream;

    /// Removes the socket file when the listener goes away.
    #[derive(Debug)]
    struct EndpointFile(PathBuf);

    impl Drop for EndpointFile {
        fn drop(&mut self) {
            match std::fs::remove_file(&self.0) {
                Ok(()) => debug!("Removed socket {}", self.0.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => debug!("Failed to remove socket {}: {}", self.0.display(), e),
            }
        }
    }

    /// Leader side of the channel.
    #[derive(Debug)]
    pub struct ChannelListener {
        listener: UnixListener,
        endpoint: EndpointFile,
    }

    impl ChannelListener {
        /// Bind the endpoint, replacing a socket file left by a dead leader.
        ///
        /// Only the leader-lock holder calls this, so an existing file is stale.
        /// Must be called from within a tokio runtime.
        pub fn bind(endpoint: &Path) -> Result<Self> {
            match std::fs::remove_file(endpoint) {
                Ok(()) => debug!("Removed stale socket {}", endpoint.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(RelayError::io_with_path(e, endpoint)),
            }

            let listener =
                UnixListener::bind(endpoint).map_err(|e| RelayError::io_with_path(e, endpoint))?;
            let endpoint = EndpointFile(endpoint.to_path_buf());
            platform::set_private(&endpoint.0)?;

            Ok(Self { listener, endpoint })
        }

        pub fn endpoint(&self) -> &Path {
            &self.endpoint.0
        }

        /// Wait for the next follower.
        pub async fn accept(&mut self) -> Result<ServerStream> {
            let (stream, _) = self.listener.accept().await?;
            Ok(stream)
        }

        /// Close the listener, returning connections already queued in its backlog.
        pub fn drain(self) -> Vec<ServerStream> {
            let ChannelListener { listener, endpoint } = self;
            let mut pending = Vec::new();

            let std_listener = match listener.into_std() {
                Ok(l) => l,
                Err(e) => {
                    debug!("Cannot drain {}: {}", endpoint.0.display(), e);
                    return pending;
                }
            };

            loop {
                match std_listener.accept() {
                    Ok((stream, _)) => {
                        let converted = stream
                            .set_nonblocking(true)
                            .and_then(|()| UnixStream::from_std(stream));
                        match converted {
                            Ok(stream) => pending.push(stream),
                            Err(e) => debug!("Dropping pending connection: {}", e),
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        debug!("Stopped draining {}: {}", endpoint.0.display(), e);
                        break;
                    }
                }
            }

            pending
        }
    }

    /// Connect to a leader's endpoint. No timeout is applied here.
    pub async fn connect(endpoint: &Path) -> Result<ClientStream> {
        UnixStream::connect(endpoint).await.map_err(|e| {
            if is_absent_listener(&e) {
                not_listening(endpoint, &e)
            } else {
                RelayError::io_with_path(e, endpoint)
            }
        })
    }
}

#[cfg(windows)]
mod windows {
    use super::*;
    use futures::FutureExt;
    use std::time::Duration;
    use tokio::net::windows::named_pipe::{
        ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions,
    };

    pub type ServerStream = NamedPipeServer;
    pub type ClientStream = NamedPipeClient;

    const ERROR_PIPE_BUSY: i32 = 231;
    const BUSY_RETRY_DELAY: Duration = Duration::from_millis(20);

    /// Leader side of the channel.
    #[derive(Debug)]
    pub struct ChannelListener {
        server: NamedPipeServer,
        endpoint: PathBuf,
    }

    impl ChannelListener {
        /// Create the first pipe instance. Fails if another process owns the name.
        pub fn bind(endpoint: &Path) -> Result<Self> {
            let server = ServerOptions::new()
                .first_pipe_instance(true)
                .create(endpoint)
                .map_err(|e| RelayError::io_with_path(e, endpoint))?;
            Ok(Self {
                server,
                endpoint: endpoint.to_path_buf(),
            })
        }

        pub fn endpoint(&self) -> &Path {
            &self.endpoint
        }

        /// Wait for the next follower, then put a fresh instance in place.
        pub async fn accept(&mut self) -> Result<ServerStream> {
            self.server.connect().await?;
            let next = ServerOptions::new()
                .create(&self.endpoint)
                .map_err(|e| RelayError::io_with_path(e, &self.endpoint))?;
            Ok(std::mem::replace(&mut self.server, next))
        }

        /// Close the listener, returning the current instance if a client already connected.
        pub fn drain(self) -> Vec<ServerStream> {
            let ChannelListener { server, .. } = self;
            let connected = matches!(server.connect().now_or_never(), Some(Ok(())));
            if connected {
                vec![server]
            } else {
                Vec::new()
            }
        }
    }

    /// Connect to a leader's pipe, retrying while every instance is busy.
    ///
    /// No overall timeout is applied here.
    pub async fn connect(endpoint: &Path) -> Result<ClientStream> {
        loop {
            match ClientOptions::new().open(endpoint) {
                Ok(client) => return Ok(client),
                Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {
                    tokio::time::sleep(BUSY_RETRY_DELAY).await;
                }
                Err(e) if is_absent_listener(&e) => return Err(not_listening(endpoint, &e)),
                Err(e) => return Err(RelayError::io_with_path(e, endpoint)),
            }
        }
    }
}
