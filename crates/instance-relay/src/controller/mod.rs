//! The controller: role election, listener lifecycle, and the follower handoff.
//!
//! ```text
//! Unelected ──build──► Leader ─────run──► Running ──► Disposed
//!                 ├──► Follower ───run──► Running ──► Disposed
//!                 └──► Standalone ─run──► Running ──► Disposed
//! ```
//!
//! The leader binds its listener before calling `on_first_launch`, so every
//! follower that starts afterwards finds it. When `on_first_launch` returns (or
//! unwinds), the listener is cancelled and joined, in-flight callbacks finish, and
//! only then is the leader lock released.

mod builder;

pub use builder::ControllerBuilder;

use crate::cancel::CancellationToken;
use crate::config::{CallbackPanicPolicy, TransportKind};
use crate::error::{RelayError, Result};
use crate::handler::{Dispatcher, LaunchHandler};
use crate::identity::InstanceIdentity;
use crate::ipc::protocol::NextInstanceMessage;
use crate::lock::LeaderLock;
use crate::platform;
use crate::transport::Transport;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Which side of the protocol this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Leader,
    Follower,
    /// Built with `single_instance(false)`: no election, no transport.
    Standalone,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Leader => write!(f, "leader"),
            Role::Follower => write!(f, "follower"),
            Role::Standalone => write!(f, "standalone"),
        }
    }
}

/// Lifecycle of a [`Controller`].
///
/// `Unelected` only exists while a builder is running; a built controller starts
/// in `Leader` or `Follower`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerState {
    Unelected,
    Leader,
    Follower,
    Standalone,
    Running,
    Disposed,
}

/// Single-instance coordinator for one application family.
pub struct Controller {
    identity: InstanceIdentity,
    runtime_dir: PathBuf,
    role: Role,
    state: ControllerState,
    lock: Option<LeaderLock>,
    transport: Option<Box<dyn Transport>>,
    handler: Arc<dyn LaunchHandler>,
    panic_policy: CallbackPanicPolicy,
}

impl Controller {
    /// Start configuring a controller for `identity`.
    pub fn builder(identity: InstanceIdentity) -> ControllerBuilder {
        ControllerBuilder::new(identity)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn identity(&self) -> &InstanceIdentity {
        &self.identity
    }

    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    /// The concrete transport in use; `None` for a standalone controller.
    pub fn transport_kind(&self) -> Option<TransportKind> {
        self.transport.as_ref().map(|t| t.kind())
    }

    /// Run this process's side of the protocol. Blocks until it completes.
    ///
    /// - **Leader**: starts listening, calls `on_first_launch(args)` on this thread,
    ///   then stops listening and releases the leader lock. Under
    ///   [`CallbackPanicPolicy::Propagate`] a panic from a subsequent-launch
    ///   callback is resumed here after teardown.
    /// - **Follower**: sends `args` to the leader and waits for the handoff to
    ///   complete. Errors are returned; no retry is attempted.
    /// - **Standalone**: calls `on_first_launch(args)` and returns.
    ///
    /// On the stream transport the leader reads each follower's packet for at most
    /// [`RelayConfig::CONNECT_TIMEOUT`](crate::config::RelayConfig::CONNECT_TIMEOUT).
    /// A local process that connects and never writes therefore delays the next
    /// follower, and the leader's teardown, by up to that long.
    ///
    /// A controller runs once; a second call returns [`RelayError::InvalidState`].
    pub fn run(&mut self, args: Vec<String>) -> Result<()> {
        match self.state {
            ControllerState::Leader | ControllerState::Follower | ControllerState::Standalone => {}
            state => {
                return Err(RelayError::InvalidState {
                    message: format!("run called on a controller in state {:?}", state),
                })
            }
        }
        self.state = ControllerState::Running;

        let result = match self.role {
            Role::Leader => self.run_leader(args),
            Role::Follower => self.run_follower(args),
            Role::Standalone => {
                self.handler.on_first_launch(&args);
                Ok(())
            }
        };

        self.state = ControllerState::Disposed;
        result
    }

    /// [`run`](Self::run) with this process's own arguments, minus the program path.
    pub fn run_with_env_args(&mut self) -> Result<()> {
        let args = std::env::args_os()
            .skip(1)
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        self.run(args)
    }

    fn transport(&self) -> Result<&dyn Transport> {
        self.transport
            .as_deref()
            .ok_or_else(|| RelayError::InvalidState {
                message: "controller has no transport".to_string(),
            })
    }

    fn run_leader(&mut self, args: Vec<String>) -> Result<()> {
        let runtime = build_runtime()?;
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::new(
            self.handler.clone(),
            self.panic_policy,
            runtime.handle().clone(),
            cancel.clone(),
        );

        // From here on every exit path tears down and releases the lock
        let mut session = LeaderSession {
            runtime: Some(runtime),
            cancel: cancel.clone(),
            listener: None,
            lock: self.lock.take(),
        };

        let listener = session.block_on(self.transport()?.listen(dispatcher.clone(), cancel))??;
        session.listener = Some(listener);

        info!("Leader {} listening, running first launch", self.identity);
        self.handler.on_first_launch(&args);

        session.shutdown()?;

        if let Some(payload) = dispatcher.take_panic() {
            std::panic::resume_unwind(payload);
        }
        Ok(())
    }

    fn run_follower(&mut self, args: Vec<String>) -> Result<()> {
        let runtime = build_runtime()?;
        let message = NextInstanceMessage::new(platform::current_process_id(), args);
        debug!(
            "Follower {} forwarding {} args",
            message.process_id,
            message.arguments.len()
        );

        let result = runtime.block_on(self.transport()?.send(&message));
        drop(runtime);
        // A follower never held the lock; this only closes the lock file
        self.lock = None;

        match &result {
            Ok(()) => info!("Arguments handed to leader of {}", self.identity),
            Err(e) => error!("Handoff to leader of {} failed: {}", self.identity, e),
        }
        result
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("identity", &self.identity)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("transport", &self.transport_kind())
            .field("runtime_dir", &self.runtime_dir)
            .finish()
    }
}

fn build_runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("instance-relay")
        .enable_all()
        .build()
        .map_err(|e| RelayError::Runtime {
            message: format!("failed to start runtime: {}", e),
        })
}

/// Everything the leader must tear down, in order, on every exit path.
struct LeaderSession {
    runtime: Option<Runtime>,
    cancel: CancellationToken,
    listener: Option<JoinHandle<()>>,
    lock: Option<LeaderLock>,
}

impl LeaderSession {
    fn block_on<F: std::future::Future>(&self, future: F) -> Result<F::Output> {
        match &self.runtime {
            Some(runtime) => Ok(runtime.block_on(future)),
            None => Err(RelayError::InvalidState {
                message: "leader runtime already shut down".to_string(),
            }),
        }
    }

    /// Cancel and join the listener, wait for running callbacks, release the lock.
    fn shutdown(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let (Some(runtime), Some(listener)) = (&self.runtime, self.listener.take()) {
            if let Err(e) = runtime.block_on(listener) {
                error!("Listener task failed: {}", e);
            }
        }

        // Blocks until dispatched callbacks have returned
        drop(self.runtime.take());

        match self.lock.take() {
            Some(lock) => lock.release(),
            None => Ok(()),
        }
    }
}

impl Drop for LeaderSession {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Leader teardown failed: {}", e);
        }
    }
}
