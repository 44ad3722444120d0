//! Builder for configuring a Controller.

use std::path::PathBuf;
use std::sync::Arc;

use super::{Controller, ControllerState, Role};
use crate::config::{CallbackPanicPolicy, PacketEncoding, TransportKind};
use crate::error::{RelayError, Result};
use crate::handler::{FnHandler, LaunchHandler};
use crate::identity::InstanceIdentity;
use crate::lock::LeaderLock;
use crate::{platform, transport};
use tracing::info;

/// Builder for configuring a [`Controller`].
///
/// Building elects the role: the leader lock is tried once, without waiting, and
/// the outcome never changes for the life of the controller.
///
/// # Example
///
/// ```rust,no_run
/// use instance_relay::{Controller, InstanceIdentity};
///
/// let mut controller = Controller::builder(InstanceIdentity::new("com.example.viewer")?)
///     .on_first_launch(|args| println!("started with {:?}", args))
///     .on_subsequent_launch(|pid, args| println!("process {} sent {:?}", pid, args))
///     .build()?;
/// controller.run_with_env_args()?;
/// # Ok::<(), instance_relay::RelayError>(())
/// ```
pub struct ControllerBuilder {
    identity: InstanceIdentity,
    transport: TransportKind,
    encoding: PacketEncoding,
    runtime_dir: Option<PathBuf>,
    panic_policy: CallbackPanicPolicy,
    handler: Option<Arc<dyn LaunchHandler>>,
    callbacks: FnHandler,
    single_instance: bool,
}

impl ControllerBuilder {
    /// Create a new builder for an application family.
    pub fn new(identity: InstanceIdentity) -> Self {
        Self {
            identity,
            transport: TransportKind::default(),
            encoding: PacketEncoding::default(),
            runtime_dir: None,
            panic_policy: CallbackPanicPolicy::default(),
            handler: None,
            callbacks: FnHandler::new(),
            single_instance: true,
        }
    }

    /// Transport used by every process of the family.
    ///
    /// Default: [`TransportKind::Auto`]
    pub fn transport(mut self, kind: TransportKind) -> Self {
        self.transport = kind;
        self
    }

    /// Payload encoding of the stream transport. Leader and followers must agree.
    ///
    /// Default: [`PacketEncoding::Json`]
    pub fn encoding(mut self, encoding: PacketEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Directory holding lock files and socket endpoints. Created if missing.
    ///
    /// Default: the per-user runtime directory, or `{temp}/instance-relay`
    pub fn runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = Some(dir.into());
        self
    }

    /// What happens when a subsequent-launch callback panics.
    ///
    /// Default: [`CallbackPanicPolicy::Swallow`]
    pub fn panic_policy(mut self, policy: CallbackPanicPolicy) -> Self {
        self.panic_policy = policy;
        self
    }

    /// Whether this application coordinates its launches at all.
    ///
    /// With `false` no lock is taken and no transport is set up: every launch is
    /// [`Role::Standalone`], `run` calls `on_first_launch` and nothing else.
    ///
    /// Default: `true`
    pub fn single_instance(mut self, enabled: bool) -> Self {
        self.single_instance = enabled;
        self
    }

    /// Use a handler object. Takes precedence over closures set on this builder.
    pub fn handler(mut self, handler: Arc<dyn LaunchHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn on_first_launch(mut self, f: impl Fn(&[String]) + Send + Sync + 'static) -> Self {
        self.callbacks = std::mem::take(&mut self.callbacks).on_first_launch(f);
        self
    }

    pub fn on_subsequent_launch(
        mut self,
        f: impl Fn(i32, Vec<String>) + Send + Sync + 'static,
    ) -> Self {
        self.callbacks = std::mem::take(&mut self.callbacks).on_subsequent_launch(f);
        self
    }

    pub fn on_subsequent_launch_error(
        mut self,
        f: impl Fn(RelayError) + Send + Sync + 'static,
    ) -> Self {
        self.callbacks = std::mem::take(&mut self.callbacks).on_subsequent_launch_error(f);
        self
    }

    /// Elect the role and build the controller.
    ///
    /// Fails only if the runtime directory or the lock cannot be created.
    pub fn build(self) -> Result<Controller> {
        let handler: Arc<dyn LaunchHandler> = match self.handler {
            Some(handler) => handler,
            None => Arc::new(self.callbacks),
        };

        if !self.single_instance {
            info!("Instance {} runs standalone", self.identity);
            return Ok(Controller {
                identity: self.identity,
                runtime_dir: self
                    .runtime_dir
                    .unwrap_or_else(platform::default_runtime_dir),
                role: Role::Standalone,
                state: ControllerState::Standalone,
                lock: None,
                transport: None,
                handler,
                panic_policy: self.panic_policy,
            });
        }

        let runtime_dir = self
            .runtime_dir
            .unwrap_or_else(platform::default_runtime_dir);
        platform::ensure_runtime_dir(&runtime_dir)?;

        let lock = LeaderLock::acquire(&runtime_dir, &self.identity)?;
        let role = if lock.acquired_as_leader() {
            Role::Leader
        } else {
            Role::Follower
        };

        let transport =
            transport::select_transport(self.transport, &self.identity, &runtime_dir, self.encoding);

        info!(
            "Instance {} elected {} ({} transport)",
            self.identity,
            role,
            transport.kind()
        );

        Ok(Controller {
            identity: self.identity,
            runtime_dir,
            role,
            state: match role {
                Role::Follower => ControllerState::Follower,
                _ => ControllerState::Leader,
            },
            lock: Some(lock),
            transport: Some(transport),
            handler,
            panic_policy: self.panic_policy,
        })
    }
}
