//! Host application callbacks and their dispatch.
//!
//! The leader calls [`LaunchHandler::on_first_launch`] once on the caller's thread.
//! Every follower message is handed to [`Dispatcher::dispatch`], which runs
//! [`LaunchHandler::on_subsequent_launch`] on its own blocking task so a slow
//! callback never stalls the accept loop. Subsequent-launch callbacks can therefore
//! run concurrently with each other and with `on_first_launch`.

use crate::cancel::CancellationToken;
use crate::config::CallbackPanicPolicy;
use crate::error::RelayError;
use crate::ipc::protocol::NextInstanceMessage;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

/// Callbacks implemented by the host application.
pub trait LaunchHandler: Send + Sync + 'static {
    /// Called exactly once, in the leader, with the leader's own arguments.
    fn on_first_launch(&self, args: &[String]);

    /// Called in the leader once per follower message.
    fn on_subsequent_launch(&self, process_id: i32, args: Vec<String>);

    /// Called in the leader when a mailbox payload could not be decoded.
    fn on_subsequent_launch_error(&self, error: RelayError) {
        warn!("Discarding undecodable follower message: {}", error);
    }
}

type FirstLaunchFn = dyn Fn(&[String]) + Send + Sync;
type SubsequentLaunchFn = dyn Fn(i32, Vec<String>) + Send + Sync;
type LaunchErrorFn = dyn Fn(RelayError) + Send + Sync;

/// [`LaunchHandler`] built from closures. Missing closures do nothing.
#[derive(Default)]
pub struct FnHandler {
    first: Option<Box<FirstLaunchFn>>,
    subsequent: Option<Box<SubsequentLaunchFn>>,
    error: Option<Box<LaunchErrorFn>>,
}

impl FnHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_first_launch(mut self, f: impl Fn(&[String]) + Send + Sync + 'static) -> Self {
        self.first = Some(Box::new(f));
        self
    }

    pub fn on_subsequent_launch(
        mut self,
        f: impl Fn(i32, Vec<String>) + Send + Sync + 'static,
    ) -> Self {
        self.subsequent = Some(Box::new(f));
        self
    }

    pub fn on_subsequent_launch_error(
        mut self,
        f: impl Fn(RelayError) + Send + Sync + 'static,
    ) -> Self {
        self.error = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for FnHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnHandler")
            .field("first", &self.first.is_some())
            .field("subsequent", &self.subsequent.is_some())
            .field("error", &self.error.is_some())
            .finish()
    }
}

impl LaunchHandler for FnHandler {
    fn on_first_launch(&self, args: &[String]) {
        if let Some(f) = &self.first {
            f(args);
        }
    }

    fn on_subsequent_launch(&self, process_id: i32, args: Vec<String>) {
        if let Some(f) = &self.subsequent {
            f(process_id, args);
        }
    }

    fn on_subsequent_launch_error(&self, error: RelayError) {
        match &self.error {
            Some(f) => f(error),
            None => warn!("Discarding undecodable follower message: {}", error),
        }
    }
}

type PanicPayload = Box<dyn Any + Send + 'static>;

/// Runs subsequent-launch callbacks on background tasks and applies the panic policy.
#[derive(Clone)]
pub struct Dispatcher {
    handler: Arc<dyn LaunchHandler>,
    policy: CallbackPanicPolicy,
    panic: Arc<Mutex<Option<PanicPayload>>>,
    runtime: Handle,
    cancel: CancellationToken,
}

impl Dispatcher {
    /// `cancel` is cancelled when a callback panics under
    /// [`CallbackPanicPolicy::Propagate`].
    pub fn new(
        handler: Arc<dyn LaunchHandler>,
        policy: CallbackPanicPolicy,
        runtime: Handle,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            handler,
            policy,
            panic: Arc::new(Mutex::new(None)),
            runtime,
            cancel,
        }
    }

    /// Hand a message to `on_subsequent_launch` on a background task.
    ///
    /// The returned receiver resolves once the callback has started. Callable from
    /// async tasks and plain threads alike.
    pub fn dispatch(&self, message: NextInstanceMessage) -> oneshot::Receiver<()> {
        let NextInstanceMessage {
            process_id,
            arguments,
        } = message;
        debug!(
            "Dispatching launch from process {} ({} args)",
            process_id,
            arguments.len()
        );
        self.spawn_callback(move |handler| handler.on_subsequent_launch(process_id, arguments))
    }

    /// Hand a decode failure to `on_subsequent_launch_error` on a background task.
    pub fn dispatch_error(&self, error: RelayError) -> oneshot::Receiver<()> {
        self.spawn_callback(move |handler| handler.on_subsequent_launch_error(error))
    }

    fn spawn_callback<F>(&self, callback: F) -> oneshot::Receiver<()>
    where
        F: FnOnce(&dyn LaunchHandler) + Send + 'static,
    {
        let (started_tx, started_rx) = oneshot::channel();
        let this = self.clone();
        self.runtime.spawn_blocking(move || {
            let _ = started_tx.send(());
            let handler = this.handler.clone();
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(handler.as_ref()))) {
                this.on_panic(payload);
            }
        });
        started_rx
    }

    fn on_panic(&self, payload: PanicPayload) {
        let message = panic_message(payload.as_ref());
        match self.policy {
            CallbackPanicPolicy::Swallow => {
                error!("Subsequent-launch callback panicked: {}", message);
            }
            CallbackPanicPolicy::Propagate => {
                error!(
                    "Subsequent-launch callback panicked, stopping listener: {}",
                    message
                );
                if let Ok(mut slot) = self.panic.lock() {
                    // Keep the first panic
                    if slot.is_none() {
                        *slot = Some(payload);
                    }
                }
                self.cancel.cancel();
            }
        }
    }

    /// Take the panic captured under [`CallbackPanicPolicy::Propagate`], if any.
    pub fn take_panic(&self) -> Option<PanicPayload> {
        self.panic.lock().ok().and_then(|mut slot| slot.take())
    }

    pub fn handler(&self) -> &Arc<dyn LaunchHandler> {
        &self.handler
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}
