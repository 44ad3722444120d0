//! Instance Relay - single-instance coordination for desktop and CLI applications.
//!
//! The first process of an application family becomes the *leader*. Every later
//! launch becomes a *follower*: it forwards its command line to the leader and
//! exits, and the leader reacts as if it had received the arguments itself.
//!
//! Leader election uses an exclusive OS lock. Arguments travel over one of two
//! interchangeable transports:
//!
//! - **Stream**: a Unix domain socket or Windows named pipe, one length-prefixed
//!   packet per connection, acknowledged by the leader
//! - **Mailbox**: a shared-memory control block plus a per-message argument
//!   region, coordinated by named signals
//!
//! # Example
//!
//! ```rust,no_run
//! use instance_relay::{Controller, InstanceIdentity, TransportKind};
//!
//! fn main() -> instance_relay::Result<()> {
//!     let mut controller = Controller::builder(InstanceIdentity::from_current_exe()?)
//!         .transport(TransportKind::Auto)
//!         .on_first_launch(|args| {
//!             println!("Leader started with {:?}", args);
//!             // Run the application until it exits
//!         })
//!         .on_subsequent_launch(|pid, args| {
//!             println!("Process {} was launched with {:?}", pid, args);
//!         })
//!         .build()?;
//!
//!     controller.run_with_env_args()
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod controller;
pub mod error;
pub mod handler;
pub mod identity;
pub mod ipc;
pub mod lock;
pub mod mailbox;
pub mod platform;
pub mod transport;

// Re-export commonly used types
pub use cancel::CancellationToken;
pub use config::{CallbackPanicPolicy, PacketEncoding, RelayConfig, TransportKind};
pub use controller::{Controller, ControllerBuilder, ControllerState, Role};
pub use error::{RelayError, Result};
pub use handler::{Dispatcher, FnHandler, LaunchHandler};
pub use identity::InstanceIdentity;
pub use ipc::{NextInstanceMessage, StreamTransport};
pub use lock::{LeaderLock, WriterLock};
pub use mailbox::MailboxTransport;
pub use transport::{resolve_kind, select_transport, Transport};
