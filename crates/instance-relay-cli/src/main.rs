//! Instance Relay demo host.
//!
//! The first invocation for an id becomes the leader and prints the arguments of
//! every later invocation until Ctrl+C. Later invocations forward their trailing
//! arguments and exit.

use anyhow::{Context, Result};
use clap::Parser;
use instance_relay::{Controller, InstanceIdentity, PacketEncoding, TransportKind};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Mutex;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "instance-relay")]
#[command(about = "Run as the single leader instance, or forward arguments to it")]
struct Args {
    /// Application identity (defaults to one derived from this executable's path)
    #[arg(long)]
    id: Option<String>,

    /// Transport: auto, stream or mailbox
    #[arg(long, default_value = "auto", value_parser = parse_transport)]
    transport: TransportKind,

    /// Stream payload encoding: json or binary
    #[arg(long, default_value = "json", value_parser = parse_encoding)]
    encoding: PacketEncoding,

    /// Directory for lock files and socket endpoints
    #[arg(long)]
    runtime_dir: Option<PathBuf>,

    /// Enable debug logging (RUST_LOG directives take precedence)
    #[arg(short, long)]
    debug: bool,

    /// Run without single-instance coordination
    #[arg(long)]
    standalone: bool,

    /// Arguments to hand to the leader
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn parse_transport(s: &str) -> std::result::Result<TransportKind, String> {
    TransportKind::from_str(s).ok_or_else(|| format!("unknown transport '{}'", s))
}

fn parse_encoding(s: &str) -> std::result::Result<PacketEncoding, String> {
    PacketEncoding::from_str(s).ok_or_else(|| format!("unknown encoding '{}'", s))
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(log_level.into())
        .from_env_lossy();
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let identity = match &args.id {
        Some(id) => InstanceIdentity::new(id.as_str())?,
        None => InstanceIdentity::from_current_exe()?,
    };

    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .context("failed to install Ctrl+C handler")?;
    let stop_rx = Mutex::new(stop_rx);

    let mut builder = Controller::builder(identity)
        .transport(args.transport)
        .encoding(args.encoding)
        .single_instance(!args.standalone)
        .on_first_launch(move |launch_args| {
            println!("Leader started with {:?}. Press Ctrl+C to stop.", launch_args);
            if let Ok(rx) = stop_rx.lock() {
                let _ = rx.recv();
            }
        })
        .on_subsequent_launch(|pid, launch_args| {
            println!("Launch from process {}: {:?}", pid, launch_args);
        })
        .on_subsequent_launch_error(|e| {
            error!("Unreadable launch message: {}", e);
        });
    if let Some(dir) = args.runtime_dir {
        builder = builder.runtime_dir(dir);
    }

    let mut controller = builder.build()?;
    match controller.transport_kind() {
        Some(kind) => info!("Running as {} over {} transport", controller.role(), kind),
        None => info!("Running as {}", controller.role()),
    }

    if let Err(e) = controller.run(args.args) {
        error!("{}", e);
        std::process::exit(1);
    }

    Ok(())
}
