//! Integration tests for leader/follower handoff through the public Controller API.
//!
//! Leader and followers run as threads of the test process; the locks and
//! transports behave exactly as they do across processes.

use instance_relay::{
    CallbackPanicPolicy, Controller, InstanceIdentity, LeaderLock, PacketEncoding, Result,
    TransportKind,
};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Barrier, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tempfile::TempDir;

const RECV_TIMEOUT: Duration = Duration::from_secs(15);

fn unique_identity() -> InstanceIdentity {
    // Kept short so derived shared-memory names stay within OS limits
    let id = uuid::Uuid::new_v4().simple().to_string();
    InstanceIdentity::new(format!("t{}", &id[..12])).expect("valid identity")
}

/// A leader running on its own thread until `stop` is called.
struct LeaderHarness {
    stop_tx: Sender<()>,
    thread: JoinHandle<Result<()>>,
    launches: Receiver<(i32, Vec<String>)>,
    errors: Receiver<String>,
}

impl LeaderHarness {
    fn start(
        dir: &TempDir,
        identity: &InstanceIdentity,
        transport: TransportKind,
        encoding: PacketEncoding,
        policy: CallbackPanicPolicy,
    ) -> Self {
        let (ready_tx, ready_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (launch_tx, launches) = mpsc::channel();
        let (error_tx, errors) = mpsc::channel();
        let stop_rx = Mutex::new(stop_rx);
        let launch_tx = Mutex::new(launch_tx);
        let error_tx = Mutex::new(error_tx);

        let mut controller = Controller::builder(identity.clone())
            .runtime_dir(dir.path())
            .transport(transport)
            .encoding(encoding)
            .panic_policy(policy)
            .on_first_launch(move |_| {
                ready_tx.send(()).unwrap();
                let _ = stop_rx.lock().unwrap().recv();
            })
            .on_subsequent_launch(move |pid, args| {
                if args.first().map(String::as_str) == Some("--panic") {
                    panic!("boom");
                }
                let _ = launch_tx.lock().unwrap().send((pid, args));
            })
            .on_subsequent_launch_error(move |e| {
                let _ = error_tx.lock().unwrap().send(e.to_string());
            })
            .build()
            .expect("leader builds");
        assert!(controller.is_leader());

        let thread = std::thread::spawn(move || controller.run(Vec::new()));
        ready_rx
            .recv_timeout(RECV_TIMEOUT)
            .expect("leader should start listening");

        Self {
            stop_tx,
            thread,
            launches,
            errors,
        }
    }

    fn next_launch(&self) -> (i32, Vec<String>) {
        self.launches
            .recv_timeout(RECV_TIMEOUT)
            .expect("leader should receive a launch")
    }

    fn stop(self) -> std::thread::Result<Result<()>> {
        let _ = self.stop_tx.send(());
        self.thread.join()
    }
}

fn follow(
    dir: &TempDir,
    identity: &InstanceIdentity,
    transport: TransportKind,
    encoding: PacketEncoding,
    args: &[&str],
) -> Result<()> {
    let mut controller = Controller::builder(identity.clone())
        .runtime_dir(dir.path())
        .transport(transport)
        .encoding(encoding)
        .build()?;
    assert!(!controller.is_leader());
    controller.run(args.iter().map(|s| s.to_string()).collect())
}

fn long_identity(len: usize) -> InstanceIdentity {
    let suffix = &uuid::Uuid::new_v4().simple().to_string()[..12];
    InstanceIdentity::new(format!("{}{}", "x".repeat(len - suffix.len()), suffix))
        .expect("valid identity")
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn assert_forwarded_launch(transport: TransportKind, encoding: PacketEncoding) {
    let dir = TempDir::new().unwrap();
    let id = unique_identity();
    let leader = LeaderHarness::start(&dir, &id, transport, encoding, CallbackPanicPolicy::Swallow);

    follow(&dir, &id, transport, encoding, &["--foo", "bar baz"]).unwrap();

    let (pid, args) = leader.next_launch();
    assert_eq!(pid as u32, std::process::id());
    assert_eq!(args, strings(&["--foo", "bar baz"]));

    leader.stop().unwrap().unwrap();
}

fn assert_back_to_back_followers(transport: TransportKind) {
    let dir = TempDir::new().unwrap();
    let id = unique_identity();
    let leader = LeaderHarness::start(
        &dir,
        &id,
        transport,
        PacketEncoding::Json,
        CallbackPanicPolicy::Swallow,
    );

    follow(&dir, &id, transport, PacketEncoding::Json, &["a"]).unwrap();
    follow(&dir, &id, transport, PacketEncoding::Json, &["b"]).unwrap();

    let mut received = vec![leader.next_launch().1, leader.next_launch().1];
    received.sort();
    assert_eq!(received, vec![strings(&["a"]), strings(&["b"])]);
    assert!(leader.launches.recv_timeout(Duration::from_millis(200)).is_err());

    leader.stop().unwrap().unwrap();
}

#[test]
fn test_stream_follower_arguments_reach_leader() {
    assert_forwarded_launch(TransportKind::Stream, PacketEncoding::Json);
}

#[test]
fn test_stream_binary_encoding_reaches_leader() {
    assert_forwarded_launch(TransportKind::Stream, PacketEncoding::Binary);
}

#[test]
fn test_stream_back_to_back_followers() {
    assert_back_to_back_followers(TransportKind::Stream);
}

#[test]
fn test_auto_transport_round_trip() {
    assert_forwarded_launch(TransportKind::Auto, PacketEncoding::Json);
}

#[test]
fn test_empty_arguments_are_delivered() {
    let dir = TempDir::new().unwrap();
    let id = unique_identity();
    let leader = LeaderHarness::start(
        &dir,
        &id,
        TransportKind::Stream,
        PacketEncoding::Json,
        CallbackPanicPolicy::Swallow,
    );

    follow(&dir, &id, TransportKind::Stream, PacketEncoding::Json, &[]).unwrap();
    assert_eq!(leader.next_launch().1, Vec::<String>::new());

    leader.stop().unwrap().unwrap();
}

#[test]
fn test_racing_controllers_elect_one_leader() {
    let dir = Arc::new(TempDir::new().unwrap());
    let id = unique_identity();
    let barrier = Arc::new(Barrier::new(6));

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let dir = dir.clone();
            let id = id.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                Controller::builder(id)
                    .runtime_dir(dir.path())
                    .build()
                    .unwrap()
            })
        })
        .collect();

    let controllers: Vec<Controller> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(controllers.iter().filter(|c| c.is_leader()).count(), 1);
}

#[test]
fn test_follower_without_listening_leader_fails() {
    let dir = TempDir::new().unwrap();
    let id = unique_identity();
    // Someone holds the lock but never listens
    let _lock = LeaderLock::acquire(dir.path(), &id).unwrap();

    let err = follow(&dir, &id, TransportKind::Stream, PacketEncoding::Json, &["x"]).unwrap_err();
    assert!(err.is_follower_fatal(), "unexpected error: {}", err);
}

#[test]
fn test_cancellation_after_messages_delivers_all_and_releases() {
    let dir = TempDir::new().unwrap();
    let id = unique_identity();
    let leader = LeaderHarness::start(
        &dir,
        &id,
        TransportKind::Stream,
        PacketEncoding::Json,
        CallbackPanicPolicy::Swallow,
    );

    for n in 0..3 {
        follow(&dir, &id, TransportKind::Stream, PacketEncoding::Json, &[&n.to_string()]).unwrap();
    }

    let launches = leader.launches;
    let stop_tx = leader.stop_tx;
    stop_tx.send(()).unwrap();
    leader.thread.join().unwrap().unwrap();

    let mut received: Vec<String> = launches.try_iter().map(|(_, args)| args.concat()).collect();
    received.sort();
    assert_eq!(received, strings(&["0", "1", "2"]));

    // The listener is gone and the lock is free again
    let next = Controller::builder(id).runtime_dir(dir.path()).build().unwrap();
    assert!(next.is_leader());
}

#[test]
fn test_swallowed_callback_panic_keeps_leader_listening() {
    let dir = TempDir::new().unwrap();
    let id = unique_identity();
    let leader = LeaderHarness::start(
        &dir,
        &id,
        TransportKind::Stream,
        PacketEncoding::Json,
        CallbackPanicPolicy::Swallow,
    );

    follow(&dir, &id, TransportKind::Stream, PacketEncoding::Json, &["--panic"]).unwrap();
    follow(&dir, &id, TransportKind::Stream, PacketEncoding::Json, &["after"]).unwrap();

    assert_eq!(leader.next_launch().1, strings(&["after"]));
    leader.stop().unwrap().unwrap();
}

#[test]
fn test_propagated_callback_panic_resumes_from_run() {
    let dir = TempDir::new().unwrap();
    let id = unique_identity();
    let leader = LeaderHarness::start(
        &dir,
        &id,
        TransportKind::Stream,
        PacketEncoding::Json,
        CallbackPanicPolicy::Propagate,
    );

    follow(&dir, &id, TransportKind::Stream, PacketEncoding::Json, &["--panic"]).unwrap();

    let payload = leader.stop().expect_err("run should resume the callback panic");
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));

    // Teardown released the lock before the panic resumed
    let next = Controller::builder(id).runtime_dir(dir.path()).build().unwrap();
    assert!(next.is_leader());
}

#[test]
fn test_longest_identities_build_and_hand_off() {
    for len in [220, 250, 260] {
        let dir = TempDir::new().unwrap();
        let id = long_identity(len);
        let leader = LeaderHarness::start(
            &dir,
            &id,
            TransportKind::Auto,
            PacketEncoding::Json,
            CallbackPanicPolicy::Swallow,
        );

        follow(&dir, &id, TransportKind::Auto, PacketEncoding::Json, &["--foo"]).unwrap();
        assert_eq!(leader.next_launch().1, strings(&["--foo"]));

        leader.stop().unwrap().unwrap();
    }
}

#[cfg(unix)]
#[test]
fn test_truncated_packet_never_reaches_callback() {
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    let dir = TempDir::new().unwrap();
    let id = unique_identity();
    let leader = LeaderHarness::start(
        &dir,
        &id,
        TransportKind::Stream,
        PacketEncoding::Json,
        CallbackPanicPolicy::Swallow,
    );

    let endpoint = dir.path().join(id.channel_name());
    {
        // Length prefix promises 64 bytes, only 5 arrive
        let mut raw = UnixStream::connect(&endpoint).unwrap();
        raw.write_all(&64u32.to_le_bytes()).unwrap();
        raw.write_all(b"{\"pro").unwrap();
    }
    {
        // Two bytes of a length prefix
        let mut raw = UnixStream::connect(&endpoint).unwrap();
        raw.write_all(&[1, 0]).unwrap();
    }

    follow(&dir, &id, TransportKind::Stream, PacketEncoding::Json, &["valid"]).unwrap();

    assert_eq!(leader.next_launch().1, strings(&["valid"]));
    assert!(leader.launches.recv_timeout(Duration::from_millis(200)).is_err());
    assert!(leader.errors.try_recv().is_err());

    leader.stop().unwrap().unwrap();
}

#[cfg(any(target_os = "linux", windows))]
mod mailbox {
    use super::*;
    use instance_relay::mailbox::{MailboxControlBlock, NamedSignal, SharedRegion};
    use instance_relay::RelayError;

    #[test]
    fn test_mailbox_follower_arguments_reach_leader() {
        assert_forwarded_launch(TransportKind::Mailbox, PacketEncoding::Json);
    }

    #[test]
    fn test_mailbox_back_to_back_followers() {
        assert_back_to_back_followers(TransportKind::Mailbox);
    }

    #[test]
    fn test_mailbox_ten_thousand_arguments() {
        let dir = TempDir::new().unwrap();
        let id = unique_identity();
        let leader = LeaderHarness::start(
            &dir,
            &id,
            TransportKind::Mailbox,
            PacketEncoding::Json,
            CallbackPanicPolicy::Swallow,
        );

        let args: Vec<String> = (0..10_000u32)
            .map(|i| char::from(b'a' + (i % 26) as u8).to_string())
            .collect();
        let borrowed: Vec<&str> = args.iter().map(String::as_str).collect();
        follow(&dir, &id, TransportKind::Mailbox, PacketEncoding::Json, &borrowed).unwrap();

        let (_, received) = leader.next_launch();
        assert_eq!(received.len(), 10_000);
        assert_eq!(received, args);

        leader.stop().unwrap().unwrap();
    }

    #[test]
    fn test_mailbox_empty_arguments() {
        let dir = TempDir::new().unwrap();
        let id = unique_identity();
        let leader = LeaderHarness::start(
            &dir,
            &id,
            TransportKind::Mailbox,
            PacketEncoding::Json,
            CallbackPanicPolicy::Swallow,
        );

        follow(&dir, &id, TransportKind::Mailbox, PacketEncoding::Json, &[]).unwrap();
        assert_eq!(leader.next_launch().1, Vec::<String>::new());

        leader.stop().unwrap().unwrap();
    }

    #[test]
    fn test_mailbox_unreadable_payload_reports_error() {
        let dir = TempDir::new().unwrap();
        let id = unique_identity();
        let leader = LeaderHarness::start(
            &dir,
            &id,
            TransportKind::Mailbox,
            PacketEncoding::Json,
            CallbackPanicPolicy::Swallow,
        );

        // A block pointing at a secondary region that was never created
        let block = MailboxControlBlock {
            process_id: 7,
            argument_count: 2,
            uses_secondary_region: true,
            rendezvous_id: uuid::Uuid::new_v4(),
            data_length: 16,
        };
        let mut mailbox = SharedRegion::open(&id.mailbox_name()).unwrap();
        mailbox.write(0, &block.encode()).unwrap();
        NamedSignal::open(&id.mailbox_signal_name())
            .unwrap()
            .set()
            .unwrap();

        let error = leader
            .errors
            .recv_timeout(RECV_TIMEOUT)
            .expect("error callback should run");
        assert!(!error.is_empty());

        // The leader keeps serving
        follow(&dir, &id, TransportKind::Mailbox, PacketEncoding::Json, &["ok"]).unwrap();
        assert_eq!(leader.next_launch().1, strings(&["ok"]));

        leader.stop().unwrap().unwrap();
    }

    #[test]
    fn test_mailbox_follower_without_leader_fails() {
        let dir = TempDir::new().unwrap();
        let id = unique_identity();
        let _lock = LeaderLock::acquire(dir.path(), &id).unwrap();

        let err = follow(&dir, &id, TransportKind::Mailbox, PacketEncoding::Json, &["x"])
            .unwrap_err();
        assert!(matches!(err, RelayError::NotListening { .. }));
    }

    #[test]
    fn test_mailbox_long_identity_hands_off() {
        let dir = TempDir::new().unwrap();
        let id = long_identity(220);
        let leader = LeaderHarness::start(
            &dir,
            &id,
            TransportKind::Mailbox,
            PacketEncoding::Json,
            CallbackPanicPolicy::Swallow,
        );

        follow(&dir, &id, TransportKind::Mailbox, PacketEncoding::Json, &["--foo"]).unwrap();
        assert_eq!(leader.next_launch().1, strings(&["--foo"]));

        leader.stop().unwrap().unwrap();
    }
}
