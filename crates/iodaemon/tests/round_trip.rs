#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::unreachable
)]

use std::path::PathBuf;
use std::time::Duration;

use garden::{TtySpec, WindowSize};
use iodaemon::{ExitStatus, Link, SpawnConfig, SpawnResult, spawn};
use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, Lines};
use tokio::task::JoinHandle;

const LINK_TIMEOUT: Duration = Duration::from_secs(5);

/// A daemon serving one process from a temp dir.
///
/// Construction waits for `ready`, so the socket is bound when `start`
/// returns.
struct Daemon {
    _dir: tempfile::TempDir,
    socket: PathBuf,
    notifications: Lines<BufReader<DuplexStream>>,
    task: JoinHandle<SpawnResult<ExitStatus>>,
}

impl Daemon {
    async fn start(argv: &[&str]) -> Self {
        Self::start_with(argv, None).await
    }

    async fn start_with(argv: &[&str], tty: Option<TtySpec>) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let socket = dir.path().join("processes/1/iodaemon.sock");
        let config = SpawnConfig {
            socket_path: socket.clone(),
            argv: argv.iter().map(|a| a.to_string()).collect(),
            timeout: Duration::from_secs(10),
            tty,
        };

        let (writer, reader) = tokio::io::duplex(1024);
        let task = tokio::spawn(spawn::run(config, writer));
        let mut notifications = BufReader::new(reader).lines();
        assert_eq!(
            notifications.next_line().await.unwrap().as_deref(),
            Some("ready")
        );

        Self {
            _dir: dir,
            socket,
            notifications,
            task,
        }
    }

    async fn link(&self) -> Link {
        Link::connect(&self.socket, LINK_TIMEOUT)
            .await
            .expect("link failed")
    }

    async fn expect_active(&mut self) {
        assert_eq!(
            self.notifications.next_line().await.unwrap().as_deref(),
            Some("active")
        );
    }

    async fn finish(self) -> ExitStatus {
        let status = self
            .task
            .await
            .expect("daemon task panicked")
            .expect("daemon failed");
        assert!(!self.socket.exists(), "socket left behind");
        status
    }
}

async fn run_link(link: Link, stdin: &'static [u8]) -> (String, String, ExitStatus) {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let status = link.run(stdin, &mut stdout, &mut stderr).await.unwrap();
    (
        String::from_utf8(stdout).unwrap(),
        String::from_utf8(stderr).unwrap(),
        status,
    )
}

#[tokio::test]
async fn cat_echoes_stdin() {
    let mut daemon = Daemon::start(&["bash", "-c", "cat <&0"]).await;
    let link = daemon.link().await;
    daemon.expect_active().await;

    let (stdout, stderr, status) = run_link(link, b"hello\ngoodbye").await;
    assert_eq!(stdout, "hello\ngoodbye");
    assert_eq!(stderr, "");
    assert_eq!(status, ExitStatus::Exited(0));
    assert_eq!(daemon.finish().await, ExitStatus::Exited(0));
}

#[tokio::test]
async fn exit_code_is_reported() {
    let daemon = Daemon::start(&["bash", "-c", "cat <&0; exit 42"]).await;
    let link = daemon.link().await;

    let (stdout, _, status) = run_link(link, b"hello\ngoodbye").await;
    assert_eq!(stdout, "hello\ngoodbye");
    assert_eq!(status, ExitStatus::Exited(42));
    assert_eq!(status.code(), 42);
    assert_eq!(daemon.finish().await, ExitStatus::Exited(42));
}

#[tokio::test]
async fn stdout_and_stderr_stay_separate() {
    let daemon = Daemon::start(&["sh", "-c", "echo out; echo err >&2"]).await;
    let link = daemon.link().await;

    let (stdout, stderr, status) = run_link(link, b"").await;
    assert_eq!(stdout, "out\n");
    assert_eq!(stderr, "err\n");
    assert_eq!(status, ExitStatus::Exited(0));
    daemon.finish().await;
}

#[tokio::test]
async fn second_link_reattaches_to_running_process() {
    let daemon = Daemon::start(&["bash", "-c", "read line; echo got $line; exit 3"]).await;

    // First client attaches (starting the process) and goes away
    let first = daemon.link().await;
    drop(first);

    let second = daemon.link().await;
    let (stdout, _, status) = run_link(second, b"again\n").await;
    assert_eq!(stdout, "got again\n");
    assert_eq!(status, ExitStatus::Exited(3));
    daemon.finish().await;
}

#[tokio::test]
async fn signal_through_control_channel() {
    let daemon = Daemon::start(&["sleep", "30"]).await;
    let link = daemon.link().await;
    let parts = link.into_parts();

    parts.control.signal(libc::SIGTERM).await.unwrap();
    let status = tokio::time::timeout(LINK_TIMEOUT, parts.status.wait())
        .await
        .expect("status not reported")
        .unwrap();
    assert_eq!(status, ExitStatus::Signaled(libc::SIGTERM));
    assert_eq!(status.code(), 128 + libc::SIGTERM);
    daemon.finish().await;
}

#[tokio::test]
async fn tty_mode_shares_one_terminal() {
    let daemon = Daemon::start_with(
        &["bash", "-c", "test -t 0 && test -t 1 && echo isatty; stty size; exit 5"],
        Some(TtySpec {
            window_size: Some(WindowSize {
                columns: 100,
                rows: 30,
            }),
        }),
    )
    .await;
    let link = daemon.link().await;

    let (stdout, stderr, status) = run_link(link, b"").await;
    assert!(stdout.contains("isatty"), "{stdout:?}");
    assert!(stdout.contains("30 100"), "{stdout:?}");
    assert_eq!(stderr, "");
    assert_eq!(status, ExitStatus::Exited(5));
    daemon.finish().await;
}

#[tokio::test]
async fn link_times_out_against_unresponsive_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mute.sock");
    let listener = tokio::net::UnixListener::bind(&path).unwrap();
    let _held = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        drop(stream);
    });

    let err = Link::connect(&path, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("within"), "{err}");
}
