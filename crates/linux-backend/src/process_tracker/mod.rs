//! Processes running inside a container, each under its own I/O daemon.
//!
//! `run` spawns the daemon and waits for its `ready`/`active` handshake,
//! `attach` adds caller streams to a running process, and `restore`
//! reconnects to daemons that outlived a backend restart.

mod error;
mod fanin;
mod fanout;
mod process;
mod signaller;

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use garden::{BoxedReader, ProcessIo, ProcessSpec, TtySpec};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tracing::{debug, info, warn};

use crate::command::{CommandRunner, CommandSpec, RunningCommand};
use crate::config::ProcessConfig;
use crate::paths::ContainerPaths;

pub use error::{FanInError, ProcessError, ProcessResult};
pub use fanin::{FanIn, InputSink};
pub use fanout::FanOut;
pub use process::{Phase, Process};
pub use signaller::{LinkSignaller, NamespacedSignaller, SignalRequest, Signaller};

type Registry = Arc<RwLock<HashMap<String, Arc<Process>>>>;
type Notifications = Lines<BufReader<BoxedReader>>;

/// Tracks every process of one container by ID.
pub struct ProcessTracker {
    paths: ContainerPaths,
    runner: Arc<dyn CommandRunner>,
    config: ProcessConfig,
    namespaced: bool,
    processes: Registry,
}

impl ProcessTracker {
    pub fn new(paths: ContainerPaths, runner: Arc<dyn CommandRunner>, config: &ProcessConfig) -> Self {
        Self {
            paths,
            runner,
            config: config.clone(),
            namespaced: false,
            processes: Arc::default(),
        }
    }

    /// Run programs through the container's `wsh` instead of directly.
    pub fn namespaced(mut self, namespaced: bool) -> Self {
        self.namespaced = namespaced;
        self
    }

    /// The signaller matching how this tracker spawns processes.
    pub fn default_signaller(&self) -> Arc<dyn Signaller> {
        if self.namespaced {
            Arc::new(NamespacedSignaller::new(
                Arc::clone(&self.runner),
                self.paths.wsh(),
                self.paths.wshd_socket(),
                self.config.kill_retries,
                self.config.kill_backoff(),
            ))
        } else {
            Arc::new(LinkSignaller)
        }
    }

    /// Spawn `spec` under a new daemon and return once the child is running
    /// and linked.
    pub async fn run(
        &self,
        id: &str,
        spec: &ProcessSpec,
        io: ProcessIo,
        tty: Option<TtySpec>,
        signaller: Arc<dyn Signaller>,
    ) -> ProcessResult<Arc<Process>> {
        let process = self.register(id, signaller)?;
        match self.spawn(&process, spec, io, tty).await {
            Ok(()) => {
                info!(id, "process running");
                Ok(process)
            }
            Err(e) => {
                process.fail(&e.to_string()).await;
                unregister(&self.processes, &process);
                Err(e)
            }
        }
    }

    async fn spawn(
        &self,
        process: &Arc<Process>,
        spec: &ProcessSpec,
        io: ProcessIo,
        tty: Option<TtySpec>,
    ) -> ProcessResult<()> {
        let id = process.id();
        tokio::fs::create_dir_all(self.paths.process_dir(id))
            .await
            .map_err(|source| ProcessError::Prepare {
                id: id.to_string(),
                source,
            })?;

        let mut daemon = self.runner.start(&self.daemon_command(id, spec, tty)).await?;
        let stdout = daemon
            .take_stdout()
            .ok_or_else(|| handshake(id, "daemon stdout is not captured".into()))?;
        let mut notifications = BufReader::new(stdout).lines();

        self.await_notification(id, &mut notifications, "ready").await?;
        process.advance(Phase::Ready);

        process.attach(io).await;
        process.link();

        self.await_notification(id, &mut notifications, "active").await?;
        process.advance(Phase::Active);
        tokio::spawn(reap(id.to_string(), daemon));

        process.wait_linked(self.config.spawn_timeout()).await
    }

    async fn await_notification(
        &self,
        id: &str,
        notifications: &mut Notifications,
        expected: &str,
    ) -> ProcessResult<()> {
        let timeout = self.config.spawn_timeout();
        let line = tokio::time::timeout(timeout, notifications.next_line())
            .await
            .map_err(|_| handshake(id, format!("no {expected} notification within {timeout:?}")))?
            .map_err(|e| handshake(id, format!("read daemon notifications: {e}")))?;
        match line {
            Some(line) if line.trim() == expected => {
                debug!(id, notification = expected, "daemon notification");
                Ok(())
            }
            Some(line) => Err(handshake(id, format!("expected {expected}, got {line:?}"))),
            None => Err(handshake(id, format!("daemon exited before {expected}"))),
        }
    }

    fn daemon_command(&self, id: &str, spec: &ProcessSpec, tty: Option<TtySpec>) -> CommandSpec {
        let mut command = CommandSpec::new(self.paths.iodaemon().to_string_lossy())
            .arg("--timeout-ms")
            .arg(self.config.spawn_timeout_ms.to_string());
        if let Some(tty) = tty {
            command = command.arg("--tty");
            if let Some(size) = tty.window_size {
                command = command
                    .arg("--columns")
                    .arg(size.columns.to_string())
                    .arg("--rows")
                    .arg(size.rows.to_string());
            }
        }
        command = command
            .arg("spawn")
            .arg(self.paths.process_socket(id).to_string_lossy());

        if self.namespaced {
            command = command
                .arg(self.paths.wsh().to_string_lossy())
                .arg("--socket")
                .arg(self.paths.wshd_socket().to_string_lossy())
                .arg("--user")
                .arg(spec.user.as_str());
            for var in &spec.env {
                command = command.arg("--env").arg(var.as_str());
            }
            if let Some(dir) = &spec.dir {
                command = command.arg("--dir").arg(dir.as_str());
            }
            command = command
                .arg("--pidfile")
                .arg(self.paths.pid_file(id).to_string_lossy());
        }
        command.arg(spec.path.as_str()).args(spec.args.iter().cloned())
    }

    /// Add streams to a running process, linking it if nothing has yet.
    pub async fn attach(&self, id: &str, io: ProcessIo) -> ProcessResult<Arc<Process>> {
        let process = self
            .lookup(id)
            .ok_or_else(|| ProcessError::NotFound(id.to_string()))?;
        process.attach(io).await;
        if process.link() {
            debug!(id, "attach started the link");
        }
        Ok(process)
    }

    /// Track a process whose daemon survived a backend restart.
    pub fn restore(&self, id: &str, signaller: Arc<dyn Signaller>) -> ProcessResult<Arc<Process>> {
        let process = self.register(id, signaller)?;
        process.link();
        info!(id, "process restored");
        Ok(process)
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<Process>> {
        self.processes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn active_processes(&self) -> Vec<Arc<Process>> {
        self.processes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn register(&self, id: &str, signaller: Arc<dyn Signaller>) -> ProcessResult<Arc<Process>> {
        let process = {
            let mut processes = self.processes.write().unwrap_or_else(PoisonError::into_inner);
            if processes.contains_key(id) {
                return Err(ProcessError::AlreadyTracked(id.to_string()));
            }
            let process = Process::new(
                id.to_string(),
                self.paths.process_socket(id),
                self.paths.pid_file(id),
                self.config.spawn_timeout(),
                signaller,
            );
            processes.insert(id.to_string(), Arc::clone(&process));
            process
        };

        let registry = Arc::clone(&self.processes);
        let watched = Arc::clone(&process);
        tokio::spawn(async move {
            if let Err(e) = watched.wait().await {
                debug!(id = watched.id(), error = %e, "process ended without a status");
            }
            unregister(&registry, &watched);
        });
        Ok(process)
    }
}

/// Drop `process` from the registry unless a newer entry replaced it.
fn unregister(registry: &Registry, process: &Arc<Process>) {
    let mut processes = registry.write().unwrap_or_else(PoisonError::into_inner);
    match processes.get(process.id()) {
        Some(current) if Arc::ptr_eq(current, process) => {
            processes.remove(process.id());
        }
        _ => {}
    }
    drop(processes);
    process.advance(Phase::Unregistered);
}

async fn reap(id: String, daemon: RunningCommand) {
    match daemon.wait().await {
        Ok(0) => debug!(%id, "daemon exited"),
        Ok(code) => warn!(%id, code, "daemon exited with failure"),
        Err(e) => warn!(%id, error = %e, "daemon wait failed"),
    }
}

fn handshake(id: &str, detail: String) -> ProcessError {
    ProcessError::Handshake {
        id: id.to_string(),
        detail,
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::path::Path;
    use std::time::Duration;

    use async_trait::async_trait;
    use clap::Parser;
    use garden::{Signal, WindowSize};
    use iodaemon::ExitStatus;
    use iodaemon::cli::Cli;
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::command::CommandError;
    use crate::command::recording::RecordingRunner;

    /// Runs `iodaemon spawn` on the test runtime instead of forking the binary.
    struct InProcessRunner;

    #[async_trait]
    impl CommandRunner for InProcessRunner {
        async fn run(&self, spec: &CommandSpec) -> Result<String, CommandError> {
            Err(CommandError {
                command: spec.display(),
                detail: "not supported in process".into(),
            })
        }

        async fn start(&self, spec: &CommandSpec) -> Result<RunningCommand, CommandError> {
            let argv = std::iter::once(spec.program.clone()).chain(spec.args.iter().cloned());
            let cli = Cli::try_parse_from(argv).map_err(|e| CommandError {
                command: spec.display(),
                detail: e.to_string(),
            })?;
            let config = cli.spawn_config().ok_or_else(|| CommandError {
                command: spec.display(),
                detail: "not a spawn invocation".into(),
            })?;

            let (writer, reader) = tokio::io::duplex(256);
            let exit = tokio::spawn(async move {
                match iodaemon::spawn::run(config, writer).await {
                    Ok(_) => Ok(0),
                    Err(e) => Err(io::Error::other(e)),
                }
            });
            Ok(RunningCommand::new(spec.display(), Some(Box::new(reader)), exit))
        }
    }

    fn config() -> ProcessConfig {
        ProcessConfig {
            spawn_timeout_ms: 5_000,
            kill_retries: 3,
            kill_backoff_ms: 10,
        }
    }

    fn tracker(dir: &Path) -> ProcessTracker {
        ProcessTracker::new(
            ContainerPaths::new(dir.to_path_buf()),
            Arc::new(InProcessRunner),
            &config(),
        )
    }

    fn sh(script: &str) -> ProcessSpec {
        ProcessSpec::new("sh").arg("-c").arg(script)
    }

    async fn read_all(mut reader: tokio::io::DuplexStream) -> String {
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        out
    }

    async fn wait_until_untracked(tracker: &ProcessTracker, id: &str) {
        for _ in 0..200 {
            if tracker.lookup(id).is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("process {id} still tracked");
    }

    #[tokio::test]
    async fn run_streams_stdin_to_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path());
        let (stdout, stdout_read) = tokio::io::duplex(1024);
        let io = ProcessIo::default()
            .with_stdin(&b"hello through the daemon"[..])
            .with_stdout(stdout);

        let process = tracker
            .run("1", &ProcessSpec::new("cat"), io, None, Arc::new(LinkSignaller))
            .await
            .unwrap();
        assert!(process.phase() >= Phase::Active);

        assert_eq!(process.wait().await.unwrap(), ExitStatus::Exited(0));
        assert_eq!(read_all(stdout_read).await, "hello through the daemon");
    }

    #[tokio::test]
    async fn exit_code_and_stderr_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path());
        let (stderr, stderr_read) = tokio::io::duplex(1024);

        let process = tracker
            .run(
                "1",
                &sh("echo oops >&2; exit 3"),
                ProcessIo::default().with_stderr(stderr),
                None,
                Arc::new(LinkSignaller),
            )
            .await
            .unwrap();

        assert_eq!(process.wait().await.unwrap(), ExitStatus::Exited(3));
        assert_eq!(read_all(stderr_read).await, "oops\n");
    }

    #[tokio::test]
    async fn attach_fans_output_out_to_every_caller() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path());
        let (first, first_read) = tokio::io::duplex(1024);
        tracker
            .run(
                "1",
                &ProcessSpec::new("cat"),
                ProcessIo::default().with_stdout(first),
                None,
                Arc::new(LinkSignaller),
            )
            .await
            .unwrap();

        let (second, second_read) = tokio::io::duplex(1024);
        let process = tracker
            .attach(
                "1",
                ProcessIo::default()
                    .with_stdin(&b"shared"[..])
                    .with_stdout(second),
            )
            .await
            .unwrap();

        assert_eq!(process.wait().await.unwrap(), ExitStatus::Exited(0));
        assert_eq!(read_all(first_read).await, "shared");
        assert_eq!(read_all(second_read).await, "shared");
    }

    #[tokio::test]
    async fn attach_to_unknown_process_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = tracker(dir.path())
            .attach("nope", ProcessIo::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::NotFound(_)));
    }

    #[tokio::test]
    async fn signal_through_the_link() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path());
        // Held open so `cat` never sees EOF
        let (_stdin_write, stdin) = tokio::io::duplex(64);

        let process = tracker
            .run(
                "1",
                &ProcessSpec::new("cat"),
                ProcessIo::default().with_stdin(stdin),
                None,
                tracker.default_signaller(),
            )
            .await
            .unwrap();
        process.signal(Signal::Kill).await.unwrap();

        assert_eq!(process.wait().await.unwrap(), ExitStatus::Signaled(9));
    }

    #[tokio::test]
    async fn tty_process_gets_a_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path());
        let (stdout, stdout_read) = tokio::io::duplex(1024);
        let tty = TtySpec {
            window_size: Some(WindowSize {
                columns: 80,
                rows: 24,
            }),
        };

        let process = tracker
            .run(
                "1",
                &sh("test -t 1 && echo tty"),
                ProcessIo::default().with_stdout(stdout),
                Some(tty),
                Arc::new(LinkSignaller),
            )
            .await
            .unwrap();
        // Resizing after exit may fail; it must not hang
        let _ = process
            .set_window_size(WindowSize {
                columns: 120,
                rows: 40,
            })
            .await;

        assert_eq!(process.wait().await.unwrap(), ExitStatus::Exited(0));
        assert!(read_all(stdout_read).await.contains("tty"));
    }

    #[tokio::test]
    async fn exited_processes_are_unregistered() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path());
        let process = tracker
            .run("1", &sh("exit 0"), ProcessIo::default(), None, Arc::new(LinkSignaller))
            .await
            .unwrap();

        process.wait().await.unwrap();
        wait_until_untracked(&tracker, "1").await;
        assert!(tracker.active_processes().is_empty());
        for _ in 0..200 {
            if process.phase() == Phase::Unregistered {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(process.phase(), Phase::Unregistered);

        // The id is free again
        tracker
            .run("1", &sh("exit 0"), ProcessIo::default(), None, Arc::new(LinkSignaller))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path());
        let (_stdin_write, stdin) = tokio::io::duplex(64);
        let process = tracker
            .run(
                "1",
                &ProcessSpec::new("cat"),
                ProcessIo::default().with_stdin(stdin),
                None,
                Arc::new(LinkSignaller),
            )
            .await
            .unwrap();

        let err = tracker
            .run("1", &sh("exit 0"), ProcessIo::default(), None, Arc::new(LinkSignaller))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::AlreadyTracked(_)));
        assert_eq!(tracker.active_processes().len(), 1);

        process.signal(Signal::Terminate).await.unwrap();
        assert_eq!(process.wait().await.unwrap(), ExitStatus::Signaled(15));
    }

    #[tokio::test]
    async fn restore_links_to_a_surviving_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let before = tracker(dir.path());
        tokio::fs::create_dir_all(before.paths.process_dir("5"))
            .await
            .unwrap();

        // A daemon left behind by a previous backend, never linked
        let mut daemon = InProcessRunner
            .start(&before.daemon_command("5", &sh("exit 4"), None))
            .await
            .unwrap();
        let mut notifications = BufReader::new(daemon.take_stdout().unwrap()).lines();
        before.await_notification("5", &mut notifications, "ready").await.unwrap();

        let after = tracker(dir.path());
        let process = after.restore("5", Arc::new(LinkSignaller)).unwrap();
        assert_eq!(process.wait().await.unwrap(), ExitStatus::Exited(4));
        assert_eq!(daemon.wait().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn restore_without_daemon_fails_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = ProcessTracker::new(
            ContainerPaths::new(dir.path().to_path_buf()),
            Arc::new(InProcessRunner),
            &ProcessConfig {
                spawn_timeout_ms: 200,
                ..config()
            },
        );

        let process = tracker.restore("9", Arc::new(LinkSignaller)).unwrap();
        let err = process.wait().await.unwrap_err();
        assert!(matches!(err, ProcessError::LinkFailed { .. }), "{err}");
        wait_until_untracked(&tracker, "9").await;
    }

    #[tokio::test]
    async fn namespaced_command_goes_through_wsh() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::default());
        let tracker = ProcessTracker::new(
            ContainerPaths::new(dir.path().to_path_buf()),
            runner.clone(),
            &config(),
        )
        .namespaced(true);

        let mut spec = ProcessSpec::new("/bin/ls").arg("-l").user("vcap");
        spec.env = vec!["A=1".into(), "B=2".into()];
        spec.dir = Some("/home/vcap".into());
        let tty = TtySpec {
            window_size: Some(WindowSize {
                columns: 100,
                rows: 30,
            }),
        };

        // The recording runner produces no handshake
        let err = tracker
            .run("3", &spec, ProcessIo::default(), Some(tty), tracker.default_signaller())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Handshake { .. }), "{err}");
        assert!(tracker.lookup("3").is_none());

        let d = dir.path().display();
        assert_eq!(
            runner.calls()[0].display(),
            format!(
                "{d}/bin/iodaemon --timeout-ms 5000 --tty --columns 100 --rows 30 \
                 spawn {d}/processes/3/iodaemon.sock \
                 {d}/bin/wsh --socket {d}/run/wshd.sock --user vcap \
                 --env A=1 --env B=2 --dir /home/vcap --pidfile {d}/processes/3/ps.pid \
                 /bin/ls -l"
            )
        );
    }

    #[tokio::test]
    async fn host_command_runs_the_program_directly() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path());
        let spec = ProcessSpec::new("/bin/echo").arg("hi");

        let command = tracker.daemon_command("2", &spec, None);
        let d = dir.path().display();
        assert_eq!(
            command.display(),
            format!("{d}/bin/iodaemon --timeout-ms 5000 spawn {d}/processes/2/iodaemon.sock /bin/echo hi")
        );
    }
}
