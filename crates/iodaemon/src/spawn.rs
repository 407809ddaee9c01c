//! Daemon side of a session.
//!
//! ## Lifecycle
//!
//! 1. Resolve the program and create the child's stdio plus a status pipe
//! 2. Bind the socket (removing a stale one) and print `ready`
//! 3. Every accepted link receives stdout-read, stderr-read and status-read
//! 4. The first successful handoff starts the child; `active` follows
//! 5. When the child exits its status is written to the status pipe, the
//!    socket is removed and [`run`] returns

use std::io::{self, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::time::Duration;

use garden::{TtySpec, WindowSize};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::process::Child;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, info, trace, warn};

use iodaemon_proto::{Decoder, Envelope, ExitStatus};

use crate::child::{self, ChildEnds, ParentEnds};
use crate::error::{SpawnError, SpawnResult};
use crate::fdpass::DescriptorChannel;
use crate::tty;

const READ_BUF_SIZE: usize = 16 * 1024;

/// What to run and where to serve it.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    pub socket_path: PathBuf,
    /// Program followed by its arguments.
    pub argv: Vec<String>,
    /// How long to wait for the first link before giving up.
    pub timeout: Duration,
    pub tty: Option<TtySpec>,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    Pending = 0,
    Starting = 1,
    Started = 2,
    Failed = 3,
}

impl LaunchState {
    fn from_u8(v: u8) -> Self {
        debug_assert!(v <= 3, "invalid LaunchState: {v}");
        match v {
            0 => Self::Pending,
            1 => Self::Starting,
            2 => Self::Started,
            _ => Self::Failed,
        }
    }
}

type Launched = oneshot::Sender<io::Result<Child>>;

/// Descriptors and launch state shared by every connection.
struct Session {
    program: PathBuf,
    args: Vec<String>,
    stdout: OwnedFd,
    stderr: OwnedFd,
    status: OwnedFd,
    /// `None` once a link sent EOF (pipe mode).
    stdin: Mutex<Option<tokio::fs::File>>,
    tty: Option<OwnedFd>,
    child_ends: std::sync::Mutex<Option<ChildEnds>>,
    launched: std::sync::Mutex<Option<Launched>>,
    state: AtomicU8,
    /// Child pid, 0 while not running.
    pid: AtomicI32,
}

impl Session {
    fn new(
        program: PathBuf,
        args: Vec<String>,
        parent: ParentEnds,
        child_ends: ChildEnds,
        status: OwnedFd,
        launched: Launched,
    ) -> Self {
        let ParentEnds {
            stdin,
            stdout,
            stderr,
            tty,
        } = parent;
        Self {
            program,
            args,
            stdout,
            stderr,
            status,
            stdin: Mutex::new(Some(tokio::fs::File::from_std(std::fs::File::from(stdin)))),
            tty,
            child_ends: std::sync::Mutex::new(Some(child_ends)),
            launched: std::sync::Mutex::new(Some(launched)),
            state: AtomicU8::new(LaunchState::Pending as u8),
            pid: AtomicI32::new(0),
        }
    }

    fn state(&self) -> LaunchState {
        LaunchState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: LaunchState, to: LaunchState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Send the descriptors to one link and start the child if this is the
    /// first successful handoff.
    async fn hand_off<C: DescriptorChannel + ?Sized>(&self, channel: &C) -> io::Result<()> {
        if self.state() == LaunchState::Failed {
            return Err(io::Error::other("child failed to start"));
        }
        channel
            .send_descriptors(&[self.stdout.as_fd(), self.stderr.as_fd(), self.status.as_fd()])
            .await?;
        self.launch_once();
        Ok(())
    }

    fn launch_once(&self) {
        if !self.transition(LaunchState::Pending, LaunchState::Starting) {
            return;
        }

        let ends = self
            .child_ends
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let result = match ends {
            Some(ends) => child::start(&self.program, &self.args, ends),
            None => Err(io::Error::other("child stdio already consumed")),
        };

        match &result {
            Ok(child) => {
                let pid = child.id().map_or(0, |id| id as i32);
                self.pid.store(pid, Ordering::Release);
                self.transition(LaunchState::Starting, LaunchState::Started);
                info!(pid, program = %self.program.display(), "child started");
            }
            Err(e) => {
                self.transition(LaunchState::Starting, LaunchState::Failed);
                warn!(error = %e, program = %self.program.display(), "failed to start child");
            }
        }

        let launched = self
            .launched
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let unclaimed = match launched {
            Some(tx) => match tx.send(result) {
                Ok(()) => return,
                Err(result) => result,
            },
            None => result,
        };
        // Nobody is supervising the child any more
        if let Ok(mut child) = unclaimed {
            self.pid.store(0, Ordering::Release);
            if let Err(e) = child.start_kill() {
                warn!(error = %e, "failed to kill unsupervised child");
            }
            warn!(program = %self.program.display(), "child started without a supervisor, killed");
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
        }
    }

    async fn apply(&self, envelope: Envelope) -> io::Result<()> {
        match envelope {
            Envelope::Data(bytes) => self.write_stdin(&bytes).await,
            Envelope::Eof => {
                if self.tty.is_some() {
                    self.write_stdin(&[tty::EOT]).await
                } else {
                    self.stdin.lock().await.take();
                    debug!("stdin closed");
                    Ok(())
                }
            }
            Envelope::WindowSize { columns, rows } => match &self.tty {
                Some(master) => tty::set_window_size(master.as_fd(), WindowSize { columns, rows }),
                None => {
                    debug!(columns, rows, "ignoring window size without a tty");
                    Ok(())
                }
            },
            Envelope::Signal(signum) => self.signal(signum),
        }
    }

    async fn write_stdin(&self, bytes: &[u8]) -> io::Result<()> {
        let mut stdin = self.stdin.lock().await;
        let Some(file) = stdin.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stdin already closed",
            ));
        };
        file.write_all(bytes).await?;
        file.flush().await
    }

    fn signal(&self, signum: i32) -> io::Result<()> {
        let pid = self.pid.load(Ordering::Acquire);
        if pid == 0 {
            return Err(io::Error::other("child is not running"));
        }
        let sig = Signal::try_from(signum)?;
        signal::kill(Pid::from_raw(pid), sig)?;
        debug!(pid, signal = %sig, "signalled child");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

fn bind(path: &Path) -> SpawnResult<UnixListener> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| SpawnError::SocketDir {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed stale socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove stale socket"),
    }

    UnixListener::bind(path).map_err(|source| SpawnError::Bind {
        path: path.to_path_buf(),
        source,
    })
}

/// Whether an accept error means the listener itself is unusable.
fn listener_closed(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EBADF | libc::EINVAL | libc::ENOTSOCK)
    )
}

async fn accept_loop(listener: UnixListener, session: Arc<Session>) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    connections.spawn(serve_connection(stream, Arc::clone(&session)));
                }
                Err(e) if listener_closed(&e) => {
                    warn!(error = %e, "listener closed");
                    break;
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

async fn serve_connection(mut stream: UnixStream, session: Arc<Session>) {
    if let Err(e) = session.hand_off(&stream).await {
        warn!(error = %e, "descriptor handoff failed");
        return;
    }
    debug!("link attached");

    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "control read failed");
                break;
            }
        };
        // n <= buf.len() is guaranteed by read()
        let envelopes = match decoder.decode(buf.get(..n).unwrap_or_default()) {
            Ok(envelopes) => envelopes,
            Err(e) => {
                warn!(error = %e, "malformed control envelope, dropping link");
                break;
            }
        };
        for envelope in envelopes {
            if let Err(e) = session.apply(envelope).await {
                warn!(error = %e, "control envelope failed");
            }
        }
    }
    trace!("link detached");
}

async fn notify<W: AsyncWrite + Unpin>(out: &mut W, what: &'static str) -> SpawnResult<()> {
    let line = format!("{what}\n");
    async {
        out.write_all(line.as_bytes()).await?;
        out.flush().await
    }
    .await
    .map_err(|source| SpawnError::Notify { what, source })
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Serve one process. `notifications` receives `ready` and `active` lines.
///
/// Returns the child's exit status once it has been written to the status
/// pipe.
pub async fn run<W: AsyncWrite + Unpin>(
    config: SpawnConfig,
    mut notifications: W,
) -> SpawnResult<ExitStatus> {
    let (name, args) = config.argv.split_first().ok_or(SpawnError::EmptyCommand)?;
    let program = which::which(name).map_err(|source| SpawnError::Resolve {
        program: name.clone(),
        source,
    })?;

    let (parent, child_ends) = match config.tty {
        Some(spec) => tty::open(spec.window_size)?,
        None => child::pipes()?,
    };
    let (status_read, status_write) = child::pipe("status pipe")?;
    let listener = bind(&config.socket_path)?;

    let (launched_tx, launched_rx) = oneshot::channel();
    let session = Arc::new(Session::new(
        program,
        args.to_vec(),
        parent,
        child_ends,
        status_read,
        launched_tx,
    ));

    info!(socket = %config.socket_path.display(), "listening");
    notify(&mut notifications, "ready").await?;

    let accept = tokio::spawn(accept_loop(listener, Arc::clone(&session)));
    let result = supervise(&config, &session, launched_rx, status_write, &mut notifications).await;

    accept.abort();
    let _ = std::fs::remove_file(&config.socket_path);
    result
}

async fn supervise<W: AsyncWrite + Unpin>(
    config: &SpawnConfig,
    session: &Session,
    launched: oneshot::Receiver<io::Result<Child>>,
    status_write: OwnedFd,
    notifications: &mut W,
) -> SpawnResult<ExitStatus> {
    let mut child = time::timeout(config.timeout, launched)
        .await
        .map_err(|_| SpawnError::ClientTimeout(config.timeout))?
        .map_err(|_| SpawnError::Abandoned)?
        .map_err(SpawnError::Start)?;

    notify(notifications, "active").await?;

    let status = child.wait().await.map_err(SpawnError::Wait)?;
    session.pid.store(0, Ordering::Release);
    let status = child::exit_status(status);
    info!(%status, "child exited");

    // A few bytes into an empty pipe never blocks
    let mut pipe = std::fs::File::from(status_write);
    pipe.write_all(status.encode().as_bytes())
        .map_err(SpawnError::Status)?;
    Ok(status)
}
