use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use garden::{ProcessIo, Signal, WindowSize};
use iodaemon::{ExitStatus, Link, LinkControl};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::error::{ProcessError, ProcessResult};
use super::fanin::FanIn;
use super::fanout::FanOut;
use super::signaller::{SignalRequest, Signaller};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Progress of a tracked process. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Spawning,
    /// The daemon has bound its socket.
    Ready,
    /// Caller streams are attached.
    Attached,
    /// The child process has started.
    Active,
    /// Output is flowing through a link.
    Linked,
    Exited,
    Unregistered,
}

/// Who owns the link to the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum LinkState {
    NotLinked = 0,
    Linking = 1,
    Linked = 2,
    Failed = 3,
}

impl LinkState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::NotLinked,
            1 => Self::Linking,
            2 => Self::Linked,
            _ => {
                debug_assert!(v == 3, "invalid LinkState value: {v}");
                Self::Failed
            }
        }
    }
}

/// How a process ended, as seen by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Exited(ExitStatus),
    LinkFailed(String),
}

// ---------------------------------------------------------------------------
// Process
// ---------------------------------------------------------------------------

/// One process running under an I/O daemon.
///
/// Caller streams attach through fan-in and fan-out, so any number of
/// attachments share the single link to the daemon.
pub struct Process {
    id: String,
    socket: PathBuf,
    pid_file: PathBuf,
    link_timeout: Duration,
    stdin: Arc<FanIn>,
    stdout: Arc<FanOut>,
    stderr: Arc<FanOut>,
    phase: watch::Sender<Phase>,
    link_state: AtomicU8,
    control: OnceLock<LinkControl>,
    outcome: watch::Sender<Option<Outcome>>,
    signaller: Arc<dyn Signaller>,
}

impl Process {
    pub(crate) fn new(
        id: String,
        socket: PathBuf,
        pid_file: PathBuf,
        link_timeout: Duration,
        signaller: Arc<dyn Signaller>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            socket,
            pid_file,
            link_timeout,
            stdin: Arc::new(FanIn::new()),
            stdout: Arc::new(FanOut::new()),
            stderr: Arc::new(FanOut::new()),
            phase: watch::Sender::new(Phase::Spawning),
            link_state: AtomicU8::new(LinkState::NotLinked as u8),
            control: OnceLock::new(),
            outcome: watch::Sender::new(None),
            signaller,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub(crate) fn advance(&self, phase: Phase) {
        let advanced = self.phase.send_if_modified(|current| {
            if *current >= phase {
                return false;
            }
            *current = phase;
            true
        });
        if advanced {
            debug!(id = %self.id, ?phase, "process phase");
        }
    }

    /// Wait until output is linked or the process is already gone.
    pub(crate) async fn wait_linked(&self, timeout: Duration) -> ProcessResult<()> {
        let mut rx = self.phase.subscribe();
        let reached = tokio::time::timeout(timeout, rx.wait_for(|p| *p >= Phase::Linked))
            .await
            .map(|r| r.map(|p| *p));
        if !matches!(reached, Ok(Ok(_))) {
            return Err(ProcessError::LinkFailed {
                id: self.id.clone(),
                detail: format!("not linked within {timeout:?}"),
            });
        }
        if self.link_state() != LinkState::Failed {
            return Ok(());
        }
        let detail = match &*self.outcome.borrow() {
            Some(Outcome::LinkFailed(detail)) => detail.clone(),
            _ => "link failed".to_string(),
        };
        Err(ProcessError::LinkFailed {
            id: self.id.clone(),
            detail,
        })
    }

    fn link_state(&self) -> LinkState {
        LinkState::from_u8(self.link_state.load(Ordering::Acquire))
    }

    fn transition(&self, from: LinkState, to: LinkState) -> bool {
        self.link_state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Add the caller's streams. Absent streams are skipped.
    ///
    /// Sinks go in before the source so output caused by this caller's
    /// input reaches this caller.
    pub async fn attach(&self, io: ProcessIo) {
        if let Some(stdout) = io.stdout {
            self.stdout.add_sink(stdout).await;
        }
        if let Some(stderr) = io.stderr {
            self.stderr.add_sink(stderr).await;
        }
        if let Some(stdin) = io.stdin {
            self.stdin.add_source(stdin);
        }
        self.advance(Phase::Attached);
    }

    /// Start the link task unless one already exists. Returns whether this
    /// call started it.
    pub(crate) fn link(self: &Arc<Self>) -> bool {
        if !self.transition(LinkState::NotLinked, LinkState::Linking) {
            return false;
        }
        let process = Arc::clone(self);
        tokio::spawn(async move { process.run_link().await });
        true
    }

    async fn run_link(self: Arc<Self>) {
        let link = match Link::connect(&self.socket, self.link_timeout).await {
            Ok(link) => link,
            Err(e) => {
                let e = ProcessError::Link {
                    id: self.id.clone(),
                    source: e,
                };
                self.fail(&e.to_string()).await;
                return;
            }
        };

        let parts = link.into_parts();
        if self.control.set(parts.control.clone()).is_err() {
            debug!(id = %self.id, "control channel already set");
        }
        self.stdin.add_sink(Arc::new(parts.control));
        if self.transition(LinkState::Linking, LinkState::Linked) {
            self.advance(Phase::Linked);
            info!(id = %self.id, "process linked");
        }

        let (out, err, status) = tokio::join!(
            self.stdout.copy_from(parts.stdout),
            self.stderr.copy_from(parts.stderr),
            parts.status.wait()
        );
        if let Err(e) = out {
            warn!(id = %self.id, error = %e, "stdout copy failed");
        }
        if let Err(e) = err {
            warn!(id = %self.id, error = %e, "stderr copy failed");
        }
        self.stdout.close().await;
        self.stderr.close().await;

        match status {
            Ok(status) => {
                info!(id = %self.id, %status, "process exited");
                self.publish(Outcome::Exited(status));
            }
            Err(e) => {
                warn!(id = %self.id, error = %e, "exit status unavailable");
                self.publish(Outcome::LinkFailed(e.to_string()));
            }
        }
    }

    /// Mark the process as lost. Waiters see `detail`.
    pub(crate) async fn fail(&self, detail: &str) {
        self.link_state
            .store(LinkState::Failed as u8, Ordering::Release);
        warn!(id = %self.id, detail, "process failed");
        self.stdout.close().await;
        self.stderr.close().await;
        self.publish(Outcome::LinkFailed(detail.to_string()));
    }

    fn publish(&self, outcome: Outcome) {
        let published = self.outcome.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(outcome);
            true
        });
        if published {
            self.advance(Phase::Exited);
        }
    }

    pub fn has_exited(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Block until the process exits.
    pub async fn wait(&self) -> ProcessResult<ExitStatus> {
        let mut rx = self.outcome.subscribe();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ProcessError::LinkFailed {
                id: self.id.clone(),
                detail: "process dropped".into(),
            })?
            .clone();
        match outcome {
            Some(Outcome::Exited(status)) => Ok(status),
            Some(Outcome::LinkFailed(detail)) => Err(ProcessError::LinkFailed {
                id: self.id.clone(),
                detail,
            }),
            None => Err(ProcessError::LinkFailed {
                id: self.id.clone(),
                detail: "no outcome".into(),
            }),
        }
    }

    pub async fn signal(&self, signal: Signal) -> ProcessResult<()> {
        self.signaller
            .signal(SignalRequest {
                id: &self.id,
                pid_file: &self.pid_file,
                control: self.control.get(),
                signal,
            })
            .await
    }

    pub async fn set_window_size(&self, size: WindowSize) -> ProcessResult<()> {
        let control = self
            .control
            .get()
            .ok_or_else(|| ProcessError::NotLinked(self.id.clone()))?;
        control
            .set_window_size(size)
            .await
            .map_err(|source| ProcessError::Link {
                id: self.id.clone(),
                source,
            })
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("socket", &self.socket)
            .field("phase", &self.phase())
            .field("link_state", &self.link_state())
            .finish_non_exhaustive()
    }
}
