use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use garden::Signal;
use iodaemon::LinkControl;
use tracing::{debug, info};

use crate::command::{CommandRunner, CommandSpec};

use super::error::{ProcessError, ProcessResult};

/// Everything a signaller may need to reach one process.
#[derive(Debug, Clone, Copy)]
pub struct SignalRequest<'a> {
    pub id: &'a str,
    pub pid_file: &'a Path,
    /// Present once the process is linked.
    pub control: Option<&'a LinkControl>,
    pub signal: Signal,
}

/// Delivers a signal to a tracked process.
#[async_trait]
pub trait Signaller: Send + Sync {
    async fn signal(&self, request: SignalRequest<'_>) -> ProcessResult<()>;
}

/// Signals through the daemon's control channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinkSignaller;

#[async_trait]
impl Signaller for LinkSignaller {
    async fn signal(&self, request: SignalRequest<'_>) -> ProcessResult<()> {
        let control = request
            .control
            .ok_or_else(|| ProcessError::NotLinked(request.id.to_string()))?;
        control
            .signal(request.signal.number())
            .await
            .map_err(|source| ProcessError::Link {
                id: request.id.to_string(),
                source,
            })?;
        debug!(id = request.id, signal = %request.signal, "signalled through link");
        Ok(())
    }
}

/// Runs `wsh ... kill` inside the container, for processes whose PID only
/// means something in the container's PID namespace.
pub struct NamespacedSignaller {
    runner: Arc<dyn CommandRunner>,
    wsh: PathBuf,
    socket: PathBuf,
    retries: u32,
    backoff: Duration,
}

impl NamespacedSignaller {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        wsh: PathBuf,
        socket: PathBuf,
        retries: u32,
        backoff: Duration,
    ) -> Self {
        Self {
            runner,
            wsh,
            socket,
            retries,
            backoff,
        }
    }

    /// The PID file appears shortly after the process starts.
    async fn read_pid(&self, path: &Path) -> ProcessResult<u32> {
        let mut last = String::from("never read");
        for attempt in 1..=self.retries.max(1) {
            match tokio::fs::read_to_string(path).await {
                Ok(content) => match content.trim().parse() {
                    Ok(pid) => return Ok(pid),
                    Err(e) => last = format!("invalid pid {:?}: {e}", content.trim()),
                },
                Err(e) => last = e.to_string(),
            }
            debug!(path = %path.display(), attempt, "pid file not ready");
            if attempt < self.retries {
                tokio::time::sleep(self.backoff).await;
            }
        }
        Err(ProcessError::PidFile {
            path: path.to_path_buf(),
            detail: last,
        })
    }
}

#[async_trait]
impl Signaller for NamespacedSignaller {
    async fn signal(&self, request: SignalRequest<'_>) -> ProcessResult<()> {
        let pid = self.read_pid(request.pid_file).await?;
        let spec = CommandSpec::new(self.wsh.to_string_lossy())
            .arg("--socket")
            .arg(self.socket.to_string_lossy())
            .args(["--user", "root", "kill"])
            .arg(format!("-{}", request.signal.number()))
            .arg(pid.to_string());
        self.runner.run(&spec).await?;
        info!(id = request.id, pid, signal = %request.signal, "signalled in container");
        Ok(())
    }
}
