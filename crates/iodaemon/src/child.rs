//! Child process stdio and launch.

use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Stdio;

use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use tokio::process::{Child, Command};

use iodaemon_proto::ExitStatus;

use crate::error::{SpawnError, SpawnResult};
use crate::tty;

/// Daemon-side ends of the child's stdio.
#[derive(Debug)]
pub struct ParentEnds {
    /// Write end of stdin (or a dup of the pty master).
    pub stdin: OwnedFd,
    /// Read ends handed to every link.
    pub stdout: OwnedFd,
    pub stderr: OwnedFd,
    /// Pty master, present in TTY mode for window resizes.
    pub tty: Option<OwnedFd>,
}

/// Child-side ends, consumed when the child starts.
#[derive(Debug)]
pub struct ChildEnds {
    stdin: OwnedFd,
    stdout: OwnedFd,
    stderr: OwnedFd,
    controlling_tty: bool,
}

impl ChildEnds {
    pub(crate) fn new(stdin: OwnedFd, stdout: OwnedFd, stderr: OwnedFd, controlling_tty: bool) -> Self {
        Self {
            stdin,
            stdout,
            stderr,
            controlling_tty,
        }
    }
}

pub(crate) fn pipe(what: &'static str) -> SpawnResult<(OwnedFd, OwnedFd)> {
    pipe2(OFlag::O_CLOEXEC).map_err(|e| SpawnError::Descriptors {
        what,
        source: e.into(),
    })
}

/// Three plain pipes.
pub fn pipes() -> SpawnResult<(ParentEnds, ChildEnds)> {
    let (stdin_read, stdin_write) = pipe("stdin pipe")?;
    let (stdout_read, stdout_write) = pipe("stdout pipe")?;
    let (stderr_read, stderr_write) = pipe("stderr pipe")?;

    Ok((
        ParentEnds {
            stdin: stdin_write,
            stdout: stdout_read,
            stderr: stderr_read,
            tty: None,
        },
        ChildEnds::new(stdin_read, stdout_write, stderr_write, false),
    ))
}

/// Start `program` with `ends` as its stdio.
///
/// The command (and with it the child-side descriptors) is dropped before
/// returning, so the child holds the only write ends of its output pipes.
pub fn start(program: &Path, args: &[String], ends: ChildEnds) -> io::Result<Child> {
    let ChildEnds {
        stdin,
        stdout,
        stderr,
        controlling_tty,
    } = ends;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::from(stdin))
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));

    if controlling_tty {
        tty::make_controlling(&mut cmd);
    } else {
        // Own process group so signals aimed at the daemon's group skip the child
        cmd.process_group(0);
    }

    cmd.spawn()
}

/// Translate an OS exit status into the wire representation.
pub fn exit_status(status: std::process::ExitStatus) -> ExitStatus {
    match (status.code(), status.signal()) {
        (Some(code), _) => ExitStatus::Exited(code),
        (None, Some(signum)) => ExitStatus::Signaled(signum),
        (None, None) => ExitStatus::Exited(1),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    #[tokio::test]
    async fn child_writes_to_stdout_pipe() {
        let (parent, child) = pipes().unwrap();
        let mut proc = start(
            Path::new("/bin/sh"),
            &["-c".into(), "echo out; echo err >&2".into()],
            child,
        )
        .unwrap();
        drop(parent.stdin);

        let status = proc.wait().await.unwrap();
        assert_eq!(exit_status(status), ExitStatus::Exited(0));

        let mut out = String::new();
        std::fs::File::from(parent.stdout)
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "out\n");
        let mut err = String::new();
        std::fs::File::from(parent.stderr)
            .read_to_string(&mut err)
            .unwrap();
        assert_eq!(err, "err\n");
    }

    #[tokio::test]
    async fn signaled_child_reports_signal() {
        let (_parent, child) = pipes().unwrap();
        let mut proc = start(Path::new("/bin/sh"), &["-c".into(), "kill -9 $$".into()], child).unwrap();
        let status = proc.wait().await.unwrap();
        assert_eq!(exit_status(status), ExitStatus::Signaled(9));
    }
}
