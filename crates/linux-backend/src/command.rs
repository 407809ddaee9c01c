use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use garden::BoxedReader;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::trace;

/// Error from a failed command.
#[derive(Debug, thiserror::Error)]
#[error("command failed: {command}\n{detail}")]
pub struct CommandError {
    pub command: String,
    pub detail: String,
}

/// How a command should be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// Prefix with `sudo`.
    Sudo,
    /// Run as the current user.
    User,
}

/// A program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub privilege: Privilege,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            privilege: Privilege::User,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn privilege(mut self, privilege: Privilege) -> Self {
        self.privilege = privilege;
        self
    }

    /// Human-readable form, `sudo` included.
    pub fn display(&self) -> String {
        let args: Vec<&str> = self.args.iter().map(String::as_str).collect();
        format_command_display(&self.program, &args, self.privilege)
    }

    fn command(&self) -> Command {
        match self.privilege {
            Privilege::Sudo => {
                let mut cmd = Command::new("sudo");
                cmd.arg(&self.program).args(&self.args);
                cmd
            }
            Privilege::User => {
                let mut cmd = Command::new(&self.program);
                cmd.args(&self.args);
                cmd
            }
        }
    }
}

/// Format a human-readable display string for a direct command invocation.
fn format_command_display(program: &str, args: &[&str], privilege: Privilege) -> String {
    let mut parts = Vec::with_capacity(args.len() + 2);
    if matches!(privilege, Privilege::Sudo) {
        parts.push("sudo");
    }
    parts.push(program);
    parts.extend_from_slice(args);
    parts.join(" ")
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// A command started in the background.
pub struct RunningCommand {
    display: String,
    stdout: Option<BoxedReader>,
    exit: JoinHandle<io::Result<i32>>,
}

impl RunningCommand {
    /// `exit` resolves to the command's exit code.
    pub fn new(
        display: String,
        stdout: Option<BoxedReader>,
        exit: JoinHandle<io::Result<i32>>,
    ) -> Self {
        Self {
            display,
            stdout,
            exit,
        }
    }

    pub fn take_stdout(&mut self) -> Option<BoxedReader> {
        self.stdout.take()
    }

    /// Wait for the command to finish and return its exit code.
    pub async fn wait(self) -> Result<i32, CommandError> {
        let detail = match self.exit.await {
            Ok(Ok(code)) => return Ok(code),
            Ok(Err(e)) => e.to_string(),
            Err(e) => e.to_string(),
        };
        Err(CommandError {
            command: self.display,
            detail,
        })
    }
}

impl std::fmt::Debug for RunningCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningCommand")
            .field("command", &self.display)
            .finish_non_exhaustive()
    }
}

/// Runs external programs.
///
/// Abstracted as a trait so tests can record invocations or run helpers
/// in-process instead of forking.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion. Returns trimmed stdout on success.
    async fn run(&self, spec: &CommandSpec) -> Result<String, CommandError>;

    /// Start in the background with stdout piped.
    async fn start(&self, spec: &CommandSpec) -> Result<RunningCommand, CommandError>;
}

/// Runs programs on the host with `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalRunner;

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<String, CommandError> {
        let args: Vec<&str> = spec.args.iter().map(String::as_str).collect();
        exec(&spec.program, &args, spec.privilege).await
    }

    async fn start(&self, spec: &CommandSpec) -> Result<RunningCommand, CommandError> {
        let command_line = spec.display();
        trace!(command = %command_line, "start");

        let mut child = spec
            .command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| CommandError {
                command: command_line.clone(),
                detail: e.to_string(),
            })?;

        let stdout = child
            .stdout
            .take()
            .map(|s| -> BoxedReader { Box::new(s) });
        let exit = tokio::spawn(async move {
            let status = child.wait().await?;
            Ok(status.code().unwrap_or(-1))
        });
        Ok(RunningCommand::new(command_line, stdout, exit))
    }
}

/// Execute a command.
///
/// Invokes the program binary directly with the given arguments.
/// Returns trimmed stdout on success.
pub async fn exec(
    program: &str,
    args: &[&str],
    privilege: Privilege,
) -> Result<String, CommandError> {
    let cmd_display = format_command_display(program, args, privilege);
    trace!(command = %cmd_display, "exec");

    let output = match privilege {
        Privilege::Sudo => {
            let mut sudo_args = vec![program];
            sudo_args.extend_from_slice(args);
            Command::new("sudo").args(&sudo_args).output().await
        }
        Privilege::User => Command::new(program).args(args).output().await,
    };

    let output = output.map_err(|e| CommandError {
        command: cmd_display.clone(),
        detail: e.to_string(),
    })?;

    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(CommandError {
            command: cmd_display,
            detail: stderr,
        })
    }
}

// ---------------------------------------------------------------------------
// Recording runner for tests
// ---------------------------------------------------------------------------
