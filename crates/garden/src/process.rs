use tokio::io::{AsyncRead, AsyncWrite};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// What to run inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Program path (resolved inside the container).
    pub path: String,
    pub args: Vec<String>,
    /// `KEY=VALUE` pairs.
    pub env: Vec<String>,
    /// Working directory; the user's home when unset.
    pub dir: Option<String>,
    pub user: String,
}

impl ProcessSpec {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            user: "root".into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }
}

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub columns: u16,
    pub rows: u16,
}

/// Request to back the process's stdio with a pseudo-terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TtySpec {
    pub window_size: Option<WindowSize>,
}

/// Signals a client may send to a running process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Kill,
    Terminate,
}

impl Signal {
    /// Linux signal number.
    pub fn number(self) -> i32 {
        match self {
            Self::Kill => 9,
            Self::Terminate => 15,
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Kill => f.write_str("kill"),
            Self::Terminate => f.write_str("terminate"),
        }
    }
}

/// Caller-side streams attached to a process.
///
/// Any of the three may be absent: a missing stdin never sends input, missing
/// sinks discard output.
#[derive(Default)]
pub struct ProcessIo {
    pub stdin: Option<BoxedReader>,
    pub stdout: Option<BoxedWriter>,
    pub stderr: Option<BoxedWriter>,
}

impl ProcessIo {
    pub fn with_stdin(mut self, stdin: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.stdin = Some(Box::new(stdin));
        self
    }

    pub fn with_stdout(mut self, stdout: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stdout = Some(Box::new(stdout));
        self
    }

    pub fn with_stderr(mut self, stderr: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stderr = Some(Box::new(stderr));
        self
    }
}

impl std::fmt::Debug for ProcessIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessIo")
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_numbers_match_linux() {
        assert_eq!(Signal::Kill.number(), 9);
        assert_eq!(Signal::Terminate.number(), 15);
    }

    #[test]
    fn process_spec_defaults_to_root() {
        let spec = ProcessSpec::new("/bin/echo").arg("hi");
        assert_eq!(spec.user, "root");
        assert_eq!(spec.args, vec!["hi".to_string()]);
        assert!(spec.dir.is_none());
    }

    #[test]
    fn process_io_debug_reports_presence() {
        let io = ProcessIo::default().with_stdout(tokio::io::sink());
        let debug = format!("{io:?}");
        assert!(debug.contains("stdout: true"), "{debug}");
        assert!(debug.contains("stdin: false"), "{debug}");
    }
}
