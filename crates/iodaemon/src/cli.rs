//! Command-line interface shared by the binary and by callers that build
//! `iodaemon` invocations.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use garden::{TtySpec, WindowSize};

use crate::spawn::SpawnConfig;

#[derive(Debug, Parser)]
#[command(name = "iodaemon", version)]
pub struct Cli {
    /// Milliseconds `spawn` waits for the first link, or `link` waits for
    /// the daemon's descriptors
    #[arg(long, default_value_t = 10_000)]
    pub timeout_ms: u64,

    /// Back the process's stdio with a pseudo-terminal
    #[arg(long)]
    pub tty: bool,

    /// Initial terminal width
    #[arg(long, requires_all = ["tty", "rows"])]
    pub columns: Option<u16>,

    /// Initial terminal height
    #[arg(long, requires_all = ["tty", "columns"])]
    pub rows: Option<u16>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Bind SOCKET, print `ready`, and start ARGV when the first link attaches
    Spawn {
        socket: PathBuf,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        argv: Vec<String>,
    },
    /// Attach to a running daemon and relay stdio until the process exits
    Link { socket: PathBuf },
}

impl Cli {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn tty_spec(&self) -> Option<TtySpec> {
        if !self.tty {
            return None;
        }
        let window_size = match (self.columns, self.rows) {
            (Some(columns), Some(rows)) => Some(WindowSize { columns, rows }),
            _ => None,
        };
        Some(TtySpec { window_size })
    }

    /// Daemon configuration, when this is a `spawn` invocation.
    pub fn spawn_config(&self) -> Option<SpawnConfig> {
        match &self.command {
            Command::Spawn { socket, argv } => Some(SpawnConfig {
                socket_path: socket.clone(),
                argv: argv.clone(),
                timeout: self.timeout(),
                tty: self.tty_spec(),
            }),
            Command::Link { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_keeps_hyphenated_program_args() {
        let cli = Cli::try_parse_from([
            "iodaemon",
            "--timeout-ms",
            "250",
            "spawn",
            "/run/p.sock",
            "bash",
            "-c",
            "cat <&0",
        ])
        .unwrap();

        let config = cli.spawn_config().unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/run/p.sock"));
        assert_eq!(config.argv, vec!["bash", "-c", "cat <&0"]);
        assert_eq!(config.timeout, Duration::from_millis(250));
        assert!(config.tty.is_none());
    }

    #[test]
    fn tty_with_window_size() {
        let cli = Cli::try_parse_from([
            "iodaemon", "--tty", "--columns", "80", "--rows", "24", "spawn", "/s", "sh",
        ])
        .unwrap();
        assert_eq!(
            cli.tty_spec(),
            Some(TtySpec {
                window_size: Some(WindowSize {
                    columns: 80,
                    rows: 24
                })
            })
        );
    }

    #[test]
    fn columns_require_tty() {
        assert!(Cli::try_parse_from(["iodaemon", "--columns", "80", "--rows", "24", "link", "/s"]).is_err());
    }

    #[test]
    fn spawn_requires_a_program() {
        assert!(Cli::try_parse_from(["iodaemon", "spawn", "/s"]).is_err());
    }

    #[test]
    fn link_has_no_spawn_config() {
        let cli = Cli::try_parse_from(["iodaemon", "link", "/s"]).unwrap();
        assert!(cli.spawn_config().is_none());
        assert_eq!(cli.timeout(), Duration::from_secs(10));
    }
}
