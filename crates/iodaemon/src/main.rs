use std::fmt;
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, warn};
use tracing_subscriber::fmt::time::FormatTime;

use iodaemon::cli::{Cli, Command};
use iodaemon::{Link, LinkControl, LinkResult, spawn};

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

/// Forward terminal resizes and hangups to the linked process.
fn relay_signals(control: LinkControl) -> std::io::Result<()> {
    let mut winch = signal(SignalKind::window_change())?;
    let mut hangup = signal(SignalKind::hangup())?;

    let resize = control.clone();
    tokio::spawn(async move {
        while winch.recv().await.is_some() {
            match iodaemon::window_size(std::io::stdin()) {
                Ok(size) => {
                    if let Err(e) = resize.set_window_size(size).await {
                        warn!(error = %e, "failed to relay window size");
                    }
                }
                Err(e) => warn!(error = %e, "failed to read terminal size"),
            }
        }
    });
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            if let Err(e) = control.signal(libc::SIGHUP).await {
                warn!(error = %e, "failed to relay hangup");
            }
        }
    });
    Ok(())
}

async fn run_link(cli: &Cli, socket: &std::path::Path) -> LinkResult<iodaemon::ExitStatus> {
    let link = Link::connect(socket, cli.timeout()).await?;
    if let Err(e) = relay_signals(link.control()) {
        warn!(error = %e, "signal relay unavailable");
    }
    link.run(
        tokio::io::stdin(),
        &mut tokio::io::stdout(),
        &mut tokio::io::stderr(),
    )
    .await
}

#[tokio::main]
async fn main() -> ExitCode {
    // stdout carries the ready/active notifications
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Command::Spawn { .. } => {
            let Some(config) = cli.spawn_config() else {
                return ExitCode::FAILURE;
            };
            match spawn::run(config, tokio::io::stdout()).await {
                Ok(_) => ExitCode::SUCCESS,
                Err(e) => {
                    error!(error = %e, "spawn failed");
                    ExitCode::FAILURE
                }
            }
        }
        Command::Link { socket } => match run_link(&cli, socket).await {
            Ok(status) => ExitCode::from(u8::try_from(status.code()).unwrap_or(u8::MAX)),
            Err(e) => {
                error!(error = %e, "link failed");
                ExitCode::FAILURE
            }
        },
    }
}
