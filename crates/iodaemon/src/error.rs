use std::io;
use std::path::PathBuf;
use std::time::Duration;

use iodaemon_proto::ProtocolError;
use thiserror::Error;

/// Errors from the daemon side of a session.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("no program given")]
    EmptyCommand,

    #[error("failed to resolve program {program}: {source}")]
    Resolve {
        program: String,
        source: which::Error,
    },

    #[error("failed to create {what}: {source}")]
    Descriptors {
        what: &'static str,
        source: io::Error,
    },

    #[error("failed to prepare socket directory {}: {source}", path.display())]
    SocketDir { path: PathBuf, source: io::Error },

    #[error("failed to bind {}: {source}", path.display())]
    Bind { path: PathBuf, source: io::Error },

    #[error("failed to write {what} notification: {source}")]
    Notify {
        what: &'static str,
        source: io::Error,
    },

    #[error("expected client to connect within {0:?}")]
    ClientTimeout(Duration),

    #[error("failed to start child: {0}")]
    Start(#[source] io::Error),

    #[error("daemon stopped before the child was started")]
    Abandoned,

    #[error("failed to wait for child: {0}")]
    Wait(#[source] io::Error),

    #[error("failed to write exit status: {0}")]
    Status(#[source] io::Error),
}

/// Errors from the link (client) side of a session.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to connect to {}: {source}", path.display())]
    Connect { path: PathBuf, source: io::Error },

    #[error("daemon did not hand over descriptors within {0:?}")]
    Timeout(Duration),

    #[error("failed to receive descriptors: {0}")]
    Receive(#[source] io::Error),

    #[error("expected {expected} descriptors, received {received}")]
    DescriptorCount { expected: usize, received: usize },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("failed to send control envelope: {0}")]
    Control(#[source] io::Error),

    #[error("failed to copy {stream}: {source}")]
    Copy {
        stream: &'static str,
        source: io::Error,
    },

    #[error("failed to read exit status: {0}")]
    Status(#[source] io::Error),

    #[error("daemon closed the status pipe without reporting an exit status")]
    StatusMissing,
}

pub type SpawnResult<T> = std::result::Result<T, SpawnError>;
pub type LinkResult<T> = std::result::Result<T, LinkError>;
