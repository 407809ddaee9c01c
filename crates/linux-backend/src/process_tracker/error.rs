use std::io;
use std::path::PathBuf;

use iodaemon::LinkError;

use crate::command::CommandError;

#[derive(Debug, thiserror::Error)]
pub enum FanInError {
    #[error("write after close")]
    WriteAfterClose,

    #[error("already closed")]
    AlreadyClosed,

    #[error("input sink failed: {0}")]
    Sink(#[source] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("process {0} is already tracked")]
    AlreadyTracked(String),

    #[error("process {0} not found")]
    NotFound(String),

    #[error("prepare process {id}: {source}")]
    Prepare {
        id: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("process {id}: {detail}")]
    Handshake { id: String, detail: String },

    #[error("link to process {id} failed: {source}")]
    Link {
        id: String,
        #[source]
        source: LinkError,
    },

    #[error("process {0} is not linked yet")]
    NotLinked(String),

    #[error("process {id} lost its link: {detail}")]
    LinkFailed { id: String, detail: String },

    #[error("read pid file {}: {detail}", path.display())]
    PidFile { path: PathBuf, detail: String },

    #[error(transparent)]
    FanIn(#[from] FanInError),
}

pub type ProcessResult<T> = std::result::Result<T, ProcessError>;
