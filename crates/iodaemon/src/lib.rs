//! I/O daemon for processes that outlive their clients.
//!
//! `iodaemon spawn` binds a Unix socket, prepares a child process and starts
//! it when the first link connects. Each link receives the child's stdout,
//! stderr and exit-status pipes via `SCM_RIGHTS`, so clients can detach and
//! reattach freely while the process keeps running.
//!
//! The wire format lives in the `iodaemon-proto` crate.

mod child;
pub mod cli;
mod error;
pub mod fdpass;
pub mod link;
pub mod spawn;
mod tty;

pub use error::{LinkError, LinkResult, SpawnError, SpawnResult};
pub use iodaemon_proto::ExitStatus;
pub use link::{Link, LinkControl, LinkParts, StatusReader};
pub use spawn::SpawnConfig;
pub use tty::window_size;
