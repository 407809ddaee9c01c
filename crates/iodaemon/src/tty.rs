//! Pseudo-terminal backed stdio.
//!
//! In TTY mode the child's stdin, stdout and stderr are all the pty slave.
//! Links read the master as stdout; their stderr is an empty pipe that is
//! already at EOF.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use garden::WindowSize;
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::pty::{Winsize, openpty};
use nix::sys::termios::Termios;
use tokio::process::Command;

use crate::child::{self, ChildEnds, ParentEnds};
use crate::error::{SpawnError, SpawnResult};

nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, libc::winsize);
nix::ioctl_read_bad!(tiocgwinsz, libc::TIOCGWINSZ, libc::winsize);
nix::ioctl_write_int_bad!(tiocsctty, libc::TIOCSCTTY);

/// End-of-transmission, what a terminal sends for Ctrl-D.
pub const EOT: u8 = 0x04;

fn winsize(size: WindowSize) -> Winsize {
    Winsize {
        ws_row: size.rows,
        ws_col: size.columns,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

fn set_cloexec(fd: &OwnedFd) -> io::Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(())
}

/// Open a pty pair sized to `size` (kernel default when `None`).
pub fn open(size: Option<WindowSize>) -> SpawnResult<(ParentEnds, ChildEnds)> {
    let ws = size.map(winsize);
    let pty = openpty(ws.as_ref(), None::<&Termios>).map_err(|e| SpawnError::Descriptors {
        what: "pty",
        source: e.into(),
    })?;

    let dup = |fd: &OwnedFd| -> SpawnResult<OwnedFd> {
        set_cloexec(fd)
            .and_then(|()| fd.try_clone())
            .map_err(|source| SpawnError::Descriptors {
                what: "pty",
                source,
            })
    };

    let stdin = dup(&pty.master)?;
    let stdout = dup(&pty.master)?;
    let child_stdin = dup(&pty.slave)?;
    let child_stdout = dup(&pty.slave)?;
    let (stderr, stderr_write) = child::pipe("stderr pipe")?;
    drop(stderr_write);

    Ok((
        ParentEnds {
            stdin,
            stdout,
            stderr,
            tty: Some(pty.master),
        },
        ChildEnds::new(child_stdin, child_stdout, pty.slave, true),
    ))
}

/// Make the child a session leader with the pty slave (its stdin) as
/// controlling terminal.
pub(crate) fn make_controlling(cmd: &mut Command) {
    // SAFETY: setsid and ioctl are async-signal-safe; the closure touches no
    // memory shared with the parent.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid()?;
            tiocsctty(libc::STDIN_FILENO, 0)?;
            Ok(())
        });
    }
}

/// Resize the terminal behind `master`.
pub fn set_window_size(master: BorrowedFd<'_>, size: WindowSize) -> io::Result<()> {
    let ws = winsize(size);
    // SAFETY: `ws` outlives the call and has the layout TIOCSWINSZ expects.
    unsafe { tiocswinsz(master.as_raw_fd(), &ws) }?;
    Ok(())
}

/// Current size of the terminal behind `fd`.
pub fn window_size(fd: impl AsFd) -> io::Result<WindowSize> {
    let mut ws = winsize(WindowSize {
        columns: 0,
        rows: 0,
    });
    // SAFETY: `ws` is a valid, writable winsize for the duration of the call.
    unsafe { tiocgwinsz(fd.as_fd().as_raw_fd(), &mut ws) }?;
    Ok(WindowSize {
        columns: ws.ws_col,
        rows: ws.ws_row,
    })
}
