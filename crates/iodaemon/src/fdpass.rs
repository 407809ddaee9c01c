//! Descriptor passing over Unix-domain connections.
//!
//! Descriptors travel as `SCM_RIGHTS` ancillary data attached to a single
//! one-byte message. Linux drops ancillary data sent with an empty payload on
//! stream sockets, so the byte is always present.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use async_trait::async_trait;
use nix::sys::socket::{self, ControlMessage, ControlMessageOwned, MsgFlags};
use tokio::io::Interest;
use tokio::net::UnixStream;

use iodaemon_proto::{DESCRIPTOR_COUNT, HANDOFF_BYTE};

/// Something descriptors can be sent through and received from.
///
/// The daemon's handoff logic is written against this trait so it can be
/// exercised without a real socket.
#[async_trait]
pub trait DescriptorChannel: Send + Sync {
    async fn send_descriptors(&self, fds: &[BorrowedFd<'_>]) -> io::Result<()>;

    async fn receive_descriptors(&self) -> io::Result<Vec<OwnedFd>>;
}

#[async_trait]
impl DescriptorChannel for UnixStream {
    async fn send_descriptors(&self, fds: &[BorrowedFd<'_>]) -> io::Result<()> {
        let raw: Vec<RawFd> = fds.iter().map(AsRawFd::as_raw_fd).collect();
        loop {
            self.writable().await?;
            match self.try_io(Interest::WRITABLE, || send_raw(self.as_raw_fd(), &raw)) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                other => return other,
            }
        }
    }

    async fn receive_descriptors(&self) -> io::Result<Vec<OwnedFd>> {
        loop {
            self.readable().await?;
            match self.try_io(Interest::READABLE, || receive_raw(self.as_raw_fd())) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                other => return other,
            }
        }
    }
}

fn send_raw(socket: RawFd, fds: &[RawFd]) -> io::Result<()> {
    let payload = [HANDOFF_BYTE];
    let iov = [IoSlice::new(&payload)];
    let cmsgs = [ControlMessage::ScmRights(fds)];
    let sent = socket::sendmsg::<()>(socket, &iov, &cmsgs, MsgFlags::MSG_NOSIGNAL, None)?;
    if sent == 0 {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "descriptor message not sent",
        ));
    }
    Ok(())
}

fn receive_raw(socket: RawFd) -> io::Result<Vec<OwnedFd>> {
    let mut payload = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut payload)];
    let mut space = nix::cmsg_space!([RawFd; DESCRIPTOR_COUNT]);
    let msg = socket::recvmsg::<()>(
        socket,
        &mut iov,
        Some(&mut space),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )?;

    if msg.bytes == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before descriptors arrived",
        ));
    }

    let mut fds = Vec::with_capacity(DESCRIPTOR_COUNT);
    // cmsgs() fails with ENOBUFS when the kernel truncated the control data
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(raw) = cmsg {
            for fd in raw {
                // SAFETY: SCM_RIGHTS installed a fresh descriptor in our table
                // for this message; nothing else owns it.
                fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }
    Ok(fds)
}

// ---------------------------------------------------------------------------
// In-memory channel for tests
// ---------------------------------------------------------------------------
