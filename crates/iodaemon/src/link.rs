//! Client side of a session.
//!
//! A link dials the daemon's socket, receives stdout, stderr and status
//! descriptors, and keeps the connection open as a control channel for stdin,
//! window sizes and signals. Any number of links may attach to one daemon over
//! its lifetime.

use std::io;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use garden::WindowSize;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio::time;
use tracing::debug;

use iodaemon_proto::{DESCRIPTOR_COUNT, Envelope, ExitStatus, MAX_ENVELOPE_SIZE};

use crate::error::{LinkError, LinkResult};
use crate::fdpass::DescriptorChannel;

const READ_BUF_SIZE: usize = 16 * 1024;

/// Largest stdin chunk that fits in one envelope.
const MAX_DATA_CHUNK: usize = MAX_ENVELOPE_SIZE - 1;

fn file(fd: OwnedFd) -> File {
    File::from_std(std::fs::File::from(fd))
}

/// An attached session.
#[derive(Debug)]
pub struct Link {
    stdout: File,
    stderr: File,
    status: File,
    control: LinkControl,
}

/// The pieces of a [`Link`], for callers that route output themselves.
#[derive(Debug)]
pub struct LinkParts {
    pub stdout: File,
    pub stderr: File,
    pub status: StatusReader,
    pub control: LinkControl,
}

impl Link {
    /// Connect to the daemon at `path` and wait up to `timeout` for its
    /// descriptors.
    pub async fn connect(path: &Path, timeout: Duration) -> LinkResult<Self> {
        time::timeout(timeout, Self::dial(path))
            .await
            .map_err(|_| LinkError::Timeout(timeout))?
    }

    async fn dial(path: &Path) -> LinkResult<Self> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|source| LinkError::Connect {
                path: path.to_path_buf(),
                source,
            })?;

        let fds = stream
            .receive_descriptors()
            .await
            .map_err(LinkError::Receive)?;
        let received = fds.len();
        let [stdout, stderr, status]: [OwnedFd; DESCRIPTOR_COUNT] =
            fds.try_into().map_err(|_| LinkError::DescriptorCount {
                expected: DESCRIPTOR_COUNT,
                received,
            })?;
        debug!(path = %path.display(), "linked");

        Ok(Self {
            stdout: file(stdout),
            stderr: file(stderr),
            status: file(status),
            control: LinkControl {
                stream: Arc::new(Mutex::new(stream)),
            },
        })
    }

    pub fn control(&self) -> LinkControl {
        self.control.clone()
    }

    pub fn into_parts(self) -> LinkParts {
        LinkParts {
            stdout: self.stdout,
            stderr: self.stderr,
            status: StatusReader { file: self.status },
            control: self.control,
        }
    }

    /// Pump `stdin` to the process and copy its output until it exits.
    ///
    /// Output is drained to EOF before returning, so everything the process
    /// wrote has reached `stdout`/`stderr` by then.
    pub async fn run<I, O, E>(self, stdin: I, stdout: &mut O, stderr: &mut E) -> LinkResult<ExitStatus>
    where
        I: AsyncRead + Unpin + Send + 'static,
        O: AsyncWrite + Unpin + ?Sized,
        E: AsyncWrite + Unpin + ?Sized,
    {
        let LinkParts {
            stdout: out,
            stderr: err,
            status,
            control,
        } = self.into_parts();

        let pump = tokio::spawn(pump_stdin(stdin, control));
        let (out, err, status) = tokio::join!(
            copy_stream(out, stdout),
            copy_stream(err, stderr),
            status.wait()
        );
        // The caller's input may never reach EOF
        pump.abort();

        out.map_err(|source| LinkError::Copy {
            stream: "stdout",
            source,
        })?;
        err.map_err(|source| LinkError::Copy {
            stream: "stderr",
            source,
        })?;
        status
    }
}

// ---------------------------------------------------------------------------
// Control channel
// ---------------------------------------------------------------------------

/// Cloneable handle for sending envelopes to the daemon.
#[derive(Debug, Clone)]
pub struct LinkControl {
    stream: Arc<Mutex<UnixStream>>,
}

impl LinkControl {
    pub async fn write_stdin(&self, data: &[u8]) -> LinkResult<()> {
        for chunk in data.chunks(MAX_DATA_CHUNK) {
            self.send(&Envelope::Data(chunk.to_vec())).await?;
        }
        Ok(())
    }

    pub async fn close_stdin(&self) -> LinkResult<()> {
        self.send(&Envelope::Eof).await
    }

    pub async fn set_window_size(&self, size: WindowSize) -> LinkResult<()> {
        self.send(&Envelope::WindowSize {
            columns: size.columns,
            rows: size.rows,
        })
        .await
    }

    pub async fn signal(&self, signum: i32) -> LinkResult<()> {
        self.send(&Envelope::Signal(signum)).await
    }

    async fn send(&self, envelope: &Envelope) -> LinkResult<()> {
        let bytes = envelope.encode()?;
        let mut stream = self.stream.lock().await;
        stream.write_all(&bytes).await.map_err(LinkError::Control)
    }
}

// ---------------------------------------------------------------------------
// Status and streams
// ---------------------------------------------------------------------------

/// Read side of the status pipe.
#[derive(Debug)]
pub struct StatusReader {
    file: File,
}

impl StatusReader {
    /// Block until the daemon reports the exit status.
    pub async fn wait(mut self) -> LinkResult<ExitStatus> {
        let mut line = String::new();
        self.file
            .read_to_string(&mut line)
            .await
            .map_err(LinkError::Status)?;
        if line.is_empty() {
            return Err(LinkError::StatusMissing);
        }
        Ok(ExitStatus::parse(&line)?)
    }
}

/// Copy `reader` into `writer` until EOF and flush.
///
/// A pty master reports `EIO` once the slave side is gone; that counts as EOF.
pub async fn copy_stream<R, W>(mut reader: R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
            Err(e) => return Err(e),
        };
        // n <= buf.len() is guaranteed by read()
        writer.write_all(buf.get(..n).unwrap_or_default()).await?;
        total += n as u64;
    }
    writer.flush().await?;
    Ok(total)
}

/// Forward `input` as stdin envelopes, then send EOF.
pub async fn pump_stdin<R: AsyncRead + Unpin>(mut input: R, control: LinkControl) -> LinkResult<()> {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = input.read(&mut buf).await.map_err(|source| LinkError::Copy {
            stream: "stdin",
            source,
        })?;
        if n == 0 {
            break;
        }
        control.write_stdin(buf.get(..n).unwrap_or_default()).await?;
    }
    control.close_stdin().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copy_stream_flushes_everything() {
        let mut out = Vec::new();
        let n = copy_stream(&b"hello"[..], &mut out).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn pump_sends_data_then_eof() {
        let (left, mut right) = UnixStream::pair().unwrap();
        let control = LinkControl {
            stream: Arc::new(Mutex::new(left)),
        };

        pump_stdin(&b"abc"[..], control.clone()).await.unwrap();
        drop(control);

        let mut bytes = Vec::new();
        right.read_to_end(&mut bytes).await.unwrap();
        let envelopes = iodaemon_proto::Decoder::new().decode(&bytes).unwrap();
        assert_eq!(
            envelopes,
            vec![Envelope::Data(b"abc".to_vec()), Envelope::Eof]
        );
    }

    #[tokio::test]
    async fn connect_reports_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let err = Link::connect(&dir.path().join("absent.sock"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Connect { .. }));
    }

    #[tokio::test]
    async fn connect_times_out_when_nothing_is_handed_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("silent.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let err = Link::connect(&path, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Timeout(_)));
    }

    #[tokio::test]
    async fn status_missing_when_pipe_closes_empty() {
        let (read, write) = crate::child::pipe("status pipe").unwrap();
        drop(write);
        let reader = StatusReader { file: file(read) };
        assert!(matches!(reader.wait().await, Err(LinkError::StatusMissing)));
    }
}
