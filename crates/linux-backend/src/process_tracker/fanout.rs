use std::io;

use garden::BoxedWriter;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::trace;

const READ_BUF_SIZE: usize = 16 * 1024;

#[derive(Default)]
struct Sinks {
    writers: Vec<BoxedWriter>,
    closed: bool,
}

/// Broadcasts one output stream to every attached sink.
///
/// A failing sink is dropped without affecting the others or the writer.
#[derive(Default)]
pub struct FanOut {
    sinks: Mutex<Sinks>,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a sink. After [`FanOut::close`] the sink is shut down at once.
    pub async fn add_sink(&self, mut sink: BoxedWriter) {
        let mut sinks = self.sinks.lock().await;
        if sinks.closed {
            if let Err(e) = sink.shutdown().await {
                trace!(error = %e, "late output sink shutdown failed");
            }
            return;
        }
        sinks.writers.push(sink);
    }

    /// Deliver `data` to every sink. Never fails.
    pub async fn write(&self, data: &[u8]) {
        let mut sinks = self.sinks.lock().await;
        let mut kept = Vec::with_capacity(sinks.writers.len());
        for mut sink in sinks.writers.drain(..) {
            let result = async {
                sink.write_all(data).await?;
                sink.flush().await
            }
            .await;
            match result {
                Ok(()) => kept.push(sink),
                Err(e) => trace!(error = %e, "dropping broken output sink"),
            }
        }
        sinks.writers = kept;
    }

    /// Broadcast `reader` until EOF. A pty master's `EIO` counts as EOF.
    pub async fn copy_from<R: AsyncRead + Unpin>(&self, mut reader: R) -> io::Result<u64> {
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
            self.write(buf.get(..n).unwrap_or_default()).await;
            total += n as u64;
        }
        Ok(total)
    }

    /// Shut every sink down; later sinks are shut down on arrival.
    pub async fn close(&self) {
        let mut sinks = self.sinks.lock().await;
        sinks.closed = true;
        for mut sink in sinks.writers.drain(..) {
            if let Err(e) = sink.shutdown().await {
                trace!(error = %e, "output sink shutdown failed");
            }
        }
    }

    pub async fn sink_count(&self) -> usize {
        self.sinks.lock().await.writers.len()
    }
}
