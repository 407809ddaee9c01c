use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use garden::BoxedReader;
use iodaemon::LinkControl;
use tokio::io::AsyncReadExt;
use tokio::sync::{Mutex, watch};
use tracing::trace;

use super::error::FanInError;

const READ_BUF_SIZE: usize = 16 * 1024;

/// Where combined stdin ends up.
#[async_trait]
pub trait InputSink: Send + Sync {
    async fn write(&self, data: &[u8]) -> io::Result<()>;

    async fn close(&self) -> io::Result<()>;
}

#[async_trait]
impl InputSink for LinkControl {
    async fn write(&self, data: &[u8]) -> io::Result<()> {
        self.write_stdin(data).await.map_err(io::Error::other)
    }

    async fn close(&self) -> io::Result<()> {
        self.close_stdin().await.map_err(io::Error::other)
    }
}

/// Serializes writes from any number of sources onto one sink.
///
/// Writers wait until a sink is attached. The first close wins; writes and
/// closes after it fail.
pub struct FanIn {
    sink: watch::Sender<Option<Arc<dyn InputSink>>>,
    closed: Mutex<bool>,
}

impl Default for FanIn {
    fn default() -> Self {
        Self::new()
    }
}

impl FanIn {
    pub fn new() -> Self {
        Self {
            sink: watch::Sender::new(None),
            closed: Mutex::new(false),
        }
    }

    /// Attach the sink, releasing any waiting writers.
    pub fn add_sink(&self, sink: Arc<dyn InputSink>) {
        self.sink.send_replace(Some(sink));
    }

    async fn wait_for_sink(&self) -> Result<Arc<dyn InputSink>, FanInError> {
        let mut rx = self.sink.subscribe();
        let sink = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| FanInError::Sink(io::ErrorKind::BrokenPipe.into()))?;
        sink.clone()
            .ok_or_else(|| FanInError::Sink(io::ErrorKind::BrokenPipe.into()))
    }

    pub async fn write(&self, data: &[u8]) -> Result<(), FanInError> {
        if *self.closed.lock().await {
            return Err(FanInError::WriteAfterClose);
        }
        let sink = self.wait_for_sink().await?;
        let closed = self.closed.lock().await;
        if *closed {
            return Err(FanInError::WriteAfterClose);
        }
        sink.write(data).await.map_err(FanInError::Sink)
    }

    /// Close the sink once one is attached.
    pub async fn close(&self) -> Result<(), FanInError> {
        {
            let mut closed = self.closed.lock().await;
            if *closed {
                return Err(FanInError::AlreadyClosed);
            }
            *closed = true;
        }
        let sink = self.wait_for_sink().await?;
        sink.close().await.map_err(FanInError::Sink)
    }

    /// Copy `source` in until EOF, then close.
    pub fn add_source(self: &Arc<Self>, mut source: BoxedReader) {
        let fan_in = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUF_SIZE];
            loop {
                let n = match source.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        trace!(error = %e, "stdin source failed");
                        break;
                    }
                };
                // n <= buf.len() is guaranteed by read()
                if let Err(e) = fan_in.write(buf.get(..n).unwrap_or_default()).await {
                    trace!(error = %e, "stdin write dropped");
                    return;
                }
            }
            if let Err(e) = fan_in.close().await {
                trace!(error = %e, "stdin close ignored");
            }
        });
    }
}

#[cfg(test)]
pub(crate) mod recording {
    use std::sync::Mutex as StdMutex;

    use super::*;

    /// Collects everything written and whether it was closed.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        data: StdMutex<Vec<u8>>,
        closes: StdMutex<u32>,
    }

    impl RecordingSink {
        pub(crate) fn data(&self) -> Vec<u8> {
            self.data.lock().unwrap().clone()
        }

        pub(crate) fn closes(&self) -> u32 {
            *self.closes.lock().unwrap()
        }
    }

    #[async_trait]
    impl InputSink for RecordingSink {
        async fn write(&self, data: &[u8]) -> io::Result<()> {
            self.data.lock().unwrap().extend_from_slice(data);
            Ok(())
        }

        async fn close(&self) -> io::Result<()> {
            *self.closes.lock().unwrap() += 1;
            Ok(())
        }
    }
}
