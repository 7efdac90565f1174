use futures_util::SinkExt;
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::codec::FramedWrite;
use tracing::trace;

use crate::compression;
use crate::error::ProtocolError;
use crate::frame::{Frame, FrameCodec};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Number of queued frames that forces a compression envelope out.
    pub batch_size: usize,
    pub queue_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            queue_capacity: 1024,
        }
    }
}

enum Outbound {
    Batched(Frame),
    Urgent(Frame),
    Flush(Option<oneshot::Sender<()>>),
    EnableCompression,
    Close(oneshot::Sender<()>),
}

/// Cloneable sending side of a [`FrameWriter`].
#[derive(Clone)]
pub struct WriterHandle {
    sender: flume::Sender<Outbound>,
    last_write: Arc<Mutex<Instant>>,
}

impl WriterHandle {
    /// Queues a frame. Once compression is enabled, the frame waits for the
    /// next batch flush.
    pub async fn send(&self, frame: Frame) -> Result<(), ProtocolError> {
        self.submit(Outbound::Batched(frame)).await
    }

    /// Writes a frame right away, after everything queued before it.
    pub async fn send_urgent(&self, frame: Frame) -> Result<(), ProtocolError> {
        self.submit(Outbound::Urgent(frame)).await
    }

    /// Writes all batched frames and waits until they reached the socket.
    pub async fn flush(&self) -> Result<(), ProtocolError> {
        let (tx, rx) = oneshot::channel();
        self.submit(Outbound::Flush(Some(tx))).await?;
        rx.await.map_err(|_| ProtocolError::WriterClosed)
    }

    /// Best-effort flush request that never waits for queue space.
    pub fn request_flush(&self) {
        let _ = self.sender.try_send(Outbound::Flush(None));
    }

    pub async fn enable_compression(&self) -> Result<(), ProtocolError> {
        self.submit(Outbound::EnableCompression).await
    }

    /// Flushes and shuts down the write half.
    pub async fn close(&self) -> Result<(), ProtocolError> {
        let (tx, rx) = oneshot::channel();
        self.submit(Outbound::Close(tx)).await?;
        rx.await.map_err(|_| ProtocolError::WriterClosed)
    }

    pub fn idle_time(&self) -> Duration {
        self.last_write
            .lock()
            .expect("No one should panic while holding this lock")
            .elapsed()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_disconnected()
    }

    async fn submit(&self, outbound: Outbound) -> Result<(), ProtocolError> {
        self.sender
            .send_async(outbound)
            .await
            .map_err(|_| ProtocolError::WriterClosed)
    }
}

/// Sole owner of the write half of a connection. Frames are written in the
/// order they were submitted and never interleave.
pub struct FrameWriter<W> {
    sink: FramedWrite<W, FrameCodec>,
    receiver: flume::Receiver<Outbound>,
    batch: Vec<Frame>,
    batch_size: usize,
    compress: bool,
    last_write: Arc<Mutex<Instant>>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(io: W, config: &WriterConfig) -> (WriterHandle, Self) {
        let (sender, receiver) = flume::bounded(config.queue_capacity);
        let last_write = Arc::new(Mutex::new(Instant::now()));
        let handle = WriterHandle {
            sender,
            last_write: last_write.clone(),
        };
        let writer = Self {
            sink: FramedWrite::new(io, FrameCodec::default()),
            receiver,
            batch: Vec::with_capacity(config.batch_size),
            batch_size: config.batch_size.max(1),
            compress: false,
            last_write,
        };
        (handle, writer)
    }

    pub async fn run(mut self) -> Result<(), ProtocolError> {
        while let Ok(outbound) = self.receiver.recv_async().await {
            match outbound {
                Outbound::Batched(frame) if self.compress => {
                    self.batch.push(frame);
                    if self.batch.len() >= self.batch_size {
                        self.flush_batch().await?;
                        self.sink.flush().await?;
                    }
                }
                Outbound::Batched(frame) => {
                    let flush_now = self.receiver.is_empty();
                    self.write(frame, flush_now).await?;
                }
                Outbound::Urgent(frame) => {
                    self.flush_batch().await?;
                    self.write(frame, true).await?;
                }
                Outbound::Flush(ack) => {
                    self.flush_batch().await?;
                    self.sink.flush().await?;
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                }
                Outbound::EnableCompression => self.compress = true,
                Outbound::Close(ack) => {
                    self.flush_batch().await?;
                    self.sink.close().await?;
                    let _ = ack.send(());
                    return Ok(());
                }
            }
        }

        // Every handle is gone
        self.flush_batch().await?;
        self.sink.flush().await?;
        Ok(())
    }

    async fn flush_batch(&mut self) -> Result<(), ProtocolError> {
        let frame = match self.batch.len() {
            0 => return Ok(()),
            1 => self.batch.remove(0),
            n => {
                trace!(frames = n, "Writing compression envelope");
                compression::pack(std::mem::take(&mut self.batch))?
            }
        };
        self.write(frame, false).await
    }

    async fn write(&mut self, frame: Frame, flush: bool) -> Result<(), ProtocolError> {
        self.sink.feed(frame).await?;
        if flush {
            self.sink.flush().await?;
        }
        *self
            .last_write
            .lock()
            .expect("No one should panic while holding this lock") = Instant::now();
        Ok(())
    }
}
