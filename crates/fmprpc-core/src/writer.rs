//! The single writer that owns the send half of a stream.
//!
//! Every outbound frame of a transport goes through one [`FrameQueue`]
//! into one writer task, so frames never interleave on the wire.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::FrameWriter;
use crate::error::{Result, RpcError};
use crate::metrics::TransportMetrics;

pub(crate) struct WriteRequest {
    frame: Bytes,
    done: Option<oneshot::Sender<Result<()>>>,
}

/// Cloneable handle for enqueueing frames.
#[derive(Clone)]
pub(crate) struct FrameQueue {
    tx: mpsc::Sender<WriteRequest>,
}

impl FrameQueue {
    pub(crate) fn new(depth: usize) -> (Self, mpsc::Receiver<WriteRequest>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Self { tx }, rx)
    }

    /// Enqueues `frame`. The returned receiver resolves with the outcome of
    /// the write itself.
    pub(crate) async fn enqueue(&self, frame: Bytes) -> Result<oneshot::Receiver<Result<()>>> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(WriteRequest {
                frame,
                done: Some(done_tx),
            })
            .await
            .map_err(|_| RpcError::Eof)?;
        Ok(done_rx)
    }

    /// Enqueues and waits for the write to finish.
    pub(crate) async fn write(&self, frame: Bytes) -> Result<()> {
        let done = self.enqueue(frame).await?;
        done.await.map_err(|_| RpcError::Eof)?
    }

    /// Enqueues without waiting. Drops the frame if the queue is full.
    pub(crate) fn try_write(&self, frame: Bytes) -> bool {
        self.tx.try_send(WriteRequest { frame, done: None }).is_ok()
    }
}

/// Drains the queue into `stream` until `stop` fires or every queue handle
/// is dropped. Each write also races `stream_closed`, which unblocks a write
/// stuck on a dead peer.
pub(crate) async fn run_writer<W>(
    stream: W,
    mut rx: mpsc::Receiver<WriteRequest>,
    stop: CancellationToken,
    stream_closed: CancellationToken,
    metrics: Arc<TransportMetrics>,
) where
    W: AsyncWrite + Unpin,
{
    let mut writer = FrameWriter::new(stream);
    loop {
        let req = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            req = rx.recv() => match req {
                Some(req) => req,
                None => break,
            },
        };
        let len = req.frame.len() as u64;
        let res = tokio::select! {
            res = writer.write_frame(&req.frame) => res,
            _ = stream_closed.cancelled() => Err(RpcError::Eof),
        };
        match &res {
            Ok(()) => metrics.frame_sent(len),
            Err(e) => debug!(error = %e, "frame write failed"),
        }
        let closed = stream_closed.is_cancelled();
        if let Some(done) = req.done {
            let _ = done.send(res);
        }
        if closed {
            break;
        }
    }
    rx.close();
    while let Ok(req) = rx.try_recv() {
        if let Some(done) = req.done {
            let _ = done.send(Err(RpcError::Eof));
        }
    }
    if let Err(e) = writer.shutdown().await {
        if !e.is_eof() {
            warn!(error = %e, "failed to shut down stream");
        }
    }
}
