//! One physical connection: the read loop, the writer and everything they
//! feed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::calls::CallTable;
use crate::codec::FrameReader;
use crate::compress::CompressorCache;
use crate::config::TransportConfig;
use crate::dispatch::Dispatcher;
use crate::error::{Result, RpcError};
use crate::message::{MessageType, WireMessage};
use crate::metrics::{MetricsSnapshot, TransportMetrics};
use crate::protocol::{Protocol, ProtocolRegistry, WrapErrorFunc};
use crate::receiver::Receiver;
use crate::writer::{run_writer, FrameQueue};

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Owns both directions of a duplex byte stream.
///
/// Cloning is cheap and every clone refers to the same connection.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    config: TransportConfig,
    registry: Arc<ProtocolRegistry>,
    calls: Arc<CallTable>,
    compressors: Arc<CompressorCache>,
    metrics: Arc<TransportMetrics>,
    dispatcher: Dispatcher,
    receiver: Receiver,
    reader: Mutex<Option<BoxReader>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    connected: AtomicBool,
    stop_receiving: CancellationToken,
    encoder_stop: CancellationToken,
    stream_closed: CancellationToken,
    done: CancellationToken,
    err: Mutex<Option<RpcError>>,
    close_lock: tokio::sync::Mutex<bool>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("connected", &self.is_connected())
            .field("pending_calls", &self.inner.calls.len())
            .finish()
    }
}

impl Transport {
    /// Wraps `stream` and starts the writer. Receiving starts on the first
    /// [`start_receiving`](Self::start_receiving), which building a
    /// [`Client`](crate::client::Client) or [`Server`](crate::server::Server)
    /// does.
    pub fn new<S>(stream: S, config: TransportConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader: BoxReader = Box::new(read_half);
        let metrics = Arc::new(TransportMetrics::new());
        let (queue, queue_rx) = FrameQueue::new(config.write_queue_depth);
        let registry = Arc::new(ProtocolRegistry::new());
        let calls = Arc::new(CallTable::new());
        let compressors = Arc::new(CompressorCache::new());
        let encoder_stop = CancellationToken::new();
        let stream_closed = CancellationToken::new();

        let writer_task = tokio::spawn(run_writer(
            write_half,
            queue_rx,
            encoder_stop.clone(),
            stream_closed.clone(),
            metrics.clone(),
        ));
        let dispatcher = Dispatcher::new(
            queue.clone(),
            calls.clone(),
            compressors.clone(),
            metrics.clone(),
        );
        let receiver = Receiver::new(registry.clone(), queue, compressors.clone(), metrics.clone());

        Self {
            inner: Arc::new(TransportInner {
                config,
                registry,
                calls,
                compressors,
                metrics,
                dispatcher,
                receiver,
                reader: Mutex::new(Some(reader)),
                read_task: Mutex::new(None),
                writer_task: Mutex::new(Some(writer_task)),
                connected: AtomicBool::new(true),
                stop_receiving: CancellationToken::new(),
                encoder_stop,
                stream_closed,
                done: CancellationToken::new(),
                err: Mutex::new(None),
                close_lock: tokio::sync::Mutex::new(false),
            }),
        }
    }

    pub fn register_protocol(&self, protocol: Protocol) -> Result<()> {
        self.inner.registry.register(protocol)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Spawns the receive loop. Later calls do nothing.
    pub fn start_receiving(&self) {
        let reader = self
            .inner
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(reader) = reader else {
            return;
        };
        let handle = tokio::spawn(read_loop(self.inner.clone(), reader));
        *self
            .inner
            .read_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Resolves once the receive loop has exited.
    pub async fn done(&self) {
        self.inner.done.cancelled().await
    }

    pub fn is_done(&self) -> bool {
        self.inner.done.is_cancelled()
    }

    /// The error that ended the receive loop.
    pub fn err(&self) -> Option<RpcError> {
        self.inner
            .err
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn compressors(&self) -> &CompressorCache {
        &self.inner.compressors
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.calls.len()
    }

    /// Server handlers still running.
    pub fn in_flight_handlers(&self) -> usize {
        self.inner.receiver.in_flight()
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub(crate) fn set_wrap_error(&self, wrap: WrapErrorFunc) {
        self.inner.receiver.set_wrap_error(wrap);
    }

    /// Shuts the transport down. Waiting calls fail with EOF and server
    /// handlers are canceled and awaited (bounded by the drain timeout)
    /// before the stream is closed. Safe to call repeatedly.
    pub async fn close(&self) {
        let inner = &self.inner;
        let mut closed = inner.close_lock.lock().await;
        if *closed {
            return;
        }
        inner.connected.store(false, Ordering::Release);
        inner.stop_receiving.cancel();
        inner.dispatcher.close();
        inner.receiver.close(inner.config.drain_timeout()).await;
        inner.encoder_stop.cancel();
        inner.stream_closed.cancel();

        let writer = inner
            .writer_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
        let reader = inner
            .read_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match reader {
            Some(reader) => {
                let _ = reader.await;
            }
            None => finish(inner, RpcError::Eof),
        }
        *closed = true;
        debug!("transport closed");
    }
}

/// Records the terminal error and fires `done`. Connected drops to false
/// before the dispatcher closes, so a caller woken by the close never sees
/// the transport as connected.
fn finish(inner: &TransportInner, err: RpcError) {
    inner.connected.store(false, Ordering::Release);
    inner.dispatcher.close();
    inner.receiver.cancel_all();
    let mut slot = inner.err.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.is_none() {
        *slot = Some(err);
    }
    drop(slot);
    inner.done.cancel();
}

async fn read_loop(inner: Arc<TransportInner>, reader: BoxReader) {
    let mut frames = FrameReader::new(reader, inner.config.max_frame_length);
    let err = loop {
        let res = tokio::select! {
            biased;
            _ = inner.stop_receiving.cancelled() => break RpcError::Eof,
            res = frames.read_frame() => res,
        };
        let (body, len) = match res {
            Ok(frame) => frame,
            Err(e) => {
                if !e.is_eof() {
                    warn!(error = %e, "receive loop failed");
                }
                break e;
            }
        };
        inner.metrics.frame_received(len as u64);
        match WireMessage::from_value(body) {
            Ok(WireMessage::Response { seq, error, result }) => {
                let _ = inner.dispatcher.deliver(seq, error, result);
            }
            Ok(msg) => inner.receiver.receive(msg).await,
            Err(e) if e.is_fatal_framing() => {
                inner.metrics.inc_decode_errors();
                warn!(error = %e, "fatal decode error");
                break e;
            }
            Err(e) => {
                inner.metrics.inc_decode_errors();
                warn!(error = %e, "dropping undecodable message");
                if let RpcError::MessageDecode {
                    kind: MessageType::Call | MessageType::CallCompressed,
                    seq: Some(seq),
                    compression,
                    ..
                } = &e
                {
                    let (seq, compression) = (*seq, *compression);
                    inner.receiver.reply_error(seq, compression, e, None).await;
                }
            }
        }
    };
    debug!(error = %err, "receive loop exited");
    finish(&inner, err);
}
