//! Server-side handling of incoming calls and notifications.
//!
//! In-flight handlers are tracked by a single task loop that owns the task
//! set. The read loop and the handlers talk to it over three channels:
//! `begin` when a handler starts, `cancel` when the peer sends a `Cancel`
//! and `end` when a handler finishes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use rmpv::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::codec::encode_frame;
use crate::compress::CompressorCache;
use crate::context::Context;
use crate::error::{Result, RpcError};
use crate::message::{CompressionType, RpcTags, SeqNumber, WireMessage};
use crate::metrics::TransportMetrics;
use crate::protocol::{default_wrap_error, MethodType, ProtocolRegistry, WrapErrorFunc};
use crate::writer::FrameQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TaskKey {
    Call(SeqNumber),
    Notify(u64),
}

struct TaskBegin {
    key: TaskKey,
    token: CancellationToken,
}

struct TaskChannels {
    begin: mpsc::UnboundedSender<TaskBegin>,
    cancel: mpsc::UnboundedSender<SeqNumber>,
    end: mpsc::UnboundedSender<TaskKey>,
}

/// Owns the task set. Exits when `stop` fires, canceling every task it
/// still tracks.
async fn run_task_loop(
    mut begin_rx: mpsc::UnboundedReceiver<TaskBegin>,
    mut cancel_rx: mpsc::UnboundedReceiver<SeqNumber>,
    mut end_rx: mpsc::UnboundedReceiver<TaskKey>,
    stop: CancellationToken,
) {
    let mut tasks: HashMap<TaskKey, CancellationToken> = HashMap::new();
    loop {
        // begin is polled first so it is always seen before its own end or
        // cancel.
        tokio::select! {
            biased;
            Some(begin) = begin_rx.recv() => {
                tasks.insert(begin.key, begin.token);
            }
            Some(seq) = cancel_rx.recv() => {
                match tasks.remove(&TaskKey::Call(seq)) {
                    Some(token) => token.cancel(),
                    None => debug!(seq, "cancel for unknown call"),
                }
            }
            Some(key) = end_rx.recv() => {
                tasks.remove(&key);
            }
            _ = stop.cancelled() => break,
        }
    }
    for (_, token) in tasks.drain() {
        token.cancel();
    }
}

pub(crate) struct Receiver {
    registry: Arc<ProtocolRegistry>,
    queue: FrameQueue,
    compressors: Arc<CompressorCache>,
    metrics: Arc<TransportMetrics>,
    wrap_error: RwLock<WrapErrorFunc>,
    channels: TaskChannels,
    notify_ids: AtomicU64,
    root: CancellationToken,
    stop: CancellationToken,
    tracker: TaskTracker,
    task_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Receiver {
    pub(crate) fn new(
        registry: Arc<ProtocolRegistry>,
        queue: FrameQueue,
        compressors: Arc<CompressorCache>,
        metrics: Arc<TransportMetrics>,
    ) -> Self {
        let (begin, begin_rx) = mpsc::unbounded_channel();
        let (cancel, cancel_rx) = mpsc::unbounded_channel();
        let (end, end_rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let task_loop = tokio::spawn(run_task_loop(begin_rx, cancel_rx, end_rx, stop.clone()));
        Self {
            registry,
            queue,
            compressors,
            metrics,
            wrap_error: RwLock::new(Arc::new(default_wrap_error)),
            channels: TaskChannels { begin, cancel, end },
            notify_ids: AtomicU64::new(0),
            root: CancellationToken::new(),
            stop,
            tracker: TaskTracker::new(),
            task_loop: Mutex::new(Some(task_loop)),
        }
    }

    /// Sets the error wrapper used when a protocol does not bring its own.
    pub(crate) fn set_wrap_error(&self, wrap: WrapErrorFunc) {
        *self.wrap_error.write().unwrap_or_else(PoisonError::into_inner) = wrap;
    }

    fn default_wrap(&self) -> WrapErrorFunc {
        self.wrap_error
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Handles one non-`Response` message.
    pub(crate) async fn receive(&self, msg: WireMessage) {
        match msg {
            WireMessage::Call {
                seq,
                method,
                arg,
                tags,
            } => {
                self.serve(Some(seq), method, CompressionType::None, arg, tags)
                    .await
            }
            WireMessage::CallCompressed {
                seq,
                compression,
                method,
                arg,
                tags,
            } => match self.compressors.decompress_value(compression, &arg) {
                Ok(arg) => self.serve(Some(seq), method, compression, arg, tags).await,
                Err(e) => {
                    warn!(seq, method = %method, error = %e, "failed to decompress argument");
                    self.reply_error(seq, compression, e, None).await;
                }
            },
            WireMessage::Notify { method, arg, tags } => {
                self.serve(None, method, CompressionType::None, arg, tags)
                    .await
            }
            WireMessage::Cancel { seq, method } => {
                debug!(seq, method = %method, "cancel requested");
                let _ = self.channels.cancel.send(seq);
            }
            WireMessage::Response { seq, .. } => {
                debug!(seq, "response routed to receiver, dropping");
            }
        }
    }

    async fn serve(
        &self,
        seq: Option<SeqNumber>,
        method: String,
        compression: CompressionType,
        arg: Value,
        tags: Option<RpcTags>,
    ) {
        self.metrics.inc_requests_received();
        let (handler, protocol_wrap) = match self.registry.find_handler(&method) {
            Ok(found) => found,
            Err(e) => {
                warn!(?seq, method = %method, error = %e, "no handler");
                if let Some(seq) = seq {
                    self.reply_error(seq, compression, e, None).await;
                }
                return;
            }
        };
        let wrap = protocol_wrap.unwrap_or_else(|| self.default_wrap());
        let received = if seq.is_some() {
            MethodType::Call
        } else {
            MethodType::Notify
        };
        if handler.method_type() != received {
            let e = RpcError::WrongMethodType {
                method: method.clone(),
                registered: handler.method_type(),
                received,
            };
            warn!(?seq, method = %method, error = %e, "method type mismatch");
            if let Some(seq) = seq {
                self.reply_error(seq, compression, e, Some(wrap)).await;
            }
            return;
        }
        let mut target = handler.make_arg();
        if let Err(e) = target.decode(arg) {
            warn!(?seq, method = %method, error = %e, "failed to decode argument");
            if let Some(seq) = seq {
                self.reply_error(seq, compression, e, Some(wrap)).await;
            }
            return;
        }

        let token = self.root.child_token();
        let mut ctx = Context::from_token(token.clone());
        if let Some(tags) = tags {
            ctx = ctx.with_tags(tags);
        }
        let key = match seq {
            Some(seq) => TaskKey::Call(seq),
            None => TaskKey::Notify(self.notify_ids.fetch_add(1, Ordering::Relaxed)),
        };
        if self.channels.begin.send(TaskBegin { key, token }).is_err() {
            debug!(method = %method, "receiver stopped, dropping request");
            return;
        }

        let fut = handler.invoke(ctx, target);
        let end = self.channels.end.clone();
        let replier = self.replier();
        let stopping = self.stop.clone();
        self.tracker.spawn(async move {
            let res = fut.await;
            if let Some(seq) = seq {
                // Handlers canceled by shutdown get no reply; the peer sees
                // the stream end instead.
                let dropped = matches!(&res, Err(e) if e.is_canceled()) && stopping.is_cancelled();
                if dropped {
                    debug!(seq, method = %method, "handler canceled by shutdown, not replying");
                } else {
                    replier.reply(seq, compression, res, &wrap).await;
                }
            } else if let Err(e) = res {
                debug!(method = %method, error = %e, "notify handler failed");
            }
            let _ = end.send(key);
        });
    }

    /// Replies to a call that never reached its handler.
    pub(crate) async fn reply_error(
        &self,
        seq: SeqNumber,
        compression: CompressionType,
        err: RpcError,
        wrap: Option<WrapErrorFunc>,
    ) {
        let wrap = wrap.unwrap_or_else(|| self.default_wrap());
        self.replier().reply(seq, compression, Err(err), &wrap).await;
    }

    fn replier(&self) -> Replier {
        Replier {
            queue: self.queue.clone(),
            compressors: self.compressors.clone(),
            metrics: self.metrics.clone(),
        }
    }

    /// Cancels every in-flight handler and stops the task loop.
    pub(crate) fn cancel_all(&self) {
        self.stop.cancel();
        self.root.cancel();
    }

    /// Cancels all handlers, then waits up to `drain` for them to return.
    pub(crate) async fn close(&self, drain: Duration) {
        self.cancel_all();
        self.tracker.close();
        if tokio::time::timeout(drain, self.tracker.wait()).await.is_err() {
            warn!(
                pending = self.tracker.len(),
                "handlers still running after drain timeout"
            );
        }
        let task_loop = self
            .task_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task_loop) = task_loop {
            let _ = task_loop.await;
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.tracker.len()
    }
}

struct Replier {
    queue: FrameQueue,
    compressors: Arc<CompressorCache>,
    metrics: Arc<TransportMetrics>,
}

impl Replier {
    async fn reply(
        &self,
        seq: SeqNumber,
        compression: CompressionType,
        res: Result<Value>,
        wrap: &WrapErrorFunc,
    ) {
        let (error, result) = match res {
            Ok(result) => (Value::Nil, result),
            Err(e) => (wrap(&e), Value::Nil),
        };
        let (error, result) = match compression {
            CompressionType::None => (error, result),
            ct => match self.compressors.compress_value(ct, &result) {
                Ok(bytes) => (error, Value::Binary(bytes)),
                Err(e) => (wrap(&e), Value::Nil),
            },
        };
        let frame = match encode_frame(&WireMessage::Response { seq, error, result }) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(seq, error = %e, "failed to encode reply");
                return;
            }
        };
        match self.queue.write(frame).await {
            Ok(()) => self.metrics.inc_replies_sent(),
            Err(e) => debug!(seq, error = %e, "failed to send reply"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FrameReader;
    use crate::protocol::{HandlerDescription, Protocol};
    use crate::writer::run_writer;
    use std::sync::atomic::AtomicBool;

    struct Harness {
        receiver: Receiver,
        peer: FrameReader<tokio::io::DuplexStream>,
    }

    fn harness(protocol: Protocol) -> Harness {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (queue, rx) = FrameQueue::new(8);
        let metrics = Arc::new(TransportMetrics::new());
        tokio::spawn(run_writer(
            local,
            rx,
            CancellationToken::new(),
            CancellationToken::new(),
            metrics.clone(),
        ));
        let registry = Arc::new(ProtocolRegistry::new());
        registry.register(protocol).unwrap();
        Harness {
            receiver: Receiver::new(registry, queue, Arc::new(CompressorCache::new()), metrics),
            peer: FrameReader::new(remote, 1 << 20),
        }
    }

    fn abc() -> Protocol {
        Protocol::new("abc")
            .with_method(
                "hello",
                HandlerDescription::call(|_ctx, _arg: Value| async { Ok(42u32) }),
            )
            .with_method(
                "block",
                HandlerDescription::call(|ctx: Context, _arg: Value| async move {
                    Err::<(), _>(ctx.done().await)
                }),
            )
    }

    fn call(seq: SeqNumber, method: &str) -> WireMessage {
        WireMessage::Call {
            seq,
            method: method.to_string(),
            arg: Value::Map(vec![]),
            tags: None,
        }
    }

    #[tokio::test]
    async fn test_call_gets_reply() {
        let mut h = harness(abc());
        h.receiver.receive(call(5, "abc.hello")).await;
        let (msg, _) = h.peer.read_message().await.unwrap();
        assert_eq!(
            msg,
            WireMessage::Response {
                seq: 5,
                error: Value::Nil,
                result: Value::from(42)
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_method_reply() {
        let mut h = harness(abc());
        h.receiver.receive(call(1, "abc.missing")).await;
        let (msg, _) = h.peer.read_message().await.unwrap();
        assert_eq!(
            msg,
            WireMessage::Response {
                seq: 1,
                error: Value::from("method 'missing' not found in protocol 'abc'"),
                result: Value::Nil
            }
        );
        assert_eq!(h.receiver.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_call_to_notify_method_is_rejected() {
        let ran = Arc::new(AtomicBool::new(false));
        let seen = ran.clone();
        let mut h = harness(Protocol::new("abc").with_method(
            "ping",
            HandlerDescription::notify(move |_ctx, _arg: Value| {
                let seen = seen.clone();
                async move {
                    seen.store(true, Ordering::SeqCst);
                    Ok(())
                }
            }),
        ));
        h.receiver.receive(call(4, "abc.ping")).await;
        let (msg, _) = h.peer.read_message().await.unwrap();
        assert_eq!(
            msg,
            WireMessage::Response {
                seq: 4,
                error: Value::from("method 'abc.ping' is registered as notify, received as call"),
                result: Value::Nil
            }
        );
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(h.receiver.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_notify_to_call_method_is_dropped() {
        let ran = Arc::new(AtomicBool::new(false));
        let seen = ran.clone();
        let mut h = harness(Protocol::new("abc").with_method(
            "hello",
            HandlerDescription::call(move |_ctx, _arg: Value| {
                let seen = seen.clone();
                async move {
                    seen.store(true, Ordering::SeqCst);
                    Ok(1u32)
                }
            }),
        ));
        h.receiver
            .receive(WireMessage::Notify {
                method: "abc.hello".to_string(),
                arg: Value::Nil,
                tags: None,
            })
            .await;
        assert_eq!(h.receiver.in_flight(), 0);
        h.receiver.receive(call(6, "abc.hello")).await;
        let (msg, _) = h.peer.read_message().await.unwrap();
        assert!(matches!(msg, WireMessage::Response { seq: 6, .. }));
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(h.receiver.metrics.snapshot().requests_received, 2);
    }

    #[tokio::test]
    async fn test_cancel_reaches_handler() {
        let mut h = harness(abc());
        h.receiver.receive(call(9, "abc.block")).await;
        h.receiver
            .receive(WireMessage::Cancel {
                seq: 9,
                method: "abc.block".to_string(),
            })
            .await;
        let (msg, _) = h.peer.read_message().await.unwrap();
        assert_eq!(
            msg,
            WireMessage::Response {
                seq: 9,
                error: Value::from("context canceled"),
                result: Value::Nil
            }
        );
    }

    #[tokio::test]
    async fn test_cancel_unknown_is_noop() {
        let mut h = harness(abc());
        for seq in [100, 100, 7] {
            h.receiver
                .receive(WireMessage::Cancel {
                    seq,
                    method: "abc.hello".to_string(),
                })
                .await;
        }
        h.receiver.receive(call(2, "abc.hello")).await;
        let (msg, _) = h.peer.read_message().await.unwrap();
        assert!(matches!(msg, WireMessage::Response { seq: 2, .. }));
    }

    #[tokio::test]
    async fn test_close_cancels_blocked_handlers() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let protocol = Protocol::new("abc").with_method(
            "wait",
            HandlerDescription::notify(move |ctx: Context, _arg: Value| {
                let flag = flag.clone();
                async move {
                    let err = ctx.done().await;
                    assert!(err.is_canceled());
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
        let h = harness(protocol);
        h.receiver
            .receive(WireMessage::Notify {
                method: "abc.wait".to_string(),
                arg: Value::Nil,
                tags: None,
            })
            .await;
        assert_eq!(h.receiver.in_flight(), 1);
        h.receiver.close(Duration::from_secs(5)).await;
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(h.receiver.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_handler_sees_message_tags() {
        let protocol = Protocol::new("abc").with_method(
            "tags",
            HandlerDescription::call(|ctx: Context, _arg: Value| async move {
                Ok(ctx
                    .tags()
                    .and_then(|t| t.get("trace").cloned())
                    .unwrap_or(Value::Nil))
            }),
        );
        let mut h = harness(protocol);
        let mut tags = RpcTags::new();
        tags.insert("trace".to_string(), Value::from("t-9"));
        h.receiver
            .receive(WireMessage::Call {
                seq: 3,
                method: "abc.tags".to_string(),
                arg: Value::Nil,
                tags: Some(tags),
            })
            .await;
        let (msg, _) = h.peer.read_message().await.unwrap();
        assert!(matches!(
            msg,
            WireMessage::Response { result, .. } if result == Value::from("t-9")
        ));
    }

    #[tokio::test]
    async fn test_compressed_call_gets_compressed_reply() {
        let mut h = harness(abc());
        let cache = CompressorCache::new();
        let arg = cache
            .compress_value(CompressionType::Gzip, &Value::Map(vec![]))
            .unwrap();
        h.receiver
            .receive(WireMessage::CallCompressed {
                seq: 4,
                compression: CompressionType::Gzip,
                method: "abc.hello".to_string(),
                arg,
                tags: None,
            })
            .await;
        let (msg, _) = h.peer.read_message().await.unwrap();
        let WireMessage::Response { seq, error, result } = msg else {
            panic!("expected response");
        };
        assert_eq!(seq, 4);
        assert_eq!(error, Value::Nil);
        let Value::Binary(bytes) = result else {
            panic!("expected binary result");
        };
        assert_eq!(
            cache.decompress_value(CompressionType::Gzip, &bytes).unwrap(),
            Value::from(42)
        );
    }

    #[tokio::test]
    async fn test_server_wrap_error_applies() {
        let mut h = harness(abc());
        h.receiver
            .set_wrap_error(Arc::new(|e: &RpcError| Value::from(format!("wrapped: {}", e))));
        h.receiver.receive(call(8, "nope.x")).await;
        let (msg, _) = h.peer.read_message().await.unwrap();
        assert!(matches!(
            msg,
            WireMessage::Response { error, .. }
                if error == Value::from("wrapped: protocol not found: nope")
        ));
    }
}
